//! Watch events and observability for vsmerger.
//!
//! - **Watch events**: [`SpecEvent`] for specifications and [`TargetEvent`]
//!   for targets, delivered at-least-once over [`EventSources`]
//! - **Recorder**: [`EventRecorder`] sink for per-object outcome events, with
//!   in-memory and tracing implementations
//!
//! # Example
//!
//! ```ignore
//! use vsmerger_events::{event_channels, SpecEvent};
//!
//! let (senders, sources) = event_channels();
//! senders.specs.send(SpecEvent::Created(spec))?;
//! controller.configure(sources)?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod event;
pub mod recorder;

pub use event::{event_channels, EventSenders, EventSources, SpecEvent, TargetEvent};
pub use recorder::{
    reasons, EventId, EventRecorder, InMemoryEventRecorder, RecordedEvent, Severity,
    TracingEventRecorder,
};
