//! K8s-style convergence engine merging route fragments into shared targets.
//!
//! Many [`Specification`](vsmerger_core::Specification)s each contribute a
//! fragment to one shared target. This crate keeps every target converged with
//! the union of the fragments currently declared against it.
//!
//! # Key Concepts
//!
//! ## Reconciliation
//!
//! For one specification key the [`MergeReconciler`]:
//! 1. Re-fetches the specification (absent means deleted: retract its fragments)
//! 2. Reads the pre-update and deletion snapshots from the [`ChangeCache`]
//! 3. Computes the target's next state with a [`PatchComputer`]
//! 4. Writes the target only when it changed
//! 5. Reports the outcome through the [`StatusReporter`]
//!
//! ## Routing
//!
//! Target changes fan out to every specification that resolves to the target
//! through the [`WatchRouter`].
//!
//! ## Scheduling
//!
//! The [`MergeController`] feeds a key-deduplicating [`WorkQueue`] from both
//! watch origins and drains it with a bounded worker pool.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vsmerger_reconciler::{InMemoryCluster, MergeController};
//!
//! #[tokio::main]
//! async fn main() -> vsmerger_reconciler::Result<()> {
//!     let (cluster, sources) = InMemoryCluster::with_watch();
//!     let controller = Arc::new(
//!         MergeController::builder()
//!             .with_cluster(&cluster)
//!             .namespace("ns1")
//!             .build()?,
//!     );
//!     controller.configure(sources)?;
//!
//!     // Run until stopped
//!     // controller.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod cache;
pub mod controller;
pub mod error;
pub mod filter;
pub mod memory;
pub mod patch;
pub mod queue;
pub mod reconciler;
pub mod repository;
pub mod router;
pub mod status;

// Re-export main types
pub use cache::ChangeCache;
pub use controller::{ControllerConfig, ControllerStopper, MergeController, MergeControllerBuilder};
pub use error::{Error, ErrorClass, ResourceKind, Result};
pub use filter::EventFilter;
pub use memory::{InMemoryCluster, InMemorySpecRepository, InMemoryTargetRepository, VersionClock};
pub use patch::{PatchComputer, PatchError, RouteListMerge};
pub use queue::{BackoffPolicy, WorkQueue};
pub use reconciler::{MergeReconciler, ReconcileOutcome};
pub use repository::{SpecRepository, StatusSink, TargetRepository};
pub use router::{matching_keys, WatchRouter};
pub use status::{Outcome, StatusReporter};
