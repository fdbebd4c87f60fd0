//! Watch event types for both origins.

use tokio::sync::mpsc;
use vsmerger_core::{ObjectKey, Specification, TargetResource};

/// Change notification for a specification.
#[derive(Debug, Clone)]
pub enum SpecEvent {
    /// A specification appeared.
    Created(Specification),
    /// A specification changed; carries the snapshot before and after.
    Updated {
        old: Box<Specification>,
        new: Box<Specification>,
    },
    /// A specification was removed; carries its final known state.
    Deleted(Specification),
    /// Periodic re-delivery of an unchanged specification.
    Resynced(Specification),
}

impl SpecEvent {
    /// Create an update event.
    pub fn updated(old: Specification, new: Specification) -> Self {
        Self::Updated {
            old: Box::new(old),
            new: Box::new(new),
        }
    }

    /// The specification this event is about, in its newest known form.
    pub fn object(&self) -> &Specification {
        match self {
            Self::Created(spec) | Self::Deleted(spec) | Self::Resynced(spec) => spec,
            Self::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.object().key()
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
            Self::Resynced(_) => "resynced",
        }
    }
}

/// Change notification for a target resource.
#[derive(Debug, Clone)]
pub enum TargetEvent {
    /// A target was created or modified.
    Applied(TargetResource),
    /// A target was removed.
    Deleted(TargetResource),
}

impl TargetEvent {
    pub fn target(&self) -> &TargetResource {
        match self {
            Self::Applied(target) | Self::Deleted(target) => target,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.target().key()
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Receiving half of both watch origins, handed to the controller.
#[derive(Debug)]
pub struct EventSources {
    pub specs: mpsc::UnboundedReceiver<SpecEvent>,
    pub targets: mpsc::UnboundedReceiver<TargetEvent>,
}

/// Sending half of both watch origins, held by whatever observes the store.
#[derive(Debug, Clone)]
pub struct EventSenders {
    pub specs: mpsc::UnboundedSender<SpecEvent>,
    pub targets: mpsc::UnboundedSender<TargetEvent>,
}

/// Create a connected pair of senders and sources.
pub fn event_channels() -> (EventSenders, EventSources) {
    let (spec_tx, spec_rx) = mpsc::unbounded_channel();
    let (target_tx, target_rx) = mpsc::unbounded_channel();
    (
        EventSenders {
            specs: spec_tx,
            targets: target_tx,
        },
        EventSources {
            specs: spec_rx,
            targets: target_rx,
        },
    )
}
