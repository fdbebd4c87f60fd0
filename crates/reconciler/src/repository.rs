//! Contracts for the external object stores the engine reads and writes.

use async_trait::async_trait;
use vsmerger_core::{ObjectKey, Specification, TargetResource};

use crate::error::Result;

/// Read access to specifications.
#[async_trait]
pub trait SpecRepository: Send + Sync {
    /// List specifications in `namespace`; the empty string lists all.
    async fn list(&self, namespace: &str) -> Result<Vec<Specification>>;

    /// Fetch one specification; `None` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Specification>>;
}

/// Read/write access to targets.
#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// Fetch one target; `None` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<TargetResource>>;

    /// Replace the target's state.
    ///
    /// The resource version on `target` must be the one that was read;
    /// a stale version fails with [`Error::Conflict`](crate::Error::Conflict)
    /// and a missing target with [`Error::NotFound`](crate::Error::NotFound).
    async fn update(&self, target: &TargetResource) -> Result<TargetResource>;
}

/// Write access to the status marker of specifications.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Set the error marker; fails with
    /// [`Error::NotFound`](crate::Error::NotFound) when the object is gone.
    async fn write_status(&self, key: &ObjectKey, error_marker: &str) -> Result<()>;
}
