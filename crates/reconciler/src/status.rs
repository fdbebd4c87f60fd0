//! Writing reconcile outcomes back onto specifications.

use std::sync::Arc;

use tracing::{error, info};
use vsmerger_core::ObjectKey;
use vsmerger_events::{reasons, EventRecorder, Severity};

use crate::error::{Error, Result};
use crate::repository::{SpecRepository, StatusSink};

/// Outcome of one reconcile attempt.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Succeeded,
    Failed(&'a Error),
}

/// Emits the outcome event and makes one status write attempt.
///
/// The error marker is the specification's resource version on failure and
/// empty on success. A specification that disappeared before the write is
/// left alone.
#[derive(Clone)]
pub struct StatusReporter {
    specs: Arc<dyn SpecRepository>,
    sink: Arc<dyn StatusSink>,
    recorder: Arc<dyn EventRecorder>,
}

impl StatusReporter {
    pub fn new(
        specs: Arc<dyn SpecRepository>,
        sink: Arc<dyn StatusSink>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            specs,
            sink,
            recorder,
        }
    }

    /// Report `outcome` for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StatusWrite`] when re-fetching the specification or
    /// writing its status fails for any reason other than it being gone.
    pub async fn report(&self, key: &ObjectKey, outcome: Outcome<'_>) -> Result<()> {
        match outcome {
            Outcome::Succeeded => {
                self.recorder.record(
                    key,
                    Severity::Normal,
                    reasons::RECONCILIATION_SUCCEEDED,
                    "",
                );
            }
            Outcome::Failed(err) => {
                self.recorder.record(
                    key,
                    Severity::Warning,
                    reasons::RECONCILIATION_FAILED,
                    &format!("VirtualServiceMerge reconcile error: {err}"),
                );
            }
        }

        // Re-fetch so the marker names the version that is live right now.
        let spec = match self.specs.get(key).await {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                info!(key = %key, "Specification not found. No status to update");
                return Ok(());
            }
            Err(e) => return Err(Error::status_write(key.clone(), e.to_string())),
        };

        let marker = match outcome {
            Outcome::Succeeded => "",
            Outcome::Failed(_) => spec.resource_version(),
        };

        match self.sink.write_status(key, marker).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(key = %key, "Specification not found. No status to update");
                Ok(())
            }
            Err(e) => {
                error!(key = %key, error = %e, "Status update failed");
                self.recorder.record(
                    key,
                    Severity::Warning,
                    reasons::STATUS_UPDATE_FAILED,
                    &format!("VirtualServiceMerge object ({key}) status update error"),
                );
                Err(Error::status_write(key.clone(), e.to_string()))
            }
        }
    }
}
