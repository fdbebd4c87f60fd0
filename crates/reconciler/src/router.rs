//! Mapping target changes back to the specifications that contribute to them.

use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, error};
use vsmerger_core::{ObjectKey, Specification};
use vsmerger_events::TargetEvent;

use crate::error::{Error, Result};
use crate::repository::SpecRepository;

/// Routes target events to specification keys.
///
/// Lists the specifications of the target's namespace on every event. A
/// persistent reverse index would give the same output at lower cost.
#[derive(Clone)]
pub struct WatchRouter {
    specs: Arc<dyn SpecRepository>,
}

impl WatchRouter {
    pub fn new(specs: Arc<dyn SpecRepository>) -> Self {
        Self { specs }
    }

    /// Keys of the specifications whose resolved target is the event's target.
    ///
    /// A target that is itself terminating routes to nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Routing`] when listing specifications fails. The
    /// failure is logged here; the caller decides how to retry.
    pub async fn route(&self, event: &TargetEvent) -> Result<Vec<ObjectKey>> {
        let target = event.key();
        if matches!(event, TargetEvent::Applied(t) if t.is_terminating()) {
            debug!(target = %target, "Target is terminating, skipping routing");
            return Ok(Vec::new());
        }

        let specs = self
            .specs
            .list(&target.namespace)
            .await
            .map_err(|e| {
                error!(target = %target, error = %e, "Failed to list specifications for target event");
                Error::routing(target.clone(), e.to_string())
            })?;

        let keys = matching_keys(&target, &specs);
        debug!(
            target = %target,
            event = event.event_type(),
            matched = keys.len(),
            "Routed target event"
        );
        Ok(keys)
    }
}

/// Pure routing rule: keys of non-terminating specifications resolving to
/// `target`, sorted and deduplicated.
pub fn matching_keys(target: &ObjectKey, specs: &[Specification]) -> Vec<ObjectKey> {
    specs
        .iter()
        .filter(|s| !s.is_terminating())
        .filter(|s| &s.target_key() == target)
        .map(Specification::key)
        .sorted()
        .dedup()
        .collect()
}
