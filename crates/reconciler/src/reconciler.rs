//! Per-key convergence of one specification against its target.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use vsmerger_core::{ObjectKey, Payload, Specification};

use crate::cache::ChangeCache;
use crate::error::{Error, ResourceKind, Result};
use crate::patch::PatchComputer;
use crate::repository::{SpecRepository, TargetRepository};
use crate::status::{Outcome, StatusReporter};

/// Result of a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Ask the scheduler to reconcile the key again after this delay.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Converged; nothing more to do until the next event.
    pub fn done() -> Self {
        Self::default()
    }
}

/// Convergence engine for merge specifications.
///
/// Safe to call concurrently for different keys; callers must never run two
/// reconciles for the same key at once.
pub struct MergeReconciler {
    specs: Arc<dyn SpecRepository>,
    targets: Arc<dyn TargetRepository>,
    patcher: Arc<dyn PatchComputer>,
    cache: ChangeCache,
    reporter: StatusReporter,
}

impl MergeReconciler {
    pub fn new(
        specs: Arc<dyn SpecRepository>,
        targets: Arc<dyn TargetRepository>,
        patcher: Arc<dyn PatchComputer>,
        cache: ChangeCache,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            specs,
            targets,
            patcher,
            cache,
            reporter,
        }
    }

    pub fn cache(&self) -> &ChangeCache {
        &self.cache
    }

    /// Converge the specification at `key`.
    ///
    /// # Errors
    ///
    /// Computation and transient target failures are written to the status
    /// marker and returned so the scheduler retries. A failed status write is
    /// returned in place of the original outcome.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(spec) = self.specs.get(key).await? else {
            return self.reconcile_deleted(key).await;
        };

        let previous = self.cache.get(key);
        let tombstone = self.cache.deleted(key);
        debug!(
            key = %key,
            version = spec.resource_version(),
            has_previous = previous.is_some(),
            recreated = tombstone.is_some(),
            "Starting reconciliation"
        );

        match self
            .converge(&spec, previous.as_ref(), tombstone.as_ref())
            .await
        {
            Ok(()) => {
                self.cache.complete(key, previous.as_ref());
                self.cache.complete_deletion(key, tombstone.as_ref());
                self.reporter.report(key, Outcome::Succeeded).await?;
                info!(key = %key, "Reconciliation succeeded");
                Ok(ReconcileOutcome::done())
            }
            Err(e) => {
                warn!(key = %key, error = %e, class = ?e.classify(), "Reconciliation failed");
                self.report_failure(key, &e).await?;
                Err(e)
            }
        }
    }

    /// Record a failed attempt on the specification's status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StatusWrite`] when the marker cannot be written.
    pub async fn report_failure(&self, key: &ObjectKey, error: &Error) -> Result<()> {
        self.reporter.report(key, Outcome::Failed(error)).await
    }

    /// The specification is gone: retract every fragment it may still have
    /// on a target.
    async fn reconcile_deleted(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let deleted = self.cache.deleted(key);
        let previous = self.cache.get(key).filter(|p| Some(p) != deleted.as_ref());
        if deleted.is_none() && previous.is_none() {
            debug!(key = %key, "Specification gone with nothing to retract");
            return Ok(ReconcileOutcome::done());
        }

        for snapshot in deleted.iter().chain(previous.iter()) {
            if let Err(e) = self.retract(key, snapshot).await {
                warn!(
                    key = %key,
                    target = %snapshot.target_key(),
                    error = %e,
                    "Retraction failed, keeping snapshot for retry"
                );
                return Err(e);
            }
        }

        self.cache.delete(key);
        info!(key = %key, "Retracted fragments of deleted specification");
        Ok(ReconcileOutcome::done())
    }

    /// Apply `spec`'s fragment, retracting `previous` first.
    ///
    /// `tombstone` is the final snapshot of an earlier incarnation of the same
    /// key; its fragment is retracted before anything else.
    async fn converge(
        &self,
        spec: &Specification,
        previous: Option<&Specification>,
        tombstone: Option<&Specification>,
    ) -> Result<()> {
        let key = spec.key();
        let target = spec.target_key();

        if let Some(tombstone) = tombstone.filter(|t| Some(*t) != previous) {
            self.retract(&key, tombstone).await?;
        }

        let previous_patch = match previous {
            Some(prev) if prev.target_key() != target => {
                info!(key = %key, from = %prev.target_key(), to = %target, "Target reference moved");
                self.retract(&key, prev).await?;
                None
            }
            Some(prev) => Some(prev.patch()),
            None => None,
        };

        match self
            .apply_patch(&key, &target, Some(spec.patch()), previous_patch)
            .await
        {
            Err(e) if e.is_not_found() => {
                info!(key = %key, target = %target, "Target not found. Nothing to sync");
                Ok(())
            }
            other => other,
        }
    }

    /// Remove `snapshot`'s fragment from the target it named; a missing
    /// target has nothing to remove.
    async fn retract(&self, key: &ObjectKey, snapshot: &Specification) -> Result<()> {
        let target = snapshot.target_key();
        match self
            .apply_patch(key, &target, None, Some(snapshot.patch()))
            .await
        {
            Err(e) if e.is_not_found() => {
                info!(key = %key, target = %target, "Target not found. Nothing to retract");
                Ok(())
            }
            other => other,
        }
    }

    /// Read the target, compute its next state and write it when it changed.
    async fn apply_patch(
        &self,
        key: &ObjectKey,
        target: &ObjectKey,
        desired: Option<&Payload>,
        previous: Option<&Payload>,
    ) -> Result<()> {
        let current = self
            .targets
            .get(target)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Target, target.clone()))?;

        let next = self
            .patcher
            .compute(desired, previous, &current.spec)
            .map_err(|e| Error::computation(key.clone(), e))?;

        if next == current.spec {
            debug!(key = %key, target = %target, "Target already converged");
            return Ok(());
        }

        let updated = self.targets.update(&current.with_state(next)).await?;
        info!(
            key = %key,
            target = %target,
            version = updated.resource_version(),
            "Target updated"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCluster;
    use crate::patch::{PatchError, RouteListMerge};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use vsmerger_core::{TargetRef, TargetResource};
    use vsmerger_events::reasons;

    struct Rejecting;

    impl PatchComputer for Rejecting {
        fn compute(
            &self,
            _desired: Option<&Payload>,
            _previous: Option<&Payload>,
            _current: &Payload,
        ) -> std::result::Result<Payload, PatchError> {
            Err(PatchError::NotAnObject { what: "desired fragment" })
        }
    }

    /// Records a deletion snapshot the next time it computes, the way a
    /// watch delivering a delete mid-reconcile would.
    struct DeletedWhileComputing {
        cache: ChangeCache,
        pending: Mutex<Option<Specification>>,
        inner: RouteListMerge,
    }

    impl DeletedWhileComputing {
        fn arm(&self, snapshot: Specification) {
            *self.pending.lock().unwrap() = Some(snapshot);
        }
    }

    impl PatchComputer for DeletedWhileComputing {
        fn compute(
            &self,
            desired: Option<&Payload>,
            previous: Option<&Payload>,
            current: &Payload,
        ) -> std::result::Result<Payload, PatchError> {
            if let Some(snapshot) = self.pending.lock().unwrap().take() {
                self.cache.record_deletion(snapshot.key(), snapshot);
            }
            self.inner.compute(desired, previous, current)
        }
    }

    fn reconciler_with(cluster: &InMemoryCluster, patcher: Arc<dyn PatchComputer>) -> MergeReconciler {
        reconciler_sharing(cluster, patcher, ChangeCache::new())
    }

    fn reconciler_sharing(
        cluster: &InMemoryCluster,
        patcher: Arc<dyn PatchComputer>,
        cache: ChangeCache,
    ) -> MergeReconciler {
        MergeReconciler::new(
            cluster.specs.clone(),
            cluster.targets.clone(),
            patcher,
            cache,
            StatusReporter::new(
                cluster.specs.clone(),
                cluster.specs.clone(),
                cluster.recorder.clone(),
            ),
        )
    }

    fn reconciler(cluster: &InMemoryCluster) -> MergeReconciler {
        reconciler_with(cluster, Arc::new(RouteListMerge::new()))
    }

    fn fragment(name: &str) -> Value {
        json!({"http": [{"name": name}]})
    }

    fn route_names(state: &Value) -> Vec<String> {
        state["http"]
            .as_array()
            .map(|routes| {
                routes
                    .iter()
                    .filter_map(|r| r["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn seed(cluster: &InMemoryCluster) -> Specification {
        cluster
            .targets
            .apply(TargetResource::new(
                "ns1",
                "shared",
                json!({"hosts": ["reviews"], "http": [{"name": "default"}]}),
            ))
            .await;
        cluster
            .specs
            .apply(Specification::new(
                "ns1",
                "a",
                TargetRef::local("shared"),
                fragment("products"),
            ))
            .await
    }

    fn shared() -> ObjectKey {
        ObjectKey::new("ns1", "shared")
    }

    #[tokio::test]
    async fn creation_applies_fragment_and_clears_marker() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);

        let outcome = reconciler.reconcile(&spec.key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::done());

        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["products", "default"]);
        assert_eq!(cluster.specs.status(&spec.key()).await.unwrap().error, "");
    }

    #[tokio::test]
    async fn rerun_with_unchanged_inputs_does_not_mutate() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);

        reconciler.reconcile(&spec.key()).await.unwrap();
        let updates = cluster.targets.update_count();
        let status_writes = cluster.specs.status_write_count();

        reconciler.reconcile(&spec.key()).await.unwrap();
        assert_eq!(cluster.targets.update_count(), updates);
        assert_eq!(cluster.specs.status_write_count(), status_writes);
    }

    #[tokio::test]
    async fn update_retracts_previous_fragment_and_consumes_snapshot() {
        let cluster = InMemoryCluster::new();
        let old = seed(&cluster).await;
        let reconciler = reconciler(&cluster);
        reconciler.reconcile(&old.key()).await.unwrap();

        let mut changed = old.clone();
        changed.spec.patch = fragment("ratings");
        cluster.specs.apply(changed).await;
        reconciler.cache().put(old.key(), old.clone());

        reconciler.reconcile(&old.key()).await.unwrap();

        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["ratings", "default"]);
        assert!(reconciler.cache().get(&old.key()).is_none());
    }

    #[tokio::test]
    async fn missing_target_is_success_without_marker() {
        let cluster = InMemoryCluster::new();
        let spec = cluster
            .specs
            .apply(Specification::new(
                "ns1",
                "a",
                TargetRef::local("missing"),
                fragment("products"),
            ))
            .await;
        let reconciler = reconciler(&cluster);
        reconciler.cache().put(spec.key(), spec.clone());

        let outcome = reconciler.reconcile(&spec.key()).await;
        assert!(outcome.is_ok());
        assert_eq!(cluster.specs.status(&spec.key()).await.unwrap().error, "");
        assert_eq!(cluster.recorder.count_reason(reasons::RECONCILIATION_FAILED), 0);
        assert!(reconciler.cache().is_empty());
    }

    #[tokio::test]
    async fn computation_error_marks_status_and_propagates() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler_with(&cluster, Arc::new(Rejecting));

        let err = reconciler.reconcile(&spec.key()).await.unwrap_err();
        assert!(matches!(err, Error::Computation { .. }));

        let status = cluster.specs.status(&spec.key()).await.unwrap();
        assert_eq!(status.error, spec.resource_version());
        assert_eq!(cluster.recorder.count_reason(reasons::RECONCILIATION_FAILED), 1);
    }

    #[tokio::test]
    async fn transient_write_failure_keeps_snapshot() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);
        let stale = Specification::new("ns1", "a", TargetRef::local("shared"), fragment("legacy"));
        reconciler.cache().put(spec.key(), stale.clone());
        cluster.targets.fail_next_updates(1);

        let err = reconciler.reconcile(&spec.key()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(reconciler.cache().get(&spec.key()), Some(stale));
    }

    #[tokio::test]
    async fn status_write_failure_replaces_outcome() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);
        cluster.specs.fail_next_status_writes(1);

        let err = reconciler.reconcile(&spec.key()).await.unwrap_err();
        assert!(matches!(err, Error::StatusWrite { .. }));
    }

    #[tokio::test]
    async fn deletion_retracts_cached_snapshot() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);
        reconciler.reconcile(&spec.key()).await.unwrap();

        cluster.specs.delete(&spec.key()).await;
        reconciler.cache().record_deletion(spec.key(), spec.clone());

        reconciler.reconcile(&spec.key()).await.unwrap();
        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["default"]);
        assert!(reconciler.cache().is_empty());
    }

    #[tokio::test]
    async fn deletion_with_missing_target_still_clears_snapshot() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);

        cluster.specs.delete(&spec.key()).await;
        cluster.targets.delete(&shared()).await;
        reconciler.cache().record_deletion(spec.key(), spec.clone());

        assert!(reconciler.reconcile(&spec.key()).await.is_ok());
        assert!(reconciler.cache().is_empty());
    }

    #[tokio::test]
    async fn moved_reference_retracts_from_old_target() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        cluster
            .targets
            .apply(TargetResource::new("ns1", "other", json!({"http": []})))
            .await;
        let reconciler = reconciler(&cluster);
        reconciler.reconcile(&spec.key()).await.unwrap();

        let mut moved = spec.clone();
        moved.spec.target = TargetRef::local("other");
        cluster.specs.apply(moved).await;
        reconciler.cache().put(spec.key(), spec.clone());

        reconciler.reconcile(&spec.key()).await.unwrap();

        let old_state = cluster.targets.state(&shared()).await.unwrap();
        let new_state = cluster
            .targets
            .state(&ObjectKey::new("ns1", "other"))
            .await
            .unwrap();
        assert_eq!(route_names(&old_state), vec!["default"]);
        assert_eq!(route_names(&new_state), vec!["products"]);
    }

    /// Given an update reconcile that has already read its snapshot
    /// When the specification is deleted before that reconcile finishes
    /// Then the deletion reconcile still retracts the fragment just applied
    #[tokio::test]
    async fn deletion_during_update_reconcile_retracts_new_fragment() {
        let cluster = InMemoryCluster::new();
        let original = seed(&cluster).await;
        let cache = ChangeCache::new();
        let hook = Arc::new(DeletedWhileComputing {
            cache: cache.clone(),
            pending: Mutex::new(None),
            inner: RouteListMerge::new(),
        });
        let reconciler = reconciler_sharing(&cluster, hook.clone(), cache.clone());
        reconciler.reconcile(&original.key()).await.unwrap();

        let mut changed = original.clone();
        changed.spec.patch = fragment("ratings");
        let changed = cluster.specs.apply(changed).await;
        cache.put(original.key(), original.clone());
        hook.arm(changed.clone());

        reconciler.reconcile(&original.key()).await.unwrap();
        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["ratings", "default"]);
        assert_eq!(cache.get(&original.key()), None);
        assert_eq!(cache.deleted(&original.key()), Some(changed));

        cluster.specs.delete(&original.key()).await;
        reconciler.reconcile(&original.key()).await.unwrap();

        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["default"]);
        assert!(cache.is_empty());
    }

    /// Given an unconsumed update snapshot and a deletion snapshot
    /// When the deletion is reconciled
    /// Then both fragments leave the target
    #[tokio::test]
    async fn deletion_retracts_pending_and_final_snapshots() {
        let cluster = InMemoryCluster::new();
        cluster
            .targets
            .apply(TargetResource::new(
                "ns1",
                "shared",
                json!({"http": [{"name": "legacy"}, {"name": "products"}, {"name": "default"}]}),
            ))
            .await;
        let reconciler = reconciler(&cluster);
        let key = ObjectKey::new("ns1", "a");
        let legacy = Specification::new("ns1", "a", TargetRef::local("shared"), fragment("legacy"));
        let last = Specification::new("ns1", "a", TargetRef::local("shared"), fragment("products"));
        reconciler.cache().put(key.clone(), legacy);
        reconciler.cache().record_deletion(key.clone(), last);

        reconciler.reconcile(&key).await.unwrap();

        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["default"]);
        assert!(reconciler.cache().is_empty());
    }

    /// Given a specification deleted and recreated with another fragment
    /// When the new incarnation is reconciled
    /// Then the old fragment is retracted and the new one applied
    #[tokio::test]
    async fn recreated_specification_retracts_earlier_incarnation() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);
        reconciler.reconcile(&spec.key()).await.unwrap();

        cluster.specs.delete(&spec.key()).await;
        reconciler.cache().record_deletion(spec.key(), spec.clone());
        cluster
            .specs
            .apply(Specification::new(
                "ns1",
                "a",
                TargetRef::local("shared"),
                fragment("reviews"),
            ))
            .await;

        reconciler.reconcile(&spec.key()).await.unwrap();

        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["reviews", "default"]);
        assert!(reconciler.cache().is_empty());
    }

    #[tokio::test]
    async fn failed_deletion_retraction_keeps_snapshots() {
        let cluster = InMemoryCluster::new();
        let spec = seed(&cluster).await;
        let reconciler = reconciler(&cluster);
        reconciler.reconcile(&spec.key()).await.unwrap();

        cluster.specs.delete(&spec.key()).await;
        reconciler.cache().record_deletion(spec.key(), spec.clone());
        cluster.targets.fail_next_updates(1);

        let err = reconciler.reconcile(&spec.key()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(reconciler.cache().deleted(&spec.key()), Some(spec.clone()));

        reconciler.reconcile(&spec.key()).await.unwrap();
        let state = cluster.targets.state(&shared()).await.unwrap();
        assert_eq!(route_names(&state), vec!["default"]);
    }
}
