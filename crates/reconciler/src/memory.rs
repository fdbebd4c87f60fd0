//! In-memory object stores.
//!
//! Both stores bump a shared version clock on every content change and, when
//! wired to [`EventSenders`], emit the watch events a real API server would.
//! Failure injection hooks make transient errors reproducible in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use vsmerger_core::{MergeStatus, ObjectKey, Payload, Specification, TargetResource};
use vsmerger_events::{event_channels, EventSources, InMemoryEventRecorder, SpecEvent, TargetEvent};

use crate::error::{Error, ResourceKind, Result};
use crate::repository::{SpecRepository, StatusSink, TargetRepository};

/// Monotonic resource-version source shared by the stores of one cluster.
#[derive(Debug, Default)]
pub struct VersionClock {
    current: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version token.
    pub fn next(&self) -> String {
        let previous = self.current.fetch_add(1, Ordering::AcqRel);
        previous.saturating_add(1).to_string()
    }
}

/// Consume one injected failure, if any are armed.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory specification store.
pub struct InMemorySpecRepository {
    objects: RwLock<BTreeMap<ObjectKey, Specification>>,
    clock: Arc<VersionClock>,
    events: Option<mpsc::UnboundedSender<SpecEvent>>,
    failing_lists: AtomicUsize,
    failing_gets: AtomicUsize,
    failing_status_writes: AtomicUsize,
    status_writes: AtomicUsize,
}

impl InMemorySpecRepository {
    pub fn new(clock: Arc<VersionClock>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            clock,
            events: None,
            failing_lists: AtomicUsize::new(0),
            failing_gets: AtomicUsize::new(0),
            failing_status_writes: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
        }
    }

    /// Emit watch events for every change to `sender`.
    #[must_use]
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<SpecEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    fn emit(&self, event: SpecEvent) {
        if let Some(sender) = &self.events {
            if sender.send(event).is_err() {
                tracing::debug!("Specification watch closed, dropping event");
            }
        }
    }

    /// Create or update a specification.
    ///
    /// Status is owned by the store and survives updates. Applying unchanged
    /// content is a no-op.
    pub async fn apply(&self, spec: Specification) -> Specification {
        let key = spec.key();
        let mut objects = self.objects.write().await;
        let existing = objects.get(&key).cloned();

        let mut next = spec;
        if let Some(existing) = &existing {
            if existing.same_contribution(&next) {
                return existing.clone();
            }
            next.status = existing.status.clone();
            next.metadata.generation = existing.metadata.generation.saturating_add(1);
        } else {
            next.metadata.generation = 1;
        }
        next.metadata.resource_version = self.clock.next();
        objects.insert(key, next.clone());
        drop(objects);

        match existing {
            Some(old) => self.emit(SpecEvent::updated(old, next.clone())),
            None => self.emit(SpecEvent::Created(next.clone())),
        }
        next
    }

    /// Remove a specification.
    pub async fn delete(&self, key: &ObjectKey) -> Option<Specification> {
        let removed = self.objects.write().await.remove(key);
        if let Some(spec) = &removed {
            self.emit(SpecEvent::Deleted(spec.clone()));
        }
        removed
    }

    /// Set the deletion marker on a specification.
    pub async fn mark_terminating(&self, key: &ObjectKey) -> Option<Specification> {
        let mut objects = self.objects.write().await;
        let old = objects.get(key).cloned()?;
        let mut next = old.clone().with_deletion_timestamp(Utc::now());
        next.metadata.resource_version = self.clock.next();
        objects.insert(key.clone(), next.clone());
        drop(objects);

        self.emit(SpecEvent::updated(old, next.clone()));
        Some(next)
    }

    /// Re-deliver every stored specification as a resync event.
    pub async fn resync(&self) -> usize {
        let objects = self.objects.read().await.values().cloned().collect::<Vec<_>>();
        let count = objects.len();
        for spec in objects {
            self.emit(SpecEvent::Resynced(spec));
        }
        count
    }

    pub async fn snapshot(&self, key: &ObjectKey) -> Option<Specification> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn status(&self, key: &ObjectKey) -> Option<MergeStatus> {
        self.snapshot(key).await.map(|s| s.status)
    }

    /// Number of status writes that changed a marker.
    pub fn status_write_count(&self) -> usize {
        self.status_writes.load(Ordering::Acquire)
    }

    /// Fail the next `n` list calls.
    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::Release);
    }

    /// Fail the next `n` get calls.
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::Release);
    }

    /// Fail the next `n` status writes.
    pub fn fail_next_status_writes(&self, n: usize) {
        self.failing_status_writes.store(n, Ordering::Release);
    }
}

#[async_trait]
impl SpecRepository for InMemorySpecRepository {
    async fn list(&self, namespace: &str) -> Result<Vec<Specification>> {
        if take_failure(&self.failing_lists) {
            return Err(Error::api("list", namespace, "injected list failure"));
        }
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|s| namespace.is_empty() || s.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Specification>> {
        if take_failure(&self.failing_gets) {
            return Err(Error::api("get", key.to_string(), "injected get failure"));
        }
        Ok(self.objects.read().await.get(key).cloned())
    }
}

#[async_trait]
impl StatusSink for InMemorySpecRepository {
    /// Status writes do not advance the resource version, so a marker keeps
    /// naming the generation that failed.
    async fn write_status(&self, key: &ObjectKey, error_marker: &str) -> Result<()> {
        if take_failure(&self.failing_status_writes) {
            return Err(Error::api(
                "write_status",
                key.to_string(),
                "injected status failure",
            ));
        }

        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(key) else {
            return Err(Error::not_found(ResourceKind::Specification, key.clone()));
        };
        if stored.status.error == error_marker {
            return Ok(());
        }
        let old = stored.clone();
        stored.status.error = error_marker.to_string();
        let new = stored.clone();
        drop(objects);

        self.status_writes.fetch_add(1, Ordering::AcqRel);
        self.emit(SpecEvent::updated(old, new));
        Ok(())
    }
}

/// In-memory target store.
pub struct InMemoryTargetRepository {
    objects: RwLock<BTreeMap<ObjectKey, TargetResource>>,
    clock: Arc<VersionClock>,
    events: Option<mpsc::UnboundedSender<TargetEvent>>,
    failing_gets: AtomicUsize,
    failing_updates: AtomicUsize,
    updates: AtomicUsize,
}

impl InMemoryTargetRepository {
    pub fn new(clock: Arc<VersionClock>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            clock,
            events: None,
            failing_gets: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    /// Emit watch events for every change to `sender`.
    #[must_use]
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<TargetEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    fn emit(&self, event: TargetEvent) {
        if let Some(sender) = &self.events {
            if sender.send(event).is_err() {
                tracing::debug!("Target watch closed, dropping event");
            }
        }
    }

    /// Create or replace a target out of band.
    pub async fn apply(&self, target: TargetResource) -> TargetResource {
        let mut next = target;
        next.metadata.resource_version = self.clock.next();
        self.objects
            .write()
            .await
            .insert(next.key(), next.clone());
        self.emit(TargetEvent::Applied(next.clone()));
        next
    }

    /// Remove a target.
    pub async fn delete(&self, key: &ObjectKey) -> Option<TargetResource> {
        let removed = self.objects.write().await.remove(key);
        if let Some(target) = &removed {
            self.emit(TargetEvent::Deleted(target.clone()));
        }
        removed
    }

    /// Set the deletion marker on a target.
    pub async fn mark_terminating(&self, key: &ObjectKey) -> Option<TargetResource> {
        let mut objects = self.objects.write().await;
        let stored = objects.get_mut(key)?;
        stored.metadata.deletion_timestamp = Some(Utc::now());
        stored.metadata.resource_version = self.clock.next();
        let next = stored.clone();
        drop(objects);

        self.emit(TargetEvent::Applied(next.clone()));
        Some(next)
    }

    pub async fn snapshot(&self, key: &ObjectKey) -> Option<TargetResource> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn state(&self, key: &ObjectKey) -> Option<Payload> {
        self.snapshot(key).await.map(|t| t.spec)
    }

    pub async fn all(&self) -> Vec<TargetResource> {
        self.objects.read().await.values().cloned().collect()
    }

    /// Number of successful [`TargetRepository::update`] calls.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::Acquire)
    }

    /// Fail the next `n` get calls.
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::Release);
    }

    /// Fail the next `n` update calls.
    pub fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::Release);
    }
}

#[async_trait]
impl TargetRepository for InMemoryTargetRepository {
    async fn get(&self, key: &ObjectKey) -> Result<Option<TargetResource>> {
        if take_failure(&self.failing_gets) {
            return Err(Error::api("get", key.to_string(), "injected get failure"));
        }
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn update(&self, target: &TargetResource) -> Result<TargetResource> {
        let key = target.key();
        if take_failure(&self.failing_updates) {
            return Err(Error::api("update", key.to_string(), "injected update failure"));
        }

        let mut objects = self.objects.write().await;
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Error::not_found(ResourceKind::Target, key));
        };
        if stored.resource_version() != target.resource_version() {
            return Err(Error::conflict(
                key,
                target.resource_version(),
                stored.resource_version(),
            ));
        }
        stored.spec = target.spec.clone();
        stored.metadata.resource_version = self.clock.next();
        let next = stored.clone();
        drop(objects);

        self.updates.fetch_add(1, Ordering::AcqRel);
        self.emit(TargetEvent::Applied(next.clone()));
        Ok(next)
    }
}

/// Both stores plus a recorder, sharing one version clock.
pub struct InMemoryCluster {
    pub specs: Arc<InMemorySpecRepository>,
    pub targets: Arc<InMemoryTargetRepository>,
    pub recorder: Arc<InMemoryEventRecorder>,
}

impl InMemoryCluster {
    /// A cluster whose stores emit no watch events.
    pub fn new() -> Self {
        let clock = Arc::new(VersionClock::new());
        Self {
            specs: Arc::new(InMemorySpecRepository::new(clock.clone())),
            targets: Arc::new(InMemoryTargetRepository::new(clock)),
            recorder: Arc::new(InMemoryEventRecorder::new()),
        }
    }

    /// A cluster whose stores feed the returned watch sources.
    pub fn with_watch() -> (Self, EventSources) {
        let clock = Arc::new(VersionClock::new());
        let (senders, sources) = event_channels();
        let cluster = Self {
            specs: Arc::new(InMemorySpecRepository::new(clock.clone()).with_events(senders.specs)),
            targets: Arc::new(InMemoryTargetRepository::new(clock).with_events(senders.targets)),
            recorder: Arc::new(InMemoryEventRecorder::new()),
        };
        (cluster, sources)
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}
