//! Worker pool wiring event sources, the work queue and the reconciler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vsmerger_core::{ObjectKey, Specification};
use vsmerger_events::{
    EventRecorder, EventSources, InMemoryEventRecorder, SpecEvent, TargetEvent,
    TracingEventRecorder,
};

use crate::cache::ChangeCache;
use crate::error::{Error, Result};
use crate::filter::EventFilter;
use crate::memory::InMemoryCluster;
use crate::patch::{PatchComputer, RouteListMerge};
use crate::queue::{BackoffPolicy, WorkQueue};
use crate::reconciler::{MergeReconciler, ReconcileOutcome};
use crate::repository::{SpecRepository, StatusSink, TargetRepository};
use crate::router::WatchRouter;
use crate::status::StatusReporter;

/// Events kept by the recorder a builder falls back to.
const DEFAULT_RECORDED_EVENTS: usize = 256;

/// Runtime settings of a [`MergeController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace to watch; empty watches all namespaces.
    pub namespace: String,
    /// Concurrent reconcile workers.
    pub workers: usize,
    /// Deadline for one reconcile attempt.
    pub reconcile_timeout: Duration,
    /// Interval of the full relist; `None` disables it.
    pub resync_period: Option<Duration>,
    /// Requeue backoff for failed reconciles.
    pub backoff: BackoffPolicy,
    /// Backoff between routing attempts for one target event.
    pub route_backoff: BackoffPolicy,
    /// Routing attempts before a target event is dropped.
    pub route_attempts: u32,
    /// How long shutdown waits for in-flight reconciles.
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            workers: 2,
            reconcile_timeout: Duration::from_secs(30),
            resync_period: Some(Duration::from_secs(600)),
            backoff: BackoffPolicy::default(),
            route_backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5)),
            route_attempts: 5,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ControllerConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.reconcile_timeout.is_zero() {
            return Err(Error::invalid_config("reconcile_timeout must be non-zero"));
        }
        if self.resync_period.is_some_and(|p| p.is_zero()) {
            return Err(Error::invalid_config("resync_period must be non-zero when set"));
        }
        if self.backoff.base > self.backoff.max {
            return Err(Error::invalid_config("backoff base exceeds backoff max"));
        }
        if self.route_backoff.base > self.route_backoff.max {
            return Err(Error::invalid_config("route backoff base exceeds route backoff max"));
        }
        if self.route_attempts == 0 {
            return Err(Error::invalid_config("route_attempts must be at least 1"));
        }
        Ok(())
    }

    fn in_scope(&self, namespace: &str) -> bool {
        self.namespace.is_empty() || self.namespace == namespace
    }
}

/// Handle to stop a running controller.
#[derive(Clone)]
pub struct ControllerStopper {
    stop_tx: watch::Sender<bool>,
}

impl ControllerStopper {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Drives reconciles for every specification in scope.
pub struct MergeController {
    reconciler: MergeReconciler,
    router: WatchRouter,
    specs: Arc<dyn SpecRepository>,
    queue: WorkQueue,
    config: ControllerConfig,
    stop_tx: watch::Sender<bool>,
    ingestion: Mutex<Vec<JoinHandle<()>>>,
    configured: AtomicBool,
    synced: AtomicBool,
}

impl MergeController {
    pub fn builder() -> MergeControllerBuilder {
        MergeControllerBuilder::new()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ChangeCache {
        self.reconciler.cache()
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn stopper(&self) -> ControllerStopper {
        ControllerStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Register both watch origins and start ingesting them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when sources were already registered.
    pub fn configure(self: &Arc<Self>, sources: EventSources) -> Result<()> {
        if self.configured.swap(true, Ordering::AcqRel) {
            return Err(Error::invalid_config("event sources already configured"));
        }
        let EventSources {
            specs: mut spec_rx,
            targets: mut target_rx,
        } = sources;

        let this = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let spec_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = spec_rx.recv() => match event {
                        Some(event) => this.handle_spec_event(&event),
                        None => break,
                    },
                    () = stopped(&mut stop_rx) => break,
                }
            }
            debug!("Specification event ingestion stopped");
        });

        let this = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let target_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = target_rx.recv() => match event {
                        Some(event) => this.handle_target_event(event).await,
                        None => break,
                    },
                    () = stopped(&mut stop_rx) => break,
                }
            }
            debug!("Target event ingestion stopped");
        });

        self.ingestion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([spec_task, target_task]);
        info!(namespace = %self.config.namespace, "Event sources configured");
        Ok(())
    }

    /// Enqueue the event's key when the filter accepts it.
    pub fn handle_spec_event(&self, event: &SpecEvent) {
        if self.accepts(event) {
            debug!(key = %event.key(), event = event.event_type(), "Enqueueing specification");
            self.queue.add(event.key());
        }
    }

    /// Route a target event and enqueue every matched key.
    ///
    /// A failed routing call is retried in the background with backoff.
    pub async fn handle_target_event(self: &Arc<Self>, event: TargetEvent) {
        if !self.config.in_scope(&event.key().namespace) {
            return;
        }
        match self.router.route(&event).await {
            Ok(keys) => self.enqueue_all(keys),
            Err(e) if self.config.route_attempts > 1 => {
                warn!(target = %event.key(), error = %e, "Routing failed, retrying in background");
                let this = Arc::clone(self);
                tokio::spawn(async move { this.retry_routing(event).await });
            }
            Err(e) => {
                error!(target = %event.key(), error = %e, "Routing failed, dropping target event");
            }
        }
    }

    async fn retry_routing(&self, event: TargetEvent) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut attempt: u32 = 1;
        loop {
            let delay = self.config.route_backoff.delay(attempt);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = stopped(&mut stop_rx) => return,
            }
            attempt = attempt.saturating_add(1);

            match self.router.route(&event).await {
                Ok(keys) => {
                    info!(target = %event.key(), attempt, "Routing succeeded after retry");
                    self.enqueue_all(keys);
                    return;
                }
                Err(e) if attempt < self.config.route_attempts => {
                    warn!(target = %event.key(), attempt, error = %e, "Routing retry failed");
                }
                Err(e) => {
                    error!(
                        target = %event.key(),
                        attempts = attempt,
                        error = %e,
                        "Giving up routing target event"
                    );
                    return;
                }
            }
        }
    }

    fn enqueue_all(&self, keys: Vec<ObjectKey>) {
        for key in keys {
            self.queue.add(key);
        }
    }

    /// List every specification in scope and enqueue it.
    ///
    /// # Errors
    ///
    /// Propagates the listing failure; nothing is enqueued then.
    pub async fn resync_once(&self) -> Result<usize> {
        let specs = self.specs.list(&self.config.namespace).await?;
        let count = specs.len();
        for spec in specs {
            self.queue.add(spec.key());
        }
        debug!(count, "Resync enqueued specifications");
        Ok(count)
    }

    /// One reconcile attempt under the configured deadline.
    ///
    /// An attempt cut off by the deadline is reported on the specification's
    /// status like any other failure.
    ///
    /// # Errors
    ///
    /// Returns the reconcile error, or [`Error::DeadlineExceeded`]. A failed
    /// status write replaces either.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let timeout = self.config.reconcile_timeout;
        if let Ok(result) = tokio::time::timeout(timeout, self.reconciler.reconcile(key)).await {
            return result;
        }

        warn!(key = %key, timeout_ms = timeout.as_millis(), "Reconcile deadline exceeded");
        let err = Error::deadline_exceeded(key.clone(), timeout);
        match tokio::time::timeout(timeout, self.reconciler.report_failure(key, &err)).await {
            Ok(reported) => reported?,
            Err(_) => warn!(key = %key, "Status report for expired reconcile timed out"),
        }
        Err(err)
    }

    /// Run workers until stopped.
    ///
    /// # Errors
    ///
    /// Currently infallible once built; the signature leaves room for
    /// startup failures.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(
            namespace = %self.config.namespace,
            workers = self.config.workers,
            "Starting merge controller"
        );

        if let Err(e) = self.resync_once().await {
            error!(error = %e, "Initial resync failed");
        }
        self.synced.store(true, Ordering::Release);

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers)
            .map(|id| tokio::spawn(Arc::clone(self).worker(id)))
            .collect();
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();

        let resync = self
            .config
            .resync_period
            .map(|period| tokio::spawn(Arc::clone(self).resync_loop(period)));

        stopped(&mut self.stop_tx.subscribe()).await;
        info!("Stopping merge controller");

        self.queue.shut_down();
        if let Some(task) = resync {
            task.abort();
        }
        for task in self
            .ingestion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }

        if tokio::time::timeout(self.config.shutdown_grace, join_all(workers))
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.config.shutdown_grace.as_millis(),
                "Workers did not stop within grace period, aborting"
            );
            aborts.iter().for_each(tokio::task::AbortHandle::abort);
        }

        self.cache().clear();
        info!("Merge controller stopped");
        Ok(())
    }

    async fn worker(self: Arc<Self>, id: usize) {
        let mut stop_rx = self.stop_tx.subscribe();
        debug!(worker = id, "Worker started");

        while let Some(key) = self.queue.get().await {
            let result = tokio::select! {
                result = self.reconcile(&key) => result,
                () = stopped(&mut stop_rx) => Err(Error::Shutdown),
            };

            match result {
                Ok(outcome) => {
                    self.queue.forget(&key);
                    if let Some(delay) = outcome.requeue_after {
                        self.queue.add_after(key.clone(), delay);
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!(worker = id, key = %key, error = %e, "Scheduling retry");
                    self.queue.add_rate_limited(key.clone());
                }
                Err(e) => {
                    debug!(worker = id, key = %key, error = %e, "Not retrying");
                    self.queue.forget(&key);
                }
            }
            self.queue.done(&key);
        }

        debug!(worker = id, "Worker stopped");
    }

    async fn resync_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.resync_once().await {
                error!(error = %e, "Periodic resync failed");
            }
        }
    }

    /// Wait until the initial resync ran and the queue drained.
    ///
    /// Returns `false` when `timeout` elapses first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let poll = async {
            loop {
                if self.synced.load(Ordering::Acquire) && self.queue.is_idle() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }
}

impl EventFilter for MergeController {
    fn on_create(&self, spec: &Specification) -> bool {
        self.config.in_scope(&spec.metadata.namespace)
    }

    fn on_update(&self, old: &Specification, new: &Specification) -> bool {
        if !self.config.in_scope(&new.metadata.namespace) {
            return false;
        }
        if old.same_contribution(new) {
            debug!(key = %new.key(), "Ignoring update without contribution change");
            return false;
        }
        self.cache().put(new.key(), old.clone());
        true
    }

    fn on_delete(&self, spec: &Specification) -> bool {
        if !self.config.in_scope(&spec.metadata.namespace) {
            return false;
        }
        self.cache().record_deletion(spec.key(), spec.clone());
        true
    }

    fn on_generic(&self, spec: &Specification) -> bool {
        self.config.in_scope(&spec.metadata.namespace)
    }
}

/// Builder for [`MergeController`].
pub struct MergeControllerBuilder {
    specs: Option<Arc<dyn SpecRepository>>,
    targets: Option<Arc<dyn TargetRepository>>,
    status: Option<Arc<dyn StatusSink>>,
    recorder: Option<Arc<dyn EventRecorder>>,
    patcher: Option<Arc<dyn PatchComputer>>,
    config: ControllerConfig,
}

impl MergeControllerBuilder {
    pub fn new() -> Self {
        Self {
            specs: None,
            targets: None,
            status: None,
            recorder: None,
            patcher: None,
            config: ControllerConfig::default(),
        }
    }

    pub fn with_specs(mut self, specs: Arc<dyn SpecRepository>) -> Self {
        self.specs = Some(specs);
        self
    }

    pub fn with_targets(mut self, targets: Arc<dyn TargetRepository>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_patcher(mut self, patcher: Arc<dyn PatchComputer>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    /// Use all stores and the recorder of an in-memory cluster.
    pub fn with_cluster(self, cluster: &InMemoryCluster) -> Self {
        self.with_specs(cluster.specs.clone())
            .with_targets(cluster.targets.clone())
            .with_status_sink(cluster.specs.clone())
            .with_recorder(cluster.recorder.clone())
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a store is missing or the
    /// configuration does not validate.
    pub fn build(self) -> Result<MergeController> {
        self.config.validate()?;

        let specs = self
            .specs
            .ok_or_else(|| Error::invalid_config("specification repository is required"))?;
        let targets = self
            .targets
            .ok_or_else(|| Error::invalid_config("target repository is required"))?;
        let status = self
            .status
            .ok_or_else(|| Error::invalid_config("status sink is required"))?;
        let recorder = self.recorder.unwrap_or_else(|| {
            Arc::new(TracingEventRecorder::new(InMemoryEventRecorder::with_capacity(
                DEFAULT_RECORDED_EVENTS,
            )))
        });
        let patcher = self
            .patcher
            .unwrap_or_else(|| Arc::new(RouteListMerge::new()));

        let reporter = StatusReporter::new(specs.clone(), status, recorder);
        let reconciler =
            MergeReconciler::new(specs.clone(), targets, patcher, ChangeCache::new(), reporter);
        let (stop_tx, _) = watch::channel(false);

        Ok(MergeController {
            reconciler,
            router: WatchRouter::new(specs.clone()),
            specs,
            queue: WorkQueue::new(self.config.backoff),
            config: self.config,
            stop_tx,
            ingestion: Mutex::new(Vec::new()),
            configured: AtomicBool::new(false),
            synced: AtomicBool::new(false),
        })
    }
}

impl Default for MergeControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
