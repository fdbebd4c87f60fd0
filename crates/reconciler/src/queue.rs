//! Keyed work queue with per-key serialization and rate-limited requeue.
//!
//! A key is held at most once in the queue. While a worker holds a key,
//! re-adding it only marks it dirty; `done` puts it back so the key is never
//! processed by two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;
use vsmerger_core::ObjectKey;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub use_jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(300),
            use_jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            use_jitter: true,
        }
    }

    /// Deterministic delays, used in tests.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Delay before attempt `attempt` (1-based), capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let capped = self
            .base
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max);

        if self.use_jitter {
            let capped_ms = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
            let jitter_range = (capped_ms / 4).max(1);
            let jitter = rand::thread_rng().gen_range(0..jitter_range);
            capped
                .saturating_add(Duration::from_millis(jitter))
                .min(self.max)
        } else {
            capped
        }
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    delayed: usize,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    backoff: BackoffPolicy,
}

/// Cloneable handle to a shared work queue.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `key` unless it is already pending.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// Keys still queued at shutdown are dropped.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing; requeues it if it was re-added meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Enqueue `key` after `delay`.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.delayed = state.delayed.saturating_add(1);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
            let mut state = queue.lock();
            state.delayed = state.delayed.saturating_sub(1);
        });
    }

    /// Enqueue `key` after the backoff for its consecutive failure count.
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let attempt = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures = failures.saturating_add(1);
            *failures
        };
        let delay = self.shared.backoff.delay(attempt);
        debug!(key = %key, attempt, delay_ms = delay.as_millis(), "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued, in flight, or waiting on a timer.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && state.processing.is_empty() && state.delayed == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns1", name)
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(80)).without_jitter(),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy =
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)).without_jitter();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jittered_backoff_stays_within_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(300));
        for attempt in 1..10 {
            let delay = policy.delay(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn jitter_adds_at_most_a_quarter() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
        for _ in 0..200 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(125));
        }
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = queue();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
    }

    /// Given a key held by a worker
    /// When it is re-added
    /// Then it is not handed out again until the worker calls done
    #[tokio::test]
    async fn key_in_flight_is_deferred_until_done() {
        let queue = queue();
        queue.add(key("a"));
        let held = queue.get().await.unwrap();

        queue.add(key("a"));
        assert!(queue.is_empty());

        queue.done(&held);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("a"));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_counts_failures() {
        let queue = queue();
        queue.add_rate_limited(key("a"));
        queue.add_rate_limited(key("a"));
        assert_eq!(queue.num_requeues(&key("a")), 2);
        assert!(!queue.is_idle());

        assert_eq!(queue.get().await, Some(key("a")));
        queue.done(&key("a"));
        queue.forget(&key("a"));
        assert_eq!(queue.num_requeues(&key("a")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delivers_once_timer_fires() {
        let queue = queue();
        queue.add_after(key("a"), Duration::from_secs(5));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(key("a")));
        queue.done(&key("a"));
        assert!(queue.is_idle());
    }
}
