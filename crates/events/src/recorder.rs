//! Observability sink for reconcile outcomes.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use vsmerger_core::ObjectKey;

/// Reasons attached to recorded events.
pub mod reasons {
    pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
    pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";
    pub const STATUS_UPDATE_FAILED: &str = "StatusUpdateFailed";
}

/// Unique identifier for a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warning => write!(f, "Warning"),
        }
    }
}

/// An event attached to an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: EventId,
    pub subject: ObjectKey,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Sink for per-object observability events.
///
/// Recording is fire-and-forget; a sink never fails the caller.
pub trait EventRecorder: Send + Sync {
    fn record(&self, subject: &ObjectKey, severity: Severity, reason: &str, message: &str);
}

/// Events an [`InMemoryEventRecorder`] keeps unless told otherwise.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// In-memory recorder, mostly for tests and local runs.
///
/// Holds at most `capacity` events; the oldest is dropped to make room.
#[derive(Debug)]
pub struct InMemoryEventRecorder {
    events: Mutex<VecDeque<RecordedEvent>>,
    capacity: usize,
}

impl Default for InMemoryEventRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder keeping the `capacity` most recent events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Events recorded for one subject.
    pub fn events_for(&self, subject: &ObjectKey) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| &e.subject == subject)
            .collect()
    }

    /// Number of events with the given reason.
    pub fn count_reason(&self, reason: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.reason == reason)
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn record(&self, subject: &ObjectKey, severity: Severity, reason: &str, message: &str) {
        let event = RecordedEvent {
            event_id: EventId::new(),
            subject: subject.clone(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// A wrapper that logs every event before forwarding it.
pub struct TracingEventRecorder<R: EventRecorder> {
    inner: R,
}

impl<R: EventRecorder> TracingEventRecorder<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: EventRecorder> EventRecorder for TracingEventRecorder<R> {
    fn record(&self, subject: &ObjectKey, severity: Severity, reason: &str, message: &str) {
        match severity {
            Severity::Normal => tracing::info!(subject = %subject, reason, message, "Event"),
            Severity::Warning => tracing::warn!(subject = %subject, reason, message, "Event"),
        }
        self.inner.record(subject, severity, reason, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_in_order() {
        let recorder = InMemoryEventRecorder::new();
        let key = ObjectKey::new("ns1", "a");

        recorder.record(&key, Severity::Warning, reasons::RECONCILIATION_FAILED, "boom");
        recorder.record(&key, Severity::Normal, reasons::RECONCILIATION_SUCCEEDED, "");

        let events = recorder.events_for(&key);
        assert_eq!(events.len(), 2);
        assert_eq!(events.first().map(|e| e.severity), Some(Severity::Warning));
        assert_eq!(
            events.last().map(|e| e.reason.as_str()),
            Some(reasons::RECONCILIATION_SUCCEEDED)
        );
    }

    #[test]
    fn test_count_reason_and_clear() {
        let recorder = InMemoryEventRecorder::new();
        let key = ObjectKey::new("ns1", "a");
        recorder.record(&key, Severity::Normal, reasons::RECONCILIATION_SUCCEEDED, "");
        recorder.record(&key, Severity::Normal, reasons::RECONCILIATION_SUCCEEDED, "");
        assert_eq!(recorder.count_reason(reasons::RECONCILIATION_SUCCEEDED), 2);
        assert_eq!(recorder.count_reason(reasons::RECONCILIATION_FAILED), 0);

        recorder.clear();
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_tracing_recorder_forwards() {
        let recorder = TracingEventRecorder::new(InMemoryEventRecorder::new());
        let key = ObjectKey::new("ns1", "a");
        recorder.record(&key, Severity::Warning, reasons::STATUS_UPDATE_FAILED, "denied");
        assert_eq!(recorder.inner().events().len(), 1);
    }

    #[test]
    fn test_full_recorder_drops_oldest() {
        let recorder = InMemoryEventRecorder::with_capacity(2);
        let key = ObjectKey::new("ns1", "a");
        recorder.record(&key, Severity::Warning, reasons::RECONCILIATION_FAILED, "first");
        recorder.record(&key, Severity::Warning, reasons::RECONCILIATION_FAILED, "second");
        recorder.record(&key, Severity::Normal, reasons::RECONCILIATION_SUCCEEDED, "");

        let messages: Vec<String> = recorder.events().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["second".to_string(), String::new()]);
        assert_eq!(recorder.count_reason(reasons::RECONCILIATION_FAILED), 1);
    }

    #[test]
    fn test_zero_capacity_keeps_latest_event() {
        let recorder = InMemoryEventRecorder::with_capacity(0);
        let key = ObjectKey::new("ns1", "a");
        recorder.record(&key, Severity::Normal, reasons::RECONCILIATION_SUCCEEDED, "");
        recorder.record(&key, Severity::Warning, reasons::STATUS_UPDATE_FAILED, "");

        assert_eq!(recorder.capacity(), 1);
        assert_eq!(recorder.count_reason(reasons::STATUS_UPDATE_FAILED), 1);
        assert_eq!(recorder.events().len(), 1);
    }
}
