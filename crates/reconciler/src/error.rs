//! Error types for the reconciler crate.

use std::time::Duration;

use thiserror::Error;
use vsmerger_core::ObjectKey;

use crate::patch::PatchError;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of object an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Specification,
    Target,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Specification => write!(f, "specification"),
            Self::Target => write!(f, "target"),
        }
    }
}

/// Reconciler error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    #[error("patch computation for '{key}' failed: {source}")]
    Computation {
        key: ObjectKey,
        #[source]
        source: PatchError,
    },

    #[error("status update for '{key}' failed: {reason}")]
    StatusWrite { key: ObjectKey, reason: String },

    #[error("routing event for target '{target}' failed: {reason}")]
    Routing { target: ObjectKey, reason: String },

    #[error("{operation} on '{key}' failed: {reason}")]
    Api {
        operation: &'static str,
        key: String,
        reason: String,
    },

    #[error("conflict updating '{key}': read version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: String,
        actual: String,
    },

    #[error("reconcile of '{key}' exceeded deadline of {timeout:?}")]
    DeadlineExceeded { key: ObjectKey, timeout: Duration },

    #[error("controller is shutting down")]
    Shutdown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// How an error is handled by the reconcile loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// An object vanished mid-flight; resolved locally as a no-op.
    NotFoundTransient,
    /// The patch computer rejected its inputs; surfaced and retried.
    ComputationError,
    /// Writing the status marker failed; fatal for the attempt.
    StatusWriteError,
    /// Mapping a target event to specification keys failed.
    RoutingFailure,
    /// Read, write, conflict or deadline failure; retried.
    Transient,
    /// The controller is stopping; not retried.
    Shutdown,
}

impl Error {
    /// Create a not found error.
    pub fn not_found(kind: ResourceKind, key: ObjectKey) -> Self {
        Self::NotFound { kind, key }
    }

    /// Create a computation error.
    pub fn computation(key: ObjectKey, source: PatchError) -> Self {
        Self::Computation { key, source }
    }

    /// Create a status write error.
    pub fn status_write(key: ObjectKey, reason: impl Into<String>) -> Self {
        Self::StatusWrite {
            key,
            reason: reason.into(),
        }
    }

    /// Create a routing error.
    pub fn routing(target: ObjectKey, reason: impl Into<String>) -> Self {
        Self::Routing {
            target,
            reason: reason.into(),
        }
    }

    /// Create an API error for a failed repository call.
    pub fn api(operation: &'static str, key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Api {
            operation,
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an optimistic concurrency conflict.
    pub fn conflict(key: ObjectKey, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::Conflict {
            key,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a deadline exceeded error.
    pub fn deadline_exceeded(key: ObjectKey, timeout: Duration) -> Self {
        Self::DeadlineExceeded { key, timeout }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Classify the error for the propagation policy.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFoundTransient,
            Self::Computation { .. } => ErrorClass::ComputationError,
            Self::StatusWrite { .. } => ErrorClass::StatusWriteError,
            Self::Routing { .. } => ErrorClass::RoutingFailure,
            Self::Api { .. }
            | Self::Conflict { .. }
            | Self::DeadlineExceeded { .. }
            | Self::InvalidConfig { .. } => ErrorClass::Transient,
            Self::Shutdown => ErrorClass::Shutdown,
        }
    }

    /// Whether the error only means an object is gone.
    pub fn is_not_found(&self) -> bool {
        self.classify() == ErrorClass::NotFoundTransient
    }

    /// Whether the scheduler should retry the key.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.classify(),
            ErrorClass::NotFoundTransient | ErrorClass::Shutdown
        )
    }
}
