//! Core error types for vsmerger.
//!
//! All errors are explicit and typed; nothing in the core panics.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for identity, model and manifest operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read manifest '{path}': {reason}")]
    ManifestReadFailed { path: PathBuf, reason: String },

    #[error("YAML parse error: {reason}")]
    YamlParseFailed { reason: String },

    #[error("unsupported manifest kind '{kind}'")]
    UnsupportedKind { kind: String },
}

impl Error {
    /// Create a manifest read error.
    pub fn manifest_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ManifestReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a YAML parse error.
    pub fn yaml_parse_failed(reason: impl Into<String>) -> Self {
        Self::YamlParseFailed {
            reason: reason.into(),
        }
    }

    /// Create an unsupported kind error.
    pub fn unsupported_kind(kind: impl Into<String>) -> Self {
        Self::UnsupportedKind { kind: kind.into() }
    }
}
