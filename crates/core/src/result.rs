//! Result alias and logging combinators.

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for results whose failure should be logged and skipped
/// rather than propagated.
pub trait ResultExt<T> {
    /// Convert to an Option, logging the error with `context` if present.
    fn into_option_logged(self, context: &str) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{context}");
                None
            }
        }
    }
}
