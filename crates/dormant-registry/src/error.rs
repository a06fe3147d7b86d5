//! Error types for the job registry.

use thiserror::Error;

/// Errors that can occur in registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A job declaration or lookup was rejected.
    ///
    /// Raised for conflicting or missing constraints at construction time,
    /// and for references to a backend tag that is not configured.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The registry already holds the maximum number of jobs.
    #[error("job limit reached: at most {max} jobs may be registered")]
    CapacityExceeded { max: usize },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A durability write failed while a caller was waiting on it.
    #[error("snapshot write failed: {0}")]
    Persist(String),

    /// The write-behind worker has stopped.
    #[error("write-behind worker is not running")]
    WriterClosed,
}

impl RegistryError {
    /// Shorthand for [`RegistryError::InvalidArgument`].
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
