//! Errors - execution error classification.

use thiserror::Error;

/// Operational classification of an execution error.
///
/// - Transient: worth retrying (network hiccup, timeout).
/// - Permanent: retrying cannot help (bad request, refused prompt).
/// - Cancellation: the task's token fired; terminal, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Cancellation,
}

/// Error returned by the model port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("model call aborted")]
    Aborted,

    #[error("transient model error: {0}")]
    Transient(String),

    #[error("model error: {0}")]
    NonRetryable(String),
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } | Self::Transient(_) => ErrorKind::Transient,
            Self::NonRetryable(_) => ErrorKind::Permanent,
            Self::Aborted => ErrorKind::Cancellation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
