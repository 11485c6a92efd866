/// Canonical error type used across all modules.
///
/// Malformed tool-call arguments are not errors. They surface as a
/// [`crate::protocol::canonical::CanonicalEvent::ToolCallError`] event and the
/// stream continues.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category, used to pick the user-facing outcome of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    RateLimit,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 404 | 422 => ErrorCategory::InvalidRequest,
        401 | 403 => ErrorCategory::Authentication,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl CanonicalError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            CanonicalError::Config(_) | CanonicalError::Decode(_) => {
                ErrorCategory::InvalidRequest
            }
            CanonicalError::Transport(_) | CanonicalError::Internal(_) => {
                ErrorCategory::ServerError
            }
            CanonicalError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// Whether the caller may reasonably offer a retry for this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit | ErrorCategory::ServerError
        )
    }
}
