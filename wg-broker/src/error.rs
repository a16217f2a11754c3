//! Typed failures at the component boundary
//!
//! Component operations return [`DaemonError`]; the broker turns it into an
//! [`ErrorCode`] plus message for the unprivileged caller.

use crate::types::ErrorCode;

/// Failure of a privileged operation
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Operation needs an active interface that does not exist
    #[error("interface {0} is not active")]
    NoInterface(String),

    /// Caller-supplied intent cannot be applied
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Listen endpoint or privileged OS call rejected
    #[error("permission denied: {0}")]
    Permission(String),

    /// Referenced object is absent
    #[error("{0} not found")]
    NotFound(String),

    /// Tunnel backend failed to start, stop or answer
    #[error("tunnel backend failure: {0}")]
    Backend(String),

    /// Anything else, with its context chain
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DaemonError {
    /// Map to the shared error-code taxonomy
    ///
    /// `BackendFailure` is kept for the pushed tunnel-died event; a backend
    /// error answering a call is an `InternalError`.
    pub fn code(&self) -> ErrorCode {
        match self {
            DaemonError::NoInterface(_)
            | DaemonError::Invalid(_)
            | DaemonError::Backend(_)
            | DaemonError::Internal(_) => ErrorCode::InternalError,
            DaemonError::Permission(_) => ErrorCode::PermissionError,
            DaemonError::NotFound(_) => ErrorCode::NotFoundError,
        }
    }
}

/// Result alias for component operations
pub type DaemonResult<T> = Result<T, DaemonError>;
