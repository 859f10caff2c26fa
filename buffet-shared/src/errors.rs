//! Error types shared across buffet crates.

use thiserror::Error;

/// Result alias used by every buffet API.
pub type BuffetResult<T> = Result<T, BuffetError>;

/// Errors produced by the session lifecycle manager.
///
/// The first group is reported verbatim to end users; the rest are
/// operator-facing faults.
#[derive(Debug, Error)]
pub enum BuffetError {
    /// The owner already holds a live session.
    #[error("owner {0} already has an active session")]
    AlreadyHasSession(String),

    /// The requested image is not in the catalogue.
    #[error("unknown image: {0}")]
    UnknownImage(String),

    /// Every slot is occupied.
    #[error("server at capacity: all {max} session slots are in use")]
    CapacityExhausted { max: u16 },

    /// Hypervisor or proxy could not be started.
    #[error("could not provision session: {0}")]
    LaunchFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The hypervisor control channel could not be used.
    #[error("control channel unavailable: {0}")]
    ControlChannel(String),

    /// A slot reservation lost a race against another create.
    #[error("slot {0} is already taken")]
    SlotTaken(u16),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BuffetError {
    /// Errors caused by the request itself rather than the host.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            BuffetError::AlreadyHasSession(_)
                | BuffetError::UnknownImage(_)
                | BuffetError::NotFound(_)
                | BuffetError::Forbidden(_)
        )
    }

    /// Errors a caller may resolve by issuing the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BuffetError::CapacityExhausted { .. } | BuffetError::SlotTaken(_)
        )
    }
}

impl From<std::io::Error> for BuffetError {
    fn from(err: std::io::Error) -> Self {
        BuffetError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BuffetError {
    fn from(err: serde_json::Error) -> Self {
        BuffetError::Config(err.to_string())
    }
}
