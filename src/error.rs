use thiserror::Error;

/// Convenience type alias for Results with [`CoordError`]
pub type Result<T> = std::result::Result<T, CoordError>;

/// Error taxonomy for the coordination core.
///
/// Every variant corresponds to one row of the error-kind table in the
/// design: callers are expected to match on the kind, not parse the
/// message, and every blocking operation that times out or fails leaves
/// no partial state behind.
#[derive(Error, Debug)]
pub enum CoordError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("unknown approval: {0}")]
    UnknownApproval(String),

    #[error("unknown lock: {0}")]
    UnknownLock(String),

    #[error("illegal state transition: {0}")]
    IllegalStateTransition(String),

    #[error("lock busy: {path} held by {holder}")]
    LockBusy { path: String, holder: String },

    #[error("lock stolen: {0}")]
    LockStolen(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("redis backend error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoordError {
    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        Self::IllegalStateTransition(msg.into())
    }
}
