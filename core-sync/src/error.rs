use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Retryable failure that exhausted its attempts
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Authorization, malformed metadata or a destination policy violation
    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Snapshot for site {site} is unusable: {reason}")]
    StateConsistency { site: String, reason: String },

    #[error("Inventory error: {0}")]
    Inventory(#[source] BridgeError),

    #[error("Object store error: {0}")]
    Store(#[source] BridgeError),

    #[error("Run timed out after {0} seconds")]
    Timeout(u64),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] core_runtime::Error),
}

impl SyncError {
    /// Classify a collaborator failure for per-item handling.
    pub fn from_bridge(error: &BridgeError) -> Self {
        if error.is_transient() {
            SyncError::Transient(error.to_string())
        } else {
            SyncError::Permanent(error.to_string())
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
