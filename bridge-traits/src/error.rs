use std::io::ErrorKind;

use thiserror::Error;

/// Failure reported by an external collaborator (inventory, object store,
/// telemetry, snapshot tool).
///
/// The variants carry just enough classification for callers to decide whether
/// retrying can help; see [`BridgeError::is_transient`].
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Throttled by remote service: {0}")]
    Throttled(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Classify an HTTP status code returned by a remote API.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => BridgeError::AuthError(message),
            403 => BridgeError::AccessDenied(message),
            404 => BridgeError::NotFound(message),
            408 => BridgeError::Transient(message),
            429 => BridgeError::Throttled(message),
            500..=599 => BridgeError::Transient(format!("HTTP {}: {}", status, message)),
            _ => BridgeError::OperationFailed(format!("HTTP {}: {}", status, message)),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Transient(_) | BridgeError::Throttled(_) => true,
            BridgeError::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::Interrupted
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
