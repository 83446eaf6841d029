use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    #[error("Secret {0} is not set")]
    MissingSecret(String),

    #[error("Configuration error: {0}")]
    Config(#[from] core_runtime::Error),

    #[error("Source inventory error: {0}")]
    Inventory(#[source] bridge_traits::BridgeError),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Full backup error: {0}")]
    FullBackup(#[from] core_fullbackup::FullBackupError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
