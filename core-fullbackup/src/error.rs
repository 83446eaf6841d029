use bridge_traits::BridgeError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FullBackupError {
    /// The snapshot tool could not be started or awaited
    #[error("Snapshot tool failed to run: {0}")]
    Snapshot(#[source] BridgeError),

    #[error("Cannot read backup directory {path}: {source}")]
    BackupDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FullBackupError>;
