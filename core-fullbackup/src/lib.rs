//! # Full-Server Backup
//!
//! Runs the Tableau Server snapshot tool and ships every resulting `.tsbak`
//! archive to the destination bucket, each with a `sha256sum`-style sidecar.
//!
//! ```text
//! backup():  heartbeat ─► SnapshotTrigger ─► telemetry ─► upload()
//! upload():  for *.tsbak in backup_dir: put ─► put sidecar ─► remove local
//! ```
//!
//! A failed file never stops the remaining ones; it stays on disk for the
//! next run.

pub mod error;
pub mod runner;

pub use error::{FullBackupError, Result};
pub use runner::{
    result_code, FileUpload, FullBackupReport, FullBackupRunner, SnapshotResult, UploadSummary,
    BACKUP_EXTENSION, SUCCESS_MARKER,
};
