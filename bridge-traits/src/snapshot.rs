//! Full-Server Snapshot Trigger
//!
//! Wraps the server administration tool that writes a complete `.tsbak`
//! archive to the local backup directory.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Parameters for one snapshot invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Base file name for the archive, without extension
    pub file_name: String,
    /// Append a `_YYYYmmdd-HHMMSS` suffix to the archive name
    pub append_timestamp: bool,
    pub multithreaded: bool,
}

/// Captured result of the snapshot tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutput {
    /// Process exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[async_trait]
pub trait SnapshotTrigger: Send + Sync {
    /// Run the snapshot tool to completion.
    ///
    /// # Errors
    ///
    /// Only for failures to launch or wait on the tool. A non-zero exit code is
    /// reported through [`SnapshotOutput::exit_code`].
    async fn trigger(&self, request: &SnapshotRequest) -> Result<SnapshotOutput>;
}
