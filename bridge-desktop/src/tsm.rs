//! TSM Snapshot Trigger
//!
//! Runs `tsm maintenance backup` through a login-style bash so that the
//! Tableau Server environment script is sourced first.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    snapshot::{SnapshotOutput, SnapshotRequest, SnapshotTrigger},
    time::{Clock, SystemClock},
};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_PROFILE_SCRIPT: &str = "/etc/profile.d/tableau_server.sh";

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

pub struct TsmSnapshotTrigger {
    profile_script: String,
    shell: String,
    clock: Arc<dyn Clock>,
}

impl Default for TsmSnapshotTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl TsmSnapshotTrigger {
    pub fn new() -> Self {
        Self {
            profile_script: DEFAULT_PROFILE_SCRIPT.to_string(),
            shell: "bash".to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_profile_script(mut self, path: impl Into<String>) -> Self {
        self.profile_script = path.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Archive name passed to `--file`.
    pub fn archive_name(&self, request: &SnapshotRequest) -> String {
        if request.append_timestamp {
            format!(
                "{}_{}",
                request.file_name,
                self.clock.now().format(TIMESTAMP_FORMAT)
            )
        } else {
            request.file_name.clone()
        }
    }

    /// Full shell command line for `request`.
    pub fn command_line(&self, request: &SnapshotRequest) -> String {
        let mut line = format!(
            "source {}; tsm maintenance backup --ignore-prompt --file {}",
            shell_quote(&self.profile_script),
            shell_quote(&self.archive_name(request))
        );
        if request.multithreaded {
            line.push_str(" --multithreaded");
        }
        line
    }
}

/// Single-quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl SnapshotTrigger for TsmSnapshotTrigger {
    async fn trigger(&self, request: &SnapshotRequest) -> Result<SnapshotOutput> {
        let line = self.command_line(request);
        debug!(command = %line, "Starting snapshot tool");

        let started = Instant::now();
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&line)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BridgeError::NotAvailable(format!("{}: {}", self.shell, e)))?;
        let duration = started.elapsed();

        info!(
            exit_code = ?output.status.code(),
            duration_secs = duration.as_secs(),
            "Snapshot tool finished"
        );

        Ok(SnapshotOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        })
    }
}
