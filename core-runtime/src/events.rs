//! # Event Bus System
//!
//! Broadcasts backup progress to in-process observers using
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The coordinator publishes a [`CoreEvent`] at each run milestone. Observers
//! (a CLI progress printer, a test harness) subscribe independently and never
//! slow the run down: a subscriber that falls behind receives
//! `RecvError::Lagged` instead of blocking the sender.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{BackupEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut stream = event_bus.subscribe();
//!
//! event_bus
//!     .emit(CoreEvent::Backup(BackupEvent::RunStarted {
//!         run_id: "run-1".to_string(),
//!         site: "Finance".to_string(),
//!     }))
//!     .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Backup run started");
//! # }
//! ```
//!
//! `emit` returns an error when nobody is subscribed; publishers ignore it
//! with `.ok()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Incremental workbook backup
    Backup(BackupEvent),
    /// Full-server snapshot backup
    FullBackup(FullBackupEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Backup(e) => e.description(),
            CoreEvent::FullBackup(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Backup(BackupEvent::RunFailed { .. }) => EventSeverity::Error,
            CoreEvent::Backup(BackupEvent::RunIncomplete { .. }) => EventSeverity::Warning,
            CoreEvent::Backup(BackupEvent::ItemFinished { result, .. })
                if result == "failed" =>
            {
                EventSeverity::Warning
            }
            CoreEvent::FullBackup(FullBackupEvent::FileFailed { .. }) => EventSeverity::Error,
            CoreEvent::FullBackup(FullBackupEvent::SnapshotFinished { result_code, .. })
                if *result_code != 0 =>
            {
                EventSeverity::Error
            }
            CoreEvent::Backup(BackupEvent::RunCompleted { .. }) => EventSeverity::Info,
            CoreEvent::FullBackup(FullBackupEvent::SnapshotFinished { .. }) => {
                EventSeverity::Info
            }
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Backup Events
// ============================================================================

/// Milestones of one incremental run for one site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum BackupEvent {
    RunStarted {
        run_id: String,
        site: String,
    },
    /// The diff finished; counts are per action.
    ChangesetComputed {
        run_id: String,
        site: String,
        uploads: usize,
        retags: usize,
        removals: usize,
        unchanged: usize,
    },
    /// One change item reached its terminal outcome.
    ItemFinished {
        run_id: String,
        id: String,
        action: String,
        result: String,
    },
    /// Every item finished; the snapshot save result is included.
    RunCompleted {
        run_id: String,
        site: String,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        snapshot_saved: bool,
    },
    /// Cancelled or timed out before every item finished; nothing was saved.
    RunIncomplete {
        run_id: String,
        site: String,
        missing: usize,
    },
    /// Aborted before any upload, e.g. unreadable snapshot.
    RunFailed {
        run_id: String,
        site: String,
        message: String,
    },
}

impl BackupEvent {
    fn description(&self) -> &str {
        match self {
            BackupEvent::RunStarted { .. } => "Backup run started",
            BackupEvent::ChangesetComputed { .. } => "Changeset computed",
            BackupEvent::ItemFinished { .. } => "Change item finished",
            BackupEvent::RunCompleted { .. } => "Backup run completed",
            BackupEvent::RunIncomplete { .. } => "Backup run incomplete",
            BackupEvent::RunFailed { .. } => "Backup run failed",
        }
    }
}

// ============================================================================
// Full Backup Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum FullBackupEvent {
    SnapshotStarted {
        file_name: String,
    },
    SnapshotFinished {
        exit_code: Option<i32>,
        result_code: i32,
        duration_secs: u64,
    },
    FileUploaded {
        file_name: String,
        bytes: u64,
    },
    FileFailed {
        file_name: String,
        message: String,
    },
}

impl FullBackupEvent {
    fn description(&self) -> &str {
        match self {
            FullBackupEvent::SnapshotStarted { .. } => "Snapshot started",
            FullBackupEvent::SnapshotFinished { .. } => "Snapshot finished",
            FullBackupEvent::FileUploaded { .. } => "Snapshot file uploaded",
            FullBackupEvent::FileFailed { .. } => "Snapshot file upload failed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`CoreEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
