//! # Core Runtime Module
//!
//! Foundational runtime infrastructure shared by the backup engines:
//! - Logging and tracing setup
//! - Run configuration and the TOML file model
//! - Event bus for run milestones
//! - Best-effort telemetry wrapper
//!
//! ## Overview
//!
//! Nothing in here knows about workbooks or S3. The engine crates depend on
//! this one for their settings type and for a place to publish progress.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod telemetry;

pub use config::{BackupConfig, BackupConfigBuilder, FileConfig, RemovalPolicy};
pub use error::{Error, Result};
pub use events::{BackupEvent, CoreEvent, EventBus, FullBackupEvent};
pub use telemetry::Telemetry;
