//! Core service façade and bootstrap helpers.
//!
//! This crate sits on top of the two backup engines. [`BackupService`] runs
//! the incremental workbook backup for every configured site and project
//! mapping, one site at a time. With the `desktop-shims` feature, [`wiring`]
//! turns a parsed [`FileConfig`](core_runtime::FileConfig) into the production
//! adapters (Tableau REST, S3, Zabbix, `tsm`) and the `tableau-backup` binary
//! drives both engines from the command line.

pub mod error;
pub mod service;
#[cfg(feature = "desktop-shims")]
pub mod wiring;

pub use error::{CoreError, Result};
pub use service::{select_sites, BackupService, BatchOutcome, BucketStores, SiteRun, SITE_OVERRIDE_ENV};
#[cfg(feature = "desktop-shims")]
pub use wiring::{S3BucketStores, Wiring};

pub use core_fullbackup::{FullBackupReport, FullBackupRunner};
pub use core_runtime::{BackupConfig, EventBus, FileConfig, Telemetry};
pub use core_sync::{BackupCoordinator, RunReport};
