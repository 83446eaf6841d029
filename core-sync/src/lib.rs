//! # Incremental Backup Engine
//!
//! Decides, per site, which workbooks must be uploaded, retagged or retired,
//! and executes that decision under partial failure.
//!
//! ## Overview
//!
//! Control flow of one run:
//!
//! ```text
//! StateStore::load ─┐
//!                   ├─► InventoryDiff ─► UploadPipeline ─► RunReport ─► StateStore::save
//! list_objects ─────┘         ▲                 │
//!                          TagMapper     StalenessRefresher
//! ```
//!
//! ## Components
//!
//! - **State Store** (`state`): Per-site JSON snapshot of what is in the bucket
//! - **Inventory Diff** (`diff`): Listing vs snapshot into a sorted changeset
//! - **Tag Mapper** (`tags`): Workbook metadata into S3-compatible tags
//! - **Attempt State Machine** (`attempt`): Per-item retries with backoff
//! - **Upload Pipeline** (`pipeline`): Bounded worker pool executing the changeset
//! - **Staleness Refresher** (`staleness`): Touches objects past the lifecycle threshold
//! - **Run Report** (`report`): Counts, completeness, exit status, metrics
//! - **Backup Coordinator** (`coordinator`): `run_backup(site, config)`

pub mod attempt;
pub mod coordinator;
pub mod diff;
pub mod error;
pub mod pipeline;
pub mod report;
pub mod staleness;
pub mod state;
pub mod tags;

pub use attempt::{AttemptState, ItemAttempt, RetryDecision, RetryPolicy};
pub use coordinator::{apply_outcomes, BackupCoordinator};
pub use diff::{ChangeAction, ChangeItem, Changeset, InventoryDiff};
pub use error::{Result, SyncError};
pub use pipeline::{ItemResult, PipelineRun, StateUpdate, UploadOutcome, UploadPipeline};
pub use report::RunReport;
pub use staleness::{RefreshSummary, StalenessRefresher};
pub use state::{StateEntry, StateSnapshot, StateStore};
pub use tags::{MappedTags, TagMapper};
