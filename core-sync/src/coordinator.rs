//! # Backup Coordinator
//!
//! Runs one incremental backup of one site end to end.
//!
//! ## Workflow
//!
//! 1. Heartbeat and `RunStarted`
//! 2. Load the site snapshot (an unreadable snapshot aborts the run)
//! 3. List the site's workbooks, honouring the project filter
//! 4. Diff listing against snapshot into a changeset
//! 5. Execute the changeset in the upload pipeline, bounded by `run_timeout`
//! 6. Fold outcomes into a pending snapshot (only this coordinator writes it)
//! 7. If every item finished: refresh stale objects, then save the snapshot once
//! 8. Emit metrics and return the [`RunReport`]
//!
//! An incomplete run (timeout, external cancellation) never saves, so the
//! next run recomputes the same diff.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::BackupCoordinator;
//!
//! let coordinator = BackupCoordinator::new(inventory, store)
//!     .with_telemetry(telemetry)
//!     .with_event_bus(event_bus);
//!
//! let report = coordinator.run_backup("Finance", &config).await?;
//! std::process::exit(report.exit_code());
//! ```

use crate::attempt::RetryPolicy;
use crate::diff::{ChangeAction, InventoryDiff};
use crate::pipeline::{StateUpdate, UploadOutcome, UploadPipeline};
use crate::report::{RunReport, EXIT_ABORTED};
use crate::staleness::StalenessRefresher;
use crate::state::{StateSnapshot, StateStore};
use crate::tags::TagMapper;
use crate::{Result, SyncError};
use bridge_traits::{Clock, ErrorContext, ObjectStore, SourceInventory, SystemClock};
use core_runtime::{BackupConfig, BackupEvent, CoreEvent, EventBus, Telemetry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub struct BackupCoordinator {
    inventory: Arc<dyn SourceInventory>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
    event_bus: Option<EventBus>,
    cancellation_token: CancellationToken,
}

impl BackupCoordinator {
    pub fn new(inventory: Arc<dyn SourceInventory>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            inventory,
            store,
            clock: Arc::new(SystemClock),
            telemetry: Telemetry::disabled(core_runtime::config::DEFAULT_TELEMETRY_PREFIX),
            event_bus: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Metric keys are re-prefixed per run from `BackupConfig::telemetry_prefix`.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Share an external token, e.g. one fired by a Ctrl-C handler.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Stop dispatching work in every running backup of this coordinator.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    fn emit(&self, event: BackupEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::Backup(event)).ok();
        }
    }

    /// Back up `site` once.
    ///
    /// Returns `Err` only for run-level failures (unreadable snapshot, listing
    /// failure, unusable work directory). Per-item failures are in the report.
    #[instrument(skip(self, config))]
    pub async fn run_backup(&self, site: &str, config: &BackupConfig) -> Result<RunReport> {
        config.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let telemetry = self.telemetry.with_prefix(&config.telemetry_prefix);
        let mut report = RunReport::new(&run_id, site, self.clock.now());

        telemetry.heartbeat().await;
        self.emit(BackupEvent::RunStarted {
            run_id: run_id.clone(),
            site: site.to_string(),
        });
        info!(run_id = %run_id, "Backup run started");

        let state_store = StateStore::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &config.state_object_name,
            RetryPolicy::from_config(config),
        );

        let snapshot = match state_store.load(site).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.abort(&run_id, site, &telemetry, e).await),
        };

        let listing = match self
            .inventory
            .list_objects(site, config.project_filter.as_deref())
            .await
        {
            Ok(listing) => listing,
            Err(e) => {
                return Err(self
                    .abort(&run_id, site, &telemetry, SyncError::Inventory(e))
                    .await)
            }
        };

        let mapper = TagMapper::from_config(config);
        let changeset = InventoryDiff::new(&mapper, config.removal_confirmation_runs)
            .with_project_filter(config.project_filter.as_deref())
            .with_rejected(&listing.rejected)
            .compute(&listing.objects, &snapshot);

        report.unchanged = changeset.unchanged.len();
        self.emit(BackupEvent::ChangesetComputed {
            run_id: run_id.clone(),
            site: site.to_string(),
            uploads: changeset.count(ChangeAction::Upload),
            retags: changeset.count(ChangeAction::RetagOnly),
            removals: changeset.count(ChangeAction::MarkRemoved),
            unchanged: changeset.unchanged.len(),
        });
        info!(
            listed = listing.len(),
            rejected = listing.rejected.len(),
            items = changeset.items.len(),
            unchanged = changeset.unchanged.len(),
            "Changeset computed"
        );

        let cancel = self.cancellation_token.child_token();
        let timer = config.run_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!(timeout_secs = timeout.as_secs(), "Run timeout reached, cancelling");
                        cancel.cancel();
                    }
                }
            })
        });

        let items = changeset.items.clone();
        let pipeline = UploadPipeline::new(
            Arc::clone(&self.inventory),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            config,
        );
        let run = pipeline
            .run(site, changeset.items, config.max_workers, cancel.clone())
            .await;

        if let Some(timer) = timer {
            timer.abort();
        }

        let mut run = match run {
            Ok(run) => run,
            Err(e) => return Err(self.abort(&run_id, site, &telemetry, e).await),
        };
        run.outcomes
            .extend(listing.rejected.iter().map(UploadOutcome::rejected));

        for outcome in &run.outcomes {
            self.emit(BackupEvent::ItemFinished {
                run_id: run_id.clone(),
                id: outcome.id.clone(),
                action: outcome.action.to_string(),
                result: outcome.result.as_str().to_string(),
            });
        }

        let mut pending = apply_outcomes(&snapshot, &changeset.absence_counters, &run.outcomes);
        report.record(&items, run.outcomes);

        if report.is_complete() {
            if let Some(threshold) = config.staleness_threshold {
                let refresher = StalenessRefresher::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.clock),
                    config.max_workers,
                );
                let summary = refresher
                    .refresh(site, &pending, threshold, &report.freshly_written())
                    .await;
                for (id, touched_at) in &summary.refreshed {
                    if let Some(entry) = pending.entries.get_mut(id) {
                        entry.last_modified = Some(*touched_at);
                    }
                }
                report.refreshed = summary.refreshed.len();
                report.refresh_failed = summary.failed.len();
            }

            pending.generated_at = self.clock.now();
            match state_store.save(&pending).await {
                Ok(()) => report.snapshot_saved = Some(true),
                Err(e) => {
                    error!(error = %e, "Snapshot save failed; next run will redo this work");
                    telemetry
                        .capture_error(
                            ErrorContext::new(e.to_string())
                                .with_tag("site", site)
                                .with_tag("run_id", run_id.as_str())
                                .with_tag("stage", "state_save"),
                        )
                        .await;
                    report.snapshot_saved = Some(false);
                }
            }

            self.emit(BackupEvent::RunCompleted {
                run_id: run_id.clone(),
                site: site.to_string(),
                succeeded: report.succeeded(),
                failed: report.failed(),
                skipped: report.skipped(),
                snapshot_saved: report.snapshot_saved == Some(true),
            });
        } else {
            warn!(
                missing = report.missing.len(),
                "Run incomplete, snapshot left untouched"
            );
            self.emit(BackupEvent::RunIncomplete {
                run_id: run_id.clone(),
                site: site.to_string(),
                missing: report.missing.len(),
            });
        }

        report.finished_at = Some(self.clock.now());
        report.emit_metrics(&telemetry).await;
        info!(summary = %report.summary_line(), exit_code = report.exit_code(), "Backup run finished");

        Ok(report)
    }

    async fn abort(
        &self,
        run_id: &str,
        site: &str,
        telemetry: &Telemetry,
        error: SyncError,
    ) -> SyncError {
        error!(run_id, error = %error, "Backup run aborted");
        self.emit(BackupEvent::RunFailed {
            run_id: run_id.to_string(),
            site: site.to_string(),
            message: error.to_string(),
        });
        telemetry
            .capture_error(
                ErrorContext::new(error.to_string())
                    .with_tag("site", site)
                    .with_tag("run_id", run_id),
            )
            .await;
        telemetry.metric("exitcode", EXIT_ABORTED).await;
        error
    }
}

/// Build the snapshot to persist from the one loaded at run start.
///
/// Absence counters are applied first, then every outcome's state update in
/// order. Items whose outcome says `Keep` retain their prior entry or absence.
pub fn apply_outcomes(
    prior: &StateSnapshot,
    absence_counters: &BTreeMap<String, u32>,
    outcomes: &[UploadOutcome],
) -> StateSnapshot {
    let mut pending = prior.clone();

    for (id, absent_runs) in absence_counters {
        if let Some(entry) = pending.entries.get_mut(id) {
            entry.absent_runs = *absent_runs;
        }
    }

    for outcome in outcomes {
        match &outcome.state_update {
            StateUpdate::Keep => {}
            StateUpdate::Put(entry) => {
                let mut entry = entry.clone();
                entry.absent_runs = 0;
                pending.entries.insert(outcome.id.clone(), entry);
            }
            StateUpdate::Remove => {
                pending.entries.remove(&outcome.id);
            }
        }
    }

    pending
}
