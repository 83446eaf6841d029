//! # Run Report
//!
//! Folds per-item outcomes into run-level counts, decides whether the run is
//! complete enough to persist, and renders the human summary.
//!
//! A run is complete when every change item produced exactly one terminal
//! outcome. Only complete runs save the snapshot.

use crate::diff::{ChangeAction, ChangeItem};
use crate::pipeline::{ItemResult, UploadOutcome};
use chrono::{DateTime, Utc};
use core_runtime::Telemetry;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;

/// Exit status when an upload failed.
pub const EXIT_UPLOAD_FAILED: i32 = 1;
/// Exit status when the run did not finish every item.
pub const EXIT_INCOMPLETE: i32 = 2;
/// Exit status when the snapshot could not be saved.
pub const EXIT_SAVE_FAILED: i32 = 3;
/// Exit status when the run aborted before any upload.
pub const EXIT_ABORTED: i32 = 4;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub site: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<UploadOutcome>,
    /// Ids that never reached an outcome
    pub missing: Vec<String>,
    pub unchanged: usize,
    pub refreshed: usize,
    pub refresh_failed: usize,
    /// `None` until a save was attempted
    pub snapshot_saved: Option<bool>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, site: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            site: site.into(),
            started_at,
            finished_at: None,
            outcomes: Vec::new(),
            missing: Vec::new(),
            unchanged: 0,
            refreshed: 0,
            refresh_failed: 0,
            snapshot_saved: None,
        }
    }

    /// Record the outcomes of a pipeline run against the items it was given.
    pub fn record(&mut self, items: &[ChangeItem], outcomes: Vec<UploadOutcome>) {
        let mut expected: BTreeMap<&str, usize> = BTreeMap::new();
        for item in items {
            *expected.entry(item.id.as_str()).or_default() += 1;
        }

        let mut produced: BTreeMap<&str, usize> = BTreeMap::new();
        for outcome in &outcomes {
            *produced.entry(outcome.id.as_str()).or_default() += 1;
        }

        self.missing = expected
            .iter()
            .filter(|(id, count)| produced.get(*id).copied().unwrap_or_default() < **count)
            .map(|(id, _)| id.to_string())
            .collect();
        self.outcomes = outcomes;
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn count_result(&self, result: ItemResult) -> usize {
        self.outcomes.iter().filter(|o| o.result == result).count()
    }

    pub fn count(&self, action: ChangeAction, result: ItemResult) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == action && o.result == result)
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count_result(ItemResult::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count_result(ItemResult::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count_result(ItemResult::Skipped)
    }

    pub fn uploaded(&self) -> usize {
        self.count(ChangeAction::Upload, ItemResult::Succeeded)
    }

    pub fn retagged(&self) -> usize {
        self.count(ChangeAction::RetagOnly, ItemResult::Succeeded)
    }

    pub fn removed(&self) -> usize {
        self.count(ChangeAction::MarkRemoved, ItemResult::Succeeded)
    }

    pub fn upload_failures(&self) -> usize {
        self.count(ChangeAction::Upload, ItemResult::Failed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.outcomes.iter().map(|o| o.bytes_transferred).sum()
    }

    pub fn warnings(&self) -> usize {
        self.outcomes.iter().map(|o| o.warnings.len()).sum()
    }

    /// Ids written in this run; the refresher leaves them alone.
    pub fn freshly_written(&self) -> HashSet<String> {
        self.outcomes
            .iter()
            .filter(|o| o.result == ItemResult::Succeeded)
            .filter(|o| matches!(o.action, ChangeAction::Upload | ChangeAction::RetagOnly))
            .map(|o| o.id.clone())
            .collect()
    }

    /// Process exit status for this run.
    ///
    /// A failed snapshot save outranks an incomplete run, which outranks failed
    /// uploads. Retag and removal failures alone do not fail the run.
    pub fn exit_code(&self) -> i32 {
        if self.snapshot_saved == Some(false) {
            EXIT_SAVE_FAILED
        } else if !self.is_complete() {
            EXIT_INCOMPLETE
        } else if self.upload_failures() > 0 {
            EXIT_UPLOAD_FAILED
        } else {
            0
        }
    }

    pub async fn emit_metrics(&self, telemetry: &Telemetry) {
        telemetry.metric("backuped", self.uploaded()).await;
        telemetry.metric("unbackuped", self.upload_failures()).await;
        telemetry.metric("backup_files_size", self.bytes_transferred()).await;
        telemetry.metric("retagged", self.retagged()).await;
        telemetry.metric("removed", self.removed()).await;
        telemetry.metric("refreshed", self.refreshed).await;
        telemetry.metric("exitcode", self.exit_code()).await;

        for outcome in self.outcomes.iter().filter(|o| o.result == ItemResult::Failed) {
            let message = format!(
                "{} {} failed: {}",
                outcome.action,
                outcome.id,
                outcome.error_detail.as_deref().unwrap_or("unknown error")
            );
            telemetry.breadcrumb("backup.item", &message).await;
        }
    }

    /// Tables of backed-up and failed workbooks.
    pub fn render_table(&self) -> String {
        let mut out = String::new();

        let uploaded: Vec<_> = self
            .outcomes
            .iter()
            .filter(|o| o.action == ChangeAction::Upload && o.result == ItemResult::Succeeded)
            .collect();
        if !uploaded.is_empty() {
            let _ = writeln!(out, "Backed up workbooks:");
            let _ = writeln!(out, "|| site || project || name ||");
            for o in uploaded {
                let _ = writeln!(out, "| {} | {} | {} |", self.site, o.project_path, o.name);
            }
        }

        let failed: Vec<_> = self
            .outcomes
            .iter()
            .filter(|o| o.result == ItemResult::Failed)
            .collect();
        if !failed.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "Failed workbooks:");
            let _ = writeln!(out, "|| site || project || name || id || error ||");
            for o in failed {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} |",
                    self.site,
                    o.project_path,
                    o.name,
                    o.id,
                    o.error_detail.as_deref().unwrap_or_default().replace('|', "/")
                );
            }
        }

        if !self.missing.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "Not finished: {}", self.missing.join(", "));
        }

        out
    }

    pub fn summary_line(&self) -> String {
        format!(
            "site={} uploaded={} retagged={} removed={} failed={} skipped={} unchanged={} refreshed={} missing={}",
            self.site,
            self.uploaded(),
            self.retagged(),
            self.removed(),
            self.failed(),
            self.skipped(),
            self.unchanged,
            self.refreshed,
            self.missing.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StateUpdate;
    use chrono::TimeZone;
    use std::time::Duration;

    fn item(id: &str, action: ChangeAction) -> ChangeItem {
        ChangeItem {
            id: id.to_string(),
            action,
            source: None,
            previous: None,
            tags: Default::default(),
            tag_warnings: Vec::new(),
        }
    }

    fn outcome(id: &str, action: ChangeAction, result: ItemResult) -> UploadOutcome {
        UploadOutcome {
            id: id.to_string(),
            action,
            result,
            error_detail: (result == ItemResult::Failed).then(|| "put failed: denied".to_string()),
            duration: Duration::from_millis(5),
            bytes_transferred: if result == ItemResult::Succeeded { 10 } else { 0 },
            attempts: 1,
            warnings: Vec::new(),
            project_path: "Sales".to_string(),
            name: format!("wb {}", id),
            state_update: StateUpdate::Keep,
        }
    }

    fn report() -> RunReport {
        RunReport::new("run-1", "Finance", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_complete_run_counts() {
        let items = vec![
            item("a", ChangeAction::Upload),
            item("b", ChangeAction::RetagOnly),
            item("c", ChangeAction::Upload),
        ];
        let mut report = report();
        report.record(
            &items,
            vec![
                outcome("a", ChangeAction::Upload, ItemResult::Succeeded),
                outcome("b", ChangeAction::RetagOnly, ItemResult::Succeeded),
                outcome("c", ChangeAction::Upload, ItemResult::Failed),
            ],
        );

        assert!(report.is_complete());
        assert_eq!(report.uploaded(), 1);
        assert_eq!(report.retagged(), 1);
        assert_eq!(report.upload_failures(), 1);
        assert_eq!(report.bytes_transferred(), 20);
        assert_eq!(report.exit_code(), EXIT_UPLOAD_FAILED);
        assert_eq!(
            report.freshly_written(),
            ["a".to_string(), "b".to_string()].into()
        );
    }

    #[test]
    fn test_missing_outcome_makes_run_incomplete() {
        let items = vec![item("a", ChangeAction::Upload), item("b", ChangeAction::Upload)];
        let mut report = report();
        report.record(&items, vec![outcome("a", ChangeAction::Upload, ItemResult::Succeeded)]);

        assert!(!report.is_complete());
        assert_eq!(report.missing, vec!["b"]);
        assert_eq!(report.exit_code(), EXIT_INCOMPLETE);
    }

    #[test]
    fn test_duplicates_need_one_outcome_each() {
        let items = vec![item("a", ChangeAction::Upload), item("a", ChangeAction::Upload)];
        let mut report = report();
        report.record(&items, vec![outcome("a", ChangeAction::Upload, ItemResult::Succeeded)]);
        assert!(!report.is_complete());

        report.record(
            &items,
            vec![
                outcome("a", ChangeAction::Upload, ItemResult::Succeeded),
                outcome("a", ChangeAction::Upload, ItemResult::Skipped),
            ],
        );
        assert!(report.is_complete());
    }

    #[test]
    fn test_retag_failure_alone_exits_zero() {
        let items = vec![item("a", ChangeAction::RetagOnly)];
        let mut report = report();
        report.record(&items, vec![outcome("a", ChangeAction::RetagOnly, ItemResult::Failed)]);
        report.snapshot_saved = Some(true);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_save_failure_exit_code() {
        let mut report = report();
        report.record(&[], Vec::new());
        report.snapshot_saved = Some(false);
        assert_eq!(report.exit_code(), EXIT_SAVE_FAILED);
    }

    #[test]
    fn test_render_table() {
        let items = vec![item("a", ChangeAction::Upload), item("c", ChangeAction::Upload)];
        let mut report = report();
        report.record(
            &items,
            vec![
                outcome("a", ChangeAction::Upload, ItemResult::Succeeded),
                outcome("c", ChangeAction::Upload, ItemResult::Failed),
            ],
        );

        let table = report.render_table();
        assert!(table.contains("|| site || project || name ||\n| Finance | Sales | wb a |"));
        assert!(table.contains("| Finance | Sales | wb c | c | put failed: denied |"));
    }
}
