//! End-to-end runs of the incremental backup engine
//!
//! These tests drive `BackupCoordinator::run_backup` against an in-memory
//! bucket and a scripted inventory:
//! - Repeated runs without source changes do no work
//! - Updates, metadata edits and new workbooks map to the right actions
//! - Removal needs consecutive absences
//! - Partial failures keep the successful part of the snapshot
//! - Retry budget and extract fallback
//! - Cancellation and unreadable snapshots never overwrite state
//! - Stale objects are touched, unusable listing entries stay local

use async_trait::async_trait;
use bridge_desktop::{validate_tags, InMemoryObjectStore};
use bridge_traits::{
    error::{BridgeError, Result as BridgeResult},
    Clock, Download, Listing, ManualClock, ObjectBody, ObjectStore, RejectedObject, SiteInfo,
    SourceInventory, SourceObject, TagSet,
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use core_runtime::{BackupConfig, RemovalPolicy};
use core_sync::report::{EXIT_INCOMPLETE, EXIT_UPLOAD_FAILED};
use core_sync::{
    BackupCoordinator, ChangeAction, ChangeItem, ItemResult, StateSnapshot, SyncError, TagMapper,
    UploadPipeline,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SITE: &str = "Finance";
const STATE_KEY: &str = "Finance/upload_state.json";

// ============================================================================
// Test Doubles
// ============================================================================

/// How downloads of one workbook misbehave.
#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Fail with a transient error this many times, then succeed
    TransientTimes(u32),
    AlwaysTransient,
    Permanent,
    /// Fail only when the extract is requested; the plain download is a `.twb`
    ExtractOnly,
    /// Take this long, then succeed
    Slow(Duration),
    /// Never return
    Hang,
}

#[derive(Default)]
struct ScriptedInventory {
    listing: Mutex<Vec<SourceObject>>,
    rejected: Mutex<Vec<RejectedObject>>,
    faults: Mutex<HashMap<String, Fault>>,
    downloads: Mutex<HashMap<String, u32>>,
}

impl ScriptedInventory {
    fn new(listing: Vec<SourceObject>) -> Arc<Self> {
        Arc::new(Self {
            listing: Mutex::new(listing),
            ..Default::default()
        })
    }

    fn set_listing(&self, listing: Vec<SourceObject>) {
        *self.listing.lock().unwrap() = listing;
    }

    fn reject(&self, id: &str, project: &str) {
        self.rejected.lock().unwrap().push(RejectedObject {
            id: id.to_string(),
            name: format!("Workbook {}", id),
            project_path: project.to_string(),
            reason: "invalid updatedAt \"yesterday\"".to_string(),
        });
    }

    fn fail(&self, id: &str, fault: Fault) {
        self.faults.lock().unwrap().insert(id.to_string(), fault);
    }

    fn heal(&self, id: &str) {
        self.faults.lock().unwrap().remove(id);
    }

    fn downloads_of(&self, id: &str) -> u32 {
        self.downloads.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn total_downloads(&self) -> u32 {
        self.downloads.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl SourceInventory for ScriptedInventory {
    async fn list_sites(&self) -> BridgeResult<Vec<SiteInfo>> {
        Ok(vec![SiteInfo {
            id: "site-1".to_string(),
            name: SITE.to_string(),
            content_url: "finance".to_string(),
        }])
    }

    async fn list_objects(
        &self,
        _site: &str,
        project_filter: Option<&[String]>,
    ) -> BridgeResult<Listing> {
        let objects = self.listing.lock().unwrap().clone();
        Ok(Listing {
            objects: objects
                .into_iter()
                .filter(|o| {
                    project_filter.map_or(true, |f| f.iter().any(|p| o.is_under_project(p)))
                })
                .collect(),
            rejected: self.rejected.lock().unwrap().clone(),
        })
    }

    async fn download(&self, _site: &str, id: &str, include_extract: bool) -> BridgeResult<Download> {
        let calls = {
            let mut downloads = self.downloads.lock().unwrap();
            let calls = downloads.entry(id.to_string()).or_default();
            *calls += 1;
            *calls
        };

        let fault = self.faults.lock().unwrap().get(id).copied();
        match fault {
            Some(Fault::TransientTimes(n)) if calls <= n => {
                return Err(BridgeError::Transient(format!("{} busy", id)))
            }
            Some(Fault::AlwaysTransient) => {
                return Err(BridgeError::Transient(format!("{} busy", id)))
            }
            Some(Fault::Permanent) => {
                return Err(BridgeError::AccessDenied(format!("{} forbidden", id)))
            }
            Some(Fault::ExtractOnly) if include_extract => {
                return Err(BridgeError::OperationFailed(format!("{} extract broken", id)))
            }
            Some(Fault::Slow(delay)) => tokio::time::sleep(delay).await,
            Some(Fault::Hang) => std::future::pending::<()>().await,
            _ => {}
        }

        let extension = match fault {
            Some(Fault::ExtractOnly) => "twb",
            _ => "twbx",
        };
        Ok(Download {
            file_name: format!("{}.{}", id, extension),
            body: Box::new(std::io::Cursor::new(format!("contents of {}", id).into_bytes())),
        })
    }
}

/// Bucket whose snapshot writes can be made to fail.
struct FlakyBucket {
    inner: Arc<InMemoryObjectStore>,
    fail_state_writes: Mutex<bool>,
}

impl FlakyBucket {
    fn new(inner: Arc<InMemoryObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_state_writes: Mutex::new(false),
        })
    }
}

#[async_trait]
impl ObjectStore for FlakyBucket {
    async fn put(&self, key: &str, body: ObjectBody, tags: &TagSet) -> BridgeResult<()> {
        self.inner.put(key, body, tags).await
    }

    async fn get_tags(&self, key: &str) -> BridgeResult<TagSet> {
        self.inner.get_tags(key).await
    }

    async fn update_tags(&self, key: &str, tags: &TagSet) -> BridgeResult<()> {
        self.inner.update_tags(key, tags).await
    }

    async fn touch_last_modified(&self, key: &str) -> BridgeResult<()> {
        self.inner.touch_last_modified(key).await
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.inner.delete(key).await
    }

    async fn get_object(&self, key: &str) -> BridgeResult<Option<Bytes>> {
        self.inner.get_object(key).await
    }

    async fn put_object(&self, key: &str, body: Bytes) -> BridgeResult<()> {
        if *self.fail_state_writes.lock().unwrap() {
            return Err(BridgeError::AccessDenied(format!("{} is read-only", key)));
        }
        self.inner.put_object(key, body).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
}

fn workbook(id: &str, project: &str, updated: DateTime<Utc>) -> SourceObject {
    SourceObject::new(id, format!("Workbook {}", id), project, updated)
        .with_owner("jdoe")
        .with_created_at(at(1, 0))
}

fn config(dir: &TempDir) -> BackupConfig {
    BackupConfig::builder()
        .max_workers(4)
        .max_attempts(3)
        .backoff(Duration::ZERO, Duration::ZERO)
        .jitter(false)
        .grace_period(Duration::from_millis(50))
        .staleness_threshold(None)
        .work_dir(dir.path())
        .build()
        .unwrap()
}

fn coordinator(inventory: &Arc<ScriptedInventory>, store: Arc<dyn ObjectStore>) -> BackupCoordinator {
    BackupCoordinator::new(inventory.clone(), store)
}

fn stored_snapshot(store: &InMemoryObjectStore) -> StateSnapshot {
    let body = store.object(STATE_KEY).expect("snapshot written").body;
    serde_json::from_slice(&body).unwrap()
}

fn outcome_result(report: &core_sync::RunReport, id: &str) -> ItemResult {
    report
        .outcomes
        .iter()
        .find(|o| o.id == id)
        .map(|o| o.result)
        .expect("outcome present")
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_second_run_without_changes_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales/EMEA", at(2, 10)),
        workbook("w3", "Ops", at(2, 11)),
    ]);
    let config = config(&dir);

    let first = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert_eq!(first.uploaded(), 3);
    assert_eq!(first.exit_code(), 0);
    assert_eq!(first.snapshot_saved, Some(true));
    assert!(store.contains("Finance/Sales/EMEA/Workbook w2__w2.twbx"));

    let second = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert!(second.outcomes.is_empty());
    assert_eq!(second.unchanged, 3);
    assert_eq!(second.exit_code(), 0);
    assert_eq!(store.put_count(), 3);
    assert_eq!(inventory.total_downloads(), 3);
    assert_eq!(stored_snapshot(&store).len(), 3);
}

#[tokio::test]
async fn test_changes_map_to_upload_and_retag() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(2, 10)),
        workbook("w3", "Sales", at(2, 11)),
    ]);
    let config = config(&dir);

    coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    inventory.set_listing(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(3, 8)),
        workbook("w3", "Sales", at(2, 11)).with_description("Quarterly numbers"),
        workbook("w4", "Sales", at(3, 9)),
    ]);

    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    let mut actions: Vec<_> = report
        .outcomes
        .iter()
        .map(|o| (o.id.as_str(), o.action))
        .collect();
    actions.sort_by(|a, b| a.0.cmp(b.0));
    assert_eq!(
        actions,
        vec![
            ("w2", ChangeAction::Upload),
            ("w3", ChangeAction::RetagOnly),
            ("w4", ChangeAction::Upload),
        ]
    );
    assert_eq!(report.unchanged, 1);
    assert_eq!(inventory.downloads_of("w3"), 1);
    assert_eq!(store.tag_update_count(), 1);
    assert_eq!(
        store.tags("Finance/Sales/Workbook w3__w3.twbx").unwrap()["tab_description"],
        "Quarterly numbers"
    );

    let snapshot = stored_snapshot(&store);
    assert_eq!(snapshot.get("w2").unwrap().updated_at, at(3, 8));
    assert!(snapshot.get("w4").is_some());
}

#[tokio::test]
async fn test_removal_needs_two_consecutive_absences() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(2, 10)),
    ]);
    let mut config = config(&dir);
    config.removal_policy = RemovalPolicy::Delete;
    let gone_key = "Finance/Sales/Workbook w2__w2.twbx";

    coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert!(store.contains(gone_key));

    inventory.set_listing(vec![workbook("w1", "Sales", at(2, 9))]);

    let first_absence = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert_eq!(first_absence.removed(), 0);
    assert!(store.contains(gone_key));
    assert_eq!(stored_snapshot(&store).get("w2").unwrap().absent_runs, 1);

    let second_absence = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert_eq!(second_absence.removed(), 1);
    assert!(!store.contains(gone_key));
    assert!(stored_snapshot(&store).get("w2").is_none());
    assert_eq!(stored_snapshot(&store).len(), 1);
}

#[tokio::test]
async fn test_partial_failure_keeps_successful_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let listing: Vec<_> = (0..10)
        .map(|i| workbook(&format!("w{:02}", i), "Sales", at(2, i)))
        .collect();
    let inventory = ScriptedInventory::new(listing);
    for id in ["w02", "w05", "w08"] {
        inventory.fail(id, Fault::Permanent);
    }
    let config = config(&dir);

    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    assert_eq!(report.uploaded(), 7);
    assert_eq!(report.upload_failures(), 3);
    assert!(report.is_complete());
    assert_eq!(report.exit_code(), EXIT_UPLOAD_FAILED);
    assert_eq!(outcome_result(&report, "w05"), ItemResult::Failed);
    assert!(report.render_table().contains("forbidden"));

    let snapshot = stored_snapshot(&store);
    assert_eq!(snapshot.len(), 7);
    assert!(snapshot.get("w02").is_none());

    // Only the failed workbooks are attempted again
    for id in ["w02", "w05", "w08"] {
        inventory.heal(id);
    }
    let retry = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    let mut retried: Vec<_> = retry.outcomes.iter().map(|o| o.id.as_str()).collect();
    retried.sort();
    assert_eq!(retried, vec!["w02", "w05", "w08"]);
    assert_eq!(retry.exit_code(), 0);
    assert_eq!(stored_snapshot(&store).len(), 10);
}

#[tokio::test]
async fn test_transient_failures_respect_attempt_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("flaky", "Sales", at(2, 9)),
        workbook("down", "Sales", at(2, 10)),
    ]);
    inventory.fail("flaky", Fault::TransientTimes(2));
    inventory.fail("down", Fault::AlwaysTransient);
    let config = config(&dir);

    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    assert_eq!(outcome_result(&report, "flaky"), ItemResult::Succeeded);
    assert_eq!(inventory.downloads_of("flaky"), 3);

    let down = report.outcomes.iter().find(|o| o.id == "down").unwrap();
    assert_eq!(down.result, ItemResult::Failed);
    assert_eq!(down.attempts, 3);
    assert_eq!(inventory.downloads_of("down"), 3);
}

#[tokio::test]
async fn test_stored_tags_match_mapping_and_limits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let source = workbook("w1", "Sales & Marketing", at(2, 9))
        .with_description("Q1 <draft> (ask #finance)");
    let inventory = ScriptedInventory::new(vec![source.clone()]);
    let config = config(&dir);

    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(report.outcomes[0]
        .warnings
        .iter()
        .any(|w| w.contains("unsupported characters")));

    let key = "Finance/Sales & Marketing/Workbook w1__w1.twbx";
    let stored = store.tags(key).unwrap();
    validate_tags(&stored).unwrap();
    assert_eq!(stored, TagMapper::from_config(&config).map(&source).tags);
    assert_eq!(stored_snapshot(&store).get("w1").unwrap().tags, stored);

    let again = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert!(again.outcomes.is_empty());
    assert_eq!(store.tag_update_count(), 0);
}

#[tokio::test]
async fn test_extract_fallback_holds_state_unless_tagged() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let config = config(&dir);
    let inventory = ScriptedInventory::new(vec![
        workbook("plain", "Sales", at(2, 9)).with_extract(true),
        workbook("tagged", "Sales", at(2, 10))
            .with_extract(true)
            .with_label(config.ignore_extract_errors_tag.clone()),
    ]);
    inventory.fail("plain", Fault::ExtractOnly);
    inventory.fail("tagged", Fault::ExtractOnly);

    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    assert_eq!(report.uploaded(), 2);
    assert!(store.contains("Finance/Sales/Workbook plain__plain.twb"));
    let plain = report.outcomes.iter().find(|o| o.id == "plain").unwrap();
    assert!(plain.warnings.iter().any(|w| w.contains("without extract")));

    let snapshot = stored_snapshot(&store);
    assert!(snapshot.get("plain").is_none());
    assert!(snapshot.get("tagged").is_some());
}

#[tokio::test]
async fn test_cancelled_run_leaves_snapshot_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(2, 10)),
    ]);
    let config = config(&dir);

    let token = CancellationToken::new();
    token.cancel();
    let report = coordinator(&inventory, store.clone())
        .with_cancellation_token(token)
        .run_backup(SITE, &config)
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.missing, vec!["w1", "w2"]);
    assert_eq!(report.snapshot_saved, None);
    assert_eq!(report.exit_code(), EXIT_INCOMPLETE);
    assert!(!store.contains(STATE_KEY));

    // The next run recomputes the same work
    let resumed = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert_eq!(resumed.uploaded(), 2);
    assert!(store.contains(STATE_KEY));
}

#[tokio::test]
async fn test_unreadable_snapshot_aborts_without_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    store
        .put_object(STATE_KEY, Bytes::from_static(b"{\"site\": \"Finance\", \"entries\": 42"))
        .await
        .unwrap();
    let inventory = ScriptedInventory::new(vec![workbook("w1", "Sales", at(2, 9))]);

    let err = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config(&dir))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::StateConsistency { .. }));
    assert_eq!(inventory.total_downloads(), 0);
    assert_eq!(store.put_count(), 0);
    assert_eq!(
        store.object(STATE_KEY).unwrap().body,
        Bytes::from_static(b"{\"site\": \"Finance\", \"entries\": 42")
    );
}

#[tokio::test]
async fn test_failed_snapshot_save_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Arc::new(InMemoryObjectStore::new());
    let bucket = FlakyBucket::new(memory.clone());
    *bucket.fail_state_writes.lock().unwrap() = true;
    let inventory = ScriptedInventory::new(vec![workbook("w1", "Sales", at(2, 9))]);

    let report = coordinator(&inventory, bucket)
        .run_backup(SITE, &config(&dir))
        .await
        .unwrap();

    assert_eq!(report.uploaded(), 1);
    assert_eq!(report.snapshot_saved, Some(false));
    assert_eq!(report.exit_code(), core_sync::report::EXIT_SAVE_FAILED);
    assert!(memory.contains("Finance/Sales/Workbook w1__w1.twbx"));
    assert!(!memory.contains(STATE_KEY));
}

#[tokio::test]
async fn test_extract_fallback_stays_within_attempt_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("down", "Sales", at(2, 9)).with_extract(true),
        workbook("broken", "Sales", at(2, 10)).with_extract(true),
    ]);
    inventory.fail("down", Fault::AlwaysTransient);
    inventory.fail("broken", Fault::Permanent);
    let config = config(&dir);

    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    let down = report.outcomes.iter().find(|o| o.id == "down").unwrap();
    assert_eq!(down.result, ItemResult::Failed);
    assert_eq!(down.attempts, 3);
    assert_eq!(inventory.downloads_of("down"), 3);

    // One attempt with the extract, the rest of the budget without it
    let broken = report.outcomes.iter().find(|o| o.id == "broken").unwrap();
    assert_eq!(broken.result, ItemResult::Failed);
    assert_eq!(broken.attempts, 2);
    assert_eq!(inventory.downloads_of("broken"), 2);
}

#[tokio::test]
async fn test_degraded_upload_keeps_previous_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![workbook("w1", "Sales", at(2, 9)).with_extract(true)]);
    let mut config = config(&dir);
    config.removal_policy = RemovalPolicy::Delete;
    let full_key = "Finance/Sales/Workbook w1__w1.twbx";

    coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert!(store.contains(full_key));

    inventory.set_listing(vec![workbook("w1", "Sales", at(3, 9)).with_extract(true)]);
    inventory.fail("w1", Fault::ExtractOnly);

    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert_eq!(outcome_result(&report, "w1"), ItemResult::Succeeded);
    assert!(store.contains("Finance/Sales/Workbook w1__w1.twb"));

    let entry = stored_snapshot(&store).get("w1").cloned().unwrap();
    assert_eq!(entry.destination_key, full_key);
    assert_eq!(entry.updated_at, at(2, 9));
    assert!(store.contains(&entry.destination_key));
    assert_eq!(store.delete_count(), 0);
}

#[tokio::test]
async fn test_unusable_listing_entry_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(2, 10)),
    ]);
    let mut config = config(&dir);
    config.removal_policy = RemovalPolicy::Delete;

    coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    inventory.set_listing(vec![workbook("w2", "Sales", at(3, 10))]);
    inventory.reject("w1", "Sales");

    for _ in 0..3 {
        let report = coordinator(&inventory, store.clone())
            .run_backup(SITE, &config)
            .await
            .unwrap();

        let w1 = report.outcomes.iter().find(|o| o.id == "w1").unwrap();
        assert_eq!(w1.result, ItemResult::Failed);
        assert!(w1.error_detail.as_deref().unwrap().contains("yesterday"));
        assert_eq!(report.removed(), 0);
        assert_eq!(report.exit_code(), EXIT_UPLOAD_FAILED);
        assert_eq!(report.snapshot_saved, Some(true));
    }

    let snapshot = stored_snapshot(&store);
    assert_eq!(snapshot.get("w1").unwrap().absent_runs, 0);
    assert_eq!(snapshot.get("w2").unwrap().updated_at, at(3, 10));
    assert!(store.contains("Finance/Sales/Workbook w1__w1.twbx"));
}

#[tokio::test]
async fn test_duplicate_items_run_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let source = workbook("w1", "Sales", at(2, 9));
    let inventory = ScriptedInventory::new(vec![source.clone()]);
    let config = config(&dir);

    let item = ChangeItem {
        id: "w1".to_string(),
        action: ChangeAction::Upload,
        source: Some(source.clone()),
        previous: None,
        tags: TagMapper::from_config(&config).map(&source).tags,
        tag_warnings: Vec::new(),
    };
    let pipeline = UploadPipeline::new(
        inventory.clone(),
        store.clone(),
        Arc::new(ManualClock::new(at(2, 12))),
        &config,
    );

    let run = pipeline
        .run(SITE, vec![item.clone(), item], 4, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.outcomes.len(), 2);
    let skipped: Vec<_> = run
        .outcomes
        .iter()
        .filter(|o| o.result == ItemResult::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].error_detail.as_deref(), Some("duplicate"));
    assert_eq!(inventory.downloads_of("w1"), 1);
    assert_eq!(store.put_count(), 1);
}

#[tokio::test]
async fn test_cancellation_lets_in_flight_items_finish_within_grace() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("quick", "Sales", at(2, 9)),
        workbook("slow", "Sales", at(2, 10)),
        workbook("stuck", "Sales", at(2, 11)),
    ]);
    inventory.fail("slow", Fault::Slow(Duration::from_millis(200)));
    inventory.fail("stuck", Fault::Hang);
    let mut config = config(&dir);
    config.grace_period = Duration::from_millis(500);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator(&inventory, store.clone())
            .with_cancellation_token(token)
            .run_backup(SITE, &config),
    )
    .await
    .expect("run stops after the grace period")
    .unwrap();

    assert_eq!(outcome_result(&report, "quick"), ItemResult::Succeeded);
    assert_eq!(outcome_result(&report, "slow"), ItemResult::Succeeded);
    assert_eq!(report.missing, vec!["stuck"]);
    assert_eq!(report.exit_code(), EXIT_INCOMPLETE);
    assert!(!store.contains(STATE_KEY));
}

#[tokio::test]
async fn test_cancellation_abandons_item_waiting_to_retry() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![workbook("w1", "Sales", at(2, 9))]);
    inventory.fail("w1", Fault::AlwaysTransient);
    let mut config = config(&dir);
    config.initial_backoff = Duration::from_secs(60);
    config.max_backoff = Duration::from_secs(60);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator(&inventory, store.clone())
            .with_cancellation_token(token)
            .run_backup(SITE, &config),
    )
    .await
    .expect("backoff sleep is interrupted")
    .unwrap();

    assert_eq!(inventory.downloads_of("w1"), 1);
    assert!(report.outcomes.is_empty());
    assert_eq!(report.missing, vec!["w1"]);
    assert_eq!(report.exit_code(), EXIT_INCOMPLETE);
}

#[tokio::test]
async fn test_retag_of_missing_object_uploads_it_again() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![workbook("w1", "Sales", at(2, 9))]);
    let config = config(&dir);
    let key = "Finance/Sales/Workbook w1__w1.twbx";

    coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    store.delete(key).await.unwrap();

    inventory.set_listing(vec![
        workbook("w1", "Sales", at(2, 9)).with_description("moved to lifecycle bucket")
    ]);
    let report = coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    let w1 = report.outcomes.iter().find(|o| o.id == "w1").unwrap();
    assert_eq!(w1.action, ChangeAction::Upload);
    assert_eq!(w1.result, ItemResult::Succeeded);
    assert!(w1.warnings.iter().any(|w| w.contains("missing from destination")));
    assert_eq!(inventory.downloads_of("w1"), 2);
    assert_eq!(
        store.tags(key).unwrap()["tab_description"],
        "moved to lifecycle bucket"
    );
    assert_eq!(stored_snapshot(&store).get("w1").unwrap().destination_key, key);
}

#[tokio::test]
async fn test_retained_removal_touches_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryObjectStore::new());
    let inventory = ScriptedInventory::new(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(2, 10)),
    ]);
    let config = config(&dir);
    assert_eq!(config.removal_policy, RemovalPolicy::Retain);
    let gone_key = "Finance/Sales/Workbook w2__w2.twbx";

    coordinator(&inventory, store.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    inventory.set_listing(vec![workbook("w1", "Sales", at(2, 9))]);
    for _ in 0..2 {
        coordinator(&inventory, store.clone())
            .run_backup(SITE, &config)
            .await
            .unwrap();
    }

    assert!(store.contains(gone_key));
    assert_eq!(store.touch_count(), 1);
    assert_eq!(store.delete_count(), 0);
    assert!(stored_snapshot(&store).get("w2").is_none());
}

#[tokio::test]
async fn test_stale_objects_are_refreshed_after_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(2, 12)));
    let store = Arc::new(InMemoryObjectStore::with_clock(clock.clone()));
    let inventory = ScriptedInventory::new(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(2, 10)),
    ]);
    let mut config = config(&dir);
    config.staleness_threshold = Some(Duration::from_secs(7 * 24 * 3600));

    let first = coordinator(&inventory, store.clone())
        .with_clock(clock.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();
    assert_eq!(first.refreshed, 0);

    clock.advance(chrono::Duration::days(10));
    inventory.set_listing(vec![
        workbook("w1", "Sales", at(2, 9)),
        workbook("w2", "Sales", at(2, 10)).with_description("edited"),
    ]);

    let second = coordinator(&inventory, store.clone())
        .with_clock(clock.clone())
        .run_backup(SITE, &config)
        .await
        .unwrap();

    // w2 was just retagged, so only w1 is touched
    assert_eq!(second.refreshed, 1);
    assert_eq!(second.refresh_failed, 0);
    assert_eq!(store.touch_count(), 1);
    assert_eq!(
        store.last_modified("Finance/Sales/Workbook w1__w1.twbx"),
        Some(clock.now())
    );
    assert_eq!(
        stored_snapshot(&store).get("w1").unwrap().last_modified,
        Some(clock.now())
    );
}
