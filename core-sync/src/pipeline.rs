//! # Upload Pipeline
//!
//! Executes a changeset with a bounded pool of tokio tasks.
//!
//! ## Overview
//!
//! Every [`ChangeItem`] runs in its own task behind a shared [`Semaphore`], so
//! at most `max_workers` transfers are in flight. Items are independent: a
//! failing item produces a `Failed` outcome and never stops the others. A
//! panicking worker is caught and reported as a failure of that item.
//!
//! Workers never see the snapshot. Each returns an [`UploadOutcome`] carrying
//! the [`StateUpdate`] the coordinator should fold in.
//!
//! ## Per-item work
//!
//! - `Upload`: download into a temp file under `work_dir` (removed on every
//!   exit path), hash it, `put` it with tags, then retire the previous key if
//!   it moved. Extract downloads that keep failing are retried without the
//!   extract, using the last attempt of the item's budget.
//! - `RetagOnly`: replace the tags of the existing object. A missing object
//!   escalates to a full upload.
//! - `MarkRemoved`: delete or touch the object depending on the removal
//!   policy, then drop the entry.
//!
//! ## Cancellation
//!
//! Once the token fires no new item is dispatched and no new attempt starts.
//! A worker sleeping between attempts gives up at once. Workers still inside
//! an attempt get `grace_period` to finish before they are aborted. Items
//! without an outcome are reported back as missing.

use crate::attempt::{ItemAttempt, RetryDecision, RetryPolicy};
use crate::diff::{ChangeAction, ChangeItem};
use crate::state::StateEntry;
use crate::{Result, SyncError};
use bridge_traits::{
    BridgeError, Clock, ObjectBody, ObjectStore, RejectedObject, SourceInventory, SourceObject, TagSet,
};
use core_runtime::{BackupConfig, RemovalPolicy};
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemResult {
    Succeeded,
    Failed,
    Skipped,
}

impl ItemResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemResult::Succeeded => "succeeded",
            ItemResult::Failed => "failed",
            ItemResult::Skipped => "skipped",
        }
    }
}

/// What the coordinator should do with the snapshot entry of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// Leave the prior entry (or its absence) untouched
    Keep,
    Put(StateEntry),
    Remove,
}

/// Terminal result of one change item.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub id: String,
    /// Action actually performed; a retag that escalated reports `Upload`
    pub action: ChangeAction,
    pub result: ItemResult,
    pub error_detail: Option<String>,
    /// Wall time across all attempts
    pub duration: Duration,
    pub bytes_transferred: u64,
    pub attempts: u32,
    pub warnings: Vec<String>,
    pub project_path: String,
    pub name: String,
    pub state_update: StateUpdate,
}

impl UploadOutcome {
    fn new(item: &ChangeItem, action: ChangeAction, result: ItemResult, started: Instant) -> Self {
        Self {
            id: item.id.clone(),
            action,
            result,
            error_detail: None,
            duration: started.elapsed(),
            bytes_transferred: 0,
            attempts: 0,
            warnings: item.tag_warnings.clone(),
            project_path: item.project_path().to_string(),
            name: item.name().to_string(),
            state_update: StateUpdate::Keep,
        }
    }

    fn failed(item: &ChangeItem, action: ChangeAction, started: Instant, detail: String) -> Self {
        let mut outcome = Self::new(item, action, ItemResult::Failed, started);
        outcome.error_detail = Some(detail);
        outcome
    }

    /// A listed object whose metadata could not be used. Its entry is kept.
    pub fn rejected(rejected: &RejectedObject) -> Self {
        Self {
            id: rejected.id.clone(),
            action: ChangeAction::Upload,
            result: ItemResult::Failed,
            error_detail: Some(format!("unusable metadata: {}", rejected.reason)),
            duration: Duration::ZERO,
            bytes_transferred: 0,
            attempts: 0,
            warnings: Vec::new(),
            project_path: rejected.project_path.clone(),
            name: rejected.name.clone(),
            state_update: StateUpdate::Keep,
        }
    }

    fn duplicate(item: &ChangeItem) -> Self {
        let mut outcome = Self::new(item, item.action, ItemResult::Skipped, Instant::now());
        outcome.error_detail = Some("duplicate".to_string());
        outcome.warnings.clear();
        outcome
    }

    fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// Outcomes of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineRun {
    pub outcomes: Vec<UploadOutcome>,
    /// The token fired before every item finished
    pub cancelled: bool,
}

// ============================================================================
// Attempt plumbing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Download,
    Upload,
    Tag,
    Delete,
    Touch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Download => "download",
            Stage::Upload => "upload",
            Stage::Tag => "tag",
            Stage::Delete => "delete",
            Stage::Touch => "touch",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct StepError {
    stage: Stage,
    error: BridgeError,
}

impl StepError {
    fn at(stage: Stage) -> impl FnOnce(BridgeError) -> StepError {
        move |error| StepError { stage, error }
    }

    fn internal(error: SyncError) -> Self {
        StepError {
            stage: Stage::Upload,
            error: BridgeError::OperationFailed(error.to_string()),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

enum Attempted<T> {
    Done(T),
    Failed(StepError),
    /// Cancelled between attempts
    Abandoned,
}

struct Transferred {
    key: String,
    bytes: u64,
    content_hash: String,
}

// ============================================================================
// Pipeline
// ============================================================================

struct Worker {
    inventory: Arc<dyn SourceInventory>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    removal_policy: RemovalPolicy,
    ignore_extract_errors_tag: String,
    work_dir: PathBuf,
}

#[derive(Clone)]
pub struct UploadPipeline {
    worker: Arc<Worker>,
    grace_period: Duration,
}

impl UploadPipeline {
    pub fn new(
        inventory: Arc<dyn SourceInventory>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        config: &BackupConfig,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                inventory,
                store,
                clock,
                retry: RetryPolicy::from_config(config),
                removal_policy: config.removal_policy,
                ignore_extract_errors_tag: config.ignore_extract_errors_tag.clone(),
                work_dir: config.work_dir.clone(),
            }),
            grace_period: config.grace_period,
        }
    }

    /// Execute `items` with at most `max_workers` in flight.
    ///
    /// Returns one outcome per item that reached a terminal state. Only a
    /// failure to prepare the work directory is an error for the whole run.
    pub async fn run(
        &self,
        site: &str,
        items: Vec<ChangeItem>,
        max_workers: usize,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        tokio::fs::create_dir_all(&self.worker.work_dir).await?;

        let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut run = PipelineRun::default();
        let mut dispatched: HashSet<String> = HashSet::with_capacity(items.len());

        info!(site, items = items.len(), max_workers, "Starting upload pipeline");

        for item in items {
            if !dispatched.insert(item.id.clone()) {
                warn!(site, id = %item.id, "Duplicate change item skipped");
                run.outcomes.push(UploadOutcome::duplicate(&item));
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = Arc::clone(&self.worker);
            let site = site.to_string();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let id = item.id.clone();
                let action = item.action;
                let started = Instant::now();
                let shadow = item.clone();

                match AssertUnwindSafe(worker.execute(&site, item, &cancel))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(site = %site, id = %id, "Worker panicked");
                        Some(UploadOutcome::failed(
                            &shadow,
                            action,
                            started,
                            "worker panicked".to_string(),
                        ))
                    }
                }
            });
        }

        let grace = self.grace_period;
        let deadline = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Some(outcome))) => run.outcomes.push(outcome),
                    Some(Ok(None)) => {}
                    Some(Err(e)) => warn!(site, error = %e, "Worker task ended abnormally"),
                },
                _ = &mut deadline => {
                    warn!(site, in_flight = tasks.len(), "Grace period elapsed, abandoning in-flight items");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok(Some(outcome)) = joined {
                            run.outcomes.push(outcome);
                        }
                    }
                    break;
                }
            }
        }

        run.cancelled = cancel.is_cancelled();
        Ok(run)
    }
}

impl Worker {
    /// Run one item to its terminal outcome. `None` means it was abandoned.
    async fn execute(
        &self,
        site: &str,
        item: ChangeItem,
        cancel: &CancellationToken,
    ) -> Option<UploadOutcome> {
        let started = Instant::now();
        let outcome = match item.action {
            ChangeAction::Upload => self.upload(site, &item, cancel, started, Vec::new()).await,
            ChangeAction::RetagOnly => self.retag(site, &item, cancel, started).await,
            ChangeAction::MarkRemoved => self.remove(&item, cancel, started).await,
        }?;

        match outcome.result {
            ItemResult::Failed => warn!(
                site,
                id = %outcome.id,
                action = %outcome.action,
                attempts = outcome.attempts,
                error = outcome.error_detail.as_deref().unwrap_or_default(),
                "Change item failed"
            ),
            _ => info!(
                site,
                id = %outcome.id,
                action = %outcome.action,
                attempts = outcome.attempts,
                bytes = outcome.bytes_transferred,
                "Change item finished"
            ),
        }
        Some(outcome)
    }

    /// Drive `op` through the attempt state machine.
    async fn retrying<T, F, Fut>(
        &self,
        attempt: &mut ItemAttempt,
        id: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StepError>>,
    {
        let mut n = match attempt.begin() {
            Ok(n) => n,
            Err(e) => return Attempted::Failed(StepError::internal(e)),
        };

        loop {
            if cancel.is_cancelled() {
                debug!(id, attempt = n, "Cancelled before attempt");
                return Attempted::Abandoned;
            }

            debug!(id, attempt = n, "Attempt started");
            let err = match op().await {
                Ok(value) => {
                    return match attempt.succeed() {
                        Ok(()) => Attempted::Done(value),
                        Err(e) => Attempted::Failed(StepError::internal(e)),
                    };
                }
                Err(err) => err,
            };

            match attempt.record_failure(err.error.is_transient()) {
                Ok(RetryDecision::Retry { next_attempt }) => {
                    let delay = self.retry.delay_for(next_attempt);
                    warn!(id, attempt = n, error = %err, delay_ms = delay.as_millis() as u64, "Attempt failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Attempted::Abandoned,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    n = match attempt.retry() {
                        Ok(n) => n,
                        Err(e) => return Attempted::Failed(StepError::internal(e)),
                    };
                }
                Ok(RetryDecision::GiveUp) => {
                    warn!(id, attempt = n, error = %err, "Giving up");
                    return Attempted::Failed(err);
                }
                Err(e) => return Attempted::Failed(StepError::internal(e)),
            }
        }
    }

    async fn upload(
        &self,
        site: &str,
        item: &ChangeItem,
        cancel: &CancellationToken,
        started: Instant,
        mut warnings: Vec<String>,
    ) -> Option<UploadOutcome> {
        let Some(source) = item.source.as_ref() else {
            return Some(UploadOutcome::failed(
                item,
                ChangeAction::Upload,
                started,
                "upload without source object".to_string(),
            ));
        };

        let with_extract = source.has_extract;
        // The last attempt is kept for the download without extract
        let mut attempt = if with_extract {
            self.retry.new_attempt().reserve(1)
        } else {
            self.retry.new_attempt()
        };

        let first = self
            .retrying(&mut attempt, &item.id, cancel, || {
                self.transfer(site, source, &item.tags, with_extract)
            })
            .await;

        let (transferred, degraded) = match first {
            Attempted::Done(t) => (t, false),
            Attempted::Abandoned => return None,
            Attempted::Failed(err)
                if with_extract
                    && attempt.remaining() > 0
                    && (err.stage == Stage::Download || err.error.is_transient()) =>
            {
                let without_extract = err.stage == Stage::Download;
                if without_extract {
                    warn!(site, id = %item.id, error = %err, "Download with extract failed, retrying without extract");
                    warnings.push(format!("downloaded without extract after: {}", err));
                }
                if let Err(e) = attempt.restart_phase() {
                    let mut outcome =
                        UploadOutcome::failed(item, ChangeAction::Upload, started, e.to_string())
                            .with_warnings(warnings);
                    outcome.attempts = attempt.attempts();
                    return Some(outcome);
                }
                match self
                    .retrying(&mut attempt, &item.id, cancel, || {
                        self.transfer(site, source, &item.tags, !without_extract)
                    })
                    .await
                {
                    Attempted::Done(t) => (t, without_extract),
                    Attempted::Abandoned => return None,
                    Attempted::Failed(err) => {
                        let mut outcome =
                            UploadOutcome::failed(item, ChangeAction::Upload, started, err.to_string())
                                .with_warnings(warnings);
                        outcome.attempts = attempt.attempts();
                        return Some(outcome);
                    }
                }
            }
            Attempted::Failed(err) => {
                let mut outcome =
                    UploadOutcome::failed(item, ChangeAction::Upload, started, err.to_string())
                        .with_warnings(warnings);
                outcome.attempts = attempt.attempts();
                return Some(outcome);
            }
        };

        let advance = !degraded || source.has_label(&self.ignore_extract_errors_tag);

        // Snapshot entries only ever point at stored objects
        if advance {
            if let Some(previous) = item.previous.as_ref() {
                if previous.destination_key != transferred.key {
                    self.retire_key(&previous.destination_key, &mut warnings).await;
                }
            }
        }

        let state_update = if advance {
            StateUpdate::Put(StateEntry {
                destination_key: transferred.key,
                updated_at: source.updated_at,
                content_hash: transferred.content_hash,
                tags: item.tags.clone(),
                project_path: source.project_path.clone(),
                name: source.name.clone(),
                last_modified: Some(self.clock.now()),
                absent_runs: 0,
            })
        } else {
            warnings.push("state not advanced: workbook stored without its extract".to_string());
            StateUpdate::Keep
        };

        let mut outcome = UploadOutcome::new(item, ChangeAction::Upload, ItemResult::Succeeded, started)
            .with_warnings(warnings);
        outcome.bytes_transferred = transferred.bytes;
        outcome.attempts = attempt.attempts();
        outcome.state_update = state_update;
        Some(outcome)
    }

    /// One download-and-put attempt. The temp file is removed when this returns.
    async fn transfer(
        &self,
        site: &str,
        source: &SourceObject,
        tags: &TagSet,
        include_extract: bool,
    ) -> std::result::Result<Transferred, StepError> {
        let download = self
            .inventory
            .download(site, &source.id, include_extract)
            .await
            .map_err(StepError::at(Stage::Download))?;
        let extension = download.extension().to_string();

        let temp = tempfile::Builder::new()
            .prefix("wb-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.work_dir)
            .map_err(|e| StepError::at(Stage::Download)(e.into()))?;

        let (bytes, content_hash) = copy_hashing(download.body, temp.path().to_path_buf())
            .await
            .map_err(|e| StepError::at(Stage::Download)(e.into()))?;

        let key = destination_key(site, source, &extension);
        self.store
            .put(&key, ObjectBody::File(temp.path().to_path_buf()), tags)
            .await
            .map_err(StepError::at(Stage::Upload))?;

        debug!(site, id = %source.id, key = %key, bytes, "Object stored");
        Ok(Transferred {
            key,
            bytes,
            content_hash,
        })
    }

    /// Apply the removal policy to a key the workbook no longer lives at.
    async fn retire_key(&self, key: &str, warnings: &mut Vec<String>) {
        let result = match self.removal_policy {
            RemovalPolicy::Delete => self.store.delete(key).await,
            RemovalPolicy::Retain => self.store.touch_last_modified(key).await,
        };
        match result {
            Ok(()) => debug!(key, policy = ?self.removal_policy, "Previous key retired"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warnings.push(format!("previous key {} not retired: {}", key, e)),
        }
    }

    async fn retag(
        &self,
        site: &str,
        item: &ChangeItem,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Option<UploadOutcome> {
        let Some(previous) = item.previous.as_ref() else {
            return self.upload(site, item, cancel, started, Vec::new()).await;
        };

        let mut attempt = self.retry.new_attempt();
        let result = self
            .retrying(&mut attempt, &item.id, cancel, || async move {
                self.store
                    .update_tags(&previous.destination_key, &item.tags)
                    .await
                    .map_err(StepError::at(Stage::Tag))
            })
            .await;

        match result {
            Attempted::Done(()) => {
                let mut entry = previous.clone();
                entry.tags = item.tags.clone();
                entry.absent_runs = 0;
                if let Some(source) = item.source.as_ref() {
                    entry.project_path = source.project_path.clone();
                    entry.name = source.name.clone();
                }

                let mut outcome =
                    UploadOutcome::new(item, ChangeAction::RetagOnly, ItemResult::Succeeded, started);
                outcome.attempts = attempt.attempts();
                outcome.state_update = StateUpdate::Put(entry);
                Some(outcome)
            }
            Attempted::Abandoned => None,
            Attempted::Failed(err) if err.error.is_not_found() => {
                warn!(site, id = %item.id, key = %previous.destination_key, "Object missing from destination, uploading instead");
                let warnings = vec![format!(
                    "{} missing from destination, re-uploaded",
                    previous.destination_key
                )];
                self.upload(site, item, cancel, started, warnings).await
            }
            Attempted::Failed(err) => {
                let mut outcome =
                    UploadOutcome::failed(item, ChangeAction::RetagOnly, started, err.to_string());
                outcome.attempts = attempt.attempts();
                Some(outcome)
            }
        }
    }

    async fn remove(
        &self,
        item: &ChangeItem,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Option<UploadOutcome> {
        let Some(previous) = item.previous.as_ref() else {
            let mut outcome =
                UploadOutcome::new(item, ChangeAction::MarkRemoved, ItemResult::Succeeded, started);
            outcome.state_update = StateUpdate::Remove;
            return Some(outcome);
        };
        let key = previous.destination_key.as_str();
        let policy = self.removal_policy;

        let mut attempt = self.retry.new_attempt();
        let result = self
            .retrying(&mut attempt, &item.id, cancel, || async move {
                let (stage, result) = match policy {
                    RemovalPolicy::Delete => (Stage::Delete, self.store.delete(key).await),
                    RemovalPolicy::Retain => (Stage::Touch, self.store.touch_last_modified(key).await),
                };
                match result {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other.map_err(StepError::at(stage)),
                }
            })
            .await;

        match result {
            Attempted::Done(()) => {
                info!(id = %item.id, key, policy = ?policy, "Removed workbook handled");
                let mut outcome =
                    UploadOutcome::new(item, ChangeAction::MarkRemoved, ItemResult::Succeeded, started);
                outcome.attempts = attempt.attempts();
                outcome.state_update = StateUpdate::Remove;
                Some(outcome)
            }
            Attempted::Abandoned => None,
            Attempted::Failed(err) => {
                let mut outcome =
                    UploadOutcome::failed(item, ChangeAction::MarkRemoved, started, err.to_string());
                outcome.attempts = attempt.attempts();
                Some(outcome)
            }
        }
    }
}

/// Stream `body` into `path` and return its size and `sha256:<hex>` digest.
async fn copy_hashing(
    mut body: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    path: PathBuf,
) -> std::io::Result<(u64, String)> {
    let mut file = tokio::fs::File::create(&path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;

    Ok((total, format!("sha256:{}", hex::encode(hasher.finalize()))))
}

/// `{site}/{project_path}/{name}__{id}.{ext}`, with `/` in the name replaced.
pub fn destination_key(site: &str, source: &SourceObject, extension: &str) -> String {
    let name = source.name.replace('/', "_");
    let project = source.project_path.trim_matches('/');
    if project.is_empty() {
        format!("{}/{}__{}.{}", site, name, source.id, extension)
    } else {
        format!("{}/{}/{}__{}.{}", site, project, name, source.id, extension)
    }
}
