//! Full backup runner: snapshot, then upload.

use bridge_traits::{
    object_store::{ObjectBody, ObjectStore, TagSet},
    snapshot::{SnapshotRequest, SnapshotTrigger},
    ErrorContext,
};
use bytes::Bytes;
use core_runtime::config::FullBackupSection;
use core_runtime::events::{CoreEvent, EventBus, FullBackupEvent};
use core_runtime::Telemetry;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FullBackupError, Result};

/// Archive extension written by `tsm maintenance backup`
pub const BACKUP_EXTENSION: &str = "tsbak";

/// Printed by the snapshot tool once the archive is complete
pub const SUCCESS_MARKER: &str = "Backup written to ";

const HASH_BUFFER_SIZE: usize = 256 * 1024;

/// `0` when the tool reported a written archive, `1` otherwise.
///
/// The tool's exit code alone is not trusted.
pub fn result_code(stdout: &str) -> i32 {
    if stdout.contains(SUCCESS_MARKER) {
        0
    } else {
        1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResult {
    pub exit_code: Option<i32>,
    pub result_code: i32,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl SnapshotResult {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

/// Outcome of one archive upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub file_name: String,
    pub bytes: u64,
    pub duration: Duration,
    /// Hex sha256, present once the archive is uploaded
    pub sha256: Option<String>,
    pub error: Option<String>,
}

impl FileUpload {
    pub fn result_code(&self) -> i32 {
        if self.error.is_none() {
            0
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub files: Vec<FileUpload>,
}

impl UploadSummary {
    pub fn uploaded(&self) -> usize {
        self.files.iter().filter(|f| f.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.uploaded()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullBackupReport {
    /// `None` for upload-only runs
    pub snapshot: Option<SnapshotResult>,
    pub uploads: UploadSummary,
}

impl FullBackupReport {
    pub fn exit_code(&self) -> i32 {
        let snapshot_failed = self.snapshot.as_ref().is_some_and(|s| !s.is_success());
        if snapshot_failed || self.uploads.failed() > 0 {
            1
        } else {
            0
        }
    }
}

/// Drives one full-server backup against one bucket.
pub struct FullBackupRunner {
    trigger: Arc<dyn SnapshotTrigger>,
    store: Arc<dyn ObjectStore>,
    telemetry: Telemetry,
    event_bus: Option<EventBus>,
    settings: FullBackupSection,
}

impl FullBackupRunner {
    /// `store` must already be bound to `settings.bucket_name`.
    pub fn new(
        trigger: Arc<dyn SnapshotTrigger>,
        store: Arc<dyn ObjectStore>,
        settings: FullBackupSection,
    ) -> Self {
        let telemetry = Telemetry::disabled(settings.telemetry_prefix.clone());
        Self {
            trigger,
            store,
            telemetry,
            event_bus: None,
            settings,
        }
    }

    /// Report through `telemetry`, re-prefixed with the configured prefix.
    pub fn with_telemetry(mut self, telemetry: &Telemetry) -> Self {
        self.telemetry = telemetry.with_prefix(self.settings.telemetry_prefix.clone());
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn emit(&self, event: FullBackupEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit(CoreEvent::FullBackup(event)).ok();
        }
    }

    /// Take a snapshot, then upload whatever archives are on disk.
    ///
    /// Uploads run even when the snapshot failed, so that archives left over
    /// from earlier runs still leave the host.
    #[instrument(skip(self))]
    pub async fn backup(&self) -> Result<FullBackupReport> {
        self.telemetry.heartbeat().await;
        let snapshot = self.snapshot().await?;
        let uploads = self.upload().await?;
        let report = FullBackupReport {
            snapshot: Some(snapshot),
            uploads,
        };
        self.telemetry.flush().await;
        Ok(report)
    }

    /// Upload-only run.
    pub async fn upload_only(&self) -> Result<FullBackupReport> {
        let uploads = self.upload().await?;
        self.telemetry.flush().await;
        Ok(FullBackupReport {
            snapshot: None,
            uploads,
        })
    }

    /// Run the snapshot tool and report its result.
    pub async fn snapshot(&self) -> Result<SnapshotResult> {
        let request = SnapshotRequest {
            file_name: self.settings.backup_file.clone(),
            append_timestamp: self.settings.append_timestamp,
            multithreaded: self.settings.multithreaded,
        };

        info!(file = %request.file_name, multithreaded = request.multithreaded, "Starting snapshot");
        self.emit(FullBackupEvent::SnapshotStarted {
            file_name: request.file_name.clone(),
        });

        let output = match self.trigger.trigger(&request).await {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Snapshot tool could not run");
                self.telemetry
                    .capture_error(ErrorContext::new(format!("snapshot tool: {}", e)))
                    .await;
                return Err(FullBackupError::Snapshot(e));
            }
        };

        let result = SnapshotResult {
            exit_code: output.exit_code,
            result_code: result_code(&output.stdout),
            duration: output.duration,
            stdout: output.stdout,
            stderr: output.stderr,
        };

        debug!(stdout = %result.stdout, stderr = %result.stderr, "Snapshot tool output");
        info!(
            duration_secs = result.duration.as_secs(),
            result_code = result.result_code,
            exit_code = ?result.exit_code,
            "Snapshot finished"
        );

        if result.is_success() {
            self.telemetry
                .metric("tsm.backup_duration", result.duration.as_secs())
                .await;
        } else {
            error!(
                "Snapshot did not report a written archive:\n{}{}",
                result.stdout, result.stderr
            );
        }
        self.telemetry
            .metric("tsm.backup_result_code", result.result_code)
            .await;
        self.telemetry
            .metric("tsm.exit_code", result.exit_code.unwrap_or(-1))
            .await;

        self.emit(FullBackupEvent::SnapshotFinished {
            exit_code: result.exit_code,
            result_code: result.result_code,
            duration_secs: result.duration.as_secs(),
        });

        Ok(result)
    }

    /// Upload every archive in the backup directory.
    pub async fn upload(&self) -> Result<UploadSummary> {
        let archives = list_archives(&self.settings.backup_dir).await?;
        info!(
            count = archives.len(),
            bucket = %self.settings.bucket_name,
            "Uploading snapshot archives"
        );

        let mut summary = UploadSummary::default();
        for path in archives {
            let upload = self.upload_archive(&path).await;
            self.report_upload(&upload).await;
            summary.files.push(upload);
        }
        Ok(summary)
    }

    async fn upload_archive(&self, path: &Path) -> FileUpload {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        let started = Instant::now();

        info!(
            file = %file_name,
            size_mb = bytes / (1024 * 1024),
            bucket = %self.settings.bucket_name,
            "Uploading archive"
        );

        let mut upload = FileUpload {
            file_name: file_name.clone(),
            bytes,
            duration: Duration::ZERO,
            sha256: None,
            error: None,
        };

        match self.ship(path, &file_name).await {
            Ok(sha256) => {
                upload.duration = started.elapsed();
                upload.sha256 = Some(sha256);
                info!(path = %path.display(), "Removing uploaded archive");
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %e, "Uploaded archive could not be removed");
                }
            }
            Err(message) => {
                error!(file = %file_name, error = %message, "Archive upload failed");
                upload.error = Some(message);
            }
        }
        upload
    }

    /// Upload the archive and its checksum sidecar; returns the hex digest.
    async fn ship(&self, path: &Path, file_name: &str) -> std::result::Result<String, String> {
        let digest = sha256_file(path)
            .await
            .map_err(|e| format!("checksum {}: {}", path.display(), e))?;
        debug!(file = %file_name, sha256 = %digest, "Checksum computed");

        self.store
            .put(file_name, ObjectBody::File(path.to_path_buf()), &TagSet::new())
            .await
            .map_err(|e| e.to_string())?;

        let sidecar_key = format!("{}.sha256sum.txt", file_name);
        let sidecar = Bytes::from(format!("{}  {}\n", digest, file_name));
        self.store
            .put_object(&sidecar_key, sidecar)
            .await
            .map_err(|e| format!("{}: {}", sidecar_key, e))?;

        Ok(digest)
    }

    async fn report_upload(&self, upload: &FileUpload) {
        match &upload.error {
            None => {
                self.telemetry.metric("backup_file_size", upload.bytes).await;
                self.telemetry
                    .metric("upload_duration", upload.duration.as_secs())
                    .await;
                self.emit(FullBackupEvent::FileUploaded {
                    file_name: upload.file_name.clone(),
                    bytes: upload.bytes,
                });
            }
            Some(message) => {
                self.telemetry
                    .capture_error(
                        ErrorContext::new(message.clone()).with_tag("file", &upload.file_name),
                    )
                    .await;
                self.emit(FullBackupEvent::FileFailed {
                    file_name: upload.file_name.clone(),
                    message: message.clone(),
                });
            }
        }
        self.telemetry
            .metric("upload_result_code", upload.result_code())
            .await;
    }
}

/// Regular `*.tsbak` files directly inside `dir`, sorted by name.
async fn list_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let dir_error = |source| FullBackupError::BackupDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(dir_error)?;
    let mut archives = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(dir_error)? {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        let is_archive = path
            .extension()
            .is_some_and(|ext| ext == BACKUP_EXTENSION);
        if is_file && is_archive {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::InMemoryObjectStore;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::snapshot::SnapshotOutput;
    use bridge_traits::{MetricValue, TelemetrySink};
    use std::sync::Mutex;

    struct FakeTsm {
        dir: PathBuf,
        stdout: &'static str,
        exit_code: Option<i32>,
        requests: Mutex<Vec<SnapshotRequest>>,
    }

    #[async_trait]
    impl SnapshotTrigger for FakeTsm {
        async fn trigger(&self, request: &SnapshotRequest) -> BridgeResult<SnapshotOutput> {
            self.requests.lock().unwrap().push(request.clone());
            if self.stdout.contains(SUCCESS_MARKER) {
                let path = self.dir.join(format!("{}.tsbak", request.file_name));
                std::fs::write(path, b"archive-bytes").unwrap();
            }
            Ok(SnapshotOutput {
                exit_code: self.exit_code,
                stdout: self.stdout.to_string(),
                stderr: String::new(),
                duration: Duration::from_secs(42),
            })
        }
    }

    #[derive(Default)]
    struct Recording {
        metrics: Mutex<Vec<(String, MetricValue)>>,
    }

    impl Recording {
        fn value(&self, key: &str) -> Option<MetricValue> {
            self.metrics
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }

        fn count(&self, key: &str) -> usize {
            self.metrics.lock().unwrap().iter().filter(|(k, _)| k == key).count()
        }
    }

    #[async_trait]
    impl TelemetrySink for Recording {
        async fn heartbeat(&self, name: &str) -> BridgeResult<()> {
            self.metric(name, MetricValue::Int(1)).await
        }

        async fn metric(&self, name: &str, value: MetricValue) -> BridgeResult<()> {
            self.metrics.lock().unwrap().push((name.to_string(), value));
            Ok(())
        }

        async fn capture_error(&self, _context: ErrorContext) -> BridgeResult<()> {
            Ok(())
        }
    }

    /// Fails `put` for keys containing `poison`.
    struct FlakyStore {
        inner: InMemoryObjectStore,
        poison: &'static str,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(&self, key: &str, body: ObjectBody, tags: &TagSet) -> BridgeResult<()> {
            if key.contains(self.poison) {
                return Err(BridgeError::AccessDenied(key.to_string()));
            }
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
            self.inner.put_object(key, body).await
        }
    }

    fn settings(dir: &Path) -> FullBackupSection {
        FullBackupSection {
            backup_file: "ts_backup".to_string(),
            append_timestamp: false,
            multithreaded: true,
            backup_dir: dir.to_path_buf(),
            bucket_name: "tableau-full".to_string(),
            telemetry_prefix: "full-backup2s3".to_string(),
        }
    }

    fn tsm(dir: &Path, stdout: &'static str) -> Arc<FakeTsm> {
        Arc::new(FakeTsm {
            dir: dir.to_path_buf(),
            stdout,
            exit_code: Some(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_result_code_requires_marker() {
        assert_eq!(result_code("Backup written to '/x/ts_backup.tsbak'"), 0);
        assert_eq!(result_code("Job failed"), 1);
    }

    #[tokio::test]
    async fn test_backup_uploads_archive_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let sink = Arc::new(Recording::default());
        let trigger = tsm(dir.path(), "Backup written to '/backups/ts_backup.tsbak'");

        let runner = FullBackupRunner::new(trigger.clone(), store.clone(), settings(dir.path()))
            .with_telemetry(&Telemetry::new(sink.clone(), "ignored"));
        let report = runner.backup().await.unwrap();

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.uploads.uploaded(), 1);
        assert!(trigger.requests.lock().unwrap()[0].multithreaded);

        let sha = hex::encode(Sha256::digest(b"archive-bytes"));
        assert_eq!(
            store.object("ts_backup.tsbak").unwrap().body,
            Bytes::from_static(b"archive-bytes")
        );
        assert_eq!(
            store.object("ts_backup.tsbak.sha256sum.txt").unwrap().body,
            Bytes::from(format!("{}  ts_backup.tsbak\n", sha))
        );
        assert!(!dir.path().join("ts_backup.tsbak").exists());

        assert_eq!(sink.value("full-backup2s3.heartbeat"), Some(MetricValue::Int(1)));
        assert_eq!(
            sink.value("full-backup2s3.tsm.backup_duration"),
            Some(MetricValue::Int(42))
        );
        assert_eq!(
            sink.value("full-backup2s3.tsm.backup_result_code"),
            Some(MetricValue::Int(0))
        );
        assert_eq!(
            sink.value("full-backup2s3.backup_file_size"),
            Some(MetricValue::Int(13))
        );
        assert_eq!(
            sink.value("full-backup2s3.upload_result_code"),
            Some(MetricValue::Int(0))
        );
    }

    #[tokio::test]
    async fn test_snapshot_without_marker_fails_but_still_uploads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.tsbak"), b"left over").unwrap();
        let store = Arc::new(InMemoryObjectStore::new());
        let sink = Arc::new(Recording::default());

        let runner = FullBackupRunner::new(
            tsm(dir.path(), "Job failed: not enough disk space"),
            store.clone(),
            settings(dir.path()),
        )
        .with_telemetry(&Telemetry::new(sink.clone(), "ignored"));
        let report = runner.backup().await.unwrap();

        assert_eq!(report.snapshot.as_ref().unwrap().result_code, 1);
        assert_eq!(report.exit_code(), 1);
        assert!(store.contains("old.tsbak"));
        assert_eq!(sink.count("full-backup2s3.tsm.backup_duration"), 0);
        assert_eq!(
            sink.value("full-backup2s3.tsm.exit_code"),
            Some(MetricValue::Int(0))
        );
    }

    #[tokio::test]
    async fn test_failed_file_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tsbak"), b"a").unwrap();
        std::fs::write(dir.path().join("bad.tsbak"), b"b").unwrap();
        std::fs::write(dir.path().join("c.tsbak"), b"c").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let store = Arc::new(FlakyStore {
            inner: InMemoryObjectStore::new(),
            poison: "bad",
        });
        let runner = FullBackupRunner::new(
            tsm(dir.path(), ""),
            store.clone(),
            settings(dir.path()),
        );
        let report = runner.upload_only().await.unwrap();

        let names: Vec<_> = report.uploads.files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.tsbak", "bad.tsbak", "c.tsbak"]);
        assert_eq!(report.uploads.failed(), 1);
        assert_eq!(report.exit_code(), 1);
        assert!(store.inner.contains("c.tsbak"));
        // Failed archive stays for the next run
        assert!(dir.path().join("bad.tsbak").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_backup_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let runner = FullBackupRunner::new(
            tsm(dir.path(), ""),
            Arc::new(InMemoryObjectStore::new()),
            settings(&missing),
        );
        assert!(matches!(
            runner.upload().await,
            Err(FullBackupError::BackupDir { .. })
        ));
    }
}
