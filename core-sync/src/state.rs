//! # State Store
//!
//! Loads and saves the per-site snapshot of what is already in the
//! destination bucket.
//!
//! The snapshot lives as a single JSON object at `{site}/{state_object_name}`
//! in the same store as the workbooks. A single `put_object` replaces it
//! wholesale, so readers only ever see the previous or the new version.
//!
//! ## Formats
//!
//! ```json
//! {
//!   "site": "Finance",
//!   "generated_at": "2024-05-01T03:00:00Z",
//!   "version": 1,
//!   "entries": {
//!     "wb-1": {
//!       "destination_key": "Finance/Sales/Q1__wb-1.twbx",
//!       "updated_at": "2024-04-30T10:00:00Z",
//!       "content_hash_or_version_tag": "sha256:…",
//!       "tags": { "tab_id": "wb-1" }
//!     }
//!   }
//! }
//! ```
//!
//! Snapshots written by the older backup scripts (a map keyed by workbook
//! path) are converted on load. Anything else is refused.

use crate::attempt::RetryPolicy;
use crate::{Result, SyncError};
use bridge_traits::{Clock, ObjectStore, TagSet};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Attempts for snapshot reads and writes.
const STATE_IO_ATTEMPTS: u32 = 3;

/// Marker hash for entries imported from the legacy layout.
pub const LEGACY_HASH: &str = "legacy";

// ============================================================================
// Snapshot Model
// ============================================================================

/// Persisted record for one previously uploaded workbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub destination_key: String,
    /// Source `updated_at` observed at the last successful upload
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "content_hash_or_version_tag")]
    pub content_hash: String,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub name: String,
    /// Last upload or touch of the destination object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Consecutive listings that did not contain this id
    #[serde(default, skip_serializing_if = "is_zero")]
    pub absent_runs: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub site: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: BTreeMap<String, StateEntry>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl StateSnapshot {
    /// First-run snapshot with no entries.
    pub fn empty(site: impl Into<String>, generated_at: DateTime<Utc>) -> Self {
        Self {
            site: site.into(),
            generated_at,
            entries: BTreeMap::new(),
            version: SNAPSHOT_VERSION,
        }
    }

    pub fn get(&self, id: &str) -> Option<&StateEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Structural checks applied to every loaded and every saved snapshot.
    pub fn validate(&self, expected_site: &str) -> Result<()> {
        if self.site != expected_site {
            return Err(SyncError::StateConsistency {
                site: expected_site.to_string(),
                reason: format!("snapshot belongs to site '{}'", self.site),
            });
        }

        let prefix = format!("{}/", self.site);
        for (id, entry) in &self.entries {
            if id.is_empty() {
                return Err(SyncError::StateConsistency {
                    site: expected_site.to_string(),
                    reason: "entry with empty id".to_string(),
                });
            }
            if !entry.destination_key.starts_with(&prefix) {
                return Err(SyncError::StateConsistency {
                    site: expected_site.to_string(),
                    reason: format!(
                        "entry {} points outside the site: {}",
                        id, entry.destination_key
                    ),
                });
            }
        }

        Ok(())
    }
}

// ============================================================================
// Legacy Layout
// ============================================================================

/// One record of the upload-state file written by the older scripts.
#[derive(Debug, Deserialize)]
struct LegacyRecord {
    id: String,
    #[serde(default)]
    name: String,
    updated_at: String,
    #[serde(default)]
    upload_date: Option<String>,
    object_key: String,
}

const LEGACY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";
const LEGACY_DATE_FORMAT: &str = "%Y-%m-%d";

fn parse_legacy_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value, LEGACY_TIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_legacy_date(value: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(value, LEGACY_DATE_FORMAT).ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight))
}

/// Convert a legacy map (`workbook path → record`) into a snapshot.
fn convert_legacy(
    site: &str,
    records: BTreeMap<String, LegacyRecord>,
    now: DateTime<Utc>,
) -> Result<StateSnapshot> {
    let mut snapshot = StateSnapshot::empty(site, now);

    for (path, record) in records {
        let updated_at =
            parse_legacy_time(&record.updated_at).ok_or_else(|| SyncError::StateConsistency {
                site: site.to_string(),
                reason: format!("legacy entry {} has bad updated_at '{}'", path, record.updated_at),
            })?;

        let project_path = path
            .rsplit_once('/')
            .map(|(project, _)| project.to_string())
            .unwrap_or_default();

        let destination_key = if record.object_key.starts_with(&format!("{}/", site)) {
            record.object_key
        } else {
            format!("{}/{}", site, record.object_key.trim_start_matches('/'))
        };

        snapshot.entries.insert(
            record.id,
            StateEntry {
                destination_key,
                updated_at,
                content_hash: LEGACY_HASH.to_string(),
                tags: TagSet::new(),
                project_path,
                name: record.name,
                last_modified: record.upload_date.as_deref().and_then(parse_legacy_date),
                absent_runs: 0,
            },
        );
    }

    Ok(snapshot)
}

/// Decode a stored snapshot body, accepting the current and legacy layouts.
pub fn decode_snapshot(site: &str, body: &[u8], now: DateTime<Utc>) -> Result<StateSnapshot> {
    let current_err = match serde_json::from_slice::<StateSnapshot>(body) {
        Ok(snapshot) => {
            snapshot.validate(site)?;
            return Ok(snapshot);
        }
        Err(e) => e,
    };

    match serde_json::from_slice::<BTreeMap<String, LegacyRecord>>(body) {
        Ok(records) if !records.is_empty() => {
            info!(site, entries = records.len(), "Converting legacy upload state");
            let snapshot = convert_legacy(site, records, now)?;
            snapshot.validate(site)?;
            Ok(snapshot)
        }
        _ => Err(SyncError::StateConsistency {
            site: site.to_string(),
            reason: current_err.to_string(),
        }),
    }
}

// ============================================================================
// State Store
// ============================================================================

pub struct StateStore {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    object_name: String,
    retry: RetryPolicy,
}

impl StateStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        object_name: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            object_name: object_name.into(),
            retry: retry.with_max_attempts(STATE_IO_ATTEMPTS),
        }
    }

    pub fn key_for(&self, site: &str) -> String {
        format!("{}/{}", site, self.object_name)
    }

    /// Load the snapshot of `site`.
    ///
    /// A missing object yields an empty snapshot. Transient store failures are
    /// retried and then surfaced; they are never mistaken for a first run.
    #[instrument(skip(self))]
    pub async fn load(&self, site: &str) -> Result<StateSnapshot> {
        let key = self.key_for(site);
        let mut attempt = self.retry.new_attempt();
        attempt.begin()?;

        let body = loop {
            match self.store.get_object(&key).await {
                Ok(body) => break body,
                Err(e) if e.is_transient() => {
                    if let crate::attempt::RetryDecision::Retry { next_attempt } =
                        attempt.record_failure(true)?
                    {
                        warn!(key = %key, attempt = next_attempt - 1, error = %e, "Snapshot read failed, retrying");
                        tokio::time::sleep(self.retry.delay_for(next_attempt)).await;
                        attempt.retry()?;
                        continue;
                    }
                    return Err(SyncError::Store(e));
                }
                Err(e) => return Err(SyncError::Store(e)),
            }
        };

        match body {
            None => {
                info!(site, key = %key, "No snapshot found, starting from empty state");
                Ok(StateSnapshot::empty(site, self.clock.now()))
            }
            Some(bytes) => {
                let snapshot = decode_snapshot(site, &bytes, self.clock.now())?;
                debug!(site, entries = snapshot.len(), "Snapshot loaded");
                Ok(snapshot)
            }
        }
    }

    /// Replace the stored snapshot with `snapshot` in a single write.
    #[instrument(skip(self, snapshot), fields(site = %snapshot.site, entries = snapshot.len()))]
    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        snapshot.validate(&snapshot.site)?;

        let key = self.key_for(&snapshot.site);
        let body = Bytes::from(serde_json::to_vec_pretty(snapshot)?);
        let mut attempt = self.retry.new_attempt();
        attempt.begin()?;

        loop {
            match self.store.put_object(&key, body.clone()).await {
                Ok(()) => {
                    attempt.succeed()?;
                    info!(key = %key, "Snapshot saved");
                    return Ok(());
                }
                Err(e) => match attempt.record_failure(e.is_transient())? {
                    crate::attempt::RetryDecision::Retry { next_attempt } => {
                        warn!(key = %key, attempt = next_attempt - 1, error = %e, "Snapshot write failed, retrying");
                        tokio::time::sleep(self.retry.delay_for(next_attempt)).await;
                        attempt.retry()?;
                    }
                    crate::attempt::RetryDecision::GiveUp => return Err(SyncError::Store(e)),
                },
            }
        }
    }
}
