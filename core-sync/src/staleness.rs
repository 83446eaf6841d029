//! # Staleness Refresher
//!
//! Restarts the lifecycle clock of destination objects that have not been
//! written for longer than a threshold. Candidates come from the snapshot,
//! never from a bucket listing. Objects written in the current run are
//! skipped by the caller through `exclude`.

use crate::state::StateSnapshot;
use bridge_traits::{Clock, ObjectStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Touched ids with the time recorded for them
    pub refreshed: Vec<(String, DateTime<Utc>)>,
    /// Ids whose touch failed, with the error
    pub failed: Vec<(String, String)>,
}

impl RefreshSummary {
    pub fn count_refreshed(&self) -> usize {
        self.refreshed.len()
    }
}

pub struct StalenessRefresher {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
}

impl StalenessRefresher {
    pub fn new(store: Arc<dyn ObjectStore>, clock: Arc<dyn Clock>, concurrency: usize) -> Self {
        Self {
            store,
            clock,
            concurrency: concurrency.max(1),
        }
    }

    /// Ids of entries whose last write is older than `threshold`.
    ///
    /// Entries with no recorded write time count as stale.
    pub fn stale_ids(
        &self,
        snapshot: &StateSnapshot,
        threshold: Duration,
        exclude: &HashSet<String>,
    ) -> Vec<String> {
        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::days(i32::MAX as i64));

        snapshot
            .entries
            .iter()
            .filter(|(id, _)| !exclude.contains(*id))
            .filter(|(_, entry)| match entry.last_modified {
                None => true,
                Some(at) => now.signed_duration_since(at) >= threshold,
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn refresh(
        &self,
        site: &str,
        snapshot: &StateSnapshot,
        threshold: Duration,
        exclude: &HashSet<String>,
    ) -> RefreshSummary {
        let candidates = self.stale_ids(snapshot, threshold, exclude);
        if candidates.is_empty() {
            debug!(site, "No stale objects");
            return RefreshSummary::default();
        }

        info!(site, candidates = candidates.len(), "Refreshing stale objects");

        let targets: Vec<(String, String)> = candidates
            .into_iter()
            .filter_map(|id| {
                let key = snapshot.get(&id)?.destination_key.clone();
                Some((id, key))
            })
            .collect();

        let results: Vec<_> = stream::iter(targets)
            .map(|(id, key)| {
                let store = Arc::clone(&self.store);
                async move {
                    let result = store.touch_last_modified(&key).await;
                    (id, key, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = RefreshSummary::default();
        let touched_at = self.clock.now();
        for (id, key, result) in results {
            match result {
                Ok(()) => summary.refreshed.push((id, touched_at)),
                Err(e) => {
                    warn!(site, id = %id, key = %key, error = %e, "Staleness touch failed");
                    summary.failed.push((id, e.to_string()));
                }
            }
        }
        summary.refreshed.sort();
        summary.failed.sort();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateEntry;
    use bridge_traits::{ManualClock, TagSet};
    use chrono::TimeZone;

    fn snapshot(now: DateTime<Utc>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::empty("Finance", now);
        for (id, age_days) in [("fresh", Some(3)), ("old", Some(90)), ("unknown", None)] {
            snapshot.entries.insert(
                id.to_string(),
                StateEntry {
                    destination_key: format!("Finance/{}.twbx", id),
                    updated_at: now,
                    content_hash: "sha256:00".into(),
                    tags: TagSet::new(),
                    project_path: String::new(),
                    name: id.to_string(),
                    last_modified: age_days.map(|d| now - chrono::Duration::days(d)),
                    absent_runs: 0,
                },
            );
        }
        snapshot
    }

    struct NoStore;

    #[async_trait::async_trait]
    impl ObjectStore for NoStore {
        async fn put(
            &self,
            _: &str,
            _: bridge_traits::ObjectBody,
            _: &TagSet,
        ) -> bridge_traits::error::Result<()> {
            unreachable!()
        }
        async fn get_tags(&self, _: &str) -> bridge_traits::error::Result<TagSet> {
            unreachable!()
        }
        async fn update_tags(&self, _: &str, _: &TagSet) -> bridge_traits::error::Result<()> {
            unreachable!()
        }
        async fn touch_last_modified(&self, key: &str) -> bridge_traits::error::Result<()> {
            if key.contains("unknown") {
                Err(bridge_traits::BridgeError::AccessDenied("denied".into()))
            } else {
                Ok(())
            }
        }
        async fn delete(&self, _: &str) -> bridge_traits::error::Result<()> {
            unreachable!()
        }
        async fn get_object(&self, _: &str) -> bridge_traits::error::Result<Option<bytes::Bytes>> {
            unreachable!()
        }
        async fn put_object(&self, _: &str, _: bytes::Bytes) -> bridge_traits::error::Result<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_refresh_touches_only_stale_entries() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let refresher = StalenessRefresher::new(Arc::new(NoStore), clock, 4);
        let snapshot = snapshot(now);

        let summary = refresher
            .refresh(
                "Finance",
                &snapshot,
                Duration::from_secs(60 * 86_400),
                &HashSet::new(),
            )
            .await;

        assert_eq!(summary.refreshed, vec![("old".to_string(), now)]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "unknown");
    }

    #[tokio::test]
    async fn test_excluded_ids_are_not_touched() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let refresher =
            StalenessRefresher::new(Arc::new(NoStore), Arc::new(ManualClock::new(now)), 4);
        let exclude: HashSet<String> = ["old".to_string(), "unknown".to_string()].into();

        let summary = refresher
            .refresh(
                "Finance",
                &snapshot(now),
                Duration::from_secs(60 * 86_400),
                &exclude,
            )
            .await;
        assert_eq!(summary.count_refreshed(), 0);
        assert!(summary.failed.is_empty());
    }
}
