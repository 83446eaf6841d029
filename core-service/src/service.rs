//! Multi-site orchestration over the incremental engine.

use async_trait::async_trait;
use bridge_traits::{
    error::Result as BridgeResult,
    inventory::{SiteInfo, SourceInventory},
    object_store::ObjectStore,
    time::{Clock, SystemClock},
};
use core_runtime::config::BackupSection;
use core_runtime::{BackupConfig, EventBus, Telemetry};
use core_sync::report::EXIT_ABORTED;
use core_sync::{BackupCoordinator, RunReport};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{CoreError, Result};

/// Environment variable narrowing the site-wide backup to one site.
pub const SITE_OVERRIDE_ENV: &str = "TS_SITE_NAME";

/// Hands out an object store bound to a bucket.
#[async_trait]
pub trait BucketStores: Send + Sync {
    async fn store(&self, bucket: &str) -> BridgeResult<Arc<dyn ObjectStore>>;
}

/// Result of backing up one site into one bucket.
#[derive(Debug)]
pub struct SiteRun {
    pub site: String,
    pub bucket: String,
    pub projects: Option<Vec<String>>,
    /// `Err` holds the run-level failure message
    pub result: std::result::Result<RunReport, String>,
}

impl SiteRun {
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            Ok(report) => report.exit_code(),
            Err(_) => EXIT_ABORTED,
        }
    }
}

/// Every site run of one invocation.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub runs: Vec<SiteRun>,
}

impl BatchOutcome {
    /// Worst exit code across runs.
    pub fn exit_code(&self) -> i32 {
        self.runs.iter().map(SiteRun::exit_code).max().unwrap_or(0)
    }

    pub fn reports(&self) -> impl Iterator<Item = &RunReport> {
        self.runs.iter().filter_map(|r| r.result.as_ref().ok())
    }

    pub fn render_report(&self) -> String {
        let mut out = String::new();
        for run in &self.runs {
            match &run.result {
                Ok(report) => {
                    out.push_str(&report.summary_line());
                    out.push('\n');
                    let table = report.render_table();
                    if !table.is_empty() {
                        out.push_str(&table);
                        out.push('\n');
                    }
                }
                Err(message) => {
                    out.push_str(&format!("site={} aborted: {}\n", run.site, message));
                }
            }
        }
        out
    }
}

/// Drop excluded sites, then keep only `only` when given.
///
/// Sites match by name or content URL.
pub fn select_sites(sites: Vec<SiteInfo>, excluded: &[String], only: Option<&str>) -> Vec<SiteInfo> {
    let matches = |site: &SiteInfo, wanted: &str| site.name == wanted || site.content_url == wanted;

    sites
        .into_iter()
        .filter(|site| !excluded.iter().any(|e| matches(site, e)))
        .filter(|site| only.map_or(true, |wanted| matches(site, wanted)))
        .collect()
}

/// Runs the configured site and project backups one after another.
pub struct BackupService {
    inventory: Arc<dyn SourceInventory>,
    buckets: Arc<dyn BucketStores>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
    event_bus: EventBus,
    cancellation_token: CancellationToken,
    config: BackupConfig,
    plan: BackupSection,
    site_override: Option<String>,
}

impl BackupService {
    pub fn new(
        inventory: Arc<dyn SourceInventory>,
        buckets: Arc<dyn BucketStores>,
        config: BackupConfig,
        plan: BackupSection,
    ) -> Self {
        let telemetry = Telemetry::disabled(config.telemetry_prefix.clone());
        Self {
            inventory,
            buckets,
            clock: Arc::new(SystemClock),
            telemetry,
            event_bus: EventBus::default(),
            cancellation_token: CancellationToken::new(),
            config,
            plan,
            site_override: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Restrict the site-wide backup to one site, as `TS_SITE_NAME` does.
    pub fn with_site_override(mut self, site: Option<String>) -> Self {
        self.site_override = site.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Cancelling stops the current site run and skips the remaining ones.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    async fn run_one(&self, site: &str, bucket: &str, projects: Option<Vec<String>>) -> SiteRun {
        let mut config = self.config.clone();
        config.project_filter = projects.clone();

        let result = match self.buckets.store(bucket).await {
            Ok(store) => BackupCoordinator::new(Arc::clone(&self.inventory), store)
                .with_clock(Arc::clone(&self.clock))
                .with_telemetry(self.telemetry.clone())
                .with_event_bus(self.event_bus.clone())
                .with_cancellation_token(self.cancellation_token.child_token())
                .run_backup(site, &config)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(format!("bucket {}: {}", bucket, e)),
        };

        match &result {
            Ok(report) => info!(site, bucket, "{}", report.summary_line()),
            Err(message) => error!(site, bucket, error = %message, "Site backup aborted"),
        }

        SiteRun {
            site: site.to_string(),
            bucket: bucket.to_string(),
            projects,
            result,
        }
    }

    /// Back up every configured site and project mapping.
    ///
    /// # Errors
    ///
    /// Only when the site list itself cannot be fetched. A failing site is
    /// recorded in the outcome and the next one still runs.
    #[instrument(skip(self))]
    pub async fn run_sites(&self) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        if let Some(sites_plan) = &self.plan.sites {
            let sites = self
                .inventory
                .list_sites()
                .await
                .map_err(CoreError::Inventory)?;
            let selected = select_sites(
                sites,
                &sites_plan.excluded_sites,
                self.site_override.as_deref(),
            );
            if let Some(only) = &self.site_override {
                if selected.is_empty() {
                    warn!(site = %only, "Requested site not found or excluded");
                }
            }

            info!(
                count = selected.len(),
                bucket = %sites_plan.s3_bucket_name,
                "Backing up sites"
            );
            for site in selected {
                if self.cancellation_token.is_cancelled() {
                    warn!(site = %site.name, "Cancelled, skipping site");
                    break;
                }
                let run = self.run_one(&site.name, &sites_plan.s3_bucket_name, None).await;
                outcome.runs.push(run);
            }
        }

        for mapping in &self.plan.projects {
            if self.cancellation_token.is_cancelled() {
                warn!(site = %mapping.site, "Cancelled, skipping project mapping");
                break;
            }
            info!(site = %mapping.site, projects = ?mapping.projects, bucket = %mapping.bucket, "Backing up projects");
            let run = self
                .run_one(&mapping.site, &mapping.bucket, Some(mapping.projects.clone()))
                .await;
            outcome.runs.push(run);
        }

        Ok(outcome)
    }
}
