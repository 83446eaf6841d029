//! # Backup Configuration Module
//!
//! Run-level settings for the backup engines plus the on-disk TOML model they
//! are usually loaded from.
//!
//! ## Overview
//!
//! [`BackupConfig`] is what the engines consume. It is built with
//! [`BackupConfigBuilder`], which fills in deployment defaults and validates
//! the result so that a bad value fails at startup rather than mid-run.
//!
//! [`FileConfig`] mirrors the configuration file layout one to one. It carries
//! credentials and bucket names that only the service façade needs, and
//! converts into a [`BackupConfig`] with [`FileConfig::backup_config`].
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{BackupConfig, RemovalPolicy};
//! use std::time::Duration;
//!
//! let config = BackupConfig::builder()
//!     .max_workers(8)
//!     .removal_policy(RemovalPolicy::Delete)
//!     .staleness_threshold(Some(Duration::from_secs(30 * 86_400)))
//!     .build()?;
//! ```
//!
//! ## Defaults
//!
//! | Setting | Default |
//! |---------|---------|
//! | `max_workers` | 6 |
//! | `max_attempts` | 6 |
//! | `initial_backoff` | 500 ms |
//! | `max_backoff` | 30 s |
//! | `run_timeout` | 4 h |
//! | `grace_period` | 60 s |
//! | `staleness_threshold` | 60 days |
//! | `removal_policy` | `Retain` |
//! | `removal_confirmation_runs` | 2 |

use crate::error::{Error, Result};
use crate::logging::LogFormat;
use bridge_traits::time::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_WORKERS: usize = 6;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;
pub const DEFAULT_STALENESS_DAYS: u64 = 60;
pub const DEFAULT_STATE_OBJECT_NAME: &str = "upload_state.json";
pub const DEFAULT_IGNORE_EXTRACT_ERRORS_TAG: &str = "WBBackupIgnoreErrors";
pub const DEFAULT_TELEMETRY_PREFIX: &str = "wb-backup2s3";

const SECONDS_PER_DAY: u64 = 86_400;

/// What happens to a destination object once its source is confirmed gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// Leave the object as an archival copy; its lifecycle clock is restarted
    #[default]
    Retain,
    /// Delete the object from the destination
    Delete,
}

impl std::str::FromStr for RemovalPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retain" => Ok(RemovalPolicy::Retain),
            "delete" => Ok(RemovalPolicy::Delete),
            other => Err(Error::Config(format!(
                "Unknown removal policy '{}'. Expected 'retain' or 'delete'.",
                other
            ))),
        }
    }
}

/// Settings consumed by one incremental backup run.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupConfig {
    /// Upper bound on concurrently executing change items
    pub max_workers: usize,

    /// Attempts per item before a transient failure becomes terminal
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles on each further attempt
    pub initial_backoff: Duration,

    /// Ceiling for a single backoff delay
    pub max_backoff: Duration,

    /// Randomize backoff delays to spread retries from parallel workers
    pub jitter: bool,

    /// Wall-clock budget for the upload phase; `None` waits forever
    pub run_timeout: Option<Duration>,

    /// Time in-flight items get to finish after cancellation
    pub grace_period: Duration,

    /// Age after which an unchanged object is touched; `None` disables refresh
    pub staleness_threshold: Option<Duration>,

    pub removal_policy: RemovalPolicy,

    /// Consecutive runs an id must be missing before it is treated as removed
    pub removal_confirmation_runs: u32,

    /// Substrings that cause a tag value to be redacted (case-insensitive)
    pub tag_denylist: Vec<String>,

    /// Source label that allows recording an extract-less download as done
    pub ignore_extract_errors_tag: String,

    /// Scratch directory for downloads
    pub work_dir: PathBuf,

    /// Object name of the per-site snapshot, below the site prefix
    pub state_object_name: String,

    /// Prefix for metric keys
    pub telemetry_prefix: String,

    /// Restrict the run to these project paths and their sub-projects
    pub project_filter: Option<Vec<String>>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: true,
            run_timeout: Some(Duration::from_secs(4 * 3600)),
            grace_period: Duration::from_secs(60),
            staleness_threshold: Some(Duration::from_secs(
                DEFAULT_STALENESS_DAYS * SECONDS_PER_DAY,
            )),
            removal_policy: RemovalPolicy::Retain,
            removal_confirmation_runs: 2,
            tag_denylist: Vec::new(),
            ignore_extract_errors_tag: DEFAULT_IGNORE_EXTRACT_ERRORS_TAG.to_string(),
            work_dir: std::env::temp_dir().join("tableau-backup"),
            state_object_name: DEFAULT_STATE_OBJECT_NAME.to_string(),
            telemetry_prefix: DEFAULT_TELEMETRY_PREFIX.to_string(),
            project_filter: None,
        }
    }
}

impl BackupConfig {
    pub fn builder() -> BackupConfigBuilder {
        BackupConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }

        if self.max_attempts == 0 {
            return Err(Error::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.initial_backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "initial_backoff ({:?}) exceeds max_backoff ({:?})",
                self.initial_backoff, self.max_backoff
            )));
        }

        if self.removal_confirmation_runs == 0 {
            return Err(Error::Config(
                "removal_confirmation_runs must be at least 1".to_string(),
            ));
        }

        if self.run_timeout == Some(Duration::ZERO) {
            return Err(Error::Config(
                "run_timeout must be greater than zero. Omit it to disable the timeout."
                    .to_string(),
            ));
        }

        if self.work_dir.as_os_str().is_empty() {
            return Err(Error::Config("work_dir cannot be empty".to_string()));
        }

        if self.state_object_name.trim().is_empty() || self.state_object_name.contains('/') {
            return Err(Error::Config(format!(
                "state_object_name '{}' must be a plain object name",
                self.state_object_name
            )));
        }

        if self.ignore_extract_errors_tag.trim().is_empty() {
            return Err(Error::Config(
                "ignore_extract_errors_tag cannot be empty".to_string(),
            ));
        }

        if let Some(projects) = &self.project_filter {
            if projects.iter().any(|p| p.trim_matches('/').is_empty()) {
                return Err(Error::Config(
                    "project_filter entries cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Destination key of the snapshot object for `site`.
    pub fn state_key(&self, site: &str) -> String {
        format!("{}/{}", site, self.state_object_name)
    }

    /// Full metric key for a suffix such as `heartbeat`.
    pub fn metric_key(&self, suffix: &str) -> String {
        format!("{}.{}", self.telemetry_prefix, suffix)
    }
}

/// Builder for [`BackupConfig`].
#[derive(Debug, Default)]
pub struct BackupConfigBuilder {
    config: BackupConfig,
}

impl BackupConfigBuilder {
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets both ends of the backoff range.
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_backoff = initial;
        self.config.max_backoff = max;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.run_timeout = timeout;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period = grace;
        self
    }

    pub fn staleness_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.config.staleness_threshold = threshold;
        self
    }

    pub fn removal_policy(mut self, policy: RemovalPolicy) -> Self {
        self.config.removal_policy = policy;
        self
    }

    pub fn removal_confirmation_runs(mut self, runs: u32) -> Self {
        self.config.removal_confirmation_runs = runs;
        self
    }

    pub fn tag_denylist<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tag_denylist = entries.into_iter().map(Into::into).collect();
        self
    }

    pub fn ignore_extract_errors_tag(mut self, tag: impl Into<String>) -> Self {
        self.config.ignore_extract_errors_tag = tag.into();
        self
    }

    pub fn work_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.work_dir = dir.into();
        self
    }

    pub fn state_object_name(mut self, name: impl Into<String>) -> Self {
        self.config.state_object_name = name.into();
        self
    }

    pub fn telemetry_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.telemetry_prefix = prefix.into();
        self
    }

    pub fn project_filter(mut self, projects: Option<Vec<String>>) -> Self {
        self.config.project_filter = projects;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<BackupConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ============================================================================
// Configuration file model
// ============================================================================

/// Root of the TOML configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub main: MainSection,
    #[serde(default)]
    pub creds: CredsSection,
    #[serde(default)]
    pub backup: BackupSection,
    pub full_backup: Option<FullBackupSection>,
    pub zabbix: Option<ZabbixSection>,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MainSection {
    pub workdir: Option<PathBuf>,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub run_timeout_secs: Option<u64>,
    pub grace_period_secs: u64,
    /// Zero disables staleness refresh
    pub staleness_days: u64,
    pub removal_policy: RemovalPolicy,
    pub removal_confirmation_runs: u32,
    pub tag_denylist: Vec<String>,
    pub ignore_extract_errors_tag: String,
    pub telemetry_prefix: String,
}

impl Default for MainSection {
    fn default() -> Self {
        let defaults = BackupConfig::default();
        Self {
            workdir: None,
            max_workers: defaults.max_workers,
            max_attempts: defaults.max_attempts,
            run_timeout_secs: defaults.run_timeout.map(|d| d.as_secs()),
            grace_period_secs: defaults.grace_period.as_secs(),
            staleness_days: DEFAULT_STALENESS_DAYS,
            removal_policy: defaults.removal_policy,
            removal_confirmation_runs: defaults.removal_confirmation_runs,
            tag_denylist: Vec::new(),
            ignore_extract_errors_tag: defaults.ignore_extract_errors_tag,
            telemetry_prefix: defaults.telemetry_prefix,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredsSection {
    pub tableau: Option<TableauCreds>,
    pub aws: Option<AwsCreds>,
}

/// Values may be literal or `env:NAME` references.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableauCreds {
    pub url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Session token issued out of band
    pub token: String,
}

fn default_api_version() -> String {
    "3.19".to_string()
}

impl std::fmt::Debug for TableauCreds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableauCreds")
            .field("url", &self.url)
            .field("api_version", &self.api_version)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsCreds {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub key_id: Option<String>,
    pub access_key: Option<String>,
}

impl std::fmt::Debug for AwsCreds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCreds")
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("key_id", &self.key_id.as_ref().map(|_| "[REDACTED]"))
            .field("access_key", &self.access_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupSection {
    pub sites: Option<SitesSection>,
    #[serde(default)]
    pub projects: Vec<ProjectsSection>,
}

/// Site-wide backup of every site into one bucket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SitesSection {
    pub s3_bucket_name: String,
    #[serde(default)]
    pub excluded_sites: Vec<String>,
}

/// Backup of selected projects of one site into a dedicated bucket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectsSection {
    pub site: String,
    pub projects: Vec<String>,
    pub bucket: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FullBackupSection {
    pub backup_file: String,
    #[serde(default)]
    pub append_timestamp: bool,
    #[serde(default)]
    pub multithreaded: bool,
    pub backup_dir: PathBuf,
    pub bucket_name: String,
    #[serde(default = "default_full_backup_prefix")]
    pub telemetry_prefix: String,
}

fn default_full_backup_prefix() -> String {
    "full-backup2s3".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZabbixSection {
    #[serde(default = "default_zabbix_agent_config")]
    pub config_file: PathBuf,
    /// Overrides `ServerActive=` from the agent config
    pub server: Option<String>,
    /// Overrides `Hostname=` from the agent config
    pub host: Option<String>,
}

fn default_zabbix_agent_config() -> PathBuf {
    PathBuf::from("/etc/zabbix/zabbix_agentd.conf")
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub dir: Option<PathBuf>,
    pub level: String,
    pub format: Option<String>,
    pub max_log_files: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            dir: None,
            level: "info".to_string(),
            format: None,
            max_log_files: 5,
        }
    }
}

impl LoggingSection {
    pub fn level(&self) -> Result<LogLevel> {
        self.level.parse::<LogLevel>().map_err(Error::Config)
    }

    pub fn format(&self) -> Result<LogFormat> {
        match &self.format {
            Some(format) => format.parse(),
            None => Ok(LogFormat::default()),
        }
    }
}

impl FileConfig {
    /// Read and parse a TOML configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FileConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(sites) = &self.backup.sites {
            if sites.s3_bucket_name.trim().is_empty() {
                return Err(Error::Config(
                    "[backup.sites] s3_bucket_name cannot be empty".to_string(),
                ));
            }
        }

        for projects in &self.backup.projects {
            if projects.bucket.trim().is_empty() {
                return Err(Error::Config(format!(
                    "[[backup.projects]] for site '{}' has an empty bucket",
                    projects.site
                )));
            }
            if projects.projects.is_empty() {
                return Err(Error::Config(format!(
                    "[[backup.projects]] for site '{}' lists no projects",
                    projects.site
                )));
            }
        }

        self.logging.level()?;
        self.logging.format()?;
        Ok(())
    }

    /// Engine settings derived from `[main]`.
    pub fn backup_config(&self) -> Result<BackupConfig> {
        let main = &self.main;
        let mut builder = BackupConfig::builder()
            .max_workers(main.max_workers)
            .max_attempts(main.max_attempts)
            .run_timeout(main.run_timeout_secs.map(Duration::from_secs))
            .grace_period(Duration::from_secs(main.grace_period_secs))
            .staleness_threshold(
                (main.staleness_days > 0)
                    .then(|| Duration::from_secs(main.staleness_days * SECONDS_PER_DAY)),
            )
            .removal_policy(main.removal_policy)
            .removal_confirmation_runs(main.removal_confirmation_runs)
            .tag_denylist(main.tag_denylist.clone())
            .ignore_extract_errors_tag(main.ignore_extract_errors_tag.clone())
            .telemetry_prefix(main.telemetry_prefix.clone());

        if let Some(workdir) = &main.workdir {
            builder = builder.work_dir(workdir.clone());
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[main]
workdir = "/var/tmp/wb"
max_workers = 4
staleness_days = 30
removal_policy = "delete"
tag_denylist = ["password"]

[creds.tableau]
url = "https://tableau.example.com"
token = "env:TABLEAU_TOKEN"

[creds.aws]
region = "eu-west-1"
key_id = "env:AWS_ACCESS_KEY_ID"
access_key = "env:AWS_SECRET_ACCESS_KEY"

[backup.sites]
s3_bucket_name = "tableau-workbooks"
excluded_sites = ["Sandbox"]

[[backup.projects]]
site = "Finance"
projects = ["Reports/Quarterly"]
bucket = "finance-workbooks"

[full_backup]
backup_file = "ts_backup"
append_timestamp = true
backup_dir = "/var/opt/tableau/tableau_server/data/tabsvc/files/backups"
bucket_name = "tableau-full"

[zabbix]

[logging]
level = "debug"
format = "json"
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = BackupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_workers, 6);
        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.removal_confirmation_runs, 2);
        assert_eq!(config.removal_policy, RemovalPolicy::Retain);
    }

    #[test]
    fn test_builder_overrides() {
        let config = BackupConfig::builder()
            .max_workers(2)
            .max_attempts(3)
            .backoff(Duration::from_millis(1), Duration::from_millis(5))
            .jitter(false)
            .removal_policy(RemovalPolicy::Delete)
            .tag_denylist(["secret"])
            .build()
            .unwrap();

        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_attempts, 3);
        assert!(!config.jitter);
        assert_eq!(config.tag_denylist, vec!["secret".to_string()]);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let result = BackupConfig::builder().max_workers(0).build();
        assert!(result.unwrap_err().to_string().contains("max_workers"));
    }

    #[test]
    fn test_validate_rejects_zero_confirmation_runs() {
        let result = BackupConfig::builder().removal_confirmation_runs(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let result = BackupConfig::builder()
            .backoff(Duration::from_secs(10), Duration::from_secs(1))
            .build();
        assert!(result.unwrap_err().to_string().contains("exceeds max_backoff"));
    }

    #[test]
    fn test_validate_rejects_nested_state_name() {
        let result = BackupConfig::builder()
            .state_object_name("nested/state.json")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_state_and_metric_keys() {
        let config = BackupConfig::default();
        assert_eq!(config.state_key("Finance"), "Finance/upload_state.json");
        assert_eq!(config.metric_key("heartbeat"), "wb-backup2s3.heartbeat");
    }

    #[test]
    fn test_removal_policy_from_str() {
        assert_eq!("Delete".parse::<RemovalPolicy>().unwrap(), RemovalPolicy::Delete);
        assert!("purge".parse::<RemovalPolicy>().is_err());
    }

    #[test]
    fn test_parse_sample_file() {
        let file = FileConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(file.main.max_workers, 4);
        let sites = file.backup.sites.as_ref().unwrap();
        assert_eq!(sites.excluded_sites, vec!["Sandbox".to_string()]);
        assert_eq!(file.backup.projects[0].projects, vec!["Reports/Quarterly".to_string()]);
        assert_eq!(
            file.zabbix.as_ref().unwrap().config_file,
            PathBuf::from("/etc/zabbix/zabbix_agentd.conf")
        );
        assert_eq!(file.full_backup.as_ref().unwrap().telemetry_prefix, "full-backup2s3");
        assert_eq!(file.logging.level().unwrap(), LogLevel::Debug);
        assert_eq!(file.logging.format().unwrap(), LogFormat::Json);

        let config = file.backup_config().unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.removal_policy, RemovalPolicy::Delete);
        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/wb"));
        assert_eq!(
            config.staleness_threshold,
            Some(Duration::from_secs(30 * 86_400))
        );
    }

    #[test]
    fn test_zero_staleness_days_disables_refresh() {
        let file = FileConfig::from_toml_str("[main]\nstaleness_days = 0\n").unwrap();
        assert_eq!(file.backup_config().unwrap().staleness_threshold, None);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let result = FileConfig::from_toml_str("[main]\nmax_wrkers = 3\n");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_rejects_project_mapping_without_projects() {
        let text = "[[backup.projects]]\nsite = \"A\"\nprojects = []\nbucket = \"b\"\n";
        let result = FileConfig::from_toml_str(text);
        assert!(result.unwrap_err().to_string().contains("lists no projects"));
    }

    #[test]
    fn test_creds_debug_redacts_secrets() {
        let file = FileConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = format!("{:?}", file.creds);
        assert!(!rendered.contains("TABLEAU_TOKEN"));
        assert!(!rendered.contains("AWS_SECRET_ACCESS_KEY"));
        assert!(rendered.contains("tableau.example.com"));
    }
}
