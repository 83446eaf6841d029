//! Production wiring: file config into concrete adapters.

use async_trait::async_trait;
use bridge_desktop::{
    EnvSecretsResolver, ReqwestHttpClient, S3ObjectStore, S3Settings, TracingTelemetry,
    TsmSnapshotTrigger, ZabbixSender,
};
use bridge_traits::{
    error::Result as BridgeResult, object_store::ObjectStore, secrets::SecretsResolver,
    telemetry::TelemetrySink,
};
use core_fullbackup::FullBackupRunner;
use core_runtime::config::{AwsCreds, FileConfig, ZabbixSection};
use core_runtime::{EventBus, Telemetry};
use provider_tableau::TableauConnector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoreError, Result};
use crate::service::{BackupService, BucketStores, SITE_OVERRIDE_ENV};

/// S3 clients keyed by bucket, built on first use.
pub struct S3BucketStores {
    settings: S3Settings,
    stores: Mutex<HashMap<String, Arc<S3ObjectStore>>>,
}

impl S3BucketStores {
    pub fn new(settings: S3Settings) -> Self {
        Self {
            settings,
            stores: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BucketStores for S3BucketStores {
    async fn store(&self, bucket: &str) -> BridgeResult<Arc<dyn ObjectStore>> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(bucket) {
            return Ok(Arc::clone(store) as Arc<dyn ObjectStore>);
        }
        let store = Arc::new(S3ObjectStore::connect(&self.settings, bucket).await);
        stores.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

async fn required(resolver: &dyn SecretsResolver, name: &str, what: &str) -> Result<String> {
    resolver
        .resolve(name)
        .await
        .map_err(|e| CoreError::MissingSecret(format!("{}: {}", what, e)))?
        .ok_or_else(|| CoreError::MissingSecret(what.to_string()))
}

async fn optional(resolver: &dyn SecretsResolver, value: &Option<String>) -> Result<Option<String>> {
    match value {
        Some(name) => resolver
            .resolve(name)
            .await
            .map_err(|e| CoreError::MissingSecret(e.to_string())),
        None => Ok(None),
    }
}

/// Resolve `[creds.aws]`, leaving unset values to the AWS default chain.
pub async fn s3_settings(
    resolver: &dyn SecretsResolver,
    creds: Option<&AwsCreds>,
) -> Result<S3Settings> {
    let Some(creds) = creds else {
        return Ok(S3Settings::default());
    };
    Ok(S3Settings {
        region: optional(resolver, &creds.region).await?,
        endpoint_url: optional(resolver, &creds.endpoint_url).await?,
        key_id: optional(resolver, &creds.key_id).await?,
        access_key: optional(resolver, &creds.access_key).await?,
    })
}

/// Zabbix when configured and reachable on paper, log-only otherwise.
pub async fn telemetry_sink(zabbix: Option<&ZabbixSection>) -> Arc<dyn TelemetrySink> {
    let Some(section) = zabbix else {
        return Arc::new(TracingTelemetry::new());
    };
    match ZabbixSender::from_agent_config(
        &section.config_file,
        section.server.clone(),
        section.host.clone(),
    )
    .await
    {
        Ok(sender) => {
            info!(server = sender.server(), host = sender.host(), "Zabbix telemetry enabled");
            Arc::new(sender)
        }
        Err(e) => {
            warn!(error = %e, "Zabbix unavailable, telemetry goes to the log only");
            Arc::new(TracingTelemetry::new())
        }
    }
}

/// Everything the binary needs, built once from the config file.
pub struct Wiring {
    pub config: FileConfig,
    pub telemetry: Telemetry,
    pub event_bus: EventBus,
    buckets: Arc<S3BucketStores>,
}

impl Wiring {
    pub async fn new(config: FileConfig, telemetry_enabled: bool) -> Result<Self> {
        let resolver = EnvSecretsResolver::new();
        let settings = s3_settings(&resolver, config.creds.aws.as_ref()).await?;

        let prefix = config.main.telemetry_prefix.clone();
        let telemetry = if telemetry_enabled {
            Telemetry::new(telemetry_sink(config.zabbix.as_ref()).await, prefix)
        } else {
            Telemetry::disabled(prefix)
        };

        Ok(Self {
            config,
            telemetry,
            event_bus: EventBus::default(),
            buckets: Arc::new(S3BucketStores::new(settings)),
        })
    }

    /// Incremental workbook backup over every configured site and project.
    pub async fn backup_service(&self) -> Result<BackupService> {
        let creds = self
            .config
            .creds
            .tableau
            .as_ref()
            .ok_or_else(|| CoreError::CapabilityMissing {
                capability: "[creds.tableau]".to_string(),
                message: "required for workbook backups".to_string(),
            })?;

        let resolver = EnvSecretsResolver::new();
        let token = required(&resolver, &creds.token, "Tableau token").await?;
        let http = ReqwestHttpClient::new()
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;
        let connector = TableauConnector::new(Arc::new(http), &creds.url, &creds.api_version, token);

        let service = BackupService::new(
            Arc::new(connector),
            self.buckets.clone(),
            self.config.backup_config()?,
            self.config.backup.clone(),
        )
        .with_telemetry(self.telemetry.clone())
        .with_event_bus(self.event_bus.clone())
        .with_site_override(std::env::var(SITE_OVERRIDE_ENV).ok());

        Ok(service)
    }

    /// Full-server backup runner bound to `[full_backup] bucket_name`.
    pub async fn full_backup_runner(&self) -> Result<FullBackupRunner> {
        let settings = self
            .config
            .full_backup
            .clone()
            .ok_or_else(|| CoreError::CapabilityMissing {
                capability: "[full_backup]".to_string(),
                message: "required for full backups".to_string(),
            })?;

        let store = self
            .buckets
            .store(&settings.bucket_name)
            .await
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;

        Ok(
            FullBackupRunner::new(Arc::new(TsmSnapshotTrigger::new()), store, settings)
                .with_telemetry(&self.telemetry)
                .with_event_bus(self.event_bus.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_s3_settings_resolve_env_references() {
        let resolver = EnvSecretsResolver::with_values([
            ("AWS_KEY", "AKIAEXAMPLE"),
            ("AWS_SECRET", "secret"),
        ]);
        let creds = AwsCreds {
            region: Some("eu-west-1".to_string()),
            endpoint_url: None,
            key_id: Some("env:AWS_KEY".to_string()),
            access_key: Some("env:AWS_SECRET".to_string()),
        };

        let settings = s3_settings(&resolver, Some(&creds)).await.unwrap();
        assert_eq!(settings.region.as_deref(), Some("eu-west-1"));
        assert_eq!(settings.key_id.as_deref(), Some("AKIAEXAMPLE"));
        assert_eq!(settings.access_key.as_deref(), Some("secret"));
        assert!(settings.endpoint_url.is_none());

        let defaults = s3_settings(&resolver, None).await.unwrap();
        assert!(defaults.region.is_none());
    }

    #[tokio::test]
    async fn test_missing_token_is_reported() {
        let resolver = EnvSecretsResolver::with_values(Vec::<(&str, &str)>::new());
        let err = required(&resolver, "env:TABLEAU_BACKUP_TEST_UNSET_TOKEN", "Tableau token")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingSecret(_)));
    }

    #[tokio::test]
    async fn test_telemetry_falls_back_without_agent_config() {
        let section = ZabbixSection {
            config_file: "/nonexistent/zabbix_agentd.conf".into(),
            server: None,
            host: None,
        };
        let sink = telemetry_sink(Some(&section)).await;
        sink.heartbeat("wb-backup2s3.heartbeat").await.unwrap();
    }
}
