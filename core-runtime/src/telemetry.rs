//! # Best-effort Telemetry
//!
//! Wraps an optional [`TelemetrySink`] so engines can report without caring
//! whether monitoring is configured or reachable. Sink failures are logged at
//! `warn` and swallowed.

use bridge_traits::{ErrorContext, MetricValue, TelemetrySink};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Telemetry {
    sink: Option<Arc<dyn TelemetrySink>>,
    prefix: String,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>, prefix: impl Into<String>) -> Self {
        Self {
            sink: Some(sink),
            prefix: prefix.into(),
        }
    }

    /// Telemetry that only logs.
    pub fn disabled(prefix: impl Into<String>) -> Self {
        Self {
            sink: None,
            prefix: prefix.into(),
        }
    }

    /// Same sink under another key prefix.
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            sink: self.sink.clone(),
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}.{}", self.prefix, suffix)
    }

    pub async fn heartbeat(&self) {
        let name = self.key("heartbeat");
        debug!(metric = %name, "heartbeat");
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.heartbeat(&name).await {
                warn!(metric = %name, error = %e, "Telemetry heartbeat failed");
            }
        }
    }

    pub async fn metric(&self, suffix: &str, value: impl Into<MetricValue>) {
        let name = self.key(suffix);
        let value = value.into();
        debug!(metric = %name, value = %value, "metric");
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.metric(&name, value).await {
                warn!(metric = %name, error = %e, "Telemetry metric failed");
            }
        }
    }

    pub async fn capture_error(&self, context: ErrorContext) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.capture_error(context).await {
                warn!(error = %e, "Telemetry error capture failed");
            }
        }
    }

    pub async fn breadcrumb(&self, category: &str, message: &str) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.breadcrumb(category, message).await {
                warn!(category, error = %e, "Telemetry breadcrumb failed");
            }
        }
    }

    pub async fn flush(&self) {
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.flush().await {
                warn!(error = %e, "Telemetry flush failed");
            }
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("enabled", &self.sink.is_some())
            .field("prefix", &self.prefix)
            .finish()
    }
}
