//! Tracing-backed Telemetry
//!
//! A [`TelemetrySink`] that writes every value to the `telemetry` tracing
//! target. Used when no monitoring server is configured and for dry runs.

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    telemetry::{ErrorContext, MetricValue, TelemetrySink},
};
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TelemetrySink for TracingTelemetry {
    async fn heartbeat(&self, name: &str) -> Result<()> {
        info!(target: "telemetry", metric = name, value = 1, "heartbeat");
        Ok(())
    }

    async fn metric(&self, name: &str, value: MetricValue) -> Result<()> {
        info!(target: "telemetry", metric = name, value = %value, "metric");
        Ok(())
    }

    async fn capture_error(&self, context: ErrorContext) -> Result<()> {
        error!(target: "telemetry", tags = ?context.tags, "{}", context.message);
        Ok(())
    }

    async fn breadcrumb(&self, category: &str, message: &str) -> Result<()> {
        info!(target: "telemetry", category, "{}", message);
        Ok(())
    }
}
