//! Telemetry Sink Abstraction
//!
//! Heartbeats, numeric/text metrics, error capture and breadcrumbs for the
//! monitoring stack watching the backup jobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;

/// Value reported for a metric key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
            MetricValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Int(value)
    }
}

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        MetricValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetricValue {
    fn from(value: usize) -> Self {
        MetricValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<i32> for MetricValue {
    fn from(value: i32) -> Self {
        MetricValue::Int(value.into())
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_string())
    }
}

/// Context attached to a captured error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub message: String,
    pub tags: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Telemetry sink trait.
///
/// Best-effort by contract: callers log a returned error and carry on. An
/// implementation must never block a backup run for long.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn heartbeat(&self, name: &str) -> Result<()>;

    async fn metric(&self, name: &str, value: MetricValue) -> Result<()>;

    async fn capture_error(&self, context: ErrorContext) -> Result<()>;

    /// Record a step of the run for later correlation with captured errors.
    async fn breadcrumb(&self, _category: &str, _message: &str) -> Result<()> {
        Ok(())
    }

    /// Push buffered values, if the implementation batches.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
