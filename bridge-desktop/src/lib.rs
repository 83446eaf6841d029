//! # Server Bridge Implementations
//!
//! Production implementations of the bridge traits for a Linux host running
//! next to Tableau Server.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `ObjectStore` using `aws-sdk-s3`, plus an in-memory store for tests and
//!   dry runs
//! - `TelemetrySink` speaking the Zabbix sender protocol, or writing to
//!   `tracing`
//! - `SnapshotTrigger` running `tsm maintenance backup` via `tokio::process`
//! - `SecretsResolver` reading `env:NAME` references
//!
//! ## Feature Flags
//!
//! - `s3`: Enable the AWS SDK object store (default)
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{S3ObjectStore, S3Settings, ZabbixSender};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = S3ObjectStore::connect(&S3Settings::default(), "tableau-workbooks").await;
//!     let zabbix = ZabbixSender::new("zabbix.example.com:10051", "tableau-prod-01");
//!
//!     // Hand both to the backup coordinator
//! }
//! ```

mod http;
mod memory;
mod secrets;
mod telemetry;
mod tsm;
mod zabbix;

#[cfg(feature = "s3")]
mod s3;

pub use http::ReqwestHttpClient;
pub use memory::{validate_tags, InMemoryObjectStore, StoredObject};
pub use secrets::{EnvSecretsResolver, ENV_PREFIX};
pub use telemetry::TracingTelemetry;
pub use tsm::{shell_quote, TsmSnapshotTrigger, DEFAULT_PROFILE_SCRIPT};
pub use zabbix::{AgentConfig, ZabbixSender, DEFAULT_AGENT_CONFIG, DEFAULT_PORT};

#[cfg(feature = "s3")]
pub use s3::{S3ObjectStore, S3Settings};
