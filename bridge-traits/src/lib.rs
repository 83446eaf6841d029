//! # Bridge Traits
//!
//! Narrow interfaces to every external collaborator of the backup engines.
//!
//! ## Overview
//!
//! The engines in `core-sync` and `core-fullbackup` never talk to the content
//! server, S3, the monitoring stack or the shell directly. Each of those is a
//! trait defined here and implemented by an adapter crate (`bridge-desktop`,
//! `provider-tableau`) or by test doubles.
//!
//! ## Traits
//!
//! ### Source and destination
//! - [`SourceInventory`](inventory::SourceInventory) - Lists sites/workbooks and streams workbook bytes
//! - [`ObjectStore`](object_store::ObjectStore) - Put/tag/touch/delete objects, snapshot get/put
//! - [`HttpClient`](http::HttpClient) - Transport for REST-backed inventories
//!
//! ### Operations
//! - [`TelemetrySink`](telemetry::TelemetrySink) - Heartbeats, metrics, error capture
//! - [`SnapshotTrigger`](snapshot::SnapshotTrigger) - Full-server backup tool invocation
//! - [`SecretsResolver`](secrets::SecretsResolver) - Named credential lookup
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Mirror structured logs into a host pipeline
//!
//! ## Error Handling
//!
//! Every trait returns [`BridgeError`](error::BridgeError). Adapters classify
//! their native failures into it so that callers can ask
//! [`is_transient`](error::BridgeError::is_transient) without knowing which
//! backend produced the error.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so a single adapter instance can be
//! shared across worker tasks behind an `Arc`.

pub mod error;
pub mod http;
pub mod inventory;
pub mod object_store;
pub mod secrets;
pub mod snapshot;
pub mod telemetry;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse};
pub use inventory::{Download, Listing, RejectedObject, SiteInfo, SourceInventory, SourceObject};
pub use object_store::{ObjectBody, ObjectStore, TagSet};
pub use secrets::SecretsResolver;
pub use snapshot::{SnapshotOutput, SnapshotRequest, SnapshotTrigger};
pub use telemetry::{ErrorContext, MetricValue, TelemetrySink};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
