//! Object Store Abstraction
//!
//! Key/value blob storage with per-object tags and a last-modified clock,
//! modelled after S3 semantics.
//!
//! ## Atomicity
//!
//! A single `put` or `put_object` must be atomic for readers: after it returns,
//! either the whole new body is visible or the previous one is. S3 guarantees
//! this for single-part and completed multipart uploads.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Result;

/// Tag key/value pairs attached to a destination object.
///
/// Ordered so that the same logical mapping always serializes the same way.
pub type TagSet = BTreeMap<String, String>;

/// Content handed to [`ObjectStore::put`].
#[derive(Debug, Clone)]
pub enum ObjectBody {
    Bytes(Bytes),
    /// Local file streamed from disk; never loaded fully into memory
    File(PathBuf),
}

impl From<Bytes> for ObjectBody {
    fn from(value: Bytes) -> Self {
        ObjectBody::Bytes(value)
    }
}

impl From<PathBuf> for ObjectBody {
    fn from(value: PathBuf) -> Self {
        ObjectBody::File(value)
    }
}

/// Destination object store.
///
/// # Errors
///
/// Implementations must map "object does not exist" to
/// [`BridgeError::NotFound`](crate::error::BridgeError::NotFound) and rate
/// limiting to [`BridgeError::Throttled`](crate::error::BridgeError::Throttled).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `body` under `key` and attach `tags` in the same request.
    async fn put(&self, key: &str, body: ObjectBody, tags: &TagSet) -> Result<()>;

    async fn get_tags(&self, key: &str) -> Result<TagSet>;

    /// Replace the full tag set of an existing object.
    async fn update_tags(&self, key: &str, tags: &TagSet) -> Result<()>;

    /// Reset the object's last-modified time without changing its content.
    async fn touch_last_modified(&self, key: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetch a small object in full. `Ok(None)` when it does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a small object in full, replacing any previous version atomically.
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;
}
