//! In-Memory Object Store
//!
//! An [`ObjectStore`] kept entirely in process memory. It enforces the same tag
//! limits S3 does, so that it can stand in for a bucket in integration tests
//! and dry runs.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    object_store::{ObjectBody, ObjectStore, TagSet},
    time::{Clock, SystemClock},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

const MAX_TAGS: usize = 10;
const MAX_TAG_KEY_LEN: usize = 128;
const MAX_TAG_VALUE_LEN: usize = 256;

/// Stored object with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Bytes,
    pub tags: TagSet,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    puts: AtomicUsize,
    tag_updates: AtomicUsize,
    touches: AtomicUsize,
    deletes: AtomicUsize,
}

/// Object store backed by a `BTreeMap`.
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("objects", &self.keys().len())
            .finish_non_exhaustive()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` to stamp `last_modified`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            clock,
            counters: Counters::default(),
        }
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.read().get(key).cloned()
    }

    pub fn tags(&self, key: &str) -> Option<TagSet> {
        self.read().get(key).map(|o| o.tags.clone())
    }

    pub fn last_modified(&self, key: &str) -> Option<DateTime<Utc>> {
        self.read().get(key).map(|o| o.last_modified)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Insert an object directly, bypassing validation and counters.
    pub fn insert(&self, key: impl Into<String>, object: StoredObject) {
        self.write().insert(key.into(), object);
    }

    /// Number of `put` calls (workbook uploads), excluding `put_object`.
    pub fn put_count(&self) -> usize {
        self.counters.puts.load(Ordering::SeqCst)
    }

    pub fn tag_update_count(&self) -> usize {
        self.counters.tag_updates.load(Ordering::SeqCst)
    }

    pub fn touch_count(&self) -> usize {
        self.counters.touches.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.counters.deletes.load(Ordering::SeqCst)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StoredObject>> {
        match self.objects.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, StoredObject>> {
        match self.objects.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn missing(key: &str) -> BridgeError {
        BridgeError::NotFound(format!("no such key: {}", key))
    }
}

/// Reject tag sets S3 would reject.
pub fn validate_tags(tags: &TagSet) -> Result<()> {
    if tags.len() > MAX_TAGS {
        return Err(BridgeError::InvalidData(format!(
            "too many tags: {} > {}",
            tags.len(),
            MAX_TAGS
        )));
    }
    for (key, value) in tags {
        if key.is_empty() || key.chars().count() > MAX_TAG_KEY_LEN {
            return Err(BridgeError::InvalidData(format!("invalid tag key: {:?}", key)));
        }
        if value.chars().count() > MAX_TAG_VALUE_LEN {
            return Err(BridgeError::InvalidData(format!(
                "tag value too long for {}",
                key
            )));
        }
        let allowed = |c: char| c.is_alphanumeric() || c == ' ' || "+-=._:/@".contains(c);
        if !key.chars().all(allowed) || !value.chars().all(allowed) {
            return Err(BridgeError::InvalidData(format!(
                "unsupported character in tag {}",
                key
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, body: ObjectBody, tags: &TagSet) -> Result<()> {
        validate_tags(tags)?;
        let body = match body {
            ObjectBody::Bytes(bytes) => bytes,
            ObjectBody::File(path) => Bytes::from(tokio::fs::read(&path).await?),
        };

        self.counters.puts.fetch_add(1, Ordering::SeqCst);
        let object = StoredObject {
            body,
            tags: tags.clone(),
            last_modified: self.clock.now(),
        };
        self.write().insert(key.to_string(), object);
        Ok(())
    }

    async fn get_tags(&self, key: &str) -> Result<TagSet> {
        self.tags(key).ok_or_else(|| Self::missing(key))
    }

    async fn update_tags(&self, key: &str, tags: &TagSet) -> Result<()> {
        validate_tags(tags)?;
        let mut objects = self.write();
        let object = objects.get_mut(key).ok_or_else(|| Self::missing(key))?;
        object.tags = tags.clone();
        self.counters.tag_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn touch_last_modified(&self, key: &str) -> Result<()> {
        let now = self.clock.now();
        let mut objects = self.write();
        let object = objects.get_mut(key).ok_or_else(|| Self::missing(key))?;
        object.last_modified = now;
        self.counters.touches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write().remove(key).ok_or_else(|| Self::missing(key))?;
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.read().get(key).map(|o| o.body.clone()))
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        let object = StoredObject {
            body,
            tags: TagSet::new(),
            last_modified: self.clock.now(),
        };
        self.write().insert(key.to_string(), object);
        Ok(())
    }
}
