//! Source Inventory Abstraction
//!
//! Read-only view of the content server being backed up: sites, the workbooks
//! they contain, and the bytes of a single workbook.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// An isolated tenant on the source server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub id: String,
    pub name: String,
    /// URL namespace of the site; empty for the default site.
    pub content_url: String,
}

/// One backed-up unit (a workbook) as listed at fetch time.
///
/// Re-fetched on every run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceObject {
    /// Stable identifier assigned by the source system
    pub id: String,
    pub name: String,
    /// Slash-separated project hierarchy, without leading or trailing slash
    pub project_path: String,
    /// Owner display name, if the source could resolve it
    pub owner: Option<String>,
    /// Source-side modification time
    pub updated_at: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    /// Whether a download with embedded extracts should be attempted first
    pub has_extract: bool,
    pub size_hint: Option<u64>,
    /// Labels attached to the object on the source side
    #[serde(default)]
    pub labels: Vec<String>,
    /// Extra metadata preserved as-is and never interpreted
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SourceObject {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        project_path: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project_path: project_path.into(),
            owner: None,
            updated_at,
            created_at: None,
            description: None,
            has_extract: false,
            size_hint: None,
            labels: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_extract(mut self, has_extract: bool) -> Self {
        self.has_extract = has_extract;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Whether this object lies under `project` or one of its sub-projects.
    pub fn is_under_project(&self, project: &str) -> bool {
        path_is_under(&self.project_path, project)
    }
}

/// An object the source listed but could not describe, e.g. a workbook with an
/// unparsable timestamp. It still counts as present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedObject {
    pub id: String,
    pub name: String,
    pub project_path: String,
    pub reason: String,
}

/// Everything listed for one site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub objects: Vec<SourceObject>,
    pub rejected: Vec<RejectedObject>,
}

impl Listing {
    pub fn new(objects: Vec<SourceObject>) -> Self {
        Self {
            objects,
            rejected: Vec::new(),
        }
    }

    pub fn with_rejected(mut self, rejected: RejectedObject) -> Self {
        self.rejected.push(rejected);
        self
    }

    /// Listed ids, rejected ones included.
    pub fn len(&self) -> usize {
        self.objects.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.rejected.is_empty()
    }
}

impl From<Vec<SourceObject>> for Listing {
    fn from(objects: Vec<SourceObject>) -> Self {
        Self::new(objects)
    }
}

/// Returns true when `path` equals `root` or is nested below it.
pub fn path_is_under(path: &str, root: &str) -> bool {
    let root = root.trim_matches('/');
    let path = path.trim_matches('/');
    if root.is_empty() {
        return true;
    }
    path == root
        || (path.len() > root.len() && path.starts_with(root) && path[root.len()..].starts_with('/'))
}

/// Workbook content being streamed from the source.
pub struct Download {
    /// File name suggested by the source, including extension
    pub file_name: String,
    pub body: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
}

impl Download {
    /// File extension without the dot, defaulting to `twbx`.
    pub fn extension(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .unwrap_or("twbx")
    }
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// Source inventory provider.
///
/// Authentication against the source is the implementation's concern; the
/// engine only ever sees listing and download.
///
/// # Errors
///
/// Implementations classify failures as [`BridgeError::AuthError`],
/// [`BridgeError::NotFound`] or a transient variant so that callers can
/// decide on retries.
///
/// [`BridgeError::AuthError`]: crate::error::BridgeError::AuthError
/// [`BridgeError::NotFound`]: crate::error::BridgeError::NotFound
#[async_trait]
pub trait SourceInventory: Send + Sync {
    async fn list_sites(&self) -> Result<Vec<SiteInfo>>;

    /// List every object of `site`, optionally restricted to the given
    /// project paths and all of their sub-projects.
    ///
    /// Objects that cannot be described go to [`Listing::rejected`] instead of
    /// failing the whole listing.
    async fn list_objects(
        &self,
        site: &str,
        project_filter: Option<&[String]>,
    ) -> Result<Listing>;

    async fn download(&self, site: &str, id: &str, include_extract: bool) -> Result<Download>;
}
