//! Tableau REST API connector implementation
//!
//! Implements the `SourceInventory` trait for the Tableau Server REST API.

use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::inventory::{
    path_is_under, Download, Listing, RejectedObject, SiteInfo, SourceInventory, SourceObject,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result as TableauResult, TableauError};
use crate::types::{
    ErrorResponse, Paged, ProjectsResponse, SitesResponse, TsProject, TsUser, TsWorkbook,
    UsersResponse, WorkbooksResponse,
};

/// Default REST API version
pub const DEFAULT_API_VERSION: &str = "3.19";

/// Maximum page size accepted by the REST API
const MAX_PAGE_SIZE: u32 = 1000;

/// Authentication header expected by the REST API
const AUTH_HEADER: &str = "X-Tableau-Auth";

const BYTES_PER_MB: u64 = 1_048_576;

/// Tableau Server REST API connector
///
/// Implements `SourceInventory` for one Tableau Server.
///
/// # Features
///
/// - Paginated listing of sites, projects, users and workbooks
/// - Project hierarchy resolved into `Parent/Child` paths
/// - Owner user names and workbook tags carried into `SourceObject`
/// - Streaming downloads through `HttpClient::download_stream`
/// - Bounded retry with exponential backoff for listing calls only
///
/// # Example
///
/// ```ignore
/// use provider_tableau::TableauConnector;
/// use bridge_traits::SourceInventory;
///
/// let connector = TableauConnector::new(http_client, "https://tableau.example.com", "3.19", token);
/// let workbooks = connector.list_objects("Finance", None).await?;
/// ```
pub struct TableauConnector {
    /// HTTP client for API requests
    http_client: Arc<dyn HttpClient>,

    /// `{server}/api/{version}`
    api_base: String,

    /// Session token sent as `X-Tableau-Auth`
    auth_token: String,

    page_size: u32,

    max_retries: u32,

    /// Request embedded extracts on download
    extract_downloads: bool,

    /// Site name or content URL to site id
    site_ids: RwLock<HashMap<String, String>>,
}

impl TableauConnector {
    /// Create a new Tableau connector
    ///
    /// # Arguments
    ///
    /// * `http_client` - HTTP client implementation
    /// * `server_url` - Server root, e.g. `https://tableau.example.com`
    /// * `api_version` - REST API version, e.g. `3.19`
    /// * `auth_token` - Session token valid for every site to be backed up
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        server_url: &str,
        api_version: &str,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            api_base: format!("{}/api/{}", server_url.trim_end_matches('/'), api_version),
            auth_token: auth_token.into(),
            page_size: 100,
            max_retries: 3,
            extract_downloads: true,
            site_ids: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Whether listed workbooks are marked as carrying extracts.
    ///
    /// The listing endpoint does not say whether a workbook embeds an
    /// extract, so by default every workbook is first downloaded with
    /// extracts and the pipeline falls back on failure.
    pub fn with_extract_downloads(mut self, enabled: bool) -> Self {
        self.extract_downloads = enabled;
        self
    }

    fn request(&self, url: String) -> HttpRequest {
        HttpRequest::get(url)
            .header(AUTH_HEADER, self.auth_token.clone())
            .header("Accept", "application/json")
    }

    /// Parse RFC 3339 timestamp
    fn parse_timestamp(rfc3339: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(rfc3339)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Convert a non-success response into a `TableauError`
    fn api_error(response: &HttpResponse) -> TableauError {
        match serde_json::from_slice::<ErrorResponse>(&response.body) {
            Ok(body) => TableauError::ApiError {
                status_code: response.status,
                code: body.error.code,
                message: format!("{} {}", body.error.summary, body.error.detail)
                    .trim()
                    .to_string(),
            },
            Err(_) => TableauError::ApiError {
                status_code: response.status,
                code: String::new(),
                message: String::from_utf8_lossy(&response.body).to_string(),
            },
        }
    }

    /// Execute a GET with retry logic
    ///
    /// Retries transport failures, 429 and 5xx with exponential backoff.
    #[instrument(skip(self, url), fields(url = %url))]
    async fn execute_with_retry(&self, url: String) -> TableauResult<HttpResponse> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.http_client.execute(self.request(url.clone())).await {
                Ok(response) if response.is_success() => {
                    debug!(status = response.status, "API request succeeded");
                    return Ok(response);
                }
                Ok(response) => {
                    let error = Self::api_error(&response);
                    if !(response.status == 429 || (500..600).contains(&response.status)) {
                        warn!(status = response.status, "API request failed");
                        return Err(error);
                    }
                    error
                }
                Err(e) if e.is_transient() => TableauError::BridgeError(e),
                Err(e) => return Err(e.into()),
            };

            if attempt >= self.max_retries {
                warn!(attempts = attempt, error = %error, "API request failed, giving up");
                return Err(error);
            }

            let backoff_ms = 100u64 * 2u64.pow(attempt);
            warn!(
                "API request failed (attempt {}/{}): {}, retrying in {}ms",
                attempt, self.max_retries, error, backoff_ms
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        }
    }

    /// Fetch every page of a list endpoint
    async fn fetch_all<P>(&self, path: &str) -> TableauResult<Vec<P::Item>>
    where
        P: Paged + DeserializeOwned,
    {
        let separator = if path.contains('?') { '&' } else { '?' };
        let mut items = Vec::new();
        let mut page_number = 1u64;

        loop {
            let url = format!(
                "{}/{}{}pageSize={}&pageNumber={}",
                self.api_base, path, separator, self.page_size, page_number
            );
            let response = self.execute_with_retry(url).await?;
            let page: P = serde_json::from_slice(&response.body).map_err(|e| {
                TableauError::ParseError(format!("Failed to parse {} page: {}", path, e))
            })?;

            let has_more = page.pagination().has_more();
            let batch = page.into_items();
            let empty = batch.is_empty();
            items.extend(batch);

            if !has_more || empty {
                return Ok(items);
            }
            page_number += 1;
        }
    }

    /// Resolve a site name (or content URL) to its id
    async fn site_id(&self, site: &str) -> TableauResult<String> {
        if let Some(id) = self.site_ids.read().await.get(site) {
            return Ok(id.clone());
        }

        self.list_sites().await?;
        self.site_ids
            .read()
            .await
            .get(site)
            .cloned()
            .ok_or_else(|| TableauError::SiteNotFound(site.to_string()))
    }

    /// Map every project id to its full path, e.g. `Finance/Quarterly`
    pub fn project_paths(projects: &[TsProject]) -> HashMap<String, String> {
        let by_id: HashMap<&str, &TsProject> =
            projects.iter().map(|p| (p.id.as_str(), p)).collect();

        projects
            .iter()
            .map(|project| {
                let mut segments = vec![project.name.as_str()];
                let mut parent = project.parent_project_id.as_deref();
                // Bounded walk in case the server ever reports a cycle
                for _ in 0..projects.len() {
                    let Some(parent_project) = parent.and_then(|id| by_id.get(id)) else {
                        break;
                    };
                    segments.push(parent_project.name.as_str());
                    parent = parent_project.parent_project_id.as_deref();
                }
                segments.reverse();
                (project.id.clone(), segments.join("/"))
            })
            .collect()
    }

    /// Convert a workbook resource to `SourceObject`
    fn convert_workbook(
        &self,
        workbook: TsWorkbook,
        project_paths: &HashMap<String, String>,
        users: &HashMap<String, String>,
    ) -> std::result::Result<SourceObject, RejectedObject> {
        let project_path = workbook
            .project
            .as_ref()
            .and_then(|p| {
                project_paths
                    .get(&p.id)
                    .cloned()
                    .or_else(|| p.name.clone())
            })
            .unwrap_or_default();

        let Some(updated_at) = Self::parse_timestamp(&workbook.updated_at) else {
            return Err(RejectedObject {
                reason: format!("invalid updatedAt {:?}", workbook.updated_at),
                id: workbook.id,
                name: workbook.name,
                project_path,
            });
        };

        let mut object = SourceObject::new(workbook.id, workbook.name, project_path, updated_at)
            .with_extract(self.extract_downloads);

        object.owner = workbook
            .owner
            .as_ref()
            .and_then(|o| users.get(&o.id).cloned().or_else(|| o.name.clone()));
        object.created_at = workbook.created_at.as_deref().and_then(Self::parse_timestamp);
        object.description = workbook.description.filter(|d| !d.is_empty());
        object.size_hint = workbook
            .size
            .as_deref()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|mb| mb.saturating_mul(BYTES_PER_MB));
        object.labels = workbook.tags.tag.into_iter().map(|t| t.label).collect();
        if let Some(content_url) = workbook.content_url {
            object
                .extra
                .insert("content_url".to_string(), serde_json::Value::String(content_url));
        }

        Ok(object)
    }

    async fn list_objects_inner(
        &self,
        site: &str,
        project_filter: Option<&[String]>,
    ) -> TableauResult<Listing> {
        let site_id = self.site_id(site).await?;
        let base = format!("sites/{}", site_id);

        let projects: Vec<TsProject> = self
            .fetch_all::<ProjectsResponse>(&format!("{}/projects", base))
            .await?;
        let project_paths = Self::project_paths(&projects);

        if let Some(filter) = project_filter {
            for wanted in filter {
                let wanted = wanted.trim_matches('/');
                if !project_paths.values().any(|p| p == wanted) {
                    warn!(site, project = wanted, "Project not found");
                }
            }
        }

        let users: HashMap<String, String> = self
            .fetch_all::<UsersResponse>(&format!("{}/users", base))
            .await?
            .into_iter()
            .map(|u: TsUser| (u.id, u.name))
            .collect();

        let workbooks: Vec<TsWorkbook> = self
            .fetch_all::<WorkbooksResponse>(&format!("{}/workbooks", base))
            .await?;

        let in_scope = |project_path: &str| {
            project_filter.map_or(true, |filter| {
                filter.iter().any(|root| path_is_under(project_path, root))
            })
        };

        let mut listing = Listing::new(Vec::with_capacity(workbooks.len()));
        for workbook in workbooks {
            match self.convert_workbook(workbook, &project_paths, &users) {
                Ok(object) if in_scope(&object.project_path) => listing.objects.push(object),
                Ok(_) => {}
                Err(rejected) if in_scope(&rejected.project_path) => {
                    warn!(site, id = %rejected.id, reason = %rejected.reason, "Workbook metadata unusable");
                    listing.rejected.push(rejected);
                }
                Err(_) => {}
            }
        }

        Ok(listing)
    }
}

/// Extract the file name from a `Content-Disposition` header
pub fn file_name_from_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';').map(str::trim) {
        if let Some(value) = part.strip_prefix("filename*=") {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
            if let Ok(decoded) = urlencoding::decode(encoded.trim_matches('"')) {
                if !decoded.is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        } else if let Some(value) = part.strip_prefix("filename=") {
            plain = Some(value.trim_matches('"').to_string());
        }
    }
    plain.filter(|name| !name.is_empty())
}

#[async_trait]
impl SourceInventory for TableauConnector {
    #[instrument(skip(self))]
    async fn list_sites(&self) -> Result<Vec<SiteInfo>> {
        let sites = self.fetch_all::<SitesResponse>("sites").await?;

        let mut cache = self.site_ids.write().await;
        for site in &sites {
            cache.insert(site.name.clone(), site.id.clone());
            if !site.content_url.is_empty() {
                cache.insert(site.content_url.clone(), site.id.clone());
            }
        }

        info!("Listed {} sites", sites.len());
        Ok(sites
            .into_iter()
            .map(|s| SiteInfo {
                id: s.id,
                name: s.name,
                content_url: s.content_url,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        site: &str,
        project_filter: Option<&[String]>,
    ) -> Result<Listing> {
        let listing = self.list_objects_inner(site, project_filter).await?;
        info!(site, rejected = listing.rejected.len(), "Listed {} workbooks", listing.objects.len());
        Ok(listing)
    }

    #[instrument(skip(self))]
    async fn download(&self, site: &str, id: &str, include_extract: bool) -> Result<Download> {
        let site_id = self.site_id(site).await?;
        let url = format!(
            "{}/sites/{}/workbooks/{}/content?includeExtract={}",
            self.api_base, site_id, id, include_extract
        );

        let response = self
            .http_client
            .download_stream(self.request(url))
            .await
            .map_err(|e| match e {
                BridgeError::NotFound(_) => TableauError::WorkbookNotFound {
                    workbook_id: id.to_string(),
                }
                .into(),
                other => other,
            })?;

        let file_name = response
            .header("Content-Disposition")
            .and_then(file_name_from_disposition)
            .unwrap_or_else(|| format!("{}.twbx", id));

        debug!(file_name = %file_name, "Download started");
        Ok(Download {
            file_name,
            body: response.body,
        })
    }
}
