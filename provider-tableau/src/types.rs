//! Tableau REST API response types
//!
//! Data structures for deserializing JSON responses (`Accept:
//! application/json`). Every list endpoint wraps its items twice, e.g.
//! `{"workbooks": {"workbook": [...]}}`, and reports paging with numbers
//! encoded as strings.

use serde::{Deserialize, Deserializer};

fn number_from_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Paging block returned by every list endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(deserialize_with = "number_from_string")]
    pub page_number: u64,

    #[serde(deserialize_with = "number_from_string")]
    pub page_size: u64,

    #[serde(deserialize_with = "number_from_string")]
    pub total_available: u64,
}

impl Pagination {
    pub fn has_more(&self) -> bool {
        self.page_number.saturating_mul(self.page_size) < self.total_available
    }
}

/// A list response page.
pub trait Paged {
    type Item;

    fn pagination(&self) -> &Pagination;

    fn into_items(self) -> Vec<Self::Item>;
}

macro_rules! paged_response {
    ($response:ident, $outer:ident, $list:ident, $inner:ident, $item:ty) => {
        #[derive(Debug, Deserialize)]
        pub struct $list {
            #[serde(default)]
            pub $inner: Vec<$item>,
        }

        #[derive(Debug, Deserialize)]
        pub struct $response {
            pub pagination: Pagination,
            #[serde(default)]
            pub $outer: Option<$list>,
        }

        impl Paged for $response {
            type Item = $item;

            fn pagination(&self) -> &Pagination {
                &self.pagination
            }

            fn into_items(self) -> Vec<$item> {
                self.$outer.map(|l| l.$inner).unwrap_or_default()
            }
        }
    };
}

/// Site resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsSite {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub content_url: String,
}

/// Project resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsProject {
    pub id: String,
    pub name: String,
    /// Absent for top-level projects
    #[serde(default)]
    pub parent_project_id: Option<String>,
}

/// User resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsUser {
    pub id: String,
    /// Sign-in name
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TsRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TsTag {
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TsTags {
    #[serde(default)]
    pub tag: Vec<TsTag>,
}

/// Workbook resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TsWorkbook {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content_url: Option<String>,
    /// RFC 3339
    pub created_at: Option<String>,
    /// RFC 3339
    pub updated_at: String,
    /// Size in megabytes, as a string
    #[serde(default)]
    pub size: Option<String>,
    pub project: Option<TsRef>,
    pub owner: Option<TsRef>,
    #[serde(default)]
    pub tags: TsTags,
}

paged_response!(SitesResponse, sites, SiteList, site, TsSite);
paged_response!(ProjectsResponse, projects, ProjectList, project, TsProject);
paged_response!(UsersResponse, users, UserList, user, TsUser);
paged_response!(WorkbooksResponse, workbooks, WorkbookList, workbook, TsWorkbook);

/// Error body: `{"error": {"summary", "detail", "code"}}`
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_workbooks_page() {
        let json = r#"{
            "pagination": {"pageNumber": "1", "pageSize": "100", "totalAvailable": "2"},
            "workbooks": {"workbook": [
                {
                    "id": "wb-1",
                    "name": "Sales",
                    "description": "",
                    "createdAt": "2023-01-01T00:00:00Z",
                    "updatedAt": "2024-02-01T10:00:00Z",
                    "size": "3",
                    "project": {"id": "p-1", "name": "Finance"},
                    "owner": {"id": "u-1"},
                    "tags": {"tag": [{"label": "WBBackupIgnoreErrors"}]}
                },
                {
                    "id": "wb-2",
                    "name": "Ops",
                    "updatedAt": "2024-02-01T10:00:00Z",
                    "project": {"id": "p-2"},
                    "owner": {"id": "u-2"},
                    "tags": {}
                }
            ]}
        }"#;

        let page: WorkbooksResponse = serde_json::from_str(json).unwrap();
        assert!(!page.pagination().has_more());
        let items = page.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].tags.tag[0].label, "WBBackupIgnoreErrors");
        assert!(items[1].tags.tag.is_empty());
    }

    #[test]
    fn test_empty_list_page() {
        let json = r#"{"pagination": {"pageNumber": "1", "pageSize": "100", "totalAvailable": "0"}, "projects": {}}"#;
        let page: ProjectsResponse = serde_json::from_str(json).unwrap();
        assert!(page.into_items().is_empty());
    }

    #[test]
    fn test_pagination_has_more() {
        let pagination = Pagination {
            page_number: 1,
            page_size: 100,
            total_available: 101,
        };
        assert!(pagination.has_more());
    }
}
