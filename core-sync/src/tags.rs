//! # Tag Mapper
//!
//! Turns workbook metadata into an S3-compatible tag set.
//!
//! S3 object tags allow at most 10 pairs, keys up to 128 and values up to
//! 256 Unicode characters, drawn from letters, digits, spaces and
//! `+ - = . _ : / @`. Anything outside that set is replaced with `_`; overlong
//! values are truncated. Both cases are reported as warnings on the item
//! instead of failing it.
//!
//! Mapping is a pure function of the source metadata, so applying the same
//! workbook twice yields the same tags and the diff can compare them.

use bridge_traits::{SourceObject, TagSet};
use core_runtime::BackupConfig;

pub const MAX_TAGS: usize = 10;
pub const MAX_KEY_LEN: usize = 128;
pub const MAX_VALUE_LEN: usize = 256;

pub const REDACTED: &str = "REDACTED";
const REPLACEMENT_CHAR: char = '_';

/// Timestamp layout used in tag values.
pub const TAG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

pub const TAG_ID: &str = "tab_id";
pub const TAG_OWNER: &str = "tab_owner";
pub const TAG_CREATED_AT: &str = "tab_created_at";
pub const TAG_UPDATED_AT: &str = "tab_updated_at";
pub const TAG_DESCRIPTION: &str = "tab_description";
pub const TAG_PROJECT: &str = "tab_project";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedTags {
    pub tags: TagSet,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TagMapper {
    /// Lower-cased substrings that force a value to be redacted
    denylist: Vec<String>,
}

impl TagMapper {
    pub fn new<I, S>(denylist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            denylist: denylist
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(&config.tag_denylist)
    }

    pub fn map(&self, object: &SourceObject) -> MappedTags {
        let mut raw: Vec<(&str, String)> = vec![(TAG_ID, object.id.clone())];
        if let Some(owner) = &object.owner {
            raw.push((TAG_OWNER, owner.clone()));
        }
        if let Some(created_at) = object.created_at {
            raw.push((TAG_CREATED_AT, created_at.format(TAG_TIME_FORMAT).to_string()));
        }
        raw.push((TAG_UPDATED_AT, object.updated_at.format(TAG_TIME_FORMAT).to_string()));
        if let Some(description) = object.description.as_deref().filter(|d| !d.is_empty()) {
            raw.push((TAG_DESCRIPTION, description.to_string()));
        }
        if !object.project_path.is_empty() {
            raw.push((TAG_PROJECT, object.project_path.clone()));
        }

        let mut mapped = MappedTags::default();
        for (key, value) in raw {
            if mapped.tags.len() == MAX_TAGS {
                mapped.warnings.push(format!("tag {} dropped: limit of {} tags", key, MAX_TAGS));
                continue;
            }
            let value = self.clean_value(key, &value, &mut mapped.warnings);
            let key = clean_key(key, &mut mapped.warnings);
            mapped.tags.insert(key, value);
        }
        mapped
    }

    fn clean_value(&self, key: &str, value: &str, warnings: &mut Vec<String>) -> String {
        let lowered = value.to_lowercase();
        if self.denylist.iter().any(|needle| lowered.contains(needle)) {
            warnings.push(format!("tag {} redacted", key));
            return REDACTED.to_string();
        }

        let (cleaned, replaced) = sanitize(value);
        if replaced {
            warnings.push(format!("tag {} had unsupported characters replaced", key));
        }
        let (cleaned, truncated) = truncate(cleaned, MAX_VALUE_LEN);
        if truncated {
            warnings.push(format!("tag {} truncated to {} characters", key, MAX_VALUE_LEN));
        }
        cleaned
    }
}

fn clean_key(key: &str, warnings: &mut Vec<String>) -> String {
    let (cleaned, replaced) = sanitize(key);
    let (cleaned, truncated) = truncate(cleaned, MAX_KEY_LEN);
    if replaced || truncated {
        warnings.push(format!("tag key {} adjusted", key));
    }
    cleaned
}

pub fn is_allowed_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, ' ' | '+' | '-' | '=' | '.' | '_' | ':' | '/' | '@')
}

/// Replace characters S3 rejects. Returns whether anything changed.
pub fn sanitize(value: &str) -> (String, bool) {
    let mut replaced = false;
    let cleaned = value
        .chars()
        .map(|c| {
            if is_allowed_char(c) {
                c
            } else {
                replaced = true;
                REPLACEMENT_CHAR
            }
        })
        .collect();
    (cleaned, replaced)
}

fn truncate(value: String, max_chars: usize) -> (String, bool) {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (value[..byte_idx].to_string(), true),
        None => (value, false),
    }
}

/// Whether `tags` would be accepted by the destination as-is.
pub fn is_valid_tag_set(tags: &TagSet) -> bool {
    tags.len() <= MAX_TAGS
        && tags.iter().all(|(k, v)| {
            !k.is_empty()
                && k.chars().count() <= MAX_KEY_LEN
                && v.chars().count() <= MAX_VALUE_LEN
                && k.chars().all(is_allowed_char)
                && v.chars().all(is_allowed_char)
        })
}
