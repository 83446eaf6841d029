//! # Inventory Diff
//!
//! Compares the live workbook listing of a site with its snapshot and decides
//! what the pipeline has to do.
//!
//! | Source                 | Snapshot                  | Action        |
//! |------------------------|---------------------------|---------------|
//! | present                | missing                   | `Upload`      |
//! | `updated_at` differs   | present                   | `Upload`      |
//! | renamed or moved       | present                   | `Upload`      |
//! | same `updated_at`      | tags differ               | `RetagOnly`   |
//! | same `updated_at`      | same tags                 | nothing       |
//! | missing                | present, absent N times   | `MarkRemoved` |
//!
//! Removal needs `confirmation_runs` consecutive listings without the id so
//! that a single flaky listing never deletes anything. The running counts are
//! returned in [`Changeset::absence_counters`] for the coordinator to persist.
//! Rejected listing entries count as present but produce no item.

use crate::state::{StateEntry, StateSnapshot};
use crate::tags::TagMapper;
use bridge_traits::inventory::path_is_under;
use bridge_traits::{RejectedObject, SourceObject, TagSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Upload,
    RetagOnly,
    MarkRemoved,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Upload => "upload",
            ChangeAction::RetagOnly => "retag_only",
            ChangeAction::MarkRemoved => "mark_removed",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work for the pipeline.
#[derive(Debug, Clone)]
pub struct ChangeItem {
    pub id: String,
    pub action: ChangeAction,
    /// Absent for `MarkRemoved`
    pub source: Option<SourceObject>,
    /// Snapshot entry at run start, if any
    pub previous: Option<StateEntry>,
    /// Mapped tags for `Upload` and `RetagOnly`
    pub tags: TagSet,
    pub tag_warnings: Vec<String>,
}

impl ChangeItem {
    pub fn project_path(&self) -> &str {
        self.source
            .as_ref()
            .map(|s| s.project_path.as_str())
            .or(self.previous.as_ref().map(|p| p.project_path.as_str()))
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.source
            .as_ref()
            .map(|s| s.name.as_str())
            .or(self.previous.as_ref().map(|p| p.name.as_str()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Changeset {
    /// Sorted by id
    pub items: Vec<ChangeItem>,
    /// Ids present in both listing and snapshot that need no work
    pub unchanged: Vec<String>,
    /// New `absent_runs` value for every snapshot entry in scope
    pub absence_counters: BTreeMap<String, u32>,
}

impl Changeset {
    pub fn count(&self, action: ChangeAction) -> usize {
        self.items.iter().filter(|i| i.action == action).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct InventoryDiff<'a> {
    mapper: &'a TagMapper,
    confirmation_runs: u32,
    project_filter: Option<&'a [String]>,
    rejected: &'a [RejectedObject],
}

impl<'a> InventoryDiff<'a> {
    pub fn new(mapper: &'a TagMapper, confirmation_runs: u32) -> Self {
        Self {
            mapper,
            confirmation_runs: confirmation_runs.max(1),
            project_filter: None,
            rejected: &[],
        }
    }

    /// Ids the source listed without usable metadata.
    pub fn with_rejected(mut self, rejected: &'a [RejectedObject]) -> Self {
        self.rejected = rejected;
        self
    }

    /// Restrict removal detection to entries under these project paths.
    pub fn with_project_filter(mut self, filter: Option<&'a [String]>) -> Self {
        self.project_filter = filter;
        self
    }

    fn in_scope(&self, entry: &StateEntry) -> bool {
        match self.project_filter {
            None => true,
            Some(projects) => projects
                .iter()
                .any(|root| path_is_under(&entry.project_path, root)),
        }
    }

    pub fn compute(&self, listing: &[SourceObject], snapshot: &StateSnapshot) -> Changeset {
        let mut changeset = Changeset::default();
        let mut seen: HashSet<&str> = HashSet::with_capacity(listing.len() + self.rejected.len());

        for rejected in self.rejected {
            seen.insert(rejected.id.as_str());
            if snapshot.get(&rejected.id).is_some_and(|e| e.absent_runs > 0) {
                changeset.absence_counters.insert(rejected.id.clone(), 0);
            }
        }

        for object in listing {
            seen.insert(object.id.as_str());
            let mapped = self.mapper.map(object);
            let previous = snapshot.get(&object.id);

            if let Some(entry) = previous {
                if entry.absent_runs > 0 {
                    changeset.absence_counters.insert(object.id.clone(), 0);
                }
            }

            let action = match previous {
                None => Some(ChangeAction::Upload),
                Some(entry) if entry.updated_at != object.updated_at => Some(ChangeAction::Upload),
                Some(entry) if entry.name != object.name || entry.project_path != object.project_path => {
                    Some(ChangeAction::Upload)
                }
                Some(entry) if entry.tags != mapped.tags => Some(ChangeAction::RetagOnly),
                Some(_) => None,
            };

            match action {
                Some(action) => changeset.items.push(ChangeItem {
                    id: object.id.clone(),
                    action,
                    source: Some(object.clone()),
                    previous: previous.cloned(),
                    tags: mapped.tags,
                    tag_warnings: mapped.warnings,
                }),
                None => changeset.unchanged.push(object.id.clone()),
            }
        }

        for (id, entry) in &snapshot.entries {
            if seen.contains(id.as_str()) || !self.in_scope(entry) {
                continue;
            }

            let absent_runs = entry.absent_runs.saturating_add(1);
            changeset.absence_counters.insert(id.clone(), absent_runs);

            if absent_runs >= self.confirmation_runs {
                changeset.items.push(ChangeItem {
                    id: id.clone(),
                    action: ChangeAction::MarkRemoved,
                    source: None,
                    previous: Some(entry.clone()),
                    tags: entry.tags.clone(),
                    tag_warnings: Vec::new(),
                });
            }
        }

        // Stable sort keeps listing order for duplicate ids
        changeset.items.sort_by(|a, b| a.id.cmp(&b.id));
        changeset.unchanged.sort();
        changeset.unchanged.dedup();
        changeset
    }
}
