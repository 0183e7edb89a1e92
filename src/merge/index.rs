//! The merged index: the persisted state of an in-progress merge - cleanly
//! merged entries, conflict triples, and accepted resolutions - plus the
//! stable human-readable labels conflicts are addressed by.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dataset::{DatasetKind, tabular};
use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::merge_trees::{ConflictTriple, IndexEntry, TreeMergeIndex};
use crate::odb::store::ObjectDb;
use crate::repo::{Repo, RepoFiles};

/// The decoded parts of a conflicted blob path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPath {
    /// The dataset the path belongs to, when it belongs to one.
    pub dataset_path: Option<String>,
    /// `meta`, `feature` or `tile` (datasets only).
    pub section: Option<String>,
    /// The item key: a meta item name, a display primary key, or a tile
    /// name.
    pub key: String,
}

/// Split a repository blob path into dataset path, section and item key.
pub fn decode_conflict_path(path: &str) -> DecodedPath {
    let segments: Vec<&str> = path.split('/').collect();
    let marker = segments
        .iter()
        .position(|s| DatasetKind::looks_like_dataset_dirname(s));
    let Some(marker) = marker else {
        // A plain attachment or top-level file.
        return DecodedPath {
            dataset_path: None,
            section: None,
            key: path.to_string(),
        };
    };

    let dataset_path = segments[..marker].join("/");
    let rest = &segments[marker + 1..];
    let (section, key) = match rest {
        ["feature", .., encoded] => (
            "feature",
            tabular::feature_key_from_encoded_name(encoded)
                .unwrap_or_else(|_| (*encoded).to_string()),
        ),
        ["tile", .., tilename] => ("tile", (*tilename).to_string()),
        ["meta", tail @ ..] => ("meta", tail.join("/")),
        other => ("meta", other.join("/")),
    };
    DecodedPath {
        dataset_path: Some(dataset_path),
        section: Some(section.to_string()),
        key,
    }
}

/// The stable label a conflict is selected by, e.g. `points:feature:42`.
pub fn conflict_label(path: &str) -> String {
    let decoded = decode_conflict_path(path);
    match (decoded.dataset_path, decoded.section) {
        (Some(ds), Some(section)) => format!("{ds}:{section}:{}", decoded.key),
        _ => decoded.key,
    }
}

/// The persisted state of an in-progress merge.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MergedIndex {
    /// Cleanly merged blobs.
    pub entries: Vec<IndexEntry>,
    /// Conflicts, keyed by conflicted path.
    pub conflicts: BTreeMap<String, ConflictTriple>,
    /// Accepted resolutions, keyed like `conflicts`. An empty entry list
    /// resolves the conflict as a deletion.
    pub resolves: BTreeMap<String, Vec<IndexEntry>>,
}

impl MergedIndex {
    pub fn from_tree_merge(tree_merge: TreeMergeIndex) -> MergedIndex {
        MergedIndex {
            entries: tree_merge.entries,
            conflicts: tree_merge
                .conflicts
                .into_iter()
                .map(|c| (c.path.clone(), c))
                .collect(),
            resolves: BTreeMap::new(),
        }
    }

    pub fn total_conflicts(&self) -> usize {
        self.conflicts.len()
    }

    pub fn resolved_count(&self) -> usize {
        self.resolves.len()
    }

    pub fn unresolved_count(&self) -> usize {
        self.conflicts
            .keys()
            .filter(|path| !self.resolves.contains_key(*path))
            .count()
    }

    /// The conflicts not yet resolved, keyed by path.
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = (&String, &ConflictTriple)> {
        self.conflicts
            .iter()
            .filter(|(path, _)| !self.resolves.contains_key(*path))
    }

    /// Find a conflict by its label.
    pub fn conflict_for_label(&self, label: &str) -> Option<(&String, &ConflictTriple)> {
        self.conflicts
            .iter()
            .find(|(path, _)| conflict_label(path) == label)
    }

    /// Record a resolution for the conflict at `path`.
    pub fn add_resolve(&mut self, path: &str, entries: Vec<IndexEntry>) {
        self.resolves.insert(path.to_string(), entries);
    }

    /// The tree of everything merged so far: clean entries plus accepted
    /// resolutions (unresolved conflicts can't be represented and are
    /// omitted).
    pub fn write_merged_tree(&self, odb: &ObjectDb) -> Result<ObjectHash, StrataError> {
        let mut blobs: BTreeMap<String, ObjectHash> = self
            .entries
            .iter()
            .map(|e| (e.path.clone(), e.oid))
            .collect();
        for entries in self.resolves.values() {
            for entry in entries {
                blobs.insert(entry.path.clone(), entry.oid);
            }
        }
        odb.build_tree(&blobs)
    }

    /// The fully resolved tree. Callers must check there are no unresolved
    /// conflicts first.
    pub fn write_resolved_tree(&self, odb: &ObjectDb) -> Result<ObjectHash, StrataError> {
        self.write_merged_tree(odb)
    }

    /// Persist to the MERGED_INDEX file (atomically).
    pub fn write_to_repo(&self, repo: &Repo) -> Result<(), StrataError> {
        let text = serde_json::to_string(self)?;
        repo.write_gitdir_file(RepoFiles::MERGED_INDEX, &text)
    }

    pub fn read_from_repo(repo: &Repo) -> Result<MergedIndex, StrataError> {
        let text = repo.read_gitdir_file(RepoFiles::MERGED_INDEX, false)?;
        Ok(serde_json::from_str(&text)?)
    }
}
