//! Three-way tree merging without rename detection.
//!
//! Produces a merge index: the cleanly merged entries plus a conflict triple
//! for every path where ancestor, ours and theirs cannot be reconciled
//! automatically. Rename detection is deliberately off - dataset blob paths
//! are derived from primary keys and tile names, so a "rename" would be a
//! key change, which the diff algebra models as delete+insert.

use std::collections::{BTreeMap, BTreeSet};

use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::store::ObjectDb;

/// A cleanly merged blob.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub oid: ObjectHash,
}

/// One conflicted path: the blob versions in ancestor, ours and theirs
/// (absent side = deletion on that side).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConflictTriple {
    pub path: String,
    pub ancestor: Option<ObjectHash>,
    pub ours: Option<ObjectHash>,
    pub theirs: Option<ObjectHash>,
}

impl ConflictTriple {
    /// The version for a named side, if that side has one.
    pub fn version(&self, side: &str) -> Option<ObjectHash> {
        match side {
            "ancestor" => self.ancestor,
            "ours" => self.ours,
            "theirs" => self.theirs,
            _ => None,
        }
    }
}

/// The outcome of a three-way tree merge: clean entries plus conflicts.
#[derive(Debug, Default)]
pub struct TreeMergeIndex {
    pub entries: Vec<IndexEntry>,
    pub conflicts: Vec<ConflictTriple>,
}

impl TreeMergeIndex {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Materialize the cleanly merged portion as a tree in the store.
    pub fn write_tree(&self, odb: &ObjectDb) -> Result<ObjectHash, StrataError> {
        let map: BTreeMap<String, ObjectHash> = self
            .entries
            .iter()
            .map(|e| (e.path.clone(), e.oid))
            .collect();
        odb.build_tree(&map)
    }
}

/// Merge `ours` and `theirs` against their common `ancestor`, blob by blob.
///
/// The classic rule per path: if only one side changed relative to the
/// ancestor, that side wins; if both sides changed identically, either wins;
/// if both sides changed differently (including change-vs-delete), it's a
/// conflict.
pub fn merge_trees(
    odb: &ObjectDb,
    ancestor_tree: ObjectHash,
    ours_tree: ObjectHash,
    theirs_tree: ObjectHash,
) -> Result<TreeMergeIndex, StrataError> {
    let ancestor = odb.flatten_tree(ancestor_tree)?;
    let ours = odb.flatten_tree(ours_tree)?;
    let theirs = odb.flatten_tree(theirs_tree)?;

    let paths: BTreeSet<&String> = ancestor
        .keys()
        .chain(ours.keys())
        .chain(theirs.keys())
        .collect();

    let mut index = TreeMergeIndex::default();
    for path in paths {
        let a = ancestor.get(path).copied();
        let o = ours.get(path).copied();
        let t = theirs.get(path).copied();

        let merged = if o == t {
            o
        } else if a == o {
            t
        } else if a == t {
            o
        } else {
            index.conflicts.push(ConflictTriple {
                path: path.clone(),
                ancestor: a,
                ours: o,
                theirs: t,
            });
            continue;
        };

        if let Some(oid) = merged {
            index.entries.push(IndexEntry {
                path: path.clone(),
                oid,
            });
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_for_test};

    fn tree_of(odb: &ObjectDb, files: &[(&str, &str)]) -> ObjectHash {
        let map: BTreeMap<String, ObjectHash> = files
            .iter()
            .map(|(path, content)| {
                (
                    path.to_string(),
                    odb.write_blob(content.as_bytes().to_vec()),
                )
            })
            .collect();
        odb.build_tree(&map).unwrap()
    }

    #[test]
    fn test_clean_merge() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let ancestor = tree_of(&odb, &[("f/1", "a"), ("f/2", "b")]);
        let ours = tree_of(&odb, &[("f/1", "a"), ("f/2", "b"), ("f/3", "c")]);
        let theirs = tree_of(&odb, &[("f/1", "a"), ("f/2", "B")]);

        let index = merge_trees(&odb, ancestor, ours, theirs).unwrap();
        assert!(!index.has_conflicts());

        let merged = index.write_tree(&odb).unwrap();
        let expected = tree_of(&odb, &[("f/1", "a"), ("f/2", "B"), ("f/3", "c")]);
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_both_sides_same_change_is_clean() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let ancestor = tree_of(&odb, &[("f/1", "a")]);
        let ours = tree_of(&odb, &[("f/1", "same")]);
        let theirs = tree_of(&odb, &[("f/1", "same")]);
        let index = merge_trees(&odb, ancestor, ours, theirs).unwrap();
        assert!(!index.has_conflicts());
    }

    #[test]
    fn test_edit_edit_conflict() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let ancestor = tree_of(&odb, &[("f/1", "a")]);
        let ours = tree_of(&odb, &[("f/1", "X")]);
        let theirs = tree_of(&odb, &[("f/1", "Y")]);

        let index = merge_trees(&odb, ancestor, ours, theirs).unwrap();
        assert_eq!(index.conflicts.len(), 1);
        let conflict = &index.conflicts[0];
        assert_eq!(conflict.path, "f/1");
        assert!(conflict.ancestor.is_some());
        assert!(conflict.ours.is_some());
        assert!(conflict.theirs.is_some());
        assert_ne!(conflict.ours, conflict.theirs);
    }

    #[test]
    fn test_edit_delete_conflict() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let ancestor = tree_of(&odb, &[("f/1", "a")]);
        let ours = tree_of(&odb, &[("f/1", "X")]);
        let theirs = tree_of(&odb, &[]);

        let index = merge_trees(&odb, ancestor, ours, theirs).unwrap();
        assert_eq!(index.conflicts.len(), 1);
        assert_eq!(index.conflicts[0].theirs, None);
    }

    #[test]
    fn test_delete_delete_is_clean() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let ancestor = tree_of(&odb, &[("f/1", "a"), ("f/2", "b")]);
        let ours = tree_of(&odb, &[("f/2", "b")]);
        let theirs = tree_of(&odb, &[("f/2", "b")]);

        let index = merge_trees(&odb, ancestor, ours, theirs).unwrap();
        assert!(!index.has_conflicts());
        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.entries[0].path, "f/2");
    }
}
