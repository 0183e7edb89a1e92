//! The in-process object store: content-addressed objects in a concurrent
//! map, plus reference CRUD, history walking and merge-base computation.
//!
//! Reads are safe from any thread. All mutation of dataset content is
//! expected to arrive through the streaming importer, which serializes
//! writes on a single producer thread.

use std::collections::{BTreeMap, HashSet, VecDeque};

use dashmap::DashMap;

use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::ObjectTrait;
use crate::odb::blob::Blob;
use crate::odb::commit::Commit;
use crate::odb::tree::{EntryMode, Tree, TreeEntry};
use crate::odb::types::ObjectType;

/// One stored object: its type tag and raw payload.
#[derive(Clone, Debug)]
struct StoredObject {
    obj_type: ObjectType,
    data: Vec<u8>,
}

/// A content-addressed object database with a reference table.
#[derive(Default)]
pub struct ObjectDb {
    objects: DashMap<ObjectHash, StoredObject>,
    refs: DashMap<String, ObjectHash>,
}

impl ObjectDb {
    pub fn new() -> ObjectDb {
        ObjectDb::default()
    }

    pub fn contains(&self, oid: &ObjectHash) -> bool {
        self.objects.contains_key(oid)
    }

    fn put(&self, obj_type: ObjectType, data: Vec<u8>) -> ObjectHash {
        let oid = ObjectHash::from_type_and_data(obj_type, &data);
        self.objects
            .entry(oid)
            .or_insert(StoredObject { obj_type, data });
        oid
    }

    /// Store a blob, returning its OID. Idempotent.
    pub fn write_blob(&self, data: Vec<u8>) -> ObjectHash {
        self.put(ObjectType::Blob, data)
    }

    pub fn write_tree(&self, tree: &Tree) -> Result<ObjectHash, StrataError> {
        Ok(self.put(ObjectType::Tree, tree.to_data()?))
    }

    pub fn write_commit(&self, commit: &Commit) -> Result<ObjectHash, StrataError> {
        Ok(self.put(ObjectType::Commit, commit.to_data()?))
    }

    fn get(&self, oid: &ObjectHash, want: ObjectType) -> Result<Vec<u8>, StrataError> {
        let stored = self
            .objects
            .get(oid)
            .ok_or_else(|| StrataError::NotFound(format!("Object not found: {oid}")))?;
        if stored.obj_type != want {
            return Err(StrataError::InvalidOperation(format!(
                "Object {oid} is a {}, expected a {want}",
                stored.obj_type
            )));
        }
        Ok(stored.data.clone())
    }

    pub fn read_blob(&self, oid: &ObjectHash) -> Result<Blob, StrataError> {
        Blob::from_bytes(&self.get(oid, ObjectType::Blob)?, *oid)
    }

    pub fn read_tree(&self, oid: &ObjectHash) -> Result<Tree, StrataError> {
        Tree::from_bytes(&self.get(oid, ObjectType::Tree)?, *oid)
    }

    pub fn read_commit(&self, oid: &ObjectHash) -> Result<Commit, StrataError> {
        Commit::from_bytes(&self.get(oid, ObjectType::Commit)?, *oid)
    }

    /// The OID of the empty tree (writing it if absent).
    pub fn empty_tree(&self) -> ObjectHash {
        self.write_tree(&Tree::empty())
            .expect("empty tree always encodes")
    }

    // ---- references ------------------------------------------------------

    pub fn set_ref(&self, name: &str, oid: ObjectHash) {
        self.refs.insert(name.to_string(), oid);
    }

    pub fn get_ref(&self, name: &str) -> Option<ObjectHash> {
        self.refs.get(name).map(|r| *r)
    }

    pub fn delete_ref(&self, name: &str) {
        self.refs.remove(name);
    }

    pub fn ref_exists(&self, name: &str) -> bool {
        self.refs.contains_key(name)
    }

    pub fn ref_names(&self) -> Vec<String> {
        self.refs.iter().map(|r| r.key().clone()).collect()
    }

    /// Resolve a revision spec: a full hex OID, a full ref name, or a short
    /// branch name under `refs/heads/`.
    pub fn revparse(&self, revspec: &str) -> Result<ObjectHash, StrataError> {
        if let Some(oid) = self.get_ref(revspec) {
            return Ok(oid);
        }
        if let Some(oid) = self.get_ref(&format!("refs/heads/{revspec}")) {
            return Ok(oid);
        }
        if let Ok(oid) = revspec.parse::<ObjectHash>()
            && self.contains(&oid)
        {
            return Ok(oid);
        }
        Err(StrataError::NotFound(format!(
            "No commit or reference found for {revspec:?}"
        )))
    }

    // ---- traversal -------------------------------------------------------

    /// Walk the history starting at `from`, yielding each ancestor commit
    /// (including `from` itself) in reverse timestamp order.
    ///
    /// A missing parent - as happens in a shallow clone - yields an `Err`
    /// item and ends the walk.
    pub fn walk(&self, from: ObjectHash) -> impl Iterator<Item = Result<Commit, StrataError>> {
        Walk {
            odb: self,
            queue: VecDeque::from([from]),
            seen: HashSet::new(),
        }
    }

    /// The best common ancestor of two commits, or `None` when the commits
    /// are unrelated.
    pub fn merge_base(
        &self,
        a: ObjectHash,
        b: ObjectHash,
    ) -> Result<Option<ObjectHash>, StrataError> {
        let mut ancestors_of_a = HashSet::new();
        let mut queue = VecDeque::from([a]);
        while let Some(oid) = queue.pop_front() {
            if !ancestors_of_a.insert(oid) {
                continue;
            }
            if let Ok(commit) = self.read_commit(&oid) {
                queue.extend(commit.parent_commit_ids);
            }
        }

        // Breadth-first from b: the first ancestor of a we hit is the
        // closest common ancestor from b's side.
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([b]);
        while let Some(oid) = queue.pop_front() {
            if !seen.insert(oid) {
                continue;
            }
            if ancestors_of_a.contains(&oid) {
                return Ok(Some(oid));
            }
            if let Ok(commit) = self.read_commit(&oid) {
                queue.extend(commit.parent_commit_ids);
            }
        }
        Ok(None)
    }

    // ---- tree helpers ----------------------------------------------------

    /// Look up the entry at a slash-separated path below the given tree.
    pub fn entry_at_path(
        &self,
        tree_oid: ObjectHash,
        path: &str,
    ) -> Result<Option<TreeEntry>, StrataError> {
        let mut current = self.read_tree(&tree_oid)?;
        let mut segments = path.split('/').peekable();
        while let Some(segment) = segments.next() {
            let Some(entry) = current.get_entry(segment) else {
                return Ok(None);
            };
            if segments.peek().is_none() {
                return Ok(Some(entry.clone()));
            }
            if entry.mode != EntryMode::Tree {
                return Ok(None);
            }
            current = self.read_tree(&entry.oid)?;
        }
        Ok(None)
    }

    /// Flatten a tree into a `path -> blob OID` map. Paths are relative to
    /// the given tree; subtrees recurse.
    pub fn flatten_tree(
        &self,
        tree_oid: ObjectHash,
    ) -> Result<BTreeMap<String, ObjectHash>, StrataError> {
        let mut result = BTreeMap::new();
        let mut stack = vec![(String::new(), tree_oid)];
        while let Some((prefix, oid)) = stack.pop() {
            let tree = self.read_tree(&oid)?;
            for entry in tree.entries {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{prefix}/{}", entry.name)
                };
                match entry.mode {
                    EntryMode::Blob => {
                        result.insert(path, entry.oid);
                    }
                    EntryMode::Tree => stack.push((path, entry.oid)),
                }
            }
        }
        Ok(result)
    }

    /// Build (and store) a nested tree from a flat `path -> blob OID` map,
    /// returning the root tree OID.
    pub fn build_tree(
        &self,
        blobs: &BTreeMap<String, ObjectHash>,
    ) -> Result<ObjectHash, StrataError> {
        #[derive(Default)]
        struct Node {
            blobs: Vec<(String, ObjectHash)>,
            children: BTreeMap<String, Node>,
        }

        let mut root = Node::default();
        for (path, oid) in blobs {
            let mut node = &mut root;
            let mut segments: Vec<&str> = path.split('/').collect();
            let name = segments.pop().expect("paths are non-empty");
            for segment in segments {
                node = node.children.entry(segment.to_string()).or_default();
            }
            node.blobs.push((name.to_string(), *oid));
        }

        fn write_node(odb: &ObjectDb, node: &Node) -> Result<ObjectHash, StrataError> {
            let mut entries: Vec<TreeEntry> = node
                .blobs
                .iter()
                .map(|(name, oid)| TreeEntry::blob(name.clone(), *oid))
                .collect();
            for (name, child) in &node.children {
                let child_oid = write_node(odb, child)?;
                entries.push(TreeEntry::subtree(name.clone(), child_oid));
            }
            let tree = Tree::from_entries(entries)?;
            odb.write_tree(&tree)
        }

        write_node(self, &root)
    }

    /// Count the blobs below a subtree without reading any of them.
    pub fn count_blobs(&self, tree_oid: ObjectHash) -> Result<usize, StrataError> {
        let mut count = 0;
        let mut stack = vec![tree_oid];
        while let Some(oid) = stack.pop() {
            let tree = self.read_tree(&oid)?;
            for entry in tree.entries {
                match entry.mode {
                    EntryMode::Blob => count += 1,
                    EntryMode::Tree => stack.push(entry.oid),
                }
            }
        }
        Ok(count)
    }
}

struct Walk<'a> {
    odb: &'a ObjectDb,
    queue: VecDeque<ObjectHash>,
    seen: HashSet<ObjectHash>,
}

impl Iterator for Walk<'_> {
    type Item = Result<Commit, StrataError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let oid = self.queue.pop_front()?;
            if !self.seen.insert(oid) {
                continue;
            }
            match self.odb.read_commit(&oid) {
                Ok(commit) => {
                    let mut parents: Vec<_> = commit.parent_commit_ids.clone();
                    // Keep the walk roughly reverse-chronological.
                    parents.sort_by_key(|p| {
                        std::cmp::Reverse(
                            self.odb
                                .read_commit(p)
                                .map(|c| c.committer.timestamp)
                                .unwrap_or(0),
                        )
                    });
                    self.queue.extend(parents);
                    return Some(Ok(commit));
                }
                Err(e) => {
                    self.queue.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_for_test};
    use crate::odb::signature::{Signature, SignatureType};

    fn sig(t: SignatureType, ts: i64) -> Signature {
        Signature {
            signature_type: t,
            name: "tester".into(),
            email: "t@example.com".into(),
            timestamp: ts,
            timezone: "+0000".into(),
        }
    }

    fn commit_on(odb: &ObjectDb, parents: Vec<ObjectHash>, msg: &str, ts: i64) -> ObjectHash {
        let tree_oid = odb
            .build_tree(&BTreeMap::from([(
                format!("file-{msg}"),
                odb.write_blob(msg.as_bytes().to_vec()),
            )]))
            .unwrap();
        let commit = Commit::new(
            sig(SignatureType::Author, ts),
            sig(SignatureType::Committer, ts),
            tree_oid,
            parents,
            &format!("\n{msg}\n"),
        );
        odb.write_commit(&commit).unwrap()
    }

    #[test]
    fn test_blob_roundtrip() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let oid = odb.write_blob(b"payload".to_vec());
        assert_eq!(odb.read_blob(&oid).unwrap().data, b"payload");
        // idempotent
        assert_eq!(odb.write_blob(b"payload".to_vec()), oid);
    }

    #[test]
    fn test_build_and_flatten_tree() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let blobs = BTreeMap::from([
            ("a/b/c".to_string(), odb.write_blob(b"1".to_vec())),
            ("a/d".to_string(), odb.write_blob(b"2".to_vec())),
            ("e".to_string(), odb.write_blob(b"3".to_vec())),
        ]);
        let root = odb.build_tree(&blobs).unwrap();
        assert_eq!(odb.flatten_tree(root).unwrap(), blobs);
        assert_eq!(odb.count_blobs(root).unwrap(), 3);

        let entry = odb.entry_at_path(root, "a/b/c").unwrap().unwrap();
        assert_eq!(entry.oid, blobs["a/b/c"]);
        assert!(odb.entry_at_path(root, "a/x").unwrap().is_none());
    }

    #[test]
    fn test_merge_base() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let base = commit_on(&odb, vec![], "base", 1);
        let ours = commit_on(&odb, vec![base], "ours", 2);
        let theirs = commit_on(&odb, vec![base], "theirs", 3);
        assert_eq!(odb.merge_base(ours, theirs).unwrap(), Some(base));
        assert_eq!(odb.merge_base(ours, base).unwrap(), Some(base));

        let unrelated = commit_on(&odb, vec![], "island", 4);
        assert_eq!(odb.merge_base(ours, unrelated).unwrap(), None);
    }

    #[test]
    fn test_walk_order_and_missing_commit() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let a = commit_on(&odb, vec![], "a", 1);
        let b = commit_on(&odb, vec![a], "b", 2);
        let c = commit_on(&odb, vec![b], "c", 3);

        let msgs: Vec<String> = odb
            .walk(c)
            .map(|r| r.unwrap().format_message())
            .collect();
        assert_eq!(msgs, vec!["c", "b", "a"]);

        // A walk from a commit whose parent is absent errors out.
        let fake_parent = ObjectHash::new(b"not stored");
        let orphan = Commit::new(
            sig(SignatureType::Author, 9),
            sig(SignatureType::Committer, 9),
            odb.empty_tree(),
            vec![fake_parent],
            "\norphan\n",
        );
        let orphan_oid = odb.write_commit(&orphan).unwrap();
        let results: Vec<_> = odb.walk(orphan_oid).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_revparse() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let odb = ObjectDb::new();
        let c = commit_on(&odb, vec![], "tip", 1);
        odb.set_ref("refs/heads/main", c);
        assert_eq!(odb.revparse("main").unwrap(), c);
        assert_eq!(odb.revparse("refs/heads/main").unwrap(), c);
        assert_eq!(odb.revparse(&c.to_string()).unwrap(), c);
        assert!(odb.revparse("nope").is_err());
    }
}
