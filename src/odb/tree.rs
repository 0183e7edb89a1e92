//! The Tree object represents a directory: an ordered list of entries, each
//! naming a blob or a subtree. Trees canonicalize entry order, which is what
//! makes dataset imports order-independent - streaming features in any order
//! produces the same tree OID.

use std::fmt::Display;

use bstr::ByteSlice;

use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::ObjectTrait;
use crate::odb::types::ObjectType;

/// File mode of a tree entry. Strata only ever writes regular blobs and
/// subtrees; symlinks and executables never occur in dataset trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryMode {
    Blob,
    Tree,
}

impl EntryMode {
    /// The octal mode string as encoded inside a tree object.
    pub const fn as_bytes(&self) -> &'static [u8] {
        match self {
            EntryMode::Blob => b"100644",
            EntryMode::Tree => b"40000",
        }
    }

    pub fn from_bytes(mode: &[u8]) -> Result<EntryMode, StrataError> {
        match mode {
            b"100644" | b"100664" | b"100755" => Ok(EntryMode::Blob),
            b"40000" | b"040000" => Ok(EntryMode::Tree),
            _ => Err(StrataError::InvalidArgument(format!(
                "`{}` is not a supported tree entry mode",
                mode.as_bstr()
            ))),
        }
    }
}

/// One entry of a tree: mode, name and object id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: EntryMode,
    pub oid: ObjectHash,
    pub name: String,
}

impl TreeEntry {
    pub fn blob(name: impl Into<String>, oid: ObjectHash) -> TreeEntry {
        TreeEntry {
            mode: EntryMode::Blob,
            oid,
            name: name.into(),
        }
    }

    pub fn subtree(name: impl Into<String>, oid: ObjectHash) -> TreeEntry {
        TreeEntry {
            mode: EntryMode::Tree,
            oid,
            name: name.into(),
        }
    }

    /// The byte sequence Git sorts tree entries by: directory names compare
    /// as if they had a trailing `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode == EntryMode::Tree {
            key.push(b'/');
        }
        key
    }
}

/// A directory snapshot: entries sorted canonically.
#[derive(Eq, Debug, Clone)]
pub struct Tree {
    pub id: ObjectHash,
    pub entries: Vec<TreeEntry>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for entry in &self.entries {
            let kind = match entry.mode {
                EntryMode::Blob => "blob",
                EntryMode::Tree => "tree",
            };
            writeln!(f, "{} {kind} {}", entry.oid, entry.name)?;
        }
        Ok(())
    }
}

impl Tree {
    /// Canonicalize the entries and compute the tree's hash.
    pub fn from_entries(mut entries: Vec<TreeEntry>) -> Result<Tree, StrataError> {
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        entries.dedup_by(|a, b| a.name == b.name);
        let mut tree = Tree {
            id: ObjectHash::default(),
            entries,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data()?);
        Ok(tree)
    }

    /// The empty tree.
    pub fn empty() -> Tree {
        Tree::from_entries(Vec::new()).expect("empty tree always encodes")
    }

    pub fn get_entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ObjectTrait for Tree {
    /// Parse the canonical `<mode> <name>\x00<oid-bytes>` sequence.
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, StrataError> {
        let mut entries = Vec::new();
        let mut rest = data;
        let hash_size = hash.size();
        while !rest.is_empty() {
            let space = rest
                .find_byte(b' ')
                .ok_or_else(|| StrataError::InvalidArgument("truncated tree entry".into()))?;
            let mode = EntryMode::from_bytes(&rest[..space])?;
            let nul = rest
                .find_byte(b'\x00')
                .ok_or_else(|| StrataError::InvalidArgument("truncated tree entry".into()))?;
            let name = rest[space + 1..nul]
                .to_str()
                .map_err(|_| StrataError::InvalidArgument("non-utf8 tree entry name".into()))?
                .to_string();
            if rest.len() < nul + 1 + hash_size {
                return Err(StrataError::InvalidArgument("truncated tree entry".into()));
            }
            let oid = ObjectHash::from_bytes(&rest[nul + 1..nul + 1 + hash_size])
                .map_err(StrataError::InvalidArgument)?;
            entries.push(TreeEntry { mode, oid, name });
            rest = &rest[nul + 1 + hash_size..];
        }
        Ok(Tree { id: hash, entries })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn to_data(&self) -> Result<Vec<u8>, StrataError> {
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend(entry.mode.as_bytes());
            data.push(b' ');
            data.extend(entry.name.as_bytes());
            data.push(b'\x00');
            data.extend(entry.oid.as_ref());
        }
        Ok(data)
    }
}
