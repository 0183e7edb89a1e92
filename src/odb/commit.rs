//! The Commit object: an immutable snapshot - a tree, parent links,
//! author/committer signatures and a message.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;

use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::ObjectTrait;
use crate::odb::signature::{Signature, SignatureType};
use crate::odb::types::ObjectType;

/// A commit points at the top-level tree reflecting the complete repository
/// state, and at zero or more parents (two for a merge commit).
#[derive(Eq, Debug, Clone)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_commit_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in self.parent_commit_ids.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Commit {
        let mut commit = Commit {
            id: ObjectHash::default(),
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id =
            ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data().unwrap());
        commit
    }

    /// The first non-empty line of the message, for summaries.
    pub fn format_message(&self) -> String {
        self.message
            .lines()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.to_owned())
            .unwrap_or_else(|| self.message.clone())
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, StrataError> {
        let invalid = || StrataError::InvalidArgument("Not a valid commit object".to_string());

        let mut rest = data;
        // tree line
        let line_end = rest.find_byte(0x0a).ok_or_else(invalid)?;
        if !rest.starts_with(b"tree ") {
            return Err(invalid());
        }
        let tree_id = ObjectHash::from_str(rest[5..line_end].to_str().map_err(|_| invalid())?)
            .map_err(StrataError::InvalidArgument)?;
        rest = &rest[line_end + 1..];

        // parent lines
        let mut parent_commit_ids = Vec::new();
        while rest.starts_with(b"parent ") {
            let line_end = rest.find_byte(0x0a).ok_or_else(invalid)?;
            let parent =
                ObjectHash::from_str(rest[7..line_end].to_str().map_err(|_| invalid())?)
                    .map_err(StrataError::InvalidArgument)?;
            parent_commit_ids.push(parent);
            rest = &rest[line_end + 1..];
        }

        // author and committer lines
        let line_end = rest.find_byte(0x0a).ok_or_else(invalid)?;
        let author = Signature::from_data(&rest[..line_end])?;
        rest = &rest[line_end + 1..];
        let line_end = rest.find_byte(0x0a).ok_or_else(invalid)?;
        let committer = Signature::from_data(&rest[..line_end])?;
        rest = &rest[line_end + 1..];

        // The rest is the message (with its leading blank separator line).
        let message = rest.to_str().map_err(|_| invalid())?.to_string();

        Ok(Commit {
            id: hash,
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn to_data(&self) -> Result<Vec<u8>, StrataError> {
        let mut data = Vec::new();

        data.extend(b"tree ");
        data.extend(self.tree_id.to_string().as_bytes());
        data.push(0x0a);

        for parent in &self.parent_commit_ids {
            data.extend(b"parent ");
            data.extend(parent.to_string().as_bytes());
            data.push(0x0a);
        }

        data.extend(self.author.to_data()?);
        data.push(0x0a);
        data.extend(self.committer.to_data()?);
        data.push(0x0a);
        data.extend(self.message.as_bytes());

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_for_test};
    use crate::odb::tree::Tree;

    fn sig(t: SignatureType) -> Signature {
        Signature {
            signature_type: t,
            name: "tester".into(),
            email: "tester@example.com".into(),
            timestamp: 1700000000,
            timezone: "+0000".into(),
        }
    }

    #[test]
    fn test_roundtrip() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let tree = Tree::empty();
        let commit = Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            tree.id,
            vec![],
            "\ninitial import\n",
        );
        let parsed = Commit::from_bytes(&commit.to_data().unwrap(), commit.id).unwrap();
        assert_eq!(parsed.tree_id, tree.id);
        assert!(parsed.parent_commit_ids.is_empty());
        assert_eq!(parsed.author.name, "tester");
        assert_eq!(parsed.format_message(), "initial import");
        assert_eq!(parsed.object_hash().unwrap(), commit.id);
    }

    #[test]
    fn test_merge_commit_has_two_parents() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let tree = Tree::empty();
        let p1 = Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            tree.id,
            vec![],
            "\none\n",
        );
        let p2 = Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            tree.id,
            vec![],
            "\ntwo\n",
        );
        let merge = Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            tree.id,
            vec![p1.id, p2.id],
            "\nmerge\n",
        );
        let parsed = Commit::from_bytes(&merge.to_data().unwrap(), merge.id).unwrap();
        assert_eq!(parsed.parent_commit_ids, vec![p1.id, p2.id]);
    }

    /// Commits are content-addressed: same fields, same id.
    #[test]
    fn test_deterministic_id() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let tree = Tree::empty();
        let a = Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            tree.id,
            vec![],
            "\nsame\n",
        );
        let b = Commit::new(
            sig(SignatureType::Author),
            sig(SignatureType::Committer),
            tree.id,
            vec![],
            "\nsame\n",
        );
        assert_eq!(a.id, b.id);
    }
}
