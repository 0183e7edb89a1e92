//! Object type enumeration shared across the object-store modules.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::StrataError;

/// The kinds of object the store holds.
///
/// * `Commit`: a snapshot - tree + parents + signatures + message.
/// * `Tree`: a directory mapping names to blobs and subtrees.
/// * `Blob`: the content of a single file.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree,
    Blob,
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Blob => write!(f, "blob"),
        }
    }
}

impl ObjectType {
    /// The type name as used in the `<type> <len>\x00` object header.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => b"commit",
            ObjectType::Tree => b"tree",
            ObjectType::Blob => b"blob",
        }
    }

    /// Parses a string representation of an object type.
    pub fn from_string(s: &str) -> Result<ObjectType, StrataError> {
        match s {
            "commit" => Ok(ObjectType::Commit),
            "tree" => Ok(ObjectType::Tree),
            "blob" => Ok(ObjectType::Blob),
            _ => Err(StrataError::InvalidArgument(format!(
                "`{s}` is not a valid object type"
            ))),
        }
    }
}
