//! The Git object database boundary.
//!
//! Everything above this module consumes the object store through the
//! interfaces defined here - typed object reads, reference CRUD, commit
//! walking, merge-base computation, three-way tree merging, and the
//! streaming importer protocol. The in-process implementation
//! ([`store::ObjectDb`]) keeps content-addressed objects in a concurrent
//! map; the importer protocol is text-based, so it could equally be driven
//! by piping to an external `git fast-import` process.

pub mod blob;
pub mod commit;
pub mod importer;
pub mod merge_trees;
pub mod signature;
pub mod store;
pub mod tree;
pub mod types;

use std::fmt::Display;

use crate::{errors::StrataError, hash::ObjectHash};
use types::ObjectType;

/// **The Object Trait**
/// Defines the common interface for all Git object types: blobs, trees,
/// commits.
pub trait ObjectTrait: Send + Sync + Display {
    /// Creates a new object from a byte slice.
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, StrataError>
    where
        Self: Sized;

    /// Returns the type of the object.
    fn get_type(&self) -> ObjectType;

    /// Serializes the object to its canonical byte encoding.
    fn to_data(&self) -> Result<Vec<u8>, StrataError>;

    /// Computes the object hash from serialized data.
    fn object_hash(&self) -> Result<ObjectHash, StrataError> {
        let data = self.to_data()?;
        Ok(ObjectHash::from_type_and_data(self.get_type(), &data))
    }
}
