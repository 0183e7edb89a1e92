//! The fast-import pipeline: streaming blob writes and deletions into new
//! commits.
//!
//! [`stream`] speaks the importer protocol; [`table`] drives tabular
//! imports (with blob-level deduplication against prior commits);
//! [`tile`] drives tile imports (with parallel metadata extraction,
//! optional cloud-optimized conversion, and LFS cache population).

pub mod stream;
pub mod table;
pub mod tile;

/// How an import treats datasets that already exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReplaceExisting {
    /// Don't replace any existing datasets. Imports start from the existing
    /// HEAD state and a name collision is an error.
    #[default]
    DontReplace,
    /// Datasets in the import replace existing datasets with the same name;
    /// other datasets are untouched.
    Given,
    /// All existing datasets are replaced by the given datasets.
    All,
}
