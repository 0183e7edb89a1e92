//! The working-copy boundary.
//!
//! Materializing datasets into SQL engines or filesystem directories is a
//! sink that consumes a diff - it lives outside the engine. The engine only
//! needs these few operations from it: a dirtiness check before destructive
//! imports, a reset after commits and merges, and item lookups when a
//! conflict is resolved from working-copy contents.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::dataset::tile::remove_tile_extension;
use crate::diff::filters::RepoKeyFilter;
use crate::errors::StrataError;

/// What the engine requires of a working copy implementation.
pub trait WorkingCopy: Send + Sync {
    /// Fail with `InvalidOperation` when there are uncommitted changes.
    fn check_not_dirty(&self) -> Result<(), StrataError>;

    /// Reset the working copy to HEAD, restricted to the filtered datasets.
    fn reset_to_head(&self, filter: &RepoKeyFilter) -> Result<(), StrataError>;

    /// The current working-copy contents of one feature, if present.
    fn feature(&self, dataset_path: &str, key: &str) -> Result<Option<Value>, StrataError>;

    /// The on-disk file for one tile, if present. Multiple candidate files
    /// is an error - the resolution would be ambiguous.
    fn tile_file(&self, dataset_path: &str, tilename: &str)
    -> Result<Option<PathBuf>, StrataError>;
}

/// A filesystem working directory holding tile files under the dataset
/// paths. Tabular features are not materialized here (that is a SQL
/// adapter's job), so `feature` always reports absent.
pub struct FileSystemWorkingCopy {
    root: PathBuf,
}

impl FileSystemWorkingCopy {
    pub fn new(root: impl Into<PathBuf>) -> FileSystemWorkingCopy {
        FileSystemWorkingCopy { root: root.into() }
    }

    fn find_tiles(dir: &Path, tilename: &str, found: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::find_tiles(&path, tilename, found)?;
            } else if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && remove_tile_extension(name) == tilename
            {
                found.push(path);
            }
        }
        Ok(())
    }
}

impl WorkingCopy for FileSystemWorkingCopy {
    fn check_not_dirty(&self) -> Result<(), StrataError> {
        Ok(())
    }

    fn reset_to_head(&self, _filter: &RepoKeyFilter) -> Result<(), StrataError> {
        Ok(())
    }

    fn feature(&self, _dataset_path: &str, _key: &str) -> Result<Option<Value>, StrataError> {
        Ok(None)
    }

    fn tile_file(
        &self,
        dataset_path: &str,
        tilename: &str,
    ) -> Result<Option<PathBuf>, StrataError> {
        let dir = self.root.join(dataset_path);
        if !dir.exists() {
            return Ok(None);
        }
        let mut found = Vec::new();
        Self::find_tiles(&dir, tilename, &mut found)?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(Some(found.remove(0))),
            _ => Err(StrataError::InvalidOperation(format!(
                "Found multiple files in the working copy that could be intended as {tilename}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let ds_dir = dir.path().join("dem/sub");
        std::fs::create_dir_all(&ds_dir).unwrap();
        std::fs::write(ds_dir.join("tile_1.laz"), b"x").unwrap();

        let wc = FileSystemWorkingCopy::new(dir.path());
        let found = wc.tile_file("dem", "tile_1").unwrap().unwrap();
        assert!(found.ends_with("dem/sub/tile_1.laz"));
        assert!(wc.tile_file("dem", "tile_2").unwrap().is_none());
    }

    #[test]
    fn test_ambiguous_tile_lookup_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ds_dir = dir.path().join("dem");
        std::fs::create_dir_all(&ds_dir).unwrap();
        std::fs::write(ds_dir.join("tile_1.laz"), b"x").unwrap();
        std::fs::write(ds_dir.join("tile_1.copc.laz"), b"y").unwrap();

        let wc = FileSystemWorkingCopy::new(dir.path());
        assert!(wc.tile_file("dem", "tile_1").is_err());
    }
}
