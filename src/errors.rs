//! Error types for the Strata engine.
//!
//! This module defines a unified error enumeration used across blob codecs,
//! dataset reading, diff computation, fast-import and merge handling. It
//! integrates with `thiserror` to provide rich `Display` implementations and
//! error source chaining where applicable.
//!
//! Every user-facing variant maps to a stable process exit code via
//! [`StrataError::exit_code`]; internal errors that escape to the top level
//! report the uncategorized code.

use thiserror::Error;

/// Exit code for malformed paths, bad filters and unknown options.
pub const INVALID_ARGUMENT: i32 = 10;
/// Exit code for semantic conflicts: already-exists, dirty working copy,
/// repository state mismatch, non-homogenous imports.
pub const INVALID_OPERATION: i32 = 20;
/// Exit code for recognised-but-unsupported functionality.
pub const NOT_YET_IMPLEMENTED: i32 = 30;

pub const NOT_FOUND: i32 = 40;
pub const NO_REPOSITORY: i32 = 41;
pub const NO_DATA: i32 = 42;
pub const NO_BRANCH: i32 = 43;
pub const NO_CHANGES: i32 = 44;
pub const NO_WORKING_COPY: i32 = 45;
pub const NO_USER: i32 = 46;
pub const NO_IMPORT_SOURCE: i32 = 47;
pub const NO_TABLE: i32 = 48;

pub const SUBPROCESS_ERROR: i32 = 50;

pub const UNCATEGORIZED_ERROR: i32 = 99;

#[derive(Error, Debug)]
/// Unified error enumeration for the Strata engine.
///
/// - Raised by the codec, dataset and diff layers; caught and translated to
///   user-facing messages by the import and merge drivers.
/// - Implements `std::error::Error` via `thiserror`.
pub enum StrataError {
    /// Malformed path, bad filter pattern, or unusable option value.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Semantically invalid operation for the current repository state.
    #[error("{0}")]
    InvalidOperation(String),

    /// Recognised functionality that this version does not support.
    #[error("Not yet implemented: {0}")]
    NotYetImplemented(String),

    /// A dataset's inner directory name is not a version we can read.
    #[error("Dataset at `{path}` has unsupported version marker `{dirname}`")]
    UnsupportedVersion { path: String, dirname: String },

    /// Generic missing object: commit, dataset, conflict label, file.
    #[error("{0}")]
    NotFound(String),

    /// No repository at the given path.
    #[error("Not an existing Strata repository: {0}")]
    NoRepository(String),

    /// The repository has no commits yet (or the revision has no data).
    #[error("{0}")]
    NoData(String),

    /// Named branch does not exist.
    #[error("Branch not found: {0}")]
    NoBranch(String),

    /// An import or merge would produce no change.
    #[error("No changes to commit")]
    NoChanges,

    /// The operation requires a working copy and none is configured.
    #[error("No working copy")]
    NoWorkingCopy,

    /// User identity (author/committer) is not configured.
    #[error("User identity is not configured")]
    NoUser,

    /// A named import source does not exist or holds no data.
    #[error("No data found at {0}")]
    NoImportSource(String),

    /// Named table missing from an import source.
    #[error("Table not found: {0}")]
    NoTable(String),

    /// No conflict exists at the given label.
    #[error("No conflict found at {0}")]
    NoConflict(String),

    /// An external tool (importer backend, tile converter) exited non-zero.
    #[error("Subprocess error: {message} (exit code {exit_code})")]
    Subprocess { message: String, exit_code: i32 },

    /// The delta algebra was asked for an impossible composition,
    /// e.g. insert+insert or delete+delete on the same key.
    #[error("Delta conflict: {0}")]
    DeltaConflict(String),

    /// A merge stopped on user-visible conflicts.
    #[error("Merge failed due to {0} conflicts")]
    MergeConflict(usize),

    /// I/O error from the underlying filesystem or stream.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Malformed stored JSON (schema, legend, merged index).
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl StrataError {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            StrataError::InvalidArgument(_) => INVALID_ARGUMENT,
            StrataError::InvalidOperation(_) => INVALID_OPERATION,
            StrataError::MergeConflict(_) => INVALID_OPERATION,
            StrataError::NotYetImplemented(_) => NOT_YET_IMPLEMENTED,
            StrataError::UnsupportedVersion { .. } => NOT_YET_IMPLEMENTED,
            StrataError::NotFound(_) => NOT_FOUND,
            StrataError::NoConflict(_) => NOT_FOUND,
            StrataError::NoRepository(_) => NO_REPOSITORY,
            StrataError::NoData(_) => NO_DATA,
            StrataError::NoBranch(_) => NO_BRANCH,
            StrataError::NoChanges => NO_CHANGES,
            StrataError::NoWorkingCopy => NO_WORKING_COPY,
            StrataError::NoUser => NO_USER,
            StrataError::NoImportSource(_) => NO_IMPORT_SOURCE,
            StrataError::NoTable(_) => NO_TABLE,
            StrataError::Subprocess { .. } => SUBPROCESS_ERROR,
            StrataError::DeltaConflict(_)
            | StrataError::IOError(_)
            | StrataError::JsonError(_) => UNCATEGORIZED_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_stable() {
        assert_eq!(
            StrataError::InvalidArgument("x".into()).exit_code(),
            INVALID_ARGUMENT
        );
        assert_eq!(StrataError::NoChanges.exit_code(), NO_CHANGES);
        assert_eq!(
            StrataError::Subprocess {
                message: "importer".into(),
                exit_code: 128
            }
            .exit_code(),
            SUBPROCESS_ERROR
        );
        assert_eq!(
            StrataError::DeltaConflict("insert + insert".into()).exit_code(),
            UNCATEGORIZED_ERROR
        );
        assert_eq!(StrataError::MergeConflict(3).exit_code(), INVALID_OPERATION);
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: StrataError = io.into();
        assert_eq!(err.exit_code(), UNCATEGORIZED_ERROR);
        assert!(err.to_string().contains("pipe"));
    }
}
