//! Structured diff algebra over dataset snapshots.
//!
//! A diff is a hierarchy: a [`RepoDiff`](diffs::RepoDiff) holds one
//! [`DatasetDiff`](diffs::DatasetDiff) per changed dataset, each of which
//! holds up to three [`DeltaDiff`](diffs::DeltaDiff)s (meta, feature, tile),
//! which finally hold the individual [`Delta`](delta::Delta)s. Diffs can be
//! concatenated, inverted, and filtered with key filters.

pub mod delta;
pub mod diffs;
pub mod filters;

pub use delta::{BINARY_FILE, Delta, DeltaType, KeyValue, LazyValue, WORKING_COPY_EDIT};
pub use diffs::{DatasetDiff, DeltaDiff, DiffSection, RepoDiff};
pub use filters::{DatasetKeyFilter, ItemKeyFilter, RepoKeyFilter};
