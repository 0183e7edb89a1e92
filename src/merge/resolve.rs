//! Per-conflict resolution: select a conflict by its label and resolve it
//! with an existing version, a deletion, the working-copy contents, or the
//! contents of a file.

use std::path::Path;

use serde_json::{Map, Value};

use crate::dataset::{Dataset, tabular, tile};
use crate::errors::StrataError;
use crate::import::tile::{extract_tile_metadata, is_tile_compatible};
use crate::lfs::{PointerFile, copy_file_to_local_lfs_cache};
use crate::merge::index::{DecodedPath, MergedIndex, conflict_label, decode_conflict_path};
use crate::odb::merge_trees::{ConflictTriple, IndexEntry};
use crate::repo::{Repo, RepoFiles, RepoState};

/// The named resolution strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveWith {
    Ancestor,
    Ours,
    Theirs,
    Delete,
    WorkingCopy,
}

impl ResolveWith {
    pub fn from_str(s: &str) -> Result<ResolveWith, StrataError> {
        match s {
            "ancestor" => Ok(ResolveWith::Ancestor),
            "ours" => Ok(ResolveWith::Ours),
            "theirs" => Ok(ResolveWith::Theirs),
            "delete" => Ok(ResolveWith::Delete),
            // Accept the common spelling variant.
            "workingcopy" | "working-copy" => Ok(ResolveWith::WorkingCopy),
            _ => Err(StrataError::InvalidArgument(format!(
                "Unknown resolution: {s:?}"
            ))),
        }
    }
}

/// Resolve the conflict at `conflict_label` with a named strategy.
/// Returns the number of conflicts still unresolved.
pub fn resolve_conflict(
    repo: &Repo,
    label: &str,
    with: ResolveWith,
) -> Result<usize, StrataError> {
    resolve_impl(repo, label, Resolution::With(with))
}

/// Resolve the conflict at `conflict_label` by accepting the version(s)
/// supplied in the given file (GeoJSON for features, a tile file for
/// tiles). Returns the number of conflicts still unresolved.
pub fn resolve_conflict_with_file(
    repo: &Repo,
    label: &str,
    file_path: &Path,
) -> Result<usize, StrataError> {
    resolve_impl(repo, label, Resolution::FromFile(file_path))
}

enum Resolution<'a> {
    With(ResolveWith),
    FromFile(&'a Path),
}

fn resolve_impl(repo: &Repo, label: &str, resolution: Resolution<'_>) -> Result<usize, StrataError> {
    repo.require_state(RepoState::Merging)?;
    let _lock = repo.lock_merge_state()?;
    let mut merged_index = MergedIndex::read_from_repo(repo)?;

    // Labels are often displayed with ":ancestor" etc on the end; an extra
    // trailing ":" is an easy mistake to make.
    let label = label.strip_suffix(':').unwrap_or(label);

    let Some((path, conflict)) = merged_index.conflict_for_label(label) else {
        return Err(StrataError::NoConflict(label.to_string()));
    };
    let path = path.clone();
    let conflict = conflict.clone();
    if merged_index.resolves.contains_key(&path) {
        return Err(StrataError::InvalidOperation(format!(
            "Conflict at {label} is already resolved"
        )));
    }

    let entries = match resolution {
        Resolution::With(ResolveWith::Delete) => Vec::new(),
        Resolution::With(ResolveWith::Ancestor) => version_entries(&conflict, "ancestor"),
        Resolution::With(ResolveWith::Ours) => version_entries(&conflict, "ours"),
        Resolution::With(ResolveWith::Theirs) => version_entries(&conflict, "theirs"),
        Resolution::With(ResolveWith::WorkingCopy) => {
            load_workingcopy_resolve(repo, &conflict)?
        }
        Resolution::FromFile(file_path) => load_file_resolve(repo, &conflict, file_path)?,
    };

    merged_index.add_resolve(&path, entries);
    merged_index.write_to_repo(repo)?;

    // The cached merged tree includes resolves, so rebuild it.
    let merged_tree = merged_index.write_merged_tree(repo.odb())?;
    repo.write_gitdir_file(RepoFiles::MERGED_TREE, &format!("{merged_tree}\n"))?;

    Ok(merged_index.unresolved_count())
}

/// Take an existing version verbatim; a missing version resolves as a
/// deletion.
fn version_entries(conflict: &ConflictTriple, side: &str) -> Vec<IndexEntry> {
    match conflict.version(side) {
        Some(oid) => vec![IndexEntry {
            path: conflict.path.clone(),
            oid,
        }],
        None => Vec::new(),
    }
}

/// The dataset a conflict belongs to, loaded from whichever version of the
/// repository actually contains it.
fn load_dataset(repo: &Repo, decoded: &DecodedPath) -> Result<Dataset, StrataError> {
    let dataset_path = decoded.dataset_path.as_deref().ok_or_else(|| {
        StrataError::NotYetImplemented(
            "only dataset conflicts can be resolved this way".to_string(),
        )
    })?;
    if let Some(dataset) = repo.datasets(None)?.get(dataset_path)? {
        return Ok(dataset);
    }
    let theirs = repo
        .read_gitdir_file(RepoFiles::MERGE_HEAD, false)?
        .trim()
        .parse()
        .map_err(StrataError::InvalidArgument)?;
    repo.datasets(Some(theirs))?.require(dataset_path)
}

fn require_feature_or_tile(decoded: &DecodedPath, how: &str) -> Result<(), StrataError> {
    match decoded.section.as_deref() {
        Some("feature") | Some("tile") => Ok(()),
        _ => Err(StrataError::NotYetImplemented(format!(
            "only feature or tile conflicts can currently be resolved using {how}"
        ))),
    }
}

/// Load the resolution from the current working copy.
fn load_workingcopy_resolve(
    repo: &Repo,
    conflict: &ConflictTriple,
) -> Result<Vec<IndexEntry>, StrataError> {
    let decoded = decode_conflict_path(&conflict.path);
    require_feature_or_tile(&decoded, "--with=workingcopy")?;
    let wc = repo.working_copy().ok_or(StrataError::NoWorkingCopy)?;
    let dataset = load_dataset(repo, &decoded)?;
    let label = conflict_label(&conflict.path);

    if decoded.section.as_deref() == Some("feature") {
        let feature = wc
            .feature(&dataset.path, &decoded.key)?
            .ok_or_else(|| {
                StrataError::NotFound(format!(
                    "No feature found at {label} - to resolve a conflict by deleting the feature, use --with=delete"
                ))
            })?;
        let map = feature_as_map(&feature)?;
        let (rel_path, blob) = tabular::encode_feature(&map, &dataset.schema()?)?;
        let oid = repo.odb().write_blob(blob);
        return Ok(vec![IndexEntry {
            path: format!("{}/{rel_path}", dataset.inner_path()),
            oid,
        }]);
    }

    let tile_file = wc.tile_file(&dataset.path, &decoded.key)?.ok_or_else(|| {
        StrataError::NotFound(format!(
            "No tile found at {label} - to resolve a conflict by deleting the tile, use --with=delete"
        ))
    })?;
    tile_file_entries(repo, &dataset, &decoded.key, &tile_file)
}

/// Load the resolution from a file on disk.
fn load_file_resolve(
    repo: &Repo,
    conflict: &ConflictTriple,
    file_path: &Path,
) -> Result<Vec<IndexEntry>, StrataError> {
    let decoded = decode_conflict_path(&conflict.path);
    require_feature_or_tile(&decoded, "--with-file")?;
    let dataset = load_dataset(repo, &decoded)?;

    if decoded.section.as_deref() == Some("feature") {
        let text = std::fs::read_to_string(file_path)?;
        let geojson: Value = serde_json::from_str(&text)?;
        let features = geojson
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                StrataError::InvalidArgument(format!(
                    "{} is not a GeoJSON feature collection",
                    file_path.display()
                ))
            })?;
        let schema = dataset.schema()?;
        let mut entries = Vec::new();
        for feature in features {
            let map = ungeojson_feature(feature, &schema)?;
            let (rel_path, blob) = tabular::encode_feature(&map, &schema)?;
            let oid = repo.odb().write_blob(blob);
            entries.push(IndexEntry {
                path: format!("{}/{rel_path}", dataset.inner_path()),
                oid,
            });
        }
        return Ok(entries);
    }

    tile_file_entries(repo, &dataset, &decoded.key, file_path)
}

/// Import a tile file as a resolution: format-check it against the dataset,
/// copy it into the LFS cache, and store a pointer blob.
fn tile_file_entries(
    repo: &Repo,
    dataset: &Dataset,
    tilename: &str,
    file_path: &Path,
) -> Result<Vec<IndexEntry>, StrataError> {
    let metadata = extract_tile_metadata(dataset.kind, file_path)?;
    let dataset_format = dataset.meta_item("format.json")?;
    if let Some(dataset_format) = &dataset_format
        && !is_tile_compatible(dataset_format, &metadata.dataset_meta["format.json"])
    {
        return Err(StrataError::InvalidOperation(format!(
            "The tile at {} does not match the dataset's format",
            file_path.display()
        )));
    }

    copy_file_to_local_lfs_cache(&repo.lfs_root(), file_path, None, None, true)?;

    let mut summary = metadata.tile.clone();
    summary.remove("name");
    let pointer = PointerFile::from_json(&Value::Object(summary))?;
    let oid = repo.odb().write_blob(pointer.to_bytes());
    Ok(vec![IndexEntry {
        path: format!(
            "{}/{}",
            dataset.inner_path(),
            tile::tilename_to_rel_path(tilename)
        ),
        oid,
    }])
}

/// A GeoJSON feature's properties plus its geometry (stored under the
/// schema's geometry column, when there is one).
fn ungeojson_feature(
    feature: &Value,
    schema: &crate::dataset::schema::Schema,
) -> Result<Map<String, Value>, StrataError> {
    let mut map = feature
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| {
            StrataError::InvalidArgument("GeoJSON feature has no properties".to_string())
        })?;
    let geom_column = schema
        .columns
        .iter()
        .find(|c| c.data_type == crate::dataset::schema::DataType::Geometry);
    if let Some(column) = geom_column
        && let Some(geometry) = feature.get("geometry")
    {
        map.insert(column.name.clone(), geometry.clone());
    }
    Ok(map)
}

fn feature_as_map(feature: &Value) -> Result<Map<String, Value>, StrataError> {
    feature.as_object().cloned().ok_or_else(|| {
        StrataError::InvalidArgument("working-copy feature is not an object".to_string())
    })
}
