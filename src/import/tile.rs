//! The tile import driver: parallel metadata extraction, optional
//! conversion to cloud-optimized formats, LFS cache population, and pointer
//! blob emission - all funnelled into one streaming import commit.
//!
//! Two regions run on a bounded worker pool: reading tile headers to
//! extract metadata, and the convert/hash/copy-to-cache step. Results are
//! consumed in completion order; all stream writes stay on the calling
//! thread, since the import stream is not thread-safe.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::mpsc;

use colored::Colorize;
use serde_json::{Map, Value, json};
use threadpool::ThreadPool;
use tracing::debug;
use uuid::Uuid;

use crate::dataset::tile::{tilename_from_path, tilename_to_rel_path};
use crate::dataset::{Dataset, DatasetKind};
use crate::diff::filters::{RepoKeyFilter, validate_dataset_path};
use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::import::stream::{
    copy_existing_blob_to_stream, generate_header, with_streaming_importer, write_blob_to_stream,
    write_delete_to_stream,
};
use crate::lfs::{copy_file_to_local_lfs_cache, merge_dicts_to_pointer_file_bytes};
use crate::odb::commit::Commit;
use crate::repo::{REPOSTRUCTURE_VERSION_BLOB_PATH, Repo, SUPPORTED_REPOSTRUCTURE_VERSION};

/// Converts one tile file to its cloud-optimized variant.
pub trait TileConverter: Send + Sync {
    fn convert(&self, source: &Path, dest: &Path) -> Result<(), StrataError>;
}

/// A converter that shells out to an external tool, invoked as
/// `<program> <args...> <source> <dest>`.
pub struct CommandConverter {
    pub program: String,
    pub args: Vec<String>,
}

impl TileConverter for CommandConverter {
    fn convert(&self, source: &Path, dest: &Path) -> Result<(), StrataError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(source)
            .arg(dest)
            .status()?;
        if !status.success() {
            return Err(StrataError::Subprocess {
                message: format!("{} failed converting {}", self.program, source.display()),
                exit_code: status.code().unwrap_or(1),
            });
        }
        Ok(())
    }
}

/// Metadata extracted from one tile file: the dataset-level meta items it
/// implies, and the per-tile summary (name, oid, size, format).
#[derive(Clone, Debug)]
pub struct TileMetadata {
    pub dataset_meta: BTreeMap<String, Value>,
    pub tile: Map<String, Value>,
}

/// One dataset-level meta value during merging: a single agreed value, or
/// the list of conflicting values seen.
#[derive(Clone, Debug)]
pub enum MergedMetaValue {
    Single(Value),
    Conflicting(Vec<Value>),
}

pub type MergedMetadata = BTreeMap<String, MergedMetaValue>;

/// Merge dataset-level metadata across sources, marking fields that differ.
/// Per-tile fields are not part of the input and so are exempt by
/// construction.
pub fn merge_metadata(all: &[BTreeMap<String, Value>]) -> MergedMetadata {
    let mut merged: MergedMetadata = BTreeMap::new();
    for metadata in all {
        for (key, value) in metadata {
            match merged.get_mut(key) {
                None => {
                    merged.insert(key.clone(), MergedMetaValue::Single(value.clone()));
                }
                Some(MergedMetaValue::Single(existing)) if existing == value => {}
                Some(MergedMetaValue::Single(existing)) => {
                    let conflicting = vec![existing.clone(), value.clone()];
                    merged.insert(key.clone(), MergedMetaValue::Conflicting(conflicting));
                }
                Some(MergedMetaValue::Conflicting(values)) => {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
            }
        }
    }
    merged
}

const HUMAN_READABLE_META_ITEM_NAMES: &[(&str, &str)] = &[
    ("format.json", "file format"),
    ("schema.json", "schema"),
    ("crs.wkt", "CRS"),
];

/// Raise `InvalidOperation` with a human-readable disparity report when any
/// merged field is conflicting.
pub fn check_for_non_homogenous_metadata(
    merged: &MergedMetadata,
    dataset_type: &str,
    future_tense: bool,
) -> Result<(), StrataError> {
    for (key, value) in merged {
        let MergedMetaValue::Conflicting(values) = value else {
            continue;
        };
        let output_name = HUMAN_READABLE_META_ITEM_NAMES
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, name)| *name)
            .unwrap_or(key);
        let disparity = values
            .iter()
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()))
            .collect::<Vec<_>>()
            .join(&format!("\n{}\n", " vs ".bold()));
        let tense = if future_tense {
            format!("The imported files would have more than one {output_name}:")
        } else {
            format!("The input files have more than one {output_name}:")
        };
        return Err(StrataError::InvalidOperation(format!(
            "Non-homogenous dataset supplied.\n\
             Certain aspects of {dataset_type} datasets are constrained to be homogenous.\n\
             {tense}\n{disparity}"
        )));
    }
    Ok(())
}

/// Read the file header and classify the tile format for a dataset kind.
pub fn extract_tile_format(kind: DatasetKind, path: &Path) -> Result<Value, StrataError> {
    let mut header = [0u8; 512];
    let n = {
        use std::io::Read;
        let mut file = std::fs::File::open(path)?;
        file.read(&mut header)?
    };
    let header = &header[..n];

    match kind {
        DatasetKind::PointCloud => {
            if !header.starts_with(b"LASF") {
                return Err(StrataError::InvalidOperation(format!(
                    "{} is not a LAS/LAZ point-cloud file",
                    path.display()
                )));
            }
            let copc = memchr::memmem::find(header, b"copc").is_some();
            Ok(json!({
                "fileType": "laz",
                "optimization": if copc { json!("copc") } else { Value::Null },
            }))
        }
        DatasetKind::Raster => {
            if !(header.starts_with(b"II*\x00") || header.starts_with(b"MM\x00*")) {
                return Err(StrataError::InvalidOperation(format!(
                    "{} is not a GeoTIFF raster file",
                    path.display()
                )));
            }
            let cog = memchr::memmem::find(header, b"LAYOUT=COG").is_some();
            Ok(json!({
                "fileType": "geotiff",
                "optimization": if cog { json!("cog") } else { Value::Null },
            }))
        }
        DatasetKind::Tabular => Err(StrataError::InvalidArgument(
            "tabular datasets do not hold tiles".to_string(),
        )),
    }
}

/// Whether a tile's format already satisfies the cloud-optimized
/// constraint.
pub fn is_cloud_optimized(format: &Value) -> bool {
    !format
        .get("optimization")
        .map(Value::is_null)
        .unwrap_or(true)
}

/// Whether a tile's format is compatible with a dataset's format: same file
/// type, and cloud-optimized when the dataset is constrained to be.
pub fn is_tile_compatible(dataset_format: &Value, tile_format: &Value) -> bool {
    if dataset_format.get("fileType") != tile_format.get("fileType") {
        return false;
    }
    if is_cloud_optimized(dataset_format) && !is_cloud_optimized(tile_format) {
        return false;
    }
    true
}

/// Extract full metadata (dataset-level and per-tile) from a tile file.
pub fn extract_tile_metadata(kind: DatasetKind, path: &Path) -> Result<TileMetadata, StrataError> {
    let format = extract_tile_format(kind, path)?;
    let (oid_hex, size) = crate::lfs::hash_and_size_of_file(path)?;

    let mut tile = Map::new();
    tile.insert("name".into(), json!(tilename_from_path(&path.display().to_string())));
    tile.insert("oid".into(), json!(format!("sha256:{oid_hex}")));
    tile.insert("size".into(), json!(size));
    tile.insert("format".into(), format_summary_string(&format));

    let mut dataset_meta = BTreeMap::new();
    dataset_meta.insert("format.json".to_string(), format);
    Ok(TileMetadata { dataset_meta, tile })
}

/// The compact `fileType[/optimization]` form stored in pointer headers.
fn format_summary_string(format: &Value) -> Value {
    let file_type = format
        .get("fileType")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    match format.get("optimization").and_then(Value::as_str) {
        Some(opt) => json!(format!("{file_type}/{opt}")),
        None => json!(file_type),
    }
}

/// Options for a tile import.
pub struct TileImportOptions {
    /// Path of the dataset to create or update. Inferred from the sources
    /// when empty.
    pub dataset_path: String,
    /// Convert tiles to their cloud-optimized variant while importing, and
    /// constrain the dataset to cloud-optimized tiles.
    pub convert_to_cloud_optimized: bool,
    pub message: Option<String>,
    /// Create a working copy of this dataset once the import finishes.
    pub do_checkout: bool,
    /// Replace any existing dataset at the path with only these tiles.
    pub replace_existing: bool,
    /// Update the existing dataset: same-named tiles are replaced, others
    /// remain.
    pub update_existing: bool,
    /// Existing tiles to delete (may be used with no sources at all).
    pub delete: Vec<String>,
    /// Amend the previous commit instead of creating a new one.
    pub amend: bool,
    pub allow_empty: bool,
    /// Worker count; `None` means the number of available cores.
    pub num_workers: Option<usize>,
    pub sources: Vec<PathBuf>,
}

impl Default for TileImportOptions {
    fn default() -> TileImportOptions {
        TileImportOptions {
            dataset_path: String::new(),
            convert_to_cloud_optimized: false,
            message: None,
            do_checkout: true,
            replace_existing: false,
            update_existing: false,
            delete: Vec::new(),
            amend: false,
            allow_empty: false,
            num_workers: None,
            sources: Vec::new(),
        }
    }
}

/// Importer for tile-based datasets (point-cloud, raster).
pub struct TileImporter<'a> {
    repo: &'a Repo,
    kind: DatasetKind,
    converter: Option<Arc<dyn TileConverter>>,
    options: TileImportOptions,
}

impl<'a> TileImporter<'a> {
    pub fn new(
        repo: &'a Repo,
        kind: DatasetKind,
        converter: Option<Arc<dyn TileConverter>>,
        options: TileImportOptions,
    ) -> TileImporter<'a> {
        TileImporter {
            repo,
            kind,
            converter,
            options,
        }
    }

    /// Import the tiles at the sources as a new dataset, or use them to
    /// update an existing one. Returns the new commit.
    pub fn import_tiles(mut self) -> Result<ObjectHash, StrataError> {
        self.repo.check_repostructure_version()?;
        let num_workers = self
            .options
            .num_workers
            .unwrap_or_else(num_cpus::get)
            .max(1);

        if self.options.sources.is_empty() && self.options.delete.is_empty() {
            return Err(StrataError::NoImportSource(
                "no tile sources and nothing to delete".to_string(),
            ));
        }
        for source in &self.options.sources {
            if !source.is_file() {
                return Err(StrataError::NoImportSource(source.display().to_string()));
            }
        }
        if self.options.dataset_path.is_empty() {
            if !self.options.delete.is_empty() && self.options.sources.is_empty() {
                return Err(StrataError::InvalidArgument(
                    "a dataset path is required to delete tiles".to_string(),
                ));
            }
            self.options.dataset_path = infer_dataset_path(&self.options.sources)
                .ok_or_else(|| {
                    StrataError::InvalidArgument(
                        "could not infer a dataset path; supply one".to_string(),
                    )
                })?;
            debug!(dataset_path = %self.options.dataset_path, "defaulting dataset path");
        }
        if !self.options.delete.is_empty() && self.options.sources.is_empty() {
            // Deleting implies we're modifying the existing dataset.
            self.options.update_existing = true;
        }
        validate_dataset_path(&self.options.dataset_path, false)?;

        let head_commit = self.repo.head_commit()?;
        let existing_dataset = self
            .repo
            .datasets(head_commit)?
            .get(&self.options.dataset_path)?;
        if let Some(existing) = &existing_dataset
            && existing.kind != self.kind
        {
            return Err(StrataError::InvalidOperation(format!(
                "A dataset of type {} already exists at {}",
                existing.kind.dirname(),
                self.options.dataset_path
            )));
        }
        if !self.options.replace_existing && !self.options.update_existing {
            if existing_dataset.is_some() {
                return Err(StrataError::InvalidOperation(format!(
                    "Cannot import to {}/ - already exists in repository",
                    self.options.dataset_path
                )));
            }
        }
        if !self.options.delete.is_empty() && existing_dataset.is_none() {
            return Err(StrataError::InvalidOperation(format!(
                "Dataset {} does not exist. Cannot delete paths from it.",
                self.options.dataset_path
            )));
        }

        if (self.options.replace_existing
            || self.options.update_existing
            || !self.options.delete.is_empty())
            && let Some(wc) = self.repo.working_copy()
        {
            // Avoid conflicts by ensuring the working copy is clean.
            wc.check_not_dirty()?;
        }

        let existing_format = match &existing_dataset {
            Some(ds) => ds.meta_item("format.json")?,
            None => None,
        };
        let include_existing_metadata =
            self.options.update_existing && existing_dataset.is_some();

        // Extract tile metadata on the worker pool, received in completion
        // order.
        let source_metadata =
            self.extract_multiple_tiles_metadata(num_workers, &self.options.sources)?;

        // Check the sources agree with each other before conversion...
        let all_source_meta: Vec<BTreeMap<String, Value>> = source_metadata
            .values()
            .map(|m| m.dataset_meta.clone())
            .collect();
        check_for_non_homogenous_metadata(
            &merge_metadata(&all_source_meta),
            self.kind.dataset_type(),
            false,
        )?;

        // ...and that the dataset will be homogenous after conversion.
        let mut predicted = all_source_meta.clone();
        if self.options.convert_to_cloud_optimized {
            for meta in &mut predicted {
                if let Some(format) = meta.get_mut("format.json") {
                    *format = self.converted_format(format);
                }
            }
        }
        if include_existing_metadata
            && let Some(format) = &existing_format
        {
            predicted.push(BTreeMap::from([("format.json".to_string(), format.clone())]));
        }
        check_for_non_homogenous_metadata(
            &merge_metadata(&predicted),
            self.kind.dataset_type(),
            true,
        )?;

        let message = match (&self.options.message, self.options.amend) {
            (Some(message), _) => message.clone(),
            (None, true) => {
                let head = head_commit.ok_or_else(|| StrataError::NoData(
                    "Cannot amend in an empty repository".to_string(),
                ))?;
                self.repo.odb().read_commit(&head)?.format_message()
            }
            (None, false) => format!(
                "Import {} tiles to {}/",
                self.options.sources.len(),
                self.options.dataset_path
            ),
        };
        if self.options.amend && head_commit.is_none() {
            return Err(StrataError::NoData(
                "Cannot amend in an empty repository".to_string(),
            ));
        }

        let author = self.repo.author_signature()?;
        let committer = self.repo.committer_signature()?;
        let import_ref = format!("refs/strata-import/{}", Uuid::new_v4());
        let header = generate_header(&author, &committer, &message, &import_ref, head_commit);
        let odb = self.repo.odb().clone();

        let result = (|| {
            with_streaming_importer(&odb, |stream| {
                stream.write_all(header.as_bytes())?;
                if head_commit.is_none() {
                    write_blob_to_stream(
                        stream,
                        REPOSTRUCTURE_VERSION_BLOB_PATH,
                        format!("{SUPPORTED_REPOSTRUCTURE_VERSION}\n").as_bytes(),
                    )?;
                }

                if !self.options.update_existing {
                    // Delete the entire existing dataset before reimporting.
                    write_delete_to_stream(stream, &self.options.dataset_path)?;
                }

                for tilename in &self.options.delete {
                    let existing = existing_dataset.as_ref().expect("checked above");
                    let rel = tilename_to_rel_path(tilename);
                    if odb.entry_at_path(existing.inner_tree, &rel)?.is_none() {
                        return Err(StrataError::NotFound(format!(
                            "{tilename} does not exist, can't delete it"
                        )));
                    }
                    write_delete_to_stream(
                        stream,
                        &format!("{}/{rel}", existing.inner_path()),
                    )?;
                }

                let mut imported_meta: Vec<BTreeMap<String, Value>> = Vec::new();
                if !self.options.sources.is_empty() {
                    imported_meta = self.import_tiles_to_stream(
                        stream,
                        num_workers,
                        &source_metadata,
                        existing_dataset.as_ref(),
                    )?;
                }

                // Merge and write the dataset-level meta items last, once
                // every tile has reported the metadata it actually carries.
                let mut all_meta = imported_meta;
                if include_existing_metadata
                    && let Some(format) = &existing_format
                {
                    all_meta.push(BTreeMap::from([(
                        "format.json".to_string(),
                        format.clone(),
                    )]));
                }
                if !all_meta.is_empty() {
                    let merged = merge_metadata(&all_meta);
                    check_for_non_homogenous_metadata(
                        &merged,
                        self.kind.dataset_type(),
                        true,
                    )?;
                    let inner_path = format!(
                        "{}/{}",
                        self.options.dataset_path,
                        self.kind.dirname()
                    );
                    for (name, value) in &merged {
                        let MergedMetaValue::Single(value) = value else {
                            continue;
                        };
                        let file_type =
                            crate::dataset::meta::MetaItemFileType::from_item_name(name);
                        write_blob_to_stream(
                            stream,
                            &format!("{inner_path}/meta/{name}"),
                            &file_type.encode(value)?,
                        )?;
                    }
                }
                Ok(())
            })?;

            let new_commit_oid = odb
                .get_ref(&import_ref)
                .ok_or_else(|| StrataError::NotFound("Import produced no commit".into()))?;
            let new_commit = odb.read_commit(&new_commit_oid)?;
            let final_commit_oid = if self.options.amend {
                // Replace the head commit: keep its parents, use the new tree.
                let head = odb.read_commit(&head_commit.expect("amend requires a commit"))?;
                let amended = Commit::new(
                    head.author.clone(),
                    committer.clone(),
                    new_commit.tree_id,
                    head.parent_commit_ids.clone(),
                    &new_commit.message,
                );
                odb.write_commit(&amended)?
            } else {
                if !self.options.allow_empty {
                    let head_tree = self.repo.head_tree()?;
                    if new_commit.tree_id == head_tree && head_commit.is_some() {
                        return Err(StrataError::NoChanges);
                    }
                }
                new_commit_oid
            };
            self.repo.set_head_commit(final_commit_oid)?;
            Ok(final_commit_oid)
        })();

        // Clean up the temp ref whatever happened.
        odb.delete_ref(&import_ref);
        let final_commit = result?;

        self.repo.configure_do_checkout_datasets(
            &[self.options.dataset_path.as_str()],
            self.options.do_checkout,
        )?;
        if let Some(wc) = self.repo.working_copy() {
            // Keep unrelated changes; they can't conflict with the imported
            // dataset.
            wc.reset_to_head(&RepoKeyFilter::datasets([self
                .options
                .dataset_path
                .clone()]))?;
        }
        Ok(final_commit)
    }

    /// What a format will look like after cloud-optimized conversion.
    fn converted_format(&self, format: &Value) -> Value {
        let mut converted = format.clone();
        if let Some(obj) = converted.as_object_mut() {
            let optimization = match self.kind {
                DatasetKind::PointCloud => "copc",
                DatasetKind::Raster => "cog",
                DatasetKind::Tabular => return converted,
            };
            obj.insert("optimization".to_string(), json!(optimization));
        }
        converted
    }

    /// Extract metadata for all sources, on the pool when it helps.
    fn extract_multiple_tiles_metadata(
        &self,
        num_workers: usize,
        sources: &[PathBuf],
    ) -> Result<BTreeMap<PathBuf, TileMetadata>, StrataError> {
        let kind = self.kind;
        if num_workers == 1 || sources.len() <= 1 {
            // Single-threaded variant - uses the calling thread.
            let mut result = BTreeMap::new();
            for source in sources {
                result.insert(source.clone(), extract_tile_metadata(kind, source)?);
            }
            return Ok(result);
        }

        let pool = ThreadPool::new(num_workers);
        let (tx, rx) = mpsc::channel();
        for source in sources {
            let tx = tx.clone();
            let source = source.clone();
            pool.execute(move || {
                let metadata = extract_tile_metadata(kind, &source);
                tx.send((source, metadata)).ok();
            });
        }
        drop(tx);

        let mut result = BTreeMap::new();
        let mut first_error = None;
        for (source, metadata) in rx {
            match metadata {
                Ok(metadata) => {
                    result.insert(source, metadata);
                }
                // In-flight extractions finish; their outputs are discarded.
                Err(e) => first_error = first_error.or(Some(e)),
            }
        }
        pool.join();
        match first_error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Write every tile's pointer blob: reuse already-imported tiles, run
    /// convert/hash/copy tasks on the pool, and write pointers as results
    /// arrive. Returns the dataset-level metadata of everything imported.
    fn import_tiles_to_stream(
        &self,
        stream: &mut dyn Write,
        num_workers: usize,
        source_metadata: &BTreeMap<PathBuf, TileMetadata>,
        existing_dataset: Option<&Dataset>,
    ) -> Result<Vec<BTreeMap<String, Value>>, StrataError> {
        let inner_path = format!(
            "{}/{}",
            self.options.dataset_path,
            self.kind.dirname()
        );
        let lfs_root = self.repo.lfs_root();
        let mut imported_meta: Vec<BTreeMap<String, Value>> = Vec::new();

        // First pass, single-threaded: reuse tiles already imported, set up
        // a convert/hash/copy task for everything else.
        type TileTask = Box<dyn FnOnce() -> Result<(Value, TileMetadata), StrataError> + Send>;
        let mut tasks: Vec<(PathBuf, TileTask)> = Vec::new();

        for (source, metadata) in source_metadata {
            let tilename = metadata.tile["name"].as_str().expect("name is a string");
            let rel_blob_path = tilename_to_rel_path(tilename);
            let blob_path = format!("{inner_path}/{rel_blob_path}");
            let source_oid = metadata.tile["oid"].as_str().expect("oid is a string");

            if let Some(existing) = existing_dataset
                && let Some(summary) = existing.tile_summary(tilename)?
                && existing_tile_matches_source(source_oid, &summary)
            {
                // Already imported previously. Reuse it rather than
                // re-importing - reconverting wastes time and may not
                // convert identically the second time.
                let entry = existing
                    .odb()
                    .entry_at_path(existing.inner_tree, &rel_blob_path)?
                    .expect("summary implies the blob exists");
                copy_existing_blob_to_stream(stream, &blob_path, entry.oid)?;
                if let Some(format) = summary.get("format") {
                    imported_meta.push(BTreeMap::from([(
                        "format.json".to_string(),
                        format_from_summary_string(format),
                    )]));
                }
                continue;
            }

            let needs_conversion = self.options.convert_to_cloud_optimized
                && !is_cloud_optimized(&metadata.dataset_meta["format.json"]);
            let converter = self.converter.clone();
            if needs_conversion && converter.is_none() {
                return Err(StrataError::NotYetImplemented(
                    "no tile converter is configured for cloud-optimized conversion".to_string(),
                ));
            }

            let kind = self.kind;
            let lfs_root = lfs_root.clone();
            let source_path = source.clone();
            let metadata = metadata.clone();
            let task: TileTask = Box::new(move || {
                if needs_conversion {
                    let converter = converter.expect("checked above");
                    let convert = |src: &Path, dest: &Path| converter.convert(src, dest);
                    let pointer =
                        copy_file_to_local_lfs_cache(&lfs_root, &source_path, Some(&convert), None, true)?;
                    // Re-extract from the converted object in the cache.
                    let oid_hex = pointer["oid"]
                        .as_str()
                        .and_then(|o| o.strip_prefix("sha256:"))
                        .expect("cache copy returns a sha256 oid")
                        .to_string();
                    let cached = crate::lfs::lfs_object_path(&lfs_root, &oid_hex);
                    let mut converted = extract_tile_metadata(kind, &cached)?;
                    converted.tile.insert(
                        "name".to_string(),
                        metadata.tile["name"].clone(),
                    );
                    // Record provenance: which object this was converted
                    // from.
                    converted.tile.insert(
                        "sourceOid".to_string(),
                        metadata.tile["oid"].clone(),
                    );
                    Ok((pointer, converted))
                } else {
                    let oid = metadata.tile["oid"].as_str().expect("oid is a string");
                    let size = metadata.tile["size"].as_u64().expect("size is a number");
                    let pointer = copy_file_to_local_lfs_cache(
                        &lfs_root,
                        &source_path,
                        None,
                        Some((oid.to_string(), size)),
                        true,
                    )?;
                    Ok((pointer, metadata.clone()))
                }
            });
            tasks.push((source.clone(), task));
        }

        // Second pass: run the tasks (on the pool when it helps) and write
        // each pointer blob as its result arrives.
        let mut write_result =
            |metadata: TileMetadata, pointer: Value| -> Result<(), StrataError> {
                let tilename = metadata.tile["name"].as_str().expect("name is a string");
                let blob_path = format!("{inner_path}/{}", tilename_to_rel_path(tilename));
                let mut summary = metadata.tile.clone();
                summary.remove("name");
                let pointer_data =
                    merge_dicts_to_pointer_file_bytes(&Value::Object(summary), &pointer)?;
                write_blob_to_stream(stream, &blob_path, &pointer_data)?;
                imported_meta.push(metadata.dataset_meta.clone());
                Ok(())
            };

        if num_workers == 1 || tasks.len() <= 1 {
            for (_source, task) in tasks {
                let (pointer, metadata) = task()?;
                write_result(metadata, pointer)?;
            }
        } else {
            let pool = ThreadPool::new(num_workers);
            let (tx, rx) = mpsc::channel();
            for (source, task) in tasks {
                let tx = tx.clone();
                pool.execute(move || {
                    tx.send((source, task())).ok();
                });
            }
            drop(tx);

            let mut first_error = None;
            for (_source, result) in rx {
                match result {
                    Ok((pointer, metadata)) if first_error.is_none() => {
                        if let Err(e) = write_result(metadata, pointer) {
                            first_error = Some(e);
                        }
                    }
                    // After a failure, let in-flight work finish and discard
                    // its output.
                    Ok(_) => {}
                    Err(e) => first_error = first_error.or(Some(e)),
                }
            }
            pool.join();
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        Ok(imported_meta)
    }

}

/// Whether an existing tile in the dataset is the same object as the
/// source: either directly, or via the provenance of a previous conversion.
pub fn existing_tile_matches_source(source_oid: &str, existing_summary: &Value) -> bool {
    let matches = |key: &str| {
        existing_summary
            .get(key)
            .and_then(Value::as_str)
            .map(|oid| oid == source_oid)
            .unwrap_or(false)
    };
    matches("oid") || matches("sourceOid")
}

/// `format.json` value from the compact summary string in a pointer.
fn format_from_summary_string(format: &Value) -> Value {
    let Some(text) = format.as_str() else {
        return format.clone();
    };
    match text.split_once('/') {
        Some((file_type, optimization)) => json!({
            "fileType": file_type,
            "optimization": optimization,
        }),
        None => json!({"fileType": text, "optimization": Value::Null}),
    }
}

/// Choose a reasonable dataset path from the tile sources' common prefix.
pub fn infer_dataset_path(sources: &[PathBuf]) -> Option<String> {
    let names: Vec<String> = sources
        .iter()
        .filter_map(|s| s.file_name().and_then(|n| n.to_str()))
        .map(crate::dataset::tile::remove_tile_extension)
        .collect();
    common_prefix(&names).or_else(|| {
        let parents: Vec<String> = sources
            .iter()
            .filter_map(|s| s.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()))
            .map(str::to_string)
            .collect();
        common_prefix(&parents)
    })
}

fn common_prefix(names: &[String]) -> Option<String> {
    const MIN_LENGTH: usize = 4;
    let first = names.first()?;
    let mut prefix_len = first.len();
    for name in &names[1..] {
        prefix_len = first
            .bytes()
            .zip(name.bytes())
            .take(prefix_len)
            .take_while(|(a, b)| a == b)
            .count();
    }
    let prefix = first[..prefix_len].trim_end_matches(['_', '-', '.', ',', '/']);
    (prefix.len() >= MIN_LENGTH).then(|| prefix.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_metadata_marks_conflicts() {
        let a = BTreeMap::from([("format.json".to_string(), json!({"fileType": "laz"}))]);
        let b = BTreeMap::from([("format.json".to_string(), json!({"fileType": "laz"}))]);
        let merged = merge_metadata(&[a.clone(), b]);
        assert!(matches!(
            merged["format.json"],
            MergedMetaValue::Single(_)
        ));

        let c = BTreeMap::from([("format.json".to_string(), json!({"fileType": "geotiff"}))]);
        let merged = merge_metadata(&[a, c]);
        assert!(matches!(
            merged["format.json"],
            MergedMetaValue::Conflicting(_)
        ));
        assert!(
            check_for_non_homogenous_metadata(&merged, "point-cloud", false)
                .unwrap_err()
                .to_string()
                .contains("more than one file format")
        );
    }

    #[test]
    fn test_format_detection() {
        let dir = tempfile::tempdir().unwrap();
        let laz = dir.path().join("a.laz");
        std::fs::write(&laz, b"LASF-some-header-bytes").unwrap();
        let format = extract_tile_format(DatasetKind::PointCloud, &laz).unwrap();
        assert_eq!(format["fileType"], json!("laz"));
        assert!(!is_cloud_optimized(&format));

        let copc = dir.path().join("b.copc.laz");
        std::fs::write(&copc, b"LASF....copc....").unwrap();
        let format = extract_tile_format(DatasetKind::PointCloud, &copc).unwrap();
        assert!(is_cloud_optimized(&format));

        let tif = dir.path().join("c.tif");
        std::fs::write(&tif, b"II*\x00rest-of-tiff").unwrap();
        let format = extract_tile_format(DatasetKind::Raster, &tif).unwrap();
        assert_eq!(format["fileType"], json!("geotiff"));

        let bogus = dir.path().join("d.laz");
        std::fs::write(&bogus, b"not a tile").unwrap();
        assert!(extract_tile_format(DatasetKind::PointCloud, &bogus).is_err());
    }

    #[test]
    fn test_tile_compatibility() {
        let copc_ds = json!({"fileType": "laz", "optimization": "copc"});
        let plain_laz = json!({"fileType": "laz", "optimization": null});
        let geotiff = json!({"fileType": "geotiff", "optimization": null});
        assert!(is_tile_compatible(&plain_laz, &plain_laz));
        assert!(is_tile_compatible(&plain_laz, &copc_ds));
        assert!(!is_tile_compatible(&copc_ds, &plain_laz));
        assert!(!is_tile_compatible(&plain_laz, &geotiff));
    }

    #[test]
    fn test_existing_tile_matches_source() {
        let summary = json!({"oid": "sha256:aa", "sourceOid": "sha256:bb"});
        assert!(existing_tile_matches_source("sha256:aa", &summary));
        assert!(existing_tile_matches_source("sha256:bb", &summary));
        assert!(!existing_tile_matches_source("sha256:cc", &summary));
    }

    #[test]
    fn test_infer_dataset_path() {
        let sources = vec![
            PathBuf::from("/data/auckland/auckland_1.laz"),
            PathBuf::from("/data/auckland/auckland_2.laz"),
        ];
        assert_eq!(infer_dataset_path(&sources).as_deref(), Some("auckland"));

        let unalike = vec![
            PathBuf::from("/data/auckland/a.laz"),
            PathBuf::from("/data/auckland/b.laz"),
        ];
        // Falls back to the common parent directory name.
        assert_eq!(infer_dataset_path(&unalike).as_deref(), Some("auckland"));
    }
}
