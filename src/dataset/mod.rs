//! The dataset model: presenting a commit's tree as typed collections.
//!
//! A dataset is a subtree at some path in a commit, marked by a fixed inner
//! directory name (e.g. `.table-dataset.v3`). Tabular datasets hold feature
//! blobs keyed by primary key; tile datasets hold pointer blobs keyed by
//! tile name; both hold meta items. Everything here is read-only - mutation
//! goes through the fast-import pipeline.

pub mod meta;
pub mod schema;
pub mod tabular;
pub mod tile;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::dataset::meta::MetaItemFileType;
use crate::dataset::schema::{Legend, Schema};
use crate::diff::delta::{Delta, KeyValue, LazyValue};
use crate::diff::diffs::{DatasetDiff, DeltaDiff, DiffSection, RepoDiff};
use crate::diff::filters::{DatasetKeyFilter, RepoKeyFilter};
use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::store::ObjectDb;
use crate::odb::tree::EntryMode;

/// The statically-dispatched dataset variant: decides blob layout, item
/// codecs and which sections exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetKind {
    Tabular,
    PointCloud,
    Raster,
}

impl DatasetKind {
    /// The fixed inner directory name marking this dataset kind.
    pub const fn dirname(&self) -> &'static str {
        match self {
            DatasetKind::Tabular => ".table-dataset.v3",
            DatasetKind::PointCloud => ".point-cloud-dataset.v1",
            DatasetKind::Raster => ".raster-dataset.v1",
        }
    }

    /// Human-readable type name.
    pub const fn dataset_type(&self) -> &'static str {
        match self {
            DatasetKind::Tabular => "table",
            DatasetKind::PointCloud => "point-cloud",
            DatasetKind::Raster => "raster",
        }
    }

    pub fn from_dirname(dirname: &str) -> Option<DatasetKind> {
        match dirname {
            ".table-dataset.v3" => Some(DatasetKind::Tabular),
            ".point-cloud-dataset.v1" => Some(DatasetKind::PointCloud),
            ".raster-dataset.v1" => Some(DatasetKind::Raster),
            _ => None,
        }
    }

    /// Whether a directory name is shaped like a dataset marker at all,
    /// whatever its version.
    pub fn looks_like_dataset_dirname(dirname: &str) -> bool {
        dirname.starts_with('.') && dirname.contains("-dataset.v")
    }

    /// The content section this kind stores: features or tiles.
    pub const fn content_section(&self) -> DiffSection {
        match self {
            DatasetKind::Tabular => DiffSection::Feature,
            DatasetKind::PointCloud | DatasetKind::Raster => DiffSection::Tile,
        }
    }

    pub const fn is_tile_based(&self) -> bool {
        matches!(self, DatasetKind::PointCloud | DatasetKind::Raster)
    }
}

/// One addressable item of a dataset section: its logical key, its blob
/// name inside the section subtree, and its blob OID.
#[derive(Clone, Debug)]
pub struct ItemRef {
    pub key: String,
    pub name: String,
    pub oid: ObjectHash,
}

/// A read-only view of one dataset inside a commit.
#[derive(Clone)]
pub struct Dataset {
    odb: Arc<ObjectDb>,
    pub path: String,
    pub kind: DatasetKind,
    /// The tree named by the dataset marker directory.
    pub inner_tree: ObjectHash,
    /// The tree at the dataset path (holds the marker dir and attachments).
    pub outer_tree: ObjectHash,
}

impl Dataset {
    /// `<path>/<marker-dirname>`
    pub fn inner_path(&self) -> String {
        format!("{}/{}", self.path, self.kind.dirname())
    }

    pub fn odb(&self) -> &Arc<ObjectDb> {
        &self.odb
    }

    // ---- meta ------------------------------------------------------------

    /// All meta items, decoded. Schema legends are internal blobs and are
    /// not included.
    pub fn meta_items(&self) -> Result<BTreeMap<String, Value>, StrataError> {
        let mut result = BTreeMap::new();
        for item in self.section_items(DiffSection::Meta)? {
            let file_type = MetaItemFileType::from_item_name(&item.key);
            let blob = self.odb.read_blob(&item.oid)?;
            result.insert(item.key, file_type.decode(&blob.data)?);
        }
        Ok(result)
    }

    /// One meta item, decoded, or `None` when absent.
    pub fn meta_item(&self, name: &str) -> Result<Option<Value>, StrataError> {
        let rel = format!("{}/meta/{name}", self.kind.dirname());
        let Some(entry) = self.odb.entry_at_path(self.outer_tree, &rel)? else {
            return Ok(None);
        };
        let blob = self.odb.read_blob(&entry.oid)?;
        Ok(Some(MetaItemFileType::from_item_name(name).decode(&blob.data)?))
    }

    /// The dataset's schema, from `meta/schema.json`.
    pub fn schema(&self) -> Result<Schema, StrataError> {
        let rel = format!("{}/meta/schema.json", self.kind.dirname());
        let entry = self
            .odb
            .entry_at_path(self.outer_tree, &rel)?
            .ok_or_else(|| {
                StrataError::NotFound(format!("Dataset {} has no schema.json", self.path))
            })?;
        let blob = self.odb.read_blob(&entry.oid)?;
        Schema::from_json_bytes(&blob.data)
    }

    /// Resolve a legend by its identifier from this dataset's legend folder.
    pub fn legend(&self, legend_hash: &str) -> Result<Legend, StrataError> {
        let rel = format!("{}/meta/legend/{legend_hash}", self.kind.dirname());
        let entry = self
            .odb
            .entry_at_path(self.outer_tree, &rel)?
            .ok_or_else(|| {
                StrataError::NotFound(format!(
                    "Dataset {} has no legend {legend_hash}",
                    self.path
                ))
            })?;
        let blob = self.odb.read_blob(&entry.oid)?;
        Legend::from_bytes(&blob.data)
    }

    /// All `(rel_path, oid)` legend blobs, for copying into a replacement
    /// import by OID.
    pub fn legend_blobs(&self) -> Result<Vec<(String, ObjectHash)>, StrataError> {
        let mut result = Vec::new();
        if let Some(entry) = self
            .odb
            .entry_at_path(self.inner_tree, "meta/legend")?
            .filter(|e| e.mode == EntryMode::Tree)
        {
            for (name, oid) in self.odb.flatten_tree(entry.oid)? {
                result.push((format!("meta/legend/{name}"), oid));
            }
        }
        Ok(result)
    }

    /// Names of attachment blobs stored directly at the dataset path.
    pub fn attachment_names(&self) -> Result<Vec<String>, StrataError> {
        let tree = self.odb.read_tree(&self.outer_tree)?;
        Ok(tree
            .entries
            .iter()
            .filter(|e| e.mode == EntryMode::Blob)
            .map(|e| e.name.clone())
            .collect())
    }

    // ---- content ---------------------------------------------------------

    /// Cheap item count for the content section, by tree-entry counting -
    /// no blob is read.
    pub fn feature_count(&self) -> Result<usize, StrataError> {
        let section_dir = self.kind.content_section().as_str();
        match self.odb.entry_at_path(self.inner_tree, section_dir)? {
            Some(entry) if entry.mode == EntryMode::Tree => self.odb.count_blobs(entry.oid),
            _ => Ok(0),
        }
    }

    /// Enumerate one section's items: key, blob name, blob OID.
    pub fn section_items(&self, section: DiffSection) -> Result<Vec<ItemRef>, StrataError> {
        let section_dir = match section {
            DiffSection::Meta => "meta",
            other => {
                if other != self.kind.content_section() {
                    return Ok(Vec::new());
                }
                other.as_str()
            }
        };
        let Some(entry) = self
            .odb
            .entry_at_path(self.inner_tree, section_dir)?
            .filter(|e| e.mode == EntryMode::Tree)
        else {
            return Ok(Vec::new());
        };

        let mut items = Vec::new();
        for (rel_path, oid) in self.odb.flatten_tree(entry.oid)? {
            match section {
                DiffSection::Meta => {
                    if rel_path.starts_with("legend/") {
                        continue;
                    }
                    items.push(ItemRef {
                        key: rel_path.clone(),
                        name: rel_path,
                        oid,
                    });
                }
                DiffSection::Feature => {
                    let name = rel_path.rsplit('/').next().unwrap_or(&rel_path).to_string();
                    let key = tabular::feature_key_from_encoded_name(&name)?;
                    items.push(ItemRef { key, name, oid });
                }
                DiffSection::Tile => {
                    let name = rel_path.rsplit('/').next().unwrap_or(&rel_path).to_string();
                    items.push(ItemRef {
                        key: name.clone(),
                        name,
                        oid,
                    });
                }
            }
        }
        items.sort_by(|a, b| natord::compare(&a.key, &b.key));
        Ok(items)
    }

    /// Decode one item of a section into its diff/summary value.
    pub fn decode_item(&self, section: DiffSection, item: &ItemRef) -> Result<Value, StrataError> {
        let blob = self.odb.read_blob(&item.oid)?;
        match section {
            DiffSection::Meta => MetaItemFileType::from_item_name(&item.key).decode(&blob.data),
            DiffSection::Feature => {
                tabular::decode_feature_blob(self, &item.name, &blob.data)
            }
            DiffSection::Tile => tile::tile_summary_from_pointer_blob(&blob.data),
        }
    }

    /// Stream the features (or tiles) of this dataset that match the filter,
    /// decoding each on demand.
    pub fn features<'a>(
        &'a self,
        filter: &DatasetKeyFilter,
    ) -> Result<impl Iterator<Item = Result<(String, Value), StrataError>> + 'a, StrataError> {
        let section = self.kind.content_section();
        let item_filter = filter.section(section);
        let items = self.section_items(section)?;
        Ok(items
            .into_iter()
            .filter(move |item| item_filter.contains(&item.key))
            .map(move |item| {
                let value = self.decode_item(section, &item)?;
                Ok((item.key, value))
            }))
    }

    /// Every tilename along with the SHA-256 of its backing object.
    pub fn tilenames_with_lfs_hashes(&self) -> Result<Vec<(String, String)>, StrataError> {
        let mut result = Vec::new();
        for item in self.section_items(DiffSection::Tile)? {
            let blob = self.odb.read_blob(&item.oid)?;
            let pointer = crate::lfs::PointerFile::from_bytes(&blob.data)?;
            result.push((item.key, pointer.oid_hex().to_string()));
        }
        Ok(result)
    }

    /// The decoded pointer summary of one tile, or `None` when absent.
    pub fn tile_summary(&self, tilename: &str) -> Result<Option<Value>, StrataError> {
        let rel = tile::tilename_to_rel_path(tilename);
        match self.odb.entry_at_path(self.inner_tree, &rel)? {
            Some(entry) => {
                let blob = self.odb.read_blob(&entry.oid)?;
                Ok(Some(tile::tile_summary_from_pointer_blob(&blob.data)?))
            }
            None => Ok(None),
        }
    }

    // ---- diffs -----------------------------------------------------------

    /// Generate the diff from `self` to `other` (`None` = dataset deleted).
    ///
    /// Blob OIDs are compared first; values decode lazily, only when a
    /// consumer asks for a delta's contents.
    pub fn diff(
        &self,
        other: Option<&Dataset>,
        ds_filter: &DatasetKeyFilter,
    ) -> Result<DatasetDiff, StrataError> {
        let mut result = DatasetDiff::new();
        for section in [DiffSection::Meta, self.kind.content_section()] {
            result.set_if_nonempty(section, self.diff_section(other, section, ds_filter)?);
        }
        Ok(result)
    }

    fn diff_section(
        &self,
        other: Option<&Dataset>,
        section: DiffSection,
        ds_filter: &DatasetKeyFilter,
    ) -> Result<DeltaDiff, StrataError> {
        let item_filter = ds_filter.section(section);
        let old_items: BTreeMap<String, ItemRef> = self
            .section_items(section)?
            .into_iter()
            .map(|i| (i.key.clone(), i))
            .collect();
        let new_items: BTreeMap<String, ItemRef> = match other {
            Some(other) => other
                .section_items(section)?
                .into_iter()
                .map(|i| (i.key.clone(), i))
                .collect(),
            None => BTreeMap::new(),
        };

        let keys: std::collections::BTreeSet<&String> =
            old_items.keys().chain(new_items.keys()).collect();

        let mut diff = DeltaDiff::new();
        for key in keys {
            if !item_filter.contains(key) {
                continue;
            }
            let old = old_items.get(key.as_str());
            let new = new_items.get(key.as_str());
            if let (Some(old), Some(new)) = (old, new)
                && old.oid == new.oid
            {
                continue;
            }
            let old_kv = old.map(|item| self.lazy_item(section, item));
            let new_kv = new.map(|item| {
                other
                    .expect("new item implies other dataset")
                    .lazy_item(section, item)
            });
            diff.add_delta(Delta::new(old_kv, new_kv)?);
        }
        Ok(diff)
    }

    /// A key-value whose value decodes on first access.
    fn lazy_item(&self, section: DiffSection, item: &ItemRef) -> KeyValue {
        let dataset = self.clone();
        let item = item.clone();
        let key = item.key.clone();
        KeyValue::lazy(
            key,
            LazyValue::deferred(move || {
                dataset
                    .decode_item(section, &item)
                    .unwrap_or_else(|e| Value::String(format!("<undecodable: {e}>")))
            }),
        )
    }
}

/// The datasets visible in one commit (or bare tree).
#[derive(Clone)]
pub struct Datasets {
    odb: Arc<ObjectDb>,
    pub root_tree: ObjectHash,
}

impl Datasets {
    pub fn at_commit(odb: Arc<ObjectDb>, commit_oid: ObjectHash) -> Result<Datasets, StrataError> {
        let commit = odb.read_commit(&commit_oid)?;
        Ok(Datasets {
            odb,
            root_tree: commit.tree_id,
        })
    }

    pub fn at_tree(odb: Arc<ObjectDb>, tree_oid: ObjectHash) -> Datasets {
        Datasets {
            odb,
            root_tree: tree_oid,
        }
    }

    /// All datasets matching the filter, in path order.
    pub fn list(&self, filter: &RepoKeyFilter) -> Result<Vec<Dataset>, StrataError> {
        let mut result = Vec::new();
        self.scan_tree(self.root_tree, String::new(), filter, &mut result)?;
        result.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(result)
    }

    fn scan_tree(
        &self,
        tree_oid: ObjectHash,
        prefix: String,
        filter: &RepoKeyFilter,
        result: &mut Vec<Dataset>,
    ) -> Result<(), StrataError> {
        let tree = self.odb.read_tree(&tree_oid)?;

        // A dataset marker directory claims this whole path.
        for entry in &tree.entries {
            if entry.mode == EntryMode::Tree && DatasetKind::looks_like_dataset_dirname(&entry.name)
            {
                let Some(kind) = DatasetKind::from_dirname(&entry.name) else {
                    return Err(StrataError::UnsupportedVersion {
                        path: prefix,
                        dirname: entry.name.clone(),
                    });
                };
                if filter.contains_dataset(&prefix) {
                    result.push(Dataset {
                        odb: self.odb.clone(),
                        path: prefix,
                        kind,
                        inner_tree: entry.oid,
                        outer_tree: tree_oid,
                    });
                }
                return Ok(());
            }
        }

        for entry in &tree.entries {
            if entry.mode != EntryMode::Tree || entry.name.starts_with('.') {
                continue;
            }
            let child_prefix = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            self.scan_tree(entry.oid, child_prefix, filter, result)?;
        }
        Ok(())
    }

    /// The dataset at a path, or `None`.
    pub fn get(&self, path: &str) -> Result<Option<Dataset>, StrataError> {
        let Some(entry) = self.odb.entry_at_path(self.root_tree, path)? else {
            return Ok(None);
        };
        if entry.mode != EntryMode::Tree {
            return Ok(None);
        }
        let outer = self.odb.read_tree(&entry.oid)?;
        for child in &outer.entries {
            if child.mode == EntryMode::Tree && DatasetKind::looks_like_dataset_dirname(&child.name)
            {
                let Some(kind) = DatasetKind::from_dirname(&child.name) else {
                    return Err(StrataError::UnsupportedVersion {
                        path: path.to_string(),
                        dirname: child.name.clone(),
                    });
                };
                return Ok(Some(Dataset {
                    odb: self.odb.clone(),
                    path: path.to_string(),
                    kind,
                    inner_tree: child.oid,
                    outer_tree: entry.oid,
                }));
            }
        }
        Ok(None)
    }

    /// The dataset at a path, failing `NotFound` when absent.
    pub fn require(&self, path: &str) -> Result<Dataset, StrataError> {
        self.get(path)?
            .ok_or_else(|| StrataError::NotFound(format!("No dataset found at {path:?}")))
    }
}

/// Compute the structured diff between two snapshots, filtered.
pub fn repo_diff(
    old: &Datasets,
    new: &Datasets,
    filter: &RepoKeyFilter,
) -> Result<RepoDiff, StrataError> {
    let old_datasets: BTreeMap<String, Dataset> = old
        .list(filter)?
        .into_iter()
        .map(|d| (d.path.clone(), d))
        .collect();
    let new_datasets: BTreeMap<String, Dataset> = new
        .list(filter)?
        .into_iter()
        .map(|d| (d.path.clone(), d))
        .collect();

    let mut result = RepoDiff::new();
    let paths: std::collections::BTreeSet<&String> =
        old_datasets.keys().chain(new_datasets.keys()).collect();
    for path in paths {
        let ds_filter = filter.dataset_filter(path);
        let old_ds = old_datasets.get(path.as_str());
        let new_ds = new_datasets.get(path.as_str());
        let ds_diff = match (old_ds, new_ds) {
            (Some(old_ds), new_ds) => old_ds.diff(new_ds, &ds_filter)?,
            (None, Some(new_ds)) => new_ds.diff(None, &ds_filter)?.invert(),
            (None, None) => continue,
        };
        result.set_if_nonempty(path.clone(), ds_diff);
    }
    Ok(result)
}
