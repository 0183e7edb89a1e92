//! The tabular fast-import driver: streams features from import sources
//! into exactly one new commit, deduplicating feature blobs against prior
//! commits where that can actually pay off.

use std::collections::BTreeMap;
use std::io::Write;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::dataset::schema::Schema;
use crate::dataset::tabular::{encode_feature, encode_pk_values_to_rel_path};
use crate::dataset::{Dataset, DatasetKind};
use crate::diff::filters::{RepoKeyFilter, validate_dataset_path};
use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::import::ReplaceExisting;
use crate::import::stream::{
    copy_existing_blob_to_stream, generate_header, with_streaming_importer, write_blob_to_stream,
    write_delete_to_stream,
};
use crate::repo::{REPOSTRUCTURE_VERSION_BLOB_PATH, Repo, SUPPORTED_REPOSTRUCTURE_VERSION};
use crate::serialise::json_pack;

/// A producer of features plus their schema, to be imported at `dest_path`.
pub trait TableImportSource {
    fn dest_path(&self) -> &str;

    fn schema(&self) -> &Schema;

    fn feature_count(&self) -> usize;

    /// Stream every feature as a `{column name: value}` map.
    fn features(
        &self,
    ) -> Box<dyn Iterator<Item = Result<Map<String, Value>, StrataError>> + '_>;

    /// Stream the features with the given primary keys; missing keys are
    /// silently skipped.
    fn features_for_ids(
        &self,
        ids: &[Vec<Value>],
    ) -> Box<dyn Iterator<Item = Result<Map<String, Value>, StrataError>> + '_>;

    /// Extra meta items to store alongside the schema (title, description,
    /// CRS definitions).
    fn meta_items(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// A short human description, used in generated commit messages.
    fn describe(&self) -> String;
}

/// An in-memory import source.
pub struct MemoryImportSource {
    pub dest_path: String,
    pub schema: Schema,
    pub features: Vec<Map<String, Value>>,
    pub meta: BTreeMap<String, Value>,
}

impl MemoryImportSource {
    pub fn new(
        dest_path: impl Into<String>,
        schema: Schema,
        features: Vec<Map<String, Value>>,
    ) -> MemoryImportSource {
        MemoryImportSource {
            dest_path: dest_path.into(),
            schema,
            features,
            meta: BTreeMap::new(),
        }
    }

    fn pk_of(&self, feature: &Map<String, Value>) -> Vec<Value> {
        self.schema
            .pk_columns()
            .iter()
            .map(|c| feature.get(&c.name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

impl TableImportSource for MemoryImportSource {
    fn dest_path(&self) -> &str {
        &self.dest_path
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn feature_count(&self) -> usize {
        self.features.len()
    }

    fn features(
        &self,
    ) -> Box<dyn Iterator<Item = Result<Map<String, Value>, StrataError>> + '_> {
        Box::new(self.features.iter().cloned().map(Ok))
    }

    fn features_for_ids(
        &self,
        ids: &[Vec<Value>],
    ) -> Box<dyn Iterator<Item = Result<Map<String, Value>, StrataError>> + '_> {
        let ids = ids.to_vec();
        Box::new(
            self.features
                .iter()
                .filter(move |f| ids.contains(&self.pk_of(f)))
                .cloned()
                .map(Ok),
        )
    }

    fn meta_items(&self) -> BTreeMap<String, Value> {
        self.meta.clone()
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.dest_path)
    }
}

/// Options for a tabular fast-import.
#[derive(Default)]
pub struct ImportTableOptions {
    pub message: Option<String>,
    pub replace_existing: ReplaceExisting,
    /// The commit to start from. Defaults to HEAD (ignored when replacing
    /// everything).
    pub from_commit: Option<ObjectHash>,
    /// Primary-key values to replace, instead of replacing whole datasets.
    pub replace_ids: Option<Vec<Value>>,
    /// Create the commit even when the tree is unchanged.
    pub allow_empty: bool,
    /// Maximum number of features to import per source (inclusive).
    pub limit: Option<usize>,
}

/// Import all of the given sources as new datasets and commit the result,
/// returning the new commit.
pub fn fast_import_tables(
    repo: &Repo,
    sources: &[&dyn TableImportSource],
    options: ImportTableOptions,
) -> Result<ObjectHash, StrataError> {
    repo.check_repostructure_version()?;
    let odb = repo.odb().clone();

    // If we are replacing everything, we start from scratch.
    let from_commit = match options.replace_existing {
        ReplaceExisting::All => None,
        _ => match options.from_commit {
            Some(c) => Some(c),
            None => repo.head_commit()?,
        },
    };
    let from_tree = match from_commit {
        Some(commit_oid) => odb.read_commit(&commit_oid)?.tree_id,
        None => odb.empty_tree(),
    };

    validate_source_paths(repo, sources, from_commit, options.replace_existing)?;
    if options.replace_ids.is_some() {
        if options.replace_existing != ReplaceExisting::Given || sources.len() != 1 {
            return Err(StrataError::InvalidArgument(
                "Replacing by primary key needs exactly one source replacing its own dataset"
                    .to_string(),
            ));
        }
    }

    let message = match &options.message {
        Some(message) => message.clone(),
        None => generate_message(sources),
    };
    let author = repo.author_signature()?;
    let committer = repo.committer_signature()?;

    // Import onto a temp ref, then move the head branch afterwards.
    let import_ref = format!("refs/strata-import/{}", Uuid::new_v4());
    let header = generate_header(&author, &committer, &message, &import_ref, from_commit);

    let result = (|| {
        with_streaming_importer(&odb, |stream| {
            stream.write_all(header.as_bytes())?;

            // The extra blob that records the repo's version, on the very
            // first commit only.
            if from_commit.is_none() {
                write_blob_to_stream(
                    stream,
                    REPOSTRUCTURE_VERSION_BLOB_PATH,
                    format!("{SUPPORTED_REPOSTRUCTURE_VERSION}\n").as_bytes(),
                )?;
            }

            for source in sources {
                import_single_source(repo, *source, &options, from_commit, stream)?;
            }
            Ok(())
        })?;

        let new_commit_oid = odb.get_ref(&import_ref).ok_or_else(|| {
            StrataError::NotFound("Import produced no commit".to_string())
        })?;
        let new_commit = odb.read_commit(&new_commit_oid)?;
        if !options.allow_empty && new_commit.tree_id == from_tree {
            return Err(StrataError::NoChanges);
        }
        repo.set_head_commit(new_commit_oid)?;
        debug!(commit = %new_commit_oid, "fast-import complete");
        Ok(new_commit_oid)
    })();

    // Always remove the temporary import ref, success or not.
    odb.delete_ref(&import_ref);

    if result.is_ok()
        && let Some(wc) = repo.working_copy()
    {
        let imported: Vec<String> = sources.iter().map(|s| s.dest_path().to_string()).collect();
        wc.reset_to_head(&RepoKeyFilter::datasets(imported))?;
    }
    result
}

fn validate_source_paths(
    repo: &Repo,
    sources: &[&dyn TableImportSource],
    from_commit: Option<ObjectHash>,
    replace_existing: ReplaceExisting,
) -> Result<(), StrataError> {
    let mut seen = BTreeMap::new();
    for source in sources {
        let path = source.dest_path();
        validate_dataset_path(path, false)?;
        if seen.insert(path.to_lowercase(), path).is_some() {
            return Err(StrataError::InvalidOperation(format!(
                "Multiple import sources for {path}/"
            )));
        }
    }

    if replace_existing != ReplaceExisting::DontReplace {
        return Ok(());
    }
    let existing = repo.datasets(from_commit)?;
    let existing_paths: Vec<String> = existing
        .list(&RepoKeyFilter::match_all())?
        .into_iter()
        .map(|d| d.path)
        .collect();
    for source in sources {
        let dest = source.dest_path();
        for existing_path in &existing_paths {
            let collides = existing_path.eq_ignore_ascii_case(dest)
                || existing_path.starts_with(&format!("{dest}/"))
                || dest.starts_with(&format!("{existing_path}/"));
            if collides {
                return Err(StrataError::InvalidOperation(format!(
                    "Cannot import to {dest}/ - already exists in repository"
                )));
            }
        }
    }
    Ok(())
}

fn generate_message(sources: &[&dyn TableImportSource]) -> String {
    match sources {
        [source] => format!(
            "Import {} features to {}/ from {}",
            source.feature_count(),
            source.dest_path(),
            source.describe()
        ),
        many => format!("Import {} datasets", many.len()),
    }
}

fn import_single_source(
    repo: &Repo,
    source: &dyn TableImportSource,
    options: &ImportTableOptions,
    from_commit: Option<ObjectHash>,
    stream: &mut dyn Write,
) -> Result<(), StrataError> {
    let dest_path = source.dest_path();
    let dirname = DatasetKind::Tabular.dirname();
    let inner_path = format!("{dest_path}/{dirname}");
    let schema = source.schema();
    let legend = schema.legend();

    let replacing_dataset = match options.replace_existing {
        ReplaceExisting::Given => repo.datasets(from_commit)?.get(dest_path)?,
        _ => None,
    };

    if options.replace_existing == ReplaceExisting::Given {
        clear_tree_for_replace(
            stream,
            replacing_dataset.as_ref(),
            options.replace_ids.is_some(),
        )?;
    }

    let compare_old = should_compare_imported_features_against_old_features(
        repo,
        schema,
        replacing_dataset.as_ref(),
        from_commit,
    )?;

    // Features first; meta items are emitted afterwards, since some
    // importers discover meta while streaming features.
    let feature_iter: Box<dyn Iterator<Item = Result<Map<String, Value>, StrataError>>> =
        match &options.replace_ids {
            Some(ids) => {
                let replacing = replacing_dataset.as_ref().ok_or_else(|| {
                    StrataError::NotFound(format!(
                        "Cannot replace features of {dest_path} - dataset does not exist"
                    ))
                })?;
                let schema_for_pks = replacing.schema()?;
                let mut pk_tuples = Vec::with_capacity(ids.len());
                for id in ids {
                    let pk = schema_for_pks.sanitise_pks(id.clone());
                    let rel = encode_pk_values_to_rel_path(&pk)?;
                    write_delete_to_stream(stream, &format!("{inner_path}/{rel}"))?;
                    pk_tuples.push(pk);
                }
                source.features_for_ids(&pk_tuples)
            }
            None => source.features(),
        };

    let mut imported = 0usize;
    for feature in feature_iter {
        let feature = feature?;
        let (rel_path, blob_data) = encode_feature(&feature, schema)?;
        let blob_path = format!("{inner_path}/{rel_path}");

        let mut reused = false;
        if compare_old
            && let Some(replacing) = &replacing_dataset
            && let Some(entry) = replacing
                .odb()
                .entry_at_path(replacing.inner_tree, &rel_path)?
        {
            // The old blob survives unchanged if it still decodes to the
            // same feature; re-encoding it would only re-reference a newer
            // legend and bloat the repository.
            let name = rel_path.rsplit('/').next().unwrap_or(&rel_path);
            let old_blob = replacing.odb().read_blob(&entry.oid)?;
            let old_feature =
                crate::dataset::tabular::decode_feature_blob(replacing, name, &old_blob.data)?;
            if old_feature == Value::Object(feature.clone()) {
                copy_existing_blob_to_stream(stream, &blob_path, entry.oid)?;
                reused = true;
            }
        }
        if !reused {
            write_blob_to_stream(stream, &blob_path, &blob_data)?;
        }

        imported += 1;
        if let Some(limit) = options.limit
            && imported >= limit
        {
            debug!("stopping at {limit} features");
            break;
        }
    }

    // Meta items - the legend, the schema, then whatever the source offers.
    write_blob_to_stream(
        stream,
        &format!("{inner_path}/meta/legend/{}", legend.hash()),
        &legend.to_bytes()?,
    )?;
    // Keep any legends the replaced dataset was using: old feature blobs
    // (reused by OID above) still reference them.
    if let Some(replacing) = &replacing_dataset {
        for (rel, oid) in replacing.legend_blobs()? {
            copy_existing_blob_to_stream(stream, &format!("{inner_path}/{rel}"), oid)?;
        }
    }
    write_blob_to_stream(
        stream,
        &format!("{inner_path}/meta/schema.json"),
        &json_pack(&schema.to_json_value()?)?,
    )?;
    for (name, value) in source.meta_items() {
        let file_type = crate::dataset::meta::MetaItemFileType::from_item_name(&name);
        write_blob_to_stream(
            stream,
            &format!("{inner_path}/meta/{name}"),
            &file_type.encode(&value)?,
        )?;
    }
    Ok(())
}

/// Clears out the appropriate trees before importing actual data over the
/// top of an existing dataset.
fn clear_tree_for_replace(
    stream: &mut dyn Write,
    replacing_dataset: Option<&Dataset>,
    replacing_by_ids: bool,
) -> Result<(), StrataError> {
    let Some(replacing) = replacing_dataset else {
        return Ok(());
    };
    if !replacing_by_ids {
        // Delete the existing dataset, before we re-import it.
        write_delete_to_stream(stream, &replacing.path)?;
        return Ok(());
    }
    // Delete and reimport any attachments, and the meta subtree. Feature
    // blobs outside the replaced ids stay put.
    for name in replacing.attachment_names()? {
        write_delete_to_stream(stream, &format!("{}/{name}", replacing.path))?;
    }
    write_delete_to_stream(stream, &format!("{}/meta", replacing.inner_path()))?;
    Ok(())
}

/// Whether imported features should be compared to the previous feature
/// blobs at the same primary key.
///
/// Comparing prevents repo bloat after columns are added or removed, by
/// only creating new blobs when the old blob cannot carry the new schema.
/// After a primary-key change old features cannot be matched to new ones,
/// so there is no point trying; if the dataset's schema never changed the
/// blobs are byte-identical anyway and content-addressing already
/// deduplicates them.
pub fn should_compare_imported_features_against_old_features(
    repo: &Repo,
    source_schema: &Schema,
    replacing_dataset: Option<&Dataset>,
    from_commit: Option<ObjectHash>,
) -> Result<bool, StrataError> {
    let Some(replacing) = replacing_dataset else {
        return Ok(false);
    };
    let old_schema = replacing.schema()?;
    if old_schema != *source_schema {
        let counts = old_schema.diff_type_counts(source_schema);
        if counts.pk_updates > 0 {
            return Ok(false);
        }
        if counts.inserts > 0 || counts.deletes > 0 {
            return Ok(true);
        }
    }

    let Some(from_commit) = from_commit else {
        return Ok(false);
    };

    // Walk the log until we encounter a relevant schema change.
    for commit in repo.odb().walk(from_commit) {
        let commit = match commit {
            Ok(commit) => commit,
            // Probably a shallow clone and the commit just isn't present.
            // Run the comparison anyway; worst case it's a bit slow.
            Err(_) => return Ok(true),
        };
        let datasets = crate::dataset::Datasets::at_tree(repo.odb().clone(), commit.tree_id);
        let Some(old_dataset) = datasets.get(&replacing.path)? else {
            // No schema changes since this dataset was added.
            return Ok(false);
        };
        let old_schema = old_dataset.schema()?;
        if old_schema != *source_schema {
            // This revision had a schema change.
            let counts = old_schema.diff_type_counts(source_schema);
            if counts.pk_updates > 0 {
                // All features were rewritten in that revision; nothing to
                // deduplicate against.
                return Ok(false);
            }
            if counts.inserts > 0 || counts.deletes > 0 {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Apply a dataset's feature changes (from a diff) via the import pipeline:
/// deletions become replace-ids with no replacement, inserts and updates
/// become replacement features.
pub fn apply_feature_diff(
    repo: &Repo,
    dataset_path: &str,
    schema: &Schema,
    diff: &crate::diff::diffs::DeltaDiff,
    message: &str,
) -> Result<ObjectHash, StrataError> {
    let mut features = Vec::new();
    let mut replace_ids = Vec::new();
    for (_key, delta) in diff.iter() {
        if let Some(old) = &delta.old {
            let old_value = old.value();
            replace_ids.push(pk_values_of(old_value, schema));
        }
        if let Some(new) = &delta.new {
            if let Value::Object(map) = new.value() {
                features.push(map.clone());
                replace_ids.push(pk_values_of(new.value(), schema));
            }
        }
    }
    replace_ids.dedup();

    let source = MemoryImportSource::new(dataset_path, schema.clone(), features);
    fast_import_tables(
        repo,
        &[&source],
        ImportTableOptions {
            message: Some(message.to_string()),
            replace_existing: ReplaceExisting::Given,
            replace_ids: Some(replace_ids.into_iter().map(Value::Array).collect()),
            ..Default::default()
        },
    )
}

fn pk_values_of(feature: &Value, schema: &Schema) -> Vec<Value> {
    schema
        .pk_columns()
        .iter()
        .map(|c| feature.get(&c.name).cloned().unwrap_or(Value::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dataset::schema::{ColumnSchema, DataType};
    use crate::hash::{HashKind, set_hash_kind_for_test};

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnSchema {
                id: "c1".into(),
                name: "fid".into(),
                data_type: DataType::Integer,
                primary_key_index: Some(0),
            },
            ColumnSchema {
                id: "c2".into(),
                name: "name".into(),
                data_type: DataType::Text,
                primary_key_index: None,
            },
        ])
    }

    fn feature(fid: i64, name: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("fid".into(), json!(fid));
        map.insert("name".into(), json!(name));
        map
    }

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        repo.set_user("Tester", "t@example.com").unwrap();
        (dir, repo)
    }

    #[test]
    fn test_basic_import() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (_dir, repo) = test_repo();
        let source = MemoryImportSource::new(
            "points",
            schema(),
            vec![feature(1, "a"), feature(2, "b"), feature(3, "c")],
        );
        let commit = fast_import_tables(&repo, &[&source], Default::default()).unwrap();

        assert_eq!(repo.head_commit().unwrap(), Some(commit));
        let datasets = repo.datasets(None).unwrap();
        let dataset = datasets.require("points").unwrap();
        assert_eq!(dataset.kind, DatasetKind::Tabular);
        assert_eq!(dataset.feature_count().unwrap(), 3);
        assert_eq!(dataset.schema().unwrap(), schema());

        let features: Vec<_> = dataset
            .features(&crate::diff::filters::DatasetKeyFilter::match_all())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].0, "1");
        assert_eq!(features[0].1["name"], json!("a"));
    }

    #[test]
    fn test_import_without_replace_rejects_existing() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (_dir, repo) = test_repo();
        let source = MemoryImportSource::new("points", schema(), vec![feature(1, "a")]);
        fast_import_tables(&repo, &[&source], Default::default()).unwrap();

        let again = MemoryImportSource::new("points", schema(), vec![feature(2, "b")]);
        let result = fast_import_tables(&repo, &[&again], Default::default());
        assert!(matches!(result, Err(StrataError::InvalidOperation(_))));
    }

    /// Re-importing identical content with replace produces an identical
    /// tree, which is `NoChanges` unless empty commits are allowed.
    #[test]
    fn test_reimport_is_a_noop() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (_dir, repo) = test_repo();
        let features = vec![feature(1, "a"), feature(2, "b"), feature(3, "c")];
        let source = MemoryImportSource::new("points", schema(), features.clone());
        let first = fast_import_tables(&repo, &[&source], Default::default()).unwrap();

        let source = MemoryImportSource::new("points", schema(), features);
        let result = fast_import_tables(
            &repo,
            &[&source],
            ImportTableOptions {
                replace_existing: ReplaceExisting::Given,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(StrataError::NoChanges)));

        // With allow_empty, the new commit's tree is identical.
        let source = MemoryImportSource::new(
            "points",
            schema(),
            vec![feature(1, "a"), feature(2, "b"), feature(3, "c")],
        );
        let second = fast_import_tables(
            &repo,
            &[&source],
            ImportTableOptions {
                replace_existing: ReplaceExisting::Given,
                allow_empty: true,
                ..Default::default()
            },
        )
        .unwrap();
        let odb = repo.odb();
        assert_eq!(
            odb.read_commit(&first).unwrap().tree_id,
            odb.read_commit(&second).unwrap().tree_id
        );
    }

    #[test]
    fn test_limit_is_inclusive() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (_dir, repo) = test_repo();
        let source = MemoryImportSource::new(
            "points",
            schema(),
            vec![feature(1, "a"), feature(2, "b"), feature(3, "c")],
        );
        fast_import_tables(
            &repo,
            &[&source],
            ImportTableOptions {
                limit: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        let dataset = repo.datasets(None).unwrap().require("points").unwrap();
        assert_eq!(dataset.feature_count().unwrap(), 2);
    }

    #[test]
    fn test_replace_ids_deletes_and_updates() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (_dir, repo) = test_repo();
        let source = MemoryImportSource::new(
            "points",
            schema(),
            vec![feature(1, "a"), feature(2, "b"), feature(3, "c")],
        );
        fast_import_tables(&repo, &[&source], Default::default()).unwrap();

        // Replace feature 1, delete feature 3 (no replacement supplied).
        let source = MemoryImportSource::new("points", schema(), vec![feature(1, "A")]);
        fast_import_tables(
            &repo,
            &[&source],
            ImportTableOptions {
                replace_existing: ReplaceExisting::Given,
                replace_ids: Some(vec![json!([1]), json!([3])]),
                ..Default::default()
            },
        )
        .unwrap();

        let dataset = repo.datasets(None).unwrap().require("points").unwrap();
        let features: BTreeMap<String, Value> = dataset
            .features(&crate::diff::filters::DatasetKeyFilter::match_all())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(features.len(), 2);
        assert_eq!(features["1"]["name"], json!("A"));
        assert_eq!(features["2"]["name"], json!("b"));
        assert!(!features.contains_key("3"));
    }

    #[test]
    fn test_should_compare_heuristic() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let (_dir, repo) = test_repo();
        let source = MemoryImportSource::new("points", schema(), vec![feature(1, "a")]);
        let head = fast_import_tables(&repo, &[&source], Default::default()).unwrap();
        let dataset = repo.datasets(None).unwrap().require("points").unwrap();

        // No replacing dataset: never compare.
        assert!(
            !should_compare_imported_features_against_old_features(
                &repo,
                &schema(),
                None,
                Some(head)
            )
            .unwrap()
        );

        // Same schema, no schema changes in history: no point comparing.
        assert!(
            !should_compare_imported_features_against_old_features(
                &repo,
                &schema(),
                Some(&dataset),
                Some(head)
            )
            .unwrap()
        );

        // Column added: compare.
        let mut wider = schema();
        wider.columns.push(ColumnSchema {
            id: "c3".into(),
            name: "extra".into(),
            data_type: DataType::Text,
            primary_key_index: None,
        });
        assert!(
            should_compare_imported_features_against_old_features(
                &repo,
                &wider,
                Some(&dataset),
                Some(head)
            )
            .unwrap()
        );

        // Primary key moved: no deduplication is possible.
        let mut repk = schema();
        repk.columns[0].primary_key_index = None;
        repk.columns[1].primary_key_index = Some(0);
        assert!(
            !should_compare_imported_features_against_old_features(
                &repo,
                &repk,
                Some(&dataset),
                Some(head)
            )
            .unwrap()
        );
    }
}
