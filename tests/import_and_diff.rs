//! End-to-end import and diff scenarios: re-importing identical data is a
//! no-op, and a computed diff can be applied through the import pipeline to
//! reproduce the target tree byte-for-byte.

use serde_json::{Map, Value, json};
use strata::dataset::schema::{ColumnSchema, DataType, Schema};
use strata::dataset::{Datasets, repo_diff};
use strata::diff::diffs::DiffSection;
use strata::diff::filters::RepoKeyFilter;
use strata::errors::StrataError;
use strata::hash::{HashKind, set_hash_kind_for_test};
use strata::import::ReplaceExisting;
use strata::import::table::{
    ImportTableOptions, MemoryImportSource, apply_feature_diff, fast_import_tables,
};
use strata::repo::Repo;

fn points_schema() -> Schema {
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

fn import_points(
    repo: &Repo,
    features: Vec<Map<String, Value>>,
    replace: bool,
) -> strata::hash::ObjectHash {
    let source = MemoryImportSource::new("points", points_schema(), features);
    fast_import_tables(
        repo,
        &[&source],
        ImportTableOptions {
            replace_existing: if replace {
                ReplaceExisting::Given
            } else {
                ReplaceExisting::DontReplace
            },
            allow_empty: true,
            ..Default::default()
        },
    )
    .unwrap()
}

fn tree_of(repo: &Repo, commit: strata::hash::ObjectHash) -> strata::hash::ObjectHash {
    repo.odb().read_commit(&commit).unwrap().tree_id
}

/// Importing the same three features twice produces an identical tree OID,
/// and is `NoChanges` when empty commits are not allowed.
#[test]
fn test_import_and_reimport_is_a_noop() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let (_dir, repo) = test_repo();

    let features = || vec![feature(1, "a"), feature(2, "b"), feature(3, "c")];
    let first = import_points(&repo, features(), false);
    let second = import_points(&repo, features(), true);
    assert_eq!(tree_of(&repo, first), tree_of(&repo, second));

    let source = MemoryImportSource::new("points", points_schema(), features());
    let result = fast_import_tables(
        &repo,
        &[&source],
        ImportTableOptions {
            replace_existing: ReplaceExisting::Given,
            allow_empty: false,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(StrataError::NoChanges)));
}

/// Compute `diff = B - A`, rewind to A, apply the diff via fast-import, and
/// land exactly on B's tree.
#[test]
fn test_diff_apply_roundtrip() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let (_dir, repo) = test_repo();

    let commit_a = import_points(&repo, vec![feature(1, "a"), feature(2, "b")], false);
    let commit_b = import_points(
        &repo,
        vec![feature(1, "A"), feature(2, "b"), feature(3, "c")],
        true,
    );

    let odb = repo.odb().clone();
    let datasets_a = Datasets::at_commit(odb.clone(), commit_a).unwrap();
    let datasets_b = Datasets::at_commit(odb.clone(), commit_b).unwrap();
    let diff = repo_diff(&datasets_a, &datasets_b, &RepoKeyFilter::match_all()).unwrap();

    let feature_diff = diff
        .get("points")
        .unwrap()
        .get(DiffSection::Feature)
        .unwrap();
    assert_eq!(feature_diff.len(), 2);

    // Rewind HEAD to A and replay the diff.
    odb.set_ref("refs/heads/main", commit_a);
    let applied = apply_feature_diff(&repo, "points", &points_schema(), feature_diff, "apply")
        .unwrap();
    assert_eq!(tree_of(&repo, applied), tree_of(&repo, commit_b));
}

/// Deltas in a freshly-computed diff stay lazy until the consumer asks.
#[test]
fn test_diff_values_are_lazy() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let (_dir, repo) = test_repo();

    let commit_a = import_points(&repo, vec![feature(1, "a")], false);
    let commit_b = import_points(&repo, vec![feature(1, "b")], true);

    let odb = repo.odb().clone();
    let datasets_a = Datasets::at_commit(odb.clone(), commit_a).unwrap();
    let datasets_b = Datasets::at_commit(odb, commit_b).unwrap();
    let diff = repo_diff(&datasets_a, &datasets_b, &RepoKeyFilter::match_all()).unwrap();

    let delta = diff
        .get("points")
        .unwrap()
        .get(DiffSection::Feature)
        .unwrap()
        .get("1")
        .unwrap();
    let old = delta.old.as_ref().unwrap();
    let new = delta.new.as_ref().unwrap();
    assert!(!old.is_materialized());
    assert!(!new.is_materialized());

    assert_eq!(new.value()["name"], json!("b"));
    assert!(new.is_materialized());
    assert!(!old.is_materialized());
}

/// Key filters restrict which deltas a diff reports.
#[test]
fn test_filtered_diff() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let (_dir, repo) = test_repo();

    let commit_a = import_points(&repo, vec![feature(1, "a"), feature(2, "b")], false);
    let commit_b = import_points(&repo, vec![feature(1, "A"), feature(2, "B")], true);

    let odb = repo.odb().clone();
    let datasets_a = Datasets::at_commit(odb.clone(), commit_a).unwrap();
    let datasets_b = Datasets::at_commit(odb, commit_b).unwrap();

    let filter = RepoKeyFilter::build_from_user_patterns(["points:1"]).unwrap();
    let diff = repo_diff(&datasets_a, &datasets_b, &filter).unwrap();
    let feature_diff = diff
        .get("points")
        .unwrap()
        .get(DiffSection::Feature)
        .unwrap();
    assert_eq!(feature_diff.len(), 1);
    assert!(feature_diff.get("1").is_some());

    let other = RepoKeyFilter::build_from_user_patterns(["elsewhere"]).unwrap();
    let diff = repo_diff(
        &Datasets::at_commit(repo.odb().clone(), commit_a).unwrap(),
        &Datasets::at_commit(repo.odb().clone(), commit_b).unwrap(),
        &other,
    )
    .unwrap();
    assert!(diff.is_empty());
}

/// The first import writes the repostructure-version blob; once present it
/// governs the repository - it wins over the config key, and a future
/// version refuses further imports.
#[test]
fn test_version_blob_written_and_enforced() {
    use strata::odb::commit::Commit;
    use strata::odb::signature::{Signature, SignatureType};
    use strata::repo::{ConfigKeys, REPOSTRUCTURE_VERSION_BLOB_PATH};

    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let (_dir, repo) = test_repo();
    let commit = import_points(&repo, vec![feature(1, "a")], false);

    // The blob landed in the first commit's tree and takes precedence over
    // whatever the config now claims.
    repo.config_set(ConfigKeys::REPOSTRUCTURE_VERSION, "2").unwrap();
    assert_eq!(
        repo.repostructure_version().unwrap().as_deref(),
        Some("3")
    );

    // Rewrite history so the blob claims a future version; imports refuse.
    let odb = repo.odb().clone();
    let mut blobs = odb
        .flatten_tree(odb.read_commit(&commit).unwrap().tree_id)
        .unwrap();
    blobs.insert(
        REPOSTRUCTURE_VERSION_BLOB_PATH.to_string(),
        odb.write_blob(b"4\n".to_vec()),
    );
    let tree = odb.build_tree(&blobs).unwrap();
    let sig = |t| Signature {
        signature_type: t,
        name: "tester".into(),
        email: "t@example.com".into(),
        timestamp: 1700000000,
        timezone: "+0000".into(),
    };
    let future = Commit::new(
        sig(SignatureType::Author),
        sig(SignatureType::Committer),
        tree,
        vec![],
        "\nfuture format\n",
    );
    let future_oid = odb.write_commit(&future).unwrap();
    repo.set_head_commit(future_oid).unwrap();

    let source = MemoryImportSource::new("more-points", points_schema(), vec![feature(9, "z")]);
    let result = fast_import_tables(&repo, &[&source], Default::default());
    assert!(matches!(result, Err(StrataError::NotYetImplemented(_))));
}

/// Importing the same sources into two empty repositories yields identical
/// tree OIDs - content addressing end to end.
#[test]
fn test_double_import_is_deterministic() {
    let _guard = set_hash_kind_for_test(HashKind::Sha1);
    let (_dir1, repo1) = test_repo();
    let (_dir2, repo2) = test_repo();

    let features = || vec![feature(1, "a"), feature(2, "b"), feature(3, "c")];
    let c1 = import_points(&repo1, features(), false);
    let c2 = import_points(&repo2, features(), false);
    assert_eq!(tree_of(&repo1, c1), tree_of(&repo2, c2));
}
