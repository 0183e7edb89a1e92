//! The repository object: the gitdir, its well-known internal files, the
//! key/value config, the repository state machine (normal vs merging), and
//! access to the object database.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::dataset::Datasets;
use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::odb::signature::{Signature, SignatureType};
use crate::odb::store::ObjectDb;
use crate::workingcopy::WorkingCopy;

/// Well-known files found in the repository's internal directory.
pub struct RepoFiles;

impl RepoFiles {
    // Standard git files:
    pub const HEAD: &'static str = "HEAD";
    pub const INDEX: &'static str = "index";
    /// The head to reset to in case of an `--abort`.
    pub const ORIG_HEAD: &'static str = "ORIG_HEAD";
    /// The head we are merging HEAD with.
    pub const MERGE_HEAD: &'static str = "MERGE_HEAD";
    /// The draft of a commit message to use for the merge.
    pub const MERGE_MSG: &'static str = "MERGE_MSG";

    // Strata-specific files:
    /// The branch name that we merged with, if any.
    pub const MERGE_BRANCH: &'static str = "MERGE_BRANCH";
    /// The current state of the merge: cleanly merged items, conflicts, and
    /// resolutions.
    pub const MERGED_INDEX: &'static str = "MERGED_INDEX";
    /// A cached tree of the cleanly-merged portion of an ongoing merge.
    pub const MERGED_TREE: &'static str = "MERGED_TREE";
    /// Maps each feature to its lat/lon envelope, for spatially filtered
    /// clones.
    pub const FEATURE_ENVELOPES: &'static str = "feature_envelopes.db";
    /// Annotation store for diff summaries.
    pub const ANNOTATIONS: &'static str = "annotations.db";

    /// Every file that makes up the persisted merge state.
    pub const ALL_MERGE_FILES: [&'static str; 5] = [
        Self::MERGE_HEAD,
        Self::MERGE_MSG,
        Self::MERGE_BRANCH,
        Self::MERGED_INDEX,
        Self::MERGED_TREE,
    ];
}

/// Config keys the engine reads.
pub struct ConfigKeys;

impl ConfigKeys {
    pub const REPOSTRUCTURE_VERSION: &'static str = "strata.repostructure.version";
    /// Legacy branding fallback.
    pub const SNO_REPOSITORY_VERSION: &'static str = "sno.repository.version";

    pub const WORKINGCOPY_LOCATION: &'static str = "strata.workingcopy.location";
    /// Legacy branding fallback.
    pub const SNO_WORKINGCOPY_PATH: &'static str = "sno.workingcopy.path";

    pub const SPATIALFILTER_GEOMETRY: &'static str = "strata.spatialfilter.geometry";
    pub const SPATIALFILTER_CRS: &'static str = "strata.spatialfilter.crs";
    pub const SPATIALFILTER_REFERENCE: &'static str = "strata.spatialfilter.reference";
    pub const SPATIALFILTER_OBJECTID: &'static str = "strata.spatialfilter.objectid";

    pub const USER_NAME: &'static str = "user.name";
    pub const USER_EMAIL: &'static str = "user.email";

    /// Per-dataset do-not-checkout flag: `dataset.<path>.checkout`.
    pub fn dataset_checkout(dataset_path: &str) -> String {
        format!("dataset.{dataset_path}.checkout")
    }
}

/// The two repository states. `Merging` is entered by a conflicted merge
/// and left via `--continue` or `--abort`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepoState {
    Normal,
    Merging,
}

impl RepoState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RepoState::Normal => "normal",
            RepoState::Merging => "merging",
        }
    }
}

/// The spatial-filter parameters configured on a repository, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpatialFilterConfig {
    pub geometry: Option<String>,
    pub crs: Option<String>,
    pub reference: Option<String>,
    pub objectid: Option<String>,
}

const INFO_ATTRIBUTES: &str = "**/.*-dataset.v?/tile/** filter=lfs diff=lfs merge=lfs -text\n";
const INFO_EXCLUDE: &str = "/lfs\n/annotations.db\n/merge-state.lock\n";

/// The extra top-level blob recording the repository structure version,
/// written by whichever import creates the first commit. Once present it
/// travels with clones, so it takes precedence over the config key.
pub const REPOSTRUCTURE_VERSION_BLOB_PATH: &str = ".strata.repostructure.version";

/// The repository structure version this engine reads and writes.
pub const SUPPORTED_REPOSTRUCTURE_VERSION: &str = "3";

/// A Strata repository: object database, gitdir files, config, working
/// copy, merge-state area.
pub struct Repo {
    root: PathBuf,
    gitdir: PathBuf,
    odb: Arc<ObjectDb>,
    config: Mutex<BTreeMap<String, String>>,
    working_copy: RwLock<Option<Arc<dyn WorkingCopy>>>,
}

impl Repo {
    /// Create a new repository at the given path.
    pub fn init(root: impl Into<PathBuf>) -> Result<Repo, StrataError> {
        let root = root.into();
        let gitdir = root.join(".strata");
        fs::create_dir_all(gitdir.join("info"))?;
        fs::write(gitdir.join(RepoFiles::HEAD), "ref: refs/heads/main\n")?;
        fs::write(gitdir.join("info/attributes"), INFO_ATTRIBUTES)?;
        fs::write(gitdir.join("info/exclude"), INFO_EXCLUDE)?;

        let repo = Repo {
            root,
            gitdir,
            odb: Arc::new(ObjectDb::new()),
            config: Mutex::new(BTreeMap::new()),
            working_copy: RwLock::new(None),
        };
        repo.config_set(
            ConfigKeys::REPOSTRUCTURE_VERSION,
            SUPPORTED_REPOSTRUCTURE_VERSION,
        )?;
        Ok(repo)
    }

    /// Open an existing repository.
    pub fn open(root: impl Into<PathBuf>) -> Result<Repo, StrataError> {
        let root = root.into();
        let gitdir = root.join(".strata");
        if !gitdir.join(RepoFiles::HEAD).exists() {
            return Err(StrataError::NoRepository(root.display().to_string()));
        }
        let mut config = BTreeMap::new();
        if let Ok(text) = fs::read_to_string(gitdir.join("config")) {
            for line in text.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    config.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        Ok(Repo {
            root,
            gitdir,
            odb: Arc::new(ObjectDb::new()),
            config: Mutex::new(config),
            working_copy: RwLock::new(None),
        })
    }

    pub fn workdir_path(&self) -> &Path {
        &self.root
    }

    pub fn gitdir_path(&self) -> &Path {
        &self.gitdir
    }

    pub fn odb(&self) -> &Arc<ObjectDb> {
        &self.odb
    }

    /// The root of the LFS object cache.
    pub fn lfs_root(&self) -> PathBuf {
        self.gitdir.join("lfs")
    }

    // ---- config ----------------------------------------------------------

    pub fn config_get(&self, key: &str) -> Option<String> {
        self.config.lock().expect("config lock").get(key).cloned()
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<(), StrataError> {
        let mut config = self.config.lock().expect("config lock");
        config.insert(key.to_string(), value.to_string());
        let text: String = config
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        drop(config);
        self.write_gitdir_file("config", &text)
    }

    /// The repository structure version in effect.
    ///
    /// The version blob in the HEAD commit wins once an import has written
    /// it; the config key (with its legacy fallback) covers the repository
    /// until then.
    pub fn repostructure_version(&self) -> Result<Option<String>, StrataError> {
        if let Some(commit_oid) = self.head_commit()? {
            let tree = self.odb.read_commit(&commit_oid)?.tree_id;
            if let Some(entry) = self
                .odb
                .entry_at_path(tree, REPOSTRUCTURE_VERSION_BLOB_PATH)?
            {
                let blob = self.odb.read_blob(&entry.oid)?;
                let text = String::from_utf8_lossy(&blob.data).trim().to_string();
                return Ok(Some(text));
            }
        }
        Ok(self
            .config_get(ConfigKeys::REPOSTRUCTURE_VERSION)
            .or_else(|| self.config_get(ConfigKeys::SNO_REPOSITORY_VERSION)))
    }

    /// Fail unless the repository's structure version is one this engine
    /// can write. Called before every import.
    pub fn check_repostructure_version(&self) -> Result<(), StrataError> {
        if let Some(version) = self.repostructure_version()?
            && version != SUPPORTED_REPOSTRUCTURE_VERSION
        {
            return Err(StrataError::NotYetImplemented(format!(
                "repository structure version {version} is not supported (expected {SUPPORTED_REPOSTRUCTURE_VERSION})"
            )));
        }
        Ok(())
    }

    /// The configured working-copy location, honouring the legacy key.
    pub fn workingcopy_location(&self) -> Option<String> {
        self.config_get(ConfigKeys::WORKINGCOPY_LOCATION)
            .or_else(|| self.config_get(ConfigKeys::SNO_WORKINGCOPY_PATH))
    }

    pub fn spatial_filter(&self) -> SpatialFilterConfig {
        SpatialFilterConfig {
            geometry: self.config_get(ConfigKeys::SPATIALFILTER_GEOMETRY),
            crs: self.config_get(ConfigKeys::SPATIALFILTER_CRS),
            reference: self.config_get(ConfigKeys::SPATIALFILTER_REFERENCE),
            objectid: self.config_get(ConfigKeys::SPATIALFILTER_OBJECTID),
        }
    }

    /// Whether a dataset should be checked out into the working copy.
    /// Defaults to true; `dataset.<path>.checkout=false` opts out.
    pub fn should_checkout_dataset(&self, dataset_path: &str) -> bool {
        self.config_get(&ConfigKeys::dataset_checkout(dataset_path))
            .map(|v| v != "false")
            .unwrap_or(true)
    }

    /// Record the do-checkout flag for datasets (only non-default values
    /// are stored).
    pub fn configure_do_checkout_datasets(
        &self,
        dataset_paths: &[&str],
        do_checkout: bool,
    ) -> Result<(), StrataError> {
        for path in dataset_paths {
            if !do_checkout {
                self.config_set(&ConfigKeys::dataset_checkout(path), "false")?;
            }
        }
        Ok(())
    }

    pub fn set_user(&self, name: &str, email: &str) -> Result<(), StrataError> {
        self.config_set(ConfigKeys::USER_NAME, name)?;
        self.config_set(ConfigKeys::USER_EMAIL, email)
    }

    /// Fail with `NoUser` unless the committing identity is configured.
    pub fn check_user(&self) -> Result<(String, String), StrataError> {
        match (
            self.config_get(ConfigKeys::USER_NAME),
            self.config_get(ConfigKeys::USER_EMAIL),
        ) {
            (Some(name), Some(email)) => Ok((name, email)),
            _ => Err(StrataError::NoUser),
        }
    }

    pub fn author_signature(&self) -> Result<Signature, StrataError> {
        let (name, email) = self.check_user()?;
        Ok(Signature::new(SignatureType::Author, &name, &email))
    }

    pub fn committer_signature(&self) -> Result<Signature, StrataError> {
        let (name, email) = self.check_user()?;
        Ok(Signature::new(SignatureType::Committer, &name, &email))
    }

    // ---- HEAD and refs ---------------------------------------------------

    /// The full ref name HEAD points at, e.g. `refs/heads/main`.
    pub fn head_branch(&self) -> Result<String, StrataError> {
        let text = self.read_gitdir_file(RepoFiles::HEAD, false)?;
        Ok(text
            .trim()
            .strip_prefix("ref: ")
            .unwrap_or(text.trim())
            .to_string())
    }

    /// The branch shorthand, e.g. `main`.
    pub fn head_branch_shorthand(&self) -> Result<String, StrataError> {
        let branch = self.head_branch()?;
        Ok(branch
            .strip_prefix("refs/heads/")
            .unwrap_or(&branch)
            .to_string())
    }

    /// The commit HEAD points at, or `None` for an unborn head.
    pub fn head_commit(&self) -> Result<Option<ObjectHash>, StrataError> {
        Ok(self.odb.get_ref(&self.head_branch()?))
    }

    /// The tree of the HEAD commit, or the empty tree for an unborn head.
    pub fn head_tree(&self) -> Result<ObjectHash, StrataError> {
        match self.head_commit()? {
            Some(commit_oid) => Ok(self.odb.read_commit(&commit_oid)?.tree_id),
            None => Ok(self.odb.empty_tree()),
        }
    }

    /// Move the head branch to a new commit (creating it for an unborn
    /// head).
    pub fn set_head_commit(&self, commit_oid: ObjectHash) -> Result<(), StrataError> {
        self.odb.set_ref(&self.head_branch()?, commit_oid);
        Ok(())
    }

    /// The datasets visible at a revision (default: HEAD).
    pub fn datasets(&self, refish: Option<ObjectHash>) -> Result<Datasets, StrataError> {
        let tree = match refish {
            Some(commit_oid) => self.odb.read_commit(&commit_oid)?.tree_id,
            None => self.head_tree()?,
        };
        Ok(Datasets::at_tree(self.odb.clone(), tree))
    }

    // ---- state machine ---------------------------------------------------

    /// The repository state, derived from which merge files exist.
    pub fn state(&self) -> Result<RepoState, StrataError> {
        let merge_head = self.gitdir_file(RepoFiles::MERGE_HEAD).exists();
        let merged_index = self.gitdir_file(RepoFiles::MERGED_INDEX).exists();
        if merge_head && !merged_index {
            return Err(StrataError::InvalidOperation(
                "Repo is in \"merging\" state, but required file MERGED_INDEX is missing.\n\
                 Use `merge --abort` to recover."
                    .to_string(),
            ));
        }
        Ok(if merge_head {
            RepoState::Merging
        } else {
            RepoState::Normal
        })
    }

    /// Fail unless the repository is in the given state.
    pub fn require_state(&self, required: RepoState) -> Result<(), StrataError> {
        let state = self.state()?;
        if state != required {
            let message = match required {
                RepoState::Normal => {
                    "A merge is already ongoing - see `merge --abort` or `merge --continue`"
                }
                RepoState::Merging => {
                    "This only works when the repo is in \"merging\" state, but it is in \"normal\" state."
                }
            };
            return Err(StrataError::InvalidOperation(message.to_string()));
        }
        Ok(())
    }

    /// Acquire the repository-wide advisory lock guarding merge-state
    /// transitions. Held until the returned guard drops.
    pub fn lock_merge_state(&self) -> Result<MergeStateLock, StrataError> {
        let path = self.gitdir.join("merge-state.lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(MergeStateLock { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StrataError::InvalidOperation(
                    "Another merge operation is in progress (merge-state.lock exists)".to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ---- gitdir files ----------------------------------------------------

    pub fn gitdir_file(&self, rel_path: &str) -> PathBuf {
        self.gitdir.join(rel_path)
    }

    /// Atomically write a gitdir file (write-to-temp, rename).
    pub fn write_gitdir_file(&self, rel_path: &str, text: &str) -> Result<(), StrataError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.gitdir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.persist(self.gitdir_file(rel_path))
            .map_err(|e| StrataError::IOError(e.error))?;
        Ok(())
    }

    pub fn read_gitdir_file(&self, rel_path: &str, missing_ok: bool) -> Result<String, StrataError> {
        match fs::read_to_string(self.gitdir_file(rel_path)) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && missing_ok => {
                Ok(String::new())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StrataError::NotFound(
                format!("Missing repository file: {rel_path}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_gitdir_file(&self, rel_path: &str) -> Result<(), StrataError> {
        match fs::remove_file(self.gitdir_file(rel_path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---- working copy ----------------------------------------------------

    pub fn set_working_copy(&self, wc: Arc<dyn WorkingCopy>) {
        *self.working_copy.write().expect("working copy lock") = Some(wc);
    }

    pub fn working_copy(&self) -> Option<Arc<dyn WorkingCopy>> {
        self.working_copy.read().expect("working copy lock").clone()
    }
}

/// RAII guard for the merge-state advisory lock.
pub struct MergeStateLock {
    path: PathBuf,
}

impl Drop for MergeStateLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}
