//! Three-way merging and the persisted merging state.
//!
//! A merge either fast-forwards, commits cleanly, or - when conflicts
//! remain - moves the repository into the `MERGING` state, where the
//! conflicts live in the MERGED_INDEX file and are resolved one at a time
//! ([`resolve`]). `--continue` commits the resolved tree; `--abort` puts
//! things back the way they were.

pub mod index;
pub mod resolve;

use tracing::debug;

use crate::diff::filters::RepoKeyFilter;
use crate::errors::StrataError;
use crate::hash::ObjectHash;
use crate::merge::index::{MergedIndex, conflict_label};
use crate::odb::commit::Commit;
use crate::odb::merge_trees::merge_trees;
use crate::repo::{Repo, RepoFiles, RepoState};

/// Options controlling a merge.
pub struct MergeOptions {
    /// When the merge resolves as a fast-forward, only update the branch
    /// pointer. With `ff: false` a merge commit is created regardless.
    pub ff: bool,
    /// Refuse to merge unless the merge resolves as a fast-forward.
    pub ff_only: bool,
    /// Don't perform the merge - just report what would be done.
    pub dry_run: bool,
    /// Error out on conflicts rather than entering the merging state.
    pub fail_on_conflict: bool,
    /// Merge into this ref instead of HEAD. Implies `fail_on_conflict`.
    pub into: Option<String>,
    pub message: Option<String>,
}

impl Default for MergeOptions {
    fn default() -> MergeOptions {
        MergeOptions {
            ff: true,
            ff_only: false,
            dry_run: false,
            fail_on_conflict: false,
            into: None,
            message: None,
        }
    }
}

/// The structured result of a merge.
#[derive(Debug)]
pub struct MergeOutcome {
    /// The commit the target ref ended up at (absent for dry runs and
    /// conflicted merges).
    pub commit: Option<ObjectHash>,
    pub fast_forward: bool,
    pub no_op: bool,
    pub dry_run: bool,
    /// Labels of the surfaced conflicts, in natural order.
    pub conflicts: Vec<String>,
    /// The repository state after the merge.
    pub state: RepoState,
    pub message: String,
}

/// Incorporate the named commit into `HEAD` (or `options.into`).
///
/// Does not update the working copy; callers reset it afterwards when the
/// merge produced a commit.
pub fn do_merge(
    repo: &Repo,
    revspec: &str,
    options: MergeOptions,
) -> Result<MergeOutcome, StrataError> {
    if options.ff_only && !options.ff {
        return Err(StrataError::InvalidArgument(
            "Conflicting parameters: --no-ff & --ff-only".to_string(),
        ));
    }
    if options.message.is_some() && options.ff_only {
        return Err(StrataError::InvalidArgument(
            "Conflicting parameters: --message & --ff-only".to_string(),
        ));
    }
    repo.require_state(RepoState::Normal)?;
    if let Some(wc) = repo.working_copy() {
        wc.check_not_dirty()?;
    }

    let odb = repo.odb();
    let theirs = odb.revparse(revspec)?;
    let (ours_ref, fail_on_conflict) = match &options.into {
        // Merging into a ref that isn't HEAD can't leave a resolvable
        // merging state.
        Some(into) if into != "HEAD" => (resolve_ref_name(repo, into)?, true),
        _ => (repo.head_branch()?, options.fail_on_conflict),
    };
    let ours = odb.get_ref(&ours_ref).ok_or_else(|| {
        StrataError::NoData(format!("{ours_ref} has no commits yet"))
    })?;

    let ancestor = odb
        .merge_base(ours, theirs)?
        .ok_or_else(|| {
            StrataError::InvalidOperation(format!(
                "Commits {theirs} and {ours} aren't related."
            ))
        })?;

    let branch_shorthand = branch_shorthand_for(repo, revspec);
    let message = options
        .message
        .clone()
        .unwrap_or_else(|| default_merge_message(&branch_shorthand, revspec));

    // We're up-to-date if we're trying to merge our own common ancestor.
    if ancestor == theirs {
        return Ok(MergeOutcome {
            commit: Some(ours),
            fast_forward: true,
            no_op: true,
            dry_run: options.dry_run,
            conflicts: Vec::new(),
            state: RepoState::Normal,
            message,
        });
    }

    // We're fast-forwardable if we're our own common ancestor.
    let can_ff = ancestor == ours;
    if options.ff_only && !can_ff {
        return Err(StrataError::InvalidOperation(
            "Can't resolve as a fast-forward merge and --ff-only specified".to_string(),
        ));
    }

    if can_ff && options.ff {
        debug!(commit = %theirs, "fast forward");
        if !options.dry_run {
            odb.set_ref(&ours_ref, theirs);
        }
        return Ok(MergeOutcome {
            commit: Some(theirs),
            fast_forward: true,
            no_op: false,
            dry_run: options.dry_run,
            conflicts: Vec::new(),
            state: RepoState::Normal,
            message,
        });
    }

    let ancestor_tree = odb.read_commit(&ancestor)?.tree_id;
    let ours_tree = odb.read_commit(&ours)?.tree_id;
    let theirs_tree = odb.read_commit(&theirs)?.tree_id;
    let tree_merge = merge_trees(odb, ancestor_tree, ours_tree, theirs_tree)?;

    if tree_merge.has_conflicts() {
        let merged_index = MergedIndex::from_tree_merge(tree_merge);
        let mut labels: Vec<String> = merged_index
            .conflicts
            .keys()
            .map(|path| conflict_label(path))
            .collect();
        labels.sort_by(|a, b| natord::compare(a, b));

        if fail_on_conflict {
            return Err(StrataError::MergeConflict(labels.len()));
        }
        if !options.dry_run {
            let _lock = repo.lock_merge_state()?;
            move_repo_to_merging_state(
                repo,
                &merged_index,
                theirs,
                &branch_shorthand,
                &message,
            )?;
        }
        return Ok(MergeOutcome {
            commit: None,
            fast_forward: false,
            no_op: false,
            dry_run: options.dry_run,
            conflicts: labels,
            state: if options.dry_run {
                RepoState::Normal
            } else {
                RepoState::Merging
            },
            message,
        });
    }

    if options.dry_run {
        return Ok(MergeOutcome {
            commit: None,
            fast_forward: false,
            no_op: false,
            dry_run: true,
            conflicts: Vec::new(),
            state: RepoState::Normal,
            message,
        });
    }

    repo.check_user()?;
    let merge_tree_id = tree_merge.write_tree(odb)?;
    debug!(tree = %merge_tree_id, "merge tree");

    let merge_commit = Commit::new(
        repo.author_signature()?,
        repo.committer_signature()?,
        merge_tree_id,
        vec![ours, theirs],
        &format!("\n{message}"),
    );
    let merge_commit_oid = odb.write_commit(&merge_commit)?;
    odb.set_ref(&ours_ref, merge_commit_oid);
    debug!(commit = %merge_commit_oid, "merge commit");

    if options.into.is_none()
        && let Some(wc) = repo.working_copy()
    {
        wc.reset_to_head(&RepoKeyFilter::match_all())?;
    }

    Ok(MergeOutcome {
        commit: Some(merge_commit_oid),
        fast_forward: false,
        no_op: false,
        dry_run: false,
        conflicts: Vec::new(),
        state: RepoState::Normal,
        message,
    })
}

fn resolve_ref_name(repo: &Repo, into: &str) -> Result<String, StrataError> {
    let odb = repo.odb();
    if odb.ref_exists(into) {
        return Ok(into.to_string());
    }
    let full = format!("refs/heads/{into}");
    if odb.ref_exists(&full) {
        return Ok(full);
    }
    Err(StrataError::NoBranch(into.to_string()))
}

fn branch_shorthand_for(repo: &Repo, revspec: &str) -> Option<String> {
    repo.odb()
        .ref_exists(&format!("refs/heads/{revspec}"))
        .then(|| revspec.to_string())
}

fn default_merge_message(branch_shorthand: &Option<String>, revspec: &str) -> String {
    match branch_shorthand {
        Some(branch) => format!("Merge branch \"{branch}\""),
        None => format!("Merge {revspec}"),
    }
}

/// Move the repository into the "merging" state, in which conflicts can be
/// resolved one by one.
fn move_repo_to_merging_state(
    repo: &Repo,
    merged_index: &MergedIndex,
    theirs: ObjectHash,
    branch_shorthand: &Option<String>,
    message: &str,
) -> Result<(), StrataError> {
    // MERGED_INDEX goes first: MERGE_HEAD without MERGED_INDEX is the
    // detectable corrupt state, so the index must never trail it.
    merged_index.write_to_repo(repo)?;
    repo.write_gitdir_file(RepoFiles::MERGE_HEAD, &format!("{theirs}\n"))?;
    repo.write_gitdir_file(RepoFiles::MERGE_MSG, message)?;
    if let Some(branch) = branch_shorthand {
        repo.write_gitdir_file(RepoFiles::MERGE_BRANCH, &format!("{branch}\n"))?;
    }

    // The merged tree is used mostly for updating the working copy, but
    // also for serialising feature resolves, so write it even with no WC.
    let merged_tree = merged_index.write_merged_tree(repo.odb())?;
    repo.write_gitdir_file(RepoFiles::MERGED_TREE, &format!("{merged_tree}\n"))?;

    debug_assert_eq!(repo.state()?, RepoState::Merging);
    if let Some(wc) = repo.working_copy() {
        wc.reset_to_head(&RepoKeyFilter::match_all())?;
    }
    Ok(())
}

/// Abandon an ongoing merge: put things back how they were before the
/// merge began. Robust against a corrupted merge state.
pub fn abort_merging_state(repo: &Repo) -> Result<(), StrataError> {
    let _lock = repo.lock_merge_state()?;
    let is_ongoing_merge = repo.gitdir_file(RepoFiles::MERGE_HEAD).exists();

    // If we are in a merge, we need to delete all the merge files. If we
    // are not, clean up any stale ones anyway.
    for filename in RepoFiles::ALL_MERGE_FILES {
        repo.remove_gitdir_file(filename)?;
    }
    debug_assert!(repo.state()? != RepoState::Merging);

    if !is_ongoing_merge {
        return Err(StrataError::InvalidOperation(
            "--abort only works when the repo is in \"merging\" state".to_string(),
        ));
    }

    // The user may have modified the working copy during the merging state.
    if let Some(wc) = repo.working_copy() {
        wc.reset_to_head(&RepoKeyFilter::match_all())?;
    }
    Ok(())
}

/// Complete a merge that had conflicts: commit the result and move the repo
/// back to the normal state. Only works once every conflict is resolved.
pub fn complete_merging_state(
    repo: &Repo,
    message: Option<String>,
) -> Result<ObjectHash, StrataError> {
    repo.require_state(RepoState::Merging)?;
    let _lock = repo.lock_merge_state()?;

    let merged_index = MergedIndex::read_from_repo(repo)?;
    if merged_index.unresolved_count() > 0 {
        return Err(StrataError::InvalidOperation(
            "Merge cannot be completed until all conflicts are resolved - see `conflicts`."
                .to_string(),
        ));
    }
    repo.check_user()?;

    let odb = repo.odb();
    let ours = repo.head_commit()?.ok_or_else(|| {
        StrataError::NoData("Cannot complete a merge on an unborn head".to_string())
    })?;
    let theirs: ObjectHash = repo
        .read_gitdir_file(RepoFiles::MERGE_HEAD, false)?
        .trim()
        .parse()
        .map_err(StrataError::InvalidArgument)?;

    let merge_tree_id = merged_index.write_resolved_tree(odb)?;
    debug!(tree = %merge_tree_id, "resolved merge tree");

    let message = match message {
        Some(message) => message,
        None => {
            let draft = repo.read_gitdir_file(RepoFiles::MERGE_MSG, true)?;
            if draft.trim().is_empty() {
                "Merge".to_string()
            } else {
                draft.trim_end().to_string()
            }
        }
    };

    let merge_commit = Commit::new(
        repo.author_signature()?,
        repo.committer_signature()?,
        merge_tree_id,
        vec![ours, theirs],
        &format!("\n{message}"),
    );
    let merge_commit_oid = odb.write_commit(&merge_commit)?;
    repo.set_head_commit(merge_commit_oid)?;
    debug!(commit = %merge_commit_oid, "merge commit");

    for filename in RepoFiles::ALL_MERGE_FILES {
        repo.remove_gitdir_file(filename)?;
    }
    debug_assert_eq!(repo.state()?, RepoState::Normal);

    if let Some(wc) = repo.working_copy() {
        wc.reset_to_head(&RepoKeyFilter::match_all())?;
    }
    Ok(merge_commit_oid)
}
