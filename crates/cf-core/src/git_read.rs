//! Native git read operations via `git2`.
//!
//! Provides fast, in-process alternatives to shelling out to `git` for
//! read-only queries. Write operations live in [`crate::git_pipeline`] and
//! stay as shell-outs — libgit2 is intentionally used only for reads here.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum GitReadError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("HEAD has no target (empty repository?)")]
    EmptyHead,
}

fn open(workdir: &Path) -> Result<git2::Repository, GitReadError> {
    Ok(git2::Repository::discover(workdir)?)
}

/// Current branch name, or a short OID if HEAD is detached.
pub fn current_branch(workdir: &Path) -> Result<String, GitReadError> {
    let repo = open(workdir)?;
    let head = repo.head()?;
    if head.is_branch() {
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    } else {
        let oid = head.target().ok_or(GitReadError::EmptyHead)?;
        Ok(format!("{oid:.7}"))
    }
}

/// Summary line count for `git diff --stat base..head`, used by
/// `GitPipelineCoordinator` to decide whether a merge has anything to do.
pub fn diff_stat(workdir: &Path, base: &str, head: &str) -> Result<String, GitReadError> {
    let repo = open(workdir)?;
    let base_obj = repo.revparse_single(base)?.peel_to_commit()?;
    let head_obj = repo.revparse_single(head)?.peel_to_commit()?;

    let mut opts = git2::DiffOptions::new();
    let diff = repo.diff_tree_to_tree(
        Some(&base_obj.tree()?),
        Some(&head_obj.tree()?),
        Some(&mut opts),
    )?;

    let stats = diff.stats()?;
    if stats.files_changed() == 0 {
        return Ok(String::new());
    }
    Ok(format!(
        "{} files changed, {} insertions(+), {} deletions(-)",
        stats.files_changed(),
        stats.insertions(),
        stats.deletions()
    ))
}

/// Paths currently in conflict in the index (`git diff --name-only
/// --diff-filter=U`), used after an aborted trial merge only transiently —
/// by the time this is called the merge must already have been aborted, so
/// this reads whatever conflict markers the real (non-trial) merge left.
pub fn conflict_files(workdir: &Path) -> Result<Vec<String>, GitReadError> {
    let repo = open(workdir)?;
    let index = repo.index()?;
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(our) = conflict.our {
            files.push(String::from_utf8_lossy(&our.path).to_string());
        } else if let Some(their) = conflict.their {
            files.push(String::from_utf8_lossy(&their.path).to_string());
        }
    }
    Ok(files)
}
