//! All Git write operations for a lane: worktree lifecycle, dependency
//! merges, task-branch integration, and flow-branch finalization.
//!
//! Every mutating git call goes through [`GitRunner`] (shelling out to the
//! `git` binary), matching the read/write split used throughout this
//! workspace: `git2` is for reads only, writes shell out so worktree/branch
//! plumbing commands behave identically to a developer's terminal.

use std::path::{Path, PathBuf};
use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    Conflict(Vec<String>),
    NothingToMerge,
}

#[derive(Debug, thiserror::Error)]
pub enum GitPipelineError {
    #[error("git command failed: {0}")]
    Command(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree setup failed after retries: {0}")]
    WorktreeSetup(String),
}

pub type Result<T> = std::result::Result<T, GitPipelineError>;

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Abstraction over the `git` CLI so write-path operations can be mocked.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Branch name sanitizer: lane/task names pass through verbatim, but any
/// character outside `[A-Za-z0-9_/.-]` is mapped to `-`, and a literal `..`
/// is broken up, so a generated branch name can never be read as a shell
/// metacharacter sequence or a git refname escape (`..`, leading `-`).
pub fn sanitize_ref_component(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '/' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.contains("..") {
        out = out.replace("..", ".-");
    }
    out.trim_start_matches('-').to_string()
}

/// `<prefix><base36-timestamp>-<rand5>`, the pipeline-branch generator from
/// §4.2 step 6.
pub fn generate_pipeline_branch(prefix: &str) -> String {
    let ts = chrono::Utc::now().timestamp();
    let ts36 = to_base36(ts.max(0) as u64);
    let rand5: String = Uuid::new_v4().simple().to_string()[..5].to_string();
    format!("{prefix}{ts36}-{rand5}")
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

pub struct GitPipelineCoordinator {
    git: Box<dyn GitRunner>,
}

impl GitPipelineCoordinator {
    pub fn new() -> Self {
        Self {
            git: Box::new(RealGitRunner),
        }
    }

    pub fn with_runner(git: Box<dyn GitRunner>) -> Self {
        Self { git }
    }

    /// Create or reuse a worktree at `worktree_dir` on `pipeline_branch`,
    /// retrying up to 3 times with randomized 500-1500ms backoff per §4.4.
    pub fn ensure_worktree(
        &self,
        worktree_dir: &Path,
        pipeline_branch: &str,
        repo_root: &Path,
        base_branch: &str,
    ) -> Result<()> {
        if self.is_registered_worktree(repo_root, worktree_dir)? {
            return self.checkout(worktree_dir, pipeline_branch);
        }

        if worktree_dir.exists() {
            tracing::warn!(path = %worktree_dir.display(), "worktree directory present but not registered, cleaning up");
            let _ = std::fs::remove_dir_all(worktree_dir);
        }

        let mut last_err = String::new();
        for attempt in 0..3 {
            let branch_exists = self.local_branch_exists(repo_root, pipeline_branch)?;
            let args: Vec<&str> = if branch_exists {
                vec![
                    "worktree",
                    "add",
                    worktree_dir.to_str().unwrap_or("."),
                    pipeline_branch,
                ]
            } else {
                vec![
                    "worktree",
                    "add",
                    "-b",
                    pipeline_branch,
                    worktree_dir.to_str().unwrap_or("."),
                    base_branch,
                ]
            };

            match self.git.run_git(repo_root, &args) {
                Ok(out) if out.success => return Ok(()),
                Ok(out) => last_err = out.stderr,
                Err(e) => last_err = e,
            }

            if attempt < 2 {
                let jitter_ms = 500 + (Uuid::new_v4().as_u128() % 1000) as u64;
                std::thread::sleep(Duration::from_millis(jitter_ms));
            }
        }

        Err(GitPipelineError::WorktreeSetup(last_err))
    }

    fn is_registered_worktree(&self, repo_root: &Path, worktree_dir: &Path) -> Result<bool> {
        let out = self.run(repo_root, &["worktree", "list", "--porcelain"])?;
        let target = worktree_dir.to_string_lossy();
        Ok(out.lines().any(|l| l == format!("worktree {target}")))
    }

    fn local_branch_exists(&self, repo_root: &Path, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let out = self
            .git
            .run_git(repo_root, &["show-ref", "--verify", "--quiet", &refname])
            .map_err(GitPipelineError::Command)?;
        Ok(out.success)
    }

    fn checkout(&self, worktree_dir: &Path, branch: &str) -> Result<()> {
        self.run(worktree_dir, &["checkout", branch])?;
        Ok(())
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        match self.git.run_git(dir, args) {
            Ok(out) if out.success => Ok(out.stdout),
            Ok(out) => Err(GitPipelineError::Command(out.stderr)),
            Err(e) => Err(GitPipelineError::Command(e)),
        }
    }

    /// Resolve a ref to merge from a dependency lane's branch name: prefer a
    /// local branch, else fetch with an explicit refspec and use the remote
    /// tracking ref, last resort `FETCH_HEAD`.
    fn resolve_merge_ref(&self, worktree_dir: &Path, branch: &str) -> Result<String> {
        if self.local_branch_exists(worktree_dir, branch)? {
            return Ok(branch.to_string());
        }

        let refspec = format!("{branch}:refs/remotes/origin/{branch}");
        match self.git.run_git(worktree_dir, &["fetch", "origin", &refspec]) {
            Ok(out) if out.success => Ok(format!("origin/{branch}")),
            _ => {
                tracing::warn!(branch, "explicit refspec fetch failed, falling back to FETCH_HEAD");
                let _ = self.git.run_git(worktree_dir, &["fetch", "origin", branch]);
                Ok("FETCH_HEAD".to_string())
            }
        }
    }

    /// Detect whether merging `merge_ref` into the current branch would
    /// conflict, without altering the working tree's committed state: a
    /// trial `--no-commit --no-ff` merge, always aborted afterward. Conflict
    /// paths are read from the index via `git2` (`crate::git_read`) rather
    /// than scraped from `git merge`'s stderr text.
    fn trial_merge_conflicts(&self, worktree_dir: &Path, merge_ref: &str) -> Result<Vec<String>> {
        let result = self
            .git
            .run_git(worktree_dir, &["merge", "--no-commit", "--no-ff", merge_ref]);
        let conflicts = match &result {
            Ok(out) if !out.success => match crate::git_read::conflict_files(worktree_dir) {
                Ok(files) if !files.is_empty() => files,
                _ => out
                    .stderr
                    .lines()
                    .filter(|l| l.contains("CONFLICT"))
                    .map(|l| l.to_string())
                    .collect(),
            },
            _ => Vec::new(),
        };
        let _ = self.git.run_git(worktree_dir, &["merge", "--abort"]);
        match result {
            Ok(_) => Ok(conflicts),
            Err(e) => Err(GitPipelineError::Command(e)),
        }
    }

    fn safe_merge(&self, worktree_dir: &Path, merge_ref: &str, message: &str) -> Result<()> {
        match self
            .git
            .run_git(worktree_dir, &["merge", "--no-ff", "-m", message, merge_ref])
        {
            Ok(out) if out.success => Ok(()),
            Ok(out) => {
                let _ = self.git.run_git(worktree_dir, &["merge", "--abort"]);
                Err(GitPipelineError::Command(out.stderr))
            }
            Err(e) => Err(GitPipelineError::Command(e)),
        }
    }

    /// Merge each distinct dependency lane's pipeline branch into the
    /// current worktree, per §4.4's `mergeDependencyBranches`.
    pub fn merge_dependency_branches(
        &self,
        worktree_dir: &Path,
        dep_branches: &[String],
    ) -> Result<()> {
        for branch in dep_branches {
            let merge_ref = self.resolve_merge_ref(worktree_dir, branch)?;
            let conflicts = self.trial_merge_conflicts(worktree_dir, &merge_ref)?;
            if !conflicts.is_empty() {
                tracing::warn!(branch, conflicts = ?conflicts, "merge.conflict_detected");
                return Err(GitPipelineError::Command(format!(
                    "conflicts merging dependency branch {branch}: {conflicts:?}"
                )));
            }
            let message = format!("chore: merge dependency branch '{branch}'");
            self.safe_merge(worktree_dir, &merge_ref, &message)?;
        }
        Ok(())
    }

    /// Merge `task_branch` into `pipeline_branch`, checking out the latter
    /// first, per §4.2 step 12 / §4.4's `mergeTaskIntoPipeline`.
    pub fn merge_task_into_pipeline(
        &self,
        worktree_dir: &Path,
        task_name: &str,
        task_branch: &str,
        pipeline_branch: &str,
    ) -> Result<MergeResult> {
        self.checkout(worktree_dir, pipeline_branch)?;

        let diff = match crate::git_read::diff_stat(worktree_dir, pipeline_branch, task_branch) {
            Ok(stat) => stat,
            Err(_) => self.run(worktree_dir, &["diff", "--stat", pipeline_branch, task_branch])?,
        };
        if diff.trim().is_empty() {
            return Ok(MergeResult::NothingToMerge);
        }

        let conflicts = self.trial_merge_conflicts(worktree_dir, task_branch)?;
        if !conflicts.is_empty() {
            return Ok(MergeResult::Conflict(conflicts));
        }

        let message = format!("chore: merge task {task_name} into pipeline");
        self.safe_merge(worktree_dir, task_branch, &message)?;
        self.run(worktree_dir, &["push", "origin", pipeline_branch])?;
        Ok(MergeResult::Success)
    }

    /// Rename `pipeline_branch` to `flow_branch` and push, falling back to a
    /// timestamp-suffixed name if the push is rejected (non-fast-forward),
    /// per §4.4's `finalizeFlowBranch`. Returns the final branch name.
    pub fn finalize_flow_branch(
        &self,
        worktree_dir: &Path,
        flow_branch: &str,
        pipeline_branch: &str,
    ) -> Result<String> {
        if flow_branch == pipeline_branch {
            return Ok(pipeline_branch.to_string());
        }

        self.run(worktree_dir, &["checkout", "-B", flow_branch, pipeline_branch])?;

        let push = self
            .git
            .run_git(worktree_dir, &["push", "origin", flow_branch]);
        let final_name = match push {
            Ok(out) if out.success => flow_branch.to_string(),
            _ => {
                let suffix = chrono::Utc::now().timestamp();
                let renamed = format!("{flow_branch}-{suffix}");
                tracing::warn!(flow_branch, renamed, "push rejected, renaming flow branch");
                self.run(worktree_dir, &["branch", "-m", flow_branch, &renamed])?;
                self.run(worktree_dir, &["push", "origin", &renamed])?;
                renamed
            }
        };

        let _ = self
            .git
            .run_git(worktree_dir, &["branch", "-D", pipeline_branch]);
        Ok(final_name)
    }
}

impl Default for GitPipelineCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockGitRunner {
        responses: Mutex<Vec<GitOutput>>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    impl MockGitRunner {
        fn new(responses: Vec<GitOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl GitRunner for MockGitRunner {
        fn run_git(&self, _dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.commands
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(GitOutput {
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn ok(stdout: &str) -> GitOutput {
        GitOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> GitOutput {
        GitOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn sanitize_strips_shell_metacharacters_and_dotdot() {
        assert_eq!(sanitize_ref_component("lane a; rm -rf"), "lane-a--rm--rf");
        assert_eq!(sanitize_ref_component("feat..branch"), "feat.-branch");
    }

    #[test]
    fn generated_branch_has_prefix() {
        let branch = generate_pipeline_branch("cursorflow/");
        assert!(branch.starts_with("cursorflow/"));
    }

    #[test]
    fn merge_task_into_pipeline_nothing_to_merge() {
        let git = MockGitRunner::new(vec![
            ok(""),    // checkout
            ok(""),    // diff --stat (empty = nothing to merge)
        ]);
        let coord = GitPipelineCoordinator::with_runner(Box::new(git));
        let result = coord
            .merge_task_into_pipeline(Path::new("/wt"), "build", "task/build", "pipeline/x")
            .unwrap();
        assert_eq!(result, MergeResult::NothingToMerge);
    }

    #[test]
    fn merge_task_into_pipeline_conflict_detected() {
        let git = MockGitRunner::new(vec![
            ok(""),                          // checkout
            ok("file.rs | 2 +-\n"),          // diff --stat (has changes)
            fail("CONFLICT (content): Merge conflict in file.rs\n"), // trial merge
            ok(""),                          // merge --abort
        ]);
        let coord = GitPipelineCoordinator::with_runner(Box::new(git));
        let result = coord
            .merge_task_into_pipeline(Path::new("/wt"), "build", "task/build", "pipeline/x")
            .unwrap();
        match result {
            MergeResult::Conflict(files) => assert!(!files.is_empty()),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn merge_task_into_pipeline_success_pushes() {
        let git = MockGitRunner::new(vec![
            ok(""),                 // checkout
            ok("file.rs | 2 +-\n"), // diff --stat
            ok(""),                 // trial merge succeeds
            ok(""),                 // merge --abort (always run after trial)
            ok(""),                 // real merge
            ok(""),                 // push
        ]);
        let coord = GitPipelineCoordinator::with_runner(Box::new(git));
        let result = coord
            .merge_task_into_pipeline(Path::new("/wt"), "build", "task/build", "pipeline/x")
            .unwrap();
        assert_eq!(result, MergeResult::Success);
    }

    #[test]
    fn finalize_flow_branch_is_noop_when_equal() {
        let git = MockGitRunner::new(vec![]);
        let coord = GitPipelineCoordinator::with_runner(Box::new(git));
        let name = coord
            .finalize_flow_branch(Path::new("/wt"), "pipeline/x", "pipeline/x")
            .unwrap();
        assert_eq!(name, "pipeline/x");
    }

    #[test]
    fn finalize_flow_branch_renames_on_push_rejection() {
        let git = MockGitRunner::new(vec![
            ok(""),                         // checkout -B
            fail("! [rejected] non-fast-forward"), // push fails
            ok(""),                         // branch -m rename
            ok(""),                         // push renamed
            ok(""),                         // branch -D old pipeline
        ]);
        let coord = GitPipelineCoordinator::with_runner(Box::new(git));
        let name = coord
            .finalize_flow_branch(Path::new("/wt"), "flow/main", "pipeline/x")
            .unwrap();
        assert!(name.starts_with("flow/main-"));
    }
}
