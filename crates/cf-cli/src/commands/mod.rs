pub mod doctor;
pub mod resume;
pub mod run;
pub mod run_lane;
pub mod signal;

use std::path::{Path, PathBuf};

/// Find `<binary>` on `PATH`, the same lookup `LaneRunner::preflight` does.
pub(crate) fn which(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(binary)).find(|p| p.is_file())
}

/// The run directory's parent: `<repoRoot>/.cursorflow/runs/`.
pub(crate) fn runs_root(repo_root: &Path) -> PathBuf {
    repo_root.join(".cursorflow").join("runs")
}

/// Resolve a run id to its directory, defaulting to the most recently
/// created `run-*` directory under `.cursorflow/runs/` when `run_id` is
/// `None`.
pub(crate) fn resolve_run_dir(repo_root: &Path, run_id: Option<&str>) -> anyhow::Result<PathBuf> {
    let root = runs_root(repo_root);
    if let Some(id) = run_id {
        let dir = root.join(id);
        anyhow::ensure!(dir.is_dir(), "no such run: {id} (looked in {})", root.display());
        return Ok(dir);
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&root)
        .map_err(|e| anyhow::anyhow!("no runs found under {}: {e}", root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.file_name().map(|n| n.to_string_lossy().starts_with("run-")).unwrap_or(false))
        .collect();
    candidates.sort();
    candidates.pop().ok_or_else(|| anyhow::anyhow!("no runs found under {}", root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_run_dir_rejects_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_run_dir(dir.path(), Some("run-nope")).unwrap_err();
        assert!(err.to_string().contains("no such run"));
    }

    #[test]
    fn resolve_run_dir_finds_explicit_id() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = runs_root(dir.path()).join("run-20260101-aaaa");
        std::fs::create_dir_all(&run_dir).unwrap();

        let resolved = resolve_run_dir(dir.path(), Some("run-20260101-aaaa")).unwrap();
        assert_eq!(resolved, run_dir);
    }

    #[test]
    fn resolve_run_dir_defaults_to_lexically_last() {
        let dir = tempfile::tempdir().unwrap();
        let root = runs_root(dir.path());
        std::fs::create_dir_all(root.join("run-20260101-0000")).unwrap();
        std::fs::create_dir_all(root.join("run-20260228-0000")).unwrap();
        std::fs::create_dir_all(root.join("run-20260115-0000")).unwrap();

        let resolved = resolve_run_dir(dir.path(), None).unwrap();
        assert_eq!(resolved, root.join("run-20260228-0000"));
    }

    #[test]
    fn resolve_run_dir_errors_when_no_runs_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_run_dir(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("no runs found"));
    }

    #[test]
    fn which_finds_a_binary_known_to_exist_on_path() {
        assert!(which("sh").is_some() || which("cmd.exe").is_some());
    }
}
