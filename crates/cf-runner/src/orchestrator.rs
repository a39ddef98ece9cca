//! Discovers lane spec files, validates the cross-lane task DAG, spawns one
//! OS process per lane, and aggregates their exit codes, per spec §4.1.
//!
//! Grounded on `at-daemon/src/daemon.rs`'s interval-loop daemon structure
//! and `at-daemon/src/scheduler.rs`'s dependency-respecting ordering,
//! generalized from one async task per unit of work to one spawned OS
//! process per lane (a lane runs its own agent CLI child processes and
//! needs its own crash domain).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cf_core::config::CursorFlowConfig;
use cf_core::state_store::StateStore;
use cf_core::types::{aggregate_exit_codes, LaneExitCode, LaneSpec, LaneStatus};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::dag::{topo_sort, DagError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no lane files found in {0}")]
    NoLanes(PathBuf),
    #[error("failed to read lane file {path}: {source}")]
    ReadLane {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse lane file {path}: {source}")]
    ParseLane {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("dependency graph invalid: {0}")]
    Dag(#[from] DagError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

pub struct OrchestratorArgs {
    pub repo_root: PathBuf,
    pub tasks_dir: PathBuf,
    pub run_root: PathBuf,
    pub agent_binary: String,
    pub cli_binary: PathBuf,
    pub config: CursorFlowConfig,
    pub poll_interval: Duration,
}

pub struct Orchestrator {
    args: OrchestratorArgs,
}

/// One in-flight lane: its spawned `run-lane` child process and the path
/// used to poll its `state.json` for progress reporting.
pub struct LaneHandle {
    name: String,
    child: Child,
    state_dir: PathBuf,
}

/// Recorded at `<runRoot>/state.json` when a run starts, so `cursorflow
/// resume` can rediscover which lane file backs which lane without
/// re-scanning `tasksDir` (it may have since changed on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub repo_root: PathBuf,
    pub tasks_dir: PathBuf,
    pub agent_binary: String,
    /// `(laneName, laneFile)` pairs, in discovery order.
    pub lanes: Vec<(String, PathBuf)>,
}

impl RunManifest {
    pub fn path(run_root: &Path) -> PathBuf {
        run_root.join("state.json")
    }

    pub fn load(run_root: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(Self::path(run_root))?;
        serde_json::from_str(&text).map_err(|e| OrchestratorError::ParseLane {
            path: Self::path(run_root),
            source: e,
        })
    }

    fn save(&self, run_root: &Path) -> Result<()> {
        let path = Self::path(run_root);
        let json = serde_json::to_vec_pretty(self).map_err(|e| OrchestratorError::ParseLane {
            path: path.clone(),
            source: e,
        })?;
        let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

impl Orchestrator {
    pub fn new(args: OrchestratorArgs) -> Self {
        Self { args }
    }

    /// Discover every `*.json` lane file in the tasks directory.
    fn discover_lane_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.args.tasks_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(OrchestratorError::NoLanes(self.args.tasks_dir.clone()));
        }
        Ok(files)
    }

    fn load_lanes(&self, files: &[PathBuf]) -> Result<Vec<LaneSpec>> {
        let mut lanes = Vec::with_capacity(files.len());
        for path in files {
            let text = std::fs::read_to_string(path).map_err(|e| OrchestratorError::ReadLane {
                path: path.clone(),
                source: e,
            })?;
            let lane: LaneSpec = serde_json::from_str(&text).map_err(|e| OrchestratorError::ParseLane {
                path: path.clone(),
                source: e,
            })?;
            lanes.push(lane);
        }
        Ok(lanes)
    }

    fn prepare_run_tree(&self, lanes: &[LaneSpec], files: &[PathBuf]) -> Result<()> {
        std::fs::create_dir_all(&self.args.run_root)?;
        let lanes_dir = self.args.run_root.join("lanes");
        std::fs::create_dir_all(&lanes_dir)?;
        for lane in lanes {
            std::fs::create_dir_all(lanes_dir.join(&lane.name))?;
        }

        RunManifest {
            repo_root: self.args.repo_root.clone(),
            tasks_dir: self.args.tasks_dir.clone(),
            agent_binary: self.args.agent_binary.clone(),
            lanes: lanes.iter().zip(files.iter()).map(|(l, f)| (l.name.clone(), f.clone())).collect(),
        }
        .save(&self.args.run_root)?;

        Ok(())
    }

    /// Run every lane file through [`topo_sort`] up front, so a cyclic
    /// dependency fails loudly before any agent process is spawned, per
    /// spec §4.1 step 2.
    fn validate_dag(&self, lanes: &[LaneSpec]) -> Result<()> {
        topo_sort(lanes)?;
        Ok(())
    }

    fn spawn_lane(&self, tasks_file: &Path, lane_name: &str) -> Result<LaneHandle> {
        self.spawn_lane_at(tasks_file, lane_name, 0)
    }

    /// Spawn a lane's `run-lane` child process starting at `start_index`
    /// (nonzero when `cursorflow resume` is restarting it mid-flight).
    pub fn spawn_lane_at(&self, tasks_file: &Path, lane_name: &str, start_index: usize) -> Result<LaneHandle> {
        let state_dir = self.args.run_root.join("lanes").join(lane_name);
        let terminal_log = state_dir.join("terminal.log");
        std::fs::create_dir_all(&state_dir)?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&terminal_log)?;
        let log_file_err = log_file.try_clone()?;

        let child = Command::new(&self.args.cli_binary)
            .arg("run-lane")
            .arg("--repo-root")
            .arg(&self.args.repo_root)
            .arg("--run-root")
            .arg(&self.args.run_root)
            .arg("--tasks-file")
            .arg(tasks_file)
            .arg("--lane")
            .arg(lane_name)
            .arg("--agent-binary")
            .arg(&self.args.agent_binary)
            .arg("--start-index")
            .arg(start_index.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(log_file)
            .stderr(log_file_err)
            .kill_on_drop(true)
            .spawn()?;

        Ok(LaneHandle { name: lane_name.to_string(), child, state_dir })
    }

    /// Poll a set of already-spawned lane handles to completion. Used both
    /// by [`Self::run`] and by `cursorflow resume`, which spawns its own
    /// handles via [`Self::spawn_lane_at`].
    pub async fn wait_for_lanes(&self, handles: Vec<LaneHandle>) -> Vec<LaneExitCode> {
        self.poll_until_complete(handles).await
    }

    /// Run the full orchestration: discover, validate, spawn, poll, wait,
    /// aggregate. Returns the process exit code per spec §4.1 step 7.
    pub async fn run(&self) -> Result<i32> {
        let files = self.discover_lane_files()?;
        let lanes = self.load_lanes(&files)?;
        self.validate_dag(&lanes)?;
        self.prepare_run_tree(&lanes, &files)?;

        info!(lane_count = lanes.len(), "starting lanes");

        let mut handles = Vec::with_capacity(lanes.len());
        for (lane, path) in lanes.iter().zip(files.iter()) {
            handles.push(self.spawn_lane(path, &lane.name)?);
        }

        let exit_codes = self.poll_until_complete(handles).await;
        let code = aggregate_exit_codes(&exit_codes);
        info!(code, "all lanes finished");
        Ok(code)
    }

    /// Poll each lane's `state.json` at `poll_interval` for progress
    /// logging, and `try_wait()` each child for completion, until every
    /// lane has exited.
    async fn poll_until_complete(&self, mut handles: Vec<LaneHandle>) -> Vec<LaneExitCode> {
        let mut codes = Vec::with_capacity(handles.len());
        let mut last_reported: HashMap<String, usize> = HashMap::new();

        while !handles.is_empty() {
            tokio::time::sleep(self.args.poll_interval).await;

            let mut still_running = Vec::with_capacity(handles.len());
            for mut handle in handles {
                match handle.child.try_wait() {
                    Ok(Some(status)) => {
                        let code = LaneExitCode::from_code(status.code().unwrap_or(1));
                        info!(lane = %handle.name, ?code, "lane exited");
                        codes.push(code);
                    }
                    Ok(None) => {
                        self.report_progress(&handle, &mut last_reported);
                        still_running.push(handle);
                    }
                    Err(e) => {
                        warn!(lane = %handle.name, error = %e, "failed to poll lane process");
                        codes.push(LaneExitCode::Failure);
                    }
                }
            }
            handles = still_running;
        }
        codes
    }

    fn report_progress(&self, handle: &LaneHandle, last_reported: &mut HashMap<String, usize>) {
        let store = StateStore::new(&handle.state_dir);
        let Ok(state) = store.load() else { return };
        let previous = last_reported.get(&handle.name).copied().unwrap_or(usize::MAX);
        if state.current_task_index != previous {
            info!(
                lane = %handle.name,
                status = ?state.status,
                task = state.current_task_index,
                total = state.total_tasks,
                "lane progress"
            );
            last_reported.insert(handle.name.clone(), state.current_task_index);
        }
        if state.status == LaneStatus::Waiting {
            info!(lane = %handle.name, waiting_for = ?state.waiting_for, "lane waiting on dependencies");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::{DependencyPolicy, TaskSpec};

    fn lane(name: &str, tasks: Vec<TaskSpec>) -> LaneSpec {
        LaneSpec {
            name: name.to_string(),
            tasks,
            dependency_policy: DependencyPolicy::default(),
            branch_prefix: None,
            model: None,
            timeout: None,
        }
    }

    fn task(name: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            prompt: "do it".to_string(),
            model: None,
            timeout: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn orchestrator_for(tasks_dir: &Path, run_root: &Path) -> Orchestrator {
        Orchestrator::new(OrchestratorArgs {
            repo_root: tasks_dir.to_path_buf(),
            tasks_dir: tasks_dir.to_path_buf(),
            run_root: run_root.to_path_buf(),
            agent_binary: "cursor-agent".to_string(),
            cli_binary: PathBuf::from("cursorflow"),
            config: CursorFlowConfig::default(),
            poll_interval: Duration::from_millis(10),
        })
    }

    #[test]
    fn discover_lane_files_rejects_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(dir.path(), run_root.path());
        let err = orchestrator.discover_lane_files().unwrap_err();
        assert!(matches!(err, OrchestratorError::NoLanes(_)));
    }

    #[test]
    fn discover_lane_files_finds_json_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        let run_root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(dir.path(), run_root.path());
        let files = orchestrator.discover_lane_files().unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn validate_dag_rejects_cycle_before_anything_is_spawned() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(dir.path(), run_root.path());
        let lanes = vec![lane("a", vec![task("x1", &["a:x2"]), task("x2", &["a:x1"])])];
        let err = orchestrator.validate_dag(&lanes).unwrap_err();
        assert!(matches!(err, OrchestratorError::Dag(DagError::Cycle(_))));
    }

    #[test]
    fn prepare_run_tree_creates_per_lane_directories() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_for(dir.path(), run_root.path());
        let lanes = vec![lane("a", vec![task("x1", &[])]), lane("b", vec![task("y1", &[])])];
        let files = vec![dir.path().join("a.json"), dir.path().join("b.json")];
        orchestrator.prepare_run_tree(&lanes, &files).unwrap();
        assert!(run_root.path().join("lanes").join("a").is_dir());
        assert!(run_root.path().join("lanes").join("b").is_dir());

        let manifest = RunManifest::load(run_root.path()).unwrap();
        assert_eq!(manifest.lanes.len(), 2);
    }
}
