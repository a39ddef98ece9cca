//! Executes one lane's task list sequentially against an isolated worktree,
//! per spec §4.2: prepare the worktree, wait on dependencies, send each
//! prompt to the agent, commit/push per task, merge into the pipeline
//! branch, finalize the flow branch.
//!
//! Grounded on `at-agents/src/task_orchestrator.rs`'s phase loop (loop a
//! bounded number of times, persisting progress after each component call)
//! and `at-daemon/src/orchestrator.rs`'s per-phase `?`-propagation. Runs as
//! its own OS process, spawned by [`crate::orchestrator::Orchestrator`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cf_agent::classify::extract_dependency_request;
use cf_agent::circuit_breaker::CircuitBreakerConfig;
use cf_agent::supervisor::{AgentSupervisor, OutputSink, SendPromptArgs, TerminalLogSink};
use cf_core::config::CursorFlowConfig;
use cf_core::git_pipeline::GitPipelineCoordinator;
use cf_core::state_store::StateStore;
use cf_core::types::{
    ConversationEntry, ConversationRole, DependencyPolicy, InterventionSource, LaneSpec, LaneState,
    LaneStatus, TaskSpec,
};
use cf_stall::detector::{LaneStallState, StallAction};
use cf_stall::intervention::{write_diagnostic, InterventionBus};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LaneRunnerError {
    #[error("no tasks defined for lane")]
    EmptyTaskList,
    #[error("task '{0}' is missing a name or prompt")]
    InvalidTask(String),
    #[error("state store error: {0}")]
    State(#[from] cf_core::state_store::StateStoreError),
    #[error("git pipeline error: {0}")]
    Git(#[from] cf_core::git_pipeline::GitPipelineError),
    #[error("agent error: {0}")]
    Agent(#[from] cf_agent::supervisor::AgentError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dependency wait timed out for {0:?}")]
    DependencyTimeout(Vec<String>),
    #[error("dependency lane failed: {0}")]
    DependencyFailed(String),
    #[error("merge conflict in dependency merge: {0:?}")]
    MergeConflict(Vec<String>),
    #[error("blocked: agent requested a dependency change that policy forbids")]
    BlockedDependency,
}

pub type Result<T> = std::result::Result<T, LaneRunnerError>;

/// Exit codes this process returns to the orchestrator, per spec §4.1/§6.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_BLOCKED: i32 = 2;

/// Upper bound on how many times a single task attempt may be retried after
/// the stall ticker killed the agent mid-call (continue/stronger-prompt/
/// restart). Matches `StallConfig`'s `max_restarts` default so a runaway
/// ladder can't retry indefinitely even if `analyze()` is mis-configured.
const MAX_INTERVENTION_RETRIES: u32 = 8;

pub struct LaneRunnerArgs {
    pub repo_root: PathBuf,
    pub run_root: PathBuf,
    pub tasks_file: PathBuf,
    pub lane_name: String,
    pub agent_binary: String,
    pub config: CursorFlowConfig,
    pub start_index: usize,
}

pub struct LaneRunner {
    args: LaneRunnerArgs,
    lane_dir: PathBuf,
    store: StateStore,
    git: GitPipelineCoordinator,
    agent: AgentSupervisor,
    intervention: InterventionBus,
    stall: Arc<Mutex<LaneStallState>>,
    shutdown: Arc<AtomicBool>,
    recovery_exhausted: Arc<AtomicBool>,
}

/// Feeds every stdout/stderr line to the shared stall state so the ticker
/// (running concurrently with the blocking `send_prompt` call) observes
/// activity without owning the reader itself.
struct StallTrackingSink {
    state: Arc<Mutex<LaneStallState>>,
}

impl OutputSink for StallTrackingSink {
    fn on_line(&self, line: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.record_activity(line.len(), line);
        }
    }
}

/// Handle to a background stall-analysis ticker; `stop()` halts it and
/// reports whether the ladder reached `RunDoctor`/`AbortLane` while it ran,
/// and whether it killed the in-flight agent child for a continue/stronger-
/// prompt/restart escalation (in which case the caller should retry the
/// attempt rather than treat the resulting error as a real failure).
struct StallTicker {
    stop_flag: Arc<AtomicBool>,
    hit_abort: Arc<AtomicBool>,
    intervention_fired: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl StallTicker {
    fn stop(self) -> (bool, bool) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.handle.abort();
        (
            self.hit_abort.load(Ordering::Relaxed),
            self.intervention_fired.load(Ordering::Relaxed),
        )
    }
}

impl LaneRunner {
    pub fn new(args: LaneRunnerArgs) -> Self {
        let lane_dir = args.run_root.join("lanes").join(&args.lane_name);
        let store = StateStore::new(&lane_dir);
        let git = GitPipelineCoordinator::new();
        let cb_config = CircuitBreakerConfig {
            failure_threshold: args.config.agent.circuit_failure_threshold,
            success_threshold: args.config.agent.circuit_success_threshold,
            timeout: Duration::from_secs(args.config.agent.circuit_timeout_secs),
            call_timeout: Duration::from_secs(args.config.agent.send_prompt_timeout_secs + 30),
        };
        let agent = AgentSupervisor::new(args.agent_binary.clone(), cb_config).with_retry_policy(
            args.config.agent.max_retries,
            Duration::from_secs(args.config.agent.retry_base_secs),
            Duration::from_secs(args.config.agent.retry_cap_secs),
            Duration::from_secs(args.config.agent.rate_limit_backoff_secs),
        );
        let intervention = InterventionBus::new(&lane_dir);
        Self {
            args,
            lane_dir,
            store,
            git,
            agent,
            intervention,
            stall: Arc::new(Mutex::new(LaneStallState::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            recovery_exhausted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a shutdown flag with the caller's signal handler (`cursorflow
    /// run-lane` installs one for SIGTERM/SIGINT, per spec §4.5's
    /// cancellation semantics). The loop checks it between tasks and exits
    /// with [`EXIT_FAILURE`] after persisting an `aborted` state.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Spawn a background task that ticks `analyze()` on the shared stall
    /// state every `stall.tick()` while a prompt call is in flight, writing
    /// intervention requests and killing the in-flight agent child as the
    /// ladder escalates (spec §4.6 action execution: write file, update
    /// phase/counters, then SIGTERM/SIGKILL the child so the blocked
    /// `send_prompt` call unblocks and the caller can retry with the
    /// consumed intervention message prepended).
    fn spawn_stall_ticker(&self, pid_slot: Arc<Mutex<Option<u32>>>) -> StallTicker {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let hit_abort = Arc::new(AtomicBool::new(false));
        let intervention_fired = Arc::new(AtomicBool::new(false));
        let state = self.stall.clone();
        let lane_dir = self.lane_dir.clone();
        let lane_name = self.args.lane_name.clone();
        let stall_config = self.args.config.stall.clone();
        let tick = stall_config.tick().max(Duration::from_millis(1));

        let stop_flag_task = stop_flag.clone();
        let hit_abort_task = hit_abort.clone();
        let intervention_fired_task = intervention_fired.clone();
        let handle = tokio::spawn(async move {
            let bus = InterventionBus::new(&lane_dir);
            let pid_store = StateStore::new(&lane_dir);
            let mut last_synced_pid: Option<u32> = None;
            while !stop_flag_task.load(Ordering::Relaxed) {
                tokio::time::sleep(tick).await;

                let current_pid = *pid_slot.lock().unwrap();
                if current_pid != last_synced_pid {
                    last_synced_pid = current_pid;
                    let _ = pid_store.update_atomic(|s| s.pid = current_pid);
                }

                let action = state.lock().map(|mut s| s.analyze(&stall_config)).unwrap_or(StallAction::None);
                match action {
                    StallAction::None => {}
                    StallAction::SendContinue => {
                        let _ = bus.write_request(&InterventionBus::continue_request(
                            "No progress observed recently. Please continue the current task.",
                            InterventionSource::StallDetector,
                        ));
                        intervention_fired_task.store(true, Ordering::Relaxed);
                        if let Some(pid) = *pid_slot.lock().unwrap() {
                            InterventionBus::kill_agent(pid, true).await;
                        }
                    }
                    StallAction::SendStrongerPrompt => {
                        let _ = bus.write_request(&InterventionBus::stronger_prompt_request(
                            "This task appears stalled. Report any blocker explicitly or make concrete progress now.",
                            InterventionSource::StallDetector,
                        ));
                        intervention_fired_task.store(true, Ordering::Relaxed);
                        if let Some(pid) = *pid_slot.lock().unwrap() {
                            InterventionBus::kill_agent(pid, true).await;
                        }
                    }
                    StallAction::RequestRestart => {
                        let _ = bus.write_request(&InterventionBus::restart_request(
                            "Restarting the agent session after prolonged inactivity.",
                            InterventionSource::StallDetector,
                        ));
                        intervention_fired_task.store(true, Ordering::Relaxed);
                        if let Some(pid) = *pid_slot.lock().unwrap() {
                            InterventionBus::kill_agent(pid, false).await;
                        }
                    }
                    StallAction::RunDoctor => {
                        let diagnosis = serde_json::json!({
                            "lane": lane_name,
                            "reason": "stall recovery ladder exhausted",
                        });
                        let _ = write_diagnostic(&lane_dir, &diagnosis);
                        hit_abort_task.store(true, Ordering::Relaxed);
                    }
                    StallAction::AbortLane => {
                        hit_abort_task.store(true, Ordering::Relaxed);
                    }
                }
            }
        });

        StallTicker { stop_flag, hit_abort, intervention_fired, handle }
    }

    fn load_lane_spec(&self) -> Result<LaneSpec> {
        let text = fs::read_to_string(&self.args.tasks_file)?;
        let lane: LaneSpec = serde_json::from_str(&text)
            .map_err(|e| LaneRunnerError::InvalidTask(e.to_string()))?;
        if lane.tasks.is_empty() {
            return Err(LaneRunnerError::EmptyTaskList);
        }
        for task in &lane.tasks {
            if task.name.trim().is_empty() || task.prompt.trim().is_empty() {
                return Err(LaneRunnerError::InvalidTask(task.name.clone()));
            }
        }
        Ok(lane)
    }

    fn worktree_dir(&self, pipeline_branch: &str) -> PathBuf {
        let flattened = cf_core::git_pipeline::sanitize_ref_component(pipeline_branch).replace('/', "-");
        self.args.repo_root.join("_cursorflow").join("worktrees").join(flattened)
    }

    /// Run the lane to completion (or failure/block), returning the exit
    /// code the process should exit with.
    pub async fn run(&mut self) -> i32 {
        match self.run_inner().await {
            Ok(code) => code,
            Err(LaneRunnerError::BlockedDependency) => EXIT_BLOCKED,
            Err(e) => {
                warn!(lane = %self.args.lane_name, error = %e, "lane failed");
                let _ = self.store.update_atomic(|s| s.mark_failed(e.to_string()));
                if self.recovery_exhausted.load(Ordering::Relaxed) {
                    self.write_pof(&e.to_string());
                }
                EXIT_FAILURE
            }
        }
    }

    async fn run_inner(&mut self) -> Result<i32> {
        let mut lane = self.load_lane_spec()?;

        if self.args.start_index == 0 {
            self.preflight()?;
        }

        let base_branch = cf_core::git_read::current_branch(&self.args.repo_root)
            .unwrap_or_else(|_| "main".to_string());
        info!(lane = %lane.name, base_branch, "base branch resolved from current branch, config.baseBranch ignored per design");

        let mut state = self.load_or_init_state(&lane)?;
        let pipeline_branch = state.pipeline_branch.clone().unwrap_or_else(|| {
            cf_core::git_pipeline::generate_pipeline_branch(lane.branch_prefix())
        });
        let worktree_dir = self.worktree_dir(&pipeline_branch);

        self.git.ensure_worktree(&worktree_dir, &pipeline_branch, &self.args.repo_root, &base_branch)?;

        state.pipeline_branch = Some(pipeline_branch.clone());
        state.worktree_dir = Some(worktree_dir.clone());

        if state.chat_id.is_none() {
            let chat_id = self.agent.create_chat(&worktree_dir).await?;
            state.chat_id = Some(chat_id);
        }
        state.mark_running();
        self.store.save_with_lock(&state)?;

        let mut current_index = self.args.start_index.max(state.current_task_index);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                warn!(lane = %self.args.lane_name, "shutdown requested, aborting lane between tasks");
                state.mark_aborted();
                self.store.save_with_lock(&state)?;
                return Ok(EXIT_FAILURE);
            }

            lane = self.load_lane_spec()?;
            if current_index >= lane.tasks.len() {
                break;
            }
            if lane.tasks.len() != state.total_tasks {
                state.total_tasks = lane.tasks.len();
                self.store.save_with_lock(&state)?;
            }

            let task = lane.tasks[current_index].clone();
            self.stall.lock().unwrap().record_task_start();

            let intervention_prefix = self.intervention.consume_request()?.map(|req| req.message);

            if !task.depends_on.is_empty() {
                state.status = LaneStatus::Waiting;
                state.waiting_for = task.depends_on.clone();
                self.store.save_with_lock(&state)?;
                self.wait_for_dependencies(&task, &self.args.run_root).await?;
                state.status = LaneStatus::Running;
                state.waiting_for.clear();
                self.store.save_with_lock(&state)?;

                let dep_branches = self.dependency_pipeline_branches(&task.depends_on, &self.args.run_root)?;
                if let Err(e) = self.git.merge_dependency_branches(&worktree_dir, &dep_branches) {
                    warn!(task = %task.name, "merge.conflict_detected");
                    return Err(LaneRunnerError::Git(e));
                }
            }

            self.checkpoint(&state, &worktree_dir)?;

            self.git.ensure_worktree(&worktree_dir, &pipeline_branch, &self.args.repo_root, &base_branch)?;
            let task_branch = task_branch_name(&pipeline_branch, current_index, &task.name);
            self.fork_task_branch(&worktree_dir, &task_branch, &pipeline_branch)?;

            apply_dependency_permissions(&worktree_dir, &lane.dependency_policy)?;

            let predecessor_results = self.load_predecessor_results(current_index, &lane)?;

            // A send-prompt attempt that the stall ticker interrupted (it killed
            // the agent child to force a continue/stronger-prompt/restart) is
            // retried with the freshly-consumed intervention message prepended,
            // per spec §4.6: "LaneRunner observes the child exit, re-enters its
            // task loop at the current index, reads and consumes
            // pending-intervention.json, and prepends its message to the next
            // prompt." A genuine agent failure (no intervention involved) still
            // propagates immediately.
            let mut current_intervention = intervention_prefix;
            let mut attempts = 0u32;
            let outcome = loop {
                attempts += 1;
                let prompt = wrap_prompt(
                    &worktree_dir,
                    &task_branch,
                    &lane.dependency_policy,
                    &predecessor_results,
                    &task.prompt,
                    current_intervention.as_deref(),
                );

                self.store.append_conversation(&ConversationEntry::new(
                    ConversationRole::User,
                    task.name.clone(),
                    prompt.clone(),
                    task.model.clone().or_else(|| lane.model.clone()),
                ))?;

                let sink = TerminalLogSink::new(self.lane_dir.join("terminal.log"));
                let stall_sink = StallTrackingSink { state: self.stall.clone() };
                let pid_slot = Arc::new(Mutex::new(None));
                let send_args = SendPromptArgs {
                    workspace_dir: worktree_dir.clone(),
                    chat_id: state.chat_id.clone().unwrap_or_default(),
                    prompt,
                    model: task.model.clone().or_else(|| lane.model.clone()),
                    timeout: Duration::from_secs(
                        task.timeout.or(lane.timeout).unwrap_or(self.args.config.agent.send_prompt_timeout_secs),
                    ),
                    task_name: task.name.clone(),
                    output_format: "json".to_string(),
                    signal_dir: self.lane_dir.clone(),
                    pid_slot: pid_slot.clone(),
                };

                let ticker = self.spawn_stall_ticker(pid_slot);
                let attempt_outcome = self.agent.send_prompt(&send_args, &[&sink, &stall_sink]).await;
                let (ladder_hit_abort, intervention_fired) = ticker.stop();
                let _ = self.store.update_atomic(|s| s.pid = None);

                if ladder_hit_abort {
                    warn!(task = %task.name, "stall ladder exhausted during this task; recovery ladder state recorded in diagnostic.json");
                    self.recovery_exhausted.store(true, Ordering::Relaxed);
                    break attempt_outcome;
                }

                match attempt_outcome {
                    Ok(o) => break Ok(o),
                    Err(e) if intervention_fired && attempts <= MAX_INTERVENTION_RETRIES => {
                        warn!(task = %task.name, error = %e, attempts, "agent call interrupted by stall intervention, retrying with updated prompt");
                        current_intervention = self
                            .intervention
                            .consume_request()?
                            .map(|req| req.message)
                            .or(current_intervention);
                        continue;
                    }
                    Err(e) => break Err(e),
                }
            };
            let outcome = outcome?;
            self.stall.lock().unwrap().record_activity(outcome.bytes_received, &outcome.result_text);

            self.store.append_conversation(&ConversationEntry::new(
                ConversationRole::Assistant,
                task.name.clone(),
                outcome.result_text.clone(),
                task.model.clone(),
            ))?;

            if !outcome.ok {
                return Err(LaneRunnerError::Agent(cf_agent::supervisor::AgentError::Classified {
                    class: cf_agent::classify::ErrorClass::Unknown,
                    message: outcome.error.clone().unwrap_or_else(|| "agent reported failure".to_string()),
                }));
            }

            if let Some(dep_request) = self.detect_dependency_request(&worktree_dir, &outcome.result_text)? {
                if !lane.dependency_policy.allow_dependency_change {
                    state.dependency_request = Some(dep_request);
                    state.mark_failed("blocked on dependency change");
                    self.store.save_with_lock(&state)?;
                    return Err(LaneRunnerError::BlockedDependency);
                }
            }

            self.push_task_branch(&worktree_dir, &task_branch)?;
            let results_path = self.lane_dir.join("task-results");
            fs::create_dir_all(&results_path)?;
            fs::write(
                results_path.join(format!("{:02}-{}.txt", current_index + 1, task.name)),
                &outcome.result_text,
            )?;

            let merge_result = self.git.merge_task_into_pipeline(&worktree_dir, &task.name, &task_branch, &pipeline_branch)?;
            if let cf_core::git_pipeline::MergeResult::Conflict(files) = merge_result {
                return Err(LaneRunnerError::MergeConflict(files));
            }

            if current_index > 0 {
                let prev_task = &lane.tasks[current_index - 1];
                let prev_branch = task_branch_name(&pipeline_branch, current_index - 1, &prev_task.name);
                self.delete_branch(&worktree_dir, &prev_branch);
            }

            state.complete_task(&task.name);
            self.store.save_with_lock(&state)?;
            self.stall.lock().unwrap().record_state_update();
            current_index += 1;
        }

        if !lane.tasks.is_empty() {
            let last = lane.tasks.len() - 1;
            let last_branch = task_branch_name(&pipeline_branch, last, &lane.tasks[last].name);
            self.delete_branch(&worktree_dir, &last_branch);
        }

        let flow_branch = lane.name.clone();
        let final_branch = self.git.finalize_flow_branch(&worktree_dir, &flow_branch, &pipeline_branch)?;
        info!(lane = %lane.name, final_branch, "flow branch finalized");

        state.mark_completed();
        self.store.save_with_lock(&state)?;
        Ok(EXIT_SUCCESS)
    }

    fn preflight(&self) -> Result<()> {
        if which(&self.args.agent_binary).is_none() {
            return Err(LaneRunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("agent CLI '{}' not found on PATH", self.args.agent_binary),
            )));
        }
        Ok(())
    }

    fn load_or_init_state(&self, lane: &LaneSpec) -> Result<LaneState> {
        if self.store.state_path().exists() {
            let mut state = self.store.load()?;
            if self.needs_repair(&state) {
                state = self.repair(state);
            }
            Ok(state)
        } else {
            Ok(LaneState::new(lane.tasks.len()))
        }
    }

    fn needs_repair(&self, state: &LaneState) -> bool {
        state.is_stale(chrono::Utc::now()) || self.has_leftover_tmp_siblings()
    }

    fn has_leftover_tmp_siblings(&self) -> bool {
        let Ok(entries) = fs::read_dir(&self.lane_dir) else { return false };
        entries
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".tmp."))
    }

    fn repair(&self, mut state: LaneState) -> LaneState {
        warn!(lane = %self.args.lane_name, "state looks stale, attempting repair");
        if let Some(wt) = &state.worktree_dir {
            if !wt.exists() {
                state.worktree_dir = None;
                state.pipeline_branch = None;
            }
        }
        state.status = LaneStatus::Recovering;
        state
    }

    fn checkpoint(&self, state: &LaneState, worktree_dir: &Path) -> Result<()> {
        let checkpoints_dir = self.lane_dir.join("checkpoints");
        fs::create_dir_all(&checkpoints_dir)?;
        let head = cf_core::git_read::current_branch(worktree_dir).unwrap_or_default();
        let stamp = chrono::Utc::now().timestamp_millis();
        let entry_dir = checkpoints_dir.join(format!("{stamp}"));
        fs::create_dir_all(&entry_dir)?;
        fs::write(entry_dir.join("HEAD"), head)?;
        fs::write(entry_dir.join("state.json"), serde_json::to_vec_pretty(state)?)?;

        let mut checkpoints: Vec<_> = fs::read_dir(&checkpoints_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        checkpoints.sort();
        while checkpoints.len() > 5 {
            let oldest = checkpoints.remove(0);
            let _ = fs::remove_dir_all(oldest);
        }
        Ok(())
    }

    /// Write `<runRoot>/pof/pof-<runId>.json`: a post-mortem-of-failure
    /// summary for a lane that exhausted the stall recovery ladder (spec
    /// §4.6). Atomic temp+rename, same as every other state write in this
    /// crate. A prior POF for this run, if any, is nested under
    /// `previousFailures` rather than overwritten.
    fn write_pof(&self, error: &str) {
        let run_id = self
            .args
            .run_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown-run".to_string());
        let pof_dir = self.args.run_root.join("pof");
        if let Err(e) = fs::create_dir_all(&pof_dir) {
            warn!(lane = %self.args.lane_name, error = %e, "failed to create pof directory");
            return;
        }
        let pof_path = pof_dir.join(format!("pof-{run_id}.json"));

        let previous = fs::read_to_string(&pof_path).ok().and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok());
        let restart_count = self.stall.lock().map(|s| s.restart_count).unwrap_or(0);
        let root_cause = cf_agent::classify::classify_error_text(error);

        let mut pof = serde_json::json!({
            "runId": run_id,
            "lane": self.args.lane_name,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "rootCause": format!("{root_cause:?}"),
            "symptoms": error,
            "recoveryAttempts": {
                "restarts": restart_count,
            },
            "suggestedResumeCommand": format!("cursorflow resume {run_id} --lane {} --restart", self.args.lane_name),
        });
        if let Some(prev) = previous {
            pof["previousFailures"] = serde_json::Value::Array(vec![prev]);
        }

        let tmp_path = pof_path.with_extension(format!("tmp.{}", std::process::id()));
        let bytes = match serde_json::to_vec_pretty(&pof) {
            Ok(b) => b,
            Err(e) => {
                warn!(lane = %self.args.lane_name, error = %e, "failed to serialize pof");
                return;
            }
        };
        if let Err(e) = fs::write(&tmp_path, bytes).and_then(|_| fs::rename(&tmp_path, &pof_path)) {
            warn!(lane = %self.args.lane_name, error = %e, "failed to write pof");
        }
    }

    fn fork_task_branch(&self, worktree_dir: &Path, task_branch: &str, pipeline_branch: &str) -> Result<()> {
        let runner = RealGit;
        // The pipeline branch has no remote counterpart yet on a lane's first task
        // (it's only pushed by `merge_task_into_pipeline`, after this fork runs), so
        // `fetch` exiting 128 here is expected, not fatal — same as the ff-merge below.
        let _ = runner.run(worktree_dir, &["fetch", "origin", pipeline_branch]);
        let _ = runner.run(worktree_dir, &["merge", "--ff-only", &format!("origin/{pipeline_branch}")]);
        runner.run(worktree_dir, &["checkout", "-B", task_branch, pipeline_branch])?;
        Ok(())
    }

    fn push_task_branch(&self, worktree_dir: &Path, task_branch: &str) -> Result<()> {
        RealGit.run(worktree_dir, &["push", "--set-upstream", "origin", task_branch])?;
        Ok(())
    }

    fn delete_branch(&self, worktree_dir: &Path, branch: &str) {
        let _ = RealGit.run(worktree_dir, &["branch", "-D", branch]);
    }

    fn dependency_pipeline_branches(&self, deps: &[String], run_root: &Path) -> Result<Vec<String>> {
        let mut lanes_seen = std::collections::HashSet::new();
        let mut branches = Vec::new();
        for dep in deps {
            let (lane_name, _task_name) = split_dep_id(dep);
            if lanes_seen.insert(lane_name.to_string()) {
                let dep_store = StateStore::new(run_root.join("lanes").join(lane_name));
                let dep_state = dep_store.load()?;
                if let Some(branch) = dep_state.pipeline_branch {
                    branches.push(branch);
                }
            }
        }
        Ok(branches)
    }

    async fn wait_for_dependencies(&self, task: &TaskSpec, run_root: &Path) -> Result<()> {
        let timeout = Duration::from_secs(30 * 60);
        let poll = Duration::from_secs(self.args.config.runner.dependency_poll_secs.max(1));
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut lane_states = HashMap::new();
            for dep in &task.depends_on {
                let (lane_name, _) = split_dep_id(dep);
                if !lane_states.contains_key(lane_name) {
                    let store = StateStore::new(run_root.join("lanes").join(lane_name));
                    if let Ok(state) = store.load() {
                        lane_states.insert(lane_name.to_string(), state);
                    }
                }
            }

            match dependency_wait_status(&task.depends_on, &lane_states) {
                DependencyWaitStatus::Ready => return Ok(()),
                DependencyWaitStatus::Failed(lane) => return Err(LaneRunnerError::DependencyFailed(lane)),
                DependencyWaitStatus::StillWaiting(remaining) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(LaneRunnerError::DependencyTimeout(remaining));
                    }
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    fn load_predecessor_results(&self, current_index: usize, lane: &LaneSpec) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for i in 0..current_index {
            let task = &lane.tasks[i];
            let path = self.lane_dir.join("task-results").join(format!("{:02}-{}.txt", i + 1, task.name));
            if path.exists() {
                out.push((task.name.clone(), fs::read_to_string(path)?));
            }
        }
        Ok(out)
    }

    fn detect_dependency_request(&self, worktree_dir: &Path, result_text: &str) -> Result<Option<cf_core::types::DependencyRequest>> {
        if let Some(req) = extract_dependency_request(result_text) {
            return Ok(Some(req));
        }
        let path = worktree_dir.join("_cursorflow").join("dependency-request.json");
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            let req: cf_core::types::DependencyRequest = serde_json::from_str(&text)
                .map_err(|e| LaneRunnerError::InvalidTask(e.to_string()))?;
            return Ok(Some(req));
        }
        Ok(None)
    }
}

fn split_dep_id(dep: &str) -> (&str, &str) {
    dep.split_once(':').unwrap_or((dep, ""))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyWaitStatus {
    Ready,
    StillWaiting(Vec<String>),
    Failed(String),
}

/// Pure decision function for §4.2 step 3: ready once every `"lane:task"`
/// id appears in that lane's `completedTasks`, failed if any dependency
/// lane has already failed, otherwise still waiting.
pub fn dependency_wait_status(
    dep_ids: &[String],
    lane_states: &HashMap<String, LaneState>,
) -> DependencyWaitStatus {
    let mut remaining = Vec::new();
    for dep in dep_ids {
        let (lane_name, task_name) = split_dep_id(dep);
        match lane_states.get(lane_name) {
            Some(state) if state.status == LaneStatus::Failed => {
                return DependencyWaitStatus::Failed(lane_name.to_string());
            }
            Some(state) if state.completed_tasks.iter().any(|t| t == task_name) => {}
            _ => remaining.push(dep.clone()),
        }
    }
    if remaining.is_empty() {
        DependencyWaitStatus::Ready
    } else {
        DependencyWaitStatus::StillWaiting(remaining)
    }
}

/// `<pipelineBranch>--NN-<taskName>`, zero-padded 1-based index (spec §3).
pub fn task_branch_name(pipeline_branch: &str, index: usize, task_name: &str) -> String {
    format!("{pipeline_branch}--{:02}-{}", index + 1, task_name)
}

/// Prepend the standardized envelope (worktree path, branch, dependency
/// policy, predecessor results, completion instructions) to a task prompt,
/// per spec §4.2 step 8. An intervention message, if any, is prepended
/// ahead of everything else, separated by the spec's literal separator.
pub fn wrap_prompt(
    worktree: &Path,
    branch: &str,
    policy: &DependencyPolicy,
    predecessor_results: &[(String, String)],
    prompt: &str,
    intervention_prefix: Option<&str>,
) -> String {
    let mut envelope = String::new();
    envelope.push_str(&format!("Worktree: {}\n", worktree.display()));
    envelope.push_str(&format!("Branch: {branch}\n"));
    envelope.push_str(&format!(
        "Dependency policy: allow_dependency_change={}, lockfile_read_only={}\n",
        policy.allow_dependency_change, policy.lockfile_read_only
    ));
    if !predecessor_results.is_empty() {
        envelope.push_str("Predecessor task results:\n");
        for (name, result) in predecessor_results {
            envelope.push_str(&format!("- {name}: {result}\n"));
        }
    }
    envelope.push_str("\nWhen finished: commit your changes, push the current branch, and summarize what you did.\n\n");
    envelope.push_str(prompt);

    match intervention_prefix {
        Some(msg) => format!("{msg}\n\n---\n\n{envelope}"),
        None => envelope,
    }
}

/// Remove write bits from `package.json` (when dependency changes are
/// forbidden) and from common lockfiles (when `lockfile_read_only`),
/// per spec §4.2 step 7.
pub fn apply_dependency_permissions(worktree_dir: &Path, policy: &DependencyPolicy) -> std::io::Result<()> {
    if !policy.allow_dependency_change {
        make_read_only(&worktree_dir.join("package.json"));
    }
    if policy.lockfile_read_only {
        for lockfile in ["package-lock.json", "yarn.lock", "pnpm-lock.yaml", "Cargo.lock"] {
            make_read_only(&worktree_dir.join(lockfile));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_read_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        let mode = perms.mode() & !0o222;
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn make_read_only(_path: &Path) {}

fn which(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(binary)).find(|p| p.exists())
}

struct RealGit;

impl RealGit {
    fn run(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let out = std::process::Command::new("git").args(args).current_dir(dir).output()?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(LaneRunnerError::Git(cf_core::git_pipeline::GitPipelineError::Command(
                String::from_utf8_lossy(&out.stderr).to_string(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::LaneStatus;

    fn state_with(status: LaneStatus, completed: &[&str]) -> LaneState {
        let mut s = LaneState::new(completed.len() + 1);
        s.status = status;
        s.completed_tasks = completed.iter().map(|s| s.to_string()).collect();
        s
    }

    #[test]
    fn dependency_wait_ready_when_completed() {
        let mut states = HashMap::new();
        states.insert("x".to_string(), state_with(LaneStatus::Running, &["x1"]));
        let status = dependency_wait_status(&["x:x1".to_string()], &states);
        assert_eq!(status, DependencyWaitStatus::Ready);
    }

    #[test]
    fn dependency_wait_still_waiting_when_not_completed() {
        let mut states = HashMap::new();
        states.insert("x".to_string(), state_with(LaneStatus::Running, &[]));
        let status = dependency_wait_status(&["x:x1".to_string()], &states);
        assert_eq!(status, DependencyWaitStatus::StillWaiting(vec!["x:x1".to_string()]));
    }

    #[test]
    fn dependency_wait_fails_when_dep_lane_failed() {
        let mut states = HashMap::new();
        states.insert("x".to_string(), state_with(LaneStatus::Failed, &[]));
        let status = dependency_wait_status(&["x:x1".to_string()], &states);
        assert_eq!(status, DependencyWaitStatus::Failed("x".to_string()));
    }

    #[test]
    fn dependency_wait_missing_lane_state_is_still_waiting() {
        let states = HashMap::new();
        let status = dependency_wait_status(&["x:x1".to_string()], &states);
        assert_eq!(status, DependencyWaitStatus::StillWaiting(vec!["x:x1".to_string()]));
    }

    #[test]
    fn task_branch_name_is_zero_padded_one_based() {
        assert_eq!(task_branch_name("cursorflow/abc", 0, "build"), "cursorflow/abc--01-build");
        assert_eq!(task_branch_name("cursorflow/abc", 9, "ship"), "cursorflow/abc--10-ship");
    }

    fn test_runner(run_root: &Path) -> LaneRunner {
        LaneRunner::new(LaneRunnerArgs {
            repo_root: run_root.to_path_buf(),
            run_root: run_root.to_path_buf(),
            tasks_file: run_root.join("tasks.json"),
            lane_name: "alpha".to_string(),
            agent_binary: "cursor-agent".to_string(),
            config: CursorFlowConfig::default(),
            start_index: 0,
        })
    }

    #[test]
    fn write_pof_creates_file_with_root_cause_and_resume_hint() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path().join("run-20260101000000");
        std::fs::create_dir_all(&run_root).unwrap();
        let runner = test_runner(&run_root);

        runner.write_pof("agent reported rate limit exceeded");

        let pof_path = run_root.join("pof").join("pof-run-20260101000000.json");
        let contents = std::fs::read_to_string(&pof_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["lane"], "alpha");
        assert_eq!(parsed["rootCause"], "RateLimit");
        assert!(parsed["suggestedResumeCommand"].as_str().unwrap().contains("cursorflow resume"));
        assert!(parsed.get("previousFailures").is_none());
    }

    #[test]
    fn write_pof_nests_previous_failure() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path().join("run-20260101000000");
        std::fs::create_dir_all(&run_root).unwrap();
        let runner = test_runner(&run_root);

        runner.write_pof("first failure: merge conflict detected");
        runner.write_pof("second failure: unauthorized, please log in");

        let pof_path = run_root.join("pof").join("pof-run-20260101000000.json");
        let contents = std::fs::read_to_string(&pof_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["rootCause"], "AgentAuth");
        let previous = parsed["previousFailures"].as_array().expect("previous failures nested");
        assert_eq!(previous.len(), 1);
        assert_eq!(previous[0]["rootCause"], "Merge");
    }

    #[test]
    fn wrap_prompt_includes_envelope_and_prompt() {
        let policy = DependencyPolicy { allow_dependency_change: false, lockfile_read_only: true };
        let wrapped = wrap_prompt(Path::new("/wt"), "branch", &policy, &[], "do the thing", None);
        assert!(wrapped.contains("/wt"));
        assert!(wrapped.contains("allow_dependency_change=false"));
        assert!(wrapped.ends_with("do the thing"));
    }

    #[test]
    fn wrap_prompt_prepends_intervention_with_separator() {
        let policy = DependencyPolicy::default();
        let wrapped = wrap_prompt(Path::new("/wt"), "branch", &policy, &[], "continue task", Some("keep going"));
        assert!(wrapped.starts_with("keep going\n\n---\n\n"));
    }

    #[test]
    fn split_dep_id_parses_lane_and_task() {
        assert_eq!(split_dep_id("lane:task"), ("lane", "task"));
    }
}
