//! Stall detection: per-lane activity/state tracking and the four-step
//! recovery ladder (continue → stronger prompt → restart → diagnose),
//! per spec §4.6.
//!
//! Grounded on
//! `examples/other_examples/07c675c8_groblegark-oddjobs__crates-engine-src-runtime-monitor.rs.rs`'s
//! `MonitorState`-driven action dispatch (idle/prompt/dead escalation with
//! attempt tracking) and `at-agents/src/task_orchestrator.rs`'s bounded
//! iteration-budget loop (`max_fix_iterations`, mirrored here as
//! `max_restarts`). One `LaneStallState` per lane — spec §9 calls for the
//! old global `StallDetectionService` singleton to become an explicit,
//! per-lane context instead.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cf_core::config::StallConfig;
use cf_core::types::LaneStatus;

/// Phrases that mark agent output as belonging to a long-running tool
/// invocation (package install, build, network fetch) whose silence is
/// expected rather than stalled.
const LONG_OP_PATTERNS: &[&str] = &[
    "installing", "npm", "pnpm", "yarn", "building", "compiling", "downloading", "fetching",
    "cloning", "bundling",
];

/// The current step on the recovery ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StallPhase {
    Normal = 0,
    ContinueSent,
    StrongerPromptSent,
    RestartRequested,
    Diagnosed,
    Aborted,
}

/// What the caller (the lane runner's stall-watch ticker) should do this
/// tick. `None` means nothing changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallAction {
    None,
    SendContinue,
    SendStrongerPrompt,
    RequestRestart,
    RunDoctor,
    AbortLane,
}

/// Per-lane stall-tracking state. One instance lives inside the lane
/// runner's stall-watch ticker for the lifetime of the lane.
#[derive(Debug, Clone)]
pub struct LaneStallState {
    pub phase: StallPhase,
    pub last_real_activity_time: DateTime<Utc>,
    pub last_state_update_time: DateTime<Utc>,
    pub last_phase_change_time: DateTime<Utc>,
    pub task_start_time: DateTime<Utc>,
    pub total_bytes_received: u64,
    bytes_at_last_check: u64,
    pub restart_count: u32,
    pub continue_signal_count: u32,
    pub is_long_operation: bool,
    pub last_output: String,
    pub intervention_enabled: bool,
    pub lane_status: LaneStatus,
}

impl LaneStallState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            phase: StallPhase::Normal,
            last_real_activity_time: now,
            last_state_update_time: now,
            last_phase_change_time: now,
            task_start_time: now,
            total_bytes_received: 0,
            bytes_at_last_check: 0,
            restart_count: 0,
            continue_signal_count: 0,
            is_long_operation: false,
            last_output: String::new(),
            intervention_enabled: true,
            lane_status: LaneStatus::Running,
        }
    }

    /// Record a chunk of agent stdout/stderr. A `bytes == 0` heartbeat only
    /// updates `last_output`/`is_long_operation`; timers never move on a
    /// heartbeat, per spec §4.6's critical recording rule.
    pub fn record_activity(&mut self, bytes: usize, output: &str) {
        if !output.is_empty() {
            self.last_output = output.to_string();
            let lower = output.to_lowercase();
            self.is_long_operation = LONG_OP_PATTERNS.iter().any(|p| lower.contains(p));
        }
        if bytes == 0 {
            return;
        }
        self.total_bytes_received += bytes as u64;
        self.last_real_activity_time = Utc::now();
        if self.phase <= StallPhase::StrongerPromptSent {
            self.set_phase(StallPhase::Normal);
        }
    }

    pub fn record_state_update(&mut self) {
        self.last_state_update_time = Utc::now();
    }

    /// Reset all timers and the ladder at the start of a new task.
    pub fn record_task_start(&mut self) {
        let now = Utc::now();
        self.task_start_time = now;
        self.last_real_activity_time = now;
        self.last_state_update_time = now;
        self.last_phase_change_time = now;
        self.bytes_at_last_check = self.total_bytes_received;
        self.phase = StallPhase::Normal;
    }

    fn set_phase(&mut self, phase: StallPhase) {
        self.phase = phase;
        self.last_phase_change_time = Utc::now();
    }

    fn effective_idle_timeout(&self, config: &StallConfig) -> Duration {
        if self.is_long_operation {
            config.long_op_grace().min(config.idle_timeout() * 2)
        } else {
            config.idle_timeout()
        }
    }

    /// Run one 10s analysis tick. Mutates `phase`/counters as the ladder
    /// advances and returns the action the caller must execute.
    pub fn analyze(&mut self, config: &StallConfig) -> StallAction {
        if self.lane_status == LaneStatus::Waiting {
            return StallAction::None;
        }

        let now = Utc::now();

        let task_elapsed = now.signed_duration_since(self.task_start_time);
        if task_elapsed > chrono_duration(config.task_timeout()) {
            return if self.restart_count < config.max_restarts {
                self.restart_count += 1;
                self.set_phase(StallPhase::RestartRequested);
                StallAction::RequestRestart
            } else {
                self.set_phase(StallPhase::Diagnosed);
                StallAction::RunDoctor
            };
        }

        let bytes_delta = self.total_bytes_received - self.bytes_at_last_check;
        self.bytes_at_last_check = self.total_bytes_received;

        let idle = now.signed_duration_since(self.last_real_activity_time);
        let progress = now.signed_duration_since(self.last_state_update_time);
        let effective_idle = chrono_duration(self.effective_idle_timeout(config));

        let idle_stalled = bytes_delta == 0 && idle > effective_idle;
        let no_progress = progress > chrono_duration(config.progress_timeout());

        if self.phase == StallPhase::Normal {
            if !(idle_stalled || no_progress) {
                return StallAction::None;
            }
            if !self.intervention_enabled {
                return StallAction::None;
            }
            self.continue_signal_count += 1;
            self.set_phase(StallPhase::ContinueSent);
            return StallAction::SendContinue;
        }

        self.apply_ladder(config, now)
    }

    fn apply_ladder(&mut self, config: &StallConfig, now: DateTime<Utc>) -> StallAction {
        let time_since_phase = now.signed_duration_since(self.last_phase_change_time);
        let idle = now.signed_duration_since(self.last_real_activity_time);

        match self.phase {
            StallPhase::Normal => StallAction::None,
            StallPhase::ContinueSent => {
                if time_since_phase > chrono_duration(config.continue_grace()) {
                    if !self.intervention_enabled {
                        return StallAction::None;
                    }
                    self.set_phase(StallPhase::StrongerPromptSent);
                    StallAction::SendStrongerPrompt
                } else {
                    StallAction::None
                }
            }
            StallPhase::StrongerPromptSent => {
                if time_since_phase > chrono_duration(config.stronger_prompt_grace()) {
                    if self.restart_count < config.max_restarts {
                        self.restart_count += 1;
                        self.set_phase(StallPhase::RestartRequested);
                        StallAction::RequestRestart
                    } else {
                        self.set_phase(StallPhase::Diagnosed);
                        StallAction::RunDoctor
                    }
                } else {
                    StallAction::None
                }
            }
            StallPhase::RestartRequested => {
                let threshold = self.effective_idle_timeout(config).mul_f64(0.75);
                if idle > chrono_duration(threshold) {
                    if self.restart_count < config.max_restarts {
                        self.continue_signal_count += 1;
                        self.set_phase(StallPhase::ContinueSent);
                        StallAction::SendContinue
                    } else {
                        self.set_phase(StallPhase::Diagnosed);
                        StallAction::RunDoctor
                    }
                } else {
                    StallAction::None
                }
            }
            StallPhase::Diagnosed | StallPhase::Aborted => {
                self.set_phase(StallPhase::Aborted);
                StallAction::AbortLane
            }
        }
    }
}

impl Default for LaneStallState {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}
