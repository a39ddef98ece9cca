//! Core data model shared by every CursorFlow component: lane/task specs,
//! persisted lane state, conversation log entries, and intervention
//! requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Lane / Task specs — loaded from the tasks directory, hot-reloaded per tick
// ---------------------------------------------------------------------------

/// Dependency-change permissions granted to a lane's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct DependencyPolicy {
    #[serde(default)]
    pub allow_dependency_change: bool,
    #[serde(default)]
    pub lockfile_read_only: bool,
}

/// A single unit of work sent to the agent as one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Per-task timeout override, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Task-level dependencies, addressed as `"<laneName>:<taskName>"`.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// An ordered list of tasks plus the dependency policy they run under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneSpec {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,
    #[serde(default)]
    pub branch_prefix: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Default per-task timeout for this lane, in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl LaneSpec {
    pub fn branch_prefix(&self) -> &str {
        self.branch_prefix.as_deref().unwrap_or("cursorflow/")
    }

    /// Find a task by name.
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

// ---------------------------------------------------------------------------
// LaneStatus — the lane lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Pending,
    Initializing,
    Running,
    Waiting,
    Paused,
    Recovering,
    Completed,
    Failed,
    Aborted,
}

impl LaneStatus {
    /// Whether this status can be directly followed by `next`.
    ///
    /// Recovery is allowed from almost any non-terminal state (a lane can be
    /// found mid-run after a crash in any of them); terminal states never
    /// transition further.
    pub fn can_transition_to(&self, next: LaneStatus) -> bool {
        use LaneStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Initializing) => true,
            (Initializing, Running) => true,
            (Initializing, Recovering) => true,
            (Running, Waiting) => true,
            (Waiting, Running) => true,
            (Running, Paused) => true,
            (Paused, Running) => true,
            (_, Recovering) => true,
            (Recovering, Running) => true,
            (Recovering, Waiting) => true,
            (Running, Completed) => true,
            (Running, Failed) => true,
            (Running, Aborted) => true,
            (Waiting, Failed) => true,
            (Waiting, Aborted) => true,
            (Initializing, Failed) => true,
            (Initializing, Aborted) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LaneStatus::Completed | LaneStatus::Failed | LaneStatus::Aborted)
    }
}

// ---------------------------------------------------------------------------
// DependencyRequest — agent-originated ask to change a dependency manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRequest {
    pub reason: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// LaneState — state.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneState {
    pub status: LaneStatus,
    pub current_task_index: usize,
    pub total_tasks: usize,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub pipeline_branch: Option<String>,
    #[serde(default)]
    pub worktree_dir: Option<PathBuf>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub waiting_for: Vec<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub dependency_request: Option<DependencyRequest>,
}

impl LaneState {
    pub fn new(total_tasks: usize) -> Self {
        let now = Utc::now();
        Self {
            status: LaneStatus::Pending,
            current_task_index: 0,
            total_tasks,
            completed_tasks: Vec::new(),
            pipeline_branch: None,
            worktree_dir: None,
            pid: None,
            chat_id: None,
            waiting_for: Vec::new(),
            start_time: None,
            end_time: None,
            updated_at: now,
            error: None,
            dependency_request: None,
        }
    }

    /// Invariants from spec §3/§8. Returns a list of violations, empty if
    /// valid.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.current_task_index > self.total_tasks {
            issues.push(format!(
                "current_task_index {} exceeds total_tasks {}",
                self.current_task_index, self.total_tasks
            ));
        }
        if self.completed_tasks.len() > self.total_tasks {
            issues.push("completed_tasks longer than total_tasks".to_string());
        }
        if self.status == LaneStatus::Completed {
            if self.current_task_index != self.total_tasks {
                issues.push("completed lane has current_task_index != total_tasks".to_string());
            }
            if self.end_time.is_none() {
                issues.push("completed lane missing end_time".to_string());
            }
        }
        if self.status == LaneStatus::Failed && self.error.is_none() {
            issues.push("failed lane missing error".to_string());
        }
        issues
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_running(&mut self) {
        self.status = LaneStatus::Running;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = LaneStatus::Completed;
        self.end_time = Some(Utc::now());
        self.touch();
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = LaneStatus::Failed;
        self.error = Some(error.into());
        self.end_time = Some(Utc::now());
        self.touch();
    }

    pub fn mark_aborted(&mut self) {
        self.status = LaneStatus::Aborted;
        self.end_time = Some(Utc::now());
        self.touch();
    }

    pub fn complete_task(&mut self, name: &str) {
        self.completed_tasks.push(name.to_string());
        self.current_task_index += 1;
        self.touch();
    }

    /// Staleness per §4.2/§4.3: `running` but not updated for 5+ minutes.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == LaneStatus::Running
            && now.signed_duration_since(self.updated_at) > chrono::Duration::minutes(5)
    }
}

// ---------------------------------------------------------------------------
// ConversationEntry — conversation.jsonl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    Reviewer,
    Intervention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub role: ConversationRole,
    pub task: String,
    pub full_text: String,
    pub text_length: usize,
    #[serde(default)]
    pub model: Option<String>,
}

impl ConversationEntry {
    pub fn new(role: ConversationRole, task: impl Into<String>, full_text: impl Into<String>, model: Option<String>) -> Self {
        let full_text = full_text.into();
        Self {
            timestamp: Utc::now(),
            role,
            task: task.into(),
            text_length: full_text.chars().count(),
            full_text,
            model,
        }
    }
}

// ---------------------------------------------------------------------------
// InterventionRequest — pending-intervention.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionSource {
    User,
    System,
    StallDetector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub source: InterventionSource,
    pub priority: u8,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl InterventionRequest {
    pub const PRIORITY_CONTINUE: u8 = 5;
    pub const PRIORITY_STRONGER_PROMPT: u8 = 7;
    pub const PRIORITY_RESTART: u8 = 9;

    pub fn new(kind: impl Into<String>, message: impl Into<String>, source: InterventionSource, priority: u8) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
            source,
            priority,
            metadata: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator exit codes (§4.1, §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneExitCode {
    Success = 0,
    Failure = 1,
    BlockedDependency = 2,
}

impl LaneExitCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => LaneExitCode::Success,
            2 => LaneExitCode::BlockedDependency,
            _ => LaneExitCode::Failure,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Aggregate a set of lane exit codes into the orchestrator's own exit code,
/// per spec §4.1: failure beats blocked, blocked beats success.
pub fn aggregate_exit_codes(codes: &[LaneExitCode]) -> i32 {
    if codes.iter().any(|c| *c == LaneExitCode::Failure) {
        1
    } else if codes.iter().any(|c| *c == LaneExitCode::BlockedDependency) {
        2
    } else {
        0
    }
}
