//! `.cursorflow/config.toml` — section structs with explicit defaults,
//! loaded with a fallback to `Default` when the file is absent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorFlowConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub stall: StallConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Default for CursorFlowConfig {
    fn default() -> Self {
        Self {
            runner: RunnerConfig::default(),
            stall: StallConfig::default(),
            git: GitConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl CursorFlowConfig {
    /// Load from `<repoRoot>/.cursorflow/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load(repo_root: &std::path::Path) -> Result<Self, ConfigError> {
        let path = Self::default_path(repo_root);
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path(repo_root: &std::path::Path) -> PathBuf {
        repo_root.join(".cursorflow").join("config.toml")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// RunnerConfig — Orchestrator / LaneRunner timing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_stale_minutes")]
    pub stale_minutes: u64,
    #[serde(default = "default_dependency_poll_secs")]
    pub dependency_poll_secs: u64,
    #[serde(default = "default_worktree_retries")]
    pub worktree_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stale_minutes: default_stale_minutes(),
            dependency_poll_secs: default_dependency_poll_secs(),
            worktree_retries: default_worktree_retries(),
        }
    }
}

fn default_stale_minutes() -> u64 {
    5
}
fn default_dependency_poll_secs() -> u64 {
    10
}
fn default_worktree_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// StallConfig — §4.6 defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_progress_timeout_secs")]
    pub progress_timeout_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_long_op_grace_secs")]
    pub long_op_grace_secs: u64,
    #[serde(default = "default_continue_grace_secs")]
    pub continue_grace_secs: u64,
    #[serde(default = "default_stronger_prompt_grace_secs")]
    pub stronger_prompt_grace_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            progress_timeout_secs: default_progress_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            long_op_grace_secs: default_long_op_grace_secs(),
            continue_grace_secs: default_continue_grace_secs(),
            stronger_prompt_grace_secs: default_stronger_prompt_grace_secs(),
            max_restarts: default_max_restarts(),
            tick_secs: default_tick_secs(),
        }
    }
}

impl StallConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
    pub fn progress_timeout(&self) -> Duration {
        Duration::from_secs(self.progress_timeout_secs)
    }
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
    pub fn long_op_grace(&self) -> Duration {
        Duration::from_secs(self.long_op_grace_secs)
    }
    pub fn continue_grace(&self) -> Duration {
        Duration::from_secs(self.continue_grace_secs)
    }
    pub fn stronger_prompt_grace(&self) -> Duration {
        Duration::from_secs(self.stronger_prompt_grace_secs)
    }
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

fn default_idle_timeout_secs() -> u64 {
    120
}
fn default_progress_timeout_secs() -> u64 {
    600
}
fn default_task_timeout_secs() -> u64 {
    1800
}
fn default_long_op_grace_secs() -> u64 {
    600
}
fn default_continue_grace_secs() -> u64 {
    120
}
fn default_stronger_prompt_grace_secs() -> u64 {
    120
}
fn default_max_restarts() -> u32 {
    2
}
fn default_tick_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// GitConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub base_branch: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            base_branch: None,
        }
    }
}

fn default_branch_prefix() -> String {
    "cursorflow/".to_string()
}

// ---------------------------------------------------------------------------
// AgentConfig — §4.5 defaults
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_create_chat_timeout_secs")]
    pub create_chat_timeout_secs: u64,
    #[serde(default = "default_send_prompt_timeout_secs")]
    pub send_prompt_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_success_threshold")]
    pub circuit_success_threshold: u32,
    #[serde(default = "default_circuit_timeout_secs")]
    pub circuit_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            create_chat_timeout_secs: default_create_chat_timeout_secs(),
            send_prompt_timeout_secs: default_send_prompt_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base_secs(),
            retry_cap_secs: default_retry_cap_secs(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_success_threshold: default_circuit_success_threshold(),
            circuit_timeout_secs: default_circuit_timeout_secs(),
        }
    }
}

fn default_create_chat_timeout_secs() -> u64 {
    30
}
fn default_send_prompt_timeout_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_secs() -> u64 {
    5
}
fn default_retry_cap_secs() -> u64 {
    60
}
fn default_rate_limit_backoff_secs() -> u64 {
    60
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_success_threshold() -> u32 {
    2
}
fn default_circuit_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = CursorFlowConfig::default();
        assert_eq!(cfg.stall.idle_timeout_secs, 120);
        assert_eq!(cfg.stall.max_restarts, 2);
        assert_eq!(cfg.agent.circuit_failure_threshold, 5);
        assert_eq!(cfg.git.branch_prefix, "cursorflow/");
    }

    #[test]
    fn load_falls_back_to_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CursorFlowConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.runner.stale_minutes, 5);
    }

    #[test]
    fn roundtrips_through_toml() {
        let cfg = CursorFlowConfig::default();
        let text = cfg.to_toml().unwrap();
        let parsed: CursorFlowConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.stall.idle_timeout_secs, cfg.stall.idle_timeout_secs);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let text = "[stall]\nmax_restarts = 5\n";
        let cfg: CursorFlowConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.stall.max_restarts, 5);
        assert_eq!(cfg.stall.idle_timeout_secs, 120);
    }
}
