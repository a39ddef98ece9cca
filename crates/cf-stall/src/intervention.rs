//! File+signal intervention protocol: write `pending-intervention.json`,
//! then SIGTERM→SIGKILL the agent child, per spec §4.6's action execution.
//!
//! Grounded on the atomic-write-plus-read-then-remove file side channel in
//! `at-core/src/lockfile.rs` and the SIGTERM-then-SIGKILL escalation in
//! `at-harness/src/shutdown.rs`, generalized from a cooperative async
//! broadcast to a cross-process signal since the agent is a separate OS
//! process that doesn't share our runtime.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cf_core::types::{InterventionRequest, InterventionSource};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum InterventionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InterventionError>;

/// Owns the `pending-intervention.json` side channel and agent-kill
/// escalation for one lane's run directory.
pub struct InterventionBus {
    lane_dir: PathBuf,
}

impl InterventionBus {
    pub fn new(lane_dir: impl Into<PathBuf>) -> Self {
        Self { lane_dir: lane_dir.into() }
    }

    pub fn pending_path(&self) -> PathBuf {
        self.lane_dir.join("pending-intervention.json")
    }

    /// Write an intervention request, unless a pending request with
    /// strictly higher priority already exists (spec §4.6 step 1 /
    /// §8's priority-monotonicity invariant). Returns whether it was
    /// written.
    pub fn write_request(&self, request: &InterventionRequest) -> Result<bool> {
        let path = self.pending_path();
        if let Some(existing) = self.read_request()? {
            if existing.priority > request.priority {
                info!(
                    existing_priority = existing.priority,
                    new_priority = request.priority,
                    "skipping lower-priority intervention request"
                );
                return Ok(false);
            }
        }

        std::fs::create_dir_all(&self.lane_dir)?;
        let json = serde_json::to_vec_pretty(request)?;
        let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
        {
            let mut tmp = std::fs::File::create(&tmp_path)?;
            tmp.write_all(&json)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(true)
    }

    /// Read the pending request without consuming it (used by callers that
    /// just want to inspect priority, e.g. `write_request`).
    pub fn read_request(&self) -> Result<Option<InterventionRequest>> {
        let path = self.pending_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Read-then-delete the pending request, per spec §3: "consumed-and-
    /// deleted by LaneRunner at the start of the next task."
    pub fn consume_request(&self) -> Result<Option<InterventionRequest>> {
        let request = self.read_request()?;
        if let Some(req) = &request {
            let _ = std::fs::remove_file(self.pending_path());
            self.append_log(req);
        }
        Ok(request)
    }

    /// Append a consumed request to `intervention.txt`, the lane's
    /// human-readable record of every intervention actually delivered to
    /// the agent (distinct from `pending-intervention.json`, which only
    /// ever holds the one not-yet-consumed request).
    fn append_log(&self, request: &InterventionRequest) {
        let path = self.lane_dir.join("intervention.txt");
        let line = format!(
            "[{}] {:?} (priority {}) source={:?}: {}\n",
            request.timestamp.to_rfc3339(),
            request.kind,
            request.priority,
            request.source,
            request.message
        );
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            let _ = f.write_all(line.as_bytes());
        }
    }

    pub fn continue_request(message: impl Into<String>, source: InterventionSource) -> InterventionRequest {
        InterventionRequest::new("CONTINUE_SIGNAL", message, source, InterventionRequest::PRIORITY_CONTINUE)
    }

    pub fn stronger_prompt_request(message: impl Into<String>, source: InterventionSource) -> InterventionRequest {
        InterventionRequest::new("STRONGER_PROMPT", message, source, InterventionRequest::PRIORITY_STRONGER_PROMPT)
    }

    pub fn restart_request(message: impl Into<String>, source: InterventionSource) -> InterventionRequest {
        InterventionRequest::new("RESTART_SIGNAL", message, source, InterventionRequest::PRIORITY_RESTART)
    }

    /// SIGTERM, wait up to `grace` (5s in spec), SIGKILL, wait 0.5s. The
    /// restart path skips straight to SIGKILL per spec §4.6 step 3.
    pub async fn kill_agent(pid: u32, escalate_gracefully: bool) {
        if escalate_gracefully {
            send_signal(pid, libc::SIGTERM);
            if wait_for_exit(pid, Duration::from_secs(5)).await {
                return;
            }
            warn!(pid, "agent did not exit after SIGTERM, sending SIGKILL");
        }
        send_signal(pid, libc::SIGKILL);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn send_signal(pid: u32, signal: i32) {
    // SAFETY: `kill` with a signal we control and a pid we were handed by
    // our own process tree; failure (ESRCH — already exited) is expected
    // and intentionally ignored.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    !process_alive(pid)
}

/// Write `diagnostic.json` for the `RUN_DOCTOR` action (spec §4.6).
pub fn write_diagnostic(lane_dir: &Path, diagnosis: &serde_json::Value) -> Result<()> {
    std::fs::create_dir_all(lane_dir)?;
    let path = lane_dir.join("diagnostic.json");
    let json = serde_json::to_vec_pretty(diagnosis)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::InterventionSource;

    #[test]
    fn write_then_consume_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let bus = InterventionBus::new(dir.path());
        let req = InterventionBus::continue_request("keep going", InterventionSource::StallDetector);
        assert!(bus.write_request(&req).unwrap());

        let consumed = bus.consume_request().unwrap().unwrap();
        assert_eq!(consumed.kind, "CONTINUE_SIGNAL");
        assert!(!bus.pending_path().exists());
    }

    #[test]
    fn higher_priority_request_is_not_overwritten_by_lower() {
        let dir = tempfile::tempdir().unwrap();
        let bus = InterventionBus::new(dir.path());
        let restart = InterventionBus::restart_request("restart now", InterventionSource::StallDetector);
        bus.write_request(&restart).unwrap();

        let continue_req = InterventionBus::continue_request("keep going", InterventionSource::StallDetector);
        let written = bus.write_request(&continue_req).unwrap();
        assert!(!written);

        let pending = bus.read_request().unwrap().unwrap();
        assert_eq!(pending.kind, "RESTART_SIGNAL");
    }

    #[test]
    fn equal_priority_request_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let bus = InterventionBus::new(dir.path());
        let first = InterventionBus::continue_request("first", InterventionSource::StallDetector);
        bus.write_request(&first).unwrap();

        let second = InterventionBus::continue_request("second", InterventionSource::StallDetector);
        assert!(bus.write_request(&second).unwrap());
        assert_eq!(bus.read_request().unwrap().unwrap().message, "second");
    }

    #[test]
    fn consume_on_empty_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let bus = InterventionBus::new(dir.path());
        assert!(bus.consume_request().unwrap().is_none());
    }

    #[test]
    fn consuming_appends_to_intervention_log() {
        let dir = tempfile::tempdir().unwrap();
        let bus = InterventionBus::new(dir.path());
        bus.write_request(&InterventionBus::continue_request("keep going", InterventionSource::StallDetector)).unwrap();
        bus.consume_request().unwrap();
        bus.write_request(&InterventionBus::restart_request("restarting", InterventionSource::StallDetector)).unwrap();
        bus.consume_request().unwrap();

        let log = std::fs::read_to_string(dir.path().join("intervention.txt")).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("keep going"));
        assert!(log.contains("restarting"));
    }
}
