use anyhow::Context;
use cf_core::state_store::StateStore;
use cf_core::types::InterventionSource;
use cf_stall::intervention::InterventionBus;

/// `cursorflow signal <run-id>/<lane> <message>` -- the user-facing half of
/// the intervention protocol (spec §6): write a `pending-intervention.json`
/// with `source=user` and SIGTERM the lane's agent child so it picks the
/// message up on its next turn, same as a stall-detector-originated one.
pub fn run(target: &str, message: &str) -> anyhow::Result<()> {
    let (run_id, lane_name) = target
        .split_once('/')
        .context("target must be '<run-id>/<lane>'")?;

    let repo_root = std::env::current_dir().context("resolving repo root")?;
    let run_root = super::resolve_run_dir(&repo_root, Some(run_id))?;
    let lane_dir = run_root.join("lanes").join(lane_name);
    anyhow::ensure!(lane_dir.is_dir(), "no such lane: {lane_name} (looked in {})", lane_dir.display());

    let bus = InterventionBus::new(&lane_dir);
    let request = cf_core::types::InterventionRequest::new(
        "USER_SIGNAL",
        message,
        InterventionSource::User,
        cf_core::types::InterventionRequest::PRIORITY_RESTART,
    );
    let written = bus.write_request(&request)?;
    if !written {
        tracing::warn!(lane = lane_name, "a higher-priority intervention is already pending; message not delivered");
        return Ok(());
    }

    let store = StateStore::new(&lane_dir);
    let state = store.load().context("loading lane state")?;
    if let Some(pid) = state.pid {
        tracing::info!(lane = lane_name, pid, "signaling lane's agent process");
        // SAFETY: terminating a pid this run's own state.json recorded as
        // the lane's agent child; ESRCH (already exited) is expected and
        // ignored -- the lane runner picks up the written intervention file
        // the next time it starts a task regardless.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    } else {
        tracing::info!(lane = lane_name, "no active pid recorded; message queued for the next task");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::{InterventionRequest, LaneState};

    #[test]
    fn rejects_target_without_a_slash() {
        let err = "just-a-run-id".split_once('/');
        assert!(err.is_none());
    }

    #[test]
    fn writes_request_and_signals_recorded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path().join(".cursorflow/runs/run-1");
        let lane_dir = run_root.join("lanes/alpha");
        std::fs::create_dir_all(&lane_dir).unwrap();

        let mut state = LaneState::new(2);
        state.pid = Some(std::process::id());
        StateStore::new(&lane_dir).save_with_lock(&state).unwrap();

        let bus = InterventionBus::new(&lane_dir);
        let request = InterventionRequest::new(
            "USER_SIGNAL",
            "please stop and check X",
            InterventionSource::User,
            InterventionRequest::PRIORITY_RESTART,
        );
        assert!(bus.write_request(&request).unwrap());

        let pending = bus.read_request().unwrap().expect("request was written");
        assert_eq!(pending.source, InterventionSource::User);
        assert_eq!(pending.priority, InterventionRequest::PRIORITY_RESTART);
    }

    #[test]
    fn lower_priority_does_not_overwrite_pending_restart() {
        let dir = tempfile::tempdir().unwrap();
        let lane_dir = dir.path().join("lane");
        std::fs::create_dir_all(&lane_dir).unwrap();

        let bus = InterventionBus::new(&lane_dir);
        let restart = InterventionRequest::new(
            "RESTART_SIGNAL",
            "restart",
            InterventionSource::StallDetector,
            InterventionRequest::PRIORITY_RESTART,
        );
        assert!(bus.write_request(&restart).unwrap());

        let user_signal = InterventionRequest::new(
            "USER_SIGNAL",
            "a lower priority message",
            InterventionSource::User,
            InterventionRequest::PRIORITY_CONTINUE,
        );
        assert!(!bus.write_request(&user_signal).unwrap());

        let pending = bus.read_request().unwrap().expect("original request still pending");
        assert_eq!(pending.kind, "RESTART_SIGNAL");
    }
}
