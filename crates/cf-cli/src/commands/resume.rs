use anyhow::Context;
use cf_core::config::CursorFlowConfig;
use cf_core::state_store::StateStore;
use cf_core::types::{aggregate_exit_codes, LaneStatus};
use cf_runner::orchestrator::{Orchestrator, OrchestratorArgs, RunManifest};

/// `cursorflow resume [run-id] [--all] [--restart] [--lane <name>]` -- reload
/// a run's state and re-spawn the lanes that haven't reached a terminal
/// status, starting each one at its persisted `currentTaskIndex` (spec §6).
///
/// A lane already `completed` is left untouched: resuming it is a no-op, per
/// spec §8's idempotence property.
pub async fn run(
    run_id: Option<String>,
    all: bool,
    restart: bool,
    lane: Option<String>,
    agent_binary: String,
) -> anyhow::Result<i32> {
    let repo_root = std::env::current_dir().context("resolving repo root")?;
    let run_root = super::resolve_run_dir(&repo_root, run_id.as_deref())?;
    let manifest = RunManifest::load(&run_root).context("loading run manifest")?;
    let config = CursorFlowConfig::load(&manifest.repo_root).context("loading .cursorflow/config.toml")?;
    let cli_binary = std::env::current_exe().context("resolving own executable path")?;

    anyhow::ensure!(
        all || lane.is_some(),
        "specify --lane <name> or --all to resume every non-terminal lane"
    );

    let orchestrator = Orchestrator::new(OrchestratorArgs {
        repo_root: manifest.repo_root.clone(),
        tasks_dir: manifest.tasks_dir.clone(),
        run_root: run_root.clone(),
        agent_binary,
        cli_binary,
        config,
        poll_interval: std::time::Duration::from_secs(60),
    });

    let mut handles = Vec::new();
    for (lane_name, tasks_file) in &manifest.lanes {
        if let Some(only) = &lane {
            if lane_name != only {
                continue;
            }
        }

        let start_index = resolve_start_index(&run_root, lane_name, restart)?;
        match start_index {
            None => {
                tracing::info!(lane = %lane_name, "already completed, skipping resume");
                continue;
            }
            Some(idx) => {
                tracing::info!(lane = %lane_name, start_index = idx, "resuming lane");
                handles.push(orchestrator.spawn_lane_at(tasks_file, lane_name, idx)?);
            }
        }
    }

    if handles.is_empty() {
        tracing::info!("nothing to resume");
        return Ok(0);
    }

    let codes = orchestrator.wait_for_lanes(handles).await;
    Ok(aggregate_exit_codes(&codes))
}

/// Figure out where a lane should restart from: `None` if it's already
/// `completed` (resume is then a no-op), otherwise its `currentTaskIndex`.
/// `--restart` additionally clears the persisted `chatId` and `pid` so the
/// lane creates a fresh agent session rather than trying to `--resume` one
/// that may no longer exist.
fn resolve_start_index(run_root: &std::path::Path, lane_name: &str, restart: bool) -> anyhow::Result<Option<usize>> {
    let lane_dir = run_root.join("lanes").join(lane_name);
    let store = StateStore::new(&lane_dir);
    if !store.state_path().exists() {
        return Ok(Some(0));
    }

    let mut state = store.load().context("loading lane state")?;
    if state.status == LaneStatus::Completed {
        return Ok(None);
    }

    if restart {
        state.chat_id = None;
        state.pid = None;
        store.save_with_lock(&state)?;
    }

    Ok(Some(state.current_task_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::LaneState;

    #[test]
    fn missing_state_file_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path();
        std::fs::create_dir_all(run_root.join("lanes/alpha")).unwrap();

        let start = resolve_start_index(run_root, "alpha", false).unwrap();
        assert_eq!(start, Some(0));
    }

    #[test]
    fn completed_lane_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path();
        let lane_dir = run_root.join("lanes/alpha");
        std::fs::create_dir_all(&lane_dir).unwrap();

        let mut state = LaneState::new(3);
        state.current_task_index = 3;
        state.mark_completed();
        StateStore::new(&lane_dir).save_with_lock(&state).unwrap();

        let start = resolve_start_index(run_root, "alpha", false).unwrap();
        assert_eq!(start, None);
    }

    #[test]
    fn restart_clears_chat_id_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path();
        let lane_dir = run_root.join("lanes/alpha");
        std::fs::create_dir_all(&lane_dir).unwrap();

        let mut state = LaneState::new(3);
        state.current_task_index = 1;
        state.chat_id = Some("chat-123".to_string());
        state.pid = Some(4242);
        state.mark_running();
        let store = StateStore::new(&lane_dir);
        store.save_with_lock(&state).unwrap();

        let start = resolve_start_index(run_root, "alpha", true).unwrap();
        assert_eq!(start, Some(1));

        let reloaded = store.load().unwrap();
        assert!(reloaded.chat_id.is_none());
        assert!(reloaded.pid.is_none());
    }

    #[test]
    fn non_restart_resume_preserves_chat_id() {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path();
        let lane_dir = run_root.join("lanes/alpha");
        std::fs::create_dir_all(&lane_dir).unwrap();

        let mut state = LaneState::new(3);
        state.current_task_index = 2;
        state.chat_id = Some("chat-456".to_string());
        state.mark_running();
        let store = StateStore::new(&lane_dir);
        store.save_with_lock(&state).unwrap();

        let start = resolve_start_index(run_root, "alpha", false).unwrap();
        assert_eq!(start, Some(2));

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.chat_id.as_deref(), Some("chat-456"));
    }
}
