use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use cf_core::config::CursorFlowConfig;
use cf_runner::orchestrator::{Orchestrator, OrchestratorArgs};

/// `cursorflow run <tasksDir>` -- drive every lane in `tasksDir` to
/// completion, per spec §4.1.
pub async fn run(
    tasks_dir: PathBuf,
    run_dir: Option<PathBuf>,
    poll_interval_ms: u64,
    agent_binary: String,
) -> anyhow::Result<i32> {
    let repo_root = std::env::current_dir().context("resolving repo root")?;
    let config = CursorFlowConfig::load(&repo_root).context("loading .cursorflow/config.toml")?;

    let run_root = run_dir.unwrap_or_else(|| {
        super::runs_root(&repo_root).join(format!("run-{}", chrono::Utc::now().timestamp_millis()))
    });
    let cli_binary = std::env::current_exe().context("resolving own executable path")?;

    tracing::info!(tasks_dir = %tasks_dir.display(), run_root = %run_root.display(), "starting run");

    let orchestrator = Orchestrator::new(OrchestratorArgs {
        repo_root,
        tasks_dir,
        run_root,
        agent_binary,
        cli_binary,
        config,
        poll_interval: Duration::from_millis(poll_interval_ms),
    });

    let code = orchestrator.run().await.context("orchestration failed")?;
    Ok(code)
}
