use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use cf_core::config::CursorFlowConfig;
use cf_runner::lane_runner::{LaneRunner, LaneRunnerArgs};

/// `cursorflow run-lane` -- the internal subcommand [`Orchestrator::spawn_lane`]
/// invokes as one lane's own OS process, per spec §4.2.
///
/// Installs a SIGTERM/SIGINT handler so the cancellation path in spec §4.5
/// (orchestrator shutdown propagates to lane runners) has somewhere to land:
/// the handler flips a shared flag that [`LaneRunner`] checks between tasks.
pub async fn run(
    repo_root: PathBuf,
    run_root: PathBuf,
    tasks_file: PathBuf,
    lane: String,
    agent_binary: String,
    start_index: usize,
) -> anyhow::Result<i32> {
    let config = CursorFlowConfig::load(&repo_root).context("loading .cursorflow/config.toml")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(shutdown.clone());

    let mut runner = LaneRunner::new(LaneRunnerArgs {
        repo_root,
        run_root,
        tasks_file,
        lane_name: lane,
        agent_binary,
        config,
        start_index,
    })
    .with_shutdown_flag(shutdown);

    Ok(runner.run().await)
}

#[cfg(unix)]
fn spawn_signal_watcher(shutdown: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => tracing::warn!("received SIGTERM"),
            _ = int.recv() => tracing::warn!("received SIGINT"),
        }
        shutdown.store(true, Ordering::Relaxed);
    });
}

#[cfg(not(unix))]
fn spawn_signal_watcher(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.store(true, Ordering::Relaxed);
        }
    });
}
