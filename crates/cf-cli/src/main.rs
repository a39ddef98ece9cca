#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// cursorflow -- orchestrate long-running AI coding agents across
/// dependency-ordered lanes of isolated Git worktrees.
#[derive(Parser)]
#[command(name = "cursorflow", version, about)]
struct Cli {
    /// Emit structured JSON logs instead of human-readable ones.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every lane under a tasks directory to completion.
    Run {
        /// Directory containing one `*.json` lane file per lane.
        tasks_dir: PathBuf,
        /// Where to persist run state (default: `<repo>/.cursorflow/runs/run-<ts>`).
        #[arg(long)]
        run_dir: Option<PathBuf>,
        /// Progress poll interval, in milliseconds.
        #[arg(long, default_value_t = 60_000)]
        poll_interval: u64,
        /// Agent CLI binary to invoke.
        #[arg(long, default_value = "cursor-agent")]
        agent_binary: String,
    },

    /// Internal: run a single lane. Invoked by `run`/`resume`, not by hand.
    #[command(hide = true)]
    RunLane {
        #[arg(long)]
        repo_root: PathBuf,
        #[arg(long)]
        run_root: PathBuf,
        #[arg(long)]
        tasks_file: PathBuf,
        #[arg(long)]
        lane: String,
        #[arg(long, default_value = "cursor-agent")]
        agent_binary: String,
        #[arg(long, default_value_t = 0)]
        start_index: usize,
    },

    /// Resume a run after a crash or an intentional stop.
    Resume {
        /// Run id (`run-<ts>`) under `.cursorflow/runs/`; defaults to the latest.
        run_id: Option<String>,
        /// Resume every non-terminal lane, not just the one named by `--lane`.
        #[arg(long)]
        all: bool,
        /// Clear each resumed lane's agent session, forcing a fresh one.
        #[arg(long)]
        restart: bool,
        /// Resume only this lane.
        #[arg(long)]
        lane: Option<String>,
        /// Agent CLI binary to invoke.
        #[arg(long, default_value = "cursor-agent")]
        agent_binary: String,
    },

    /// Inject an intervention message into a running lane.
    Signal {
        /// `<run-id>/<lane>`.
        target: String,
        /// Message to deliver to the agent on its next turn.
        message: String,
    },

    /// Run health checks (agent binary on PATH, git available, repo clean).
    Doctor {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = std::env::var("CURSORFLOW_LOG").unwrap_or_else(|_| "info".to_string());

    match cli.command {
        Commands::Run { tasks_dir, run_dir, poll_interval, agent_binary } => {
            cf_telemetry::init("cursorflow", &level, cli.json);
            let code = commands::run::run(tasks_dir, run_dir, poll_interval, agent_binary).await?;
            std::process::exit(code);
        }
        Commands::RunLane { repo_root, run_root, tasks_file, lane, agent_binary, start_index } => {
            cf_telemetry::init(&format!("cursorflow-lane-{lane}"), &level, cli.json);
            let code =
                commands::run_lane::run(repo_root, run_root, tasks_file, lane, agent_binary, start_index).await?;
            std::process::exit(code);
        }
        Commands::Resume { run_id, all, restart, lane, agent_binary } => {
            cf_telemetry::init("cursorflow-resume", &level, cli.json);
            let code = commands::resume::run(run_id, all, restart, lane, agent_binary).await?;
            std::process::exit(code);
        }
        Commands::Signal { target, message } => {
            cf_telemetry::init("cursorflow-signal", &level, cli.json);
            commands::signal::run(&target, &message)?;
        }
        Commands::Doctor { json } => {
            cf_telemetry::init("cursorflow-doctor", &level, cli.json || json);
            let code = commands::doctor::run(json || cli.json)?;
            std::process::exit(code);
        }
    }

    Ok(())
}
