//! Logging setup for the orchestrator process and each per-lane runner
//! process, per spec §11.
//!
//! Grounded on `at-telemetry/src/logging.rs`'s two-function (human/JSON)
//! `tracing_subscriber` init pair, narrowed to what CursorFlow needs: no
//! HTTP middleware and no Prometheus exporter, since CursorFlow exposes no
//! network service and has no request path to instrument. The orchestrator
//! installs one subscriber before spawning any lane; each LaneRunner, being
//! its own process, installs its own subscriber writing to its own
//! `terminal.log`.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging with human-readable output.
///
/// Honors `RUST_LOG` if set, otherwise falls back to `default_level` (e.g.
/// `"info"`, `"cf_runner=debug,warn"`). Safe to call more than once; later
/// calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with JSON output, for `--json` mode.
///
/// Honors `RUST_LOG` if set, otherwise falls back to `default_level`. Safe
/// to call more than once; later calls are no-ops.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
}

/// Pick human or JSON output based on a CLI `--json` flag, then initialize.
pub fn init(service_name: &str, default_level: &str, json: bool) {
    if json {
        init_logging_json(service_name, default_level);
    } else {
        init_logging(service_name, default_level);
    }
}
