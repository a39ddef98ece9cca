//! One-shot management of a `cursor-agent` chat session: `create-chat`,
//! `send-prompt`, result parsing — with retries and a per-lane circuit
//! breaker, per spec §4.5.
//!
//! Grounded on `at-agents/src/executor.rs`'s `PtySpawner` trait + channel
//! handle (`SpawnedProcess`) and `at-session/src/cli_adapter.rs`'s adapter
//! pattern for binary/arg construction. Re-expressed over
//! `tokio::process::Command` with piped stdio rather than a PTY: the agent
//! contract (spec §6) is a single JSON `result` object on stdout, not an
//! interactive terminal, so no PTY is needed.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::classify::{classify_error_text, ErrorClass};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("{class:?}: {message}")]
    Classified { class: ErrorClass, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("circuit breaker open, retry after {0:?}")]
    CircuitOpen(Duration),
    #[error("no result object found on stdout")]
    NoResult,
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// A byte/line observer invoked for every chunk of agent stdout, so the
/// stall detector can track activity without owning the reader itself
/// (spec §9's fan-out design note — one reader, many sinks).
pub trait OutputSink: Send + Sync {
    fn on_line(&self, line: &str);
}

/// Writes every line verbatim to `terminal.log`, matching what a developer
/// watching the raw agent session would see.
pub struct TerminalLogSink {
    path: std::path::PathBuf,
}

impl TerminalLogSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl OutputSink for TerminalLogSink {
    fn on_line(&self, line: &str) {
        use std::io::Write;
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
            let _ = writeln!(f, "{line}");
        }
    }
}

/// A single `type=="result"` object parsed from stdout, per spec §6.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentResult {
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub result: String,
}

#[derive(Debug, Clone)]
pub struct SendPromptArgs {
    pub workspace_dir: std::path::PathBuf,
    pub chat_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub timeout: Duration,
    pub task_name: String,
    pub output_format: String,
    /// Directory watched for `timeout.txt`, the side channel a task can use
    /// to extend its own deadline mid-call (spec §4.5/§6).
    pub signal_dir: std::path::PathBuf,
    /// Published with the agent child's OS pid immediately after spawn and
    /// cleared back to `None` once the call completes, so an external
    /// stall-watch ticker (or `cursorflow signal`) can locate and kill the
    /// in-flight process (spec §3's `LaneState.pid`, §4.6 action execution).
    pub pid_slot: Arc<Mutex<Option<u32>>>,
}

#[derive(Debug, Clone)]
pub struct SendPromptOutcome {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub session_id: Option<String>,
    pub result_text: String,
    pub error: Option<String>,
    /// Total bytes observed on stdout/stderr, for the stall detector.
    pub bytes_received: usize,
}

/// Owns the circuit breaker for one lane's agent calls and knows how to spawn
/// the `cursor-agent` binary for `create-chat` and `send-prompt`.
pub struct AgentSupervisor {
    binary: String,
    breaker: CircuitBreaker,
    max_retries: u32,
    retry_base: Duration,
    retry_cap: Duration,
    rate_limit_backoff: Duration,
}

impl AgentSupervisor {
    pub fn new(binary: impl Into<String>, cb_config: CircuitBreakerConfig) -> Self {
        Self {
            binary: binary.into(),
            breaker: CircuitBreaker::new(cb_config),
            max_retries: 3,
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(60),
            rate_limit_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base: Duration, cap: Duration, rate_limit_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base;
        self.retry_cap = cap;
        self.rate_limit_backoff = rate_limit_backoff;
        self
    }

    /// How long until the breaker leaves `Open`, for the `WAIT_AND_RETRY`
    /// analysis the caller surfaces while the circuit is tripped.
    pub async fn cooldown_remaining(&self) -> Option<Duration> {
        self.breaker.remaining_cooldown().await
    }

    /// `cursor-agent create-chat`, 30s timeout, final non-empty stdout line
    /// is the chat id (spec §4.5).
    pub async fn create_chat(&self, workspace_dir: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("create-chat")
            .arg("--workspace")
            .arg(workspace_dir)
            .current_dir(workspace_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::CommandNotFound(self.binary.clone())
            } else {
                AgentError::Io(e)
            }
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();
        let mut last_line = String::new();

        let result = tokio::time::timeout(Duration::from_secs(30), async {
            while let Some(line) = lines.next_line().await.map_err(AgentError::Io)? {
                if !line.trim().is_empty() {
                    last_line = line;
                }
            }
            Ok::<(), AgentError>(())
        })
        .await;

        let _ = child.kill().await;
        match result {
            Err(_) => Err(AgentError::Classified { class: ErrorClass::Timeout, message: "create-chat timed out".into() }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                if last_line.trim().is_empty() {
                    Err(AgentError::NoResult)
                } else {
                    Ok(last_line.trim().to_string())
                }
            }
        }
    }

    /// Send one prompt with retry + circuit breaker, per spec §4.5's retry
    /// table: NETWORK/UNAVAILABLE/TIMEOUT get exponential backoff up to
    /// `max_retries`; RATE_LIMIT gets a fixed backoff; AUTH aborts retries.
    pub async fn send_prompt(
        &self,
        args: &SendPromptArgs,
        sinks: &[&dyn OutputSink],
    ) -> Result<SendPromptOutcome> {
        let mut attempt = 0u32;
        loop {
            let call_result = self
                .breaker
                .call(|| self.send_prompt_once(args, sinks))
                .await;

            let class = match call_result {
                Ok(outcome) => return Ok(outcome),
                Err(CircuitBreakerError::Open) => {
                    let remaining = self.cooldown_remaining().await.unwrap_or_default();
                    return Err(AgentError::CircuitOpen(remaining));
                }
                Err(CircuitBreakerError::Timeout(_)) => {
                    let class = ErrorClass::Timeout;
                    if attempt >= self.max_retries || !class.is_retryable() {
                        return Err(AgentError::Classified { class, message: "send-prompt timed out".into() });
                    }
                    class
                }
                Err(CircuitBreakerError::Inner(message)) => {
                    let class = classify_error_text(&message);
                    if !class.is_retryable() || attempt >= self.max_retries {
                        return Err(AgentError::Classified { class, message });
                    }
                    warn!(attempt, ?class, task = %args.task_name, "send-prompt failed, retrying");
                    class
                }
            };

            let backoff = if class == ErrorClass::RateLimit {
                self.rate_limit_backoff
            } else {
                (self.retry_base * 2u32.pow(attempt)).min(self.retry_cap)
            };
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn send_prompt_once(
        &self,
        args: &SendPromptArgs,
        sinks: &[&dyn OutputSink],
    ) -> std::result::Result<SendPromptOutcome, String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--resume").arg(&args.chat_id);
        if let Some(model) = &args.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("--output-format")
            .arg(&args.output_format)
            .arg("--workspace")
            .arg(&args.workspace_dir)
            .arg("--force")
            .arg("--approve-mcps")
            .current_dir(&args.workspace_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child: Child = cmd.spawn().map_err(|e| e.to_string())?;
        *args.pid_slot.lock().unwrap() = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(args.prompt.as_bytes()).await.map_err(|e| e.to_string())?;
            drop(stdin);
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut bytes_received = 0usize;
        let mut last_result: Option<AgentResult> = None;
        let mut stderr_tail = String::new();

        let mut deadline = tokio::time::Instant::now() + args.timeout;
        let mut extension_check = tokio::time::interval(TIMEOUT_EXTENSION_POLL);
        extension_check.tick().await; // first tick fires immediately

        let read_fut = async {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err("__timed_out__".to_string());
                    }
                    _ = extension_check.tick() => {
                        if let Some(extra) = read_timeout_extension(&args.signal_dir) {
                            debug!(task = %args.task_name, extra_secs = extra.as_secs(), "extending send-prompt deadline from timeout.txt");
                            deadline = tokio::time::Instant::now() + extra;
                        }
                    }
                    line = stdout_lines.next_line() => {
                        match line {
                            Ok(Some(l)) => {
                                bytes_received += l.len();
                                for sink in sinks {
                                    sink.on_line(&l);
                                }
                                if let Some(obj) = extract_trailing_json(&l) {
                                    if let Ok(parsed) = serde_json::from_str::<AgentResult>(&obj) {
                                        if parsed.kind == "result" {
                                            last_result = Some(parsed);
                                        }
                                    }
                                }
                            }
                            Ok(None) => break,
                            Err(e) => return Err(e.to_string()),
                        }
                    }
                    line = stderr_lines.next_line() => {
                        if let Ok(Some(l)) = line {
                            bytes_received += l.len();
                            stderr_tail = l.clone();
                            for sink in sinks {
                                sink.on_line(&l);
                            }
                        }
                    }
                }
            }
            Ok::<(), String>(())
        };

        let outcome = read_fut.await;
        let status = child.wait().await;
        *args.pid_slot.lock().unwrap() = None;

        match outcome {
            Err(ref e) if e == "__timed_out__" => {
                let _ = child.kill().await;
                Err("send-prompt timed out".to_string())
            }
            Err(e) => Err(e),
            Ok(()) => match last_result {
                Some(result) => Ok(SendPromptOutcome {
                    ok: !result.is_error,
                    exit_code: status.ok().and_then(|s| s.code()),
                    session_id: result.session_id,
                    result_text: result.result,
                    error: if result.is_error { Some("agent reported is_error".to_string()) } else { None },
                    bytes_received,
                }),
                None => Err(format!("no result object on stdout; stderr tail: {stderr_tail}")),
            },
        }
    }
}

const TIMEOUT_EXTENSION_POLL: Duration = Duration::from_secs(5);

/// Consume `<signal_dir>/timeout.txt` if present: a bare integer of seconds
/// to extend the in-flight send-prompt deadline by, measured from the
/// moment it's read (spec §4.5/§6). Deleted once read so a stale value
/// can't re-extend the deadline on a later task.
fn read_timeout_extension(signal_dir: &Path) -> Option<Duration> {
    let path = signal_dir.join("timeout.txt");
    let contents = std::fs::read_to_string(&path).ok()?;
    let _ = std::fs::remove_file(&path);
    contents.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Locate the last JSON object on a line whose top-level `type` is
/// `"result"`. Agent stdout may interleave progress/thinking lines; this
/// only needs to find the one line that is itself the result object.
fn extract_trailing_json(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        Some(trimmed.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_trailing_json_recognizes_object_line() {
        let line = r#"{"type":"result","is_error":false,"result":"ok","session_id":"abc"}"#;
        assert!(extract_trailing_json(line).is_some());
    }

    #[test]
    fn extract_trailing_json_ignores_progress_line() {
        assert!(extract_trailing_json("thinking about the task...").is_none());
    }

    #[test]
    fn agent_result_parses_result_object() {
        let line = r#"{"type":"result","is_error":false,"result":"done","session_id":"s1"}"#;
        let parsed: AgentResult = serde_json::from_str(line).unwrap();
        assert!(!parsed.is_error);
        assert_eq!(parsed.result, "done");
    }

    #[test]
    fn timeout_extension_is_read_once_then_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("timeout.txt"), "900\n").unwrap();

        let extended = read_timeout_extension(dir.path());
        assert_eq!(extended, Some(Duration::from_secs(900)));
        assert!(!dir.path().join("timeout.txt").exists());
        assert_eq!(read_timeout_extension(dir.path()), None);
    }

    #[test]
    fn malformed_timeout_extension_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("timeout.txt"), "not-a-number").unwrap();
        assert_eq!(read_timeout_extension(dir.path()), None);
    }
}
