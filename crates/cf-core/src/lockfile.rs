//! Advisory per-path file locks for the state store.
//!
//! Mirrors the daemon lockfile's race-safety story (`O_CREAT | O_EXCL`
//! atomic creation, PID-liveness staleness check) but generalized to lock
//! an arbitrary `state.json`-style path instead of a single well-known
//! daemon lockfile. Cross-process coordination is necessary here — lane
//! runners and any CLI tooling reading the same run directory are separate
//! OS processes, so an in-process mutex alone would not serialize writes.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Contents of a `<path>.lock` file: who holds it and since when.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at_ms: u64,
}

/// A held advisory lock on `<path>.lock`. Releases on drop.
pub struct FileLock {
    lock_path: PathBuf,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Error returned when a lock cannot be acquired within the retry budget.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to acquire lock {path}: held by pid {held_by}")]
    Contended { path: PathBuf, held_by: u32 },
    #[error("I/O error acquiring lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const STALE_TIMEOUT_MS: u64 = 10_000;
const RETRY_COUNT: u32 = 50;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Acquire an advisory lock on `<path>.lock`, retrying per spec §4.3 (up to
/// 50 attempts at 100ms, lock considered stale after 10s regardless of
/// whether its holder's PID is alive).
pub fn acquire(path: &Path) -> Result<FileLock, LockError> {
    let lock_path = lock_path_for(path);

    for attempt in 0..RETRY_COUNT {
        match try_create(&lock_path) {
            Ok(()) => return Ok(FileLock { lock_path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(holder) = read_holder(&lock_path) {
                    if is_stale(&holder) || !pid_alive(holder.pid) {
                        tracing::info!(path = %lock_path.display(), pid = holder.pid, "reclaiming stale lock");
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }
                    if attempt + 1 == RETRY_COUNT {
                        return Err(LockError::Contended {
                            path: path.to_path_buf(),
                            held_by: holder.pid,
                        });
                    }
                }
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
    }

    Err(LockError::Contended {
        path: path.to_path_buf(),
        held_by: 0,
    })
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

fn try_create(lock_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at_ms: now_ms(),
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    let json = serde_json::to_string(&holder)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_holder(lock_path: &Path) -> Option<LockHolder> {
    let content = std::fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(&content).ok()
}

fn is_stale(holder: &LockHolder) -> bool {
    now_ms().saturating_sub(holder.acquired_at_ms) > STALE_TIMEOUT_MS
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
