//! Atomic, lock-guarded persistence for a lane's `state.json` and its
//! append-only `conversation.jsonl` log.
//!
//! Writes go through a temp file + rename so a reader never observes a
//! half-written file, and through [`lockfile::acquire`] so two processes
//! (the lane runner and, say, a `cursorflow signal` CLI invocation) never
//! interleave writes. A `.backup` copy is kept alongside `state.json` and
//! used as a fallback if the primary file is missing or fails to parse.

use crate::lockfile::{self, LockError};
use crate::types::{ConversationEntry, LaneState};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
    #[error("state file missing: {0}")]
    Missing(PathBuf),
}

/// Persistence for a single lane's run directory.
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join("state.json.backup")
    }

    pub fn conversation_path(&self) -> PathBuf {
        self.dir.join("conversation.jsonl")
    }

    /// Write `state.json` without taking the lock. Callers that already
    /// hold a lock (e.g. inside [`StateStore::update_atomic`]) use this to
    /// avoid deadlocking on themselves.
    fn write_unlocked(&self, state: &LaneState) -> Result<(), StateStoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StateStoreError::Io {
            path: self.dir.clone(),
            source: e,
        })?;

        let path = self.state_path();
        // Keep the previous good copy around before we clobber it.
        if path.exists() {
            let _ = std::fs::copy(&path, self.backup_path());
        }

        let json = serde_json::to_vec_pretty(state).map_err(|e| StateStoreError::Parse {
            path: path.clone(),
            source: e,
        })?;
        write_atomic(&path, &json)
    }

    /// Acquire the per-path lock, then write `state.json` atomically.
    pub fn save_with_lock(&self, state: &LaneState) -> Result<(), StateStoreError> {
        let _lock = lockfile::acquire(&self.state_path())?;
        self.write_unlocked(state)
    }

    /// Read-modify-write `state.json` under the lock, so concurrent
    /// `complete_task`/`mark_failed` calls from different processes never
    /// clobber each other.
    pub fn update_atomic<F>(&self, f: F) -> Result<LaneState, StateStoreError>
    where
        F: FnOnce(&mut LaneState),
    {
        let _lock = lockfile::acquire(&self.state_path())?;
        let mut state = self.load_unlocked()?;
        f(&mut state);
        self.write_unlocked(&state)?;
        Ok(state)
    }

    fn load_unlocked(&self) -> Result<LaneState, StateStoreError> {
        let path = self.state_path();
        match read_json(&path) {
            Ok(state) => Ok(state),
            Err(primary_err) => {
                let backup = self.backup_path();
                if backup.exists() {
                    tracing::warn!(path = %path.display(), "state.json unreadable, falling back to backup");
                    read_json(&backup)
                } else {
                    Err(primary_err)
                }
            }
        }
    }

    /// Load `state.json`, falling back to `state.json.backup` on a missing
    /// or corrupt primary file.
    pub fn load(&self) -> Result<LaneState, StateStoreError> {
        self.load_unlocked()
    }

    /// Whether the on-disk state needs recovery: missing, unparseable, or
    /// failing its own invariant checks.
    pub fn needs_recovery(&self) -> bool {
        match self.load() {
            Ok(state) => !state.validate().is_empty(),
            Err(_) => true,
        }
    }

    /// Append one entry to `conversation.jsonl`.
    pub fn append_conversation(&self, entry: &ConversationEntry) -> Result<(), StateStoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StateStoreError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let path = self.conversation_path();
        let mut line = serde_json::to_string(entry).map_err(|e| StateStoreError::Parse {
            path: path.clone(),
            source: e,
        })?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StateStoreError::Io {
                path: path.clone(),
                source: e,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|e| StateStoreError::Io {
                path: path.clone(),
                source: e,
            })
    }

    /// Read the full conversation log, skipping any trailing malformed line
    /// left by a crash mid-write.
    pub fn read_conversation(&self) -> Result<Vec<ConversationEntry>, StateStoreError> {
        let path = self.conversation_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| StateStoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ConversationEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed conversation line");
                }
            }
        }
        Ok(entries)
    }
}

fn read_json(path: &Path) -> Result<LaneState, StateStoreError> {
    if !path.exists() {
        return Err(StateStoreError::Missing(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| StateStoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| StateStoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Write `bytes` to `path` via a sibling temp file + rename, so a crash
/// mid-write never leaves a half-written file at `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateStoreError> {
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        let mut tmp = std::fs::File::create(&tmp_path).map_err(|e| StateStoreError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        tmp.write_all(bytes).map_err(|e| StateStoreError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
        tmp.sync_all().map_err(|e| StateStoreError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| StateStoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
