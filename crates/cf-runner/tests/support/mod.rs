//! Shared scaffolding for the end-to-end lane-runner scenarios in spec §8:
//! a real git repo with a bare `origin` remote (worktrees and pushes are
//! exercised against real `git`, not a mock), and a stub `cursor-agent`
//! binary driven entirely by a shell script so no real agent is needed.
//!
//! Grounded on `git_read.rs`'s `init_repo` test helper, extended with an
//! `origin` remote since these scenarios exercise real pushes.

use std::path::{Path, PathBuf};
use std::process::Command;

#[allow(dead_code)]
pub fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git").args(args).current_dir(dir).output().expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

/// A working repo at `<root>/work`, with a bare `origin` remote at
/// `<root>/origin.git`, one commit on `main`, already pushed upstream.
#[allow(dead_code)]
pub fn init_repo(root: &Path) -> PathBuf {
    let bare = root.join("origin.git");
    let work = root.join("work");
    std::fs::create_dir_all(&bare).unwrap();
    std::fs::create_dir_all(&work).unwrap();
    git(&bare, &["init", "--bare", "-q", "."]);
    git(&work, &["init", "-q", "."]);
    git(&work, &["config", "user.email", "test@example.com"]);
    git(&work, &["config", "user.name", "Test"]);
    std::fs::write(work.join("README.md"), "seed\n").unwrap();
    git(&work, &["add", "."]);
    git(&work, &["commit", "-q", "-m", "seed"]);
    git(&work, &["branch", "-M", "main"]);
    git(&work, &["remote", "add", "origin", bare.to_str().unwrap()]);
    git(&work, &["push", "-q", "-u", "origin", "main"]);
    work
}

/// Write an executable stub `cursor-agent` to `dir/agent.sh`. `create-chat`
/// always succeeds with a fixed chat id; `body` is the POSIX shell script
/// run for every `send-prompt` invocation, with the prompt already drained
/// from stdin by the time it runs.
#[allow(dead_code)]
pub fn write_agent_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("agent.sh");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"create-chat\" ]; then\n  echo chat-1\n  exit 0\nfi\ncat >/dev/null\n{body}\n"
    );
    std::fs::write(&path, script).unwrap();
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A stub that always answers a task successfully with a fixed result.
#[allow(dead_code)]
pub const AGENT_SUCCEEDS: &str = r#"printf '%s\n' '{"type":"result","session_id":"chat-1","is_error":false,"result":"done"}'"#;

/// A stub that never answers: the stall ticker is expected to kill it.
#[allow(dead_code)]
pub const AGENT_HANGS: &str = "sleep 60";
