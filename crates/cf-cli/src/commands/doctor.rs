use serde::Serialize;

/// `cursorflow doctor [--json]` -- the standalone health-check surface spec
/// §6 describes alongside the `RUN_DOCTOR` stall action: confirms the agent
/// CLI is on `PATH`, `git` is on `PATH`, and the current directory sits
/// inside a git repository. Exit 0 when every check passes.
#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    ok: bool,
    detail: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    healthy: bool,
    checks: Vec<CheckResult>,
}

pub fn run(json: bool) -> anyhow::Result<i32> {
    let agent_binary = std::env::var("CURSORFLOW_AGENT_BINARY").unwrap_or_else(|_| "cursor-agent".to_string());
    let mut checks = Vec::new();

    checks.push(match super::which(&agent_binary) {
        Some(path) => CheckResult {
            name: "agent_cli".to_string(),
            ok: true,
            detail: format!("found at {}", path.display()),
        },
        None => CheckResult {
            name: "agent_cli".to_string(),
            ok: false,
            detail: format!("'{agent_binary}' not found on PATH"),
        },
    });

    checks.push(match super::which("git") {
        Some(path) => CheckResult {
            name: "git_cli".to_string(),
            ok: true,
            detail: format!("found at {}", path.display()),
        },
        None => CheckResult {
            name: "git_cli".to_string(),
            ok: false,
            detail: "'git' not found on PATH".to_string(),
        },
    });

    let repo_root = std::env::current_dir()?;
    checks.push(match cf_core::git_read::current_branch(&repo_root) {
        Ok(branch) => CheckResult {
            name: "git_repo".to_string(),
            ok: true,
            detail: format!("on branch {branch}"),
        },
        Err(e) => CheckResult {
            name: "git_repo".to_string(),
            ok: false,
            detail: format!("not inside a usable git repository: {e}"),
        },
    });

    let healthy = checks.iter().all(|c| c.ok);
    let report = DoctorReport { healthy, checks };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &report.checks {
            let mark = if check.ok { "ok" } else { "FAIL" };
            println!("[{mark}] {}: {}", check.name, check.detail);
        }
        println!("{}", if healthy { "healthy" } else { "unhealthy" });
    }

    Ok(if healthy { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_only_when_every_check_passes() {
        let all_ok = DoctorReport {
            healthy: true,
            checks: vec![
                CheckResult { name: "a".into(), ok: true, detail: "".into() },
                CheckResult { name: "b".into(), ok: true, detail: "".into() },
            ],
        };
        assert!(all_ok.checks.iter().all(|c| c.ok));

        let one_failed = DoctorReport {
            healthy: false,
            checks: vec![
                CheckResult { name: "a".into(), ok: true, detail: "".into() },
                CheckResult { name: "b".into(), ok: false, detail: "missing".into() },
            ],
        };
        assert!(!one_failed.checks.iter().all(|c| c.ok));
    }

    #[test]
    fn report_serializes_to_json() {
        let report = DoctorReport {
            healthy: false,
            checks: vec![CheckResult { name: "git_cli".into(), ok: false, detail: "not found".into() }],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"healthy\":false"));
        assert!(json.contains("git_cli"));
    }
}
