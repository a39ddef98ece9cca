//! Spec §8 scenario 2: a lane with a task that depends on another lane's
//! task waits for it, then merges that lane's pipeline branch in before its
//! own task runs.

mod support;

use cf_core::config::CursorFlowConfig;
use cf_core::state_store::StateStore;
use cf_core::types::{LaneSpec, LaneStatus, TaskSpec};
use cf_runner::lane_runner::{LaneRunner, LaneRunnerArgs, EXIT_SUCCESS};

fn write_lane(path: &std::path::Path, lane: &LaneSpec) {
    std::fs::write(path, serde_json::to_vec_pretty(lane).unwrap()).unwrap();
}

#[tokio::test]
async fn dependent_lane_waits_then_merges_upstream_branch() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_root = support::init_repo(tmp.path());
    let agent = support::write_agent_script(tmp.path(), support::AGENT_SUCCEEDS);
    let run_root = tmp.path().join("run-20260101000000");

    let lane_x = LaneSpec {
        name: "x".to_string(),
        tasks: vec![TaskSpec { name: "build".to_string(), prompt: "build it".to_string(), model: None, timeout: None, depends_on: vec![] }],
        dependency_policy: Default::default(),
        branch_prefix: None,
        model: None,
        timeout: None,
    };
    let tasks_x = tmp.path().join("x.json");
    write_lane(&tasks_x, &lane_x);

    let mut runner_x = LaneRunner::new(LaneRunnerArgs {
        repo_root: repo_root.clone(),
        run_root: run_root.clone(),
        tasks_file: tasks_x,
        lane_name: "x".to_string(),
        agent_binary: agent.to_string_lossy().into_owned(),
        config: CursorFlowConfig::default(),
        start_index: 0,
    });
    assert_eq!(runner_x.run().await, EXIT_SUCCESS);

    let lane_y = LaneSpec {
        name: "y".to_string(),
        tasks: vec![TaskSpec {
            name: "use".to_string(),
            prompt: "use what x built".to_string(),
            model: None,
            timeout: None,
            depends_on: vec!["x:build".to_string()],
        }],
        dependency_policy: Default::default(),
        branch_prefix: None,
        model: None,
        timeout: None,
    };
    let tasks_y = tmp.path().join("y.json");
    write_lane(&tasks_y, &lane_y);

    let mut config = CursorFlowConfig::default();
    config.runner.dependency_poll_secs = 1;
    let mut runner_y = LaneRunner::new(LaneRunnerArgs {
        repo_root: repo_root.clone(),
        run_root: run_root.clone(),
        tasks_file: tasks_y,
        lane_name: "y".to_string(),
        agent_binary: agent.to_string_lossy().into_owned(),
        config,
        start_index: 0,
    });
    let code = runner_y.run().await;
    assert_eq!(code, EXIT_SUCCESS);

    let store_y = StateStore::new(run_root.join("lanes").join("y"));
    let state_y = store_y.load().unwrap();
    assert_eq!(state_y.status, LaneStatus::Completed);
    assert_eq!(state_y.completed_tasks, vec!["use".to_string()]);
    assert!(state_y.waiting_for.is_empty(), "wait list cleared once dependency was satisfied");
}
