//! Spec §8 scenario 1: a single lane with two independent tasks runs start
//! to finish against a real git repo and a stub agent that always succeeds.

mod support;

use cf_core::config::CursorFlowConfig;
use cf_core::state_store::StateStore;
use cf_core::types::{LaneSpec, LaneStatus, TaskSpec};
use cf_runner::lane_runner::{LaneRunner, LaneRunnerArgs, EXIT_SUCCESS};

#[tokio::test]
async fn happy_path_two_task_lane_completes() {
    let tmp = tempfile::tempdir().unwrap();
    let repo_root = support::init_repo(tmp.path());
    let agent = support::write_agent_script(tmp.path(), support::AGENT_SUCCEEDS);
    let run_root = tmp.path().join("run-20260101000000");

    let lane = LaneSpec {
        name: "alpha".to_string(),
        tasks: vec![
            TaskSpec { name: "build".to_string(), prompt: "build the thing".to_string(), model: None, timeout: None, depends_on: vec![] },
            TaskSpec { name: "ship".to_string(), prompt: "ship the thing".to_string(), model: None, timeout: None, depends_on: vec![] },
        ],
        dependency_policy: Default::default(),
        branch_prefix: None,
        model: None,
        timeout: None,
    };
    let tasks_file = tmp.path().join("alpha.json");
    std::fs::write(&tasks_file, serde_json::to_vec_pretty(&lane).unwrap()).unwrap();

    let mut runner = LaneRunner::new(LaneRunnerArgs {
        repo_root: repo_root.clone(),
        run_root: run_root.clone(),
        tasks_file,
        lane_name: "alpha".to_string(),
        agent_binary: agent.to_string_lossy().into_owned(),
        config: CursorFlowConfig::default(),
        start_index: 0,
    });

    let code = runner.run().await;
    assert_eq!(code, EXIT_SUCCESS);

    let store = StateStore::new(run_root.join("lanes").join("alpha"));
    let state = store.load().unwrap();
    assert_eq!(state.status, LaneStatus::Completed);
    assert_eq!(state.completed_tasks, vec!["build".to_string(), "ship".to_string()]);
    assert_eq!(state.current_task_index, 2);
    assert!(state.error.is_none());

    let conversation = store.read_conversation().unwrap();
    assert_eq!(conversation.len(), 4, "one user + one assistant entry per task");

    assert!(run_root.join("lanes").join("alpha").join("task-results").join("01-build.txt").exists());
    assert!(run_root.join("lanes").join("alpha").join("task-results").join("02-ship.txt").exists());
}
