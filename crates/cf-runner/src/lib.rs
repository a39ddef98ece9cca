//! Multi-lane orchestration: dependency ordering across lanes, per-lane
//! execution against an isolated worktree, and exit-code aggregation.

pub mod dag;
pub mod lane_runner;
pub mod orchestrator;
