//! Core data model and persistence/git plumbing shared by every CursorFlow
//! component: lane/task types, the lane state store, and the git pipeline
//! coordinator.

pub mod config;
pub mod git_pipeline;
pub mod git_read;
pub mod lockfile;
pub mod state_store;
pub mod types;
