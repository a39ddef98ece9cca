//! Stall detection and the file+signal intervention protocol: monitors
//! agent activity and cadence, escalates through the recovery ladder, and
//! injects intervention messages without losing the agent's conversation.

pub mod detector;
pub mod intervention;
