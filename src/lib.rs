//! Trunkline - coordinate parallel coding workers and land their work on
//! trunk one change at a time.

pub mod ci;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod failure;
pub mod paths;
pub mod phase;
pub mod progress;
pub mod queue;
pub mod state;
pub mod subprocess;
pub mod task;
pub mod telemetry;
pub mod template;
pub mod vcs;
pub mod verify;
