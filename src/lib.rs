//! Taskforge drives a coding agent through a task's phases.
//!
//! A task gets a phase plan from its weight, a git worktree of its own, and
//! a durable record in the state store. The [`supervisor::Supervisor`] takes
//! an execution lease and runs a [`executor::PhaseExecutor`], which invokes
//! the agent until it emits a completion marker, evaluates the phase gate,
//! and commits a checkpoint. Failures are routed back to earlier phases by
//! the [`retry`] policy.

pub mod agent;
pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gates;
pub mod logging;
pub mod plan;
pub mod retry;
pub mod settings;
pub mod signals;
pub mod state;
pub mod supervisor;
pub mod task;

pub use errors::{EngineError, ErrorKind, FailureCause, Result};
pub use supervisor::{Supervisor, TaskSnapshot};
pub use task::{Category, NewTask, Task, TaskStatus, Weight};
