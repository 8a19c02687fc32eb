//! Worker runtime — executes assigned tasks and reports through the store.
//!
//! Core components:
//! - `runner` — WorkerRunner (register, heartbeat, poll, execute, report)
//! - `executor` — Executor trait and ProgressReporter
//! - `shell` — ShellExecutor, runs a command per task

pub mod executor;
pub mod runner;
pub mod shell;

pub use executor::{Executor, ProgressReporter};
pub use runner::{RunnerExit, WorkerRunner};
pub use shell::ShellExecutor;
