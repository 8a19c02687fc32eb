//! Fleet core — task scheduling across a pool of workers.
//!
//! Core components:
//! - `state` — Task, worker and conflict state machines
//! - `model` — Records shared through the store
//! - `graph` — Dependency graph over a task snapshot
//! - `scope` — File-scope overlap
//! - `scheduler` — Auto-assignment loop
//! - `completion` — Unblocks dependents of finished tasks
//! - `health` — Stale-worker recovery
//! - `conflict` — Concurrent-modification detection
//! - `loop_health` — Consecutive store-failure tracking
//! - `controller` — Worker slots and loop lifecycle

pub mod completion;
pub mod conflict;
pub mod controller;
pub mod graph;
pub mod health;
pub mod loop_health;
pub mod model;
pub mod scheduler;
pub mod scope;
pub mod state;

pub use completion::{CompletionHandler, UnblockSender, unblock_channel};
pub use conflict::ConflictDetector;
pub use controller::{FleetController, LocalSpawner, WorkerHandle, WorkerSpawner};
pub use graph::DependencyGraph;
pub use health::HealthMonitor;
pub use loop_health::{HealthBoard, LoopReport, LoopState};
pub use model::{
    ActivityEvent, ChangeType, Complexity, Conflict, ConflictType, EventType, FileChange, Task,
    TaskResult, Worker,
};
pub use scheduler::{ScaleSignal, Scheduler};
pub use state::{ConflictStatus, TaskStatus, WorkerStatus};
