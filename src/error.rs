//! Error types for CodeFleet.

use std::time::Duration;

use uuid::Uuid;

use crate::fleet::state::TaskStatus;

/// Top-level error type for the fleet core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Store adapter errors.
///
/// Inside a control loop any of these counts as the store being unavailable
/// for that tick.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Dependency graph violations. Rejected at submission, or surfaced to the
/// operator when found on an existing task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    #[error("Task {task_id} depends on itself")]
    SelfDependency { task_id: Uuid },

    #[error("Task {task_id} depends on unknown task {dependency}")]
    Missing { task_id: Uuid, dependency: Uuid },

    #[error("Task {task_id} depends on task {dependency} which is {status}")]
    TerminalDependency {
        task_id: Uuid,
        dependency: Uuid,
        status: TaskStatus,
    },

    #[error("Dependency cycle through {}", format_cycle(.path))]
    Cycle { path: Vec<Uuid> },
}

fn format_cycle(path: &[Uuid]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A conditional update lost to a concurrent writer. Recovered by retrying
/// on the next tick; never shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentError {
    #[error("Assignment of task {task_id} to worker {worker_id} lost a race")]
    Race { task_id: Uuid, worker_id: Uuid },
}

/// Fleet lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Worker {worker_id} silent for {silent_for:?}")]
    WorkerTimeout { worker_id: Uuid, silent_for: Duration },

    #[error("Store unavailable for {consecutive_failures} consecutive cycles")]
    StoreUnavailable { consecutive_failures: u32 },

    #[error("Failed to spawn worker for slot {slot}: {reason}")]
    SpawnFailed { slot: String, reason: String },

    #[error("Slot {slot} exhausted its restart budget ({max})")]
    RestartBudgetExhausted { slot: String, max: u32 },

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Conflict {id} not found")]
    ConflictNotFound { id: Uuid },

    #[error("Cannot move {entity} {id} from {from} to {to}")]
    InvalidTransition {
        entity: String,
        id: Uuid,
        from: String,
        to: String,
    },
}

/// Failures reported by a task executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Task {task_id} failed: {reason}")]
    Failed { task_id: Uuid, reason: String },

    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout { task_id: Uuid, timeout: Duration },

    #[error("Task {task_id} was cancelled")]
    Cancelled { task_id: Uuid },

    #[error("Failed to start executor: {0}")]
    Spawn(String),
}

/// Result type alias for the fleet core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_path() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let err = DependencyError::Cycle { path: vec![a, b, a] };
        assert_eq!(
            err.to_string(),
            format!("Dependency cycle through {a} -> {b} -> {a}")
        );
    }

    #[test]
    fn nested_errors_convert() {
        let err: Error = AssignmentError::Race {
            task_id: Uuid::nil(),
            worker_id: Uuid::nil(),
        }
        .into();
        assert!(matches!(err, Error::Assignment(_)));
        assert!(err.to_string().starts_with("Assignment error:"));
    }
}
