//! `Store` trait — single async interface over the five fleet collections.
//!
//! Every status change goes through a conditional update: the caller states
//! what it expects the record to look like and the write only lands if the
//! record still matches. That is the only concurrency control the control
//! loops and workers share.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::fleet::model::{ActivityEvent, Conflict, FileChange, Task, Worker};
use crate::fleet::state::{ConflictStatus, TaskStatus, WorkerStatus};

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The record matched and was written.
    Applied,
    /// The record changed (or vanished) since it was read. Nothing was written.
    Conflict,
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Task search predicate. Results are always ordered by priority
/// descending, then creation time, then insertion order.
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    /// Empty means any status.
    pub statuses: Vec<TaskStatus>,
    pub assigned_to: Option<Uuid>,
    pub limit: Option<usize>,
}

impl TaskQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn with_statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn assigned_to(mut self, worker_id: Uuid) -> Self {
        self.assigned_to = Some(worker_id);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Expected prior state of a task for a conditional update.
///
/// Unset fields are not checked.
#[derive(Debug, Clone, Default)]
pub struct TaskExpectation {
    /// The current status must be one of these.
    pub statuses: Vec<TaskStatus>,
    /// `Some(None)` requires the task to be unassigned.
    pub assigned_to: Option<Option<Uuid>>,
    pub version: Option<u64>,
}

impl TaskExpectation {
    pub fn status(status: TaskStatus) -> Self {
        Self::any_status([status])
    }

    pub fn any_status(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn version(version: u64) -> Self {
        Self {
            version: Some(version),
            ..Self::default()
        }
    }

    pub fn assigned_to(mut self, worker_id: Uuid) -> Self {
        self.assigned_to = Some(Some(worker_id));
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.assigned_to = Some(None);
        self
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

/// Fields to write on a task. Unset fields are left alone; `Some(None)`
/// clears a nullable column.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<Option<Uuid>>,
    pub assigned_at: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub depends_on: Option<BTreeSet<Uuid>>,
    pub blocked_by: Option<BTreeSet<Uuid>>,
    pub result_summary: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<Decimal>,
    pub duration_ms: Option<u64>,
    pub unblock_processed: Option<bool>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assign(mut self, worker_id: Uuid, at: DateTime<Utc>) -> Self {
        self.assigned_to = Some(Some(worker_id));
        self.assigned_at = Some(Some(at));
        self
    }

    /// Clear the assignment and start time so the task can be picked up again.
    pub fn unassign(mut self) -> Self {
        self.assigned_to = Some(None);
        self.assigned_at = Some(None);
        self.started_at = Some(None);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(Some(at));
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(Some(at));
        self
    }

    pub fn depends_on(mut self, deps: BTreeSet<Uuid>) -> Self {
        self.depends_on = Some(deps);
        self
    }

    pub fn blocked_by(mut self, blockers: BTreeSet<Uuid>) -> Self {
        self.blocked_by = Some(blockers);
        self
    }

    pub fn result_summary(mut self, summary: impl Into<String>) -> Self {
        self.result_summary = Some(Some(summary.into()));
        self
    }

    pub fn error_message(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn usage(mut self, tokens_used: u64, cost_usd: Decimal, duration_ms: u64) -> Self {
        self.tokens_used = Some(tokens_used);
        self.cost_usd = Some(cost_usd);
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn unblock_processed(mut self, processed: bool) -> Self {
        self.unblock_processed = Some(processed);
        self
    }
}

/// One item of a bulk conditional update.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub id: Uuid,
    pub expect: TaskExpectation,
    pub patch: TaskPatch,
}

/// Expected prior state of a worker for a conditional update.
#[derive(Debug, Clone, Default)]
pub struct WorkerExpectation {
    pub statuses: Vec<WorkerStatus>,
    /// `Some(None)` requires no current task.
    pub current_task_id: Option<Option<Uuid>>,
    /// The last heartbeat must be strictly older than this.
    pub heartbeat_before: Option<DateTime<Utc>>,
    pub version: Option<u64>,
}

impl WorkerExpectation {
    pub fn status(status: WorkerStatus) -> Self {
        Self::any_status([status])
    }

    pub fn any_status(statuses: impl IntoIterator<Item = WorkerStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Any status except `offline`.
    pub fn live() -> Self {
        Self::any_status([
            WorkerStatus::Idle,
            WorkerStatus::Working,
            WorkerStatus::Paused,
            WorkerStatus::Error,
        ])
    }

    pub fn current_task(mut self, task_id: Option<Uuid>) -> Self {
        self.current_task_id = Some(task_id);
        self
    }

    pub fn heartbeat_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.heartbeat_before = Some(cutoff);
        self
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

/// Fields to write on a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerPatch {
    pub status: Option<WorkerStatus>,
    pub current_task_id: Option<Option<Uuid>>,
    pub last_completed_task_id: Option<Option<Uuid>>,
    pub tasks_completed: Option<u64>,
    pub tasks_failed: Option<u64>,
    pub total_tokens_used: Option<u64>,
    pub total_cost_usd: Option<Decimal>,
}

impl WorkerPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: WorkerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_task(mut self, task_id: Option<Uuid>) -> Self {
        self.current_task_id = Some(task_id);
        self
    }

    pub fn last_completed(mut self, task_id: Uuid) -> Self {
        self.last_completed_task_id = Some(Some(task_id));
        self
    }

    /// Overwrite all cumulative counters. Pair with a version expectation.
    pub fn counters(
        mut self,
        completed: u64,
        failed: u64,
        tokens: u64,
        cost: Decimal,
    ) -> Self {
        self.tasks_completed = Some(completed);
        self.tasks_failed = Some(failed);
        self.total_tokens_used = Some(tokens);
        self.total_cost_usd = Some(cost);
        self
    }
}

/// Expected prior state of a conflict.
#[derive(Debug, Clone, Default)]
pub struct ConflictExpectation {
    pub statuses: Vec<ConflictStatus>,
    pub version: Option<u64>,
}

impl ConflictExpectation {
    pub fn any_status(statuses: impl IntoIterator<Item = ConflictStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            version: None,
        }
    }

    /// Detected, resolving or escalated.
    pub fn unresolved() -> Self {
        Self::any_status([
            ConflictStatus::Detected,
            ConflictStatus::Resolving,
            ConflictStatus::Escalated,
        ])
    }
}

/// Fields to write on a conflict.
#[derive(Debug, Clone, Default)]
pub struct ConflictPatch {
    pub status: Option<ConflictStatus>,
    pub resolution: Option<Option<String>>,
    pub resolved_at: Option<Option<DateTime<Utc>>>,
}

impl ConflictPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: ConflictStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn resolution(mut self, note: Option<String>) -> Self {
        self.resolution = Some(note);
        self
    }

    pub fn resolved_at(mut self, at: DateTime<Utc>) -> Self {
        self.resolved_at = Some(Some(at));
        self
    }
}

/// Backend-agnostic store for tasks, workers, activity, file changes and conflicts.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Insert a batch of tasks. Either all rows land or none do.
    async fn create_tasks(&self, tasks: &[Task]) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Search tasks.
    async fn query_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks whose `depends_on` contains `id`.
    async fn list_dependents(&self, id: Uuid) -> Result<Vec<Task>, DatabaseError>;

    /// Number of tasks in each status. Statuses with no tasks are omitted.
    async fn count_tasks_by_status(&self) -> Result<BTreeMap<TaskStatus, u64>, DatabaseError>;

    /// Apply `patch` only if the task matches `expect`.
    async fn conditional_update_task(
        &self,
        id: Uuid,
        expect: &TaskExpectation,
        patch: &TaskPatch,
    ) -> Result<UpdateOutcome, DatabaseError>;

    /// Apply independent conditional updates. One outcome per item, in order.
    async fn bulk_conditional_update_tasks(
        &self,
        updates: &[TaskUpdate],
    ) -> Result<Vec<UpdateOutcome>, DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Register a worker.
    async fn create_worker(&self, worker: &Worker) -> Result<(), DatabaseError>;

    /// Get a worker by ID.
    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>, DatabaseError>;

    /// All workers, ordered by id.
    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError>;

    /// Apply `patch` only if the worker matches `expect`.
    async fn conditional_update_worker(
        &self,
        id: Uuid,
        expect: &WorkerExpectation,
        patch: &WorkerPatch,
    ) -> Result<UpdateOutcome, DatabaseError>;

    /// Refresh `last_heartbeat`. Rejected for offline or unknown workers.
    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<UpdateOutcome, DatabaseError>;

    // ── Activity & file changes ─────────────────────────────────────

    /// Append an activity event.
    async fn record_event(&self, event: &ActivityEvent) -> Result<(), DatabaseError>;

    /// Most recent events first.
    async fn list_events(&self, limit: usize) -> Result<Vec<ActivityEvent>, DatabaseError>;

    /// Append a file change.
    async fn record_file_change(&self, change: &FileChange) -> Result<(), DatabaseError>;

    /// File changes at or after `since`, oldest first.
    async fn list_file_changes_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FileChange>, DatabaseError>;

    // ── Conflicts ───────────────────────────────────────────────────

    /// Insert a conflict.
    async fn create_conflict(&self, conflict: &Conflict) -> Result<(), DatabaseError>;

    /// Get a conflict by ID.
    async fn get_conflict(&self, id: Uuid) -> Result<Option<Conflict>, DatabaseError>;

    /// Conflicts ordered by detection time, optionally only unresolved ones.
    async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<Conflict>, DatabaseError>;

    /// Apply `patch` only if the conflict matches `expect`.
    async fn conditional_update_conflict(
        &self,
        id: Uuid,
        expect: &ConflictExpectation,
        patch: &ConflictPatch,
    ) -> Result<UpdateOutcome, DatabaseError>;
}
