//! Operator surface: submission, inspection and manual intervention.
//!
//! Every mutation is a conditional update against the record just read. A
//! loop or worker that moved the record first wins; the operator sees
//! `InvalidTransition` and can look again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DependencyError, Error, FleetError, Result};
use crate::fleet::graph::DependencyGraph;
use crate::fleet::loop_health::{HealthBoard, LoopReport, LoopState};
use crate::fleet::model::{Conflict, MAX_PRIORITY, MIN_PRIORITY, Task};
use crate::fleet::scope;
use crate::fleet::state::{ConflictStatus, TaskStatus, WorkerStatus};
use crate::store::{
    ConflictExpectation, ConflictPatch, Store, TaskExpectation, TaskPatch, TaskQuery, TaskUpdate,
    WorkerExpectation, WorkerPatch,
};

/// Default page size for `list_tasks`.
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Aggregate view of the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub workers: BTreeMap<WorkerStatus, u64>,
    pub tasks: BTreeMap<TaskStatus, u64>,
    pub unresolved_conflicts: usize,
    /// Dependencies that will not release on their own.
    #[serde(serialize_with = "serialize_display")]
    pub dependency_errors: Vec<DependencyError>,
    /// Empty when no control loops run in this process.
    pub loops: Vec<LoopReport>,
    pub health: LoopState,
}

fn serialize_display<S>(errors: &[DependencyError], s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.collect_seq(errors.iter().map(|e| e.to_string()))
}

/// What `reset` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub tasks_requeued: usize,
    pub workers_offline: usize,
}

pub struct FleetOps {
    store: Arc<dyn Store>,
    board: Option<Arc<HealthBoard>>,
}

impl FleetOps {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, board: None }
    }

    /// Include control-loop health in `fleet_status`.
    pub fn with_health(mut self, board: Arc<HealthBoard>) -> Self {
        self.board = Some(board);
        self
    }

    /// Submit one task. Returns its id.
    pub async fn add_task(&self, task: Task) -> Result<Uuid> {
        let ids = self.add_tasks(vec![task]).await?;
        Ok(ids[0])
    }

    /// Submit a batch as one unit. Tasks may depend on each other. The batch
    /// is rejected whole if any dependency is unknown, terminal-failed, or
    /// closes a cycle.
    pub async fn add_tasks(&self, tasks: Vec<Task>) -> Result<Vec<Uuid>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let existing = self.store.query_tasks(&TaskQuery::all()).await?;
        let graph = DependencyGraph::new(existing);
        graph.validate_submission(&tasks)?;

        let batch: Vec<Task> = tasks
            .into_iter()
            .map(|task| prepare(task, &graph))
            .collect();
        self.store.create_tasks(&batch).await?;

        for task in &batch {
            info!(
                task_id = %task.id,
                title = %task.title,
                priority = task.priority,
                status = %task.status,
                "Task submitted"
            );
        }
        Ok(batch.iter().map(|t| t.id).collect())
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| FleetError::TaskNotFound { id }.into())
    }

    /// Tasks in `status` (all when `None`), most urgent first.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>> {
        let query = match status {
            Some(s) => TaskQuery::with_status(s),
            None => TaskQuery::all(),
        }
        .limit(limit.unwrap_or(DEFAULT_LIST_LIMIT));
        Ok(self.store.query_tasks(&query).await?)
    }

    pub async fn list_conflicts(&self, unresolved_only: bool) -> Result<Vec<Conflict>> {
        Ok(self.store.list_conflicts(unresolved_only).await?)
    }

    pub async fn fleet_status(&self) -> Result<FleetStatus> {
        let mut workers = BTreeMap::new();
        for worker in self.store.list_workers().await? {
            *workers.entry(worker.status).or_insert(0) += 1;
        }
        let tasks = self.store.count_tasks_by_status().await?;
        let unresolved_conflicts = self.store.list_conflicts(true).await?.len();
        let graph = DependencyGraph::new(self.store.query_tasks(&TaskQuery::all()).await?);

        let (loops, health) = match &self.board {
            Some(board) => (board.reports(), board.overall()),
            None => (Vec::new(), LoopState::Healthy),
        };

        Ok(FleetStatus {
            workers,
            tasks,
            unresolved_conflicts,
            dependency_errors: graph.dependency_errors(),
            loops,
            health,
        })
    }

    /// Cancel a live task. A worker running it drops the execution on its
    /// next check.
    pub async fn cancel_task(&self, id: Uuid) -> Result<Task> {
        let task = self.get_task(id).await?;
        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(invalid("task", id, task.status, TaskStatus::Cancelled));
        }
        let applied = self
            .store
            .conditional_update_task(
                id,
                &TaskExpectation::status(task.status).at_version(task.version),
                &TaskPatch::new()
                    .status(TaskStatus::Cancelled)
                    .completed_at(Utc::now())
                    .unblock_processed(false),
            )
            .await?;
        if !applied.is_applied() {
            let now = self.get_task(id).await?;
            return Err(invalid("task", id, now.status, TaskStatus::Cancelled));
        }
        info!(task_id = %id, from = %task.status, "Task cancelled");
        self.get_task(id).await
    }

    /// Drop dependencies that can never complete (unknown, failed or
    /// cancelled) so the task can run.
    pub async fn unblock_task(&self, id: Uuid) -> Result<Task> {
        let graph = DependencyGraph::new(self.store.query_tasks(&TaskQuery::all()).await?);
        let task = graph
            .get(id)
            .cloned()
            .ok_or(FleetError::TaskNotFound { id })?;
        if task.status != TaskStatus::Blocked {
            return Err(invalid("task", id, task.status, TaskStatus::Pending));
        }

        let dropped: BTreeSet<Uuid> = task
            .blocked_by
            .iter()
            .copied()
            .filter(|dep| {
                graph
                    .get(*dep)
                    .is_none_or(|d| matches!(d.status, TaskStatus::Failed | TaskStatus::Cancelled))
            })
            .collect();
        let blocked_by: BTreeSet<Uuid> = task
            .blocked_by
            .iter()
            .copied()
            .filter(|dep| {
                !dropped.contains(dep)
                    && graph.get(*dep).is_some_and(|d| d.status != TaskStatus::Completed)
            })
            .collect();
        if dropped.is_empty() && !blocked_by.is_empty() {
            return Err(invalid("task", id, task.status, TaskStatus::Pending));
        }
        let depends_on: BTreeSet<Uuid> = task.depends_on.difference(&dropped).copied().collect();

        let mut patch = TaskPatch::new()
            .depends_on(depends_on)
            .blocked_by(blocked_by.clone());
        if blocked_by.is_empty() {
            patch = patch.status(TaskStatus::Pending);
        }
        let applied = self
            .store
            .conditional_update_task(
                id,
                &TaskExpectation::status(TaskStatus::Blocked).at_version(task.version),
                &patch,
            )
            .await?;
        if !applied.is_applied() {
            let now = self.get_task(id).await?;
            return Err(invalid("task", id, now.status, TaskStatus::Pending));
        }
        info!(task_id = %id, dropped = dropped.len(), remaining = blocked_by.len(), "Task unblocked by operator");
        self.get_task(id).await
    }

    /// Put a failed task back in the queue.
    pub async fn retry_task(&self, id: Uuid) -> Result<Task> {
        let task = self.get_task(id).await?;
        if task.status != TaskStatus::Failed {
            return Err(invalid("task", id, task.status, TaskStatus::Pending));
        }
        let applied = self
            .store
            .conditional_update_task(
                id,
                &TaskExpectation::status(TaskStatus::Failed).at_version(task.version),
                &requeue_patch(),
            )
            .await?;
        if !applied.is_applied() {
            let now = self.get_task(id).await?;
            return Err(invalid("task", id, now.status, TaskStatus::Pending));
        }
        info!(task_id = %id, "Task retried");
        self.get_task(id).await
    }

    pub async fn resolve_conflict(&self, id: Uuid, note: Option<String>) -> Result<Conflict> {
        self.close_conflict(
            id,
            ConflictExpectation::unresolved(),
            ConflictPatch::new()
                .status(ConflictStatus::Resolved)
                .resolution(note)
                .resolved_at(Utc::now()),
            ConflictStatus::Resolved,
        )
        .await
    }

    pub async fn escalate_conflict(&self, id: Uuid, note: Option<String>) -> Result<Conflict> {
        self.close_conflict(
            id,
            ConflictExpectation::any_status([ConflictStatus::Detected, ConflictStatus::Resolving]),
            ConflictPatch::new()
                .status(ConflictStatus::Escalated)
                .resolution(note),
            ConflictStatus::Escalated,
        )
        .await
    }

    async fn close_conflict(
        &self,
        id: Uuid,
        expect: ConflictExpectation,
        patch: ConflictPatch,
        target: ConflictStatus,
    ) -> Result<Conflict> {
        let current = self
            .store
            .get_conflict(id)
            .await?
            .ok_or(FleetError::ConflictNotFound { id })?;
        let applied = self
            .store
            .conditional_update_conflict(id, &expect, &patch)
            .await?;
        if !applied.is_applied() {
            return Err(FleetError::InvalidTransition {
                entity: "conflict".into(),
                id,
                from: current.status.to_string(),
                to: target.to_string(),
            }
            .into());
        }
        info!(conflict_id = %id, status = %target, "Conflict updated");
        self.store
            .get_conflict(id)
            .await?
            .ok_or_else(|| FleetError::ConflictNotFound { id }.into())
    }

    /// Requeue every assigned, in-progress and failed task and take every
    /// worker offline. For recovering a fleet after an unclean stop.
    pub async fn reset(&self) -> Result<ResetReport> {
        let stuck = self
            .store
            .query_tasks(&TaskQuery::with_statuses([
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Failed,
            ]))
            .await?;
        let updates: Vec<TaskUpdate> = stuck
            .iter()
            .map(|t| TaskUpdate {
                id: t.id,
                expect: TaskExpectation::status(t.status).at_version(t.version),
                patch: requeue_patch(),
            })
            .collect();
        let outcomes = self.store.bulk_conditional_update_tasks(&updates).await?;
        let tasks_requeued = outcomes.iter().filter(|o| o.is_applied()).count();
        if tasks_requeued < updates.len() {
            warn!(
                skipped = updates.len() - tasks_requeued,
                "Some tasks changed during reset and were left alone"
            );
        }

        let mut workers_offline = 0;
        for worker in self.store.list_workers().await? {
            if worker.status == WorkerStatus::Offline {
                continue;
            }
            let outcome = self
                .store
                .conditional_update_worker(
                    worker.id,
                    &WorkerExpectation::status(worker.status),
                    &WorkerPatch::new()
                        .status(WorkerStatus::Offline)
                        .current_task(None),
                )
                .await?;
            if outcome.is_applied() {
                workers_offline += 1;
            }
        }

        info!(tasks_requeued, workers_offline, "Fleet reset");
        Ok(ResetReport {
            tasks_requeued,
            workers_offline,
        })
    }
}

/// Normalize a submitted task: clamp priority, normalize its scope and
/// block it only on dependencies that have not completed yet.
fn prepare(mut task: Task, graph: &DependencyGraph) -> Task {
    task.priority = task.priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    task.file_scope = task
        .file_scope
        .iter()
        .map(|p| scope::normalize(p))
        .collect();
    task.blocked_by = task
        .depends_on
        .iter()
        .copied()
        .filter(|dep| {
            graph
                .get(*dep)
                .is_none_or(|d| d.status != TaskStatus::Completed)
        })
        .collect();
    task.status = if task.blocked_by.is_empty() {
        TaskStatus::Pending
    } else {
        TaskStatus::Blocked
    };
    task.assigned_to = None;
    task.assigned_at = None;
    task.started_at = None;
    task.completed_at = None;
    task.unblock_processed = false;
    task.version = 0;
    task
}

fn requeue_patch() -> TaskPatch {
    TaskPatch::new()
        .status(TaskStatus::Pending)
        .unassign()
        .error_message(None)
        .unblock_processed(false)
}

fn invalid(entity: &str, id: Uuid, from: TaskStatus, to: TaskStatus) -> Error {
    FleetError::InvalidTransition {
        entity: entity.into(),
        id,
        from: from.to_string(),
        to: to.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::model::{ConflictType, Worker};
    use crate::store::LibSqlBackend;

    async fn ops() -> (Arc<dyn Store>, FleetOps) {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (Arc::clone(&store), FleetOps::new(store))
    }

    async fn force(store: &Arc<dyn Store>, id: Uuid, status: TaskStatus) {
        store
            .conditional_update_task(id, &TaskExpectation::default(), &TaskPatch::new().status(status))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn submission_blocks_on_unfinished_dependencies() {
        let (store, ops) = ops().await;
        let done = Task::new("done");
        ops.add_task(done.clone()).await.unwrap();
        force(&store, done.id, TaskStatus::Completed).await;
        let open = Task::new("open");
        ops.add_task(open.clone()).await.unwrap();

        let after_done = Task::new("after done").with_depends_on([done.id]);
        let after_both = Task::new("after both")
            .with_depends_on([done.id, open.id])
            .with_file_scope(["./src//auth.py"]);
        ops.add_tasks(vec![after_done.clone(), after_both.clone()])
            .await
            .unwrap();

        let a = ops.get_task(after_done.id).await.unwrap();
        assert_eq!(a.status, TaskStatus::Pending);
        assert!(a.blocked_by.is_empty());
        let b = ops.get_task(after_both.id).await.unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);
        assert_eq!(b.blocked_by, BTreeSet::from([open.id]));
        assert!(b.file_scope.contains("src/auth.py"));
    }

    #[tokio::test]
    async fn cyclic_batch_is_rejected_whole() {
        let (store, ops) = ops().await;
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let a = Task::new("A").with_id(a_id).with_depends_on([b_id]);
        let b = Task::new("B").with_id(b_id).with_depends_on([a_id]);

        let err = ops.add_tasks(vec![a, b]).await.unwrap_err();
        assert!(matches!(err, Error::Dependency(DependencyError::Cycle { .. })));
        assert!(store.query_tasks(&TaskQuery::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let (_store, ops) = ops().await;
        let task = Task::new("orphan").with_depends_on([Uuid::new_v4()]);
        let err = ops.add_task(task).await.unwrap_err();
        assert!(matches!(err, Error::Dependency(DependencyError::Missing { .. })));
    }

    #[tokio::test]
    async fn list_tasks_filters_and_limits() {
        let (_store, ops) = ops().await;
        for i in 0..25 {
            ops.add_task(Task::new(format!("t{i}"))).await.unwrap();
        }
        assert_eq!(ops.list_tasks(None, None).await.unwrap().len(), DEFAULT_LIST_LIMIT);
        assert_eq!(
            ops.list_tasks(Some(TaskStatus::Pending), Some(5)).await.unwrap().len(),
            5
        );
        assert!(ops.list_tasks(Some(TaskStatus::Failed), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_is_terminal() {
        let (_store, ops) = ops().await;
        let id = ops.add_task(Task::new("doomed")).await.unwrap();
        let cancelled = ops.cancel_task(id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let err = ops.cancel_task(id).await.unwrap_err();
        assert!(matches!(err, Error::Fleet(FleetError::InvalidTransition { .. })));
        assert!(matches!(
            ops.cancel_task(Uuid::new_v4()).await.unwrap_err(),
            Error::Fleet(FleetError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn failed_dependency_is_reported_then_unblocked() {
        let (store, ops) = ops().await;
        let dep = Task::new("dep");
        let next = Task::new("next").with_depends_on([dep.id]);
        ops.add_tasks(vec![dep.clone(), next.clone()]).await.unwrap();
        force(&store, dep.id, TaskStatus::Failed).await;

        let status = ops.fleet_status().await.unwrap();
        assert_eq!(status.dependency_errors.len(), 1);
        assert!(matches!(
            status.dependency_errors[0],
            DependencyError::TerminalDependency { .. }
        ));

        let unblocked = ops.unblock_task(next.id).await.unwrap();
        assert_eq!(unblocked.status, TaskStatus::Pending);
        assert!(unblocked.blocked_by.is_empty());
        assert!(unblocked.depends_on.is_empty());
        assert!(ops.fleet_status().await.unwrap().dependency_errors.is_empty());
    }

    #[tokio::test]
    async fn unblock_refuses_healthy_dependencies() {
        let (_store, ops) = ops().await;
        let dep = Task::new("dep");
        let next = Task::new("next").with_depends_on([dep.id]);
        ops.add_tasks(vec![dep, next.clone()]).await.unwrap();
        assert!(ops.unblock_task(next.id).await.is_err());
    }

    #[tokio::test]
    async fn retry_requeues_failed_task() {
        let (store, ops) = ops().await;
        let id = ops.add_task(Task::new("flaky")).await.unwrap();
        store
            .conditional_update_task(
                id,
                &TaskExpectation::default(),
                &TaskPatch::new()
                    .status(TaskStatus::Failed)
                    .assign(Uuid::new_v4(), Utc::now())
                    .error_message(Some("boom".into())),
            )
            .await
            .unwrap();

        let task = ops.retry_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.assigned_to, None);
        assert_eq!(task.error_message, None);
        assert!(ops.retry_task(id).await.is_err());
    }

    #[tokio::test]
    async fn conflicts_resolve_and_escalate() {
        let (store, ops) = ops().await;
        let first = Conflict::new(ConflictType::FileOverlap, Utc::now());
        let second = Conflict::new(ConflictType::FileOverlap, Utc::now());
        store.create_conflict(&first).await.unwrap();
        store.create_conflict(&second).await.unwrap();

        let resolved = ops
            .resolve_conflict(first.id, Some("merged by hand".into()))
            .await
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);
        assert_eq!(resolved.resolution.as_deref(), Some("merged by hand"));
        assert!(resolved.resolved_at.is_some());
        assert!(ops.resolve_conflict(first.id, None).await.is_err());

        let escalated = ops.escalate_conflict(second.id, None).await.unwrap();
        assert_eq!(escalated.status, ConflictStatus::Escalated);
        // Escalated still counts as unresolved and can be resolved later.
        assert_eq!(ops.fleet_status().await.unwrap().unresolved_conflicts, 1);
        ops.resolve_conflict(second.id, None).await.unwrap();
        assert_eq!(ops.fleet_status().await.unwrap().unresolved_conflicts, 0);
    }

    #[tokio::test]
    async fn reset_requeues_and_takes_workers_offline() {
        let (store, ops) = ops().await;
        let running = ops.add_task(Task::new("running")).await.unwrap();
        let failed = ops.add_task(Task::new("failed")).await.unwrap();
        let done = ops.add_task(Task::new("done")).await.unwrap();
        force(&store, running, TaskStatus::InProgress).await;
        force(&store, failed, TaskStatus::Failed).await;
        force(&store, done, TaskStatus::Completed).await;
        store.create_worker(&Worker::new("runner-1", "shell")).await.unwrap();

        let report = ops.reset().await.unwrap();
        assert_eq!(
            report,
            ResetReport {
                tasks_requeued: 2,
                workers_offline: 1
            }
        );
        assert_eq!(ops.get_task(running).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(ops.get_task(done).await.unwrap().status, TaskStatus::Completed);
        let status = ops.fleet_status().await.unwrap();
        assert_eq!(status.workers.get(&WorkerStatus::Offline), Some(&1));
    }
}
