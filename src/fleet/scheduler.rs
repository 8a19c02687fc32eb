//! Scheduler — periodic auto-assignment of runnable tasks to idle workers.
//!
//! Each tick:
//! 1. Fetch runnable tasks, active tasks and idle workers.
//! 2. Hold back runnable tasks whose scope overlaps an active task (or an
//!    unresolved conflict's files).
//! 3. Continuity pass: an idle worker takes the most urgent runnable task
//!    that depends on the task it last completed.
//! 4. Priority pass: remaining idle workers take the most urgent remaining
//!    task they are capable of.
//! 5. Signal the fleet controller when more workers are wanted.
//!
//! Assignment claims the worker first, then the task, each with a
//! conditional update. Losing the task claim releases the worker again.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{AssignmentError, DatabaseError};
use crate::fleet::graph::DependencyGraph;
use crate::fleet::loop_health::LoopHealth;
use crate::fleet::model::{Task, Worker};
use crate::fleet::scope::ScopeSet;
use crate::fleet::state::{TaskStatus, WorkerStatus};
use crate::store::{Store, TaskExpectation, TaskPatch, TaskQuery, WorkerExpectation, WorkerPatch};

/// Request from the scheduler to resize the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleSignal {
    /// Bring the number of live workers to this many.
    ScaleTo(usize),
}

/// How one assignment attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Assigned,
    /// The worker was no longer idle.
    WorkerBusy,
    /// The task was no longer pending and unassigned.
    TaskTaken,
}

/// What a tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `(task, worker)` pairs assigned this tick.
    pub assigned: Vec<(Uuid, Uuid)>,
    /// Runnable tasks held back by a scope overlap.
    pub held: Vec<Uuid>,
    /// Conditional updates lost to a concurrent writer.
    pub races: usize,
    /// Workers wanted: runnable plus in-flight tasks, capped at `max_workers`.
    pub desired_workers: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    scale_tx: Option<mpsc::Sender<ScaleSignal>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            scale_tx: None,
        }
    }

    /// Send scale signals to the fleet controller.
    pub fn with_scale_signals(mut self, tx: mpsc::Sender<ScaleSignal>) -> Self {
        self.scale_tx = Some(tx);
        self
    }

    pub async fn tick(&self) -> Result<TickReport, DatabaseError> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, DatabaseError> {
        let tasks = self
            .store
            .query_tasks(&TaskQuery::with_statuses([
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskStatus::InProgress,
            ]))
            .await?;
        let workers = self.store.list_workers().await?;

        let graph = DependencyGraph::new(tasks);
        let runnable = graph.runnable();
        let in_flight = graph
            .tasks()
            .iter()
            .filter(|t| t.status.is_active())
            .count();

        // Scopes of everything already running.
        let mut claimed = ScopeSet::new();
        for task in graph.tasks().iter().filter(|t| t.status.is_active()) {
            claimed.claim(&task.file_scope);
        }
        // A conflict holds its paths until it is resolved or every task it
        // names has left the active states.
        if self.config.hold_conflicted_paths {
            let active: HashSet<Uuid> = graph
                .tasks()
                .iter()
                .filter(|t| t.status.is_active())
                .map(|t| t.id)
                .collect();
            for conflict in self.store.list_conflicts(true).await? {
                let live = conflict.task_ids.is_empty()
                    || conflict.task_ids.iter().any(|id| active.contains(id));
                if live {
                    claimed.claim(&conflict.file_paths);
                }
            }
        }

        let mut report = TickReport::default();
        let mut candidates: Vec<&Task> = Vec::with_capacity(runnable.len());
        for task in runnable.iter().copied() {
            if claimed.conflicts_with(&task.file_scope) {
                report.held.push(task.id);
            } else {
                candidates.push(task);
            }
        }
        if !report.held.is_empty() {
            debug!(held = report.held.len(), "Runnable tasks held back by scope overlap");
        }

        // list_workers is ordered by id.
        let idle: Vec<&Worker> = workers.iter().filter(|w| w.is_available()).collect();
        let mut busy_workers: HashSet<Uuid> = HashSet::new();
        let mut spent_tasks: HashSet<Uuid> = HashSet::new();

        // Continuity pass.
        for worker in &idle {
            let Some(last) = worker.last_completed_task_id else {
                continue;
            };
            let pick = candidates.iter().copied().find(|t| {
                !spent_tasks.contains(&t.id)
                    && t.depends_on.contains(&last)
                    && worker.can_run(t)
                    && !claimed.conflicts_with(&t.file_scope)
            });
            if let Some(task) = pick {
                self.attempt(task, worker, now, &mut claimed, &mut report, &mut busy_workers, &mut spent_tasks)
                    .await?;
            }
        }

        // Priority pass.
        for worker in &idle {
            if busy_workers.contains(&worker.id) {
                continue;
            }
            let pick = candidates.iter().copied().find(|t| {
                !spent_tasks.contains(&t.id)
                    && worker.can_run(t)
                    && !claimed.conflicts_with(&t.file_scope)
            });
            if let Some(task) = pick {
                self.attempt(task, worker, now, &mut claimed, &mut report, &mut busy_workers, &mut spent_tasks)
                    .await?;
            }
        }

        report.desired_workers = (runnable.len() + in_flight).min(self.config.max_workers);
        let live_workers = workers.iter().filter(|w| w.status.is_live()).count();
        self.signal_scale(report.desired_workers, live_workers);

        if !report.assigned.is_empty() {
            info!(
                assigned = report.assigned.len(),
                runnable = runnable.len(),
                idle = idle.len(),
                "Scheduler tick assigned tasks"
            );
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        task: &Task,
        worker: &Worker,
        now: DateTime<Utc>,
        claimed: &mut ScopeSet,
        report: &mut TickReport,
        busy_workers: &mut HashSet<Uuid>,
        spent_tasks: &mut HashSet<Uuid>,
    ) -> Result<(), DatabaseError> {
        match self.assign(task, worker, now).await? {
            Claim::Assigned => {
                claimed.claim(&task.file_scope);
                report.assigned.push((task.id, worker.id));
                busy_workers.insert(worker.id);
                spent_tasks.insert(task.id);
            }
            Claim::WorkerBusy => {
                report.races += 1;
                busy_workers.insert(worker.id);
            }
            Claim::TaskTaken => {
                report.races += 1;
                spent_tasks.insert(task.id);
            }
        }
        Ok(())
    }

    /// Claim `worker`, then `task`. All-or-nothing per pair.
    async fn assign(
        &self,
        task: &Task,
        worker: &Worker,
        now: DateTime<Utc>,
    ) -> Result<Claim, DatabaseError> {
        let worker_claim = self
            .store
            .conditional_update_worker(
                worker.id,
                &WorkerExpectation::status(WorkerStatus::Idle).current_task(None),
                &WorkerPatch::new()
                    .status(WorkerStatus::Working)
                    .current_task(Some(task.id)),
            )
            .await?;
        if !worker_claim.is_applied() {
            debug!(
                error = %AssignmentError::Race { task_id: task.id, worker_id: worker.id },
                "Worker no longer idle"
            );
            return Ok(Claim::WorkerBusy);
        }

        let task_claim = self
            .store
            .conditional_update_task(
                task.id,
                &TaskExpectation::status(TaskStatus::Pending).unassigned(),
                &TaskPatch::new()
                    .status(TaskStatus::Assigned)
                    .assign(worker.id, now),
            )
            .await;

        match task_claim {
            Ok(outcome) if outcome.is_applied() => {
                info!(task_id = %task.id, worker = %worker.name, priority = task.priority, "Task assigned");
                Ok(Claim::Assigned)
            }
            Ok(_) => {
                debug!(
                    error = %AssignmentError::Race { task_id: task.id, worker_id: worker.id },
                    "Task no longer pending, releasing worker"
                );
                self.release(worker.id, task.id).await?;
                Ok(Claim::TaskTaken)
            }
            Err(e) => {
                if let Err(release_err) = self.release(worker.id, task.id).await {
                    warn!(worker_id = %worker.id, error = %release_err, "Failed to release worker claim");
                }
                Err(e)
            }
        }
    }

    /// Undo a worker claim that did not get its task.
    async fn release(&self, worker_id: Uuid, task_id: Uuid) -> Result<(), DatabaseError> {
        self.store
            .conditional_update_worker(
                worker_id,
                &WorkerExpectation::status(WorkerStatus::Working).current_task(Some(task_id)),
                &WorkerPatch::new()
                    .status(WorkerStatus::Idle)
                    .current_task(None),
            )
            .await?;
        Ok(())
    }

    fn signal_scale(&self, desired: usize, live: usize) {
        let Some(tx) = &self.scale_tx else {
            return;
        };
        if desired > live || desired == 0 {
            if let Err(e) = tx.try_send(ScaleSignal::ScaleTo(desired)) {
                debug!(desired, error = %e, "Scale signal dropped");
            }
        }
    }
}

/// Spawn the periodic scheduler loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop scheduling.
pub fn spawn_scheduler(
    scheduler: Scheduler,
    health: Arc<LoopHealth>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Scheduler started — ticking every {}s, max {} workers",
            scheduler.config.poll_interval.as_secs(),
            scheduler.config.max_workers
        );

        let mut tick = tokio::time::interval(scheduler.config.poll_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Scheduler shutting down");
                return;
            }

            match scheduler.tick().await {
                Ok(report) => {
                    health.record_success();
                    if report.assigned.is_empty() {
                        debug!(held = report.held.len(), races = report.races, "Scheduler tick idle");
                    }
                }
                Err(e) => {
                    health.record_failure(&e);
                }
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::model::{Conflict, ConflictType};
    use crate::store::LibSqlBackend;

    async fn store() -> Arc<dyn Store> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    fn scheduler(store: &Arc<dyn Store>) -> Scheduler {
        Scheduler::new(Arc::clone(store), SchedulerConfig::default())
    }

    async fn idle_worker(store: &Arc<dyn Store>, name: &str) -> Worker {
        let worker = Worker::new(name, "test");
        store.create_worker(&worker).await.unwrap();
        worker
    }

    #[tokio::test]
    async fn assigns_highest_priority_first() {
        let store = store().await;
        let low = Task::new("low").with_priority(1);
        let high = Task::new("high").with_priority(5);
        store.create_tasks(&[low.clone(), high.clone()]).await.unwrap();
        let worker = idle_worker(&store, "runner-1").await;

        let report = scheduler(&store).tick().await.unwrap();
        assert_eq!(report.assigned, vec![(high.id, worker.id)]);

        let task = store.get_task(high.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_to, Some(worker.id));
        let w = store.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Working);
        assert_eq!(w.current_task_id, Some(high.id));
    }

    #[tokio::test]
    async fn blocked_tasks_are_not_assigned() {
        let store = store().await;
        let first = Task::new("first");
        let second = Task::new("second").with_depends_on([first.id]);
        store.create_tasks(&[first.clone(), second.clone()]).await.unwrap();
        idle_worker(&store, "runner-1").await;
        idle_worker(&store, "runner-2").await;

        let report = scheduler(&store).tick().await.unwrap();
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].0, first.id);
        let second = store.get_task(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn overlapping_scopes_assigned_one_per_tick() {
        let store = store().await;
        let t3 = Task::new("T3").with_file_scope(["src/auth.py"]);
        let t4 = Task::new("T4").with_file_scope(["src/auth.py"]);
        store.create_tasks(&[t3.clone(), t4.clone()]).await.unwrap();
        idle_worker(&store, "runner-1").await;
        idle_worker(&store, "runner-2").await;
        let scheduler = scheduler(&store);

        let first = scheduler.tick().await.unwrap();
        assert_eq!(first.assigned.len(), 1);
        assert_eq!(first.assigned[0].0, t3.id);

        // T4 stays held while T3 is active.
        let second = scheduler.tick().await.unwrap();
        assert!(second.assigned.is_empty());
        assert_eq!(second.held, vec![t4.id]);
    }

    #[tokio::test]
    async fn unresolved_conflict_paths_hold_tasks() {
        let store = store().await;
        let task = Task::new("touch billing").with_file_scope(["src/billing"]);
        store.create_task(&task).await.unwrap();
        idle_worker(&store, "runner-1").await;
        let mut conflict = Conflict::new(ConflictType::FileOverlap, Utc::now());
        conflict.file_paths.insert("src/billing/invoice.py".into());
        store.create_conflict(&conflict).await.unwrap();

        let report = scheduler(&store).tick().await.unwrap();
        assert!(report.assigned.is_empty());
        assert_eq!(report.held, vec![task.id]);

        let relaxed = Scheduler::new(
            Arc::clone(&store),
            SchedulerConfig {
                hold_conflicted_paths: false,
                ..SchedulerConfig::default()
            },
        );
        assert_eq!(relaxed.tick().await.unwrap().assigned.len(), 1);
    }

    #[tokio::test]
    async fn conflict_stops_holding_once_its_tasks_finish() {
        let store = store().await;
        let running = Task::new("T3").with_file_scope(["src/session.py"]);
        let done = Task::new("T2").with_file_scope(["src/auth.py"]);
        let next = Task::new("T4").with_file_scope(["src/auth.py"]);
        store
            .create_tasks(&[running.clone(), done.clone(), next.clone()])
            .await
            .unwrap();
        idle_worker(&store, "runner-1").await;

        let mut conflict = Conflict::new(ConflictType::FileOverlap, Utc::now());
        conflict.task_ids.extend([running.id, done.id]);
        conflict.file_paths.insert("src/auth.py".into());
        store.create_conflict(&conflict).await.unwrap();

        for (id, status) in [(done.id, TaskStatus::Completed), (running.id, TaskStatus::InProgress)] {
            store
                .conditional_update_task(id, &TaskExpectation::default(), &TaskPatch::new().status(status))
                .await
                .unwrap();
        }
        let report = scheduler(&store).tick().await.unwrap();
        assert!(report.assigned.is_empty());
        assert_eq!(report.held, vec![next.id]);

        // The sequential chain finished; the unresolved conflict no longer holds.
        store
            .conditional_update_task(
                running.id,
                &TaskExpectation::default(),
                &TaskPatch::new().status(TaskStatus::Completed),
            )
            .await
            .unwrap();
        let report = scheduler(&store).tick().await.unwrap();
        assert!(report.held.is_empty());
        assert_eq!(report.assigned.len(), 1);
        assert_eq!(report.assigned[0].0, next.id);
    }

    #[tokio::test]
    async fn continuity_prefers_worker_that_ran_the_dependency() {
        let store = store().await;
        let t1 = Task::new("T1").with_priority(5);
        let t2 = Task::new("T2").with_priority(3).with_depends_on([t1.id]);
        let mut t2_ready = t2.clone();
        t2_ready.status = TaskStatus::Pending;
        t2_ready.blocked_by.clear();
        store.create_tasks(&[t2_ready.clone()]).await.unwrap();

        // Lowest id goes first in the priority pass; make the continuity
        // worker the one with the higher id.
        let mut a = Worker::new("runner-a", "test");
        let mut b = Worker::new("runner-b", "test");
        if a.id > b.id {
            std::mem::swap(&mut a, &mut b);
        }
        b.last_completed_task_id = Some(t1.id);
        store.create_worker(&a).await.unwrap();
        store.create_worker(&b).await.unwrap();

        let report = scheduler(&store).tick().await.unwrap();
        assert_eq!(report.assigned, vec![(t2_ready.id, b.id)]);
    }

    #[tokio::test]
    async fn capabilities_gate_assignment() {
        let store = store().await;
        let gpu = Task::new("train").with_required_capabilities(["gpu"]);
        store.create_task(&gpu).await.unwrap();
        idle_worker(&store, "runner-1").await;

        let report = scheduler(&store).tick().await.unwrap();
        assert!(report.assigned.is_empty());

        let capable = Worker::new("runner-gpu", "test").with_capabilities(["gpu"]);
        store.create_worker(&capable).await.unwrap();
        let report = scheduler(&store).tick().await.unwrap();
        assert_eq!(report.assigned, vec![(gpu.id, capable.id)]);
    }

    #[tokio::test]
    async fn lost_task_race_releases_worker() {
        let store = store().await;
        let task = Task::new("contested");
        store.create_task(&task).await.unwrap();
        let worker = idle_worker(&store, "runner-1").await;
        let sched = scheduler(&store);

        // Someone else takes the task between the snapshot and the claim.
        store
            .conditional_update_task(
                task.id,
                &TaskExpectation::status(TaskStatus::Pending),
                &TaskPatch::new().status(TaskStatus::Cancelled),
            )
            .await
            .unwrap();
        let claim = sched.assign(&task, &worker, Utc::now()).await.unwrap();
        assert_eq!(claim, Claim::TaskTaken);

        let w = store.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(w.status, WorkerStatus::Idle);
        assert_eq!(w.current_task_id, None);
    }

    #[tokio::test]
    async fn scale_signal_requests_more_workers() {
        let store = store().await;
        store
            .create_tasks(&[Task::new("a"), Task::new("b"), Task::new("c")])
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let sched = Scheduler::new(
            Arc::clone(&store),
            SchedulerConfig {
                max_workers: 2,
                ..SchedulerConfig::default()
            },
        )
        .with_scale_signals(tx);

        let report = sched.tick().await.unwrap();
        assert_eq!(report.desired_workers, 2);
        assert_eq!(rx.try_recv().unwrap(), ScaleSignal::ScaleTo(2));
    }

    #[tokio::test]
    async fn empty_queue_signals_scale_to_zero() {
        let store = store().await;
        idle_worker(&store, "runner-1").await;
        let (tx, mut rx) = mpsc::channel(4);
        let sched = scheduler(&store).with_scale_signals(tx);

        sched.tick().await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), ScaleSignal::ScaleTo(0));
    }
}
