//! Worker runtime — the executor side of the fleet.
//!
//! A runner registers a worker record, heartbeats in the background and
//! polls for tasks assigned to it. Every state change goes through the
//! store as a conditional update: a runner never trusts what it read a
//! moment ago.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{DatabaseError, ExecutionError};
use crate::fleet::completion::UnblockSender;
use crate::fleet::model::{ActivityEvent, EventType, Task, TaskResult, Worker};
use crate::fleet::state::{TaskStatus, WorkerStatus};
use crate::store::{Store, TaskExpectation, TaskPatch, TaskQuery, WorkerExpectation, WorkerPatch};
use crate::worker::executor::{Executor, ProgressReporter};

/// Attempts at the version-checked counter update after a task finishes.
const MAX_RECORD_RETRIES: usize = 5;

/// Why a runner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// Shutdown was requested.
    Shutdown,
    /// The worker record went offline. A replacement must register anew.
    Lost,
}

/// How an execution ended before its result was written.
enum Outcome {
    Finished(Result<TaskResult, ExecutionError>),
    /// Cancelled by an operator while running.
    Cancelled,
    /// Requeued or reassigned while running.
    Reclaimed,
}

pub struct WorkerRunner {
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    config: WorkerConfig,
    unblock_tx: Option<UnblockSender>,
    worker: Worker,
    /// Stale claim seen on the previous poll.
    suspect_claim: Option<Uuid>,
}

impl WorkerRunner {
    /// Insert a fresh idle worker record named `name`.
    pub async fn register(
        store: Arc<dyn Store>,
        executor: Arc<dyn Executor>,
        config: WorkerConfig,
        name: &str,
    ) -> Result<Self, DatabaseError> {
        let worker =
            Worker::new(name, executor.kind()).with_capabilities(config.capabilities.iter().cloned());
        store.create_worker(&worker).await?;
        store
            .record_event(
                &ActivityEvent::new(EventType::WorkerStarted, format!("{name} registered"))
                    .with_worker(worker.id),
            )
            .await?;
        info!(worker = %worker.name, worker_id = %worker.id, kind = %worker.kind, "Worker registered");

        Ok(Self {
            store,
            executor,
            config,
            unblock_tx: None,
            worker,
            suspect_claim: None,
        })
    }

    /// Push completed task ids onto the completion handler's queue.
    pub fn with_unblock_queue(mut self, tx: UnblockSender) -> Self {
        self.unblock_tx = Some(tx);
        self
    }

    pub fn id(&self) -> Uuid {
        self.worker.id
    }

    pub fn name(&self) -> &str {
        &self.worker.name
    }

    /// Poll and execute until shutdown is requested or the record goes offline.
    pub async fn run(mut self, shutdown: Arc<AtomicBool>) -> RunnerExit {
        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.store),
            self.worker.id,
            self.config.heartbeat_interval,
            Arc::clone(&lost),
        );

        let mut tick = tokio::time::interval(self.config.poll_interval);
        let exit = loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                break RunnerExit::Shutdown;
            }
            if lost.load(Ordering::Relaxed) {
                break RunnerExit::Lost;
            }

            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    lost.store(true, Ordering::Relaxed);
                    break RunnerExit::Lost;
                }
                Err(e) => {
                    warn!(worker = %self.worker.name, error = %e, "Worker poll failed, retrying");
                }
            }
        };
        heartbeat.abort();

        match exit {
            RunnerExit::Shutdown => self.sign_off().await,
            RunnerExit::Lost => {
                warn!(worker = %self.worker.name, worker_id = %self.worker.id, "Worker record offline, stopping");
            }
        }
        exit
    }

    /// One poll. False once the worker record is offline or gone.
    pub async fn poll_once(&mut self) -> Result<bool, DatabaseError> {
        let assigned = self
            .store
            .query_tasks(
                &TaskQuery::with_status(TaskStatus::Assigned)
                    .assigned_to(self.worker.id)
                    .limit(1),
            )
            .await?;

        if let Some(task) = assigned.into_iter().next() {
            self.suspect_claim = None;
            self.execute(task).await?;
            return Ok(true);
        }

        let Some(record) = self.store.get_worker(self.worker.id).await? else {
            return Ok(false);
        };
        if record.status == WorkerStatus::Offline {
            return Ok(false);
        }
        self.check_stale_claim(&record).await?;
        Ok(true)
    }

    /// A record that says `working` without an assigned task is left over
    /// from a half-made assignment. Reset it once it has been seen twice in
    /// a row, so an assignment in flight is not undone.
    async fn check_stale_claim(&mut self, record: &Worker) -> Result<(), DatabaseError> {
        let claim = match (record.status, record.current_task_id) {
            (WorkerStatus::Working, Some(task_id)) => task_id,
            _ => {
                self.suspect_claim = None;
                return Ok(());
            }
        };

        let owned = self
            .store
            .get_task(claim)
            .await?
            .is_some_and(|t| t.status.is_active() && t.assigned_to == Some(self.worker.id));
        if owned {
            self.suspect_claim = None;
            return Ok(());
        }

        if self.suspect_claim != Some(claim) {
            self.suspect_claim = Some(claim);
            return Ok(());
        }

        let outcome = self
            .store
            .conditional_update_worker(
                self.worker.id,
                &WorkerExpectation::status(WorkerStatus::Working).current_task(Some(claim)),
                &WorkerPatch::new()
                    .status(WorkerStatus::Idle)
                    .current_task(None),
            )
            .await?;
        if outcome.is_applied() {
            info!(worker = %self.worker.name, task_id = %claim, "Reset stale worker claim");
        }
        self.suspect_claim = None;
        Ok(())
    }

    async fn execute(&self, task: Task) -> Result<(), DatabaseError> {
        let started = self
            .store
            .conditional_update_task(
                task.id,
                &TaskExpectation::status(TaskStatus::Assigned).assigned_to(self.worker.id),
                &TaskPatch::new()
                    .status(TaskStatus::InProgress)
                    .started_at(Utc::now()),
            )
            .await?;
        if !started.is_applied() {
            debug!(task_id = %task.id, "Assignment withdrawn before start");
            return Ok(());
        }

        let working = self
            .store
            .conditional_update_worker(
                self.worker.id,
                &WorkerExpectation::live(),
                &WorkerPatch::new()
                    .status(WorkerStatus::Working)
                    .current_task(Some(task.id)),
            )
            .await?;
        if !working.is_applied() {
            debug!(worker = %self.worker.name, task_id = %task.id, "Worker record not live, not marked working");
        }
        self.store
            .record_event(
                &ActivityEvent::new(EventType::TaskStarted, task.title.clone())
                    .with_worker(self.worker.id)
                    .with_task(task.id),
            )
            .await?;
        info!(worker = %self.worker.name, task_id = %task.id, title = %task.title, "Task started");

        let progress = ProgressReporter::new(Arc::clone(&self.store), self.worker.id, task.id);
        let outcome = tokio::select! {
            result = self.executor.execute(&task, &progress) => Outcome::Finished(result),
            outcome = self.watch_task(task.id) => outcome,
        };

        match outcome {
            Outcome::Finished(result) => {
                let result = result.unwrap_or_else(|e| TaskResult::failed(e.to_string()));
                self.finish(&task, result).await
            }
            Outcome::Cancelled => {
                info!(worker = %self.worker.name, task_id = %task.id, "Task cancelled, execution dropped");
                self.release(None, None).await
            }
            Outcome::Reclaimed => {
                warn!(worker = %self.worker.name, task_id = %task.id, "Task reclaimed while running, execution dropped");
                self.release(None, None).await
            }
        }
    }

    /// Resolves once the running task is cancelled or no longer ours.
    async fn watch_task(&self, task_id: Uuid) -> Outcome {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        // The first tick fires immediately.
        tick.tick().await;
        loop {
            tick.tick().await;
            match self.store.get_task(task_id).await {
                Ok(Some(task)) if task.status == TaskStatus::Cancelled => return Outcome::Cancelled,
                Ok(Some(task))
                    if task.status != TaskStatus::InProgress
                        || task.assigned_to != Some(self.worker.id) =>
                {
                    return Outcome::Reclaimed;
                }
                Ok(Some(_)) => {}
                Ok(None) => return Outcome::Reclaimed,
                Err(e) => debug!(task_id = %task_id, error = %e, "Cancel check failed"),
            }
        }
    }

    async fn finish(&self, task: &Task, result: TaskResult) -> Result<(), DatabaseError> {
        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let outcome = self
            .store
            .conditional_update_task(
                task.id,
                &TaskExpectation::status(TaskStatus::InProgress).assigned_to(self.worker.id),
                &TaskPatch::new()
                    .status(status)
                    .completed_at(Utc::now())
                    .result_summary(result.summary.clone())
                    .error_message(result.error.clone())
                    .usage(result.tokens_used, result.cost_usd, result.duration_ms)
                    .unblock_processed(false),
            )
            .await?;

        if !outcome.is_applied() {
            warn!(task_id = %task.id, "Task changed while running, result discarded");
            return self.release(None, None).await;
        }

        let (event_type, message) = if result.success {
            info!(worker = %self.worker.name, task_id = %task.id, ms = result.duration_ms, "Task completed");
            (EventType::TaskCompleted, result.summary.clone())
        } else {
            let reason = result.error.clone().unwrap_or_default();
            warn!(worker = %self.worker.name, task_id = %task.id, error = %reason, "Task failed");
            (EventType::TaskFailed, reason)
        };

        self.release(Some(task.id), Some(&result)).await?;
        self.store
            .record_event(
                &ActivityEvent::new(event_type, message)
                    .with_worker(self.worker.id)
                    .with_task(task.id)
                    .with_result(&result),
            )
            .await?;

        if let Some(tx) = &self.unblock_tx {
            if tx.send(task.id).is_err() {
                debug!(task_id = %task.id, "Unblock queue closed, sweep will pick it up");
            }
        }
        Ok(())
    }

    /// Return the worker record to idle, folding in the finished task's
    /// figures when there are any.
    async fn release(
        &self,
        finished: Option<Uuid>,
        result: Option<&TaskResult>,
    ) -> Result<(), DatabaseError> {
        for _ in 0..MAX_RECORD_RETRIES {
            let Some(record) = self.store.get_worker(self.worker.id).await? else {
                return Ok(());
            };
            if record.status == WorkerStatus::Offline {
                return Ok(());
            }

            let mut patch = WorkerPatch::new()
                .status(WorkerStatus::Idle)
                .current_task(None);
            if let Some(result) = result {
                let (completed, failed) = if result.success {
                    (record.tasks_completed + 1, record.tasks_failed)
                } else {
                    (record.tasks_completed, record.tasks_failed + 1)
                };
                patch = patch.counters(
                    completed,
                    failed,
                    record.total_tokens_used + result.tokens_used,
                    record.total_cost_usd + result.cost_usd,
                );
                if let (true, Some(id)) = (result.success, finished) {
                    patch = patch.last_completed(id);
                }
            }

            let outcome = self
                .store
                .conditional_update_worker(
                    self.worker.id,
                    &WorkerExpectation::live().at_version(record.version),
                    &patch,
                )
                .await?;
            if outcome.is_applied() {
                return Ok(());
            }
        }
        error!(worker = %self.worker.name, "Could not update worker record after repeated races");
        Ok(())
    }

    /// Mark the record offline on a clean exit.
    async fn sign_off(&self) {
        let result = self
            .store
            .conditional_update_worker(
                self.worker.id,
                &WorkerExpectation::live(),
                &WorkerPatch::new()
                    .status(WorkerStatus::Offline)
                    .current_task(None),
            )
            .await;
        if let Err(e) = result {
            warn!(worker = %self.worker.name, error = %e, "Failed to mark worker offline");
            return;
        }
        let event = ActivityEvent::new(
            EventType::WorkerStopped,
            format!("{} stopped", self.worker.name),
        )
        .with_worker(self.worker.id);
        if let Err(e) = self.store.record_event(&event).await {
            warn!(worker = %self.worker.name, error = %e, "Failed to record worker stop");
        }
        info!(worker = %self.worker.name, "Worker stopped");
    }
}

/// Refresh `last_heartbeat` every `interval` until the store rejects it.
fn spawn_heartbeat(
    store: Arc<dyn Store>,
    worker_id: Uuid,
    interval: Duration,
    lost: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            match store.heartbeat(worker_id, Utc::now()).await {
                Ok(outcome) if outcome.is_applied() => {}
                Ok(_) => {
                    lost.store(true, Ordering::Relaxed);
                    return;
                }
                Err(e) => warn!(%worker_id, error = %e, "Heartbeat failed"),
            }
        }
    })
}
