//! Completion handler — releases dependents of finished tasks.
//!
//! Workers push the id of every task they complete onto the unblock queue.
//! A slower polling sweep picks up anything that never reached the queue
//! (worker crash after the terminal update, operator cancels, restarts).
//! A task's `unblock_processed` flag records that its dependents have been
//! handled, so both paths can see the same task without double work.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{CompletionConfig, FailurePolicy};
use crate::error::DatabaseError;
use crate::fleet::loop_health::LoopHealth;
use crate::fleet::model::Task;
use crate::fleet::state::TaskStatus;
use crate::store::{Store, TaskExpectation, TaskPatch, TaskQuery};

/// Conditional-update attempts per dependent before giving up this round.
const MAX_CAS_RETRIES: usize = 5;

pub type UnblockSender = mpsc::UnboundedSender<Uuid>;
pub type UnblockReceiver = mpsc::UnboundedReceiver<Uuid>;

/// Queue of completed task ids waiting for their dependents to be released.
pub fn unblock_channel() -> (UnblockSender, UnblockReceiver) {
    mpsc::unbounded_channel()
}

/// What processing one finished task changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnblockReport {
    /// Dependents moved from blocked to pending.
    pub released: Vec<Uuid>,
    /// Dependents that lost a blocker but still wait on others.
    pub narrowed: Vec<Uuid>,
    /// Dependents cancelled by the failure policy.
    pub cancelled: Vec<Uuid>,
    /// Dependents left untouched after repeated lost races. Retried by the sweep.
    pub contended: Vec<Uuid>,
}

pub struct CompletionHandler {
    store: Arc<dyn Store>,
    config: CompletionConfig,
}

impl CompletionHandler {
    pub fn new(store: Arc<dyn Store>, config: CompletionConfig) -> Self {
        Self { store, config }
    }

    /// Handle one finished task, whatever its terminal status.
    pub async fn handle(&self, task_id: Uuid) -> Result<UnblockReport, DatabaseError> {
        let Some(task) = self.store.get_task(task_id).await? else {
            debug!(%task_id, "Unblock item for unknown task");
            return Ok(UnblockReport::default());
        };
        match task.status {
            TaskStatus::Completed => self.process_completion(&task).await,
            TaskStatus::Failed | TaskStatus::Cancelled => self.process_failure(&task).await,
            _ => Ok(UnblockReport::default()),
        }
    }

    /// Remove a completed task from each dependent's `blocked_by`, moving a
    /// dependent to pending once nothing blocks it.
    pub async fn process_completion(&self, task: &Task) -> Result<UnblockReport, DatabaseError> {
        let mut report = UnblockReport::default();
        if task.status != TaskStatus::Completed || task.unblock_processed {
            return Ok(report);
        }

        for dependent in self.store.list_dependents(task.id).await? {
            self.release_one(dependent, task.id, &mut report).await?;
        }

        if report.contended.is_empty() {
            self.mark_processed(task.id, TaskStatus::Completed).await?;
        }
        if !report.released.is_empty() {
            info!(
                task_id = %task.id,
                released = report.released.len(),
                "Dependents released"
            );
        }
        Ok(report)
    }

    async fn release_one(
        &self,
        mut dependent: Task,
        completed: Uuid,
        report: &mut UnblockReport,
    ) -> Result<(), DatabaseError> {
        for _ in 0..MAX_CAS_RETRIES {
            if !dependent.blocked_by.contains(&completed) {
                return Ok(());
            }
            let mut blocked_by = dependent.blocked_by.clone();
            blocked_by.remove(&completed);
            let now_free = blocked_by.is_empty() && dependent.status == TaskStatus::Blocked;

            let mut patch = TaskPatch::new().blocked_by(blocked_by);
            if now_free {
                patch = patch.status(TaskStatus::Pending);
            }
            let outcome = self
                .store
                .conditional_update_task(
                    dependent.id,
                    &TaskExpectation::version(dependent.version),
                    &patch,
                )
                .await?;

            if outcome.is_applied() {
                if now_free {
                    debug!(task_id = %dependent.id, "Task unblocked");
                    report.released.push(dependent.id);
                } else {
                    report.narrowed.push(dependent.id);
                }
                return Ok(());
            }

            match self.store.get_task(dependent.id).await? {
                Some(fresh) => dependent = fresh,
                None => return Ok(()),
            }
        }
        warn!(task_id = %dependent.id, "Gave up releasing dependent after repeated races");
        report.contended.push(dependent.id);
        Ok(())
    }

    /// Apply the failure policy to the dependents of a failed or cancelled task.
    pub async fn process_failure(&self, task: &Task) -> Result<UnblockReport, DatabaseError> {
        let mut report = UnblockReport::default();
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled)
            || task.unblock_processed
        {
            return Ok(report);
        }

        match self.config.failure_policy {
            FailurePolicy::StayBlocked => {
                let dependents = self.store.list_dependents(task.id).await?;
                let waiting = dependents
                    .iter()
                    .filter(|d| d.blocked_by.contains(&task.id) && !d.status.is_terminal())
                    .count();
                if waiting > 0 {
                    warn!(
                        task_id = %task.id,
                        status = %task.status,
                        waiting,
                        "Dependents stay blocked until an operator intervenes"
                    );
                }
            }
            FailurePolicy::CancelDependents => {
                self.cancel_dependents(task, &mut report).await?;
            }
        }

        self.mark_processed(task.id, task.status).await?;
        Ok(report)
    }

    async fn cancel_dependents(
        &self,
        root: &Task,
        report: &mut UnblockReport,
    ) -> Result<(), DatabaseError> {
        let mut seen: HashSet<Uuid> = HashSet::from([root.id]);
        let mut queue: VecDeque<Uuid> = VecDeque::from([root.id]);
        let reason = format!("dependency {} {}", root.id, root.status);

        while let Some(id) = queue.pop_front() {
            for dependent in self.store.list_dependents(id).await? {
                if !seen.insert(dependent.id) {
                    continue;
                }
                let outcome = self
                    .store
                    .conditional_update_task(
                        dependent.id,
                        &TaskExpectation::any_status([TaskStatus::Blocked, TaskStatus::Pending])
                            .unassigned(),
                        &TaskPatch::new()
                            .status(TaskStatus::Cancelled)
                            .error_message(Some(reason.clone()))
                            .unblock_processed(true),
                    )
                    .await?;
                if outcome.is_applied() {
                    info!(task_id = %dependent.id, cause = %root.id, "Dependent cancelled");
                    report.cancelled.push(dependent.id);
                    queue.push_back(dependent.id);
                }
            }
        }
        Ok(())
    }

    async fn mark_processed(&self, id: Uuid, status: TaskStatus) -> Result<(), DatabaseError> {
        self.store
            .conditional_update_task(
                id,
                &TaskExpectation::status(status),
                &TaskPatch::new().unblock_processed(true),
            )
            .await?;
        Ok(())
    }

    /// Fallback scan: every finished task whose dependents were never handled.
    pub async fn sweep(&self) -> Result<UnblockReport, DatabaseError> {
        let finished = self
            .store
            .query_tasks(&TaskQuery::with_statuses([
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ]))
            .await?;

        let mut total = UnblockReport::default();
        for task in finished.into_iter().filter(|t| !t.unblock_processed) {
            let report = match task.status {
                TaskStatus::Completed => self.process_completion(&task).await?,
                _ => self.process_failure(&task).await?,
            };
            total.released.extend(report.released);
            total.narrowed.extend(report.narrowed);
            total.cancelled.extend(report.cancelled);
            total.contended.extend(report.contended);
        }
        Ok(total)
    }
}

/// Spawn the completion handler.
///
/// Consumes the unblock queue as items arrive and runs the fallback sweep
/// every poll interval. Returns a `JoinHandle` and a shutdown flag.
pub fn spawn_completion_handler(
    handler: CompletionHandler,
    mut queue: UnblockReceiver,
    health: Arc<LoopHealth>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Completion handler started — sweeping every {}s, failure policy {}",
            handler.config.poll_interval.as_secs(),
            handler.config.failure_policy
        );

        let mut tick = tokio::time::interval(handler.config.poll_interval);
        let mut queue_open = true;

        loop {
            tokio::select! {
                item = queue.recv(), if queue_open => {
                    match item {
                        Some(task_id) => match handler.handle(task_id).await {
                            Ok(_) => health.record_success(),
                            // The sweep picks the task up again.
                            Err(e) => {
                                health.record_failure(&e);
                            }
                        },
                        None => queue_open = false,
                    }
                }
                _ = tick.tick() => {
                    if shutdown.load(Ordering::Relaxed) {
                        info!("Completion handler shutting down");
                        return;
                    }
                    match handler.sweep().await {
                        Ok(report) => {
                            health.record_success();
                            if !report.released.is_empty() || !report.cancelled.is_empty() {
                                debug!(
                                    released = report.released.len(),
                                    cancelled = report.cancelled.len(),
                                    "Completion sweep caught missed items"
                                );
                            }
                        }
                        Err(e) => {
                            health.record_failure(&e);
                        }
                    }
                }
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Completion handler shutting down");
                return;
            }
        }
    });

    (handle, shutdown_flag)
}
