//! Health monitor — stale-worker recovery.
//!
//! A worker is stale once its last heartbeat is older than the threshold.
//! Stale workers are quarantined as offline and their in-flight task goes
//! back to pending. Active tasks whose assignee is already offline or gone
//! are requeued the same way.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HealthConfig;
use crate::error::{DatabaseError, FleetError};
use crate::fleet::loop_health::LoopHealth;
use crate::fleet::model::{ActivityEvent, EventType, Task, Worker};
use crate::fleet::state::{TaskStatus, WorkerStatus};
use crate::store::{Store, TaskExpectation, TaskPatch, TaskQuery, WorkerExpectation, WorkerPatch};

/// A worker quarantined by the monitor. The fleet controller may replace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLost {
    pub worker_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Workers moved to offline this sweep.
    pub quarantined: Vec<Uuid>,
    /// Tasks moved back to pending this sweep.
    pub requeued: Vec<Uuid>,
}

pub struct HealthMonitor {
    store: Arc<dyn Store>,
    config: HealthConfig,
    lost_tx: Option<mpsc::Sender<WorkerLost>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Store>, config: HealthConfig) -> Self {
        Self {
            store,
            config,
            lost_tx: None,
        }
    }

    /// Report quarantined workers to the fleet controller.
    pub fn with_lost_workers(mut self, tx: mpsc::Sender<WorkerLost>) -> Self {
        self.lost_tx = Some(tx);
        self
    }

    pub async fn sweep(&self) -> Result<SweepReport, DatabaseError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or(chrono::Duration::seconds(120));
        let cutoff = now - threshold;

        // Tasks before workers, so every assignee seen here is in the worker list.
        let active = self
            .store
            .query_tasks(&TaskQuery::with_statuses([
                TaskStatus::Assigned,
                TaskStatus::InProgress,
            ]))
            .await?;
        let workers = self.store.list_workers().await?;

        let mut report = SweepReport::default();
        let mut offline: HashMap<Uuid, bool> = workers
            .iter()
            .map(|w| (w.id, w.status == WorkerStatus::Offline))
            .collect();

        for worker in &workers {
            if !matches!(worker.status, WorkerStatus::Idle | WorkerStatus::Working) {
                continue;
            }
            if worker.last_heartbeat >= cutoff {
                continue;
            }
            if self.quarantine(worker, now, cutoff).await? {
                report.quarantined.push(worker.id);
                offline.insert(worker.id, true);
            }
        }

        for task in &active {
            let orphaned = match task.assigned_to {
                None => true,
                Some(w) => offline.get(&w).copied().unwrap_or(true),
            };
            if orphaned && self.requeue(task).await? {
                report.requeued.push(task.id);
            }
        }

        if !report.quarantined.is_empty() || !report.requeued.is_empty() {
            info!(
                quarantined = report.quarantined.len(),
                requeued = report.requeued.len(),
                "Health sweep recovered work"
            );
        }
        Ok(report)
    }

    /// Move a stale worker to offline. False if it heartbeated or changed
    /// state since it was read.
    async fn quarantine(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let outcome = self
            .store
            .conditional_update_worker(
                worker.id,
                &WorkerExpectation::any_status([WorkerStatus::Idle, WorkerStatus::Working])
                    .heartbeat_before(cutoff),
                &WorkerPatch::new()
                    .status(WorkerStatus::Offline)
                    .current_task(None),
            )
            .await?;
        if !outcome.is_applied() {
            debug!(worker_id = %worker.id, "Worker changed before quarantine, skipping");
            return Ok(false);
        }

        let silent_for = worker.silent_for(now).to_std().unwrap_or_default();
        let err = FleetError::WorkerTimeout {
            worker_id: worker.id,
            silent_for,
        };
        warn!(worker = %worker.name, error = %err, "Worker quarantined");

        let mut event = ActivityEvent::new(
            EventType::WorkerTimedOut,
            format!("{} silent for {}s", worker.name, silent_for.as_secs()),
        )
        .with_worker(worker.id);
        if let Some(task_id) = worker.current_task_id {
            event = event.with_task(task_id);
        }
        self.store.record_event(&event).await?;

        if let Some(tx) = &self.lost_tx {
            let lost = WorkerLost {
                worker_id: worker.id,
                name: worker.name.clone(),
            };
            if let Err(e) = tx.try_send(lost) {
                debug!(worker_id = %worker.id, error = %e, "Lost-worker notice dropped");
            }
        }
        Ok(true)
    }

    /// Return an active task to pending and clear its assignment.
    async fn requeue(&self, task: &Task) -> Result<bool, DatabaseError> {
        let mut expect =
            TaskExpectation::any_status([TaskStatus::Assigned, TaskStatus::InProgress]);
        expect = match task.assigned_to {
            Some(w) => expect.assigned_to(w),
            None => expect.unassigned(),
        };
        let outcome = self
            .store
            .conditional_update_task(
                task.id,
                &expect,
                &TaskPatch::new().status(TaskStatus::Pending).unassign(),
            )
            .await?;
        if !outcome.is_applied() {
            return Ok(false);
        }

        info!(task_id = %task.id, title = %task.title, "Task requeued");
        let mut event = ActivityEvent::new(
            EventType::TaskRequeued,
            format!("{} returned to pending", task.title),
        )
        .with_task(task.id);
        if let Some(w) = task.assigned_to {
            event = event.with_worker(w);
        }
        self.store.record_event(&event).await?;
        Ok(true)
    }
}

/// Spawn the periodic health monitor.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop sweeping.
pub fn spawn_health_monitor(
    monitor: HealthMonitor,
    health: Arc<LoopHealth>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Health monitor started — checking every {}s, stale after {}s",
            monitor.config.check_interval.as_secs(),
            monitor.config.stale_threshold.as_secs()
        );

        let mut tick = tokio::time::interval(monitor.config.check_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Health monitor shutting down");
                return;
            }

            match monitor.sweep().await {
                Ok(_) => health.record_success(),
                Err(e) => {
                    health.record_failure(&e);
                }
            }
        }
    });

    (handle, shutdown_flag)
}
