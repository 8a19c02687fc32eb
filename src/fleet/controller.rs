//! Fleet controller — owns the worker slots and the control loops.
//!
//! Slots are named `runner-N` from a counter that only grows. The
//! controller reacts to three inputs:
//! - scale signals from the scheduler,
//! - lost-worker notices from the health monitor,
//! - a short reconcile tick that reaps finished runners and respawns slots
//!   whose backoff has elapsed.
//!
//! Scale-down never interrupts a task: an extra slot is flagged and its
//! runner stops at the next task boundary. Only shutdown past
//! `shutdown_timeout` aborts a runner.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{FleetConfig, RestartPolicy, WorkerConfig};
use crate::error::FleetError;
use crate::fleet::completion::{
    CompletionHandler, UnblockReceiver, UnblockSender, spawn_completion_handler, unblock_channel,
};
use crate::fleet::conflict::{ConflictDetector, spawn_conflict_detector};
use crate::fleet::health::{HealthMonitor, WorkerLost, spawn_health_monitor};
use crate::fleet::loop_health::HealthBoard;
use crate::fleet::scheduler::{ScaleSignal, Scheduler, spawn_scheduler};
use crate::fleet::state::{TaskStatus, WorkerStatus};
use crate::store::{Store, TaskExpectation, TaskPatch, TaskQuery, WorkerExpectation, WorkerPatch};
use crate::worker::{Executor, RunnerExit, WorkerRunner};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for the control loops to notice their flags.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running worker.
pub struct WorkerHandle {
    pub worker_id: Uuid,
    pub join: JoinHandle<RunnerExit>,
    pub shutdown: Arc<AtomicBool>,
}

/// Starts a worker for a slot.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, slot: &str) -> Result<WorkerHandle, FleetError>;
}

/// Runs workers as tasks on the local runtime.
pub struct LocalSpawner {
    store: Arc<dyn Store>,
    config: WorkerConfig,
    executor: Arc<dyn Executor>,
    unblock_tx: UnblockSender,
}

impl LocalSpawner {
    pub fn new(
        store: Arc<dyn Store>,
        config: WorkerConfig,
        executor: Arc<dyn Executor>,
        unblock_tx: UnblockSender,
    ) -> Self {
        Self {
            store,
            config,
            executor,
            unblock_tx,
        }
    }
}

#[async_trait]
impl WorkerSpawner for LocalSpawner {
    async fn spawn(&self, slot: &str) -> Result<WorkerHandle, FleetError> {
        let runner = WorkerRunner::register(
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            self.config.clone(),
            slot,
        )
        .await
        .map_err(|e| FleetError::SpawnFailed {
            slot: slot.to_string(),
            reason: e.to_string(),
        })?
        .with_unblock_queue(self.unblock_tx.clone());

        let worker_id = runner.id();
        let shutdown = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(runner.run(Arc::clone(&shutdown)));
        Ok(WorkerHandle {
            worker_id,
            join,
            shutdown,
        })
    }
}

/// One logical worker position.
struct Slot {
    name: String,
    handle: Option<WorkerHandle>,
    /// Set on scale-down. The slot is removed once its runner exits.
    draining: bool,
    /// Restart budget spent. Keeps its place in the target and never respawns.
    retired: bool,
    restarts: u32,
    backoff: Option<Duration>,
    last_failure: Option<Instant>,
    respawn_at: Option<Instant>,
}

impl Slot {
    fn new(name: String) -> Self {
        Self {
            name,
            handle: None,
            draining: false,
            retired: false,
            restarts: 0,
            backoff: None,
            last_failure: None,
            respawn_at: None,
        }
    }
}

/// Delay before the next respawn of a slot, before jitter.
///
/// A failure inside the rapid window doubles the previous delay up to the
/// cap. Anything slower starts again from the base.
fn next_backoff(
    policy: &RestartPolicy,
    previous: Option<Duration>,
    since_last_failure: Option<Duration>,
) -> Duration {
    match (previous, since_last_failure) {
        (Some(prev), Some(since)) if since <= policy.rapid_failure_window => {
            (prev * 2).min(policy.max_backoff)
        }
        _ => policy.base_backoff,
    }
}

/// ±10% jitter.
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    delay.mul_f64(factor)
}

/// Record a failure on `slot` and schedule its respawn. False once the slot
/// has used up its restart budget.
///
/// Only failures inside the rapid window count against the budget; a slower
/// failure starts the count over.
fn plan_restart(slot: &mut Slot, policy: &RestartPolicy, now: Instant) -> bool {
    let since = slot.last_failure.map(|at| now.saturating_duration_since(at));
    if since.is_some_and(|since| since > policy.rapid_failure_window) {
        slot.restarts = 0;
    }
    slot.restarts += 1;
    if slot.restarts > policy.max_restarts {
        slot.respawn_at = None;
        return false;
    }
    let delay = next_backoff(policy, slot.backoff, since);
    slot.backoff = Some(delay);
    slot.last_failure = Some(now);
    slot.respawn_at = Some(now + jitter(delay));
    true
}

fn retire(slot: &mut Slot, max_restarts: u32) {
    slot.retired = true;
    let err = FleetError::RestartBudgetExhausted {
        slot: slot.name.clone(),
        max: max_restarts,
    };
    error!(error = %err, "Slot retired");
}

pub struct FleetController {
    store: Arc<dyn Store>,
    config: FleetConfig,
    spawner: Arc<dyn WorkerSpawner>,
    board: Arc<HealthBoard>,
    unblock_rx: Option<UnblockReceiver>,
    slots: Vec<Slot>,
    next_slot: usize,
}

impl FleetController {
    pub fn new(store: Arc<dyn Store>, config: FleetConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let board = Arc::new(HealthBoard::new(config.store_failure_limit));
        Self {
            store,
            config,
            spawner,
            board,
            unblock_rx: None,
            slots: Vec::new(),
            next_slot: 1,
        }
    }

    /// Consume the queue the spawned runners push completions onto.
    pub fn with_unblock_queue(mut self, rx: UnblockReceiver) -> Self {
        self.unblock_rx = Some(rx);
        self
    }

    pub fn health_board(&self) -> Arc<HealthBoard> {
        Arc::clone(&self.board)
    }

    /// Slots that count toward the target: running, waiting to respawn, or
    /// retired.
    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| !s.draining).count()
    }

    /// Slots whose restart budget is spent.
    pub fn retired_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.retired).count()
    }

    pub fn slot_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| !s.draining)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Bring the number of live workers to `n`, capped at `max_workers`.
    pub async fn scale_to(&mut self, n: usize) {
        let target = n.min(self.config.scheduler.max_workers);
        if target < n {
            debug!(requested = n, target, "Scale request clamped to max_workers");
        }

        let active = self.active_slots();
        if target > active {
            info!(from = active, to = target, "Scaling up");
            for _ in active..target {
                let name = format!("runner-{}", self.next_slot);
                self.next_slot += 1;
                let mut slot = Slot::new(name);
                self.start(&mut slot).await;
                self.slots.push(slot);
            }
        } else if target < active {
            let count = (active - target).min(active - self.retired_slots());
            if count > 0 {
                info!(from = active, to = active - count, "Scaling down");
                self.drain(count).await;
            }
        }
    }

    async fn start(&self, slot: &mut Slot) {
        match self.spawner.spawn(&slot.name).await {
            Ok(handle) => {
                debug!(slot = %slot.name, worker_id = %handle.worker_id, "Slot started");
                slot.handle = Some(handle);
                slot.respawn_at = None;
            }
            Err(e) => {
                warn!(slot = %slot.name, error = %e, "Spawn failed");
                if !plan_restart(slot, &self.config.restart, Instant::now()) {
                    retire(slot, self.config.restart.max_restarts);
                }
            }
        }
    }

    /// Flag `count` slots to stop at their next task boundary. Slots waiting
    /// to respawn go first, then idle workers, then the newest. Retired slots
    /// are never drained.
    async fn drain(&mut self, count: usize) {
        let idle: Vec<Uuid> = match self.store.list_workers().await {
            Ok(workers) => workers
                .into_iter()
                .filter(|w| w.is_available())
                .map(|w| w.id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Could not read workers for scale-down, draining newest");
                Vec::new()
            }
        };

        let rank = |slot: &Slot| match &slot.handle {
            None => 0,
            Some(h) if idle.contains(&h.worker_id) => 1,
            Some(_) => 2,
        };
        let mut candidates: Vec<usize> = (0..self.slots.len())
            .filter(|&i| !self.slots[i].draining && !self.slots[i].retired)
            .collect();
        // Newest first within a rank.
        candidates.sort_by_key(|&i| (rank(&self.slots[i]), std::cmp::Reverse(i)));

        for &i in candidates.iter().take(count) {
            let slot = &mut self.slots[i];
            slot.draining = true;
            slot.respawn_at = None;
            if let Some(handle) = &slot.handle {
                handle.shutdown.store(true, Ordering::Relaxed);
            }
            debug!(slot = %slot.name, "Slot draining");
        }
        self.slots.retain(|s| !(s.draining && s.handle.is_none()));
    }

    /// The health monitor took this worker offline.
    pub async fn on_worker_lost(&mut self, lost: WorkerLost) {
        let Some(i) = self
            .slots
            .iter()
            .position(|s| s.handle.as_ref().is_some_and(|h| h.worker_id == lost.worker_id))
        else {
            debug!(worker = %lost.name, "Lost worker is not ours");
            return;
        };

        // Its record is offline and its task requeued; nothing it writes now lands.
        if let Some(handle) = self.slots[i].handle.take() {
            handle.join.abort();
        }
        self.fail_slot(i);
    }

    fn fail_slot(&mut self, i: usize) {
        let policy = self.config.restart.clone();
        let slot = &mut self.slots[i];
        if slot.draining {
            self.slots.remove(i);
            return;
        }
        if plan_restart(slot, &policy, Instant::now()) {
            info!(
                slot = %slot.name,
                restarts = slot.restarts,
                delay_secs = slot.backoff.map(|d| d.as_secs()).unwrap_or_default(),
                "Slot scheduled for respawn"
            );
        } else {
            retire(slot, policy.max_restarts);
        }
    }

    /// Reap finished runners and respawn slots whose backoff elapsed.
    pub async fn reconcile(&mut self) {
        let mut i = 0;
        while i < self.slots.len() {
            let finished = self.slots[i]
                .handle
                .as_ref()
                .is_some_and(|h| h.join.is_finished());
            if !finished {
                i += 1;
                continue;
            }

            let Some(handle) = self.slots[i].handle.take() else {
                i += 1;
                continue;
            };
            let exit = handle.join.await;
            let slot = &self.slots[i];
            match exit {
                Ok(RunnerExit::Shutdown) if slot.draining => {
                    debug!(slot = %slot.name, "Drained slot exited");
                    self.slots.remove(i);
                    continue;
                }
                Ok(exit) => {
                    warn!(slot = %slot.name, ?exit, "Runner exited");
                }
                Err(e) => {
                    error!(slot = %slot.name, error = %e, "Runner panicked");
                }
            }
            let before = self.slots.len();
            self.fail_slot(i);
            if self.slots.len() == before {
                i += 1;
            }
        }

        let now = Instant::now();
        let due: Vec<usize> = (0..self.slots.len())
            .filter(|&i| {
                let s = &self.slots[i];
                s.handle.is_none() && !s.draining && s.respawn_at.is_some_and(|at| at <= now)
            })
            .collect();
        for i in due.into_iter().rev() {
            let mut slot = self.slots.remove(i);
            info!(slot = %slot.name, attempt = slot.restarts, "Respawning slot");
            self.start(&mut slot).await;
            self.slots.insert(i, slot);
        }
    }

    /// Run the control loops and the worker slots until `shutdown` resolves
    /// or a loop loses the store past the failure limit.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), FleetError> {
        let (scale_tx, mut scale_rx) = mpsc::channel::<ScaleSignal>(16);
        let (lost_tx, mut lost_rx) = mpsc::channel::<WorkerLost>(64);
        let unblock_rx = self
            .unblock_rx
            .take()
            .unwrap_or_else(|| unblock_channel().1);

        let mut loops = Vec::new();
        loops.push(spawn_scheduler(
            Scheduler::new(Arc::clone(&self.store), self.config.scheduler.clone())
                .with_scale_signals(scale_tx),
            self.board.register("scheduler"),
        ));
        loops.push(spawn_completion_handler(
            CompletionHandler::new(Arc::clone(&self.store), self.config.completion.clone()),
            unblock_rx,
            self.board.register("completion"),
        ));
        loops.push(spawn_health_monitor(
            HealthMonitor::new(Arc::clone(&self.store), self.config.health.clone())
                .with_lost_workers(lost_tx),
            self.board.register("health"),
        ));
        loops.push(spawn_conflict_detector(
            ConflictDetector::new(Arc::clone(&self.store), self.config.conflicts.window),
            self.config.conflicts.scan_interval,
            self.board.register("conflicts"),
        ));

        info!(
            max_workers = self.config.scheduler.max_workers,
            "Fleet controller started"
        );

        let board = Arc::clone(&self.board);
        let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                _ = board.fatal() => {
                    let err = FleetError::StoreUnavailable {
                        consecutive_failures: self.config.store_failure_limit,
                    };
                    error!(error = %err, "Stopping fleet");
                    break Err(err);
                }
                Some(ScaleSignal::ScaleTo(n)) = scale_rx.recv() => {
                    self.scale_to(n).await;
                }
                Some(lost) = lost_rx.recv() => {
                    self.on_worker_lost(lost).await;
                }
                _ = reconcile.tick() => {
                    self.reconcile().await;
                }
            }
        };

        let mut stops = Vec::with_capacity(loops.len());
        let mut aborts = Vec::with_capacity(loops.len());
        for (handle, flag) in loops {
            flag.store(true, Ordering::Relaxed);
            aborts.push(handle.abort_handle());
            stops.push(handle);
        }
        self.shutdown_workers().await;
        if tokio::time::timeout(LOOP_STOP_TIMEOUT, join_all(stops))
            .await
            .is_err()
        {
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Fleet controller stopped");
        result
    }

    /// Flag every runner, wait for the task boundary up to the shutdown
    /// timeout, then abort stragglers and release their records.
    async fn shutdown_workers(&mut self) {
        let handles: Vec<WorkerHandle> = self
            .slots
            .drain(..)
            .filter_map(|mut s| s.handle.take())
            .collect();
        if handles.is_empty() {
            return;
        }
        for handle in &handles {
            handle.shutdown.store(true, Ordering::Relaxed);
        }
        info!(workers = handles.len(), "Waiting for workers to finish current tasks");

        let deadline = Instant::now() + self.config.restart.shutdown_timeout;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle.join).await.is_ok() {
                continue;
            }
            handle.join.abort();
            warn!(worker_id = %handle.worker_id, "Worker did not stop in time, aborted");
            self.release_aborted(handle.worker_id).await;
        }
    }

    async fn release_aborted(&self, worker_id: Uuid) {
        if let Err(e) = self
            .store
            .conditional_update_worker(
                worker_id,
                &WorkerExpectation::live(),
                &WorkerPatch::new()
                    .status(WorkerStatus::Offline)
                    .current_task(None),
            )
            .await
        {
            warn!(%worker_id, error = %e, "Failed to mark aborted worker offline");
            return;
        }

        let active = self
            .store
            .query_tasks(
                &TaskQuery::with_statuses([TaskStatus::Assigned, TaskStatus::InProgress])
                    .assigned_to(worker_id),
            )
            .await;
        let tasks = match active {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(%worker_id, error = %e, "Failed to read tasks of aborted worker");
                return;
            }
        };
        for task in tasks {
            let requeued = self
                .store
                .conditional_update_task(
                    task.id,
                    &TaskExpectation::any_status([TaskStatus::Assigned, TaskStatus::InProgress])
                        .assigned_to(worker_id),
                    &TaskPatch::new().status(TaskStatus::Pending).unassign(),
                )
                .await;
            match requeued {
                Ok(outcome) if outcome.is_applied() => {
                    info!(task_id = %task.id, "Task of aborted worker requeued");
                }
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to requeue task"),
            }
        }
    }
}
