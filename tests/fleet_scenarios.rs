//! End-to-end fleet scenarios.
//!
//! Each test drives the real scheduler, runners, completion handler and
//! health monitor against an in-memory store. Loops are stepped by hand
//! except in the controller test, which runs the whole fleet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;
use uuid::Uuid;

use codefleet::config::{CompletionConfig, FleetConfig, HealthConfig, SchedulerConfig, WorkerConfig};
use codefleet::error::{DependencyError, Error, ExecutionError};
use codefleet::fleet::completion::CompletionHandler;
use codefleet::fleet::health::HealthMonitor;
use codefleet::fleet::model::{ChangeType, Task, TaskResult};
use codefleet::fleet::scheduler::Scheduler;
use codefleet::fleet::state::{TaskStatus, WorkerStatus};
use codefleet::fleet::{FleetController, LocalSpawner, unblock_channel};
use codefleet::ops::FleetOps;
use codefleet::store::{LibSqlBackend, Store, TaskQuery};
use codefleet::worker::{Executor, ProgressReporter, ShellExecutor, WorkerRunner};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reports every scoped path as modified, then succeeds.
struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    fn kind(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<TaskResult, ExecutionError> {
        for path in &task.file_scope {
            progress
                .file_changed(path, ChangeType::Modified)
                .await
                .map_err(|e| ExecutionError::Spawn(e.to_string()))?;
        }
        Ok(TaskResult::succeeded(format!("done: {}", task.title)))
    }
}

async fn store() -> Arc<dyn Store> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        heartbeat_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        ..WorkerConfig::default()
    }
}

async fn runner(store: &Arc<dyn Store>, name: &str) -> WorkerRunner {
    WorkerRunner::register(
        Arc::clone(store),
        Arc::new(EchoExecutor),
        worker_config(),
        name,
    )
    .await
    .unwrap()
}

async fn task(store: &Arc<dyn Store>, id: Uuid) -> Task {
    store.get_task(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn dependent_task_follows_the_worker_that_ran_its_dependency() {
    let store = store().await;
    let ops = FleetOps::new(Arc::clone(&store));
    let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
    let completion = CompletionHandler::new(Arc::clone(&store), CompletionConfig::default());

    let t1 = Task::new("T1 schema").with_priority(5);
    let t2 = Task::new("T2 migration")
        .with_priority(3)
        .with_depends_on([t1.id]);
    let t3 = Task::new("T3 docs").with_priority(1);
    let (t1_id, t2_id) = (t1.id, t2.id);
    ops.add_tasks(vec![t1, t2, t3]).await.unwrap();
    assert_eq!(task(&store, t2_id).await.status, TaskStatus::Blocked);

    let mut a = runner(&store, "runner-a").await;
    let mut b = runner(&store, "runner-b").await;

    // T1 and T3 go out; T2 waits on T1.
    let first = scheduler.tick().await.unwrap();
    assert_eq!(first.assigned.len(), 2);
    assert!(first.assigned.iter().all(|(t, _)| *t != t2_id));
    let t1_worker = task(&store, t1_id).await.assigned_to.unwrap();

    assert!(a.poll_once().await.unwrap());
    assert!(b.poll_once().await.unwrap());
    assert_eq!(task(&store, t1_id).await.status, TaskStatus::Completed);

    let report = completion.handle(t1_id).await.unwrap();
    assert_eq!(report.released, vec![t2_id]);
    assert_eq!(task(&store, t2_id).await.status, TaskStatus::Pending);

    // Both workers are idle; T2 goes to the one that just finished T1.
    let second = scheduler.tick().await.unwrap();
    assert_eq!(second.assigned, vec![(t2_id, t1_worker)]);
}

#[tokio::test]
async fn overlapping_scope_waits_until_the_holder_finishes() {
    let store = store().await;
    let ops = FleetOps::new(Arc::clone(&store));
    let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());

    let t3 = Task::new("T3 login").with_priority(4).with_file_scope(["src/auth.py"]);
    let t4 = Task::new("T4 logout").with_priority(2).with_file_scope(["./src/auth.py"]);
    let (t3_id, t4_id) = (t3.id, t4.id);
    ops.add_tasks(vec![t3, t4]).await.unwrap();

    let mut a = runner(&store, "runner-a").await;
    let mut b = runner(&store, "runner-b").await;

    let first = scheduler.tick().await.unwrap();
    assert_eq!(first.assigned.len(), 1);
    assert_eq!(first.assigned[0].0, t3_id);
    assert_eq!(task(&store, t4_id).await.status, TaskStatus::Pending);

    a.poll_once().await.unwrap();
    b.poll_once().await.unwrap();
    assert_eq!(task(&store, t3_id).await.status, TaskStatus::Completed);

    let second = scheduler.tick().await.unwrap();
    assert_eq!(second.assigned.len(), 1);
    assert_eq!(second.assigned[0].0, t4_id);
    assert!(second.held.is_empty());
}

#[tokio::test]
async fn silent_worker_loses_its_task_to_a_live_one() {
    let store = store().await;
    let ops = FleetOps::new(Arc::clone(&store));
    let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
    let monitor = HealthMonitor::new(
        Arc::clone(&store),
        HealthConfig {
            check_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
        },
    );

    let id = ops.add_task(Task::new("refactor billing")).await.unwrap();
    let mut silent = runner(&store, "runner-silent").await;
    let first = scheduler.tick().await.unwrap();
    assert_eq!(first.assigned, vec![(id, silent.id())]);

    // The silent runner never polls or heartbeats.
    let later = Utc::now() + chrono::Duration::seconds(121);
    let sweep = monitor.sweep_at(later).await.unwrap();
    assert_eq!(sweep.quarantined, vec![silent.id()]);
    assert_eq!(sweep.requeued, vec![id]);

    let requeued = task(&store, id).await;
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.assigned_to, None);

    let mut live = runner(&store, "runner-live").await;
    let second = scheduler.tick().await.unwrap();
    assert_eq!(second.assigned, vec![(id, live.id())]);
    assert!(live.poll_once().await.unwrap());
    assert_eq!(task(&store, id).await.status, TaskStatus::Completed);

    // Offline records stay offline; the old runner notices and stops.
    assert!(!silent.poll_once().await.unwrap());
    let record = store.get_worker(silent.id()).await.unwrap().unwrap();
    assert_eq!(record.status, WorkerStatus::Offline);
}

#[tokio::test]
async fn cyclic_batch_is_rejected_whole() {
    let store = store().await;
    let ops = FleetOps::new(Arc::clone(&store));

    let a = Task::new("a");
    let b = Task::new("b").with_depends_on([a.id]);
    let c = Task::new("c").with_depends_on([b.id]);
    let a = a.with_depends_on([c.id]);
    let err = ops.add_tasks(vec![a, b, c]).await.unwrap_err();
    assert!(matches!(err, Error::Dependency(DependencyError::Cycle { .. })));

    let stored = store.query_tasks(&TaskQuery::all()).await.unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn duplicate_completion_delivery_changes_nothing() {
    let store = store().await;
    let ops = FleetOps::new(Arc::clone(&store));
    let scheduler = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
    let completion = CompletionHandler::new(Arc::clone(&store), CompletionConfig::default());
    let (tx, mut rx) = unblock_channel();

    let t1 = Task::new("T1");
    let t2 = Task::new("T2").with_depends_on([t1.id]);
    let (t1_id, t2_id) = (t1.id, t2.id);
    ops.add_tasks(vec![t1, t2]).await.unwrap();

    let mut a = runner(&store, "runner-a").await.with_unblock_queue(tx);
    scheduler.tick().await.unwrap();
    a.poll_once().await.unwrap();
    assert_eq!(rx.try_recv().unwrap(), t1_id);

    let first = completion.handle(t1_id).await.unwrap();
    assert_eq!(first.released, vec![t2_id]);
    let after_first = task(&store, t2_id).await;

    let second = completion.handle(t1_id).await.unwrap();
    assert!(second.released.is_empty() && second.narrowed.is_empty());
    let swept = completion.sweep().await.unwrap();
    assert!(swept.released.is_empty());

    let after_second = task(&store, t2_id).await;
    assert_eq!(after_second.status, TaskStatus::Pending);
    assert_eq!(after_second.version, after_first.version);
    assert!(task(&store, t1_id).await.unblock_processed);
}

#[tokio::test]
async fn concurrent_ticks_never_double_assign() {
    let store = store().await;
    let ops = FleetOps::new(Arc::clone(&store));
    let tasks: Vec<Task> = (0..6).map(|i| Task::new(format!("job {i}"))).collect();
    ops.add_tasks(tasks).await.unwrap();
    for i in 0..3 {
        runner(&store, &format!("runner-{i}")).await;
    }

    let first = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
    let second = Scheduler::new(Arc::clone(&store), SchedulerConfig::default());
    let (r1, r2) = tokio::join!(first.tick(), second.tick());
    let mut assigned = r1.unwrap().assigned.len() + r2.unwrap().assigned.len();
    // A worker released after a lost task race is picked up next tick.
    assigned += first.tick().await.unwrap().assigned.len();
    assert_eq!(assigned, 3);

    let active = store
        .query_tasks(&TaskQuery::with_status(TaskStatus::Assigned))
        .await
        .unwrap();
    assert_eq!(active.len(), 3);
    let mut per_worker: BTreeMap<Uuid, usize> = BTreeMap::new();
    for t in &active {
        *per_worker.entry(t.assigned_to.unwrap()).or_default() += 1;
    }
    assert_eq!(per_worker.len(), 3);
    assert!(per_worker.values().all(|n| *n == 1));

    for worker in store.list_workers().await.unwrap() {
        assert_eq!(worker.status, WorkerStatus::Working);
        let current = worker.current_task_id.unwrap();
        let t = task(&store, current).await;
        assert_eq!(t.assigned_to, Some(worker.id));
    }
}

#[tokio::test]
async fn controller_runs_a_chain_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let store = store().await;
    let ops = FleetOps::new(Arc::clone(&store));

    let t1 = Task::new("first").with_file_scope(["src/lib.rs"]);
    let t2 = Task::new("second").with_depends_on([t1.id]);
    let ids = ops.add_tasks(vec![t1, t2]).await.unwrap();

    let mut config = FleetConfig::default();
    config.scheduler.poll_interval = Duration::from_millis(20);
    config.scheduler.max_workers = 2;
    config.completion.poll_interval = Duration::from_millis(20);
    config.health.check_interval = Duration::from_millis(100);
    config.conflicts.scan_interval = Duration::from_millis(100);
    config.worker = WorkerConfig {
        workdir: dir.path().to_path_buf(),
        ..worker_config()
    };
    config.restart.shutdown_timeout = Duration::from_secs(2);
    config.validate().unwrap();

    let executor: Arc<dyn Executor> = Arc::new(ShellExecutor::new(
        "echo \"ran $CODEFLEET_TASK_TITLE\"",
        dir.path(),
    ));
    let (unblock_tx, unblock_rx) = unblock_channel();
    let spawner = Arc::new(LocalSpawner::new(
        Arc::clone(&store),
        config.worker.clone(),
        executor,
        unblock_tx,
    ));
    let controller =
        FleetController::new(Arc::clone(&store), config, spawner).with_unblock_queue(unblock_rx);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let fleet = tokio::spawn(controller.run(async {
        let _ = stop_rx.await;
    }));

    let done = timeout(TEST_TIMEOUT, async {
        loop {
            let counts = store.count_tasks_by_status().await.unwrap();
            if counts.get(&TaskStatus::Completed) == Some(&2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(done.is_ok(), "fleet did not finish both tasks");

    let second = task(&store, ids[1]).await;
    assert_eq!(second.result_summary.as_deref(), Some("ran second"));

    stop_tx.send(()).unwrap();
    let result = timeout(TEST_TIMEOUT, fleet).await.unwrap().unwrap();
    assert!(result.is_ok());

    for worker in store.list_workers().await.unwrap() {
        assert_eq!(worker.status, WorkerStatus::Offline);
        assert_eq!(worker.current_task_id, None);
    }
}
