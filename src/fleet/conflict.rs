//! Conflict detector — finds concurrent-modification hazards.
//!
//! Three sources are scanned on every pass:
//! 1. recent file changes touched by more than one worker,
//! 2. pairs of active tasks whose declared scopes overlap,
//! 3. active tasks with a dependency that has not completed.
//!
//! A hazard already covered by an unresolved conflict is not re-created.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::fleet::loop_health::LoopHealth;
use crate::fleet::model::{ActivityEvent, Conflict, ConflictType, EventType, Task};
use crate::fleet::scope;
use crate::fleet::state::TaskStatus;
use crate::store::{Store, TaskQuery};

pub struct ConflictDetector {
    store: Arc<dyn Store>,
    window: Duration,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn Store>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Scan the default window ending now.
    pub async fn detect(&self) -> Result<Vec<Conflict>, DatabaseError> {
        self.detect_in(self.window, Utc::now()).await
    }

    /// Scan file changes with `timestamp >= now - window` and the current
    /// active task set. Returns the conflicts created by this pass.
    pub async fn detect_in(
        &self,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Conflict>, DatabaseError> {
        let since = now - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::hours(1));
        let changes = self.store.list_file_changes_since(since).await?;
        let active = self
            .store
            .query_tasks(&TaskQuery::with_statuses([
                TaskStatus::Assigned,
                TaskStatus::InProgress,
            ]))
            .await?;
        let mut known = self.store.list_conflicts(true).await?;

        let mut candidates = Vec::new();

        // 1. Same file touched by more than one worker.
        let mut by_path: BTreeMap<String, (BTreeSet<Uuid>, BTreeSet<Uuid>)> = BTreeMap::new();
        for change in &changes {
            let entry = by_path.entry(scope::normalize(&change.file_path)).or_default();
            entry.0.insert(change.worker_id);
            entry.1.insert(change.task_id);
        }
        for (path, (workers, tasks)) in by_path {
            if workers.len() > 1 {
                let mut conflict = Conflict::new(ConflictType::FileOverlap, now);
                conflict.file_paths.insert(path);
                conflict.worker_ids = workers;
                conflict.task_ids = tasks;
                candidates.push(conflict);
            }
        }

        // 2. Active tasks whose scopes overlap.
        for (i, a) in active.iter().enumerate() {
            for b in &active[i + 1..] {
                let hits = scope::overlapping_paths(&a.file_scope, &b.file_scope);
                if hits.is_empty() {
                    continue;
                }
                let mut conflict = Conflict::new(ConflictType::FileOverlap, now);
                conflict.file_paths = hits;
                conflict.task_ids = BTreeSet::from([a.id, b.id]);
                conflict.worker_ids = [a.assigned_to, b.assigned_to].into_iter().flatten().collect();
                candidates.push(conflict);
            }
        }

        // 3. Active tasks running ahead of their dependencies.
        for task in &active {
            let unmet = self.unmet_dependencies(task).await?;
            if unmet.is_empty() {
                continue;
            }
            let mut conflict = Conflict::new(ConflictType::DependencyViolation, now);
            conflict.task_ids = std::iter::once(task.id).chain(unmet).collect();
            conflict.worker_ids = task.assigned_to.into_iter().collect();
            conflict.file_paths = task.file_scope.clone();
            candidates.push(conflict);
        }

        let mut created = Vec::new();
        for conflict in candidates {
            if known.iter().any(|k| k.same_hazard(&conflict)) {
                debug!(paths = ?conflict.file_paths, "Conflict already recorded");
                continue;
            }
            self.store.create_conflict(&conflict).await?;
            warn!(
                conflict_id = %conflict.id,
                conflict_type = conflict.conflict_type.as_str(),
                paths = ?conflict.file_paths,
                tasks = conflict.task_ids.len(),
                "Conflict detected"
            );
            let event = ActivityEvent::new(
                EventType::ConflictDetected,
                format!(
                    "{} on {}",
                    conflict.conflict_type.as_str(),
                    conflict
                        .file_paths
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .with_metadata(serde_json::json!({
                "conflict_id": conflict.id,
                "task_ids": conflict.task_ids,
                "worker_ids": conflict.worker_ids,
            }));
            self.store.record_event(&event).await?;

            known.push(conflict.clone());
            created.push(conflict);
        }
        Ok(created)
    }

    async fn unmet_dependencies(&self, task: &Task) -> Result<Vec<Uuid>, DatabaseError> {
        let mut unmet = Vec::new();
        for dep in &task.depends_on {
            match self.store.get_task(*dep).await? {
                Some(d) if d.status == TaskStatus::Completed => {}
                _ => unmet.push(*dep),
            }
        }
        Ok(unmet)
    }
}

/// Spawn the periodic conflict scan.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop scanning.
pub fn spawn_conflict_detector(
    detector: ConflictDetector,
    scan_interval: Duration,
    health: Arc<LoopHealth>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Conflict detector started — scanning every {}s over a {}s window",
            scan_interval.as_secs(),
            detector.window.as_secs()
        );

        let mut tick = tokio::time::interval(scan_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Conflict detector shutting down");
                return;
            }

            match detector.detect().await {
                Ok(created) => {
                    health.record_success();
                    if !created.is_empty() {
                        debug!(count = created.len(), "Conflict scan recorded new conflicts");
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
    use crate::fleet::model::{ChangeType, FileChange};
    use crate::store::{LibSqlBackend, TaskExpectation, TaskPatch};

    async fn setup() -> (Arc<dyn Store>, ConflictDetector) {
        let store: Arc<dyn Store> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let detector = ConflictDetector::new(Arc::clone(&store), Duration::from_secs(3600));
        (store, detector)
    }

    async fn force_status(store: &Arc<dyn Store>, task: &Task, status: TaskStatus, worker: Uuid) {
        store
            .conditional_update_task(
                task.id,
                &TaskExpectation::default(),
                &TaskPatch::new().status(status).assign(worker, Utc::now()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shared_file_across_workers_is_a_conflict() {
        let (store, detector) = setup().await;
        let (w1, w2) = (Uuid::new_v4(), Uuid::new_v4());
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .record_file_change(&FileChange::new(w1, t1, "src/auth.py", ChangeType::Modified))
            .await
            .unwrap();
        store
            .record_file_change(&FileChange::new(w2, t2, "./src/auth.py", ChangeType::Modified))
            .await
            .unwrap();
        store
            .record_file_change(&FileChange::new(w1, t1, "src/solo.py", ChangeType::Created))
            .await
            .unwrap();

        let created = detector.detect().await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].conflict_type, ConflictType::FileOverlap);
        assert_eq!(
            created[0].file_paths,
            BTreeSet::from(["src/auth.py".to_string()])
        );
        assert_eq!(created[0].worker_ids, BTreeSet::from([w1, w2]));

        // Idempotent within the window.
        assert!(detector.detect().await.unwrap().is_empty());
        assert_eq!(store.list_conflicts(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changes_outside_window_are_ignored() {
        let (store, detector) = setup().await;
        let old = Utc::now() - chrono::Duration::hours(3);
        for worker in [Uuid::new_v4(), Uuid::new_v4()] {
            store
                .record_file_change(
                    &FileChange::new(worker, Uuid::new_v4(), "src/a.rs", ChangeType::Modified)
                        .at(old),
                )
                .await
                .unwrap();
        }
        assert!(detector.detect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlapping_active_scopes_are_a_conflict() {
        let (store, detector) = setup().await;
        let t3 = Task::new("T3").with_file_scope(["src/auth.py"]);
        let t4 = Task::new("T4").with_file_scope(["src"]);
        store.create_tasks(&[t3.clone(), t4.clone()]).await.unwrap();
        force_status(&store, &t3, TaskStatus::InProgress, Uuid::new_v4()).await;
        force_status(&store, &t4, TaskStatus::InProgress, Uuid::new_v4()).await;

        let created = detector.detect().await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].task_ids, BTreeSet::from([t3.id, t4.id]));
        assert_eq!(created[0].worker_ids.len(), 2);
    }

    #[tokio::test]
    async fn active_task_with_unmet_dependency_is_a_violation() {
        let (store, detector) = setup().await;
        let dep = Task::new("dep");
        let eager = Task::new("eager").with_depends_on([dep.id]);
        store.create_tasks(&[dep.clone(), eager.clone()]).await.unwrap();
        force_status(&store, &eager, TaskStatus::InProgress, Uuid::new_v4()).await;

        let created = detector.detect().await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].conflict_type, ConflictType::DependencyViolation);
        assert!(created[0].task_ids.contains(&dep.id));

        let events = store.list_events(10).await.unwrap();
        assert_eq!(events[0].event_type, EventType::ConflictDetected);
    }
}
