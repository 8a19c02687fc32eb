//! Executor seam: the code that actually carries out a task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DatabaseError, ExecutionError};
use crate::fleet::model::{ActivityEvent, ChangeType, EventType, FileChange, Task, TaskResult};
use crate::store::Store;

/// Runs one task to completion.
///
/// The runner owns every status transition. An executor only does the work
/// and reports files it touches through the [`ProgressReporter`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Kind string recorded on the worker record.
    fn kind(&self) -> &str;

    async fn execute(
        &self,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<TaskResult, ExecutionError>;
}

/// Records file changes made while a task is in progress.
pub struct ProgressReporter {
    store: Arc<dyn Store>,
    worker_id: Uuid,
    task_id: Uuid,
    touched: Mutex<Vec<String>>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn Store>, worker_id: Uuid, task_id: Uuid) -> Self {
        Self {
            store,
            worker_id,
            task_id,
            touched: Mutex::new(Vec::new()),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Insert a file change and its activity event.
    pub async fn file_changed(
        &self,
        path: &str,
        change_type: ChangeType,
    ) -> Result<(), DatabaseError> {
        let change = FileChange::new(self.worker_id, self.task_id, path, change_type);
        self.store.record_file_change(&change).await?;

        let event = ActivityEvent::new(
            EventType::FileChanged,
            format!("{} {}", change_type.as_str(), path),
        )
        .with_worker(self.worker_id)
        .with_task(self.task_id);
        self.store.record_event(&event).await?;

        debug!(task_id = %self.task_id, path, change = change_type.as_str(), "File change recorded");
        let mut touched = self.touched.lock().await;
        if !touched.iter().any(|p| p == path) {
            touched.push(path.to_string());
        }
        Ok(())
    }

    /// Paths reported so far, in first-seen order.
    pub async fn files_changed(&self) -> Vec<String> {
        self.touched.lock().await.clone()
    }
}
