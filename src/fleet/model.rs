//! Fleet data model: tasks, workers, activity, file changes, conflicts.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fleet::state::{ConflictStatus, TaskStatus, WorkerStatus};

/// Lowest accepted task priority.
pub const MIN_PRIORITY: i32 = 1;
/// Highest accepted task priority.
pub const MAX_PRIORITY: i32 = 5;
/// Priority given to tasks submitted without one.
pub const DEFAULT_PRIORITY: i32 = 3;

/// Rough size estimate attached by the task producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
    Xl,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Xl => "xl",
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trivial" => Ok(Self::Trivial),
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "xl" => Ok(Self::Xl),
            other => Err(format!("unknown complexity '{other}'")),
        }
    }
}

/// A single unit of decomposed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    /// Opaque payload handed to the executor.
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Higher is more urgent.
    pub priority: i32,
    /// Tasks that must reach `completed` before this one is runnable.
    #[serde(default)]
    pub depends_on: BTreeSet<Uuid>,
    /// The part of `depends_on` not yet satisfied.
    #[serde(default)]
    pub blocked_by: BTreeSet<Uuid>,
    /// Resource paths this task intends to touch.
    #[serde(default)]
    pub file_scope: BTreeSet<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Capability tags a worker must carry to run this task.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub estimated_complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: Decimal,
    #[serde(default)]
    pub duration_ms: u64,
    /// Set once the completion handler has released this task's dependents.
    #[serde(default)]
    pub unblock_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by the store on every conditional update.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Create a pending task with default priority.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: DEFAULT_PRIORITY,
            depends_on: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            file_scope: BTreeSet::new(),
            labels: Vec::new(),
            required_capabilities: BTreeSet::new(),
            estimated_complexity: Complexity::default(),
            assigned_to: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            result_summary: None,
            error_message: None,
            tokens_used: 0,
            cost_usd: Decimal::ZERO,
            duration_ms: 0,
            unblock_processed: false,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Builder: use a caller-chosen id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Builder: set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: set priority, clamped to the accepted range.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    /// Builder: declare dependencies. The task starts blocked on all of them.
    pub fn with_depends_on(mut self, deps: impl IntoIterator<Item = Uuid>) -> Self {
        self.depends_on = deps.into_iter().collect();
        self.blocked_by = self.depends_on.clone();
        self.status = if self.blocked_by.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };
        self
    }

    /// Builder: declare the file scope.
    pub fn with_file_scope<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.file_scope = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set labels.
    pub fn with_labels<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: require worker capabilities.
    pub fn with_required_capabilities<S: Into<String>>(
        mut self,
        caps: impl IntoIterator<Item = S>,
    ) -> Self {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the complexity estimate.
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.estimated_complexity = complexity;
        self
    }

    /// Pending with nothing left to wait on.
    pub fn is_runnable(&self) -> bool {
        self.status == TaskStatus::Pending && self.blocked_by.is_empty()
    }
}

/// An executor slot registered by a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    /// Slot name, e.g. `runner-3`.
    pub name: String,
    /// Executor kind reported at registration.
    pub kind: String,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<Uuid>,
    /// Most recent task this worker completed. Drives continuity routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_task_id: Option<Uuid>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
    #[serde(default)]
    pub total_tokens_used: u64,
    #[serde(default)]
    pub total_cost_usd: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Worker {
    /// Create an idle worker record with a fresh identity.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind: kind.into(),
            status: WorkerStatus::Idle,
            current_task_id: None,
            last_completed_task_id: None,
            capabilities: BTreeSet::new(),
            last_heartbeat: now,
            tasks_completed: 0,
            tasks_failed: 0,
            total_tokens_used: 0,
            total_cost_usd: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Builder: set capability tags.
    pub fn with_capabilities<S: Into<String>>(mut self, caps: impl IntoIterator<Item = S>) -> Self {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Idle with no task attached.
    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle && self.current_task_id.is_none()
    }

    /// Whether this worker carries every capability the task requires.
    pub fn can_run(&self, task: &Task) -> bool {
        task.required_capabilities.is_subset(&self.capabilities)
    }

    /// Time since the last heartbeat.
    pub fn silent_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_heartbeat)
    }
}

/// Kind of an activity log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Heartbeat,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRequeued,
    FileChanged,
    ConflictDetected,
    WorkerStarted,
    WorkerStopped,
    WorkerTimedOut,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::Heartbeat,
        EventType::TaskStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::TaskRequeued,
        EventType::FileChanged,
        EventType::ConflictDetected,
        EventType::WorkerStarted,
        EventType::WorkerStopped,
        EventType::WorkerTimedOut,
        EventType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskRequeued => "task_requeued",
            Self::FileChanged => "file_changed",
            Self::ConflictDetected => "conflict_detected",
            Self::WorkerStarted => "worker_started",
            Self::WorkerStopped => "worker_stopped",
            Self::WorkerTimedOut => "worker_timed_out",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

/// Append-only activity log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub event_type: EventType,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: Decimal,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: None,
            task_id: None,
            event_type,
            message: message.into(),
            files_changed: Vec::new(),
            tokens_used: 0,
            cost_usd: Decimal::ZERO,
            duration_ms: 0,
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker_id: Uuid) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Copy the usage figures of a finished task.
    pub fn with_result(mut self, result: &TaskResult) -> Self {
        self.files_changed = result.files_changed.clone();
        self.tokens_used = result.tokens_used;
        self.cost_usd = result.cost_usd;
        self.duration_ms = result.duration_ms;
        self
    }
}

/// How a file was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown change type '{other}'")),
        }
    }
}

/// Append-only record of a file touched while a task was in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub task_id: Uuid,
    pub file_path: String,
    pub change_type: ChangeType,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
    pub timestamp: DateTime<Utc>,
}

impl FileChange {
    pub fn new(
        worker_id: Uuid,
        task_id: Uuid,
        file_path: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id,
            task_id,
            file_path: file_path.into(),
            change_type,
            lines_added: 0,
            lines_removed: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// What kind of hazard a conflict describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    FileOverlap,
    DependencyViolation,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileOverlap => "file_overlap",
            Self::DependencyViolation => "dependency_violation",
        }
    }
}

impl FromStr for ConflictType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_overlap" => Ok(Self::FileOverlap),
            "dependency_violation" => Ok(Self::DependencyViolation),
            other => Err(format!("unknown conflict type '{other}'")),
        }
    }
}

/// A detected or potential concurrent-modification hazard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    pub conflict_type: ConflictType,
    pub status: ConflictStatus,
    pub worker_ids: BTreeSet<Uuid>,
    pub task_ids: BTreeSet<Uuid>,
    pub file_paths: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
}

impl Conflict {
    pub fn new(conflict_type: ConflictType, detected_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conflict_type,
            status: ConflictStatus::Detected,
            worker_ids: BTreeSet::new(),
            task_ids: BTreeSet::new(),
            file_paths: BTreeSet::new(),
            resolution: None,
            detected_at,
            resolved_at: None,
            version: 0,
        }
    }

    /// Whether two conflicts describe the same hazard. File overlaps are
    /// keyed by their file set, dependency violations by their task set.
    pub fn same_hazard(&self, other: &Conflict) -> bool {
        if self.conflict_type != other.conflict_type {
            return false;
        }
        match self.conflict_type {
            ConflictType::FileOverlap => self.file_paths == other.file_paths,
            ConflictType::DependencyViolation => self.task_ids == other.task_ids,
        }
    }
}

/// What an executor hands back for a finished task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: Decimal,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}
