//! Task and worker state machines.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Runnable once `blocked_by` is empty.
    Pending,
    /// Claimed by a worker that has not started it yet.
    Assigned,
    /// The worker reported it started executing.
    InProgress,
    Completed,
    Failed,
    /// Waiting on at least one dependency.
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::Cancelled,
    ];

    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // Any live task can be cancelled by the operator
            (Pending | Assigned | InProgress | Blocked, Cancelled) |
            // Scheduler
            (Pending, Assigned) |
            // Worker reports
            (Assigned, InProgress) | (InProgress, Completed) | (InProgress, Failed) |
            // Health Monitor requeue
            (Assigned | InProgress, Pending) |
            // Completion Handler / operator unblock
            (Blocked, Pending) |
            // Operator retry / reset
            (Failed, Pending)
        )
    }

    /// Terminal statuses are never reassigned.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Held by a worker right now.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

/// Lifecycle status of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Paused,
    /// Quarantined or shut down. Never revived: a returning process
    /// re-registers under a new id.
    Offline,
    Error,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 5] = [
        WorkerStatus::Idle,
        WorkerStatus::Working,
        WorkerStatus::Paused,
        WorkerStatus::Offline,
        WorkerStatus::Error,
    ];

    /// Whether the worker is expected to be heartbeating.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Idle | Self::Working | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Paused => "paused",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown worker status '{s}'"))
    }
}

/// Review status of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Detected,
    Resolving,
    Resolved,
    Escalated,
}

impl ConflictStatus {
    pub const ALL: [ConflictStatus; 4] = [
        ConflictStatus::Detected,
        ConflictStatus::Resolving,
        ConflictStatus::Resolved,
        ConflictStatus::Escalated,
    ];

    /// Everything except `resolved` still needs attention.
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, Self::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConflictStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown conflict status '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn task_transitions_invalid() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Assigned));
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Assigned));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn status_strings_match_serde() {
        for status in TaskStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        for status in WorkerStatus::ALL {
            assert_eq!(status.as_str().parse::<WorkerStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn unresolved_conflicts() {
        assert!(ConflictStatus::Detected.is_unresolved());
        assert!(ConflictStatus::Escalated.is_unresolved());
        assert!(!ConflictStatus::Resolved.is_unresolved());
    }
}
