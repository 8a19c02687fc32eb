//! Configuration types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Scheduler (auto-assignment loop) configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Loop cadence.
    pub poll_interval: Duration,
    /// Upper bound on concurrently active workers.
    pub max_workers: usize,
    /// Hold pending tasks whose scope touches the files of an unresolved
    /// conflict while any task the conflict names is still active.
    pub hold_conflicted_paths: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_workers: 5,
            hold_conflicted_paths: true,
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Heartbeat age after which a worker is quarantined.
    pub stale_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(120), // 2 minutes
        }
    }
}

/// Conflict detector configuration.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// How far back file changes are considered.
    pub window: Duration,
    pub scan_interval: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600), // 1 hour
            scan_interval: Duration::from_secs(30),
        }
    }
}

/// What happens to the dependents of a failed or cancelled task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Dependents stay blocked until an operator intervenes.
    #[default]
    StayBlocked,
    /// Cancel every transitive dependent that has not started.
    CancelDependents,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StayBlocked => write!(f, "stay_blocked"),
            Self::CancelDependents => write!(f, "cancel_dependents"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stay_blocked" => Ok(Self::StayBlocked),
            "cancel_dependents" => Ok(Self::CancelDependents),
            other => Err(format!(
                "expected stay_blocked or cancel_dependents, got '{other}'"
            )),
        }
    }
}

/// Completion/unblock handler configuration.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    /// Fallback scan for completions that never reached the unblock queue.
    pub poll_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Restart policy for worker slots.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Respawns allowed per slot before it is retired.
    pub max_restarts: u32,
    pub base_backoff: Duration,
    /// A failure this soon after the previous one doubles the delay.
    pub rapid_failure_window: Duration,
    pub max_backoff: Duration,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_timeout: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            base_backoff: Duration::from_secs(5),
            rapid_failure_window: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub heartbeat_interval: Duration,
    /// How often an idle worker looks for an assignment.
    pub poll_interval: Duration,
    pub workdir: PathBuf,
    /// Shell command run for each task.
    pub exec_command: Option<String>,
    /// Capability tags every spawned worker registers with.
    pub capabilities: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            workdir: PathBuf::from("."),
            exec_command: None,
            capabilities: Vec::new(),
        }
    }
}

/// Complete fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub conflicts: ConflictConfig,
    pub completion: CompletionConfig,
    pub restart: RestartPolicy,
    pub worker: WorkerConfig,
    /// Consecutive store failures in one loop before the fleet shuts down.
    pub store_failure_limit: u32,
    pub db_path: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
            conflicts: ConflictConfig::default(),
            completion: CompletionConfig::default(),
            restart: RestartPolicy::default(),
            worker: WorkerConfig::default(),
            store_failure_limit: 10,
            db_path: PathBuf::from("./data/codefleet.db"),
        }
    }
}

impl FleetConfig {
    /// Read configuration from `CODEFLEET_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = seconds(&lookup, "CODEFLEET_POLL_INTERVAL")? {
            config.scheduler.poll_interval = v;
            config.completion.poll_interval = v;
            config.worker.poll_interval = v;
        }
        if let Some(v) = parsed::<usize>(&lookup, "CODEFLEET_MAX_RUNNERS")? {
            config.scheduler.max_workers = v;
        }
        if let Some(v) = parsed::<bool>(&lookup, "CODEFLEET_HOLD_CONFLICTED_PATHS")? {
            config.scheduler.hold_conflicted_paths = v;
        }
        if let Some(v) = seconds(&lookup, "CODEFLEET_HEARTBEAT_INTERVAL")? {
            config.worker.heartbeat_interval = v;
        }
        if let Some(v) = seconds(&lookup, "CODEFLEET_STALE_THRESHOLD")? {
            config.health.stale_threshold = v;
        }
        if let Some(v) = seconds(&lookup, "CODEFLEET_HEALTH_INTERVAL")? {
            config.health.check_interval = v;
        }
        if let Some(v) = seconds(&lookup, "CODEFLEET_CONFLICT_WINDOW")? {
            config.conflicts.window = v;
        }
        if let Some(v) = seconds(&lookup, "CODEFLEET_CONFLICT_INTERVAL")? {
            config.conflicts.scan_interval = v;
        }
        if let Some(v) = parsed::<u32>(&lookup, "CODEFLEET_MAX_RESTARTS")? {
            config.restart.max_restarts = v;
        }
        if let Some(v) = parsed::<u32>(&lookup, "CODEFLEET_MAX_STORE_FAILURES")? {
            config.store_failure_limit = v;
        }
        if let Some(v) = parsed::<FailurePolicy>(&lookup, "CODEFLEET_FAILURE_POLICY")? {
            config.completion.failure_policy = v;
        }
        if let Some(v) = non_empty(&lookup, "CODEFLEET_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty(&lookup, "CODEFLEET_WORKDIR") {
            config.worker.workdir = PathBuf::from(v);
        }
        config.worker.exec_command = non_empty(&lookup, "CODEFLEET_EXEC_CMD");
        if let Some(v) = non_empty(&lookup, "CODEFLEET_CAPABILITIES") {
            config.worker.capabilities = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("CODEFLEET_POLL_INTERVAL", self.scheduler.poll_interval),
            ("CODEFLEET_HEARTBEAT_INTERVAL", self.worker.heartbeat_interval),
            ("CODEFLEET_STALE_THRESHOLD", self.health.stale_threshold),
            ("CODEFLEET_HEALTH_INTERVAL", self.health.check_interval),
            ("CODEFLEET_CONFLICT_WINDOW", self.conflicts.window),
            ("CODEFLEET_CONFLICT_INTERVAL", self.conflicts.scan_interval),
        ];
        for (key, value) in intervals {
            if value.is_zero() {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        if self.scheduler.max_workers == 0 {
            return Err(invalid("CODEFLEET_MAX_RUNNERS", "must be at least 1"));
        }
        if self.store_failure_limit == 0 {
            return Err(invalid("CODEFLEET_MAX_STORE_FAILURES", "must be at least 1"));
        }
        if self.health.stale_threshold <= self.worker.heartbeat_interval {
            return Err(invalid(
                "CODEFLEET_STALE_THRESHOLD",
                "must be longer than the heartbeat interval",
            ));
        }
        Ok(())
    }

    /// The executor command, required to run workers.
    pub fn require_exec_command(&self) -> Result<&str, ConfigError> {
        self.worker
            .exec_command
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("CODEFLEET_EXEC_CMD".to_string()))
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, format!("'{raw}': {e}"))),
        None => Ok(None),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parsed::<u64>(lookup, key)?.map(Duration::from_secs))
}
