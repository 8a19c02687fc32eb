//! Consecutive-failure tracking for the control loops.
//!
//! A loop reports every tick. Store failures in a row move it from healthy
//! to degraded and finally to fatal, at which point the fleet controller is
//! woken up to shut down.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Consecutive failures after which a loop is reported degraded.
pub const DEGRADED_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Healthy,
    Degraded,
    Fatal,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Failure counters for one loop.
#[derive(Debug)]
pub struct LoopHealth {
    name: &'static str,
    limit: u32,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    fatal: Arc<Notify>,
}

impl LoopHealth {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> LoopState {
        classify(self.consecutive_failures(), self.limit)
    }

    /// A tick finished without a store error.
    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if previous >= DEGRADED_AFTER {
            info!(loop_name = self.name, previous, "Loop recovered");
        }
    }

    /// A tick failed on store I/O. Returns the state after counting it.
    pub fn record_failure(&self, err: &dyn fmt::Display) -> LoopState {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let state = classify(failures, self.limit);
        match state {
            LoopState::Healthy => {
                warn!(loop_name = self.name, failures, error = %err, "Store error, retrying next tick");
            }
            LoopState::Degraded => {
                error!(loop_name = self.name, failures, error = %err, "Store degraded");
            }
            LoopState::Fatal => {
                error!(
                    loop_name = self.name,
                    failures,
                    error = %err,
                    "Store unreachable past failure limit"
                );
                self.fatal.notify_one();
            }
        }
        state
    }
}

fn classify(failures: u32, limit: u32) -> LoopState {
    if failures >= limit {
        LoopState::Fatal
    } else if failures >= DEGRADED_AFTER {
        LoopState::Degraded
    } else {
        LoopState::Healthy
    }
}

/// Health of every registered loop, plus the fatal wake-up.
#[derive(Debug)]
pub struct HealthBoard {
    limit: u32,
    loops: std::sync::RwLock<Vec<Arc<LoopHealth>>>,
    fatal: Arc<Notify>,
}

/// Point-in-time state of one loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub name: &'static str,
    pub state: LoopState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

impl HealthBoard {
    pub fn new(store_failure_limit: u32) -> Self {
        Self {
            limit: store_failure_limit.max(1),
            loops: std::sync::RwLock::new(Vec::new()),
            fatal: Arc::new(Notify::new()),
        }
    }

    /// Register a loop and hand back its counters.
    pub fn register(&self, name: &'static str) -> Arc<LoopHealth> {
        let health = Arc::new(LoopHealth {
            name,
            limit: self.limit,
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            fatal: Arc::clone(&self.fatal),
        });
        if let Ok(mut loops) = self.loops.write() {
            loops.push(Arc::clone(&health));
        }
        health
    }

    /// Worst state across all loops.
    pub fn overall(&self) -> LoopState {
        self.reports()
            .iter()
            .map(|r| r.state)
            .max()
            .unwrap_or(LoopState::Healthy)
    }

    pub fn reports(&self) -> Vec<LoopReport> {
        self.loops
            .read()
            .map(|loops| {
                loops
                    .iter()
                    .map(|l| LoopReport {
                        name: l.name,
                        state: l.state(),
                        consecutive_failures: l.consecutive_failures(),
                        total_failures: l.total_failures(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves once any loop reaches the failure limit.
    pub async fn fatal(&self) {
        self.fatal.notified().await;
    }
}
