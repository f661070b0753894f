//! Projection lifecycle state and counters.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use strand_eventlog::Position;

/// Lifecycle of one projection.
///
/// `Idle → ResolvingStart → Streaming → (Draining | Faulted) → Stopped`.
/// `Faulted` is terminal for the run and carries the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProjectionState {
    Idle,
    ResolvingStart,
    Streaming,
    Draining,
    Faulted { reason: String },
    Stopped,
}

impl ProjectionState {
    /// A run is in progress.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProjectionState::ResolvingStart | ProjectionState::Streaming | ProjectionState::Draining
        )
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self, ProjectionState::Faulted { .. })
    }
}

/// Cumulative processing counters of a projection.
#[derive(Debug)]
pub(crate) struct Counters {
    applied: AtomicU64,
    retried: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    /// Highest position below which everything is processed, -1 when none
    position: AtomicI64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            applied: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            position: AtomicI64::new(-1),
        }
    }
}

impl Counters {
    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_position(&self, position: Option<Position>) {
        self.position.store(position.unwrap_or(-1), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn position(&self) -> Option<Position> {
        let position = self.position.load(Ordering::Relaxed);
        (position >= 0).then_some(position)
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Events applied successfully
    pub applied: u64,
    /// Re-attempts after a handler failure
    pub retried: u64,
    /// Events passed over by the failure policy
    pub skipped: u64,
    /// Handler invocations that returned an error
    pub failed: u64,
}

/// Status of a registered projection, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectionStatus {
    pub name: String,
    pub stream: String,
    pub partitioned: bool,
    #[serde(flatten)]
    pub state: ProjectionState,
    /// Every event up to this position has been processed
    pub position: Option<Position>,
    pub counters: CounterSnapshot,
}
