//! Per-projection processing options: failure policy, checkpoint cadence,
//! queueing and backpressure.

use crate::error::{ProjectionError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every failure, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.checked_mul(factor).map_or(max, |delay| delay.min(max))
            },
        }
    }
}

/// What happens once retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    Skip,
    Halt,
}

/// Reaction to a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Re-apply the same event on the same worker without advancing.
    /// `max_attempts` counts every apply invocation, the first one included.
    Retry {
        max_attempts: u32,
        backoff: Backoff,
        on_exhausted: Exhausted,
    },
    /// Log and advance past the event
    Skip,
    /// Stop the projection and report it as faulted
    Halt,
}

impl FailurePolicy {
    /// Retry policy that halts when attempts run out.
    pub fn retry(max_attempts: u32, backoff: Backoff) -> Self {
        FailurePolicy::Retry {
            max_attempts,
            backoff,
            on_exhausted: Exhausted::Halt,
        }
    }

    /// Attempts granted to a failing storage operation.
    pub fn storage_attempts(&self) -> u32 {
        match self {
            FailurePolicy::Retry { max_attempts, .. } => (*max_attempts).max(1),
            FailurePolicy::Skip | FailurePolicy::Halt => 1,
        }
    }

    /// Delay after the `failures`-th consecutive storage failure.
    pub fn storage_delay(&self, failures: u32) -> Duration {
        match self {
            FailurePolicy::Retry { backoff, .. } => backoff.delay(failures),
            FailurePolicy::Skip | FailurePolicy::Halt => Duration::ZERO,
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::retry(3, Backoff::Fixed(Duration::from_millis(100)))
    }
}

/// When workers persist their progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointCadence {
    /// Save after this many processed events (1 = every event)
    pub every_events: u64,
    /// Save unsaved progress at least this often
    pub max_interval: Option<Duration>,
}

impl CheckpointCadence {
    pub fn per_event() -> Self {
        Self { every_events: 1, max_interval: None }
    }

    pub fn batched(every_events: u64, max_interval: Duration) -> Self {
        Self {
            every_events,
            max_interval: Some(max_interval),
        }
    }
}

impl Default for CheckpointCadence {
    fn default() -> Self {
        Self::per_event()
    }
}

/// Behaviour of the router when a partition queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureMode {
    /// Suspend all routing until the full queue drains
    Global,
    /// Park events of the full partition, keep routing the others, and
    /// suspend only once `max_parked` events are parked in total
    PerKey { max_parked: usize },
}

/// Processing options of one registered projection.
#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    /// Event stream the projection consumes
    pub stream: String,
    pub policy: FailurePolicy,
    pub cadence: CheckpointCadence,
    /// Bound of each partition queue
    pub queue_capacity: usize,
    pub backpressure: BackpressureMode,
    /// Wait between reads once caught up with the stream head
    pub poll_interval: Duration,
    /// Keep following the stream after catching up; otherwise stop there
    pub live: bool,
}

impl ProjectionOptions {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            policy: FailurePolicy::default(),
            cadence: CheckpointCadence::default(),
            queue_capacity: 64,
            backpressure: BackpressureMode::Global,
            poll_interval: Duration::from_millis(250),
            live: true,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cadence(mut self, cadence: CheckpointCadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_backpressure(mut self, mode: BackpressureMode) -> Self {
        self.backpressure = mode;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Stop once the stream head observed at catch-up has been processed.
    pub fn replay_only(mut self) -> Self {
        self.live = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ProjectionError::Configuration(msg));

        if self.stream.trim().is_empty() {
            return invalid("source stream must not be empty".to_string());
        }
        if self.queue_capacity == 0 {
            return invalid("queue capacity must be at least 1".to_string());
        }
        if self.cadence.every_events == 0 {
            return invalid("checkpoint cadence must be at least 1 event".to_string());
        }
        if self.poll_interval.is_zero() {
            return invalid("poll interval must be positive".to_string());
        }
        if let FailurePolicy::Retry { max_attempts: 0, .. } = self.policy {
            return invalid("retry policy needs at least 1 attempt".to_string());
        }
        if let BackpressureMode::PerKey { max_parked: 0 } = self.backpressure {
            return invalid("per-key backpressure needs room for at least 1 parked event".to_string());
        }
        Ok(())
    }
}

/// Run a storage operation under the projection's retry budget.
///
/// Only transient errors are retried. Gives up early, returning the last
/// error, once `halt` fires.
pub(crate) async fn retry_storage<T, E, F, Fut>(
    policy: &FailurePolicy,
    halt: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<ProjectionError>,
{
    let attempts = policy.storage_attempts();
    let mut failures = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let err: ProjectionError = err.into();
                failures += 1;
                if !err.is_transient() || failures >= attempts {
                    return Err(err);
                }

                warn!(operation, attempt = failures, error = %err, "Storage operation failed (will retry)");

                tokio::select! {
                    _ = halt.cancelled() => return Err(err),
                    _ = tokio::time::sleep(policy.storage_delay(failures)) => {}
                }
            },
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strand_store::StoreError;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };

        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(64), Duration::from_millis(50));
    }

    #[test]
    fn test_storage_attempts_follow_policy() {
        assert_eq!(FailurePolicy::retry(4, Backoff::Fixed(Duration::ZERO)).storage_attempts(), 4);
        assert_eq!(FailurePolicy::Skip.storage_attempts(), 1);
        assert_eq!(FailurePolicy::Halt.storage_attempts(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(ProjectionOptions::new("s").validate().is_ok());
        assert!(ProjectionOptions::new(" ").validate().is_err());
        assert!(ProjectionOptions::new("s").with_queue_capacity(0).validate().is_err());
        assert!(ProjectionOptions::new("s")
            .with_policy(FailurePolicy::retry(0, Backoff::Fixed(Duration::ZERO)))
            .validate()
            .is_err());
        assert!(ProjectionOptions::new("s")
            .with_backpressure(BackpressureMode::PerKey { max_parked: 0 })
            .validate()
            .is_err());
        assert!(ProjectionOptions::new("s")
            .with_cadence(CheckpointCadence { every_events: 0, max_interval: None })
            .validate()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_storage_succeeds_within_budget() {
        let policy = FailurePolicy::retry(3, Backoff::Fixed(Duration::from_secs(1)));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let value = retry_storage(&policy, &CancellationToken::new(), "save", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Connection("down".to_string()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_storage_does_not_retry_invalid_input() {
        let policy = FailurePolicy::retry(3, Backoff::Fixed(Duration::from_secs(1)));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = retry_storage(&policy, &CancellationToken::new(), "save", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Invalid("negative position".to_string()))
        })
        .await;

        assert!(matches!(result, Err(ProjectionError::Checkpoint(StoreError::Invalid(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_storage_gives_up_after_budget() {
        let policy = FailurePolicy::retry(2, Backoff::Fixed(Duration::from_secs(1)));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<()> = retry_storage(&policy, &CancellationToken::new(), "save", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Connection("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(ProjectionError::Checkpoint(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
