//! Handler and storage failures under the different failure policies.

use std::sync::Arc;
use std::time::Duration;
use strand_eventlog::{EventLog, MemoryEventLog};
use strand_projector::{
    Backoff, Exhausted, FailurePolicy, Projection, ProjectionEngine, ProjectionOptions, ProjectionState,
};
use strand_store::{CheckpointStore, MemoryCheckpointStore};
use strand_testkit::{seed_stream, wait_until, FaultyCheckpointStore, FaultyEventLog, RecordingProjection};

const STREAM: &str = "payments";
const TIMEOUT: Duration = Duration::from_secs(5);

fn quick_retry(max_attempts: u32) -> FailurePolicy {
    FailurePolicy::retry(max_attempts, Backoff::Fixed(Duration::from_millis(1)))
}

async fn run_to_end<L, S>(
    log: Arc<L>,
    store: Arc<S>,
    projection: Arc<RecordingProjection>,
    policy: FailurePolicy,
) -> ProjectionState
where
    L: EventLog + 'static,
    S: CheckpointStore + 'static,
{
    let engine = ProjectionEngine::new(log, store);
    let name = projection.name().to_string();
    engine
        .register(projection, ProjectionOptions::new(STREAM).with_policy(policy).replay_only())
        .unwrap();
    engine.start(&name).await.unwrap();
    engine.wait(&name).await.unwrap()
}

#[tokio::test]
async fn test_retry_reapplies_same_event_before_advancing() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(FaultyCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 5).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("ledger").failing(3, 2));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    let policy = FailurePolicy::retry(3, Backoff::Fixed(Duration::from_millis(200)));
    engine
        .register(projection.clone(), ProjectionOptions::new(STREAM).with_policy(policy).replay_only())
        .unwrap();
    engine.start("ledger").await.unwrap();

    // Between the second and third attempt nothing at or past 3 is saved.
    wait_until(TIMEOUT, || projection.attempts(3) == 2).await.unwrap();
    assert!(store.save_history().iter().all(|(_, _, p)| *p < 3), "{:?}", store.save_history());

    assert_eq!(engine.wait("ledger").await.unwrap(), ProjectionState::Stopped);

    assert_eq!(projection.attempts(3), 3);
    assert_eq!(projection.positions(), vec![0, 1, 2, 3, 4]);
    assert_eq!(store.get("ledger", None).await.unwrap(), Some(4));

    // Exactly one advance past the retried event.
    let saved: Vec<_> = store.save_history().into_iter().map(|(_, _, p)| p).collect();
    assert_eq!(saved, vec![0, 1, 2, 3, 4]);

    let counters = engine.status("ledger").unwrap().counters;
    assert_eq!(counters.applied, 5);
    assert_eq!(counters.failed, 2);
    assert_eq!(counters.retried, 2);
    assert_eq!(counters.skipped, 0);
}

#[tokio::test]
async fn test_exhausted_retries_halt_without_advancing() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 5).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("ledger").always_failing(2));
    let state = run_to_end(log, store.clone(), projection.clone(), quick_retry(3)).await;

    assert!(state.is_faulted(), "unexpected state {state:?}");
    assert_eq!(projection.attempts(2), 3);
    assert_eq!(projection.positions(), vec![0, 1]);
    assert_eq!(store.get("ledger", None).await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_exhausted_retries_can_skip() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 4).await.unwrap();

    let policy = FailurePolicy::Retry {
        max_attempts: 2,
        backoff: Backoff::Fixed(Duration::from_millis(1)),
        on_exhausted: Exhausted::Skip,
    };
    let projection = Arc::new(RecordingProjection::new("ledger").always_failing(1));
    let state = run_to_end(log, store.clone(), projection.clone(), policy).await;

    assert_eq!(state, ProjectionState::Stopped);
    assert_eq!(projection.attempts(1), 2);
    assert_eq!(projection.positions(), vec![0, 2, 3]);
    assert_eq!(store.get("ledger", None).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_skip_policy_advances_past_failed_event() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 5).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("ledger").always_failing(2));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine
        .register(
            projection.clone(),
            ProjectionOptions::new(STREAM).with_policy(FailurePolicy::Skip).replay_only(),
        )
        .unwrap();
    engine.start("ledger").await.unwrap();
    assert_eq!(engine.wait("ledger").await.unwrap(), ProjectionState::Stopped);

    assert_eq!(projection.attempts(2), 1);
    assert_eq!(projection.positions(), vec![0, 1, 3, 4]);
    assert_eq!(store.get("ledger", None).await.unwrap(), Some(4));
    assert_eq!(engine.status("ledger").unwrap().counters.skipped, 1);
}

#[tokio::test]
async fn test_halt_policy_faults_and_restart_redelivers() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 5).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("ledger").failing(2, 1));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine
        .register(
            projection.clone(),
            ProjectionOptions::new(STREAM).with_policy(FailurePolicy::Halt).replay_only(),
        )
        .unwrap();

    engine.start("ledger").await.unwrap();
    let state = engine.wait("ledger").await.unwrap();
    match &state {
        ProjectionState::Faulted { reason } => assert!(reason.contains("ledger"), "{reason}"),
        other => panic!("expected a fault, got {other:?}"),
    }
    assert_eq!(store.get("ledger", None).await.unwrap(), Some(1));

    // The failure was transient: a restart re-delivers position 2.
    engine.start("ledger").await.unwrap();
    assert_eq!(engine.wait("ledger").await.unwrap(), ProjectionState::Stopped);
    assert_eq!(projection.attempts(2), 2);
    assert_eq!(projection.positions(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_halted_projection_leaves_siblings_running() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 5).await.unwrap();

    let broken = Arc::new(RecordingProjection::new("broken").always_failing(1));
    let healthy = Arc::new(RecordingProjection::new("healthy"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    let live = ProjectionOptions::new(STREAM).with_poll_interval(Duration::from_millis(10));
    engine
        .register(broken.clone(), live.clone().with_policy(FailurePolicy::Halt))
        .unwrap();
    engine.register(healthy.clone(), live).unwrap();
    engine.start_all().await.unwrap();

    assert!(engine.wait("broken").await.unwrap().is_faulted());
    assert_eq!(broken.positions(), vec![0]);
    assert_eq!(store.get("broken", None).await.unwrap(), Some(0));

    // The sibling keeps following the stream after the fault.
    seed_stream(log.as_ref(), STREAM, 2).await.unwrap();
    wait_until(TIMEOUT, || healthy.positions() == vec![0, 1, 2, 3, 4, 5, 6]).await.unwrap();
    assert!(engine.status("healthy").unwrap().state.is_running());
    assert!(engine.status("broken").unwrap().state.is_faulted());

    engine.shutdown().await;
    assert_eq!(store.get("healthy", None).await.unwrap(), Some(6));
}

#[tokio::test]
async fn test_checkpoint_failures_are_retried_under_retry_policy() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(FaultyCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 3).await.unwrap();
    store.fail_next_gets(1);
    store.fail_next_saves(2);

    let projection = Arc::new(RecordingProjection::new("ledger"));
    let state = run_to_end(log, store.clone(), projection.clone(), quick_retry(3)).await;

    assert_eq!(state, ProjectionState::Stopped);
    assert_eq!(projection.positions(), vec![0, 1, 2]);
    assert_eq!(store.get("ledger", None).await.unwrap(), Some(2));

    // Each position is committed once, in order.
    let saved: Vec<_> = store.save_history().into_iter().map(|(_, _, p)| p).collect();
    assert_eq!(saved, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_checkpoint_failure_faults_under_halt_policy() {
    let log = Arc::new(MemoryEventLog::new());
    let store = Arc::new(FaultyCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 3).await.unwrap();
    store.fail_next_saves(1);

    let projection = Arc::new(RecordingProjection::new("ledger"));
    let state = run_to_end(log, store, projection, FailurePolicy::Halt).await;

    match state {
        ProjectionState::Faulted { reason } => assert!(reason.contains("Checkpoint"), "{reason}"),
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_read_failures_are_retried() {
    let log = Arc::new(FaultyEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 4).await.unwrap();
    log.fail_next_reads(2);

    let projection = Arc::new(RecordingProjection::new("ledger"));
    let state = run_to_end(log, store.clone(), projection.clone(), quick_retry(3)).await;

    assert_eq!(state, ProjectionState::Stopped);
    assert_eq!(projection.positions(), vec![0, 1, 2, 3]);
    assert_eq!(store.get("ledger", None).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_read_failure_faults_under_halt_policy() {
    let log = Arc::new(FaultyEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 4).await.unwrap();
    log.fail_next_reads(1);

    let projection = Arc::new(RecordingProjection::new("ledger"));
    let state = run_to_end(log, store.clone(), projection.clone(), FailurePolicy::Halt).await;

    assert!(state.is_faulted());
    assert_eq!(projection.applied_count(), 0);
    assert_eq!(store.get("ledger", None).await.unwrap(), None);
}

#[tokio::test]
async fn test_gap_in_stream_is_an_ordering_violation() {
    let log = Arc::new(FaultyEventLog::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    seed_stream(log.as_ref(), STREAM, 6).await.unwrap();
    log.hide_position(3);

    let projection = Arc::new(RecordingProjection::new("ledger"));
    let state = run_to_end(log, store.clone(), projection.clone(), quick_retry(3)).await;

    match state {
        ProjectionState::Faulted { reason } => {
            assert!(reason.contains("Ordering violation"), "{reason}");
            assert!(reason.contains("expected position 3"), "{reason}");
        },
        other => panic!("expected a fault, got {other:?}"),
    }
    assert!(projection.positions().iter().all(|&p| p < 3));
    assert!(store.get("ledger", None).await.unwrap().unwrap_or(-1) < 3);
}
