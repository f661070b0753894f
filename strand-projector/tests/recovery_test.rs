//! Resumption, reset and graceful stop of projection runs.

use std::sync::Arc;
use std::time::Duration;
use strand_eventlog::MemoryEventLog;
use strand_projector::{CheckpointCadence, ProjectionEngine, ProjectionOptions, ProjectionState};
use strand_store::{CheckpointStore, MemoryCheckpointStore};
use strand_testkit::{seed_keyed, seed_stream, wait_until, RecordingProjection};

const STREAM: &str = "orders";
const TIMEOUT: Duration = Duration::from_secs(5);

fn backends() -> (Arc<MemoryEventLog>, Arc<MemoryCheckpointStore>) {
    (Arc::new(MemoryEventLog::new()), Arc::new(MemoryCheckpointStore::new()))
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint_without_reapplying() {
    let (log, store) = backends();
    seed_stream(log.as_ref(), STREAM, 10).await.unwrap();

    // First run processes 0..=9, then the process "crashes".
    let first = Arc::new(RecordingProjection::new("totals"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine
        .register(first.clone(), ProjectionOptions::new(STREAM).replay_only())
        .unwrap();
    engine.start("totals").await.unwrap();
    assert_eq!(engine.wait("totals").await.unwrap(), ProjectionState::Stopped);
    assert_eq!(store.get("totals", None).await.unwrap(), Some(9));
    drop(engine);

    seed_stream(log.as_ref(), STREAM, 5).await.unwrap();

    // A fresh engine picks up at position 10.
    let second = Arc::new(RecordingProjection::new("totals"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine
        .register(second.clone(), ProjectionOptions::new(STREAM).replay_only())
        .unwrap();
    engine.start("totals").await.unwrap();
    assert_eq!(engine.wait("totals").await.unwrap(), ProjectionState::Stopped);

    assert_eq!(first.positions(), (0..10).collect::<Vec<_>>());
    assert_eq!(second.positions(), (10..15).collect::<Vec<_>>());
    assert_eq!(store.get("totals", None).await.unwrap(), Some(14));
}

#[tokio::test]
async fn test_reset_replays_from_first_position() {
    let (log, store) = backends();
    seed_stream(log.as_ref(), STREAM, 5).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("totals"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine
        .register(projection.clone(), ProjectionOptions::new(STREAM).replay_only())
        .unwrap();

    engine.start("totals").await.unwrap();
    engine.wait("totals").await.unwrap();
    assert_eq!(projection.applied_count(), 5);

    assert_eq!(engine.reset("totals").await.unwrap(), 1);
    assert_eq!(store.get("totals", None).await.unwrap(), None);
    assert_eq!(engine.status("totals").unwrap().position, None);

    engine.start("totals").await.unwrap();
    assert_eq!(engine.wait("totals").await.unwrap(), ProjectionState::Stopped);

    let positions = projection.positions();
    assert_eq!(positions.len(), 10);
    assert_eq!(positions[5..], [0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_reset_clears_partition_checkpoints() {
    let (log, store) = backends();
    seed_keyed(log.as_ref(), STREAM, &["a", "b", "a"]).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("by_type"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine
        .register_partitioned(projection.clone(), ProjectionOptions::new(STREAM).replay_only())
        .unwrap();
    engine.start("by_type").await.unwrap();
    engine.wait("by_type").await.unwrap();

    assert_eq!(engine.checkpoints("by_type").await.unwrap().len(), 3);
    assert_eq!(engine.reset("by_type").await.unwrap(), 3);
    assert!(engine.checkpoints("by_type").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_graceful_stop_flushes_batched_checkpoint() {
    let (log, store) = backends();
    seed_stream(log.as_ref(), STREAM, 10).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("totals"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    let options = ProjectionOptions::new(STREAM)
        .with_cadence(CheckpointCadence::batched(100, Duration::from_secs(3600)))
        .with_poll_interval(Duration::from_millis(10));
    engine.register(projection.clone(), options).unwrap();

    engine.start("totals").await.unwrap();
    wait_until(TIMEOUT, || projection.applied_count() == 10).await.unwrap();

    // Below the batch size nothing is persisted yet.
    assert_eq!(store.get("totals", None).await.unwrap(), None);

    assert_eq!(engine.stop("totals").await.unwrap(), ProjectionState::Stopped);
    assert_eq!(store.get("totals", None).await.unwrap(), Some(9));
}

#[tokio::test]
async fn test_live_projection_follows_new_appends() {
    let (log, store) = backends();
    seed_stream(log.as_ref(), STREAM, 3).await.unwrap();

    let projection = Arc::new(RecordingProjection::new("totals"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine
        .register(
            projection.clone(),
            ProjectionOptions::new(STREAM).with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();

    engine.start("totals").await.unwrap();
    wait_until(TIMEOUT, || projection.applied_count() == 3).await.unwrap();
    assert!(engine.status("totals").unwrap().state.is_running());

    seed_stream(log.as_ref(), STREAM, 2).await.unwrap();
    wait_until(TIMEOUT, || projection.applied_count() == 5).await.unwrap();

    engine.shutdown().await;
    assert_eq!(engine.status("totals").unwrap().state, ProjectionState::Stopped);
    assert_eq!(store.get("totals", None).await.unwrap(), Some(4));
    assert!(engine.start("totals").await.is_err());
}

#[tokio::test]
async fn test_projections_on_same_stream_are_independent() {
    let (log, store) = backends();
    seed_stream(log.as_ref(), STREAM, 4).await.unwrap();
    store.save("late", None, 1).await.unwrap();

    let early = Arc::new(RecordingProjection::new("early"));
    let late = Arc::new(RecordingProjection::new("late"));
    let engine = ProjectionEngine::new(log.clone(), store.clone());
    engine.register(early.clone(), ProjectionOptions::new(STREAM).replay_only()).unwrap();
    engine.register(late.clone(), ProjectionOptions::new(STREAM).replay_only()).unwrap();

    engine.start_all().await.unwrap();
    engine.wait("early").await.unwrap();
    engine.wait("late").await.unwrap();

    assert_eq!(early.positions(), vec![0, 1, 2, 3]);
    assert_eq!(late.positions(), vec![2, 3]);
    assert_eq!(engine.names(), vec!["early".to_string(), "late".to_string()]);
}
