//! Seeding and waiting helpers.

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use std::time::Duration;
use strand_eventlog::{EventLog, NewEvent, Position};
use strand_projector::{ProjectionEngine, ProjectionState};
use strand_store::CheckpointStore;
use tokio::time::{sleep, timeout, Instant};

const POLL: Duration = Duration::from_millis(5);

/// Append `count` events of type `SEEDED` with payload `{"n": i}`.
///
/// Returns the position of the last appended event.
pub async fn seed_stream<L>(log: &L, stream: &str, count: usize) -> Result<Option<Position>>
where
    L: EventLog + ?Sized,
{
    let mut last = None;
    for n in 0..count {
        let event = NewEvent::json("SEEDED", &json!({ "n": n }))?;
        last = Some(log.append(stream, event).await?);
    }
    Ok(last)
}

/// Append one event per key, using the key as event type.
pub async fn seed_keyed<L>(log: &L, stream: &str, keys: &[&str]) -> Result<Vec<Position>>
where
    L: EventLog + ?Sized,
{
    let mut positions = Vec::with_capacity(keys.len());
    for key in keys {
        positions.push(log.append(stream, NewEvent::new(*key, b"{}".to_vec())).await?);
    }
    Ok(positions)
}

/// Poll `condition` until it holds.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + limit;
    while !condition() {
        if Instant::now() >= deadline {
            bail!("condition not met within {limit:?}");
        }
        sleep(POLL).await;
    }
    Ok(())
}

/// Wait until a checkpoint reaches `position`.
pub async fn wait_for_checkpoint<S>(
    store: &S,
    projection: &str,
    partition: Option<&str>,
    position: Position,
    limit: Duration,
) -> Result<()>
where
    S: CheckpointStore + ?Sized,
{
    let deadline = Instant::now() + limit;
    loop {
        let current = store.get(projection, partition).await?;
        if current.is_some_and(|p| p >= position) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("checkpoint of {projection} stuck at {current:?}, expected {position}");
        }
        sleep(POLL).await;
    }
}

/// Wait until the projection state satisfies `predicate`.
pub async fn wait_for_state(
    engine: &ProjectionEngine,
    name: &str,
    limit: Duration,
    predicate: impl Fn(&ProjectionState) -> bool,
) -> Result<ProjectionState> {
    let mut state = engine.subscribe(name)?;

    let reached = timeout(limit, async {
        loop {
            let current = state.borrow_and_update().clone();
            if predicate(&current) {
                return Ok(current);
            }
            if state.changed().await.is_err() {
                return Err(anyhow!("state channel of {name} closed"));
            }
        }
    })
    .await;

    match reached {
        Ok(result) => result,
        Err(_) => bail!("{name} did not reach the expected state within {limit:?}"),
    }
}
