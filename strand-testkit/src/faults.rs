//! Fault-injecting wrappers around the in-memory backends.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;
use strand_eventlog::{Event, EventLog, EventLogError, EventStream, MemoryEventLog, NewEvent, Position};
use strand_store::{Checkpoint, CheckpointStore, MemoryCheckpointStore, StoreError};

/// Consume one unit of an injected-failure budget.
fn take(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Checkpoint store whose next operations can be made to fail.
#[derive(Default)]
pub struct FaultyCheckpointStore {
    inner: MemoryCheckpointStore,
    failing_saves: AtomicU32,
    failing_gets: AtomicU32,
    saves: Mutex<Vec<(String, Option<String>, Position)>>,
}

impl FaultyCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_gets(&self, count: u32) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Successful saves, in commit order.
    pub fn save_history(&self) -> Vec<(String, Option<String>, Position)> {
        self.saves.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for FaultyCheckpointStore {
    async fn get(&self, projection: &str, partition: Option<&str>) -> Result<Option<Position>, StoreError> {
        if take(&self.failing_gets) {
            return Err(StoreError::Connection("injected get failure".to_string()));
        }
        self.inner.get(projection, partition).await
    }

    async fn save(&self, projection: &str, partition: Option<&str>, position: Position) -> Result<(), StoreError> {
        if take(&self.failing_saves) {
            return Err(StoreError::Connection("injected save failure".to_string()));
        }
        self.inner.save(projection, partition, position).await?;
        if let Ok(mut saves) = self.saves.lock() {
            saves.push((projection.to_string(), partition.map(str::to_string), position));
        }
        Ok(())
    }

    async fn reset(&self, projection: &str, partition: Option<&str>) -> Result<(), StoreError> {
        self.inner.reset(projection, partition).await
    }

    async fn list(&self, projection: &str) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.list(projection).await
    }

    async fn reset_all(&self, projection: &str) -> Result<u64, StoreError> {
        self.inner.reset_all(projection).await
    }
}

/// Event log whose reads can fail or drop a position.
pub struct FaultyEventLog {
    inner: MemoryEventLog,
    failing_reads: AtomicU32,
    /// Position hidden from reads, -1 for none
    hidden: AtomicI64,
}

impl Default for FaultyEventLog {
    fn default() -> Self {
        Self {
            inner: MemoryEventLog::new(),
            failing_reads: AtomicU32::new(0),
            hidden: AtomicI64::new(-1),
        }
    }
}

impl FaultyEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make reads silently skip `position`, producing a gap.
    pub fn hide_position(&self, position: Position) {
        self.hidden.store(position, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventLog for FaultyEventLog {
    async fn append(&self, stream: &str, event: NewEvent) -> strand_eventlog::Result<Position> {
        self.inner.append(stream, event).await
    }

    fn read(&self, stream: &str, from: Position) -> EventStream<'static> {
        if take(&self.failing_reads) {
            let failure = EventLogError::Unavailable("injected read failure".to_string());
            return stream::once(async move { Err::<Event, _>(failure) }).boxed();
        }

        let hidden = self.hidden.load(Ordering::SeqCst);
        self.inner
            .read(stream, from)
            .filter(move |item| {
                let keep = !matches!(item, Ok(event) if event.position == hidden);
                async move { keep }
            })
            .boxed()
    }

    async fn stream_position(&self, stream: &str) -> strand_eventlog::Result<Option<Position>> {
        self.inner.stream_position(stream).await
    }

    async fn stream_version(&self, stream: &str) -> strand_eventlog::Result<Option<i64>> {
        self.inner.stream_version(stream).await
    }
}
