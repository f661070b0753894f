//! Partition router: one bounded queue and one worker per partition key.
//!
//! Queues are created lazily on first sight of a key and live for one
//! projection run. Every await in [`Router::route`] happens before the event
//! is handed over, so dropping a pending `route` future never loses an
//! accepted event.

use crate::policy::BackpressureMode;
use crate::worker::{Worker, WorkerContext};
use futures_util::future::select_all;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strand_eventlog::Event;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A partition worker is gone (halted or panicked).
#[derive(Debug)]
pub(crate) struct RouteClosed {
    pub(crate) partition: Option<String>,
}

struct Route {
    tx: mpsc::Sender<Event>,
    /// Events waiting for room in `tx`, oldest first
    parked: VecDeque<Event>,
}

pub(crate) struct Router {
    ctx: Arc<WorkerContext>,
    capacity: usize,
    mode: BackpressureMode,
    routes: HashMap<Option<String>, Route>,
    parked: usize,
    workers: Vec<(Option<String>, JoinHandle<()>)>,
}

impl Router {
    pub(crate) fn new(ctx: Arc<WorkerContext>, capacity: usize, mode: BackpressureMode) -> Self {
        Self {
            ctx,
            capacity,
            mode,
            routes: HashMap::new(),
            parked: 0,
            workers: Vec::new(),
        }
    }

    /// Number of partitions opened in this run.
    pub(crate) fn partitions(&self) -> usize {
        self.routes.len()
    }

    /// Hand an event to its partition, suspending under backpressure.
    pub(crate) async fn route(&mut self, key: Option<String>, event: Event) -> Result<(), RouteClosed> {
        match self.mode {
            BackpressureMode::Global => {
                let route = self.open(&key);
                let permit = route.tx.reserve().await.map_err(|_| RouteClosed { partition: key })?;
                permit.send(event);
                Ok(())
            },
            BackpressureMode::PerKey { max_parked } => {
                self.make_room(max_parked).await?;
                self.admit(key, event)
            },
        }
    }

    /// Deliver every parked event, waiting for queue room as needed.
    ///
    /// Partitions drain concurrently: a slow partition never holds back
    /// the parked events of the others.
    pub(crate) async fn flush_parked(&mut self) -> Result<(), RouteClosed> {
        self.pump()?;
        while self.has_parked() {
            self.relieve().await?;
        }
        Ok(())
    }

    /// Close every queue and hand back the worker tasks.
    pub(crate) fn finish(self) -> Vec<(Option<String>, JoinHandle<()>)> {
        let Router { routes, workers, .. } = self;
        drop(routes);
        workers
    }

    fn open(&mut self, key: &Option<String>) -> &mut Route {
        match self.routes.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(self.capacity);
                let worker = Worker::new(self.ctx.clone(), key.clone(), rx);
                self.workers.push((key.clone(), tokio::spawn(worker.run())));

                debug!(projection = %self.ctx.handler.name(), partition = ?key, "Partition opened");

                entry.insert(Route {
                    tx,
                    parked: VecDeque::new(),
                })
            },
        }
    }

    /// Accept an event without waiting: straight into the queue if it has
    /// room and nothing of this key is parked, parked otherwise.
    fn admit(&mut self, key: Option<String>, event: Event) -> Result<(), RouteClosed> {
        let route = self.open(&key);

        let parked = if route.parked.is_empty() {
            match route.tx.try_send(event) {
                Ok(()) => false,
                Err(TrySendError::Full(event)) => {
                    route.parked.push_back(event);
                    true
                },
                Err(TrySendError::Closed(_)) => return Err(RouteClosed { partition: key }),
            }
        } else {
            route.parked.push_back(event);
            true
        };

        if parked {
            self.parked += 1;
            trace!(partition = ?key, parked = self.parked, "Event parked");
        }
        Ok(())
    }

    /// Move parked events into queues that have room.
    fn pump(&mut self) -> Result<(), RouteClosed> {
        for (key, route) in self.routes.iter_mut() {
            while !route.parked.is_empty() {
                match route.tx.try_reserve() {
                    Ok(permit) => {
                        if let Some(event) = route.parked.pop_front() {
                            permit.send(event);
                            self.parked -= 1;
                        }
                    },
                    Err(TrySendError::Full(())) => break,
                    Err(TrySendError::Closed(())) => return Err(RouteClosed { partition: key.clone() }),
                }
            }
        }
        Ok(())
    }

    /// Wait until fewer than `max_parked` events are parked.
    async fn make_room(&mut self, max_parked: usize) -> Result<(), RouteClosed> {
        self.pump()?;
        while self.parked >= max_parked {
            self.relieve().await?;
        }
        Ok(())
    }

    /// Wait until some parked partition has queue room, then move parked
    /// events along. Never completes while nothing is parked.
    pub(crate) async fn relieve(&mut self) -> Result<(), RouteClosed> {
        let waiting: Vec<_> = self
            .routes
            .iter()
            .filter(|(_, route)| !route.parked.is_empty())
            .map(|(key, route)| {
                Box::pin(async move {
                    route
                        .tx
                        .reserve()
                        .await
                        .map(drop)
                        .map_err(|_| RouteClosed { partition: key.clone() })
                })
            })
            .collect();

        if waiting.is_empty() {
            return std::future::pending().await;
        }

        // The router is the only sender, so the room found here is still
        // there when `pump` runs.
        let (ready, _, rest) = select_all(waiting).await;
        drop(rest);
        ready?;
        self.pump()
    }

    pub(crate) fn has_parked(&self) -> bool {
        self.parked > 0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{PartitionedProjection, Projection, ProjectionHandler};
    use crate::policy::{CheckpointCadence, FailurePolicy};
    use crate::status::Counters;
    use crate::worker::Report;
    use async_trait::async_trait;
    use futures_util::TryStreamExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use strand_eventlog::{EventLog, MemoryEventLog, NewEvent, Position};
    use strand_store::MemoryCheckpointStore;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    /// Partition = event type; partition "slow" blocks until released.
    struct Gated {
        gate: Semaphore,
        applied: Mutex<Vec<(String, Position)>>,
    }

    #[async_trait]
    impl Projection for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        async fn apply(&self, event: &Event) -> anyhow::Result<()> {
            if event.event_type == "slow" {
                self.gate.acquire().await?.forget();
            }
            self.applied.lock().unwrap().push((event.event_type.clone(), event.position));
            Ok(())
        }
    }

    impl PartitionedProjection for Gated {
        fn partition_key(&self, event: &Event) -> String {
            event.event_type.clone()
        }
    }

    async fn events(types: &[&str]) -> Vec<Event> {
        let log = MemoryEventLog::new();
        for event_type in types {
            log.append("s", NewEvent::new(*event_type, Vec::new())).await.unwrap();
        }
        log.read("s", 0).try_collect().await.unwrap()
    }

    fn router(projection: Arc<Gated>, capacity: usize, mode: BackpressureMode) -> (Router, mpsc::UnboundedReceiver<Report>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(WorkerContext {
            handler: ProjectionHandler::Partitioned(projection),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            policy: FailurePolicy::Halt,
            cadence: CheckpointCadence::per_event(),
            counters: Arc::new(Counters::default()),
            reports,
            halt: CancellationToken::new(),
        });
        (Router::new(ctx, capacity, mode), rx)
    }

    fn gated() -> Arc<Gated> {
        Arc::new(Gated {
            gate: Semaphore::new(0),
            applied: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_opens_one_partition_per_key() {
        let projection = gated();
        let (mut router, _reports) = router(projection.clone(), 8, BackpressureMode::Global);

        for event in events(&["a", "b", "a", "c"]).await {
            let key = Some(event.event_type.clone());
            router.route(key, event).await.unwrap();
        }
        assert_eq!(router.partitions(), 3);

        for (_, worker) in router.finish() {
            worker.await.unwrap();
        }

        let applied = projection.applied.lock().unwrap();
        let a: Vec<Position> = applied.iter().filter(|(k, _)| k == "a").map(|(_, p)| *p).collect();
        assert_eq!(a, vec![0, 2]);
        assert_eq!(applied.len(), 4);
    }

    #[tokio::test]
    async fn test_per_key_backpressure_lets_other_keys_flow() {
        let projection = gated();
        let (mut router, _reports) =
            router(projection.clone(), 1, BackpressureMode::PerKey { max_parked: 3 });

        // The slow worker blocks on its first event; the slow backlog is
        // parked while the fast partition keeps flowing.
        let batch = events(&["slow", "slow", "slow", "fast", "fast", "fast"]).await;
        for event in batch {
            let key = Some(event.event_type.clone());
            tokio::time::timeout(Duration::from_secs(1), router.route(key, event))
                .await
                .expect("routing must not block while under the parking cap")
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while projection.applied.lock().unwrap().iter().filter(|(k, _)| k == "fast").count() < 3 {
                tokio::select! {
                    relieved = router.relieve() => relieved.unwrap(),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
        })
        .await
        .expect("fast partition starved by slow partition");

        projection.gate.add_permits(3);
        router.flush_parked().await.unwrap();
        for (_, worker) in router.finish() {
            worker.await.unwrap();
        }

        let slow: Vec<Position> = projection
            .applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == "slow")
            .map(|(_, p)| *p)
            .collect();
        assert_eq!(slow, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_flush_drains_other_partitions_while_one_is_blocked() {
        let projection = gated();
        let (mut router, _reports) =
            router(projection.clone(), 1, BackpressureMode::PerKey { max_parked: 8 });

        // Each partition gets one event queued and two parked.
        for event in events(&["slow", "slow", "slow", "fast", "fast", "fast"]).await {
            let key = Some(event.event_type.clone());
            router.route(key, event).await.unwrap();
        }
        assert!(router.has_parked());

        let fast_applied = || projection.applied.lock().unwrap().iter().filter(|(k, _)| k == "fast").count();
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            tokio::select! {
                flushed = router.flush_parked() => panic!("flush finished while slow is blocked: {flushed:?}"),
                _ = async {
                    while fast_applied() < 3 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                } => {}
            }
        })
        .await;
        assert!(drained.is_ok(), "fast partition waited on the slow one during flush");

        projection.gate.add_permits(3);
        router.flush_parked().await.unwrap();
        assert!(!router.has_parked());
        for (_, worker) in router.finish() {
            worker.await.unwrap();
        }
        assert_eq!(projection.applied.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_per_key_backpressure_suspends_at_parking_cap() {
        let projection = gated();
        let (mut router, _reports) =
            router(projection.clone(), 1, BackpressureMode::PerKey { max_parked: 1 });

        let mut batch = events(&["slow", "slow", "slow", "slow"]).await.into_iter();

        // Position 0 in flight, 1 queued, 2 parked: the cap is reached.
        for event in batch.by_ref().take(3) {
            router.route(Some("slow".to_string()), event).await.unwrap();
        }

        let blocked = batch.next().unwrap();
        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            router.route(Some("slow".to_string()), blocked.clone()),
        )
        .await;
        assert!(attempt.is_err(), "routing should suspend once the parking cap is reached");

        projection.gate.add_permits(4);
        router.route(Some("slow".to_string()), blocked).await.unwrap();
        router.flush_parked().await.unwrap();
        for (_, worker) in router.finish() {
            worker.await.unwrap();
        }

        assert_eq!(projection.applied.lock().unwrap().len(), 4);
    }
}
