//! Projection engine: drives every registered projection.
//!
//! Per run, a single feed task resolves the start position from the
//! checkpoint store, reads the source stream in order, verifies it is
//! gapless and routes each event to its partition worker. Workers report
//! back so the engine can track the low watermark: the highest position
//! below which every event has been processed.
//!
//! Partitioned projections persist that watermark as their projection-wide
//! checkpoint and a checkpoint per partition; a restart resumes the cursor
//! at `watermark + 1` and each partition skips what it already checkpointed.
//! Unpartitioned projections have a single worker that persists the
//! projection-wide checkpoint itself.

use crate::error::{partition_label, ProjectionError, Result};
use crate::handler::{PartitionedProjection, Projection, ProjectionHandler};
use crate::policy::{retry_storage, CheckpointCadence, ProjectionOptions};
use crate::router::{RouteClosed, Router};
use crate::status::{Counters, ProjectionState, ProjectionStatus};
use crate::worker::{Report, WorkerContext};
use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};
use strand_eventlog::{Event, EventLog, EventStream, Position, FIRST_POSITION};
use strand_store::{Checkpoint, CheckpointStore};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Registration {
    handler: ProjectionHandler,
    options: ProjectionOptions,
    counters: Arc<Counters>,
    state: watch::Sender<ProjectionState>,
    /// Cancellation of the current run; the lock serializes lifecycle calls
    run: Mutex<Option<CancellationToken>>,
}

impl Registration {
    fn status(&self) -> ProjectionStatus {
        ProjectionStatus {
            name: self.handler.name().to_string(),
            stream: self.options.stream.clone(),
            partitioned: self.handler.is_partitioned(),
            state: self.state.borrow().clone(),
            position: self.counters.position(),
            counters: self.counters.snapshot(),
        }
    }

    fn is_running(&self) -> bool {
        self.state.borrow().is_running()
    }
}

/// Hosts projections and their lifecycles.
pub struct ProjectionEngine {
    log: Arc<dyn EventLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    projections: RwLock<BTreeMap<String, Arc<Registration>>>,
    shutdown: CancellationToken,
}

impl ProjectionEngine {
    pub fn new(log: Arc<dyn EventLog>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            log,
            checkpoints,
            projections: RwLock::new(BTreeMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a projection whose events form a single partition.
    pub fn register(&self, projection: Arc<dyn Projection>, options: ProjectionOptions) -> Result<()> {
        self.insert(ProjectionHandler::Single(projection), options)
    }

    /// Register a projection processed in parallel across partitions.
    pub fn register_partitioned(
        &self,
        projection: Arc<dyn PartitionedProjection>,
        options: ProjectionOptions,
    ) -> Result<()> {
        self.insert(ProjectionHandler::Partitioned(projection), options)
    }

    fn insert(&self, handler: ProjectionHandler, options: ProjectionOptions) -> Result<()> {
        let name = handler.name().to_string();
        if name.trim().is_empty() {
            return Err(ProjectionError::Configuration("projection name must not be empty".to_string()));
        }
        options.validate()?;

        let mut projections = self.projections.write().unwrap_or_else(PoisonError::into_inner);
        if projections.contains_key(&name) {
            return Err(ProjectionError::Configuration(format!("projection {name} is already registered")));
        }

        info!(
            projection = %name,
            stream = %options.stream,
            partitioned = handler.is_partitioned(),
            "Projection registered"
        );

        let (state, _) = watch::channel(ProjectionState::Idle);
        projections.insert(
            name,
            Arc::new(Registration {
                handler,
                options,
                counters: Arc::new(Counters::default()),
                state,
                run: Mutex::new(None),
            }),
        );
        Ok(())
    }

    fn registration(&self, name: &str) -> Result<Arc<Registration>> {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ProjectionError::NotRegistered(name.to_string()))
    }

    /// Registered projection names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Start a processing run in the background.
    pub async fn start(&self, name: &str) -> Result<()> {
        let registration = self.registration(name)?;
        if self.shutdown.is_cancelled() {
            return Err(ProjectionError::Configuration("engine is shut down".to_string()));
        }

        let mut run = registration.run.lock().await;
        if registration.is_running() {
            return Err(ProjectionError::AlreadyRunning(name.to_string()));
        }

        let cancel = self.shutdown.child_token();
        registration.state.send_replace(ProjectionState::ResolvingStart);

        let task = ProjectionRun {
            registration: registration.clone(),
            log: self.log.clone(),
            checkpoints: self.checkpoints.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        *run = Some(cancel);
        Ok(())
    }

    /// Start every registered projection that is not running yet.
    pub async fn start_all(&self) -> Result<()> {
        for name in self.names() {
            match self.start(&name).await {
                Ok(()) | Err(ProjectionError::AlreadyRunning(_)) => {},
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Request a graceful stop without waiting for it.
    pub async fn cancel(&self, name: &str) -> Result<()> {
        let registration = self.registration(name)?;
        if let Some(cancel) = registration.run.lock().await.as_ref() {
            cancel.cancel();
        }
        Ok(())
    }

    /// Wait until the current run (if any) ends; returns the final state.
    pub async fn wait(&self, name: &str) -> Result<ProjectionState> {
        let registration = self.registration(name)?;
        let mut state = registration.state.subscribe();

        loop {
            let current = state.borrow_and_update().clone();
            if !current.is_running() {
                return Ok(current);
            }
            if state.changed().await.is_err() {
                return Ok(registration.state.borrow().clone());
            }
        }
    }

    /// Graceful stop: stop feeding, drain routed events, flush checkpoints.
    pub async fn stop(&self, name: &str) -> Result<ProjectionState> {
        self.cancel(name).await?;
        self.wait(name).await
    }

    pub fn status(&self, name: &str) -> Result<ProjectionStatus> {
        Ok(self.registration(name)?.status())
    }

    pub fn statuses(&self) -> Vec<ProjectionStatus> {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|registration| registration.status())
            .collect()
    }

    /// Follow the state changes of a projection.
    pub fn subscribe(&self, name: &str) -> Result<watch::Receiver<ProjectionState>> {
        Ok(self.registration(name)?.state.subscribe())
    }

    /// Stored checkpoints of a projection.
    pub async fn checkpoints(&self, name: &str) -> Result<Vec<Checkpoint>> {
        self.registration(name)?;
        Ok(self.checkpoints.list(name).await?)
    }

    /// Delete every checkpoint of a stopped projection so its next run
    /// replays the stream from the first position.
    pub async fn reset(&self, name: &str) -> Result<u64> {
        let registration = self.registration(name)?;

        let _run = registration.run.lock().await;
        if registration.is_running() {
            return Err(ProjectionError::AlreadyRunning(name.to_string()));
        }

        let removed = self.checkpoints.reset_all(name).await?;
        registration.counters.set_position(None);
        registration.state.send_replace(ProjectionState::Idle);

        info!(projection = %name, removed, "Projection checkpoints reset");
        Ok(removed)
    }

    /// Stop every projection gracefully and refuse further starts.
    pub async fn shutdown(&self) {
        info!("Projection engine shutting down");
        self.shutdown.cancel();

        for name in self.names() {
            if let Ok(state) = self.wait(&name).await {
                debug!(projection = %name, state = ?state, "Projection settled");
            }
        }

        info!("Projection engine stopped");
    }
}

// =============================================================================
// Processing run
// =============================================================================

/// How the feed loop ended.
enum Exit {
    /// Stop feeding; workers drain what was routed
    Drain,
    /// Stop feeding; workers stop after their in-flight apply
    Halt(Option<ProjectionError>),
}

struct ProjectionRun {
    registration: Arc<Registration>,
    log: Arc<dyn EventLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    cancel: CancellationToken,
}

impl ProjectionRun {
    fn name(&self) -> &str {
        self.registration.handler.name()
    }

    fn set_state(&self, state: ProjectionState) {
        self.registration.state.send_replace(state);
    }

    async fn run(self) {
        let state = match self.execute().await {
            Ok(()) => {
                info!(projection = %self.name(), "Projection stopped");
                ProjectionState::Stopped
            },
            Err(e) => {
                error!(projection = %self.name(), error = %e, "Projection faulted");
                ProjectionState::Faulted { reason: e.to_string() }
            },
        };
        self.set_state(state);
    }

    async fn execute(&self) -> Result<()> {
        let registration = &self.registration;
        let options = &registration.options;
        let name = self.name();
        let halt = CancellationToken::new();

        let checkpoints = &self.checkpoints;
        let resume = retry_storage(&options.policy, &halt, "load checkpoint", || checkpoints.get(name, None)).await?;
        let start = resume.map_or(FIRST_POSITION, |position| position + 1);
        registration.counters.set_position(resume);

        info!(
            projection = %name,
            stream = %options.stream,
            start,
            partitioned = registration.handler.is_partitioned(),
            "Projection resuming"
        );

        let (reports_tx, mut reports) = mpsc::unbounded_channel();
        let ctx = Arc::new(WorkerContext {
            handler: registration.handler.clone(),
            checkpoints: self.checkpoints.clone(),
            policy: options.policy,
            cadence: options.cadence,
            counters: registration.counters.clone(),
            reports: reports_tx,
            halt: halt.clone(),
        });
        let mut router = Router::new(ctx, options.queue_capacity, options.backpressure);
        let mut watermark = Watermark::new(resume, options.cadence);

        self.set_state(ProjectionState::Streaming);
        let exit = self.feed(&mut router, &mut reports, &mut watermark, &halt, start).await;
        self.set_state(ProjectionState::Draining);

        let mut fault = match exit {
            Exit::Drain => {
                tokio::select! {
                    _ = halt.cancelled() => {},
                    flushed = router.flush_parked() => {
                        if flushed.is_err() {
                            halt.cancel();
                        }
                    }
                }
                None
            },
            Exit::Halt(e) => {
                halt.cancel();
                e
            },
        };

        let partitions = router.partitions();
        for (partition, worker) in router.finish() {
            if let Err(e) = worker.await {
                error!(projection = %name, partition = ?partition, error = %e, "Partition worker panicked");
                halt.cancel();
                fault.get_or_insert(ProjectionError::WorkerLost {
                    projection: name.to_string(),
                    partition: partition_label(partition.as_deref()),
                });
            }
        }

        // Every worker is gone: the remaining reports are final.
        while let Ok(report) = reports.try_recv() {
            match report {
                Report::Done(position) => watermark.complete(position),
                Report::Fault(e) => {
                    fault.get_or_insert(e);
                },
            }
        }
        registration.counters.set_position(watermark.current());

        if let Err(e) = self.save_watermark(&mut watermark, &halt, true).await {
            fault.get_or_insert(e);
        }

        info!(
            projection = %name,
            partitions,
            position = ?watermark.current(),
            "Projection run finished"
        );

        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Single ordered cursor over the source stream.
    async fn feed(
        &self,
        router: &mut Router,
        reports: &mut mpsc::UnboundedReceiver<Report>,
        watermark: &mut Watermark,
        halt: &CancellationToken,
        start: Position,
    ) -> Exit {
        let options = &self.registration.options;
        let handler = &self.registration.handler;
        let name = self.name();

        let mut next = start;
        let mut cursor = Some(self.log.read(&options.stream, next));
        let mut wake = Instant::now();
        let mut read_failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = halt.cancelled() => return Exit::Halt(None),
                _ = self.cancel.cancelled() => {
                    info!(projection = %name, "Projection stop requested");
                    return Exit::Drain;
                }
                Some(report) = reports.recv() => match report {
                    Report::Done(position) => {
                        watermark.complete(position);
                        self.registration.counters.set_position(watermark.current());
                        if let Err(e) = self.save_watermark(watermark, halt, false).await {
                            return Exit::Halt(Some(e));
                        }
                    },
                    Report::Fault(e) => return Exit::Halt(Some(e)),
                },
                relieved = router.relieve(), if router.has_parked() => {
                    if let Err(closed) = relieved {
                        return self.closed(closed, halt);
                    }
                }
                item = next_event(&mut cursor), if cursor.is_some() => match item {
                    Some(Ok(event)) => {
                        read_failures = 0;

                        if event.position != next {
                            return Exit::Halt(Some(ProjectionError::OrderingViolation {
                                projection: name.to_string(),
                                partition: partition_label(None),
                                reason: format!(
                                    "expected position {next} of stream {}, read {}",
                                    options.stream, event.position
                                ),
                            }));
                        }

                        let position = event.position;
                        let key = handler.partition_of(&event);

                        let routed = tokio::select! {
                            biased;
                            _ = halt.cancelled() => return Exit::Halt(None),
                            _ = self.cancel.cancelled() => return Exit::Drain,
                            routed = router.route(key, event) => routed,
                        };
                        if let Err(closed) = routed {
                            return self.closed(closed, halt);
                        }

                        watermark.route(position);
                        next = position + 1;
                    },
                    Some(Err(e)) => {
                        let e = ProjectionError::from(e);
                        cursor = None;
                        read_failures += 1;
                        if !e.is_transient() || read_failures >= options.policy.storage_attempts() {
                            return Exit::Halt(Some(e));
                        }

                        warn!(
                            projection = %name,
                            stream = %options.stream,
                            attempt = read_failures,
                            error = %e,
                            "Event log read failed (will retry)"
                        );
                        wake = Instant::now() + options.policy.storage_delay(read_failures);
                    },
                    None => {
                        cursor = None;
                        if !options.live {
                            info!(projection = %name, position = next - 1, "Projection caught up");
                            return Exit::Drain;
                        }
                        wake = Instant::now() + options.poll_interval;
                    },
                },
                _ = sleep_until(wake), if cursor.is_none() => {
                    if let Err(e) = self.save_watermark(watermark, halt, false).await {
                        return Exit::Halt(Some(e));
                    }
                    cursor = Some(self.log.read(&options.stream, next));
                }
            }
        }
    }

    /// A partition queue closed under the router.
    fn closed(&self, closed: RouteClosed, halt: &CancellationToken) -> Exit {
        // A halting worker closes its queue; its own report carries the cause.
        if halt.is_cancelled() {
            return Exit::Halt(None);
        }
        Exit::Halt(Some(ProjectionError::WorkerLost {
            projection: self.name().to_string(),
            partition: partition_label(closed.partition.as_deref()),
        }))
    }

    /// Persist the watermark of a partitioned projection when due.
    async fn save_watermark(&self, watermark: &mut Watermark, halt: &CancellationToken, force: bool) -> Result<()> {
        if !self.registration.handler.is_partitioned() {
            return Ok(());
        }
        let Some(position) = watermark.due(force) else {
            return Ok(());
        };

        let name = self.name();
        let checkpoints = &self.checkpoints;
        retry_storage(&self.registration.options.policy, halt, "save watermark", || {
            checkpoints.save(name, None, position)
        })
        .await?;

        watermark.saved(position);
        debug!(projection = %name, position, "Watermark saved");
        Ok(())
    }
}

async fn next_event(cursor: &mut Option<EventStream<'static>>) -> Option<strand_eventlog::Result<Event>> {
    match cursor {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Low watermark over routed events.
struct Watermark {
    /// Routed, not yet reported done
    pending: BTreeSet<Position>,
    last_routed: Option<Position>,
    saved: Option<Position>,
    unsaved: u64,
    last_save_at: Instant,
    cadence: CheckpointCadence,
}

impl Watermark {
    fn new(resume: Option<Position>, cadence: CheckpointCadence) -> Self {
        Self {
            pending: BTreeSet::new(),
            last_routed: resume,
            saved: resume,
            unsaved: 0,
            last_save_at: Instant::now(),
            cadence,
        }
    }

    fn route(&mut self, position: Position) {
        self.pending.insert(position);
        self.last_routed = Some(position);
    }

    fn complete(&mut self, position: Position) {
        if self.pending.remove(&position) {
            self.unsaved += 1;
        }
    }

    fn current(&self) -> Option<Position> {
        match self.pending.first() {
            Some(&oldest) => (oldest > FIRST_POSITION).then(|| oldest - 1),
            None => self.last_routed,
        }
    }

    fn due(&self, force: bool) -> Option<Position> {
        let current = self.current()?;
        if self.saved.is_some_and(|saved| saved >= current) {
            return None;
        }

        let interval_elapsed = self
            .cadence
            .max_interval
            .is_some_and(|interval| self.last_save_at.elapsed() >= interval);

        (force || interval_elapsed || self.unsaved >= self.cadence.every_events).then_some(current)
    }

    fn saved(&mut self, position: Position) {
        self.saved = Some(position);
        self.unsaved = 0;
        self.last_save_at = Instant::now();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use strand_eventlog::{MemoryEventLog, NewEvent};
    use strand_store::MemoryCheckpointStore;

    #[test]
    fn test_watermark_waits_for_oldest_pending_event() {
        let mut watermark = Watermark::new(None, CheckpointCadence::per_event());
        assert_eq!(watermark.current(), None);

        for position in 0..4 {
            watermark.route(position);
        }
        assert_eq!(watermark.current(), None);

        watermark.complete(2);
        watermark.complete(1);
        assert_eq!(watermark.current(), None);

        watermark.complete(0);
        assert_eq!(watermark.current(), Some(2));

        watermark.complete(3);
        assert_eq!(watermark.current(), Some(3));
    }

    #[test]
    fn test_watermark_starts_at_resume_position() {
        let mut watermark = Watermark::new(Some(9), CheckpointCadence::per_event());
        assert_eq!(watermark.current(), Some(9));
        assert_eq!(watermark.due(true), None);

        watermark.route(10);
        watermark.route(11);
        watermark.complete(11);
        assert_eq!(watermark.current(), Some(9));

        watermark.complete(10);
        assert_eq!(watermark.due(false), Some(11));
        watermark.saved(11);
        assert_eq!(watermark.due(true), None);
    }

    #[test]
    fn test_watermark_respects_batch_cadence() {
        let mut watermark = Watermark::new(None, CheckpointCadence::batched(3, Duration::from_secs(3600)));
        for position in 0..2 {
            watermark.route(position);
            watermark.complete(position);
        }
        assert_eq!(watermark.due(false), None);
        assert_eq!(watermark.due(true), Some(1));

        watermark.route(2);
        watermark.complete(2);
        assert_eq!(watermark.due(false), Some(2));
    }

    struct Noop;

    #[async_trait]
    impl Projection for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn apply(&self, _event: &Event) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn engine() -> (Arc<MemoryEventLog>, Arc<MemoryCheckpointStore>, ProjectionEngine) {
        let log = Arc::new(MemoryEventLog::new());
        let store = Arc::new(MemoryCheckpointStore::new());
        let engine = ProjectionEngine::new(log.clone(), store.clone());
        (log, store, engine)
    }

    #[tokio::test]
    async fn test_registration_is_validated() {
        let (_, _, engine) = engine();

        engine.register(Arc::new(Noop), ProjectionOptions::new("s")).unwrap();
        assert!(matches!(
            engine.register(Arc::new(Noop), ProjectionOptions::new("s")),
            Err(ProjectionError::Configuration(_))
        ));
        assert!(matches!(engine.start("missing").await, Err(ProjectionError::NotRegistered(_))));
        assert_eq!(engine.status("noop").unwrap().state, ProjectionState::Idle);
    }

    #[tokio::test]
    async fn test_replay_run_stops_after_catching_up() {
        let (log, store, engine) = engine();
        for _ in 0..5 {
            log.append("s", NewEvent::new("TICK", Vec::new())).await.unwrap();
        }

        engine.register(Arc::new(Noop), ProjectionOptions::new("s").replay_only()).unwrap();
        engine.start("noop").await.unwrap();

        assert_eq!(engine.wait("noop").await.unwrap(), ProjectionState::Stopped);
        assert_eq!(store.get("noop", None).await.unwrap(), Some(4));

        let status = engine.status("noop").unwrap();
        assert_eq!(status.position, Some(4));
        assert_eq!(status.counters.applied, 5);
    }

    #[tokio::test]
    async fn test_reset_is_refused_while_running() {
        let (_, store, engine) = engine();
        engine.register(Arc::new(Noop), ProjectionOptions::new("s")).unwrap();
        store.save("noop", None, 3).await.unwrap();

        engine.start("noop").await.unwrap();
        assert!(matches!(engine.start("noop").await, Err(ProjectionError::AlreadyRunning(_))));
        assert!(matches!(engine.reset("noop").await, Err(ProjectionError::AlreadyRunning(_))));

        assert_eq!(engine.stop("noop").await.unwrap(), ProjectionState::Stopped);
        assert_eq!(engine.reset("noop").await.unwrap(), 1);
        assert_eq!(store.get("noop", None).await.unwrap(), None);
        assert_eq!(engine.status("noop").unwrap().state, ProjectionState::Idle);
    }
}
