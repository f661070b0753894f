//! Partition worker: applies the events of one partition in order and
//! persists the partition's progress.

use crate::error::{partition_label, ProjectionError};
use crate::handler::ProjectionHandler;
use crate::policy::{retry_storage, CheckpointCadence, Exhausted, FailurePolicy};
use crate::status::Counters;
use std::sync::Arc;
use strand_eventlog::{Event, Position};
use strand_store::CheckpointStore;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Worker → engine notifications.
#[derive(Debug)]
pub(crate) enum Report {
    /// The event at this position will not be handed to the handler again
    /// in this run (applied, skipped, or already checkpointed)
    Done(Position),
    /// The worker stopped on a fatal error
    Fault(ProjectionError),
}

/// State shared by every worker of one projection run.
pub(crate) struct WorkerContext {
    pub(crate) handler: ProjectionHandler,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) policy: FailurePolicy,
    pub(crate) cadence: CheckpointCadence,
    pub(crate) counters: Arc<Counters>,
    pub(crate) reports: mpsc::UnboundedSender<Report>,
    /// Fired on any fatal error; workers stop after their in-flight apply
    pub(crate) halt: CancellationToken,
}

enum Outcome {
    Applied,
    Skipped,
    Halted(ProjectionError),
    /// Halt fired while waiting to retry
    Interrupted,
}

pub(crate) struct Worker {
    ctx: Arc<WorkerContext>,
    partition: Option<String>,
    queue: mpsc::Receiver<Event>,
    last_seen: Option<Position>,
    last_applied: Option<Position>,
    last_saved: Option<Position>,
    unsaved: u64,
    last_save_at: Instant,
}

impl Worker {
    pub(crate) fn new(ctx: Arc<WorkerContext>, partition: Option<String>, queue: mpsc::Receiver<Event>) -> Self {
        Self {
            ctx,
            partition,
            queue,
            last_seen: None,
            last_applied: None,
            last_saved: None,
            unsaved: 0,
            last_save_at: Instant::now(),
        }
    }

    fn projection(&self) -> &str {
        self.ctx.handler.name()
    }

    /// Run until the queue closes (graceful) or the halt token fires.
    pub(crate) async fn run(mut self) {
        let partition = partition_label(self.partition.as_deref());
        debug!(projection = %self.projection(), partition = %partition, "Partition worker started");

        if let Err(e) = self.process().await {
            self.fault(e);
        }

        // Committed progress is flushed on every exit path.
        if let Err(e) = self.flush().await {
            self.fault(e);
        }

        debug!(
            projection = %self.projection(),
            partition = %partition,
            last_applied = ?self.last_applied,
            "Partition worker stopped"
        );
    }

    async fn process(&mut self) -> Result<(), ProjectionError> {
        // Partitions resume independently of the projection-wide cursor.
        let floor = match &self.partition {
            Some(key) => {
                let ctx = self.ctx.clone();
                let projection = ctx.handler.name();
                retry_storage(&ctx.policy, &ctx.halt, "load partition checkpoint", || {
                    ctx.checkpoints.get(projection, Some(key.as_str()))
                })
                .await?
            },
            None => None,
        };
        self.last_applied = floor;
        self.last_saved = floor;

        loop {
            let deadline = self.save_deadline();

            let event = tokio::select! {
                biased;
                _ = self.ctx.halt.cancelled() => return Ok(()),
                received = self.queue.recv() => match received {
                    Some(event) => event,
                    None => return Ok(()),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.save().await?;
                    continue;
                }
            };

            self.check_order(&event)?;

            if floor.is_some_and(|floor| event.position <= floor) {
                debug!(
                    projection = %self.projection(),
                    position = event.position,
                    "Event already checkpointed by its partition"
                );
                self.report(Report::Done(event.position));
                continue;
            }

            match self.apply(&event).await {
                Outcome::Applied => self.ctx.counters.record_applied(),
                Outcome::Skipped => self.ctx.counters.record_skipped(),
                Outcome::Halted(e) => return Err(e),
                Outcome::Interrupted => return Ok(()),
            }

            self.last_applied = Some(event.position);
            self.unsaved += 1;
            self.report(Report::Done(event.position));

            if self.unsaved >= self.ctx.cadence.every_events {
                self.save().await?;
            }
        }
    }

    /// Positions handed to one worker must be strictly increasing.
    fn check_order(&mut self, event: &Event) -> Result<(), ProjectionError> {
        if let Some(last) = self.last_seen {
            if event.position <= last {
                return Err(ProjectionError::OrderingViolation {
                    projection: self.projection().to_string(),
                    partition: partition_label(self.partition.as_deref()),
                    reason: format!("received position {} after {}", event.position, last),
                });
            }
        }
        self.last_seen = Some(event.position);
        Ok(())
    }

    /// Apply one event under the failure policy.
    async fn apply(&self, event: &Event) -> Outcome {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match self.ctx.handler.apply(event).await {
                Ok(()) => {
                    debug!(
                        projection = %self.projection(),
                        stream = %event.stream,
                        position = event.position,
                        event_type = %event.event_type,
                        "Event applied"
                    );
                    return Outcome::Applied;
                },
                Err(err) => err,
            };

            self.ctx.counters.record_failed();
            let failure = ProjectionError::Handler {
                projection: self.projection().to_string(),
                stream: event.stream.clone(),
                position: event.position,
                message: format!("{err:#}"),
            };

            let exhausted = match self.ctx.policy {
                FailurePolicy::Skip => Exhausted::Skip,
                FailurePolicy::Halt => Exhausted::Halt,
                FailurePolicy::Retry { max_attempts, backoff, on_exhausted } => {
                    if attempt >= max_attempts {
                        on_exhausted
                    } else {
                        warn!(
                            projection = %self.projection(),
                            position = event.position,
                            attempt,
                            max_attempts,
                            error = %failure,
                            "Handler failed (will retry)"
                        );
                        self.ctx.counters.record_retried();

                        tokio::select! {
                            _ = self.ctx.halt.cancelled() => return Outcome::Interrupted,
                            _ = sleep(backoff.delay(attempt)) => {}
                        }
                        continue;
                    }
                },
            };

            return match exhausted {
                Exhausted::Skip => {
                    warn!(
                        projection = %self.projection(),
                        stream = %event.stream,
                        position = event.position,
                        error = %failure,
                        "Skipping event after handler failure"
                    );
                    Outcome::Skipped
                },
                Exhausted::Halt => Outcome::Halted(failure),
            };
        }
    }

    fn save_deadline(&self) -> Option<Instant> {
        let interval = self.ctx.cadence.max_interval?;
        (self.unsaved > 0).then(|| self.last_save_at + interval)
    }

    /// Persist the last applied position.
    async fn save(&mut self) -> Result<(), ProjectionError> {
        let Some(position) = self.last_applied else {
            return Ok(());
        };

        let ctx = self.ctx.clone();
        let projection = ctx.handler.name();
        let partition = self.partition.as_deref();
        retry_storage(&ctx.policy, &ctx.halt, "save checkpoint", || {
            ctx.checkpoints.save(projection, partition, position)
        })
        .await?;

        self.last_saved = Some(position);
        self.unsaved = 0;
        self.last_save_at = Instant::now();
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ProjectionError> {
        if self.last_applied > self.last_saved {
            self.save().await?;
        }
        Ok(())
    }

    fn fault(&self, e: ProjectionError) {
        error!(
            projection = %self.projection(),
            partition = %partition_label(self.partition.as_deref()),
            error = %e,
            "Partition worker faulted"
        );
        self.ctx.halt.cancel();
        self.report(Report::Fault(e));
    }

    fn report(&self, report: Report) {
        // The engine outlives its workers; a closed channel only means the
        // run is already being torn down.
        let _ = self.ctx.reports.send(report);
    }
}
