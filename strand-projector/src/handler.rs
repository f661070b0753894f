//! Projection handler contracts.
//!
//! A handler turns events into read-model updates. `apply` must be
//! idempotent: after a crash, events past the last saved checkpoint are
//! delivered again.

use async_trait::async_trait;
use std::sync::Arc;
use strand_eventlog::Event;

/// A read model fed from one event stream.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    /// Stable name, used as the checkpoint key.
    fn name(&self) -> &str;

    /// Apply one event to the read model.
    async fn apply(&self, event: &Event) -> anyhow::Result<()>;
}

/// A projection whose events can be processed in parallel across partitions.
///
/// Events mapping to the same key are applied in log order; events of
/// different keys have no ordering relation.
pub trait PartitionedProjection: Projection {
    fn partition_key(&self, event: &Event) -> String;
}

/// Registered handler, tagged with its partitioning capability.
#[derive(Clone)]
pub enum ProjectionHandler {
    /// Every event goes to a single implicit partition
    Single(Arc<dyn Projection>),
    Partitioned(Arc<dyn PartitionedProjection>),
}

impl ProjectionHandler {
    pub fn name(&self) -> &str {
        match self {
            ProjectionHandler::Single(p) => p.name(),
            ProjectionHandler::Partitioned(p) => p.name(),
        }
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self, ProjectionHandler::Partitioned(_))
    }

    /// Partition of an event; `None` is the implicit single partition.
    pub fn partition_of(&self, event: &Event) -> Option<String> {
        match self {
            ProjectionHandler::Single(_) => None,
            ProjectionHandler::Partitioned(p) => Some(p.partition_key(event)),
        }
    }

    pub async fn apply(&self, event: &Event) -> anyhow::Result<()> {
        match self {
            ProjectionHandler::Single(p) => p.apply(event).await,
            ProjectionHandler::Partitioned(p) => p.apply(event).await,
        }
    }
}

impl std::fmt::Debug for ProjectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionHandler")
            .field("name", &self.name())
            .field("partitioned", &self.is_partitioned())
            .finish()
    }
}
