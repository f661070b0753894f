//! Recording projection with scripted failures and delays.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use strand_eventlog::{Event, Position};
use strand_projector::{PartitionedProjection, Projection};

#[derive(Default)]
struct Journal {
    applied: Vec<Event>,
    attempts: HashMap<Position, u32>,
    /// Remaining injected failures per position
    failures: HashMap<Position, u32>,
}

/// Projection that records every apply call.
///
/// Implements both handler shapes; the partition key defaults to the event
/// type, so register it with `register_partitioned` to get one partition
/// per event type.
pub struct RecordingProjection {
    name: String,
    key: fn(&Event) -> String,
    delays: HashMap<String, Duration>,
    journal: Mutex<Journal>,
}

impl RecordingProjection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: |event| event.event_type.clone(),
            delays: HashMap::new(),
            journal: Mutex::new(Journal::default()),
        }
    }

    /// Derive the partition key with `key` instead of the event type.
    pub fn keyed_by(mut self, key: fn(&Event) -> String) -> Self {
        self.key = key;
        self
    }

    /// Fail the first `times` attempts at `position`.
    pub fn failing(self, position: Position, times: u32) -> Self {
        self.journal().failures.insert(position, times);
        self
    }

    /// Fail every attempt at `position`.
    pub fn always_failing(self, position: Position) -> Self {
        self.failing(position, u32::MAX)
    }

    /// Sleep before applying events of partition `key`.
    pub fn slow_partition(mut self, key: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(key.into(), delay);
        self
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Successfully applied events, in apply order.
    pub fn applied(&self) -> Vec<Event> {
        self.journal().applied.clone()
    }

    pub fn applied_count(&self) -> usize {
        self.journal().applied.len()
    }

    /// Positions applied, in apply order.
    pub fn positions(&self) -> Vec<Position> {
        self.journal().applied.iter().map(|e| e.position).collect()
    }

    /// Positions applied for one partition key, in apply order.
    pub fn positions_for(&self, key: &str) -> Vec<Position> {
        self.journal()
            .applied
            .iter()
            .filter(|e| (self.key)(e) == key)
            .map(|e| e.position)
            .collect()
    }

    /// Apply invocations for one position, failed ones included.
    pub fn attempts(&self, position: Position) -> u32 {
        self.journal().attempts.get(&position).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.journal().attempts.values().sum()
    }
}

#[async_trait]
impl Projection for RecordingProjection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &Event) -> anyhow::Result<()> {
        if let Some(delay) = self.delays.get(&(self.key)(event)) {
            tokio::time::sleep(*delay).await;
        }

        let mut journal = self.journal();
        *journal.attempts.entry(event.position).or_default() += 1;

        if let Some(remaining) = journal.failures.get_mut(&event.position) {
            if *remaining > 0 {
                *remaining = remaining.saturating_sub(1);
                anyhow::bail!("injected failure at position {}", event.position);
            }
        }

        journal.applied.push(event.clone());
        Ok(())
    }
}

impl PartitionedProjection for RecordingProjection {
    fn partition_key(&self, event: &Event) -> String {
        (self.key)(event)
    }
}
