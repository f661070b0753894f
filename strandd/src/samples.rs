//! Sample projections hosted by the daemon.
//!
//! Both keep their read model in memory and ignore positions they already
//! applied, so at-least-once redelivery after a restart leaves them correct.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use strand_eventlog::{Event, Position};
use strand_projector::{PartitionedProjection, Projection};

/// A projection whose read model can be served over the API.
pub trait ReadModel: Send + Sync {
    fn name(&self) -> &str;

    /// Current read model as JSON.
    fn snapshot(&self) -> Value;

    /// Forget everything; used when the projection is reset for a replay.
    fn clear(&self);
}

// =============================================================================
// Event type counts
// =============================================================================

#[derive(Debug, Default, Serialize)]
struct TypeCounts {
    counts: BTreeMap<String, u64>,
    total: u64,
    last_position: Option<Position>,
}

/// Counts events per event type (single partition).
#[derive(Debug, Default)]
pub struct EventTypeCounts {
    state: RwLock<TypeCounts>,
}

impl EventTypeCounts {
    pub const NAME: &'static str = "event_type_counts";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, event_type: &str) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.counts.get(event_type).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Projection for EventTypeCounts {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, event: &Event) -> anyhow::Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.last_position.is_some_and(|last| event.position <= last) {
            return Ok(());
        }

        *state.counts.entry(event.event_type.clone()).or_default() += 1;
        state.total += 1;
        state.last_position = Some(event.position);
        Ok(())
    }
}

impl ReadModel for EventTypeCounts {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn snapshot(&self) -> Value {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_value(&*state).unwrap_or(Value::Null)
    }

    fn clear(&self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = TypeCounts::default();
    }
}

// =============================================================================
// Entity activity
// =============================================================================

/// Payload field naming the entity an event is about.
pub const ENTITY_FIELD: &str = "entity";

const UNKNOWN_ENTITY: &str = "unknown";

#[derive(Debug, Clone, Default, Serialize)]
struct Activity {
    events: u64,
    last_event_type: String,
    last_position: Position,
    last_seen: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-entity activity, partitioned by the `entity` payload field.
///
/// Events of one entity are applied in log order; entities progress
/// independently.
#[derive(Debug, Default)]
pub struct EntityActivity {
    entities: RwLock<BTreeMap<String, Activity>>,
}

impl EntityActivity {
    pub const NAME: &'static str = "entity_activity";

    pub fn new() -> Self {
        Self::default()
    }

    fn entity_of(event: &Event) -> String {
        event
            .payload_json::<Value>()
            .ok()
            .and_then(|payload| payload.get(ENTITY_FIELD)?.as_str().map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_ENTITY.to_string())
    }

    pub fn events_for(&self, entity: &str) -> u64 {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        entities.get(entity).map_or(0, |activity| activity.events)
    }
}

#[async_trait]
impl Projection for EntityActivity {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, event: &Event) -> anyhow::Result<()> {
        let entity = Self::entity_of(event);
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        let activity = entities.entry(entity).or_default();

        if activity.events > 0 && event.position <= activity.last_position {
            return Ok(());
        }

        activity.events += 1;
        activity.last_event_type = event.event_type.clone();
        activity.last_position = event.position;
        activity.last_seen = Some(event.created_at);
        Ok(())
    }
}

impl PartitionedProjection for EntityActivity {
    fn partition_key(&self, event: &Event) -> String {
        Self::entity_of(event)
    }
}

impl ReadModel for EntityActivity {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn snapshot(&self) -> Value {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_value(&*entities).unwrap_or(Value::Null)
    }

    fn clear(&self) {
        self.entities.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn event(position: Position, event_type: &str, payload: Value) -> Event {
        Event {
            event_id: Uuid::now_v7(),
            stream: "events".to_string(),
            position,
            event_type: event_type.to_string(),
            payload: serde_json::to_vec(&payload).unwrap(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_type_counts_ignore_redelivery() {
        let counts = EventTypeCounts::new();

        counts.apply(&event(0, "CREATED", json!({}))).await.unwrap();
        counts.apply(&event(1, "UPDATED", json!({}))).await.unwrap();
        counts.apply(&event(1, "UPDATED", json!({}))).await.unwrap();
        counts.apply(&event(2, "UPDATED", json!({}))).await.unwrap();

        assert_eq!(counts.count("CREATED"), 1);
        assert_eq!(counts.count("UPDATED"), 2);
        assert_eq!(counts.snapshot()["total"], 3);

        counts.clear();
        assert_eq!(counts.snapshot()["total"], 0);
    }

    #[tokio::test]
    async fn test_entity_activity_keys_by_payload_field() {
        let activity = EntityActivity::new();
        let opened = event(0, "OPENED", json!({ "entity": "acct-1" }));
        let anonymous = event(1, "PING", json!([1, 2]));

        assert_eq!(activity.partition_key(&opened), "acct-1");
        assert_eq!(activity.partition_key(&anonymous), "unknown");

        activity.apply(&opened).await.unwrap();
        activity.apply(&opened).await.unwrap();
        activity.apply(&event(2, "CLOSED", json!({ "entity": "acct-1" }))).await.unwrap();

        assert_eq!(activity.events_for("acct-1"), 2);
        assert_eq!(activity.snapshot()["acct-1"]["last_event_type"], "CLOSED");
    }
}
