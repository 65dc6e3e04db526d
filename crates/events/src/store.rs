//! Event store trait and implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::event::DriftEvent;
use crate::types::EventId;

/// Trait for event storage backends.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event to the store.
    async fn append(&self, event: DriftEvent) -> Result<EventId>;

    /// Read events published after the given event ID (all events when `None`).
    async fn read(&self, from: Option<EventId>) -> Result<Vec<DriftEvent>>;

    /// Read events of one type, in publication order.
    async fn read_by_type(&self, event_type: &str) -> Result<Vec<DriftEvent>>;

    /// Get the last event ID.
    async fn last_event_id(&self) -> Result<Option<EventId>>;

    /// Get the total number of events.
    async fn count(&self) -> Result<usize>;
}

/// In-memory event store.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<DriftEvent>>,
    type_index: RwLock<HashMap<&'static str, Vec<usize>>>,
}

impl InMemoryEventStore {
    /// Create a new in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: DriftEvent) -> Result<EventId> {
        let event_id = event.event_id();
        let event_type = event.event_type();

        let mut events = self.events.write().await;
        let index = events.len();
        events.push(event);

        let mut type_index = self.type_index.write().await;
        type_index.entry(event_type).or_default().push(index);

        Ok(event_id)
    }

    async fn read(&self, from: Option<EventId>) -> Result<Vec<DriftEvent>> {
        let events = self.events.read().await;

        let start = from
            .and_then(|from_id| events.iter().position(|e| e.event_id() == from_id))
            .map_or(0, |pos| pos.saturating_add(1));

        Ok(events.iter().skip(start).cloned().collect())
    }

    async fn read_by_type(&self, event_type: &str) -> Result<Vec<DriftEvent>> {
        let events = self.events.read().await;
        let type_index = self.type_index.read().await;

        Ok(type_index
            .get(event_type)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&i| events.get(i).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_event_id(&self) -> Result<Option<EventId>> {
        let events = self.events.read().await;
        Ok(events.last().map(DriftEvent::event_id))
    }

    async fn count(&self) -> Result<usize> {
        let events = self.events.read().await;
        Ok(events.len())
    }
}

/// A wrapper that adds tracing to an event store.
pub struct TracingEventStore<S: EventStore> {
    inner: S,
}

impl<S: EventStore> TracingEventStore<S> {
    /// Create a new tracing event store.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: EventStore> EventStore for TracingEventStore<S> {
    async fn append(&self, event: DriftEvent) -> Result<EventId> {
        tracing::debug!(
            event_type = event.event_type(),
            subject = %event.subject(),
            "Appending event"
        );
        let result = self.inner.append(event).await;
        if let Ok(ref id) = result {
            tracing::trace!(event_id = %id, "Event appended");
        }
        result
    }

    async fn read(&self, from: Option<EventId>) -> Result<Vec<DriftEvent>> {
        tracing::debug!(from = ?from, "Reading events");
        self.inner.read(from).await
    }

    async fn read_by_type(&self, event_type: &str) -> Result<Vec<DriftEvent>> {
        tracing::debug!(event_type, "Reading events by type");
        self.inner.read_by_type(event_type).await
    }

    async fn last_event_id(&self) -> Result<Option<EventId>> {
        self.inner.last_event_id().await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::BuildArtifact;

    #[tokio::test]
    async fn test_append_and_read() {
        let store = InMemoryEventStore::new();
        let event = DriftEvent::build_completed(BuildArtifact::new("reg/web", "v1"));

        let event_id = store.append(event).await;
        assert!(event_id.is_ok());

        let events = store.read(None).await;
        assert_eq!(events.map(|e| e.len()).unwrap_or(0), 1);
    }

    #[tokio::test]
    async fn test_read_by_type() {
        let store = InMemoryEventStore::new();
        store
            .append(DriftEvent::build_completed(BuildArtifact::new("reg/web", "v1")))
            .await
            .ok();
        store
            .append(DriftEvent::source_changed("deploy", "r1", None))
            .await
            .ok();
        store
            .append(DriftEvent::build_completed(BuildArtifact::new("reg/web", "v2")))
            .await
            .ok();

        let builds = store.read_by_type("build_completed").await.unwrap();
        assert_eq!(builds.len(), 2);
        let changes = store.read_by_type("source_changed").await.unwrap();
        assert_eq!(changes.len(), 1);
        let none = store.read_by_type("alert_raised").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_read_from_event() {
        let store = InMemoryEventStore::new();
        let first = store
            .append(DriftEvent::source_changed("deploy", "r1", None))
            .await
            .ok();
        store
            .append(DriftEvent::source_changed("deploy", "r2", None))
            .await
            .ok();
        store
            .append(DriftEvent::source_changed("deploy", "r3", None))
            .await
            .ok();

        let events = store.read(first).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tracing_store_delegates() {
        let store = TracingEventStore::new(InMemoryEventStore::new());
        let id = store
            .append(DriftEvent::source_changed("deploy", "r1", None))
            .await
            .unwrap();
        assert_eq!(store.last_event_id().await.unwrap(), Some(id));
    }
}
