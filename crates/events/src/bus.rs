//! Event bus: every event is stored first, then fanned out to the
//! subscribers whose pattern matches it.
//!
//! Each subscriber owns a bounded channel. A subscriber that falls more than
//! a channel's worth behind receives [`Error::Lagged`] and can recover the
//! gap from the store with [`EventBus::replay_from`]. Subscribers whose
//! handle was dropped are removed on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::DriftEvent;
use crate::store::EventStore;
use crate::types::{ApplicationId, EventId};

/// Events a subscriber channel holds before the subscriber lags.
pub const SUBSCRIBER_CAPACITY: usize = 128;

/// Which events a subscriber receives.
#[derive(Debug, Clone)]
pub enum EventPattern {
    All,
    /// Events whose [`DriftEvent::event_type`] equals the given name.
    ByType(String),
    /// Cycle records and alerts concerning one application.
    ByApplication(ApplicationId),
    /// Source changes of one desired-state repository.
    ByRepository(String),
}

impl EventPattern {
    pub fn matches(&self, event: &DriftEvent) -> bool {
        match self {
            Self::All => true,
            Self::ByType(t) => event.event_type() == t,
            Self::ByApplication(id) => event.application() == Some(id),
            Self::ByRepository(repo) => event.repository() == Some(repo.as_str()),
        }
    }
}

/// Receiving half of a pattern subscription.
pub struct EventSubscription {
    receiver: broadcast::Receiver<DriftEvent>,
}

impl EventSubscription {
    /// Receive the next matching event.
    ///
    /// # Errors
    ///
    /// `Error::Lagged` if the subscriber missed events (the next call resumes
    /// with the oldest event still queued), `Error::ChannelClosed` once the
    /// subscription was removed from the bus.
    pub async fn recv(&mut self) -> Result<DriftEvent> {
        self.receiver.recv().await.map_err(|e| match e {
            RecvError::Lagged(skipped) => Error::Lagged { skipped },
            RecvError::Closed => Error::ChannelClosed,
        })
    }

    /// Receive an already queued event without waiting.
    ///
    /// # Errors
    ///
    /// `Error::Empty` when nothing is queued, otherwise as [`Self::recv`].
    pub fn try_recv(&mut self) -> Result<DriftEvent> {
        self.receiver.try_recv().map_err(|e| match e {
            TryRecvError::Empty => Error::Empty,
            TryRecvError::Lagged(skipped) => Error::Lagged { skipped },
            TryRecvError::Closed => Error::ChannelClosed,
        })
    }
}

struct Subscriber {
    sender: broadcast::Sender<DriftEvent>,
    pattern: EventPattern,
}

/// Store-backed publish/subscribe hub shared by all drift components.
pub struct EventBus {
    store: Arc<dyn EventStore>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Store `event`, then deliver it to every matching subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the event store rejects the event; nothing is
    /// delivered in that case.
    pub async fn publish(&self, event: DriftEvent) -> Result<EventId> {
        let event_id = self.store.append(event.clone()).await?;
        debug!(
            event_id = %event_id,
            event_type = event.event_type(),
            subject = %event.subject(),
            "Publishing event"
        );

        let abandoned: Vec<String> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|(_, sub)| sub.pattern.matches(&event))
                .filter_map(|(id, sub)| sub.sender.send(event.clone()).is_err().then(|| id.clone()))
                .collect()
        };

        if !abandoned.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in &abandoned {
                subscribers.remove(id);
                debug!(subscriber = %id, "Removed subscriber with no receiver");
            }
        }

        Ok(event_id)
    }

    /// Subscribe to events matching `pattern`.
    ///
    /// Returns the subscriber id for [`Self::unsubscribe`] and the receiving
    /// handle.
    pub async fn subscribe_with_pattern(&self, pattern: EventPattern) -> (String, EventSubscription) {
        let (sender, receiver) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let id = format!("sub_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .await
            .insert(id.clone(), Subscriber { sender, pattern });
        (id, EventSubscription { receiver })
    }

    pub async fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.write().await.remove(subscriber_id);
    }

    /// Stored events published after `from`, oldest first; every stored
    /// event when `from` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event store cannot be read.
    pub async fn replay_from(&self, from: Option<EventId>) -> Result<Vec<DriftEvent>> {
        self.store.read(from).await
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    #[cfg(test)]
    async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;
    use crate::types::{BuildArtifact, CycleStatus, CycleSummary};

    fn bus() -> EventBus {
        EventBus::new(Arc::new(InMemoryEventStore::new()))
    }

    fn failed_cycle(app: &str) -> DriftEvent {
        DriftEvent::cycle_completed(CycleSummary {
            application: ApplicationId::new(app),
            revision: None,
            status: CycleStatus::Failed,
            planned: 0,
            applied: 0,
            skipped: 0,
            failed: 0,
            attention: 0,
            duration_ms: 0,
        })
    }

    #[test]
    fn patterns_select_by_type_application_and_repository() {
        let build = DriftEvent::build_completed(BuildArtifact::new("reg/web", "v1"));
        let change = DriftEvent::source_changed("deploy", "r2", None);
        let cycle = failed_cycle("web");

        assert!(EventPattern::All.matches(&build));
        assert!(EventPattern::ByType("build_completed".into()).matches(&build));
        assert!(!EventPattern::ByType("build_completed".into()).matches(&change));

        assert!(EventPattern::ByApplication(ApplicationId::new("web")).matches(&cycle));
        assert!(!EventPattern::ByApplication(ApplicationId::new("api")).matches(&cycle));
        assert!(!EventPattern::ByApplication(ApplicationId::new("web")).matches(&build));

        assert!(EventPattern::ByRepository("deploy".into()).matches(&change));
        assert!(!EventPattern::ByRepository("platform".into()).matches(&change));
    }

    #[tokio::test]
    async fn subscriber_ids_are_unique() {
        let bus = bus();
        let (first, _a) = bus.subscribe_with_pattern(EventPattern::All).await;
        let (second, _b) = bus.subscribe_with_pattern(EventPattern::All).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_removed_on_publish() {
        let bus = bus();
        let (_kept, _alive) = bus.subscribe_with_pattern(EventPattern::All).await;
        let (_gone, dropped) = bus.subscribe_with_pattern(EventPattern::All).await;
        drop(dropped);

        bus.publish(DriftEvent::source_changed("deploy", "r1", None))
            .await
            .unwrap();

        assert_eq!(bus.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn non_matching_events_do_not_reach_a_subscriber() {
        let bus = bus();
        let (_id, mut builds) = bus
            .subscribe_with_pattern(EventPattern::ByType("build_completed".into()))
            .await;

        bus.publish(DriftEvent::source_changed("deploy", "r1", None))
            .await
            .unwrap();
        bus.publish(DriftEvent::build_completed(BuildArtifact::new("reg/web", "v2")))
            .await
            .unwrap();

        assert_eq!(builds.recv().await.unwrap().event_type(), "build_completed");
        assert!(matches!(builds.try_recv(), Err(Error::Empty)));
    }

    #[tokio::test]
    async fn lagging_subscriber_can_recover_the_gap_from_the_store() {
        let bus = bus();
        let (_id, mut sub) = bus.subscribe_with_pattern(EventPattern::All).await;
        let mut ids = Vec::new();
        for n in 0..=SUBSCRIBER_CAPACITY {
            let id = bus
                .publish(DriftEvent::source_changed("deploy", format!("r{n}"), None))
                .await
                .unwrap();
            ids.push(id);
        }

        assert!(matches!(sub.recv().await, Err(Error::Lagged { skipped: 1 })));
        let missed = bus.replay_from(ids.first().copied()).await.unwrap();
        assert_eq!(missed.len(), SUBSCRIBER_CAPACITY);
        assert_eq!(sub.recv().await.unwrap().subject(), "deploy@r1");
    }
}
