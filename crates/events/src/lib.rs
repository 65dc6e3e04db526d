//! Event-driven coordination for drift.
//!
//! Components never share mutable state across reconciliation cycles; they
//! talk through this crate instead:
//!
//! - **Build notifications**: the image pipeline publishes `BuildCompleted`
//! - **Source changes**: the promotion coordinator publishes `SourceChanged`
//!   after committing a new desired-state revision
//! - **Cycle records**: every reconciliation cycle publishes `CycleCompleted`
//! - **Alerts**: conditions that need an operator publish `AlertRaised`
//!
//! # Example
//!
//! ```ignore
//! use drift_events::{BuildArtifact, DriftEvent, EventBus, EventPattern, InMemoryEventStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new(Arc::new(InMemoryEventStore::new()));
//!     let (_id, mut builds) = bus
//!         .subscribe_with_pattern(EventPattern::ByType("build_completed".into()))
//!         .await;
//!
//!     let artifact = BuildArtifact::new("registry.example.com/web", "v2");
//!     bus.publish(DriftEvent::build_completed(artifact)).await.ok();
//!
//!     let event = builds.recv().await;
//!     println!("Received: {:?}", event.map(|e| e.event_type()));
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;
pub mod store;
pub mod types;

// Re-export main types
pub use bus::{EventBus, EventPattern, EventSubscription, SUBSCRIBER_CAPACITY};
pub use error::{Error, Result};
pub use event::DriftEvent;
pub use store::{EventStore, InMemoryEventStore, TracingEventStore};
pub use types::{
    Alert, AlertKind, ApplicationId, BuildArtifact, CycleStatus, CycleSummary, EventId,
};
