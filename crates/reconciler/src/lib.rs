//! GitOps reconciliation engine.
//!
//! Keeps the live resources of an execution environment in line with the
//! desired state declared in a version-controlled source:
//!
//! - **State Fetcher**: immutable, cached desired-state snapshots per revision
//! - **Live-State Collector**: a consistent listing of managed resources
//! - **Diff Engine**: per-resource deltas under pluggable normalization
//! - **Sync Planner**: dependency-ordered create, update and prune actions
//! - **Sync Executor**: guarded writes with per-action timeouts
//! - **Drift Monitor**: schedules cycles on ticks, source changes and drift
//! - **Promotion Coordinator**: writes new image tags into desired state
//!
//! # Example
//!
//! ```ignore
//! use drift_reconciler::{
//!     Application, InMemoryEnvironment, InMemorySource, ReconcilerBuilder,
//!     RevisionSelector, StopSignal,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = Arc::new(InMemorySource::new("deploy"));
//!     source.push("main", [("app.yaml", "kind: Namespace\nmetadata:\n  name: prod\n")]).await;
//!
//!     let reconciler = ReconcilerBuilder::new()
//!         .with_source(source)
//!         .with_environment(Arc::new(InMemoryEnvironment::new()))
//!         .build()
//!         .unwrap();
//!
//!     let app = Application::new("web", "deploy", RevisionSelector::Branch("main".into()));
//!     let report = reconciler.reconcile(&app, &StopSignal::never()).await;
//!     println!("{:?}", report.status);
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod backoff;
pub mod collector;
pub mod cycle;
pub mod diff;
pub mod environment;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod manifest;
pub mod monitor;
pub mod planner;
pub mod promotion;
pub mod reconciler;
pub mod source;
pub mod status;
pub mod stop;
pub mod types;

pub use collector::{LiveSnapshot, LiveStateCollector};
pub use cycle::{CycleReport, ResourceReport};
pub use diff::{
    ComparatorRegistry, ContentComparator, DefaultComparator, DeltaCounts, DeltaStatus,
    DiffEngine, IgnoreFieldsComparator, ResourceDelta,
};
pub use environment::{
    ChangeKind, EnvError, ExecutionEnvironment, InMemoryEnvironment, LabelSelector, ListScope,
    LiveChange, LiveListing, WriteRequest,
};
pub use error::{
    ActionError, CollectorError, ConflictError, Error, FetchError, PlanError, PublishError,
    Result,
};
pub use executor::{
    ActionOutcome, ActionStatus, ExecutorOptions, SkipReason, SyncExecutor, SyncResult,
};
pub use fetcher::StateFetcher;
pub use monitor::{DriftMonitor, TriggerOutcome, TriggerReason};
pub use planner::{ActionKind, PlanOptions, SyncAction, SyncPlan, SyncPlanner};
pub use promotion::{PromotionCoordinator, PromotionOutcome};
pub use reconciler::{PlanPreview, Reconciler, ReconcilerBuilder};
pub use source::{CommitRequest, InMemorySource, SourceRepository, SourceSnapshot};
pub use status::{ApplicationStatus, MonitorPhase, StatusStore};
pub use stop::{stop_channel, StopSignal, Stopper};
pub use types::{
    Application, DesiredState, ExpectedRevision, LiveResource, ResourceKey, ResourceSpec,
    RevisionSelector, RevisionToken,
};
