//! Drift monitor: decides when each application is reconciled.
//!
//! Every application gets its own worker driven by a periodic tick, by
//! explicit triggers and by a retry timer after a cycle that fell short.
//! Source changes and manual requests arriving while a cycle runs collapse
//! into one pending re-run. Live drift signals are dropped while a cycle is
//! pending or running. Workers share a single task and run concurrently;
//! cycles of one application are serialized by the reconciler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drift_core::MonitorSettings;
use drift_events::{ApplicationId, DriftEvent, EventPattern};
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::{calculate_backoff, jittered};
use crate::environment::LiveChange;
use crate::error::{Error, Result};
use crate::reconciler::Reconciler;
use crate::stop::{stop_channel, StopSignal, Stopper};
use crate::types::{Application, ResourceKey};

/// Why a cycle was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReason {
    Tick,
    SourceChanged { revision: String },
    LiveDrift { key: ResourceKey },
    Retry,
    Manual,
}

/// Result of asking for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Queued as the next run.
    Accepted,
    /// A run was already pending, or a drift signal arrived mid-cycle.
    Coalesced,
    UnknownApplication,
    /// The monitor has shut down.
    Stopped,
}

struct WorkerSlot {
    triggers: mpsc::Sender<TriggerReason>,
    busy: AtomicBool,
}

pub struct DriftMonitor {
    reconciler: Arc<Reconciler>,
    applications: HashMap<ApplicationId, Application>,
    slots: HashMap<ApplicationId, WorkerSlot>,
    receivers: Mutex<HashMap<ApplicationId, mpsc::Receiver<TriggerReason>>>,
    settings: MonitorSettings,
    stopper: Stopper,
    signal: StopSignal,
}

impl DriftMonitor {
    pub fn new(
        reconciler: Arc<Reconciler>,
        applications: impl IntoIterator<Item = Application>,
        settings: MonitorSettings,
    ) -> Self {
        let applications: HashMap<ApplicationId, Application> = applications
            .into_iter()
            .map(|app| (app.id.clone(), app))
            .collect();
        let (slots, receivers) = applications
            .keys()
            .map(|id| {
                // Capacity one: at most one pending run per application.
                let (tx, rx) = mpsc::channel(1);
                let slot = WorkerSlot {
                    triggers: tx,
                    busy: AtomicBool::new(false),
                };
                ((id.clone(), slot), (id.clone(), rx))
            })
            .unzip();
        let (stopper, signal) = stop_channel();

        Self {
            reconciler,
            applications,
            slots,
            receivers: Mutex::new(receivers),
            settings,
            stopper,
            signal,
        }
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// Stop all workers after their current action.
    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Request an immediate cycle for `application`.
    pub fn sync_now(&self, application: &ApplicationId) -> TriggerOutcome {
        self.trigger(application, TriggerReason::Manual)
    }

    /// Request a cycle for `application`.
    pub fn trigger(&self, application: &ApplicationId, reason: TriggerReason) -> TriggerOutcome {
        let Some(slot) = self.slots.get(application) else {
            return TriggerOutcome::UnknownApplication;
        };
        if self.signal.is_stopped() {
            return TriggerOutcome::Stopped;
        }
        if matches!(reason, TriggerReason::LiveDrift { .. }) && slot.busy.load(Ordering::SeqCst) {
            debug!(application = %application, "Drift signal dropped, cycle in flight");
            return TriggerOutcome::Coalesced;
        }
        match slot.triggers.try_send(reason) {
            Ok(()) => TriggerOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(application = %application, "Trigger coalesced into pending run");
                TriggerOutcome::Coalesced
            }
            Err(mpsc::error::TrySendError::Closed(_)) => TriggerOutcome::Stopped,
        }
    }

    /// Run until stopped.
    ///
    /// # Errors
    ///
    /// Fails if the monitor is already running.
    pub async fn run(&self) -> Result<()> {
        let receivers: Vec<_> = self.receivers.lock().await.drain().collect();
        if receivers.is_empty() && !self.applications.is_empty() {
            return Err(Error::invalid_config("drift monitor is already running"));
        }

        info!(
            applications = self.applications.len(),
            interval_ms = self.settings.interval_ms,
            self_heal = self.reconciler.settings().self_heal,
            "Drift monitor started"
        );

        let workers = join_all(receivers.into_iter().filter_map(|(id, rx)| {
            let app = self.applications.get(&id)?;
            let slot = self.slots.get(&id)?;
            Some(self.run_worker(app, &slot.busy, rx))
        }));
        tokio::join!(workers, self.watch_sources(), self.watch_live_state());

        info!("Drift monitor stopped");
        Ok(())
    }

    async fn run_worker(
        &self,
        app: &Application,
        busy: &AtomicBool,
        mut triggers: mpsc::Receiver<TriggerReason>,
    ) {
        let mut stop = self.signal.clone();
        let period = self.settings.interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry_at: Option<Instant> = None;

        loop {
            let reason = tokio::select! {
                biased;
                () = stop.stopped() => break,
                Some(reason) = triggers.recv() => reason,
                () = sleep_until(retry_at) => TriggerReason::Retry,
                _ = ticker.tick() => TriggerReason::Tick,
            };
            debug!(application = %app.id, reason = ?reason, "Cycle triggered");

            busy.store(true, Ordering::SeqCst);
            let report = self.reconciler.reconcile(app, &self.signal).await;
            busy.store(false, Ordering::SeqCst);
            if self.signal.is_stopped() {
                break;
            }

            retry_at = if report.needs_retry() {
                let failures = self
                    .reconciler
                    .status_store()
                    .consecutive_failures(&app.id)
                    .await;
                let delay = jittered(calculate_backoff(
                    failures.saturating_sub(1),
                    self.settings.retry_base_backoff_ms,
                    self.settings.retry_max_backoff_ms,
                ));
                debug!(
                    application = %app.id,
                    failures,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Retry scheduled"
                );
                Some(Instant::now() + delay)
            } else {
                None
            };
        }
        debug!(application = %app.id, "Worker stopped");
    }

    /// React to new desired-state revisions published on the bus.
    async fn watch_sources(&self) {
        let Some(bus) = self.reconciler.event_bus() else {
            return;
        };
        let (subscriber, mut changes) = bus
            .subscribe_with_pattern(EventPattern::ByType("source_changed".into()))
            .await;
        let mut stop = self.signal.clone();

        loop {
            let received = tokio::select! {
                () = stop.stopped() => break,
                received = changes.recv() => received,
            };
            match received {
                Ok(DriftEvent::SourceChanged {
                    repository,
                    revision,
                    ..
                }) => {
                    for app in self.applications.values().filter(|a| a.repository == repository) {
                        let outcome = self.trigger(
                            &app.id,
                            TriggerReason::SourceChanged {
                                revision: revision.clone(),
                            },
                        );
                        debug!(application = %app.id, revision = %revision, outcome = ?outcome, "Source change");
                    }
                }
                Ok(_) => {}
                Err(drift_events::Error::Lagged { skipped }) => {
                    warn!(skipped, "Missed source changes, triggering every application");
                    self.trigger_all(&TriggerReason::Manual);
                }
                Err(_) => break,
            }
        }
        bus.unsubscribe(&subscriber).await;
    }

    /// With self-heal on, reconcile as soon as another writer touches a
    /// managed resource.
    async fn watch_live_state(&self) {
        let settings = self.reconciler.settings();
        if !settings.self_heal {
            return;
        }
        let Some(mut changes) = self.reconciler.environment().watch() else {
            debug!("Environment has no change feed; drift is found on the next tick");
            return;
        };
        let mut stop = self.signal.clone();

        loop {
            let received = tokio::select! {
                () = stop.stopped() => break,
                received = changes.recv() => received,
            };
            match received {
                Ok(change) => self.on_live_change(change, &settings.manager),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed live changes, triggering every application");
                    self.trigger_all(&TriggerReason::Manual);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn on_live_change(&self, change: LiveChange, manager: &str) {
        if change.actor == manager {
            return;
        }
        let Some(application) = change.application.map(ApplicationId::new) else {
            return;
        };
        if !self.applications.contains_key(&application) {
            return;
        }
        info!(
            application = %application,
            key = %change.key,
            actor = %change.actor,
            "Live drift detected"
        );
        self.trigger(&application, TriggerReason::LiveDrift { key: change.key });
    }

    fn trigger_all(&self, reason: &TriggerReason) {
        for id in self.applications.keys() {
            self.trigger(id, reason.clone());
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
