//! Image promotion: writes freshly built image tags into desired state.
//!
//! A `BuildCompleted` event names an image repository and a new tag. Every
//! branch tracked by an application that uses that image gets a commit
//! rewriting matching `image` fields. Publishing is idempotent: when the
//! branch already references the tag nothing is committed. Failed commits
//! are retried until they succeed or the coordinator is stopped, raising a
//! `PromotionStalled` alert once they have failed for too long.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use drift_core::{DriftConfig, PromotionSettings};
use drift_events::{Alert, AlertKind, BuildArtifact, DriftEvent, EventBus, EventId, EventPattern};
use itertools::Itertools;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::{calculate_backoff, jittered};
use crate::error::{PublishError, Result};
use crate::manifest::{is_manifest_path, parse_documents, rewrite_image_lines, rewrite_images};
use crate::source::{CommitRequest, SourceRepository};
use crate::status::StatusStore;
use crate::stop::StopSignal;
use crate::types::RevisionSelector;

const BUILD_COMPLETED: &str = "build_completed";

/// Alert subject for build notifications that could not be recovered.
const MISSED_BUILDS: &str = "build notifications";

/// What promotion did to one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// A new revision was committed.
    Published { branch: String, revision: String },
    /// The branch already referenced the artifact.
    AlreadyCurrent { branch: String, revision: String },
}

impl PromotionOutcome {
    pub fn revision(&self) -> &str {
        match self {
            Self::Published { revision, .. } | Self::AlreadyCurrent { revision, .. } => revision,
        }
    }
}

pub struct PromotionCoordinator {
    source: Arc<dyn SourceRepository>,
    bus: Arc<EventBus>,
    status: Arc<StatusStore>,
    /// Image repository to the branches that reference it.
    targets: HashMap<String, Vec<String>>,
    settings: PromotionSettings,
    author: String,
}

impl PromotionCoordinator {
    pub fn new(
        source: Arc<dyn SourceRepository>,
        bus: Arc<EventBus>,
        status: Arc<StatusStore>,
        settings: PromotionSettings,
    ) -> Self {
        Self {
            source,
            bus,
            status,
            targets: HashMap::new(),
            settings,
            author: "drift".into(),
        }
    }

    /// Track `image` on `branch`.
    pub fn with_target(mut self, image: impl Into<String>, branch: impl Into<String>) -> Self {
        let branches = self.targets.entry(image.into()).or_default();
        let branch = branch.into();
        if !branches.contains(&branch) {
            branches.push(branch);
            branches.sort();
        }
        self
    }

    /// Track every `[[images]]` entry whose applications follow a branch of
    /// this coordinator's source.
    pub fn with_config(mut self, config: &DriftConfig) -> Self {
        for image in &config.images {
            let branches = image
                .applications
                .iter()
                .filter_map(|id| config.application(id))
                .filter(|app| app.repository == self.source.identity())
                .filter_map(|app| RevisionSelector::from(&app.revision).branch().map(str::to_string))
                .unique()
                .collect_vec();
            if branches.is_empty() {
                warn!(image = %image.image, "Image has no promotable branch in this source");
            }
            for branch in branches {
                self = self.with_target(image.image.clone(), branch);
            }
        }
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Branches `image` is promoted into.
    pub fn targets(&self, image: &str) -> &[String] {
        self.targets.get(image).map_or(&[], Vec::as_slice)
    }

    /// Promote `artifact` into every tracked branch, retrying until each
    /// branch succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Cancelled`] if `stop` fires before every
    /// branch is promoted.
    pub async fn promote(
        &self,
        artifact: &BuildArtifact,
        stop: &StopSignal,
    ) -> std::result::Result<Vec<PromotionOutcome>, PublishError> {
        let branches = self.targets(&artifact.repository);
        if branches.is_empty() {
            debug!(artifact = %artifact, "No tracked branch references this image");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(branches.len());
        for branch in branches {
            outcomes.push(self.promote_branch(artifact, branch, stop).await?);
        }
        Ok(outcomes)
    }

    async fn promote_branch(
        &self,
        artifact: &BuildArtifact,
        branch: &str,
        stop: &StopSignal,
    ) -> std::result::Result<PromotionOutcome, PublishError> {
        let subject = format!("{artifact} on {branch}");
        let started = Instant::now();
        let mut stop = stop.clone();
        let mut attempt: u32 = 0;

        loop {
            if stop.is_stopped() {
                return Err(PublishError::Cancelled);
            }
            match self.try_promote(artifact, branch).await {
                Ok(outcome) => {
                    self.clear_stalled(&subject).await;
                    return Ok(outcome);
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        artifact = %artifact,
                        branch = %branch,
                        attempt,
                        error = %err,
                        "Promotion attempt failed"
                    );
                    if started.elapsed() >= self.settings.alert_after() {
                        self.raise_stalled(&subject, &err).await;
                    }
                }
            }

            let delay = jittered(calculate_backoff(
                attempt.saturating_sub(1),
                self.settings.base_backoff_ms,
                self.settings.max_backoff_ms,
            ));
            tokio::select! {
                () = stop.stopped() => return Err(PublishError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_promote(
        &self,
        artifact: &BuildArtifact,
        branch: &str,
    ) -> std::result::Result<PromotionOutcome, PublishError> {
        let reference = artifact.image_reference();
        let snapshot = self
            .source
            .fetch(&RevisionSelector::Branch(branch.to_string()))
            .await?;

        let mut changed = BTreeMap::new();
        for (path, text) in snapshot.files.iter().filter(|(path, _)| is_manifest_path(path)) {
            let mut documents = parse_documents(text).map_err(|reason| PublishError::Rewrite {
                path: path.clone(),
                reason,
            })?;
            let rewritten: usize = documents
                .iter_mut()
                .map(|doc| rewrite_images(doc, &artifact.repository, &reference))
                .sum();
            if rewritten == 0 {
                continue;
            }

            // Only the image scalars change; the result must parse to the
            // rewritten documents.
            let (edited, _) = rewrite_image_lines(text, &artifact.repository, &reference);
            let reparsed = parse_documents(&edited).map_err(|reason| PublishError::Rewrite {
                path: path.clone(),
                reason,
            })?;
            if reparsed != documents {
                return Err(PublishError::Rewrite {
                    path: path.clone(),
                    reason: format!("{rewritten} image reference(s) not in block style, edit them by hand"),
                });
            }
            changed.insert(path.clone(), edited);
        }

        if changed.is_empty() {
            debug!(artifact = %artifact, branch = %branch, revision = %snapshot.revision, "Branch already current");
            return Ok(PromotionOutcome::AlreadyCurrent {
                branch: branch.to_string(),
                revision: snapshot.revision,
            });
        }

        let files = changed.len();
        let revision = self
            .source
            .commit(CommitRequest {
                branch: branch.to_string(),
                parent: snapshot.revision,
                files: changed,
                message: format!("Promote {reference}"),
                author: self.author.clone(),
            })
            .await?;
        info!(artifact = %artifact, branch = %branch, revision = %revision, files, "Promotion published");

        let notice = DriftEvent::source_changed(
            self.source.identity(),
            revision.clone(),
            Some(format!("promoted {reference}")),
        );
        if let Err(err) = self.bus.publish(notice).await {
            // The commit stands; the next scheduled cycle picks it up.
            warn!(revision = %revision, error = %err, "Failed to announce promoted revision");
        }

        Ok(PromotionOutcome::Published {
            branch: branch.to_string(),
            revision,
        })
    }

    async fn raise_stalled(&self, subject: &str, err: &PublishError) {
        let alert = Alert::new(
            AlertKind::PromotionStalled,
            None,
            subject,
            format!("promotion has not succeeded since {}ms: {err}", self.settings.alert_after_ms),
        );
        if !self.status.raise_alert(alert.clone()).await {
            return;
        }
        error!(subject = %subject, error = %err, "Promotion stalled");
        if let Err(publish_err) = self.bus.publish(DriftEvent::alert_raised(alert)).await {
            warn!(subject = %subject, error = %publish_err, "Failed to publish alert");
        }
    }

    async fn clear_stalled(&self, subject: &str) {
        if !self.status.clear_alert(AlertKind::PromotionStalled, subject).await {
            return;
        }
        info!(subject = %subject, "Promotion recovered");
        let cleared = DriftEvent::alert_cleared(AlertKind::PromotionStalled, subject);
        if let Err(err) = self.bus.publish(cleared).await {
            warn!(subject = %subject, error = %err, "Failed to publish alert clearance");
        }
    }

    /// Promote every `BuildCompleted` artifact published on the bus, in
    /// delivery order, until stopped.
    ///
    /// Builds missed while the subscription lagged are read back from the
    /// event store, starting after the last build handled.
    ///
    /// # Errors
    ///
    /// Fails when the event store cannot be read at startup or the bus closes
    /// underneath the coordinator.
    pub async fn run(&self, stop: StopSignal) -> Result<()> {
        let mut cursor = self.bus.store().last_event_id().await?;
        let (subscriber, mut builds) = self
            .bus
            .subscribe_with_pattern(EventPattern::ByType(BUILD_COMPLETED.into()))
            .await;
        let mut signal = stop.clone();
        let mut replayed: HashSet<EventId> = HashSet::new();
        info!(images = self.targets.len(), "Promotion coordinator started");

        let result = loop {
            let received = tokio::select! {
                () = signal.stopped() => break Ok(()),
                received = builds.recv() => received,
            };
            let pending = match received {
                Ok(DriftEvent::BuildCompleted { event_id, artifact, .. }) => {
                    if replayed.remove(&event_id) {
                        continue;
                    }
                    vec![(event_id, artifact)]
                }
                Ok(_) => continue,
                Err(drift_events::Error::Lagged { skipped }) => {
                    warn!(skipped, "Missed build notifications, reading them back from the event store");
                    replayed.clear();
                    match self.missed_builds(cursor).await {
                        Ok(missed) => {
                            self.clear_stalled(MISSED_BUILDS).await;
                            replayed.extend(missed.iter().map(|(id, _)| *id));
                            missed
                        }
                        Err(err) => {
                            self.raise_missed(skipped, &err).await;
                            continue;
                        }
                    }
                }
                Err(err) => break Err(err.into()),
            };

            let mut cancelled = false;
            for (event_id, artifact) in pending {
                if !self.promote_build(&artifact, &stop).await {
                    cancelled = true;
                    break;
                }
                cursor = Some(event_id);
            }
            if cancelled {
                break Ok(());
            }
        };

        self.bus.unsubscribe(&subscriber).await;
        info!("Promotion coordinator stopped");
        result
    }

    /// Stored builds published after `cursor`, oldest first.
    async fn missed_builds(
        &self,
        cursor: Option<EventId>,
    ) -> drift_events::Result<Vec<(EventId, BuildArtifact)>> {
        let events = self.bus.replay_from(cursor).await?;
        Ok(events
            .into_iter()
            .filter_map(|event| match event {
                DriftEvent::BuildCompleted { event_id, artifact, .. } => Some((event_id, artifact)),
                _ => None,
            })
            .collect())
    }

    /// Returns `false` once promotion was cancelled.
    async fn promote_build(&self, artifact: &BuildArtifact, stop: &StopSignal) -> bool {
        match self.promote(artifact, stop).await {
            Ok(outcomes) => {
                debug!(artifact = %artifact, branches = outcomes.len(), "Build promoted");
                true
            }
            Err(PublishError::Cancelled) => false,
            Err(err) => {
                error!(artifact = %artifact, error = %err, "Promotion abandoned");
                true
            }
        }
    }

    async fn raise_missed(&self, skipped: u64, err: &drift_events::Error) {
        let alert = Alert::new(
            AlertKind::PromotionStalled,
            None,
            MISSED_BUILDS,
            format!("{skipped} build notification(s) overflowed and could not be read back: {err}"),
        );
        error!(skipped, error = %err, "Build notifications lost");
        if self.status.raise_alert(alert.clone()).await {
            if let Err(publish_err) = self.bus.publish(DriftEvent::alert_raised(alert)).await {
                warn!(error = %publish_err, "Failed to publish alert");
            }
        }
    }
}
