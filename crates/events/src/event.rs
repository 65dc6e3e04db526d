//! Drift event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Alert, AlertKind, ApplicationId, BuildArtifact, CycleSummary, EventId};

/// Events exchanged between the build pipeline, the promotion coordinator,
/// the drift monitor and external observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DriftEvent {
    /// The build pipeline produced a new artifact.
    BuildCompleted {
        event_id: EventId,
        artifact: BuildArtifact,
        timestamp: DateTime<Utc>,
    },
    /// A new desired-state revision was committed to a source.
    SourceChanged {
        event_id: EventId,
        repository: String,
        revision: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A reconciliation cycle finished.
    CycleCompleted {
        event_id: EventId,
        summary: CycleSummary,
        timestamp: DateTime<Utc>,
    },
    /// An operator-visible alert was raised.
    AlertRaised {
        event_id: EventId,
        alert: Alert,
        timestamp: DateTime<Utc>,
    },
    /// A previously raised alert no longer applies.
    AlertCleared {
        event_id: EventId,
        kind: AlertKind,
        subject: String,
        timestamp: DateTime<Utc>,
    },
}

impl DriftEvent {
    /// Create a new BuildCompleted event.
    pub fn build_completed(artifact: BuildArtifact) -> Self {
        Self::BuildCompleted {
            event_id: EventId::new(),
            artifact,
            timestamp: Utc::now(),
        }
    }

    /// Create a new SourceChanged event.
    pub fn source_changed(
        repository: impl Into<String>,
        revision: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self::SourceChanged {
            event_id: EventId::new(),
            repository: repository.into(),
            revision: revision.into(),
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Create a new CycleCompleted event.
    pub fn cycle_completed(summary: CycleSummary) -> Self {
        Self::CycleCompleted {
            event_id: EventId::new(),
            summary,
            timestamp: Utc::now(),
        }
    }

    /// Create a new AlertRaised event.
    pub fn alert_raised(alert: Alert) -> Self {
        Self::AlertRaised {
            event_id: EventId::new(),
            alert,
            timestamp: Utc::now(),
        }
    }

    /// Create a new AlertCleared event.
    pub fn alert_cleared(kind: AlertKind, subject: impl Into<String>) -> Self {
        Self::AlertCleared {
            event_id: EventId::new(),
            kind,
            subject: subject.into(),
            timestamp: Utc::now(),
        }
    }

    /// Get the event ID.
    pub fn event_id(&self) -> EventId {
        match self {
            Self::BuildCompleted { event_id, .. }
            | Self::SourceChanged { event_id, .. }
            | Self::CycleCompleted { event_id, .. }
            | Self::AlertRaised { event_id, .. }
            | Self::AlertCleared { event_id, .. } => *event_id,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::BuildCompleted { timestamp, .. }
            | Self::SourceChanged { timestamp, .. }
            | Self::CycleCompleted { timestamp, .. }
            | Self::AlertRaised { timestamp, .. }
            | Self::AlertCleared { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name used by pattern subscriptions.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BuildCompleted { .. } => "build_completed",
            Self::SourceChanged { .. } => "source_changed",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::AlertRaised { .. } => "alert_raised",
            Self::AlertCleared { .. } => "alert_cleared",
        }
    }

    /// The application this event concerns, if any.
    pub fn application(&self) -> Option<&ApplicationId> {
        match self {
            Self::CycleCompleted { summary, .. } => Some(&summary.application),
            Self::AlertRaised { alert, .. } => alert.application.as_ref(),
            Self::BuildCompleted { .. }
            | Self::SourceChanged { .. }
            | Self::AlertCleared { .. } => None,
        }
    }

    /// The desired-state source this event concerns, if any.
    pub fn repository(&self) -> Option<&str> {
        match self {
            Self::SourceChanged { repository, .. } => Some(repository),
            _ => None,
        }
    }

    /// Short human-readable subject for log lines.
    pub fn subject(&self) -> String {
        match self {
            Self::BuildCompleted { artifact, .. } => artifact.image_reference(),
            Self::SourceChanged {
                repository,
                revision,
                ..
            } => format!("{repository}@{revision}"),
            Self::CycleCompleted { summary, .. } => summary.application.to_string(),
            Self::AlertRaised { alert, .. } => alert.subject.clone(),
            Self::AlertCleared { subject, .. } => subject.clone(),
        }
    }
}
