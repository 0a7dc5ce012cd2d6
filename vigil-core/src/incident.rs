//! Incidents: the correlated, stateful unit of escalation.
//!
//! An incident owns the observations correlated into it, its level-transition
//! history, and an append-only action log. Together they are enough to rebuild
//! the full escalation timeline for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{ActionRecord, DeliveryStatus};
use crate::error::InvariantViolation;
use crate::observation::Observation;
use crate::threat::ThreatLevel;

/// Lifecycle state of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "level", rename_all = "snake_case")]
pub enum IncidentState {
    Open(ThreatLevel),
    Closed,
}

impl IncidentState {
    pub fn is_open(&self) -> bool {
        matches!(self, IncidentState::Open(_))
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentState::Open(level) => write!(f, "OPEN({level})"),
            IncidentState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Why an incident was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloseReason {
    /// No new observations for the configured quiet period.
    QuietPeriod,
    /// Closed by an operator.
    Operator { reason: String },
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::QuietPeriod => write!(f, "quiet period elapsed"),
            CloseReason::Operator { reason } => write!(f, "operator: {reason}"),
        }
    }
}

/// One committed state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTransition {
    /// Starts at 1 for the initial entry and increases by one per transition.
    pub sequence: u64,
    /// `None` for the initial entry.
    pub from: Option<IncidentState>,
    pub to: IncidentState,
    pub at: DateTime<Utc>,
    /// Observation that triggered the transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<Uuid>,
}

/// The correlated escalation unit for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub entity_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub observations: Vec<Observation>,
    pub current_level: ThreatLevel,
    pub peak_level: ThreatLevel,
    pub state: IncidentState,
    pub transitions: Vec<LevelTransition>,
    pub action_log: Vec<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    /// Set when an invariant violation removed the incident from automated
    /// escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupted: Option<String>,
}

impl Incident {
    /// A fresh incident seeded by its first observation. The state machine
    /// records the initial transition.
    pub fn open(observation: Observation, level: ThreatLevel) -> Self {
        let accepted_at = observation.accepted_at;
        Self {
            id: Uuid::new_v4(),
            entity_key: observation.source_entity.clone(),
            first_seen: accepted_at,
            last_seen: accepted_at,
            observations: vec![observation],
            current_level: level,
            peak_level: level,
            state: IncidentState::Open(level),
            transitions: Vec::new(),
            action_log: Vec::new(),
            close_reason: None,
            corrupted: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.is_some()
    }

    /// When the incident was closed, taken from its closing transition.
    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        if self.is_open() {
            return None;
        }
        self.transitions
            .iter()
            .rev()
            .find(|t| t.to == IncidentState::Closed)
            .map(|t| t.at)
    }

    /// Sequence number of the latest committed transition (0 if none).
    pub fn transition_sequence(&self) -> u64 {
        self.transitions.last().map(|t| t.sequence).unwrap_or(0)
    }

    /// Latest record per idempotency key, in issue order.
    pub fn latest_action_records(&self) -> Vec<&ActionRecord> {
        let mut latest: Vec<&ActionRecord> = Vec::new();
        for record in &self.action_log {
            match latest
                .iter_mut()
                .find(|r| r.action.idempotency_key == record.action.idempotency_key)
            {
                Some(slot) => *slot = record,
                None => latest.push(record),
            }
        }
        latest
    }

    /// Actions whose latest record is undeliverable.
    pub fn undeliverable_actions(&self) -> Vec<&ActionRecord> {
        self.latest_action_records()
            .into_iter()
            .filter(|r| r.status == DeliveryStatus::Undeliverable)
            .collect()
    }

    /// Whether an operator needs to look at this incident.
    pub fn needs_attention(&self) -> bool {
        self.is_corrupted() || !self.undeliverable_actions().is_empty()
    }

    /// Check the structural invariants of the incident.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        let violation = |message: String| InvariantViolation {
            incident_id: self.id,
            message,
        };

        if self.peak_level < self.current_level {
            return Err(violation(format!(
                "peak level {} is below current level {}",
                self.peak_level, self.current_level
            )));
        }
        if let IncidentState::Open(level) = self.state
            && level != self.current_level
        {
            return Err(violation(format!(
                "state {} disagrees with current level {}",
                self.state, self.current_level
            )));
        }
        if self.observations.is_empty() {
            return Err(violation("incident has no observations".into()));
        }
        if self.first_seen > self.last_seen {
            return Err(violation("first_seen is after last_seen".into()));
        }
        if let Some(stray) = self
            .observations
            .iter()
            .find(|o| o.source_entity != self.entity_key)
        {
            return Err(violation(format!(
                "observation {} belongs to entity '{}'",
                stray.id, stray.source_entity
            )));
        }
        let ordered = self
            .transitions
            .windows(2)
            .all(|w| w[1].sequence == w[0].sequence + 1);
        if !ordered {
            return Err(violation("transition sequence has gaps".into()));
        }
        Ok(())
    }

    /// Chronological audit timeline of everything that happened to the incident.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut entries: Vec<TimelineEntry> = Vec::new();
        for obs in &self.observations {
            entries.push(TimelineEntry {
                at: obs.accepted_at,
                event: TimelineEvent::ObservationCorrelated {
                    observation_id: obs.id,
                    indicators: obs.indicators.len(),
                },
            });
        }
        for t in &self.transitions {
            entries.push(TimelineEntry {
                at: t.at,
                event: TimelineEvent::Transition {
                    sequence: t.sequence,
                    from: t.from,
                    to: t.to,
                },
            });
        }
        for r in &self.action_log {
            entries.push(TimelineEntry {
                at: r.recorded_at,
                event: TimelineEvent::Action {
                    kind: r.action.kind.to_string(),
                    status: r.status,
                    attempts: r.attempts,
                },
            });
        }
        // Stable sort keeps observation -> transition -> action order on ties.
        entries.sort_by_key(|e| e.at);
        entries
    }
}

/// One line of an incident's audit timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub event: TimelineEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    ObservationCorrelated {
        observation_id: Uuid,
        indicators: usize,
    },
    Transition {
        sequence: u64,
        from: Option<IncidentState>,
        to: IncidentState,
    },
    Action {
        kind: String,
        status: DeliveryStatus,
        attempts: u32,
    },
}
