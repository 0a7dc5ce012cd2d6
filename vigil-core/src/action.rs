//! Escalation actions and their delivery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::threat::ThreatLevel;

/// Automated response kinds, least to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Monitor,
    Alert,
    Block,
    Isolate,
    Quarantine,
    EmergencyShutdown,
}

impl ActionKind {
    /// Containment actions go to the network control plane; the rest are
    /// notifications.
    pub fn is_containment(&self) -> bool {
        matches!(
            self,
            ActionKind::Block
                | ActionKind::Isolate
                | ActionKind::Quarantine
                | ActionKind::EmergencyShutdown
        )
    }

    /// Only notification kinds may be cancelled once issued.
    pub fn is_cancellable(&self) -> bool {
        !self.is_containment()
    }

    pub fn priority(&self) -> DispatchPriority {
        match self {
            ActionKind::Quarantine | ActionKind::EmergencyShutdown => DispatchPriority::Urgent,
            _ => DispatchPriority::Normal,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Monitor => write!(f, "MONITOR"),
            ActionKind::Alert => write!(f, "ALERT"),
            ActionKind::Block => write!(f, "BLOCK"),
            ActionKind::Isolate => write!(f, "ISOLATE"),
            ActionKind::Quarantine => write!(f, "QUARANTINE"),
            ActionKind::EmergencyShutdown => write!(f, "EMERGENCY_SHUTDOWN"),
        }
    }
}

/// Dispatch lane for an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPriority {
    Normal,
    Urgent,
}

/// Why an action was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionReason {
    /// The incident entered a level.
    LevelEntry,
    /// The incident was closed; audit notice only.
    Resolved,
}

/// A dispatch request. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub reason: ActionReason,
    pub incident_id: Uuid,
    pub entity_key: String,
    /// Level the incident was in when the action was issued.
    pub level: ThreatLevel,
    /// Transition that produced this action.
    pub transition_sequence: u64,
    pub issued_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl Action {
    pub fn new(
        kind: ActionKind,
        reason: ActionReason,
        incident_id: Uuid,
        entity_key: &str,
        level: ThreatLevel,
        transition_sequence: u64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            reason,
            incident_id,
            entity_key: entity_key.to_string(),
            level,
            transition_sequence,
            issued_at,
            idempotency_key: idempotency_key(incident_id, kind, transition_sequence),
        }
    }
}

/// `hash(incident_id, kind, transition_sequence)` as lowercase hex SHA-256.
pub fn idempotency_key(incident_id: Uuid, kind: ActionKind, transition_sequence: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(incident_id.as_bytes());
    hasher.update(kind.to_string().as_bytes());
    hasher.update(transition_sequence.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

/// Delivery status of an action at the time a record was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Issued, not yet attempted.
    Pending,
    /// An attempt failed; the dispatcher will retry.
    Failed,
    Delivered,
    /// Retries exhausted or permanently rejected. Needs an operator.
    Undeliverable,
    /// Withdrawn because the incident closed first.
    Cancelled,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Delivered | DeliveryStatus::Undeliverable | DeliveryStatus::Cancelled
        )
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Undeliverable => write!(f, "undeliverable"),
            DeliveryStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An append-only entry in an incident's action log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    pub status: DeliveryStatus,
    /// Attempts made so far (0 for `Pending`).
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActionRecord {
    pub fn pending(action: Action) -> Self {
        let recorded_at = action.issued_at;
        Self {
            action,
            status: DeliveryStatus::Pending,
            attempts: 0,
            recorded_at,
            detail: None,
        }
    }

    pub fn with_status(
        action: &Action,
        status: DeliveryStatus,
        attempts: u32,
        detail: Option<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            action: action.clone(),
            status,
            attempts,
            recorded_at,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containment_kinds() {
        assert!(!ActionKind::Monitor.is_containment());
        assert!(!ActionKind::Alert.is_containment());
        assert!(ActionKind::Block.is_containment());
        assert!(ActionKind::EmergencyShutdown.is_containment());
        assert!(ActionKind::Alert.is_cancellable());
        assert!(!ActionKind::Quarantine.is_cancellable());
    }

    #[test]
    fn test_priority_lanes() {
        assert_eq!(ActionKind::Quarantine.priority(), DispatchPriority::Urgent);
        assert_eq!(
            ActionKind::EmergencyShutdown.priority(),
            DispatchPriority::Urgent
        );
        assert_eq!(ActionKind::Block.priority(), DispatchPriority::Normal);
        assert_eq!(ActionKind::Alert.priority(), DispatchPriority::Normal);
    }

    #[test]
    fn test_idempotency_key_is_stable_and_distinct() {
        let id = Uuid::new_v4();
        let a = idempotency_key(id, ActionKind::Alert, 1);
        assert_eq!(a, idempotency_key(id, ActionKind::Alert, 1));
        assert_ne!(a, idempotency_key(id, ActionKind::Alert, 2));
        assert_ne!(a, idempotency_key(id, ActionKind::Block, 1));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_action_kind_serde_matches_display() {
        let json = serde_json::to_string(&ActionKind::EmergencyShutdown).unwrap();
        assert_eq!(json, "\"EMERGENCY_SHUTDOWN\"");
        assert_eq!(ActionKind::EmergencyShutdown.to_string(), "EMERGENCY_SHUTDOWN");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Undeliverable.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
    }
}
