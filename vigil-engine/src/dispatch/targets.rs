//! External delivery targets: the notification system and the network
//! control plane.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_core::{Action, ActionKind, ActionReason, DeliveryError, ThreatLevel};

/// How a notification should sound to the human receiving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationTone {
    Calm,
    Concerned,
    Urgent,
}

impl NotificationTone {
    pub fn for_level(level: ThreatLevel) -> Self {
        match level {
            ThreatLevel::Critical | ThreatLevel::Catastrophic => NotificationTone::Urgent,
            ThreatLevel::High | ThreatLevel::Medium => NotificationTone::Concerned,
            ThreatLevel::Low => NotificationTone::Calm,
        }
    }
}

/// Payload handed to the notification/voice system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub incident_id: Uuid,
    pub entity_key: String,
    pub level: ThreatLevel,
    pub action_kind: ActionKind,
    pub summary_text: String,
    pub tone: NotificationTone,
    pub idempotency_key: String,
}

impl NotificationRequest {
    pub fn from_action(action: &Action) -> Self {
        let (summary_text, tone) = match action.reason {
            ActionReason::Resolved => (
                format!(
                    "Incident {} for {} resolved (last level {})",
                    action.incident_id, action.entity_key, action.level
                ),
                NotificationTone::Calm,
            ),
            ActionReason::LevelEntry => (
                format!(
                    "{} threat on {}: {} (incident {})",
                    action.level.to_string().to_uppercase(),
                    action.entity_key,
                    action.kind,
                    action.incident_id
                ),
                NotificationTone::for_level(action.level),
            ),
        };
        Self {
            incident_id: action.incident_id,
            entity_key: action.entity_key.clone(),
            level: action.level,
            action_kind: action.kind,
            summary_text,
            tone,
            idempotency_key: action.idempotency_key.clone(),
        }
    }
}

/// Acknowledgement returned by the notification system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl DeliveryAck {
    pub fn ok() -> Self {
        Self {
            acknowledged: true,
            reference: None,
        }
    }

    pub fn missing() -> Self {
        Self {
            acknowledged: false,
            reference: None,
        }
    }
}

/// Result of a containment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ContainmentOutcome {
    Applied,
    Rejected { reason: String },
}

/// Notification/voice system. Receives MONITOR and ALERT actions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> Result<DeliveryAck, DeliveryError>;
}

/// Network control plane. Receives BLOCK, ISOLATE, QUARANTINE, and
/// EMERGENCY_SHUTDOWN actions.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn apply_containment(
        &self,
        entity_key: &str,
        kind: ActionKind,
    ) -> Result<ContainmentOutcome, DeliveryError>;
}

/// Writes notifications to the log and acknowledges them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, request: &NotificationRequest) -> Result<DeliveryAck, DeliveryError> {
        match request.tone {
            NotificationTone::Urgent => tracing::error!(
                incident_id = %request.incident_id,
                action = %request.action_kind,
                "{}",
                request.summary_text
            ),
            NotificationTone::Concerned => tracing::warn!(
                incident_id = %request.incident_id,
                action = %request.action_kind,
                "{}",
                request.summary_text
            ),
            NotificationTone::Calm => tracing::info!(
                incident_id = %request.incident_id,
                action = %request.action_kind,
                "{}",
                request.summary_text
            ),
        }
        Ok(DeliveryAck::ok())
    }
}

/// Logs what would be contained and reports it applied. Nothing is touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunControlPlane;

#[async_trait]
impl ControlPlane for DryRunControlPlane {
    async fn apply_containment(
        &self,
        entity_key: &str,
        kind: ActionKind,
    ) -> Result<ContainmentOutcome, DeliveryError> {
        tracing::warn!(entity = %entity_key, action = %kind, "[dry-run] containment requested");
        Ok(ContainmentOutcome::Applied)
    }
}
