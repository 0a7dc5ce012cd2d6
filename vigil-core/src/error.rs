//! Error types for the Vigil threat engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering input validation, escalation, delivery, storage, and the engine
//! runtime.

use uuid::Uuid;

use crate::threat::IndicatorKind;

/// Top-level error type for the Vigil libraries.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    #[error("Invalid observation: {0}")]
    InvalidObservation(#[from] InvalidObservationError),

    #[error("Escalation error: {0}")]
    Escalation(#[from] EscalationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A malformed observation, rejected synchronously at the engine boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidObservationError {
    #[error("observation has no timestamp")]
    MissingTimestamp,

    #[error("raw confidence {value} is outside [0, 1]")]
    ConfidenceOutOfRange { value: f64 },

    #[error("source entity is empty")]
    EmptySourceEntity,

    #[error("indicator '{value}' ({kind}) has invalid weight {weight}")]
    InvalidWeight {
        kind: IndicatorKind,
        value: String,
        weight: f64,
    },
}

/// Errors from the escalation state machine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EscalationError {
    #[error("incident {incident_id} is already closed")]
    AlreadyClosed { incident_id: Uuid },

    #[error("incident {incident_id} is corrupted and excluded from automated escalation: {reason}")]
    Corrupted { incident_id: Uuid, reason: String },
}

/// An incident whose recorded state contradicts the engine's invariants.
///
/// Fatal to that incident's processing path only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invariant violated on incident {incident_id}: {message}")]
pub struct InvariantViolation {
    pub incident_id: Uuid,
    pub message: String,
}

/// Errors from delivering an action to an external collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("collaborator did not acknowledge delivery")]
    MissingAck,

    #[error("rejected by collaborator: {reason}")]
    Rejected { reason: String },
}

impl DeliveryError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryError::Timeout { .. }
                | DeliveryError::Transport { .. }
                | DeliveryError::MissingAck
        )
    }
}

/// Errors from the engine runtime and operator interface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("incident not found: {id}")]
    IncidentNotFound { id: Uuid },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    InvalidObservation(#[from] InvalidObservationError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),
}

/// Errors from durable incident storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write incident {id}: {source}")]
    Write {
        id: Uuid,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read incident record '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience alias used across the Vigil crates.
pub type Result<T> = std::result::Result<T, VigilError>;
