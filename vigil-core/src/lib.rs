//! # Vigil Core
//!
//! Core library for the Vigil threat engine.
//! Provides the threat vocabulary (levels, indicators, scores), observations,
//! incidents and their action logs, configuration, the error taxonomy, and
//! small runtime utilities (clock, logging, atomic persistence).

pub mod action;
pub mod clock;
pub mod config;
pub mod error;
pub mod incident;
pub mod logging;
pub mod observation;
pub mod persistence;
pub mod threat;

// Re-export commonly used types at the crate root.
pub use action::{
    Action, ActionKind, ActionReason, ActionRecord, DeliveryStatus, DispatchPriority,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, RetryPolicy, ScoringStrategy, load_config};
pub use error::{
    DeliveryError, EngineError, EscalationError, InvalidObservationError, InvariantViolation,
    Result, StoreError, VigilError,
};
pub use incident::{
    CloseReason, Incident, IncidentState, LevelTransition, TimelineEntry, TimelineEvent,
};
pub use observation::{NewObservation, Observation};
pub use threat::{Indicator, IndicatorKind, RiskScore, ThreatLevel};
