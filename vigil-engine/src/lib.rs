//! # Vigil Engine
//!
//! Turns a stream of security observations into risk scores, threat levels,
//! correlated incidents, and escalation actions with an auditable history.
//!
//! Pipeline: extractor -> [`scoring`] -> [`classifier`] -> [`correlator`] ->
//! [`escalation`] -> [`dispatch`]. [`ThreatEngine`] wires the stages together
//! on a set of per-entity shards.

pub mod classifier;
pub mod correlator;
pub mod dispatch;
pub mod engine;
pub mod escalation;
pub mod extractor;
pub mod mitre;
pub mod scoring;
pub mod store;
pub mod summary;

pub use classifier::classify;
pub use dispatch::{
    ActionDispatcher, ContainmentOutcome, ControlPlane, DeliveryAck, DryRunControlPlane,
    LoggingNotifier, NotificationRequest, NotificationTone, Notifier, OperatorQueue,
};
pub use engine::{ThreatEngine, ThreatEngineBuilder};
pub use extractor::{IndicatorExtractor, PatternExtractor};
pub use mitre::IncidentAssessment;
pub use scoring::{RiskScorer, SaturatingScorer};
pub use store::{IncidentStore, JsonIncidentStore, MemoryIncidentStore};
pub use summary::EngineSummary;
