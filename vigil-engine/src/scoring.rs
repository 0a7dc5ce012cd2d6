//! Risk scoring: observation -> `RiskScore`.
//!
//! Scorers are pure and deterministic. A statistical model can replace the
//! saturating scorer by implementing [`RiskScorer`]; classification,
//! correlation, and escalation are unaffected.

use std::sync::Arc;

use vigil_core::config::ScoringStrategy;
use vigil_core::{Indicator, InvalidObservationError, Observation, RiskScore};

/// Capability interface for turning an observation into a risk score.
pub trait RiskScorer: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Score one observation. Must not perform I/O.
    fn score(&self, observation: &Observation) -> Result<RiskScore, InvalidObservationError>;
}

/// `value = 1 - exp(-sum(weights))`,
/// `confidence = raw_confidence * (1 - 1 / (1 + distinct_kinds))`.
///
/// Only indicators with a positive weight contribute, to either the value or
/// the count of corroborating kinds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SaturatingScorer;

impl RiskScorer for SaturatingScorer {
    fn name(&self) -> &str {
        "saturating"
    }

    fn score(&self, observation: &Observation) -> Result<RiskScore, InvalidObservationError> {
        let raw = observation.raw_confidence;
        if !raw.is_finite() || !(0.0..=1.0).contains(&raw) {
            return Err(InvalidObservationError::ConfidenceOutOfRange { value: raw });
        }

        let mut contributing: Vec<Indicator> = observation
            .indicators
            .iter()
            .filter(|i| i.weight > 0.0)
            .cloned()
            .collect();
        contributing.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.kind.cmp(&b.kind))
                .then_with(|| a.value.cmp(&b.value))
        });

        let total: f64 = contributing.iter().map(|i| i.weight).sum();
        let mut kinds: Vec<_> = contributing.iter().map(|i| i.kind).collect();
        kinds.sort();
        kinds.dedup();

        Ok(RiskScore {
            value: saturate(total),
            confidence: raw * (1.0 - 1.0 / (1.0 + kinds.len() as f64)),
            contributing_indicators: contributing,
        })
    }
}

/// `1 - exp(-x)`, computed without cancellation for small `x`.
pub fn saturate(total_weight: f64) -> f64 {
    if total_weight <= 0.0 {
        return 0.0;
    }
    (-(-total_weight).exp_m1()).min(1.0)
}

/// The scorer for a configured strategy.
pub fn scorer_for(strategy: ScoringStrategy) -> Arc<dyn RiskScorer> {
    match strategy {
        ScoringStrategy::Saturating => Arc::new(SaturatingScorer),
    }
}
