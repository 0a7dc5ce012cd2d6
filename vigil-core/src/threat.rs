//! Threat vocabulary: severity levels, indicators, and risk scores.

use serde::{Deserialize, Serialize};

/// Ordered severity classification of an observation or incident.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
    Catastrophic,
}

impl ThreatLevel {
    /// All levels, lowest first.
    pub const ALL: [ThreatLevel; 5] = [
        ThreatLevel::Low,
        ThreatLevel::Medium,
        ThreatLevel::High,
        ThreatLevel::Critical,
        ThreatLevel::Catastrophic,
    ];

    /// Whether operators must be paged immediately at this level.
    pub fn is_severe(&self) -> bool {
        *self >= ThreatLevel::Critical
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreatLevel::Low => write!(f, "low"),
            ThreatLevel::Medium => write!(f, "medium"),
            ThreatLevel::High => write!(f, "high"),
            ThreatLevel::Critical => write!(f, "critical"),
            ThreatLevel::Catastrophic => write!(f, "catastrophic"),
        }
    }
}

/// The family an indicator was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Keyword,
    IpReputation,
    Pattern,
    BehavioralAnomaly,
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicatorKind::Keyword => write!(f, "keyword"),
            IndicatorKind::IpReputation => write!(f, "ip-reputation"),
            IndicatorKind::Pattern => write!(f, "pattern"),
            IndicatorKind::BehavioralAnomaly => write!(f, "behavioral-anomaly"),
        }
    }
}

/// A typed, weighted signal fragment.
///
/// Weights come from static configuration; the engine never learns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub kind: IndicatorKind,
    pub value: String,
    pub weight: f64,
}

impl Indicator {
    pub fn new(kind: IndicatorKind, value: impl Into<String>, weight: f64) -> Self {
        Self {
            kind,
            value: value.into(),
            weight,
        }
    }

    pub fn keyword(value: impl Into<String>, weight: f64) -> Self {
        Self::new(IndicatorKind::Keyword, value, weight)
    }

    pub fn ip_reputation(value: impl Into<String>, weight: f64) -> Self {
        Self::new(IndicatorKind::IpReputation, value, weight)
    }

    pub fn pattern(value: impl Into<String>, weight: f64) -> Self {
        Self::new(IndicatorKind::Pattern, value, weight)
    }

    pub fn behavioral_anomaly(value: impl Into<String>, weight: f64) -> Self {
        Self::new(IndicatorKind::BehavioralAnomaly, value, weight)
    }
}

/// Risk derived from one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Saturated weight sum in [0, 1].
    pub value: f64,
    /// Corroboration-adjusted confidence in [0, 1].
    pub confidence: f64,
    /// Indicators that contributed, heaviest first.
    pub contributing_indicators: Vec<Indicator>,
}

impl RiskScore {
    /// A score with nothing contributing.
    pub fn zero() -> Self {
        Self {
            value: 0.0,
            confidence: 0.0,
            contributing_indicators: Vec::new(),
        }
    }

    /// Whether both components are finite and within [0, 1].
    pub fn is_well_formed(&self) -> bool {
        in_unit_range(self.value) && in_unit_range(self.confidence)
    }

    /// Copy with both components forced into [0, 1]. NaN becomes 0.
    pub fn clamped(&self) -> Self {
        Self {
            value: clamp_unit(self.value),
            confidence: clamp_unit(self.confidence),
            contributing_indicators: self.contributing_indicators.clone(),
        }
    }
}

pub(crate) fn in_unit_range(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}
