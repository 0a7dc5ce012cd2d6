//! Threat classification: `(value, confidence)` -> `ThreatLevel`.

use vigil_core::{RiskScore, ThreatLevel};

/// Floating-point slack applied to every threshold comparison so that inputs
/// computed to land exactly on a boundary resolve to the higher level.
pub const BOUNDARY_EPSILON: f64 = 1e-9;

/// Ordered thresholds, highest level first. Both the value and the confidence
/// threshold must be met.
pub const THRESHOLDS: [(f64, f64, ThreatLevel); 4] = [
    (0.95, 0.6, ThreatLevel::Catastrophic),
    (0.85, 0.5, ThreatLevel::Critical),
    (0.70, 0.4, ThreatLevel::High),
    (0.50, 0.3, ThreatLevel::Medium),
];

/// Total, pure classification. Malformed scores are the caller's problem:
/// NaN never meets a threshold and falls through to `Low`.
pub fn classify(score: &RiskScore) -> ThreatLevel {
    classify_parts(score.value, score.confidence)
}

pub fn classify_parts(value: f64, confidence: f64) -> ThreatLevel {
    THRESHOLDS
        .iter()
        .find(|(min_value, min_confidence, _)| {
            value + BOUNDARY_EPSILON >= *min_value
                && confidence + BOUNDARY_EPSILON >= *min_confidence
        })
        .map(|(_, _, level)| *level)
        .unwrap_or(ThreatLevel::Low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_resolve_upward() {
        assert_eq!(classify_parts(0.95, 0.6), ThreatLevel::Catastrophic);
        assert_eq!(classify_parts(0.85, 0.5), ThreatLevel::Critical);
        assert_eq!(classify_parts(0.70, 0.4), ThreatLevel::High);
        assert_eq!(classify_parts(0.50, 0.3), ThreatLevel::Medium);
        assert_eq!(classify_parts(0.0, 0.0), ThreatLevel::Low);
    }

    #[test]
    fn test_computed_boundary_confidence() {
        // 0.9 * (1 - 1/3) is not exactly 0.6 in binary floating point.
        let confidence = 0.9 * (1.0 - 1.0 / 3.0);
        assert_eq!(classify_parts(0.951, confidence), ThreatLevel::Catastrophic);
    }

    #[test]
    fn test_low_confidence_falls_through() {
        assert_eq!(classify_parts(0.99, 0.45), ThreatLevel::High);
        assert_eq!(classify_parts(0.99, 0.2), ThreatLevel::Low);
        assert_eq!(classify_parts(0.6, 1.0), ThreatLevel::Medium);
    }

    #[test]
    fn test_just_below_boundary() {
        assert_eq!(classify_parts(0.949, 0.9), ThreatLevel::Critical);
        assert_eq!(classify_parts(0.4999, 0.9), ThreatLevel::Low);
    }

    #[test]
    fn test_nan_is_low() {
        assert_eq!(classify_parts(f64::NAN, 1.0), ThreatLevel::Low);
        assert_eq!(classify_parts(1.0, f64::NAN), ThreatLevel::Low);
    }
}
