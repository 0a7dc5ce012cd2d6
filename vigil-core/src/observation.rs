//! Observations, the immutable unit of input to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::InvalidObservationError;
use crate::threat::{Indicator, IndicatorKind, in_unit_range};

/// An observation as submitted by an indicator extractor, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewObservation {
    pub source_entity: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub indicators: Vec<Indicator>,
    pub raw_confidence: f64,
}

impl NewObservation {
    pub fn new(source_entity: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            source_entity: source_entity.into(),
            timestamp: Some(timestamp),
            indicators: Vec::new(),
            raw_confidence: 1.0,
        }
    }

    pub fn with_indicator(mut self, indicator: Indicator) -> Self {
        self.indicators.push(indicator);
        self
    }

    pub fn with_indicators(mut self, indicators: impl IntoIterator<Item = Indicator>) -> Self {
        self.indicators.extend(indicators);
        self
    }

    pub fn with_confidence(mut self, raw_confidence: f64) -> Self {
        self.raw_confidence = raw_confidence;
        self
    }

    /// Validate and seal into an [`Observation`] accepted at `accepted_at`.
    ///
    /// Indicators form a set keyed by `(kind, value)`; duplicates keep the
    /// heaviest weight.
    pub fn validate(self, accepted_at: DateTime<Utc>) -> Result<Observation, InvalidObservationError> {
        let source_entity = self.source_entity.trim().to_string();
        if source_entity.is_empty() {
            return Err(InvalidObservationError::EmptySourceEntity);
        }
        let timestamp = self
            .timestamp
            .ok_or(InvalidObservationError::MissingTimestamp)?;
        if !in_unit_range(self.raw_confidence) {
            return Err(InvalidObservationError::ConfidenceOutOfRange {
                value: self.raw_confidence,
            });
        }

        let mut unique: BTreeMap<(IndicatorKind, String), f64> = BTreeMap::new();
        for indicator in self.indicators {
            if !indicator.weight.is_finite() || indicator.weight < 0.0 {
                return Err(InvalidObservationError::InvalidWeight {
                    kind: indicator.kind,
                    value: indicator.value,
                    weight: indicator.weight,
                });
            }
            let slot = unique
                .entry((indicator.kind, indicator.value))
                .or_insert(indicator.weight);
            *slot = slot.max(indicator.weight);
        }

        Ok(Observation {
            id: Uuid::new_v4(),
            source_entity,
            timestamp,
            accepted_at,
            indicators: unique
                .into_iter()
                .map(|((kind, value), weight)| Indicator {
                    kind,
                    value,
                    weight,
                })
                .collect(),
            raw_confidence: self.raw_confidence,
        })
    }
}

/// One validated security signal. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub source_entity: String,
    /// When the event happened, as reported by the extractor.
    pub timestamp: DateTime<Utc>,
    /// When the engine accepted it. Defines processing order.
    pub accepted_at: DateTime<Utc>,
    pub indicators: Vec<Indicator>,
    pub raw_confidence: f64,
}

impl Observation {
    /// Number of distinct indicator kinds present.
    pub fn distinct_kinds(&self) -> usize {
        let mut kinds: Vec<IndicatorKind> = self.indicators.iter().map(|i| i.kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds.len()
    }

    /// Sum of indicator weights.
    pub fn total_weight(&self) -> f64 {
        self.indicators.iter().map(|i| i.weight).sum()
    }
}
