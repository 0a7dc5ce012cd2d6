//! Read-only aggregate projection over incidents, computed on demand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vigil_core::{Incident, ThreatLevel};

/// Operator dashboard figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSummary {
    pub total_incidents: usize,
    pub open_incidents: usize,
    pub closed_incidents: usize,
    /// Open incidents by current level.
    pub open_by_level: BTreeMap<ThreatLevel, usize>,
    /// All incidents by peak level.
    pub peak_by_level: BTreeMap<ThreatLevel, usize>,
    pub corrupted_incidents: usize,
    /// Actions whose latest record is undeliverable.
    pub undeliverable_actions: usize,
    pub total_observations: usize,
    pub last_update: Option<DateTime<Utc>>,
}

impl EngineSummary {
    pub fn from_incidents<'a>(incidents: impl IntoIterator<Item = &'a Incident>) -> Self {
        let mut summary = Self::default();
        for incident in incidents {
            summary.total_incidents += 1;
            if incident.is_open() {
                summary.open_incidents += 1;
                *summary.open_by_level.entry(incident.current_level).or_default() += 1;
            } else {
                summary.closed_incidents += 1;
            }
            *summary.peak_by_level.entry(incident.peak_level).or_default() += 1;
            if incident.is_corrupted() {
                summary.corrupted_incidents += 1;
            }
            summary.undeliverable_actions += incident.undeliverable_actions().len();
            summary.total_observations += incident.observations.len();

            let updated = incident
                .transitions
                .last()
                .map(|t| t.at.max(incident.last_seen))
                .unwrap_or(incident.last_seen);
            summary.last_update = summary.last_update.max(Some(updated));
        }
        summary
    }

    /// Open incidents at or above `level`.
    pub fn open_at_least(&self, level: ThreatLevel) -> usize {
        self.open_by_level
            .range(level..)
            .map(|(_, count)| count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{IncidentState, NewObservation};

    fn incident(entity: &str, current: ThreatLevel, peak: ThreatLevel) -> Incident {
        let now = Utc::now();
        let obs = NewObservation::new(entity, now).validate(now).unwrap();
        let mut incident = Incident::open(obs, current);
        incident.peak_level = peak;
        incident
    }

    #[test]
    fn test_counts_by_level() {
        let a = incident("a", ThreatLevel::Medium, ThreatLevel::Critical);
        let b = incident("b", ThreatLevel::Critical, ThreatLevel::Critical);
        let mut c = incident("c", ThreatLevel::Low, ThreatLevel::High);
        c.state = IncidentState::Closed;
        let mut d = incident("d", ThreatLevel::Low, ThreatLevel::Low);
        d.corrupted = Some("bad".into());

        let summary = EngineSummary::from_incidents([&a, &b, &c, &d]);
        assert_eq!(summary.total_incidents, 4);
        assert_eq!(summary.open_incidents, 3);
        assert_eq!(summary.closed_incidents, 1);
        assert_eq!(summary.open_by_level.get(&ThreatLevel::Medium), Some(&1));
        assert_eq!(summary.peak_by_level.get(&ThreatLevel::Critical), Some(&2));
        assert_eq!(summary.corrupted_incidents, 1);
        assert_eq!(summary.total_observations, 4);
        assert_eq!(summary.open_at_least(ThreatLevel::Medium), 2);
        assert!(summary.last_update.is_some());
    }

    #[test]
    fn test_empty_summary() {
        let summary = EngineSummary::from_incidents(std::iter::empty());
        assert_eq!(summary, EngineSummary::default());
        assert_eq!(summary.open_at_least(ThreatLevel::Low), 0);
    }
}
