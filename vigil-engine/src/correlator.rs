//! Incident correlation: groups observations for the same entity into one
//! incident while they keep arriving within a sliding window.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;
use vigil_core::config::CorrelationConfig;
use vigil_core::{Incident, Observation, ThreatLevel};

/// Incidents owned by one shard, indexed by id and by open entity key.
#[derive(Debug, Default)]
pub struct IncidentIndex {
    incidents: HashMap<Uuid, Incident>,
    open_by_entity: HashMap<String, Vec<Uuid>>,
}

impl IncidentIndex {
    pub fn get(&self, id: &Uuid) -> Option<&Incident> {
        self.incidents.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Incident> {
        self.incidents.get_mut(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.incidents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn incidents(&self) -> impl Iterator<Item = &Incident> {
        self.incidents.values()
    }

    /// Open incidents for `entity_key`, oldest first.
    pub fn open_for(&self, entity_key: &str) -> Vec<&Incident> {
        self.open_by_entity
            .get(entity_key)
            .map(|ids| ids.iter().filter_map(|id| self.incidents.get(id)).collect())
            .unwrap_or_default()
    }

    /// Add an incident, indexing it by entity if it is open.
    pub fn insert(&mut self, incident: Incident) {
        if incident.is_open() {
            self.open_by_entity
                .entry(incident.entity_key.clone())
                .or_default()
                .push(incident.id);
        }
        self.incidents.insert(incident.id, incident);
    }

    /// Drop a closed incident from the open index. The incident itself stays
    /// queryable.
    pub fn mark_closed(&mut self, id: &Uuid) {
        let Some(entity_key) = self.incidents.get(id).map(|i| i.entity_key.clone()) else {
            return;
        };
        if let Some(ids) = self.open_by_entity.get_mut(&entity_key) {
            ids.retain(|open| open != id);
            if ids.is_empty() {
                self.open_by_entity.remove(&entity_key);
            }
        }
    }

    /// Drop an incident from memory entirely.
    pub fn remove(&mut self, id: &Uuid) -> Option<Incident> {
        self.mark_closed(id);
        self.incidents.remove(id)
    }
}

/// Outcome of correlating one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub incident_id: Uuid,
    pub is_new: bool,
    /// Level before this observation; `None` for a new incident.
    pub previous_level: Option<ThreatLevel>,
}

#[derive(Debug, Clone, Copy)]
pub struct Correlator {
    window: TimeDelta,
}

impl Correlator {
    pub fn new(window: TimeDelta) -> Self {
        Self { window }
    }

    pub fn from_config(config: &CorrelationConfig) -> Self {
        Self::new(secs_to_delta(config.window_secs))
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Attach `observation` to the matching open incident, or open a new one.
    ///
    /// Matching uses the observation's acceptance time: an open, uncorrupted
    /// incident for the same entity matches when
    /// `accepted_at - last_seen <= window`. Each match slides the window
    /// forward.
    pub fn correlate(
        &self,
        index: &mut IncidentIndex,
        observation: Observation,
        level: ThreatLevel,
    ) -> Correlation {
        let now = observation.accepted_at;
        let open = index.open_for(&observation.source_entity);
        let matched = open
            .iter()
            .filter(|i| !i.is_corrupted() && now - i.last_seen <= self.window)
            .max_by_key(|i| i.last_seen)
            .map(|i| i.id);
        let stale = open.len();

        if let Some(id) = matched
            && let Some(incident) = index.get_mut(&id)
        {
            let previous = incident.current_level;
            incident.observations.push(observation);
            incident.current_level = level;
            incident.peak_level = incident.peak_level.max(level);
            incident.last_seen = incident.last_seen.max(now);
            return Correlation {
                incident_id: id,
                is_new: false,
                previous_level: Some(previous),
            };
        }

        if stale > 0 {
            tracing::warn!(
                entity = %observation.source_entity,
                stale_open = stale,
                "Entity key collision: opening a new incident while older ones remain open"
            );
        }

        let incident = Incident::open(observation, level);
        let id = incident.id;
        index.insert(incident);
        Correlation {
            incident_id: id,
            is_new: true,
            previous_level: None,
        }
    }
}

/// Open, uncorrupted incidents that have been quiet for at least `quiet_period`.
pub fn quiet_incidents(index: &IncidentIndex, now: DateTime<Utc>, quiet_period: TimeDelta) -> Vec<Uuid> {
    let mut quiet: Vec<&Incident> = index
        .incidents()
        .filter(|i| i.is_open() && !i.is_corrupted() && now - i.last_seen >= quiet_period)
        .collect();
    quiet.sort_by_key(|i| i.last_seen);
    quiet.into_iter().map(|i| i.id).collect()
}

/// Closed incidents that can leave memory. All actions must have finished and
/// the incident must have been closed for at least `retention`. Incidents that
/// need operator attention stay.
pub fn expired_incidents(index: &IncidentIndex, now: DateTime<Utc>, retention: TimeDelta) -> Vec<Uuid> {
    index
        .incidents()
        .filter(|i| !i.needs_attention())
        .filter(|i| i.closed_at().is_some_and(|closed| now - closed >= retention))
        .filter(|i| {
            i.latest_action_records()
                .iter()
                .all(|r| r.status.is_terminal())
        })
        .map(|i| i.id)
        .collect()
}

/// Seconds from configuration as a `TimeDelta`, saturating on overflow.
pub fn secs_to_delta(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
