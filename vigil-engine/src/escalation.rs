//! Escalation state machine.
//!
//! Owns incident lifecycle transitions and maps each level entry to its
//! actions. Transitions are committed regardless of later delivery outcomes;
//! delivery results are appended to the action log as they arrive.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use vigil_core::{
    Action, ActionKind, ActionReason, ActionRecord, CloseReason, EscalationError, Incident,
    IncidentState, LevelTransition, ThreatLevel,
};

/// Actions emitted on entry into each level, in dispatch order.
pub fn actions_for_level(level: ThreatLevel) -> &'static [ActionKind] {
    match level {
        ThreatLevel::Low => &[ActionKind::Monitor],
        ThreatLevel::Medium => &[ActionKind::Alert],
        ThreatLevel::High => &[ActionKind::Alert, ActionKind::Block],
        ThreatLevel::Critical => &[ActionKind::Isolate, ActionKind::Alert],
        ThreatLevel::Catastrophic => &[
            ActionKind::Quarantine,
            ActionKind::EmergencyShutdown,
            ActionKind::Alert,
        ],
    }
}

/// Apply the transition rule after the correlator has updated the incident.
///
/// `previous_level` is `None` for a freshly opened incident, which always
/// records its initial entry. Otherwise a transition happens only when the
/// level changed. Returns the level-entry actions, already logged as pending.
pub fn on_observation(
    incident: &mut Incident,
    previous_level: Option<ThreatLevel>,
    observation_id: Uuid,
    at: DateTime<Utc>,
) -> Result<Vec<Action>, EscalationError> {
    guard_automated(incident)?;

    let from = match previous_level {
        None => None,
        Some(previous) if previous == incident.current_level => return Ok(Vec::new()),
        Some(previous) => Some(IncidentState::Open(previous)),
    };
    let level = incident.current_level;
    let sequence = commit(incident, from, IncidentState::Open(level), at, Some(observation_id));

    tracing::info!(
        incident_id = %incident.id,
        entity = %incident.entity_key,
        from = ?previous_level,
        to = %level,
        sequence,
        "Incident level transition"
    );

    let actions: Vec<Action> = actions_for_level(level)
        .iter()
        .map(|kind| {
            Action::new(
                *kind,
                ActionReason::LevelEntry,
                incident.id,
                &incident.entity_key,
                level,
                sequence,
                at,
            )
        })
        .collect();
    incident
        .action_log
        .extend(actions.iter().cloned().map(ActionRecord::pending));
    Ok(actions)
}

/// Close an open incident. Emits only the audit "resolved" alert.
///
/// Corrupted incidents can still be closed; that is how an operator takes
/// them off the board.
pub fn close(
    incident: &mut Incident,
    reason: CloseReason,
    at: DateTime<Utc>,
) -> Result<Action, EscalationError> {
    let IncidentState::Open(level) = incident.state else {
        return Err(EscalationError::AlreadyClosed {
            incident_id: incident.id,
        });
    };
    let sequence = commit(
        incident,
        Some(IncidentState::Open(level)),
        IncidentState::Closed,
        at,
        None,
    );

    tracing::info!(
        incident_id = %incident.id,
        entity = %incident.entity_key,
        level = %level,
        reason = %reason,
        "Incident closed"
    );
    incident.close_reason = Some(reason);

    let action = Action::new(
        ActionKind::Alert,
        ActionReason::Resolved,
        incident.id,
        &incident.entity_key,
        level,
        sequence,
        at,
    );
    incident.action_log.push(ActionRecord::pending(action.clone()));
    Ok(action)
}

/// Append a delivery outcome to the incident's action log.
pub fn record_outcome(incident: &mut Incident, record: ActionRecord) {
    tracing::debug!(
        incident_id = %incident.id,
        action = %record.action.kind,
        status = %record.status,
        attempts = record.attempts,
        "Action outcome recorded"
    );
    incident.action_log.push(record);
}

/// Flag an incident as corrupted, removing it from automated escalation.
pub fn mark_corrupted(incident: &mut Incident, reason: String) {
    tracing::error!(
        incident_id = %incident.id,
        entity = %incident.entity_key,
        reason = %reason,
        "Incident invariant violated; removed from automated escalation"
    );
    incident.corrupted = Some(reason);
}

fn guard_automated(incident: &Incident) -> Result<(), EscalationError> {
    if let Some(reason) = &incident.corrupted {
        return Err(EscalationError::Corrupted {
            incident_id: incident.id,
            reason: reason.clone(),
        });
    }
    if !incident.is_open() {
        return Err(EscalationError::AlreadyClosed {
            incident_id: incident.id,
        });
    }
    Ok(())
}

fn commit(
    incident: &mut Incident,
    from: Option<IncidentState>,
    to: IncidentState,
    at: DateTime<Utc>,
    observation_id: Option<Uuid>,
) -> u64 {
    let sequence = incident.transition_sequence() + 1;
    incident.transitions.push(LevelTransition {
        sequence,
        from,
        to,
        at,
        observation_id,
    });
    incident.state = to;
    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vigil_core::NewObservation;

    fn incident_at(level: ThreatLevel) -> Incident {
        let now = Utc::now();
        let obs = NewObservation::new("10.1.1.1", now).validate(now).unwrap();
        Incident::open(obs, level)
    }

    fn kinds(actions: &[Action]) -> Vec<ActionKind> {
        actions.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_initial_entry_emits_level_actions() {
        let mut incident = incident_at(ThreatLevel::Catastrophic);
        let obs_id = incident.observations[0].id;
        let first_seen = incident.first_seen;
        let actions = on_observation(&mut incident, None, obs_id, first_seen).unwrap();

        assert_eq!(
            kinds(&actions),
            vec![
                ActionKind::Quarantine,
                ActionKind::EmergencyShutdown,
                ActionKind::Alert
            ]
        );
        assert_eq!(incident.transitions.len(), 1);
        assert_eq!(incident.transitions[0].from, None);
        assert_eq!(incident.action_log.len(), 3);
        assert!(actions.iter().all(|a| a.transition_sequence == 1));
    }

    #[test]
    fn test_same_level_emits_nothing() {
        let mut incident = incident_at(ThreatLevel::High);
        let id = incident.observations[0].id;
        on_observation(&mut incident, None, id, Utc::now()).unwrap();

        let actions =
            on_observation(&mut incident, Some(ThreatLevel::High), id, Utc::now()).unwrap();
        assert!(actions.is_empty());
        assert_eq!(incident.transitions.len(), 1);
    }

    #[test]
    fn test_deescalation_emits_entry_action_for_new_level() {
        let mut incident = incident_at(ThreatLevel::High);
        let id = incident.observations[0].id;
        on_observation(&mut incident, None, id, Utc::now()).unwrap();

        incident.current_level = ThreatLevel::Medium;
        incident.state = IncidentState::Open(ThreatLevel::High);
        let actions =
            on_observation(&mut incident, Some(ThreatLevel::High), id, Utc::now()).unwrap();
        assert_eq!(kinds(&actions), vec![ActionKind::Alert]);
        assert_eq!(incident.state, IncidentState::Open(ThreatLevel::Medium));
        assert_eq!(actions[0].transition_sequence, 2);
    }

    #[test]
    fn test_reentry_produces_distinct_keys() {
        let mut incident = incident_at(ThreatLevel::Low);
        let id = incident.observations[0].id;
        let first = on_observation(&mut incident, None, id, Utc::now()).unwrap();

        incident.current_level = ThreatLevel::High;
        on_observation(&mut incident, Some(ThreatLevel::Low), id, Utc::now()).unwrap();
        incident.current_level = ThreatLevel::Low;
        let again =
            on_observation(&mut incident, Some(ThreatLevel::High), id, Utc::now()).unwrap();

        assert_eq!(kinds(&again), vec![ActionKind::Monitor]);
        assert_ne!(first[0].idempotency_key, again[0].idempotency_key);
    }

    #[test]
    fn test_close_emits_resolved_alert_once() {
        let mut incident = incident_at(ThreatLevel::Critical);
        let id = incident.observations[0].id;
        on_observation(&mut incident, None, id, Utc::now()).unwrap();

        let later = Utc::now() + Duration::minutes(5);
        let action = close(&mut incident, CloseReason::QuietPeriod, later).unwrap();
        assert_eq!(action.kind, ActionKind::Alert);
        assert_eq!(action.reason, ActionReason::Resolved);
        assert_eq!(incident.state, IncidentState::Closed);
        assert_eq!(incident.close_reason, Some(CloseReason::QuietPeriod));

        let err = close(&mut incident, CloseReason::QuietPeriod, later).unwrap_err();
        assert!(matches!(err, EscalationError::AlreadyClosed { .. }));
    }

    #[test]
    fn test_closed_incident_rejects_observations() {
        let mut incident = incident_at(ThreatLevel::Low);
        let id = incident.observations[0].id;
        close(&mut incident, CloseReason::QuietPeriod, Utc::now()).unwrap();
        let err = on_observation(&mut incident, Some(ThreatLevel::Low), id, Utc::now());
        assert!(matches!(err, Err(EscalationError::AlreadyClosed { .. })));
    }

    #[test]
    fn test_corrupted_incident_rejects_automation_but_can_close() {
        let mut incident = incident_at(ThreatLevel::Medium);
        let id = incident.observations[0].id;
        mark_corrupted(&mut incident, "peak below current".into());

        let err = on_observation(&mut incident, None, id, Utc::now()).unwrap_err();
        assert!(matches!(err, EscalationError::Corrupted { .. }));
        assert!(
            close(
                &mut incident,
                CloseReason::Operator {
                    reason: "manual review".into()
                },
                Utc::now()
            )
            .is_ok()
        );
    }
}
