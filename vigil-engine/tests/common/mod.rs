//! Shared doubles and helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use vigil_core::{
    ActionKind, DeliveryError, DeliveryStatus, EngineConfig, Incident, ManualClock,
};
use vigil_engine::{
    ContainmentOutcome, ControlPlane, DeliveryAck, NotificationRequest, NotificationTone,
    Notifier, ThreatEngine,
};

/// Fixed start time so runs are reproducible.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap()
}

/// Small, fast configuration: no background sweeper, short backoff.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers = 4;
    config.queue_capacity = 64;
    config.correlation.window_secs = 900;
    config.correlation.quiet_period_secs = 3600;
    config.correlation.sweep_interval_secs = 0;
    config.dispatch.attempt_timeout_ms = 1_000;
    config.dispatch.normal.initial_backoff_ms = 10;
    config.dispatch.normal.max_backoff_ms = 50;
    config.dispatch.urgent.initial_backoff_ms = 5;
    config.dispatch.urgent.max_backoff_ms = 20;
    config
}

/// How a scripted collaborator answers.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    /// Transport failure for the first `n` calls, then success.
    FailFirst(u32),
    /// Never answers.
    Hang,
    /// Explicit rejection (control plane only).
    Reject(String),
    /// Answers after a delay.
    Slow(Duration),
}

/// Records every notification and answers per `behavior`.
/// Calm notifications (resolution notices) always succeed.
pub struct RecordingNotifier {
    behavior: Behavior,
    requests: Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotifier {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<NotificationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.requests().iter().map(|r| r.action_kind).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, request: &NotificationRequest) -> Result<DeliveryAck, DeliveryError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() as u32
        };
        if request.tone == NotificationTone::Calm
            && !matches!(request.action_kind, ActionKind::Monitor)
        {
            return Ok(DeliveryAck::ok());
        }
        answer(&self.behavior, call).await.map(|_| DeliveryAck::ok())
    }
}

/// Records every containment request and answers per `behavior`.
pub struct ScriptedControlPlane {
    behavior: Behavior,
    calls: Mutex<Vec<(String, ActionKind)>>,
}

impl ScriptedControlPlane {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, ActionKind)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.calls().into_iter().map(|(_, kind)| kind).collect()
    }
}

#[async_trait]
impl ControlPlane for ScriptedControlPlane {
    async fn apply_containment(
        &self,
        entity_key: &str,
        kind: ActionKind,
    ) -> Result<ContainmentOutcome, DeliveryError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((entity_key.to_string(), kind));
            calls.len() as u32
        };
        match &self.behavior {
            Behavior::Reject(reason) => Ok(ContainmentOutcome::Rejected {
                reason: reason.clone(),
            }),
            other => answer(other, call).await.map(|_| ContainmentOutcome::Applied),
        }
    }
}

async fn answer(behavior: &Behavior, call: u32) -> Result<(), DeliveryError> {
    match behavior {
        Behavior::Succeed | Behavior::Reject(_) => Ok(()),
        Behavior::FailFirst(n) if call <= *n => Err(DeliveryError::Transport {
            message: format!("scripted failure {call}"),
        }),
        Behavior::FailFirst(_) => Ok(()),
        Behavior::Hang => {
            std::future::pending::<()>().await;
            Ok(())
        }
        Behavior::Slow(delay) => {
            tokio::time::sleep(*delay).await;
            Ok(())
        }
    }
}

pub struct Harness {
    pub engine: ThreatEngine,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub control_plane: Arc<ScriptedControlPlane>,
}

pub fn harness(config: EngineConfig, notify: Behavior, contain: Behavior) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let notifier = RecordingNotifier::new(notify);
    let control_plane = ScriptedControlPlane::new(contain);
    let engine = ThreatEngine::builder(config)
        .clock(clock.clone())
        .notifier(notifier.clone())
        .control_plane(control_plane.clone())
        .build()
        .unwrap();
    Harness {
        engine,
        clock,
        notifier,
        control_plane,
    }
}

/// Kinds of the actions issued on the incident, in issue order.
pub fn issued_kinds(incident: &Incident) -> Vec<ActionKind> {
    incident
        .action_log
        .iter()
        .filter(|r| r.status == DeliveryStatus::Pending)
        .map(|r| r.action.kind)
        .collect()
}

/// Latest status per issued action, in issue order.
pub fn latest_statuses(incident: &Incident) -> Vec<(ActionKind, DeliveryStatus)> {
    incident
        .latest_action_records()
        .into_iter()
        .map(|r| (r.action.kind, r.status))
        .collect()
}
