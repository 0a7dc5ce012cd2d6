//! A shard: the sequential processor for one partition of entity keys.
//!
//! Every operation touching an entity (correlation, transitions, action
//! emission, outcome recording, closing) runs on the shard that owns the
//! entity, one message at a time. Shards share nothing mutable with each
//! other; readers take a read lock on the shard's state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;
use vigil_core::{
    Action, ActionRecord, Clock, CloseReason, EngineError, Incident, Observation,
};

use crate::classifier::classify;
use crate::correlator::{Correlator, IncidentIndex, expired_incidents, quiet_incidents};
use crate::dispatch::ActionDispatcher;
use crate::escalation;
use crate::scoring::RiskScorer;
use crate::store::SnapshotWriter;

/// Work applied in acceptance order. Closing and sweeping travel with
/// observations so they never overtake one accepted before them.
pub(crate) enum Ingest {
    Observation(Box<Observation>),
    Close {
        id: Uuid,
        reason: CloseReason,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Sweep {
        reply: Option<oneshot::Sender<usize>>,
    },
    Barrier(oneshot::Sender<()>),
}

/// Dispatch outcomes. They refer to incidents that already exist, so they
/// may be applied ahead of queued observations.
pub(crate) enum Control {
    Outcome(Box<ActionRecord>),
    Barrier(oneshot::Sender<()>),
}

/// Incidents owned by a shard plus per-incident cancellation for in-flight
/// notifications.
#[derive(Default)]
pub(crate) struct ShardState {
    pub(crate) index: IncidentIndex,
    cancel_tokens: HashMap<Uuid, CancellationToken>,
}

impl ShardState {
    pub(crate) fn token_for(&mut self, id: Uuid) -> CancellationToken {
        self.cancel_tokens.entry(id).or_default().clone()
    }

    fn cancel(&mut self, id: &Uuid) {
        if let Some(token) = self.cancel_tokens.remove(id) {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_tokens(&self) -> usize {
        self.cancel_tokens.len()
    }
}

/// Count of dispatches that have not yet reported a terminal record.
#[derive(Clone)]
pub(crate) struct InFlight {
    tx: Arc<watch::Sender<usize>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    fn begin(&self) -> InFlightGuard {
        self.tx.send_modify(|n| *n += 1);
        InFlightGuard {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        *self.tx.borrow()
    }

    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

struct InFlightGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Spawns dispatch tasks whose records flow back to the owning shard.
#[derive(Clone)]
pub(crate) struct DispatchRunner {
    pub(crate) dispatcher: Arc<ActionDispatcher>,
    pub(crate) tracker: TaskTracker,
    pub(crate) in_flight: InFlight,
}

impl DispatchRunner {
    pub(crate) fn spawn(
        &self,
        action: Action,
        cancel: CancellationToken,
        control: mpsc::UnboundedSender<Control>,
    ) {
        let guard = self.in_flight.begin();
        let dispatcher = self.dispatcher.clone();
        self.tracker.spawn(async move {
            let _guard = guard;
            dispatcher
                .dispatch_with(action, &cancel, |record| {
                    let _ = control.send(Control::Outcome(Box::new(record.clone())));
                })
                .await;
        });
    }
}

/// Everything a shard worker needs besides its own channels.
#[derive(Clone)]
pub(crate) struct ShardContext {
    pub(crate) scorer: Arc<dyn RiskScorer>,
    pub(crate) correlator: Correlator,
    pub(crate) quiet_period: TimeDelta,
    /// `None` keeps closed incidents in memory.
    pub(crate) retain_closed: Option<TimeDelta>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) runner: DispatchRunner,
    pub(crate) writer: Option<SnapshotWriter>,
    pub(crate) shutdown: CancellationToken,
}

/// Engine-side handle to a shard.
pub(crate) struct ShardHandle {
    pub(crate) ingest: mpsc::Sender<Ingest>,
    pub(crate) control: mpsc::UnboundedSender<Control>,
    pub(crate) state: Arc<RwLock<ShardState>>,
}

impl ShardHandle {
    /// Start shard `shard` with an ingest queue of `capacity`.
    pub(crate) fn spawn(shard: usize, capacity: usize, ctx: ShardContext) -> Self {
        let (ingest_tx, ingest_rx) = mpsc::channel(capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ShardState::default()));
        let tracker = ctx.runner.tracker.clone();

        let worker = ShardWorker {
            shard,
            state: state.clone(),
            ingest: ingest_rx,
            control: control_rx,
            control_tx: control_tx.clone(),
            ctx,
        };
        tracker.spawn(worker.run());

        Self {
            ingest: ingest_tx,
            control: control_tx,
            state,
        }
    }

    /// Resolves once everything queued for ingest before the call is processed.
    pub(crate) async fn ingest_barrier(&self) {
        let (done, wait) = oneshot::channel();
        if self.ingest.send(Ingest::Barrier(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Resolves once every control message queued before the call is applied.
    pub(crate) async fn control_barrier(&self) {
        let (done, wait) = oneshot::channel();
        if self.control.send(Control::Barrier(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

struct ShardWorker {
    shard: usize,
    state: Arc<RwLock<ShardState>>,
    ingest: mpsc::Receiver<Ingest>,
    control: mpsc::UnboundedReceiver<Control>,
    control_tx: mpsc::UnboundedSender<Control>,
    ctx: ShardContext,
}

impl ShardWorker {
    async fn run(mut self) {
        tracing::debug!(shard = self.shard, "Shard worker started");
        loop {
            tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => break,
                Some(message) = self.control.recv() => self.handle_control(message).await,
                message = self.ingest.recv() => match message {
                    Some(message) => self.handle_ingest(message).await,
                    None => break,
                },
            }
        }
        tracing::debug!(shard = self.shard, "Shard worker stopped");
    }

    async fn handle_ingest(&self, message: Ingest) {
        match message {
            Ingest::Observation(observation) => self.process(*observation).await,
            Ingest::Close { id, reason, reply } => {
                let now = self.ctx.clock.now();
                let mut state = self.state.write().await;
                let _ = reply.send(self.close_locked(&mut state, id, reason, now));
            }
            Ingest::Sweep { reply } => {
                let closed = self.sweep().await;
                self.evict_expired().await;
                if let Some(reply) = reply {
                    let _ = reply.send(closed);
                }
            }
            Ingest::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_control(&self, message: Control) {
        match message {
            Control::Outcome(record) => {
                let mut state = self.state.write().await;
                match state.index.get_mut(&record.action.incident_id) {
                    Some(incident) => {
                        escalation::record_outcome(incident, *record);
                        self.persist(incident);
                    }
                    None => tracing::warn!(
                        shard = self.shard,
                        incident_id = %record.action.incident_id,
                        "Outcome for unknown incident dropped"
                    ),
                }
            }
            Control::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Score, classify, correlate, and escalate one observation.
    async fn process(&self, observation: Observation) {
        let observation_id = observation.id;
        let accepted_at = observation.accepted_at;

        let score = match self.ctx.scorer.score(&observation) {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(
                    observation_id = %observation_id,
                    scorer = self.ctx.scorer.name(),
                    error = %e,
                    "Scorer rejected observation; dropped"
                );
                return;
            }
        };
        let score = if score.is_well_formed() {
            score
        } else {
            tracing::warn!(
                observation_id = %observation_id,
                scorer = self.ctx.scorer.name(),
                value = score.value,
                confidence = score.confidence,
                "Malformed risk score clamped into [0, 1]"
            );
            score.clamped()
        };
        let level = classify(&score);
        tracing::debug!(
            observation_id = %observation_id,
            entity = %observation.source_entity,
            value = score.value,
            confidence = score.confidence,
            level = %level,
            "Observation classified"
        );

        let mut state = self.state.write().await;
        let correlation = self
            .ctx
            .correlator
            .correlate(&mut state.index, observation, level);
        let cancel = state.token_for(correlation.incident_id);
        let Some(incident) = state.index.get_mut(&correlation.incident_id) else {
            return;
        };

        if let Err(violation) = incident.verify() {
            escalation::mark_corrupted(incident, violation.message);
            self.persist(incident);
            // Out of automated escalation: stop its notifications too.
            state.cancel(&correlation.incident_id);
            return;
        }

        let actions = match escalation::on_observation(
            incident,
            correlation.previous_level,
            observation_id,
            accepted_at,
        ) {
            Ok(actions) => actions,
            Err(e) => {
                tracing::warn!(incident_id = %incident.id, error = %e, "Escalation skipped");
                return;
            }
        };
        self.persist(incident);

        for action in actions {
            self.ctx
                .runner
                .spawn(action, cancel.clone(), self.control_tx.clone());
        }
    }

    /// Close every quiet incident. Returns how many were closed.
    async fn sweep(&self) -> usize {
        let now = self.ctx.clock.now();
        let mut state = self.state.write().await;
        let quiet = quiet_incidents(&state.index, now, self.ctx.quiet_period);
        let mut closed = 0;
        for id in quiet {
            if self
                .close_locked(&mut state, id, CloseReason::QuietPeriod, now)
                .is_ok()
            {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(shard = self.shard, closed, "Closed quiet incidents");
        }
        closed
    }

    fn close_locked(
        &self,
        state: &mut ShardState,
        id: Uuid,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let incident = state
            .index
            .get_mut(&id)
            .ok_or(EngineError::IncidentNotFound { id })?;
        let resolved = escalation::close(incident, reason, now)?;
        self.persist(incident);

        state.index.mark_closed(&id);
        state.cancel(&id);
        self.ctx
            .runner
            .spawn(resolved, CancellationToken::new(), self.control_tx.clone());
        Ok(())
    }

    /// Drop closed incidents past their retention once their snapshots are
    /// written.
    async fn evict_expired(&self) {
        let Some(retention) = self.ctx.retain_closed else {
            return;
        };
        let now = self.ctx.clock.now();
        let expired = expired_incidents(&self.state.read().await.index, now, retention);
        if expired.is_empty() {
            return;
        }
        if let Some(writer) = &self.ctx.writer {
            writer.flush().await;
        }

        let mut state = self.state.write().await;
        for id in &expired {
            state.index.remove(id);
            state.cancel_tokens.remove(id);
        }
        tracing::info!(
            shard = self.shard,
            evicted = expired.len(),
            remaining = state.index.len(),
            "Evicted closed incidents from memory"
        );
    }

    fn persist(&self, incident: &Incident) {
        if let Some(writer) = &self.ctx.writer {
            writer.save(incident);
        }
    }
}
