//! The threat engine: submission boundary, sharded processing, operator
//! queries, and lifecycle.
//!
//! Observations are validated synchronously, stamped with their acceptance
//! time, and routed by entity key to one of `workers` shards. Each shard
//! processes its queue in acceptance order, so one entity's transitions are
//! never reordered, while different entities proceed in parallel.

mod shard;

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;
use vigil_core::{
    ActionReason, Clock, CloseReason, EngineConfig, EngineError, EscalationError, Incident, Indicator,
    NewObservation, StoreError, SystemClock, ThreatLevel, VigilError,
};

use crate::correlator::{Correlator, secs_to_delta};
use crate::dispatch::{
    ActionDispatcher, ControlPlane, DryRunControlPlane, LoggingNotifier, Notifier, OperatorQueue,
};
use crate::escalation;
use crate::extractor::{IndicatorExtractor, PatternExtractor};
use crate::mitre::{self, IncidentAssessment};
use crate::scoring::{RiskScorer, scorer_for};
use crate::store::{IncidentStore, JsonIncidentStore, SnapshotWriter};
use crate::summary::EngineSummary;

use shard::{DispatchRunner, InFlight, Ingest, ShardContext, ShardHandle};

/// Assembles a [`ThreatEngine`]. Every collaborator has a default.
pub struct ThreatEngineBuilder {
    config: EngineConfig,
    notifier: Option<Arc<dyn Notifier>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    scorer: Option<Arc<dyn RiskScorer>>,
    extractor: Option<Arc<dyn IndicatorExtractor>>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn IncidentStore>>,
}

impl ThreatEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            notifier: None,
            control_plane: None,
            scorer: None,
            extractor: None,
            clock: None,
            store: None,
        }
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Replace the configured scoring strategy with a custom scorer.
    pub fn scorer(mut self, scorer: Arc<dyn RiskScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn IndicatorExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist snapshots here. Without this, a JSON store under
    /// `persistence.dir` is used when `persistence.enabled` is set.
    pub fn store(mut self, store: Arc<dyn IncidentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Start the engine. Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<ThreatEngine, VigilError> {
        let config = self.config;
        for warning in config.validate() {
            tracing::warn!("Engine configuration: {warning}");
        }

        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None => Arc::new(
                PatternExtractor::new(&config.scoring)
                    .map_err(|e| VigilError::Config(format!("invalid extractor pattern: {e}")))?,
            ),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LoggingNotifier));
        let control_plane = self
            .control_plane
            .unwrap_or_else(|| Arc::new(DryRunControlPlane));
        let scorer = self
            .scorer
            .unwrap_or_else(|| scorer_for(config.scoring.strategy));
        let store = self.store.or_else(|| {
            config.persistence.enabled.then(|| {
                Arc::new(JsonIncidentStore::new(config.persistence.dir.clone()))
                    as Arc<dyn IncidentStore>
            })
        });

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let operator_queue = Arc::new(OperatorQueue::new());
        let dispatcher = Arc::new(ActionDispatcher::new(
            config.dispatch.clone(),
            notifier,
            control_plane,
            operator_queue.clone(),
            clock.clone(),
        ));
        let in_flight = InFlight::new();
        let runner = DispatchRunner {
            dispatcher,
            tracker: tracker.clone(),
            in_flight: in_flight.clone(),
        };
        let writer = store
            .clone()
            .map(|store| SnapshotWriter::spawn(store, &tracker, shutdown.clone()));
        let retain_closed = (config.correlation.retain_closed_secs > 0)
            .then(|| secs_to_delta(config.correlation.retain_closed_secs));

        let ctx = ShardContext {
            scorer,
            correlator: Correlator::from_config(&config.correlation),
            quiet_period: secs_to_delta(config.correlation.quiet_period_secs),
            retain_closed,
            clock: clock.clone(),
            runner: runner.clone(),
            writer: writer.clone(),
            shutdown: shutdown.clone(),
        };
        let workers = config.workers.max(1);
        let shards: Vec<ShardHandle> = (0..workers)
            .map(|i| ShardHandle::spawn(i, config.queue_capacity, ctx.clone()))
            .collect();

        if config.correlation.sweep_interval_secs > 0 {
            spawn_sweeper(
                &tracker,
                shutdown.clone(),
                shards.iter().map(|s| s.ingest.clone()).collect(),
                Duration::from_secs(config.correlation.sweep_interval_secs),
            );
        }

        tracing::info!(
            workers,
            queue_capacity = config.queue_capacity,
            window_secs = config.correlation.window_secs,
            quiet_period_secs = config.correlation.quiet_period_secs,
            retain_closed_secs = config.correlation.retain_closed_secs,
            persistence = writer.is_some(),
            "Threat engine started"
        );

        Ok(ThreatEngine {
            config,
            shards,
            extractor,
            clock,
            operator_queue,
            in_flight,
            runner,
            store,
            writer,
            tracker,
            shutdown,
        })
    }
}

/// Turns observations into incidents and escalation actions.
pub struct ThreatEngine {
    config: EngineConfig,
    shards: Vec<ShardHandle>,
    extractor: Arc<dyn IndicatorExtractor>,
    clock: Arc<dyn Clock>,
    operator_queue: Arc<OperatorQueue>,
    in_flight: InFlight,
    runner: DispatchRunner,
    store: Option<Arc<dyn IncidentStore>>,
    writer: Option<SnapshotWriter>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ThreatEngine {
    pub fn builder(config: EngineConfig) -> ThreatEngineBuilder {
        ThreatEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and enqueue an observation. Returns its id once accepted.
    ///
    /// Malformed input is rejected synchronously. When the owning shard's
    /// queue is full this waits for room.
    pub async fn submit_observation(
        &self,
        source_entity: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
        indicators: Vec<Indicator>,
        raw_confidence: f64,
    ) -> Result<Uuid, EngineError> {
        self.submit(NewObservation {
            source_entity: source_entity.into(),
            timestamp,
            indicators,
            raw_confidence,
        })
        .await
    }

    pub async fn submit(&self, observation: NewObservation) -> Result<Uuid, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let observation = observation.validate(self.clock.now())?;
        let id = observation.id;
        let shard = &self.shards[self.route(&observation.source_entity)];
        tracing::debug!(
            observation_id = %id,
            entity = %observation.source_entity,
            indicators = observation.indicators.len(),
            "Observation accepted"
        );
        shard
            .ingest
            .send(Ingest::Observation(Box::new(observation)))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        Ok(id)
    }

    /// Extract indicators from a free-text report, then submit.
    pub async fn submit_text(
        &self,
        source_entity: impl Into<String>,
        timestamp: DateTime<Utc>,
        text: &str,
        tags: &[String],
        raw_confidence: f64,
    ) -> Result<Uuid, EngineError> {
        let indicators = self.extractor.extract(text, tags);
        self.submit(
            NewObservation::new(source_entity, timestamp)
                .with_indicators(indicators)
                .with_confidence(raw_confidence),
        )
        .await
    }

    /// Look up an incident by id. Closed incidents already evicted from
    /// memory are read back from the store.
    pub async fn get_incident(&self, id: Uuid) -> Option<Incident> {
        for shard in &self.shards {
            if let Some(incident) = shard.state.read().await.index.get(&id) {
                return Some(incident.clone());
            }
        }
        self.load_evicted(id).await
    }

    /// ATT&CK techniques and recommended response for an incident.
    pub async fn assess_incident(&self, id: Uuid) -> Option<IncidentAssessment> {
        self.get_incident(id).await.map(|incident| mitre::assess(&incident))
    }

    /// Feed known-bad IP addresses to the extractor. Reports submitted as
    /// text afterwards score those addresses at full reputation weight.
    /// Returns how many addresses were new.
    pub fn update_reputation(&self, ips: &[String]) -> usize {
        let added = self.extractor.update_reputation(ips);
        tracing::info!(received = ips.len(), added, "Threat intelligence updated");
        added
    }

    /// Open incidents at or above `min_level`, most severe first.
    pub async fn list_open_incidents(&self, min_level: ThreatLevel) -> Vec<Incident> {
        let mut open = Vec::new();
        for shard in &self.shards {
            let state = shard.state.read().await;
            open.extend(
                state
                    .index
                    .incidents()
                    .filter(|i| i.is_open() && i.current_level >= min_level)
                    .cloned(),
            );
        }
        open.sort_by(|a, b| {
            b.current_level
                .cmp(&a.current_level)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        open
    }

    /// Operator close. Emits only the audit "resolved" alert and cancels the
    /// incident's in-flight notifications.
    ///
    /// The close is queued behind every observation already accepted for the
    /// entity, so those observations land in the incident being closed.
    pub async fn close_incident(
        &self,
        id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), EngineError> {
        let reason = CloseReason::Operator {
            reason: reason.into(),
        };
        let Some(shard) = self.owner_of(id).await else {
            return match self.load_evicted(id).await {
                Some(_) => Err(EscalationError::AlreadyClosed { incident_id: id }.into()),
                None => Err(EngineError::IncidentNotFound { id }),
            };
        };
        let (reply, response) = oneshot::channel();
        shard
            .ingest
            .send(Ingest::Close { id, reason, reply })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        response.await.map_err(|_| EngineError::ShuttingDown)?
    }

    /// Close every incident that has been quiet for the configured period,
    /// then drop closed incidents past their retention from memory.
    /// Returns how many were closed.
    pub async fn sweep_quiet_incidents(&self) -> usize {
        let mut closed = 0;
        for shard in &self.shards {
            let (reply, response) = oneshot::channel();
            if shard
                .ingest
                .send(Ingest::Sweep { reply: Some(reply) })
                .await
                .is_ok()
            {
                closed += response.await.unwrap_or(0);
            }
        }
        closed
    }

    /// Undeliverable actions waiting for an operator.
    pub fn operator_queue(&self) -> &Arc<OperatorQueue> {
        &self.operator_queue
    }

    /// Aggregate figures over every incident, computed now.
    pub async fn summary(&self) -> EngineSummary {
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            guards.push(shard.state.read().await);
        }
        EngineSummary::from_incidents(guards.iter().flat_map(|state| state.index.incidents()))
    }

    /// Incidents flagged corrupted or holding undeliverable actions.
    pub async fn needs_attention(&self) -> Vec<Incident> {
        let mut flagged = Vec::new();
        for shard in &self.shards {
            let state = shard.state.read().await;
            flagged.extend(
                state
                    .index
                    .incidents()
                    .filter(|i| i.needs_attention())
                    .cloned(),
            );
        }
        flagged.sort_by_key(|i| i.first_seen);
        flagged
    }

    /// Load incidents from `store`, re-verifying each one.
    ///
    /// Incidents that fail verification are flagged corrupted. Actions whose
    /// latest record is not terminal are dispatched again under their
    /// original idempotency key. Returns how many incidents were added.
    pub async fn restore(&self, store: &dyn IncidentStore) -> Result<usize, StoreError> {
        let mut restored = 0;
        for mut incident in store.load_all()? {
            if incident.corrupted.is_none()
                && let Err(violation) = incident.verify()
            {
                escalation::mark_corrupted(&mut incident, violation.message);
            }

            let shard = &self.shards[self.route(&incident.entity_key)];
            let mut state = shard.state.write().await;
            if state.index.contains(&incident.id) {
                continue;
            }

            let escalating = incident.is_open() && !incident.is_corrupted();
            let unfinished: Vec<_> = if incident.is_corrupted() {
                Vec::new()
            } else {
                incident
                    .latest_action_records()
                    .into_iter()
                    .filter(|r| !r.status.is_terminal())
                    .map(|r| r.action.clone())
                    .collect()
            };
            let incident_token = escalating.then(|| state.token_for(incident.id));
            state.index.insert(incident);
            restored += 1;

            for action in unfinished {
                let cancel = match (&incident_token, action.reason) {
                    (_, ActionReason::Resolved) => CancellationToken::new(),
                    (Some(token), ActionReason::LevelEntry) => token.clone(),
                    // Level-entry notifications for an incident closed meanwhile.
                    (None, ActionReason::LevelEntry) => {
                        let token = CancellationToken::new();
                        token.cancel();
                        token
                    }
                };
                self.runner.spawn(action, cancel, shard.control.clone());
            }
        }
        tracing::info!(restored, "Restored incidents from store");
        Ok(restored)
    }

    /// Wait until every accepted observation is processed, every dispatch has
    /// recorded its outcome, and pending snapshots are written.
    pub async fn idle(&self) {
        loop {
            join_all(self.shards.iter().map(|s| s.ingest_barrier())).await;
            self.in_flight.wait_idle().await;
            join_all(self.shards.iter().map(|s| s.control_barrier())).await;
            if self.in_flight.count() == 0 || self.shutdown.is_cancelled() {
                break;
            }
        }
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// Drain, then stop the sweeper, the shards, and the snapshot writer.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.idle().await;
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Threat engine stopped");
    }

    async fn owner_of(&self, id: Uuid) -> Option<&ShardHandle> {
        for shard in &self.shards {
            if shard.state.read().await.index.contains(&id) {
                return Some(shard);
            }
        }
        None
    }

    /// Read an incident back from the store once pending snapshots are written.
    async fn load_evicted(&self, id: Uuid) -> Option<Incident> {
        let store = self.store.as_ref()?;
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
        match store.load(&id) {
            Ok(incident) => incident,
            Err(e) => {
                tracing::warn!(incident_id = %id, error = %e, "Failed to load incident from store");
                None
            }
        }
    }

    fn route(&self, entity_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        entity_key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

impl Drop for ThreatEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_sweeper(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    shards: Vec<mpsc::Sender<Ingest>>,
    every: Duration,
) {
    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for shard in &shards {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = shard.send(Ingest::Sweep { reply: None }) => {}
                        }
                    }
                }
            }
        }
    });
}
