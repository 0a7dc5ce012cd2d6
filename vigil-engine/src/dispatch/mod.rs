//! Action dispatch: at-least-once delivery with retry, idempotency, and an
//! operator queue for anything that cannot be delivered.
//!
//! Two lanes:
//! - **urgent** (QUARANTINE, EMERGENCY_SHUTDOWN): bypasses the concurrency
//!   limit and retries harder on a shorter backoff.
//! - **normal** (everything else): bounded by `max_concurrent`.
//!
//! Only MONITOR and ALERT honour cancellation. Containment actions always run
//! to a terminal status.

pub mod queue;
pub mod retry;
pub mod targets;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use vigil_core::config::DispatchConfig;
use vigil_core::{
    Action, ActionRecord, Clock, DeliveryError, DeliveryStatus, DispatchPriority, RetryPolicy,
};

pub use queue::OperatorQueue;
pub use targets::{
    ContainmentOutcome, ControlPlane, DeliveryAck, DryRunControlPlane, LoggingNotifier,
    NotificationRequest, NotificationTone, Notifier,
};

/// Delivers actions to the notifier or the control plane.
pub struct ActionDispatcher {
    notifier: Arc<dyn Notifier>,
    control_plane: Arc<dyn ControlPlane>,
    config: DispatchConfig,
    normal_lane: Semaphore,
    delivered: Mutex<LruCache<String, ActionRecord>>,
    operator_queue: Arc<OperatorQueue>,
    clock: Arc<dyn Clock>,
}

impl ActionDispatcher {
    pub fn new(
        config: DispatchConfig,
        notifier: Arc<dyn Notifier>,
        control_plane: Arc<dyn ControlPlane>,
        operator_queue: Arc<OperatorQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache_size =
            NonZeroUsize::new(config.idempotency_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            notifier,
            control_plane,
            normal_lane: Semaphore::new(config.max_concurrent.max(1)),
            delivered: Mutex::new(LruCache::new(cache_size)),
            operator_queue,
            clock,
            config,
        }
    }

    pub fn operator_queue(&self) -> &Arc<OperatorQueue> {
        &self.operator_queue
    }

    /// Deliver `action` and return its terminal record.
    pub async fn dispatch(&self, action: Action, cancel: &CancellationToken) -> ActionRecord {
        self.dispatch_with(action, cancel, |_| {}).await
    }

    /// Deliver `action`, reporting every record (each failed attempt and the
    /// terminal one) to `on_record` as it happens.
    pub async fn dispatch_with<F>(
        &self,
        action: Action,
        cancel: &CancellationToken,
        mut on_record: F,
    ) -> ActionRecord
    where
        F: FnMut(&ActionRecord) + Send,
    {
        if let Some(cached) = self.cached(&action.idempotency_key) {
            tracing::debug!(
                incident_id = %action.incident_id,
                action = %action.kind,
                "Action already delivered; reusing recorded outcome"
            );
            on_record(&cached);
            return cached;
        }

        let cancellable = action.kind.is_cancellable();
        let priority = action.kind.priority();
        let policy = self.policy_for(priority).clone();
        let max_attempts = policy.max_attempts.max(1);
        let timeout_ms = self.config.attempt_timeout_ms;

        let _permit = match priority {
            DispatchPriority::Urgent => None,
            DispatchPriority::Normal if cancellable => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self.finish(&action, DeliveryStatus::Cancelled, 0, Some("incident closed before dispatch".into()), &mut on_record);
                    }
                    permit = self.normal_lane.acquire() => permit.ok(),
                }
            }
            DispatchPriority::Normal => self.normal_lane.acquire().await.ok(),
        };

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let attempt = tokio::time::timeout(Duration::from_millis(timeout_ms), self.deliver(&action));
            let outcome = if cancellable {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = attempt => Some(result),
                }
            } else {
                Some(attempt.await)
            };

            let result = match outcome {
                None => {
                    return self.finish(
                        &action,
                        DeliveryStatus::Cancelled,
                        attempts,
                        Some("incident closed during delivery".into()),
                        &mut on_record,
                    );
                }
                Some(Ok(result)) => result,
                Some(Err(_)) => Err(DeliveryError::Timeout { timeout_ms }),
            };

            let error = match result {
                Ok(()) => {
                    let record =
                        self.finish(&action, DeliveryStatus::Delivered, attempts, None, &mut on_record);
                    self.lock_cache()
                        .put(action.idempotency_key.clone(), record.clone());
                    return record;
                }
                Err(e) => e,
            };

            if !error.is_transient() || attempts >= max_attempts {
                let record = self.finish(
                    &action,
                    DeliveryStatus::Undeliverable,
                    attempts,
                    Some(error.to_string()),
                    &mut on_record,
                );
                self.operator_queue.push(record.clone());
                return record;
            }

            let delay = retry::backoff_delay(&policy, attempts - 1);
            tracing::warn!(
                incident_id = %action.incident_id,
                action = %action.kind,
                attempt = attempts,
                max = max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying action after transient delivery failure"
            );
            let failed = ActionRecord::with_status(
                &action,
                DeliveryStatus::Failed,
                attempts,
                Some(error.to_string()),
                self.clock.now(),
            );
            on_record(&failed);

            if cancellable {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self.finish(&action, DeliveryStatus::Cancelled, attempts, Some("incident closed during retry backoff".into()), &mut on_record);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn deliver(&self, action: &Action) -> Result<(), DeliveryError> {
        if action.kind.is_containment() {
            match self
                .control_plane
                .apply_containment(&action.entity_key, action.kind)
                .await?
            {
                ContainmentOutcome::Applied => Ok(()),
                ContainmentOutcome::Rejected { reason } => Err(DeliveryError::Rejected { reason }),
            }
        } else {
            let ack = self
                .notifier
                .notify(&NotificationRequest::from_action(action))
                .await?;
            if ack.acknowledged {
                Ok(())
            } else {
                Err(DeliveryError::MissingAck)
            }
        }
    }

    fn finish<F>(
        &self,
        action: &Action,
        status: DeliveryStatus,
        attempts: u32,
        detail: Option<String>,
        on_record: &mut F,
    ) -> ActionRecord
    where
        F: FnMut(&ActionRecord),
    {
        let record = ActionRecord::with_status(action, status, attempts, detail, self.clock.now());
        on_record(&record);
        record
    }

    fn policy_for(&self, priority: DispatchPriority) -> &RetryPolicy {
        match priority {
            DispatchPriority::Urgent => &self.config.urgent,
            DispatchPriority::Normal => &self.config.normal,
        }
    }

    fn cached(&self, key: &str) -> Option<ActionRecord> {
        self.lock_cache().get(key).cloned()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, ActionRecord>> {
        self.delivered.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;
    use vigil_core::{ActionKind, ActionReason, SystemClock, ThreatLevel};

    /// Fails the first `failures` calls with a transport error.
    #[derive(Default)]
    struct FlakyNotifier {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, _: &NotificationRequest) -> Result<DeliveryAck, DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(DeliveryError::Transport {
                    message: "connection reset".into(),
                })
            } else {
                Ok(DeliveryAck::ok())
            }
        }
    }

    /// Never answers within the attempt timeout.
    struct HangingControlPlane;

    #[async_trait]
    impl ControlPlane for HangingControlPlane {
        async fn apply_containment(
            &self,
            _: &str,
            _: ActionKind,
        ) -> Result<ContainmentOutcome, DeliveryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ContainmentOutcome::Applied)
        }
    }

    struct RejectingControlPlane;

    #[async_trait]
    impl ControlPlane for RejectingControlPlane {
        async fn apply_containment(
            &self,
            _: &str,
            _: ActionKind,
        ) -> Result<ContainmentOutcome, DeliveryError> {
            Ok(ContainmentOutcome::Rejected {
                reason: "entity not managed".into(),
            })
        }
    }

    fn dispatcher(notifier: Arc<dyn Notifier>, control_plane: Arc<dyn ControlPlane>) -> ActionDispatcher {
        ActionDispatcher::new(
            DispatchConfig::default(),
            notifier,
            control_plane,
            Arc::new(OperatorQueue::new()),
            Arc::new(SystemClock),
        )
    }

    fn action(kind: ActionKind) -> Action {
        Action::new(
            kind,
            ActionReason::LevelEntry,
            Uuid::new_v4(),
            "203.0.113.9",
            ThreatLevel::High,
            1,
            Utc::now(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_first_try() {
        let d = dispatcher(Arc::new(FlakyNotifier::default()), Arc::new(DryRunControlPlane));
        let mut seen = Vec::new();
        let record = d
            .dispatch_with(action(ActionKind::Alert), &CancellationToken::new(), |r| {
                seen.push(r.status)
            })
            .await;
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
        assert_eq!(seen, vec![DeliveryStatus::Delivered]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let notifier = Arc::new(FlakyNotifier {
            failures: 2,
            ..Default::default()
        });
        let d = dispatcher(notifier.clone(), Arc::new(DryRunControlPlane));
        let mut seen = Vec::new();
        let record = d
            .dispatch_with(action(ActionKind::Monitor), &CancellationToken::new(), |r| {
                seen.push(r.status)
            })
            .await;
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 3);
        assert_eq!(
            seen,
            vec![
                DeliveryStatus::Failed,
                DeliveryStatus::Failed,
                DeliveryStatus::Delivered
            ]
        );
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_exhaust_budget() {
        let d = dispatcher(Arc::new(FlakyNotifier::default()), Arc::new(HangingControlPlane));
        let record = d
            .dispatch(action(ActionKind::Block), &CancellationToken::new())
            .await;
        assert_eq!(record.status, DeliveryStatus::Undeliverable);
        assert_eq!(record.attempts, 3);
        assert!(record.detail.as_deref().unwrap_or("").contains("timed out"));
        assert_eq!(d.operator_queue().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_urgent_lane_uses_urgent_budget() {
        let d = dispatcher(Arc::new(FlakyNotifier::default()), Arc::new(HangingControlPlane));
        let record = d
            .dispatch(action(ActionKind::EmergencyShutdown), &CancellationToken::new())
            .await;
        assert_eq!(record.status, DeliveryStatus::Undeliverable);
        assert_eq!(record.attempts, RetryPolicy::urgent().max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let d = dispatcher(Arc::new(FlakyNotifier::default()), Arc::new(RejectingControlPlane));
        let record = d
            .dispatch(action(ActionKind::Isolate), &CancellationToken::new())
            .await;
        assert_eq!(record.status, DeliveryStatus::Undeliverable);
        assert_eq!(record.attempts, 1);
        assert!(record.detail.as_deref().unwrap_or("").contains("entity not managed"));
        assert_eq!(d.operator_queue().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redispatch_reuses_delivered_outcome() {
        let notifier = Arc::new(FlakyNotifier::default());
        let d = dispatcher(notifier.clone(), Arc::new(DryRunControlPlane));
        let a = action(ActionKind::Alert);

        let first = d.dispatch(a.clone(), &CancellationToken::new()).await;
        let second = d.dispatch(a, &CancellationToken::new()).await;
        assert_eq!(first, second);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_only_for_notifications() {
        let notifier = Arc::new(FlakyNotifier::default());
        let d = dispatcher(notifier.clone(), Arc::new(DryRunControlPlane));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let alert = d.dispatch(action(ActionKind::Alert), &cancel).await;
        assert_eq!(alert.status, DeliveryStatus::Cancelled);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 0);

        let block = d.dispatch(action(ActionKind::Block), &cancel).await;
        assert_eq!(block.status, DeliveryStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_counts_as_failure() {
        struct SilentNotifier;

        #[async_trait]
        impl Notifier for SilentNotifier {
            async fn notify(&self, _: &NotificationRequest) -> Result<DeliveryAck, DeliveryError> {
                Ok(DeliveryAck::missing())
            }
        }

        let d = dispatcher(Arc::new(SilentNotifier), Arc::new(DryRunControlPlane));
        let record = d
            .dispatch(action(ActionKind::Alert), &CancellationToken::new())
            .await;
        assert_eq!(record.status, DeliveryStatus::Undeliverable);
        assert_eq!(record.attempts, 3);
    }
}
