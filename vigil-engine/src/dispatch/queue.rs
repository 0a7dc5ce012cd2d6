//! Operator-visible queue of actions that could not be delivered.

use std::collections::VecDeque;
use std::sync::Mutex;

use vigil_core::ActionRecord;

/// Undeliverable action records waiting for a human.
///
/// Records stay here until an operator drains them; nothing is evicted.
#[derive(Debug, Default)]
pub struct OperatorQueue {
    records: Mutex<VecDeque<ActionRecord>>,
}

impl OperatorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: ActionRecord) {
        tracing::error!(
            incident_id = %record.action.incident_id,
            action = %record.action.kind,
            level = %record.action.level,
            attempts = record.attempts,
            detail = record.detail.as_deref().unwrap_or(""),
            "Action undeliverable; queued for operator"
        );
        self.lock().push_back(record);
    }

    /// Snapshot of everything queued, oldest first.
    pub fn pending(&self) -> Vec<ActionRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain(&self) -> Vec<ActionRecord> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ActionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}
