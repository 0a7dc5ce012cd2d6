//! Durable incident storage.
//!
//! One JSON document per incident holds everything needed to rebuild its
//! escalation timeline: observations, level transitions, and the action log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;
use vigil_core::persistence::{atomic_write_json, json_documents, load_json};
use vigil_core::{Incident, StoreError};

/// Where incident snapshots are kept.
pub trait IncidentStore: Send + Sync {
    /// Replace the stored snapshot of `incident`.
    fn save(&self, incident: &Incident) -> Result<(), StoreError>;

    /// The stored snapshot of one incident, if any.
    fn load(&self, id: &Uuid) -> Result<Option<Incident>, StoreError>;

    /// Every stored incident.
    fn load_all(&self) -> Result<Vec<Incident>, StoreError>;
}

/// `<dir>/<incident id>.json`, written atomically.
#[derive(Debug, Clone)]
pub struct JsonIncidentStore {
    dir: PathBuf,
}

impl JsonIncidentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

impl IncidentStore for JsonIncidentStore {
    fn save(&self, incident: &Incident) -> Result<(), StoreError> {
        atomic_write_json(&self.path_for(&incident.id), incident).map_err(|source| {
            StoreError::Write {
                id: incident.id,
                source,
            }
        })
    }

    fn load(&self, id: &Uuid) -> Result<Option<Incident>, StoreError> {
        let path = self.path_for(id);
        load_json(&path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })
    }

    fn load_all(&self) -> Result<Vec<Incident>, StoreError> {
        let read_err = |path: &Path, source| StoreError::Read {
            path: path.display().to_string(),
            source,
        };
        let mut incidents = Vec::new();
        for path in json_documents(&self.dir).map_err(|e| read_err(&self.dir, e))? {
            if let Some(incident) = load_json::<Incident>(&path).map_err(|e| read_err(&path, e))? {
                incidents.push(incident);
            }
        }
        Ok(incidents)
    }
}

/// Keeps snapshots in memory. Useful for tests and ephemeral deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryIncidentStore {
    incidents: Arc<Mutex<HashMap<Uuid, Incident>>>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Uuid) -> Option<Incident> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Incident>> {
        self.incidents.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl IncidentStore for MemoryIncidentStore {
    fn save(&self, incident: &Incident) -> Result<(), StoreError> {
        self.lock().insert(incident.id, incident.clone());
        Ok(())
    }

    fn load(&self, id: &Uuid) -> Result<Option<Incident>, StoreError> {
        Ok(self.get(id))
    }

    fn load_all(&self) -> Result<Vec<Incident>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }
}

enum WriterMessage {
    Save(Box<Incident>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the single task that writes snapshots in submission order.
#[derive(Clone)]
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl SnapshotWriter {
    /// Spawn the writer. It drains everything queued before exiting on
    /// `shutdown`.
    pub fn spawn(
        store: Arc<dyn IncidentStore>,
        tracker: &TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracker.spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    message = rx.recv() => message,
                    _ = shutdown.cancelled() => None,
                };
                match message {
                    Some(WriterMessage::Save(incident)) => {
                        if let Err(e) = store.save(&incident) {
                            tracing::error!(incident_id = %incident.id, error = %e, "Failed to persist incident snapshot");
                        }
                    }
                    Some(WriterMessage::Flush(done)) => {
                        let _ = done.send(());
                    }
                    None => break,
                }
            }
        });
        Self { tx }
    }

    pub fn save(&self, incident: &Incident) {
        if self
            .tx
            .send(WriterMessage::Save(Box::new(incident.clone())))
            .is_err()
        {
            tracing::warn!(incident_id = %incident.id, "Snapshot writer stopped; snapshot dropped");
        }
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}
