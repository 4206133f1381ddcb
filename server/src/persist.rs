use std::sync::Arc;

use speed_trap_engine::emitter::{EventSink, OverspeedEvent, SinkError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::{EvidenceDb, EvidenceRecord, NewEvidence};
use crate::storage::{ImageStore, StorageError};

/// Where a persisted event ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedReference {
    pub id: i64,
    pub image_key: String,
}

/// Image storage plus the SQLite index, kept consistent with each other.
pub struct EvidenceStore {
    db: Arc<EvidenceDb>,
    images: ImageStore,
    prefix: String,
}

impl EvidenceStore {
    pub fn new(db: EvidenceDb, images: ImageStore, prefix: impl Into<String>) -> Self {
        Self {
            db: Arc::new(db),
            images,
            prefix: prefix.into(),
        }
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Upload the image, then index it. If indexing fails the upload is
    /// undone so no unreferenced image is left behind.
    pub async fn store(&self, event: OverspeedEvent) -> Result<PersistedReference, PersistError> {
        let image_key = image_key(&self.prefix, &event);
        let (date, time) = (event.date(), event.time());
        let captured_at_ms = event.captured_at.timestamp_millis();
        let (track_id, speed_kmh) = (event.track_id, event.speed_kmh);

        self.images.put(&image_key, event.image_jpeg).await?;

        let key = image_key.clone();
        let inserted = self
            .blocking(move |db| {
                db.insert(&NewEvidence {
                    track_id,
                    speed_kmh,
                    date: &date,
                    time: &time,
                    captured_at_ms,
                    image_key: &key,
                })
            })
            .await;

        match inserted {
            Ok(id) => Ok(PersistedReference { id, image_key }),
            Err(e) => {
                if let Err(cleanup) = self.images.delete(&image_key).await {
                    warn!(image_key, error = %cleanup, "failed to remove image after index failure");
                }
                Err(e)
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<EvidenceRecord>, PersistError> {
        self.blocking(|db| db.list()).await
    }

    /// Remove the image, then its record. A record whose image could not be
    /// removed is kept, so it can be retried.
    pub async fn delete(&self, id: i64) -> Result<EvidenceRecord, PersistError> {
        let record = self
            .blocking(move |db| db.get(id))
            .await?
            .ok_or(PersistError::NotFound(id))?;

        self.images
            .delete(&record.image_key)
            .await
            .map_err(|source| PersistError::ImageDelete { id, source })?;

        match self.blocking(move |db| db.delete(id)).await {
            Ok(_) => {
                info!(id, image_key = record.image_key, "evidence deleted");
                Ok(record)
            }
            Err(e) => Err(PersistError::PartialDelete {
                id,
                image_key: record.image_key,
                reason: e.to_string(),
            }),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistError>
    where
        F: FnOnce(&EvidenceDb) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| PersistError::Blocking(e.to_string()))?
            .map_err(PersistError::Database)
    }

    #[cfg(test)]
    pub(crate) fn db(&self) -> &EvidenceDb {
        &self.db
    }
}

/// `{prefix}{YYYY-mm-dd}/{dd-mm-YYYY-HH-MM-SS-ffffff}_{track}.jpeg`
pub fn image_key(prefix: &str, event: &OverspeedEvent) -> String {
    format!(
        "{prefix}{}/{}_{}.jpeg",
        event.date(),
        event.captured_at.format("%d-%m-%Y-%H-%M-%S-%6f"),
        event.track_id
    )
}

/// Engine-side handle onto the persistence queue. Never blocks: a full queue
/// rejects the event.
pub struct QueueSink {
    tx: mpsc::Sender<OverspeedEvent>,
}

pub fn queue(capacity: usize) -> (QueueSink, mpsc::Receiver<OverspeedEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSink { tx }, rx)
}

impl EventSink for QueueSink {
    fn submit(&self, event: OverspeedEvent) -> Result<(), SinkError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Drain the queue until every sender is gone. Failures are logged and the
/// event is dropped; they never stop the worker.
pub async fn run_worker(mut rx: mpsc::Receiver<OverspeedEvent>, store: Arc<EvidenceStore>) {
    info!("persistence worker started");
    let mut stored: u64 = 0;

    while let Some(event) = rx.recv().await {
        let (track_id, speed_kmh) = (event.track_id, event.speed_kmh);
        match store.store(event).await {
            Ok(reference) => {
                stored += 1;
                info!(
                    id = reference.id,
                    track_id,
                    speed_kmh,
                    image_key = reference.image_key,
                    "overspeed evidence stored"
                );
            }
            Err(e) => error!(track_id, speed_kmh, error = %e, "failed to persist overspeed event"),
        }
    }

    debug!(stored, "persistence queue closed, worker exiting");
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("evidence index error: {0}")]
    Database(rusqlite::Error),
    #[error("blocking task failed: {0}")]
    Blocking(String),
    #[error("no evidence with id {0}")]
    NotFound(i64),
    #[error("could not delete image for evidence {id}, record kept: {source}")]
    ImageDelete { id: i64, source: StorageError },
    #[error("image {image_key} for evidence {id} was deleted but the record was not: {reason}")]
    PartialDelete {
        id: i64,
        image_key: String,
        reason: String,
    },
}
