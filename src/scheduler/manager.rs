//! Registry of running uploads.
//!
//! The manager owns every running upload's control surface. Entries are
//! inserted when an upload starts and removed by the upload task itself when
//! it reaches a terminal state, so the registry always reflects live
//! uploads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::planner::DEFAULT_CHUNK_SIZE;
use crate::scheduler::api::{CoordinatorApi, PartTransport};
use crate::scheduler::upload::{ChunkScheduler, UploadOutcome};
use crate::scheduler::{SchedulerError, UploadEvent};

struct ActiveUpload {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

/// Caller's grip on one started upload.
pub struct UploadHandle {
    pub id: Uuid,
    events: Option<mpsc::Receiver<UploadEvent>>,
    task: JoinHandle<Result<UploadOutcome, SchedulerError>>,
}

impl UploadHandle {
    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events.take()
    }

    /// Waits for the upload task and returns its outcome.
    pub async fn join(self) -> Result<UploadOutcome, SchedulerError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(SchedulerError::Api(anyhow::anyhow!(
                "upload task panicked: {err}"
            ))),
        }
    }
}

/// Starts uploads and keeps their pause/cancel controls addressable by id.
#[derive(Clone)]
pub struct UploadManager {
    api: Arc<dyn CoordinatorApi>,
    transport: Arc<dyn PartTransport>,
    chunk_size: u64,
    uploads: Arc<Mutex<HashMap<Uuid, ActiveUpload>>>,
}

impl UploadManager {
    pub fn new(api: Arc<dyn CoordinatorApi>, transport: Arc<dyn PartTransport>) -> Self {
        Self {
            api,
            transport,
            chunk_size: DEFAULT_CHUNK_SIZE,
            uploads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Starts uploading `path` on a background task and registers its
    /// controls.
    pub async fn start(&self, path: PathBuf) -> UploadHandle {
        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::channel(256);

        let scheduler = ChunkScheduler::new(self.api.clone(), self.transport.clone())
            .with_chunk_size(self.chunk_size);
        let cancel = scheduler.cancel_token();
        let pause = scheduler.pause_switch();

        let registry = self.uploads.clone();
        // Held across the spawn so the task cannot remove its entry before
        // it exists.
        let mut uploads = self.uploads.lock().await;
        let task = tokio::spawn(async move {
            let result = scheduler.run(&path, &events_tx).await;
            registry.lock().await.remove(&id);
            result
        });
        uploads.insert(id, ActiveUpload { cancel, pause });

        info!(upload = %id, "started upload");
        UploadHandle {
            id,
            events: Some(events_rx),
            task,
        }
    }

    /// Pauses a running upload. Returns false if the id is not live.
    pub async fn pause(&self, id: Uuid) -> bool {
        match self.uploads.lock().await.get(&id) {
            Some(entry) => {
                entry.pause.send_replace(true);
                info!(upload = %id, "paused upload");
                true
            }
            None => false,
        }
    }

    /// Releases a paused upload. Returns false if the id is not live.
    pub async fn resume(&self, id: Uuid) -> bool {
        match self.uploads.lock().await.get(&id) {
            Some(entry) => {
                entry.pause.send_replace(false);
                info!(upload = %id, "resumed upload");
                true
            }
            None => false,
        }
    }

    /// Cancels a running upload; its session will be aborted. Returns false
    /// if the id is not live.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.uploads.lock().await.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(upload = %id, "cancelled upload");
                true
            }
            None => false,
        }
    }

    /// Ids of the uploads currently running.
    pub async fn active(&self) -> Vec<Uuid> {
        self.uploads.lock().await.keys().copied().collect()
    }
}
