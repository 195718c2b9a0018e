//! Sequential chunk transfer with pause, resume, and cancel.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::wire::{PartAuthorization, PartEtag};
use crate::planner::{DEFAULT_CHUNK_SIZE, PartSpan, plan_parts};
use crate::scheduler::api::{CoordinatorApi, PartTransport};
use crate::scheduler::{SchedulerError, UploadEvent};

/// Transfer attempts per part before the upload gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Terminal result of a finished upload.
#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub key: String,
    pub location: String,
    pub total_parts: i32,
    pub resumed_parts: usize,
}

/// Drives one file through the session protocol: open or resume a session,
/// transfer the missing parts in ascending order, acknowledge each one, and
/// complete with the full part list.
///
/// Parts the coordinator already recorded are skipped, so re-running after a
/// crash transfers only what is missing. The pause switch stops the
/// scheduler before the next part without dropping the one in flight.
/// Cancellation aborts the session on the coordinator.
pub struct ChunkScheduler {
    api: Arc<dyn CoordinatorApi>,
    transport: Arc<dyn PartTransport>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    chunk_size: u64,
    max_attempts: u32,
}

impl ChunkScheduler {
    /// Creates a scheduler with the default chunk size and retry limit.
    pub fn new(api: Arc<dyn CoordinatorApi>, transport: Arc<dyn PartTransport>) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            api,
            transport,
            cancel: CancellationToken::new(),
            pause,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Returns a cancellation token for this upload. Cancelling takes effect
    /// before the next part transfer and during an in-flight PUT.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns the pause switch. `send_replace(true)` holds the scheduler
    /// before its next part; `send_replace(false)` releases it.
    pub fn pause_switch(&self) -> watch::Sender<bool> {
        self.pause.clone()
    }

    /// Runs the upload to a terminal state.
    ///
    /// Emits `Started` after the session is opened, `Progress` per part, and
    /// exactly one of `Completed`, `Aborted`, or `Failed`. Errors before the
    /// session exists surface only through the returned `Result`.
    pub async fn run(
        &self,
        path: &Path,
        events_tx: &mpsc::Sender<UploadEvent>,
    ) -> Result<UploadOutcome, SchedulerError> {
        let filename = path.file_name().and_then(|name| name.to_str()).ok_or_else(|| {
            SchedulerError::Api(anyhow::anyhow!("no usable file name in {}", path.display()))
        })?;
        let filesize = tokio::fs::metadata(path).await?.len();

        let plan = plan_parts(filesize, self.chunk_size);
        let total_parts = plan.len() as i32;

        self.check_cancelled()?;
        let opened = self.api.initiate(filename, filesize as i64).await?;
        let key = opened.key;
        let upload_id = opened.upload_id;

        let mut done: BTreeMap<i32, String> = opened
            .uploaded_parts
            .into_iter()
            .map(|part| (part.part_number, part.etag))
            .collect();
        let resumed_parts = done.len();

        debug!(key = %key, total_parts, resumed_parts, "upload session opened");
        let _ = events_tx
            .send(UploadEvent::Started {
                key: key.clone(),
                total_parts,
                resumed_parts,
            })
            .await;

        match self
            .transfer_parts(path, &plan, &key, &upload_id, filesize, &mut done, events_tx)
            .await
        {
            Ok(()) => {}
            Err(SchedulerError::Cancelled) => {
                if let Err(err) = self.api.abort(&key, &upload_id).await {
                    warn!(key = %key, error = %err, "could not abort cancelled upload");
                }
                let _ = events_tx.send(UploadEvent::Aborted { key: key.clone() }).await;
                return Err(SchedulerError::Cancelled);
            }
            Err(err) => {
                let _ = events_tx
                    .send(UploadEvent::Failed {
                        key: key.clone(),
                        error: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        }

        // BTreeMap iteration keeps the completion list ascending.
        let parts: Vec<PartEtag> = done
            .into_iter()
            .map(|(part_number, etag)| PartEtag { part_number, etag })
            .collect();

        let completed = match self.api.complete(&key, &upload_id, &parts).await {
            Ok(response) if response.success => response,
            Ok(_) => {
                let err = SchedulerError::Api(anyhow::anyhow!("completion was not successful"));
                let _ = events_tx
                    .send(UploadEvent::Failed {
                        key: key.clone(),
                        error: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
            Err(err) => {
                let _ = events_tx
                    .send(UploadEvent::Failed {
                        key: key.clone(),
                        error: err.to_string(),
                    })
                    .await;
                return Err(err.into());
            }
        };

        let _ = events_tx
            .send(UploadEvent::Completed {
                key: key.clone(),
                location: completed.location.clone(),
            })
            .await;

        Ok(UploadOutcome {
            key,
            location: completed.location,
            total_parts,
            resumed_parts,
        })
    }

    /// Transfers every part of `plan` not already in `done`, one at a time
    /// in ascending order.
    async fn transfer_parts(
        &self,
        path: &Path,
        plan: &[PartSpan],
        key: &str,
        upload_id: &str,
        total_bytes: u64,
        done: &mut BTreeMap<i32, String>,
        events_tx: &mpsc::Sender<UploadEvent>,
    ) -> Result<(), SchedulerError> {
        let total_parts = plan.len() as i32;
        let mut paused = self.pause.subscribe();

        let mut authorizations: BTreeMap<i32, PartAuthorization> = self
            .api
            .presign(key, upload_id, total_parts)
            .await?
            .into_iter()
            .map(|auth| (auth.part_number, auth))
            .collect();

        let mut file = File::open(path).await?;
        let mut transferred: u64 = plan
            .iter()
            .filter(|span| done.contains_key(&span.part_number))
            .map(|span| span.len)
            .sum();

        for span in plan {
            if done.contains_key(&span.part_number) {
                debug!(part_number = span.part_number, "part already recorded; skipping");
                continue;
            }

            self.wait_if_paused(&mut paused).await?;
            self.check_cancelled()?;

            file.seek(SeekFrom::Start(span.offset)).await?;
            let mut buf = vec![0u8; span.len as usize];
            file.read_exact(&mut buf).await?;
            let data = Bytes::from(buf);

            let etag = self
                .transfer_one(key, upload_id, total_parts, span.part_number, data, &mut authorizations)
                .await?;

            self.api
                .acknowledge(key, upload_id, span.part_number, &etag)
                .await?;
            done.insert(span.part_number, etag);
            transferred += span.len;

            let _ = events_tx
                .send(UploadEvent::Progress {
                    part_number: span.part_number,
                    transferred_bytes: transferred,
                    total_bytes,
                })
                .await;
        }

        Ok(())
    }

    /// One part to durability or a bounded failure.
    ///
    /// The initial authorization comes from the batch request; every retry
    /// fetches a fresh one because a failed attempt may have consumed the
    /// single-use URL.
    async fn transfer_one(
        &self,
        key: &str,
        upload_id: &str,
        total_parts: i32,
        part_number: i32,
        data: Bytes,
        authorizations: &mut BTreeMap<i32, PartAuthorization>,
    ) -> Result<String, SchedulerError> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.max_attempts {
            let auth = match authorizations.remove(&part_number) {
                Some(auth) => auth,
                None => {
                    self.fresh_authorization(key, upload_id, total_parts, part_number)
                        .await?
                }
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SchedulerError::Cancelled),
                result = self.transport.put_part(&auth, data.clone()) => result,
            };

            match result {
                Ok(etag) => return Ok(etag),
                Err(err) => {
                    warn!(part_number, attempt, error = %err, "part transfer attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        Err(SchedulerError::TransferFailed {
            part_number,
            attempts: self.max_attempts,
            last_error,
        })
    }

    async fn fresh_authorization(
        &self,
        key: &str,
        upload_id: &str,
        total_parts: i32,
        part_number: i32,
    ) -> Result<PartAuthorization, SchedulerError> {
        let authorizations = self.api.presign(key, upload_id, total_parts).await?;
        authorizations
            .into_iter()
            .find(|auth| auth.part_number == part_number)
            .ok_or_else(|| {
                SchedulerError::Api(anyhow::anyhow!(
                    "coordinator did not reauthorize part {part_number}"
                ))
            })
    }

    /// Blocks while the pause switch is set, without polling. Cancellation
    /// interrupts the wait.
    async fn wait_if_paused(
        &self,
        paused: &mut watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        if !*paused.borrow() {
            return Ok(());
        }
        debug!("upload paused; waiting");
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SchedulerError::Cancelled),
            changed = paused.wait_for(|p| !*p) => match changed {
                Ok(_) => Ok(()),
                // Switch dropped while paused; treat as cancellation.
                Err(_) => Err(SchedulerError::Cancelled),
            },
        }
    }

    fn check_cancelled(&self) -> Result<(), SchedulerError> {
        if self.cancel.is_cancelled() {
            Err(SchedulerError::Cancelled)
        } else {
            Ok(())
        }
    }
}
