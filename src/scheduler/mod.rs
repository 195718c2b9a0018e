//! Client-side transfer scheduling.
//!
//! The scheduler drives a local file through the coordinator's session
//! protocol: plan the parts, open (or resume) a session, transfer the
//! missing parts one at a time in ascending order, and complete. The
//! `UploadManager` keeps a registry of running uploads so they can be
//! paused, resumed, or cancelled from outside.

pub mod api;
pub mod manager;
pub mod upload;

pub use api::{CoordinatorApi, HttpCoordinatorClient, HttpPartTransport, PartTransport};
pub use manager::{UploadHandle, UploadManager};
pub use upload::{ChunkScheduler, UploadOutcome};

use thiserror::Error;

/// Errors produced while driving an upload.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("coordinator error: {0}")]
    Api(#[from] anyhow::Error),

    #[error("part {part_number} failed after {attempts} attempts: {last_error}")]
    TransferFailed {
        part_number: i32,
        attempts: u32,
        last_error: String,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Progress notifications emitted while an upload runs.
#[derive(Clone, Debug)]
pub enum UploadEvent {
    /// A session was opened (fresh or resumed) and transfer is starting.
    Started {
        key: String,
        total_parts: i32,
        resumed_parts: usize,
    },
    /// One part was transferred and acknowledged.
    Progress {
        part_number: i32,
        transferred_bytes: u64,
        total_bytes: u64,
    },
    /// Every part is durable and the object was assembled.
    Completed { key: String, location: String },
    /// The upload was cancelled and its session aborted.
    Aborted { key: String },
    /// The upload stopped early; the session is left open for resumption.
    Failed { key: String, error: String },
}
