//! Storage backend abstraction.
//!
//! The coordinator never moves object bytes itself; it drives a backend's
//! multipart-upload surface and hands out the backend's part-write
//! authorizations. `StorageBackend` captures exactly that contract so the
//! protocol logic stays independent of which store is behind it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::wire::{PartAuthorization, PartEtag};

pub mod memory;
pub mod s3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("multipart transaction `{upload_id}` not found for `{key}`")]
    UnknownTransaction { key: String, upload_id: String },
    #[error("part {part_number} rejected: {reason}")]
    PartRejected { part_number: i32, reason: String },
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, StorageError>;

/// Metadata for one stored object, as returned by `list_objects`.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub key: String,
    pub size: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Multipart-upload contract consumed from an object-storage backend.
///
/// `abort_multipart_upload` and `delete_object` must be idempotent; every
/// other call may fail with `Unavailable` on transport trouble and is safe
/// to retry from the caller's side.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Begin a multipart transaction for `key`, returning its upload id.
    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String>;

    /// Issue a short-lived authorization to write one part directly to the
    /// backend. Bound to `(key, upload_id, part_number)` and valid for `ttl`.
    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> BackendResult<PartAuthorization>;

    /// Finalize the transaction from the ordered part list, assembling the
    /// object. Returns the stored object's location.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> BackendResult<String>;

    /// Discard the transaction and all parts transferred so far.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;

    /// Issue a short-lived read URL for a stored object.
    async fn presign_get(&self, key: &str, ttl: Duration) -> BackendResult<String>;

    /// List stored objects whose keys start with `prefix`.
    async fn list_objects(&self, prefix: &str) -> BackendResult<Vec<StoredObject>>;

    /// Remove a stored object.
    async fn delete_object(&self, key: &str) -> BackendResult<()>;

    /// Cheap readiness probe.
    async fn probe(&self) -> BackendResult<()>;
}
