//! Represents a durably acknowledged part of an upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One acknowledged part of a multipart upload.
///
/// A row exists if and only if the storage backend confirmed receipt of the
/// chunk; presence of the row is the resumption signal. Rows are insert-only
/// and unique per `(session_id, part_number)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadPart {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Reference to the parent upload session.
    pub session_id: Uuid,

    /// Part number (1-based, ascending).
    pub part_number: i32,

    /// Integrity token returned by the backend for this part.
    pub etag: String,

    /// Timestamp when the part was acknowledged.
    pub created_at: DateTime<Utc>,
}
