//! Represents one upload session — a single multipart-upload attempt.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of an upload session.
///
/// `InProgress` is the only mutable state; `Completed` and `Aborted` are
/// terminal and no operation may transition out of them.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resumable upload session for one `(filename, filesize)` pair.
///
/// At most one `in_progress` session exists per pair; a repeated request for
/// the same file reuses the open session instead of starting a second
/// multipart transaction against the backend.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Client-reported file name (resumption key, together with size).
    pub filename: String,

    /// Total file size in bytes.
    pub filesize: i64,

    /// Storage object key allocated for this attempt (unique per attempt).
    pub key: String,

    /// Multipart transaction id issued by the storage backend.
    pub upload_id: String,

    /// Current lifecycle state.
    pub status: SessionStatus,

    /// When this session was created.
    pub created_at: DateTime<Utc>,

    /// Last state change (part acknowledged, completed, aborted).
    pub updated_at: DateTime<Utc>,
}
