//! Request/response bodies for the coordinator API.
//!
//! Shared by the axum handlers and the client-side scheduler so both ends of
//! the wire agree on field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A `(part_number, etag)` pair as recorded for a session.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct PartEtag {
    pub part_number: i32,
    pub etag: String,
}

/// Body for `POST /uploads/initiate`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InitiateRequest {
    pub filename: String,
    pub filesize: i64,
}

/// Response for `POST /uploads/initiate`.
///
/// `uploaded_parts` carries the already-acknowledged parts (with etags) so a
/// resuming client can skip them and still assemble the full part list for
/// completion.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct InitiateResponse {
    pub upload_id: String,
    pub key: String,
    pub uploaded_parts: Vec<PartEtag>,
}

/// Body for `POST /uploads/presign`. `parts` is the total part count of the
/// plan; authorizations are returned only for parts not yet acknowledged.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PresignRequest {
    pub key: String,
    pub upload_id: String,
    pub parts: i32,
}

/// A short-lived, single-use authorization to write one part.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PartAuthorization {
    pub part_number: i32,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Body for `POST /uploads/acknowledge`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AcknowledgeRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: i32,
    pub etag: String,
}

/// Body for `POST /uploads/complete`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompleteRequest {
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<PartEtag>,
}

/// Response for `POST /uploads/complete`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CompleteResponse {
    pub success: bool,
    pub location: String,
}

/// Body for `POST /uploads/abort`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AbortRequest {
    pub key: String,
    pub upload_id: String,
}

/// Response for acknowledge/abort calls.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StatusResponse {
    pub success: bool,
}

/// One stored object as returned by `GET /uploads/list`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredUpload {
    pub filename: String,
    pub key: String,
    pub size: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub url: String,
    #[serde(rename = "type")]
    pub content_type: String,
}
