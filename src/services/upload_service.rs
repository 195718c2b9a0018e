//! src/services/upload_service.rs
//!
//! UploadService — the upload session protocol backed by SQLite for durable
//! session state and an object-storage backend for the bytes. This is the
//! sole writer of the session store: sessions are opened here, parts are
//! recorded here as the backend confirms them, and completion/abort
//! finalize the backend transaction before the session reaches its terminal
//! state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::part::UploadPart;
use crate::models::session::{SessionStatus, UploadSession};
use crate::models::wire::{PartAuthorization, PartEtag, StoredUpload};
use crate::planner::MAX_PARTS;
use crate::storage::{BackendResult, StorageBackend, StorageError};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no upload session for key `{0}`")]
    SessionNotFound(String),
    #[error("session `{key}` is {status} and cannot be modified")]
    SessionClosed { key: String, status: SessionStatus },
    #[error("part {part_number} of session `{key}` does not match the recorded parts")]
    PartMismatch { key: String, part_number: i32 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(#[from] StorageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// An opened (or resumed) session together with its acknowledged parts.
#[derive(Clone, Debug)]
pub struct OpenedSession {
    pub session: UploadSession,
    pub parts: Vec<PartEtag>,
}

const MAX_FILENAME_LEN: usize = 512;
const MAX_KEY_LEN: usize = 1024;

/// Prefix under which every upload attempt's object key is allocated.
const KEY_PREFIX: &str = "uploads/";

/// UploadService exposes the session protocol:
/// - Open a session (or resume the in-progress one for the same file)
/// - Authorize part writes for parts not yet acknowledged
/// - Acknowledge a part once the backend confirmed it
/// - Complete (validate part list, finalize with the backend) or Abort
///
/// plus the stored-file listing and deletion that sit on the same backend.
/// All state transitions happen through this struct; handlers and the
/// client-side scheduler never touch the store directly.
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool holding sessions and parts.
    pub db: Arc<SqlitePool>,

    backend: Arc<dyn StorageBackend>,

    /// Validity window for issued part-write and read authorizations.
    auth_ttl: Duration,
}

impl UploadService {
    /// Create a service backed by the provided pool and storage backend.
    /// `auth_ttl` bounds every authorization this service hands out.
    pub fn new(db: Arc<SqlitePool>, backend: Arc<dyn StorageBackend>, auth_ttl: Duration) -> Self {
        Self { db, backend, auth_ttl }
    }

    /// Readiness probe against the storage backend.
    pub async fn probe_backend(&self) -> BackendResult<()> {
        self.backend.probe().await
    }

    /// Basic filename validation to keep allocated keys safe.
    ///
    /// Rejects empty or overlong names, path separators to nowhere good
    /// (`..`, leading `/`), and control characters.
    fn ensure_filename_safe(filename: &str) -> UploadResult<()> {
        if filename.is_empty() {
            return Err(UploadError::InvalidRequest("filename must not be empty".into()));
        }
        if filename.len() > MAX_FILENAME_LEN {
            return Err(UploadError::InvalidRequest("filename too long".into()));
        }
        if filename.starts_with('/') || filename.contains("..") {
            return Err(UploadError::InvalidRequest("filename must not traverse paths".into()));
        }
        if filename
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(UploadError::InvalidRequest("filename contains invalid characters".into()));
        }
        Ok(())
    }

    /// Key validation for operations addressing stored objects directly.
    fn ensure_key_safe(key: &str) -> UploadResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(UploadError::InvalidRequest("invalid object key".into()));
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(UploadError::InvalidRequest("invalid object key".into()));
        }
        Ok(())
    }

    /// Fetch a session by its `(key, upload_id)` identity.
    ///
    /// Returns SessionNotFound if missing.
    async fn fetch_session(&self, key: &str, upload_id: &str) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, filename, filesize, key, upload_id, status, created_at, updated_at
             FROM upload_sessions WHERE key = ? AND upload_id = ?",
        )
        .bind(key)
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::SessionNotFound(key.to_string()),
            other => UploadError::Sqlx(other),
        })
    }

    /// Fetch a session and require it to still be in progress.
    async fn fetch_open_session(&self, key: &str, upload_id: &str) -> UploadResult<UploadSession> {
        let session = self.fetch_session(key, upload_id).await?;
        if session.status != SessionStatus::InProgress {
            return Err(UploadError::SessionClosed {
                key: session.key,
                status: session.status,
            });
        }
        Ok(session)
    }

    async fn find_in_progress(
        &self,
        filename: &str,
        filesize: i64,
    ) -> UploadResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT id, filename, filesize, key, upload_id, status, created_at, updated_at
             FROM upload_sessions WHERE filename = ? AND filesize = ? AND status = ?",
        )
        .bind(filename)
        .bind(filesize)
        .bind(SessionStatus::InProgress)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Acknowledged parts of a session, ascending by part number.
    async fn recorded_parts(&self, session_id: Uuid) -> UploadResult<Vec<PartEtag>> {
        let rows: Vec<UploadPart> = sqlx::query_as(
            "SELECT id, session_id, part_number, etag, created_at
             FROM upload_parts WHERE session_id = ? ORDER BY part_number ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|part| PartEtag { part_number: part.part_number, etag: part.etag })
            .collect())
    }

    /// Open a session for `(filename, filesize)`, resuming the in-progress
    /// one if it exists.
    ///
    /// A fresh open allocates a unique object key, initiates a multipart
    /// transaction with the backend, and persists the session. The partial
    /// unique index on `(filename, filesize, in_progress)` serializes
    /// concurrent opens for the same file: the loser aborts its freshly
    /// created backend transaction and returns the winner's session.
    pub async fn open(&self, filename: &str, filesize: i64) -> UploadResult<OpenedSession> {
        Self::ensure_filename_safe(filename)?;
        if filesize < 1 {
            return Err(UploadError::InvalidRequest("filesize must be positive".into()));
        }

        if let Some(session) = self.find_in_progress(filename, filesize).await? {
            let parts = self.recorded_parts(session.id).await?;
            debug!(
                key = %session.key,
                acknowledged = parts.len(),
                "resuming in-progress upload session"
            );
            return Ok(OpenedSession { session, parts });
        }

        let key = format!("{KEY_PREFIX}{}/{filename}", Uuid::new_v4());
        let upload_id = self.backend.create_multipart_upload(&key).await?;

        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            filesize,
            key: key.clone(),
            upload_id: upload_id.clone(),
            status: SessionStatus::InProgress,
            created_at: now,
            updated_at: now,
        };

        let insert = sqlx::query(
            "INSERT INTO upload_sessions (id, filename, filesize, key, upload_id, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(&session.filename)
        .bind(session.filesize)
        .bind(&session.key)
        .bind(&session.upload_id)
        .bind(session.status)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&*self.db)
        .await;

        match insert {
            Ok(_) => {
                info!(key = %session.key, upload_id = %session.upload_id, "opened upload session");
                Ok(OpenedSession { session, parts: Vec::new() })
            }
            Err(err) if is_unique_violation(&err) => {
                // Lost the open race: another request created the session
                // between our lookup and insert. Discard our backend
                // transaction and hand back the winner.
                if let Err(abort_err) = self.backend.abort_multipart_upload(&key, &upload_id).await
                {
                    warn!(key = %key, error = %abort_err, "could not abort orphaned backend transaction");
                }
                let winner = self
                    .find_in_progress(filename, filesize)
                    .await?
                    .ok_or(UploadError::Sqlx(err))?;
                let parts = self.recorded_parts(winner.id).await?;
                debug!(key = %winner.key, "open race resolved to existing session");
                Ok(OpenedSession { session: winner, parts })
            }
            Err(err) => Err(UploadError::Sqlx(err)),
        }
    }

    /// Issue write authorizations for every part of a `total_parts` plan
    /// that has not been acknowledged yet.
    ///
    /// Already-acknowledged parts are excluded, so retrying this call during
    /// resumption never re-authorizes completed work.
    pub async fn authorize(
        &self,
        key: &str,
        upload_id: &str,
        total_parts: i32,
    ) -> UploadResult<Vec<PartAuthorization>> {
        if total_parts < 1 || total_parts > MAX_PARTS {
            return Err(UploadError::InvalidRequest(format!(
                "part count must be between 1 and {MAX_PARTS}"
            )));
        }

        let session = self.fetch_open_session(key, upload_id).await?;

        let acknowledged: HashSet<i32> =
            sqlx::query_scalar("SELECT part_number FROM upload_parts WHERE session_id = ?")
                .bind(session.id)
                .fetch_all(&*self.db)
                .await?
                .into_iter()
                .collect();

        let mut authorizations = Vec::new();
        for part_number in 1..=total_parts {
            if acknowledged.contains(&part_number) {
                continue;
            }
            let auth = self
                .backend
                .presign_part(&session.key, &session.upload_id, part_number, self.auth_ttl)
                .await?;
            authorizations.push(auth);
        }

        debug!(
            key = %session.key,
            missing = authorizations.len(),
            acknowledged = acknowledged.len(),
            "authorized part writes"
        );
        Ok(authorizations)
    }

    /// Record a part as durably received by the backend.
    ///
    /// Insert-only and idempotent: re-acknowledging a part with the same
    /// etag is a no-op, while a differing etag is a consistency violation
    /// and leaves the original record untouched.
    pub async fn acknowledge_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        etag: &str,
    ) -> UploadResult<()> {
        if part_number < 1 {
            return Err(UploadError::InvalidRequest("part_number must be positive".into()));
        }
        if etag.is_empty() {
            return Err(UploadError::InvalidRequest("etag must not be empty".into()));
        }

        let session = self.fetch_open_session(key, upload_id).await?;

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO upload_parts (id, session_id, part_number, etag, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (session_id, part_number) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(session.id)
        .bind(part_number)
        .bind(etag)
        .bind(now)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            let existing: String = sqlx::query_scalar(
                "SELECT etag FROM upload_parts WHERE session_id = ? AND part_number = ?",
            )
            .bind(session.id)
            .bind(part_number)
            .fetch_one(&*self.db)
            .await?;

            if existing != etag {
                return Err(UploadError::PartMismatch { key: session.key, part_number });
            }
            debug!(key = %session.key, part_number, "part already acknowledged");
            return Ok(());
        }

        sqlx::query("UPDATE upload_sessions SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(session.id)
            .execute(&*self.db)
            .await?;

        debug!(key = %session.key, part_number, "acknowledged part");
        Ok(())
    }

    /// Finalize the upload: validate the submitted part list against the
    /// recorded parts, complete the backend transaction, and mark the
    /// session completed. Returns the stored object's location.
    ///
    /// The backend only ever sees the recorded list, so a caller cannot
    /// complete with parts the store never acknowledged.
    pub async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> UploadResult<String> {
        let session = self.fetch_open_session(key, upload_id).await?;
        let recorded = self.recorded_parts(session.id).await?;
        validate_part_list(&session.key, parts, &recorded)?;

        let location = self
            .backend
            .complete_multipart_upload(&session.key, &session.upload_id, &recorded)
            .await?;

        let updated = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(SessionStatus::Completed)
        .bind(Utc::now())
        .bind(session.id)
        .bind(SessionStatus::InProgress)
        .execute(&*self.db)
        .await?;

        if updated.rows_affected() == 0 {
            // Lost a close race between the guard fetch and this update;
            // report the status the session actually reached.
            let current = self.fetch_session(key, upload_id).await?;
            return Err(UploadError::SessionClosed {
                key: current.key,
                status: current.status,
            });
        }

        info!(key = %session.key, parts = recorded.len(), location = %location, "completed upload");
        Ok(location)
    }

    /// Discard the backend transaction and mark the session aborted.
    ///
    /// All transferred parts become unreachable; a later open for the same
    /// file starts a fresh session.
    pub async fn abort(&self, key: &str, upload_id: &str) -> UploadResult<()> {
        let session = self.fetch_open_session(key, upload_id).await?;

        self.backend
            .abort_multipart_upload(&session.key, &session.upload_id)
            .await?;

        let updated = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(SessionStatus::Aborted)
        .bind(Utc::now())
        .bind(session.id)
        .bind(SessionStatus::InProgress)
        .execute(&*self.db)
        .await?;

        if updated.rows_affected() == 0 {
            let current = self.fetch_session(key, upload_id).await?;
            return Err(UploadError::SessionClosed {
                key: current.key,
                status: current.status,
            });
        }

        info!(key = %session.key, "aborted upload session");
        Ok(())
    }

    /// List stored objects under the upload prefix with presigned read URLs
    /// and a MIME type classified from the key extension.
    pub async fn list_stored(&self) -> UploadResult<Vec<StoredUpload>> {
        let objects = self.backend.list_objects(KEY_PREFIX).await?;

        let mut files = Vec::with_capacity(objects.len());
        for obj in objects {
            let url = self.backend.presign_get(&obj.key, self.auth_ttl).await?;
            let filename = obj
                .key
                .rsplit('/')
                .next()
                .unwrap_or(obj.key.as_str())
                .to_string();
            files.push(StoredUpload {
                filename,
                content_type: mime_type_from_key(&obj.key).to_string(),
                key: obj.key,
                size: obj.size,
                created_at: obj.last_modified,
                url,
            });
        }
        Ok(files)
    }

    /// Delete a stored object. Unrelated to session lifecycle.
    pub async fn delete_stored(&self, key: &str) -> UploadResult<()> {
        Self::ensure_key_safe(key)?;
        self.backend.delete_object(key).await?;
        info!(key = %key, "deleted stored object");
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Validate a caller-submitted completion list against the recorded parts.
///
/// The submitted list (in any order, duplicates rejected) must contain
/// exactly the recorded `(part_number, etag)` pairs. The first divergence is
/// reported as a PartMismatch.
fn validate_part_list(
    key: &str,
    submitted: &[PartEtag],
    recorded: &[PartEtag],
) -> UploadResult<()> {
    if submitted.is_empty() {
        return Err(UploadError::InvalidRequest("completion requires at least one part".into()));
    }

    let mut sorted = submitted.to_vec();
    sorted.sort_by_key(|part| part.part_number);

    for pair in sorted.windows(2) {
        if pair[0].part_number == pair[1].part_number {
            return Err(UploadError::PartMismatch {
                key: key.to_string(),
                part_number: pair[0].part_number,
            });
        }
    }

    for (sub, rec) in sorted.iter().zip(recorded) {
        if sub != rec {
            return Err(UploadError::PartMismatch {
                key: key.to_string(),
                part_number: sub.part_number,
            });
        }
    }

    if sorted.len() != recorded.len() {
        let part_number = if sorted.len() > recorded.len() {
            sorted[recorded.len()].part_number
        } else {
            recorded[sorted.len()].part_number
        };
        return Err(UploadError::PartMismatch { key: key.to_string(), part_number });
    }

    Ok(())
}

/// Classify a stored object's MIME type from its key extension.
fn mime_type_from_key(key: &str) -> &'static str {
    let extension = key
        .rsplit('.')
        .next()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoredObject;
    use crate::storage::memory::MemoryBackend;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn service_with_backend() -> (UploadService, Arc<MemoryBackend>) {
        let db = Arc::new(crate::db::connect("sqlite::memory:").await.unwrap());
        crate::db::run_migrations(&db).await.unwrap();

        let backend = Arc::new(MemoryBackend::new("http://127.0.0.1:0"));
        let service = UploadService::new(db, backend.clone(), Duration::from_secs(3600));
        (service, backend)
    }

    fn query_param(url: &str, name: &str) -> String {
        url.split_once('?')
            .map(|(_, q)| q)
            .unwrap_or_default()
            .split('&')
            .find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k == name).then(|| v.to_string())
            })
            .unwrap_or_default()
    }

    /// Push one part's bytes through the backend the way a client would:
    /// take the issued authorization apart and PUT against it.
    async fn transfer_part(
        service: &UploadService,
        backend: &MemoryBackend,
        key: &str,
        upload_id: &str,
        total_parts: i32,
        part_number: i32,
        data: &'static [u8],
    ) -> String {
        let auths = service.authorize(key, upload_id, total_parts).await.unwrap();
        let auth = auths
            .iter()
            .find(|a| a.part_number == part_number)
            .expect("part not authorized");

        let expires: i64 = query_param(&auth.url, "expires").parse().unwrap();
        let signature = query_param(&auth.url, "signature");
        backend
            .put_part(key, upload_id, part_number, expires, &signature, Bytes::from_static(data))
            .await
            .unwrap()
    }

    /// Backend that loses the open race on purpose: while the service is
    /// away initiating the transaction, a competing session lands in the
    /// store.
    struct RacingBackend {
        db: Arc<SqlitePool>,
        winner: UploadSession,
        aborted: std::sync::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl StorageBackend for RacingBackend {
        async fn create_multipart_upload(&self, _key: &str) -> BackendResult<String> {
            let winner = &self.winner;
            sqlx::query(
                "INSERT INTO upload_sessions (id, filename, filesize, key, upload_id, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(winner.id)
            .bind(&winner.filename)
            .bind(winner.filesize)
            .bind(&winner.key)
            .bind(&winner.upload_id)
            .bind(winner.status)
            .bind(winner.created_at)
            .bind(winner.updated_at)
            .execute(&*self.db)
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
            Ok("loser-upload".to_string())
        }

        async fn presign_part(
            &self,
            _key: &str,
            _upload_id: &str,
            part_number: i32,
            _ttl: Duration,
        ) -> BackendResult<PartAuthorization> {
            Err(StorageError::PartRejected { part_number, reason: "unused".into() })
        }

        async fn complete_multipart_upload(
            &self,
            _key: &str,
            _upload_id: &str,
            _parts: &[PartEtag],
        ) -> BackendResult<String> {
            Err(StorageError::Unavailable("unused".into()))
        }

        async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
            self.aborted
                .lock()
                .unwrap()
                .push((key.to_string(), upload_id.to_string()));
            Ok(())
        }

        async fn presign_get(&self, key: &str, _ttl: Duration) -> BackendResult<String> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn list_objects(&self, _prefix: &str) -> BackendResult<Vec<StoredObject>> {
            Ok(Vec::new())
        }

        async fn delete_object(&self, _key: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn probe(&self) -> BackendResult<()> {
            Ok(())
        }
    }

    /// Delegates to the in-memory store but refuses the first completion,
    /// the way a backend with a transient outage would.
    struct FlakyCompleteBackend {
        inner: Arc<MemoryBackend>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl StorageBackend for FlakyCompleteBackend {
        async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
            self.inner.create_multipart_upload(key).await
        }

        async fn presign_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: i32,
            ttl: Duration,
        ) -> BackendResult<PartAuthorization> {
            self.inner.presign_part(key, upload_id, part_number, ttl).await
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            upload_id: &str,
            parts: &[PartEtag],
        ) -> BackendResult<String> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(StorageError::Unavailable("transient outage".into()));
            }
            self.inner.complete_multipart_upload(key, upload_id, parts).await
        }

        async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
            self.inner.abort_multipart_upload(key, upload_id).await
        }

        async fn presign_get(&self, key: &str, ttl: Duration) -> BackendResult<String> {
            self.inner.presign_get(key, ttl).await
        }

        async fn list_objects(&self, prefix: &str) -> BackendResult<Vec<StoredObject>> {
            self.inner.list_objects(prefix).await
        }

        async fn delete_object(&self, key: &str) -> BackendResult<()> {
            self.inner.delete_object(key).await
        }

        async fn probe(&self) -> BackendResult<()> {
            self.inner.probe().await
        }
    }

    /// Flips the session's stored status while the service is away at the
    /// backend, standing in for a concurrent close.
    struct ClosingBackend {
        db: Arc<SqlitePool>,
        flip_to: SessionStatus,
    }

    impl ClosingBackend {
        async fn flip(&self, key: &str) -> BackendResult<()> {
            sqlx::query("UPDATE upload_sessions SET status = ? WHERE key = ?")
                .bind(self.flip_to)
                .bind(key)
                .execute(&*self.db)
                .await
                .map_err(|err| StorageError::Unavailable(err.to_string()))?;
            Ok(())
        }
    }

    #[async_trait]
    impl StorageBackend for ClosingBackend {
        async fn create_multipart_upload(&self, _key: &str) -> BackendResult<String> {
            Ok("closing-upload".to_string())
        }

        async fn presign_part(
            &self,
            _key: &str,
            _upload_id: &str,
            part_number: i32,
            _ttl: Duration,
        ) -> BackendResult<PartAuthorization> {
            Err(StorageError::PartRejected { part_number, reason: "unused".into() })
        }

        async fn complete_multipart_upload(
            &self,
            key: &str,
            _upload_id: &str,
            _parts: &[PartEtag],
        ) -> BackendResult<String> {
            self.flip(key).await?;
            Ok("dropped-location".to_string())
        }

        async fn abort_multipart_upload(&self, key: &str, _upload_id: &str) -> BackendResult<()> {
            self.flip(key).await
        }

        async fn presign_get(&self, key: &str, _ttl: Duration) -> BackendResult<String> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn list_objects(&self, _prefix: &str) -> BackendResult<Vec<StoredObject>> {
            Ok(Vec::new())
        }

        async fn delete_object(&self, _key: &str) -> BackendResult<()> {
            Ok(())
        }

        async fn probe(&self) -> BackendResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn open_creates_fresh_session() {
        let (service, _) = service_with_backend().await;

        let opened = service.open("video.mp4", 1000).await.unwrap();

        assert!(opened.parts.is_empty());
        assert_eq!(opened.session.status, SessionStatus::InProgress);
        assert!(opened.session.key.starts_with("uploads/"));
        assert!(opened.session.key.ends_with("/video.mp4"));
        assert!(!opened.session.upload_id.is_empty());
    }

    #[tokio::test]
    async fn open_is_idempotent_while_in_progress() {
        let (service, _) = service_with_backend().await;

        let first = service.open("video.mp4", 1000).await.unwrap();
        let second = service.open("video.mp4", 1000).await.unwrap();

        assert_eq!(first.session.id, second.session.id);
        assert_eq!(first.session.key, second.session.key);
    }

    #[tokio::test]
    async fn open_after_restart_resumes_from_stored_state() {
        let (service, backend) = service_with_backend().await;

        let opened = service.open("video.mp4", 1000).await.unwrap();
        let (key, upload_id) = (opened.session.key.clone(), opened.session.upload_id.clone());
        let etag = transfer_part(&service, &backend, &key, &upload_id, 2, 1, b"first").await;
        service.acknowledge_part(&key, &upload_id, 1, &etag).await.unwrap();

        // A new service over the same pool stands in for a process restart.
        let restarted =
            UploadService::new(service.db.clone(), backend.clone(), Duration::from_secs(3600));
        let resumed = restarted.open("video.mp4", 1000).await.unwrap();

        assert_eq!(resumed.session.id, opened.session.id);
        assert_eq!(resumed.parts, vec![PartEtag { part_number: 1, etag }]);
    }

    #[tokio::test]
    async fn open_race_returns_winner_and_discards_loser_transaction() {
        let db = Arc::new(crate::db::connect("sqlite::memory:").await.unwrap());
        crate::db::run_migrations(&db).await.unwrap();

        let now = Utc::now();
        let winner = UploadSession {
            id: Uuid::new_v4(),
            filename: "raced.bin".into(),
            filesize: 64,
            key: "uploads/winner/raced.bin".into(),
            upload_id: "winner-upload".into(),
            status: SessionStatus::InProgress,
            created_at: now,
            updated_at: now,
        };
        let backend = Arc::new(RacingBackend {
            db: db.clone(),
            winner: winner.clone(),
            aborted: std::sync::Mutex::new(Vec::new()),
        });
        let service = UploadService::new(db, backend.clone(), Duration::from_secs(3600));

        let opened = service.open("raced.bin", 64).await.unwrap();

        assert_eq!(opened.session.id, winner.id);
        assert_eq!(opened.session.key, winner.key);
        assert!(opened.parts.is_empty());

        // The losing attempt's backend transaction was discarded.
        {
            let aborted = backend.aborted.lock().unwrap();
            assert_eq!(aborted.len(), 1);
            let (orphan_key, orphan_upload_id) = &aborted[0];
            assert_ne!(orphan_key, &winner.key);
            assert_eq!(orphan_upload_id, "loser-upload");
        }

        // And its session row never reached the store.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn open_distinguishes_sizes() {
        let (service, _) = service_with_backend().await;

        let small = service.open("video.mp4", 1000).await.unwrap();
        let large = service.open("video.mp4", 2000).await.unwrap();

        assert_ne!(small.session.id, large.session.id);
    }

    #[tokio::test]
    async fn open_rejects_invalid_input() {
        let (service, _) = service_with_backend().await;

        for filename in ["", "../../etc/passwd", "/abs.bin"] {
            let err = service.open(filename, 10).await.unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)), "{filename}");
        }

        let err = service.open("f.bin", 0).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn authorize_excludes_acknowledged_parts() {
        let (service, backend) = service_with_backend().await;
        let opened = service.open("big.bin", 5000).await.unwrap();
        let (key, upload_id) = (opened.session.key, opened.session.upload_id);

        for part_number in 1..=3 {
            let etag =
                transfer_part(&service, &backend, &key, &upload_id, 5, part_number, b"chunk").await;
            service.acknowledge_part(&key, &upload_id, part_number, &etag).await.unwrap();
        }

        let auths = service.authorize(&key, &upload_id, 5).await.unwrap();
        let numbers: Vec<i32> = auths.iter().map(|a| a.part_number).collect();
        assert_eq!(numbers, vec![4, 5]);
    }

    #[tokio::test]
    async fn authorize_requires_known_session() {
        let (service, _) = service_with_backend().await;
        let opened = service.open("f.bin", 10).await.unwrap();

        let err = service
            .authorize(&opened.session.key, "not-the-upload-id", 3)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));

        let err = service.authorize("uploads/none/f.bin", "x", 3).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn authorize_caps_part_count() {
        let (service, _) = service_with_backend().await;
        let opened = service.open("f.bin", 10).await.unwrap();

        for parts in [0, MAX_PARTS + 1] {
            let err = service
                .authorize(&opened.session.key, &opened.session.upload_id, parts)
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidRequest(_)));
        }
    }

    #[tokio::test]
    async fn authorize_spans_the_full_part_range() {
        let (service, _) = service_with_backend().await;
        let opened = service.open("huge.bin", 50_000_000_000).await.unwrap();
        let (key, upload_id) = (opened.session.key, opened.session.upload_id);

        service.acknowledge_part(&key, &upload_id, 1, "e1").await.unwrap();
        service.acknowledge_part(&key, &upload_id, 9_999, "e2").await.unwrap();

        let auths = service.authorize(&key, &upload_id, MAX_PARTS).await.unwrap();

        assert_eq!(auths.len(), (MAX_PARTS - 2) as usize);
        assert!(auths.iter().all(|a| a.part_number != 1 && a.part_number != 9_999));
        assert_eq!(auths.first().map(|a| a.part_number), Some(2));
        assert_eq!(auths.last().map(|a| a.part_number), Some(MAX_PARTS));
    }

    #[tokio::test]
    async fn acknowledge_twice_with_same_etag_is_noop() {
        let (service, backend) = service_with_backend().await;
        let opened = service.open("f.bin", 10).await.unwrap();
        let (key, upload_id) = (opened.session.key, opened.session.upload_id);

        let etag = transfer_part(&service, &backend, &key, &upload_id, 2, 1, b"data").await;
        service.acknowledge_part(&key, &upload_id, 1, &etag).await.unwrap();
        service.acknowledge_part(&key, &upload_id, 1, &etag).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM upload_parts WHERE session_id = ?",
        )
        .bind(opened.session.id)
        .fetch_one(&*service.db)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn acknowledge_with_conflicting_etag_fails() {
        let (service, backend) = service_with_backend().await;
        let opened = service.open("f.bin", 10).await.unwrap();
        let (key, upload_id) = (opened.session.key, opened.session.upload_id);

        let etag = transfer_part(&service, &backend, &key, &upload_id, 2, 1, b"data").await;
        service.acknowledge_part(&key, &upload_id, 1, &etag).await.unwrap();

        let err = service
            .acknowledge_part(&key, &upload_id, 1, "different")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::PartMismatch { part_number: 1, .. }));

        // Original record is untouched.
        let stored: String =
            sqlx::query_scalar("SELECT etag FROM upload_parts WHERE session_id = ?")
                .bind(opened.session.id)
                .fetch_one(&*service.db)
                .await
                .unwrap();
        assert_eq!(stored, etag);
    }

    #[tokio::test]
    async fn complete_finalizes_and_resumption_starts_fresh() {
        let (service, backend) = service_with_backend().await;
        let opened = service.open("movie.mp4", 12).await.unwrap();
        let (key, upload_id) = (opened.session.key.clone(), opened.session.upload_id.clone());

        let mut parts = Vec::new();
        for (part_number, data) in [(1, b"aaaa" as &'static [u8]), (2, b"bbbb"), (3, b"cc")] {
            let etag =
                transfer_part(&service, &backend, &key, &upload_id, 3, part_number, data).await;
            service.acknowledge_part(&key, &upload_id, part_number, &etag).await.unwrap();
            parts.push(PartEtag { part_number, etag });
        }

        let location = service.complete(&key, &upload_id, &parts).await.unwrap();
        assert!(location.contains(&key));

        // The file is at rest; a new open for the same identity is a fresh
        // session rather than the completed one.
        let reopened = service.open("movie.mp4", 12).await.unwrap();
        assert_ne!(reopened.session.id, opened.session.id);
    }

    #[tokio::test]
    async fn complete_rejects_diverging_part_lists() {
        let (service, backend) = service_with_backend().await;
        let opened = service.open("f.bin", 8).await.unwrap();
        let (key, upload_id) = (opened.session.key, opened.session.upload_id);

        let mut parts = Vec::new();
        for (part_number, data) in [(1, b"aaaa" as &'static [u8]), (2, b"bbbb")] {
            let etag =
                transfer_part(&service, &backend, &key, &upload_id, 2, part_number, data).await;
            service.acknowledge_part(&key, &upload_id, part_number, &etag).await.unwrap();
            parts.push(PartEtag { part_number, etag });
        }

        // Forged etag.
        let mut forged = parts.clone();
        forged[1].etag = "forged".into();
        let err = service.complete(&key, &upload_id, &forged).await.unwrap_err();
        assert!(matches!(err, UploadError::PartMismatch { part_number: 2, .. }));

        // Missing part.
        let err = service.complete(&key, &upload_id, &parts[..1]).await.unwrap_err();
        assert!(matches!(err, UploadError::PartMismatch { part_number: 2, .. }));

        // Extra unrecorded part.
        let mut extra = parts.clone();
        extra.push(PartEtag { part_number: 3, etag: "phantom".into() });
        let err = service.complete(&key, &upload_id, &extra).await.unwrap_err();
        assert!(matches!(err, UploadError::PartMismatch { part_number: 3, .. }));

        // The honest list still completes.
        service.complete(&key, &upload_id, &parts).await.unwrap();
    }

    #[tokio::test]
    async fn complete_backend_failure_leaves_session_retryable() {
        let db = Arc::new(crate::db::connect("sqlite::memory:").await.unwrap());
        crate::db::run_migrations(&db).await.unwrap();

        let memory = Arc::new(MemoryBackend::new("http://127.0.0.1:0"));
        let backend = Arc::new(FlakyCompleteBackend {
            inner: memory.clone(),
            fail_next: AtomicBool::new(true),
        });
        let service = UploadService::new(db, backend, Duration::from_secs(3600));

        let opened = service.open("flaky.bin", 4).await.unwrap();
        let (key, upload_id) = (opened.session.key.clone(), opened.session.upload_id.clone());
        let etag = transfer_part(&service, &memory, &key, &upload_id, 1, 1, b"data").await;
        service.acknowledge_part(&key, &upload_id, 1, &etag).await.unwrap();

        let parts = [PartEtag { part_number: 1, etag }];
        let err = service.complete(&key, &upload_id, &parts).await.unwrap_err();
        assert!(matches!(err, UploadError::BackendUnavailable(_)));

        // The failed finalize leaves the session open for another attempt.
        let status: String =
            sqlx::query_scalar("SELECT status FROM upload_sessions WHERE id = ?")
                .bind(opened.session.id)
                .fetch_one(&*service.db)
                .await
                .unwrap();
        assert_eq!(status, "in_progress");

        service.complete(&key, &upload_id, &parts).await.unwrap();
    }

    #[tokio::test]
    async fn close_race_reports_the_status_the_session_reached() {
        let db = Arc::new(crate::db::connect("sqlite::memory:").await.unwrap());
        crate::db::run_migrations(&db).await.unwrap();

        // Complete loses to a concurrent abort.
        let backend = Arc::new(ClosingBackend { db: db.clone(), flip_to: SessionStatus::Aborted });
        let service = UploadService::new(db.clone(), backend, Duration::from_secs(3600));
        let opened = service.open("raced-complete.bin", 4).await.unwrap();
        let (key, upload_id) = (opened.session.key, opened.session.upload_id);
        service.acknowledge_part(&key, &upload_id, 1, "e1").await.unwrap();

        let err = service
            .complete(&key, &upload_id, &[PartEtag { part_number: 1, etag: "e1".into() }])
            .await
            .unwrap_err();
        assert!(
            matches!(&err, UploadError::SessionClosed { status: SessionStatus::Aborted, .. }),
            "unexpected error: {err}"
        );

        // Abort loses to a concurrent complete.
        let backend = Arc::new(ClosingBackend { db: db.clone(), flip_to: SessionStatus::Completed });
        let service = UploadService::new(db, backend, Duration::from_secs(3600));
        let opened = service.open("raced-abort.bin", 4).await.unwrap();

        let err = service
            .abort(&opened.session.key, &opened.session.upload_id)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, UploadError::SessionClosed { status: SessionStatus::Completed, .. }),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn terminal_sessions_refuse_all_operations() {
        let (service, backend) = service_with_backend().await;
        let opened = service.open("f.bin", 8).await.unwrap();
        let (key, upload_id) = (opened.session.key, opened.session.upload_id);

        let etag = transfer_part(&service, &backend, &key, &upload_id, 2, 1, b"data").await;
        service.acknowledge_part(&key, &upload_id, 1, &etag).await.unwrap();

        service.abort(&key, &upload_id).await.unwrap();

        let ack = service.acknowledge_part(&key, &upload_id, 2, "e2").await.unwrap_err();
        assert!(matches!(ack, UploadError::SessionClosed { .. }));

        let complete = service
            .complete(&key, &upload_id, &[PartEtag { part_number: 1, etag }])
            .await
            .unwrap_err();
        assert!(matches!(complete, UploadError::SessionClosed { .. }));

        let again = service.abort(&key, &upload_id).await.unwrap_err();
        assert!(matches!(again, UploadError::SessionClosed { .. }));

        let authorize = service.authorize(&key, &upload_id, 2).await.unwrap_err();
        assert!(matches!(authorize, UploadError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn abort_then_open_starts_over() {
        let (service, _) = service_with_backend().await;
        let first = service.open("f.bin", 8).await.unwrap();

        service.abort(&first.session.key, &first.session.upload_id).await.unwrap();

        let second = service.open("f.bin", 8).await.unwrap();
        assert_ne!(second.session.id, first.session.id);
        assert!(second.parts.is_empty());
    }

    #[tokio::test]
    async fn list_and_destroy_round_trip() {
        let (service, backend) = service_with_backend().await;
        let opened = service.open("photo.jpg", 4).await.unwrap();
        let (key, upload_id) = (opened.session.key.clone(), opened.session.upload_id.clone());

        let etag = transfer_part(&service, &backend, &key, &upload_id, 1, 1, b"jpeg").await;
        service.acknowledge_part(&key, &upload_id, 1, &etag).await.unwrap();
        service
            .complete(&key, &upload_id, &[PartEtag { part_number: 1, etag }])
            .await
            .unwrap();

        let listed = service.list_stored().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, key);
        assert_eq!(listed[0].filename, "photo.jpg");
        assert_eq!(listed[0].content_type, "image/jpeg");
        assert!(!listed[0].url.is_empty());

        service.delete_stored(&key).await.unwrap();
        assert!(service.list_stored().await.unwrap().is_empty());
    }

    #[test]
    fn mime_classification_matches_extension_table() {
        assert_eq!(mime_type_from_key("a/b/c.JPG"), "image/jpeg");
        assert_eq!(mime_type_from_key("clip.mov"), "video/quicktime");
        assert_eq!(
            mime_type_from_key("paper.docx"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(mime_type_from_key("mystery.zzz"), "application/octet-stream");
        assert_eq!(mime_type_from_key("noextension"), "application/octet-stream");
    }

    #[test]
    fn part_list_validation_accepts_any_order() {
        let recorded = vec![
            PartEtag { part_number: 1, etag: "a".into() },
            PartEtag { part_number: 2, etag: "b".into() },
        ];
        let shuffled = vec![recorded[1].clone(), recorded[0].clone()];

        assert!(validate_part_list("k", &shuffled, &recorded).is_ok());
    }

    #[test]
    fn part_list_validation_rejects_duplicates() {
        let recorded = vec![PartEtag { part_number: 1, etag: "a".into() }];
        let duplicated = vec![recorded[0].clone(), recorded[0].clone()];

        let err = validate_part_list("k", &duplicated, &recorded).unwrap_err();
        assert!(matches!(err, UploadError::PartMismatch { part_number: 1, .. }));
    }
}
