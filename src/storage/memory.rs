//! In-memory storage backend.
//!
//! Emulates the multipart contract for development and tests: uuid upload
//! ids, md5 part etags, and part-write authorizations that point back at the
//! coordinator's own `/backend/{key}` routes. Authorization URLs carry an
//! expiry timestamp and an md5 signature over the grant, both checked on
//! use, so expired or tampered grants are refused just like a real presigned
//! URL.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::wire::{PartAuthorization, PartEtag};
use crate::storage::{BackendResult, StorageBackend, StorageError, StoredObject};

/// Key bytes escaped when a key is embedded in a URL path. `?`, `#` and `%`
/// would change how the URL parses; the rest are not valid in a path. `/`
/// stays literal so the key's segments remain path segments, and the routes
/// decode the capture back to the raw key before any signature check.
const KEY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Default)]
struct MemoryState {
    /// Open multipart transactions, keyed by upload id.
    transactions: HashMap<String, Transaction>,
    /// Completed objects, keyed by object key.
    objects: BTreeMap<String, StoredBlob>,
}

struct Transaction {
    key: String,
    parts: BTreeMap<i32, PartBuf>,
}

struct PartBuf {
    etag: String,
    data: Bytes,
}

struct StoredBlob {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

pub struct MemoryBackend {
    public_url: String,
    secret: String,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// `public_url` is the coordinator's own base URL; issued authorizations
    /// point at its `/backend` routes.
    pub fn new(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            secret: Uuid::new_v4().to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn sign(&self, grant: &str, expires: i64) -> String {
        format!("{:x}", md5::compute(format!("{grant}|{expires}|{}", self.secret)))
    }

    fn part_grant(key: &str, upload_id: &str, part_number: i32) -> String {
        format!("PUT|{key}|{upload_id}|{part_number}")
    }

    fn get_grant(key: &str) -> String {
        format!("GET|{key}")
    }

    fn check_grant(grant: &str, expires: i64, signature: &str, expected: &str) -> Result<(), String> {
        if signature != expected {
            return Err(format!("bad signature for grant `{grant}`"));
        }
        if Utc::now().timestamp() > expires {
            return Err("authorization expired".to_string());
        }
        Ok(())
    }

    /// Accept one part's bytes under a previously issued authorization.
    ///
    /// Re-putting the same part number replaces the buffered bytes, matching
    /// backend semantics for retried part transfers. Returns the part's
    /// etag (md5 of the bytes, unquoted).
    pub async fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        expires: i64,
        signature: &str,
        data: Bytes,
    ) -> BackendResult<String> {
        let grant = Self::part_grant(key, upload_id, part_number);
        let expected = self.sign(&grant, expires);
        Self::check_grant(&grant, expires, signature, &expected)
            .map_err(|reason| StorageError::PartRejected { part_number, reason })?;

        let mut state = self.state.lock().await;
        let txn = state
            .transactions
            .get_mut(upload_id)
            .filter(|txn| txn.key == key)
            .ok_or_else(|| StorageError::UnknownTransaction {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            })?;

        let etag = format!("{:x}", md5::compute(&data));
        txn.parts.insert(part_number, PartBuf { etag: etag.clone(), data });
        Ok(etag)
    }

    /// Read a stored object's bytes under a presigned GET authorization.
    pub async fn read_object(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> BackendResult<Bytes> {
        let grant = Self::get_grant(key);
        let expected = self.sign(&grant, expires);
        Self::check_grant(&grant, expires, signature, &expected)
            .map_err(|reason| StorageError::PartRejected { part_number: 0, reason })?;

        let state = self.state.lock().await;
        state
            .objects
            .get(key)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.transactions.insert(
            upload_id.clone(),
            Transaction { key: key.to_string(), parts: BTreeMap::new() },
        );
        Ok(upload_id)
    }

    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> BackendResult<PartAuthorization> {
        {
            let state = self.state.lock().await;
            if !state
                .transactions
                .get(upload_id)
                .is_some_and(|txn| txn.key == key)
            {
                return Err(StorageError::UnknownTransaction {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                });
            }
        }

        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        let expires = expires_at.timestamp();
        let signature = self.sign(&Self::part_grant(key, upload_id, part_number), expires);
        let url = format!(
            "{}/backend/{}?uploadId={upload_id}&partNumber={part_number}&expires={expires}&signature={signature}",
            self.public_url,
            utf8_percent_encode(key, KEY_ESCAPE),
        );

        Ok(PartAuthorization { part_number, url, expires_at })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> BackendResult<String> {
        let mut state = self.state.lock().await;
        let txn = state
            .transactions
            .get(upload_id)
            .filter(|txn| txn.key == key)
            .ok_or_else(|| StorageError::UnknownTransaction {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            })?;

        if parts.is_empty() {
            return Err(StorageError::PartRejected {
                part_number: 0,
                reason: "completion requires at least one part".to_string(),
            });
        }

        // The submitted list must be ascending and every entry must match a
        // transferred part's etag, as the real backend enforces.
        let mut assembled = Vec::new();
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(StorageError::PartRejected {
                    part_number: part.part_number,
                    reason: "part numbers must be ascending".to_string(),
                });
            }
            previous = part.part_number;

            let stored = txn.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::PartRejected {
                    part_number: part.part_number,
                    reason: "part was never transferred".to_string(),
                }
            })?;
            if stored.etag != part.etag {
                return Err(StorageError::PartRejected {
                    part_number: part.part_number,
                    reason: "etag does not match transferred data".to_string(),
                });
            }
            assembled.extend_from_slice(&stored.data);
        }

        state.transactions.remove(upload_id);
        state.objects.insert(
            key.to_string(),
            StoredBlob { data: Bytes::from(assembled), last_modified: Utc::now() },
        );

        Ok(format!("{}/backend/{}", self.public_url, utf8_percent_encode(key, KEY_ESCAPE)))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        // Idempotent: aborting an unknown or already-aborted transaction is
        // a no-op, as with the real backend.
        if let Some(txn) = state.transactions.get(upload_id) {
            if txn.key == key {
                state.transactions.remove(upload_id);
            }
        }
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> BackendResult<String> {
        let expires = (Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64)).timestamp();
        let signature = self.sign(&Self::get_grant(key), expires);
        Ok(format!(
            "{}/backend/{}?expires={expires}&signature={signature}",
            self.public_url,
            utf8_percent_encode(key, KEY_ESCAPE),
        ))
    }

    async fn list_objects(&self, prefix: &str) -> BackendResult<Vec<StoredObject>> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, blob)| StoredObject {
                key: key.clone(),
                size: blob.data.len() as i64,
                last_modified: Some(blob.last_modified),
            })
            .collect())
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        state.objects.remove(key);
        Ok(())
    }

    async fn probe(&self) -> BackendResult<()> {
        Ok(())
    }
}
