//! Coordinator API client and part transport.
//!
//! `CoordinatorApi` abstracts the session endpoints and `PartTransport` the
//! authorized part write, so the scheduler can be driven against mocks in
//! tests and against HTTP in the binary.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::wire::{
    AbortRequest, AcknowledgeRequest, CompleteRequest, CompleteResponse, InitiateRequest,
    InitiateResponse, PartAuthorization, PartEtag, PresignRequest, StatusResponse,
};

/// Session protocol operations the scheduler needs from the coordinator.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Open or resume a session for `(filename, filesize)`.
    async fn initiate(&self, filename: &str, filesize: i64) -> Result<InitiateResponse>;

    /// Request write authorizations for the parts still missing.
    async fn presign(
        &self,
        key: &str,
        upload_id: &str,
        parts: i32,
    ) -> Result<Vec<PartAuthorization>>;

    /// Report a transferred part so it is recorded durably.
    async fn acknowledge(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        etag: &str,
    ) -> Result<()>;

    /// Submit the full part list and finalize the stored object.
    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> Result<CompleteResponse>;

    /// Abort the session, discarding transferred parts.
    async fn abort(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Writes one part's bytes against an issued authorization.
#[async_trait]
pub trait PartTransport: Send + Sync {
    /// PUT `data` to the authorized URL and return the backend's etag.
    async fn put_part(&self, auth: &PartAuthorization, data: Bytes) -> Result<String>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Part PUTs carry chunk payloads and need more headroom than the
/// control-plane calls.
const PART_PUT_TIMEOUT: Duration = Duration::from_secs(300);

/// HTTP client for the coordinator's JSON endpoints.
pub struct HttpCoordinatorClient {
    client: Client,
    base_url: String,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let body: T = response
            .json()
            .await
            .context("Failed to parse response as JSON")?;

        Ok(body)
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinatorClient {
    async fn initiate(&self, filename: &str, filesize: i64) -> Result<InitiateResponse> {
        self.post_json(
            "/uploads/initiate",
            &InitiateRequest {
                filename: filename.to_string(),
                filesize,
            },
        )
        .await
    }

    async fn presign(
        &self,
        key: &str,
        upload_id: &str,
        parts: i32,
    ) -> Result<Vec<PartAuthorization>> {
        self.post_json(
            "/uploads/presign",
            &PresignRequest {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                parts,
            },
        )
        .await
    }

    async fn acknowledge(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        etag: &str,
    ) -> Result<()> {
        let _: StatusResponse = self
            .post_json(
                "/uploads/acknowledge",
                &AcknowledgeRequest {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                    part_number,
                    etag: etag.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> Result<CompleteResponse> {
        self.post_json(
            "/uploads/complete",
            &CompleteRequest {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
                parts: parts.to_vec(),
            },
        )
        .await
    }

    async fn abort(&self, key: &str, upload_id: &str) -> Result<()> {
        let _: StatusResponse = self
            .post_json(
                "/uploads/abort",
                &AbortRequest {
                    key: key.to_string(),
                    upload_id: upload_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

/// HTTP transport that PUTs part bytes against authorization URLs.
pub struct HttpPartTransport {
    client: Client,
}

impl HttpPartTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(PART_PUT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PartTransport for HttpPartTransport {
    async fn put_part(&self, auth: &PartAuthorization, data: Bytes) -> Result<String> {
        let response = self
            .client
            .put(&auth.url)
            .body(data)
            .send()
            .await
            .context("Failed to send part")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "part {} rejected with status {}: {}",
                auth.part_number,
                status,
                error_text
            ));
        }

        // Stored etags are unquoted hex; the header form is quoted.
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string())
            .context("part response missing ETag header")?;

        Ok(etag)
    }
}
