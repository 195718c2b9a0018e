//! Amazon S3 storage backend.
//!
//! Parts are written by clients directly to S3 through presigned
//! `UploadPart` requests; the coordinator only drives the multipart
//! transaction itself (create/complete/abort) plus the listing and deletion
//! used by the stored-file endpoints.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chrono::Utc;

use crate::models::wire::{PartAuthorization, PartEtag};
use crate::storage::{BackendResult, StorageBackend, StorageError, StoredObject};

pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Backend {
    /// Build a backend from ambient AWS configuration (credentials, region),
    /// optionally pointing at a custom S3-compatible endpoint.
    pub async fn from_env(bucket: impl Into<String>, endpoint: Option<&str>) -> Self {
        let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = match endpoint {
            Some(url) => {
                let conf = aws_sdk_s3::config::Builder::from(&shared)
                    .endpoint_url(url)
                    .force_path_style(true)
                    .build();
                aws_sdk_s3::Client::from_conf(conf)
            }
            None => aws_sdk_s3::Client::new(&shared),
        };

        Self { client, bucket: bucket.into() }
    }

    fn presign_config(ttl: Duration) -> BackendResult<PresigningConfig> {
        PresigningConfig::expires_in(ttl)
            .map_err(|err| StorageError::Unavailable(err.to_string()))
    }
}

fn unavailable<E>(err: E) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::Unavailable(DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(unavailable)?;

        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Unavailable("no upload id in create response".into()))
    }

    async fn presign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        ttl: Duration,
    ) -> BackendResult<PartAuthorization> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(Self::presign_config(ttl)?)
            .await
            .map_err(unavailable)?;

        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        Ok(PartAuthorization {
            part_number,
            url: presigned.uri().to_string(),
            expires_at,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartEtag],
    ) -> BackendResult<String> {
        let completed = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(unavailable)?;

        Ok(resp
            .location()
            .map(str::to_string)
            .unwrap_or_else(|| format!("s3://{}/{}", self.bucket, key)))
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(unavailable)?;

        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> BackendResult<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(Self::presign_config(ttl)?)
            .await
            .map_err(unavailable)?;

        Ok(presigned.uri().to_string())
    }

    async fn list_objects(&self, prefix: &str) -> BackendResult<Vec<StoredObject>> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(unavailable)?;

        Ok(resp
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.to_string();
                Some(StoredObject {
                    key,
                    size: obj.size().unwrap_or(0),
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                })
            })
            .collect())
    }

    async fn delete_object(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(unavailable)?;

        Ok(())
    }

    async fn probe(&self) -> BackendResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(unavailable)?;

        Ok(())
    }
}
