//! In-process storage endpoints backing the memory backend.
//! The memory backend authorizes part writes with URLs that point back at
//! the coordinator itself; these handlers terminate those URLs. They are
//! mounted only when the memory backend is configured.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;

use crate::errors::AppError;
use crate::storage::memory::MemoryBackend;

/// Query fields carried by part-write authorization URLs.
#[derive(Debug, Deserialize)]
pub struct PartWriteQuery {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    #[serde(rename = "partNumber")]
    pub part_number: i32,
    pub expires: i64,
    pub signature: String,
}

/// Query fields carried by read authorization URLs.
#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    pub expires: i64,
    pub signature: String,
}

/// PUT `/backend/{*key}` — authorized part write. Responds with the part's
/// etag in a quoted `ETag` header, like an object store would.
pub async fn put_part(
    State(backend): State<Arc<MemoryBackend>>,
    Path(key): Path<String>,
    Query(query): Query<PartWriteQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let etag = backend
        .put_part(
            &key,
            &query.upload_id,
            query.part_number,
            query.expires,
            &query.signature,
            body,
        )
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// GET `/backend/{*key}` — authorized read of a stored object.
pub async fn get_object(
    State(backend): State<Arc<MemoryBackend>>,
    Path(key): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, AppError> {
    let data = backend
        .read_object(&key, query.expires, &query.signature)
        .await?;

    let mut response = Response::new(Body::from(data));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok(response)
}
