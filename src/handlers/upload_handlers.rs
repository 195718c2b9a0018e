//! HTTP handlers for the upload session protocol.
//! Thin JSON shims over `UploadService`; every session state transition
//! happens in the service layer.

use crate::{
    errors::AppError,
    models::wire::{
        AbortRequest, AcknowledgeRequest, CompleteRequest, CompleteResponse, InitiateRequest,
        InitiateResponse, PartAuthorization, PresignRequest, StatusResponse, StoredUpload,
    },
    services::upload_service::UploadService,
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

/// `POST /uploads/initiate` — open a session, or resume the in-progress one
/// for the same file. The response carries the already-acknowledged parts.
pub async fn initiate_upload(
    State(service): State<UploadService>,
    Json(payload): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>, AppError> {
    let opened = service.open(&payload.filename, payload.filesize).await?;
    Ok(Json(InitiateResponse {
        upload_id: opened.session.upload_id,
        key: opened.session.key,
        uploaded_parts: opened.parts,
    }))
}

/// `POST /uploads/presign` — write authorizations for the parts of the plan
/// that are not yet acknowledged.
pub async fn presign_parts(
    State(service): State<UploadService>,
    Json(payload): Json<PresignRequest>,
) -> Result<Json<Vec<PartAuthorization>>, AppError> {
    let authorizations = service
        .authorize(&payload.key, &payload.upload_id, payload.parts)
        .await?;
    Ok(Json(authorizations))
}

/// `POST /uploads/acknowledge` — record one transferred part.
pub async fn acknowledge_part(
    State(service): State<UploadService>,
    Json(payload): Json<AcknowledgeRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    service
        .acknowledge_part(
            &payload.key,
            &payload.upload_id,
            payload.part_number,
            &payload.etag,
        )
        .await?;
    Ok(Json(StatusResponse { success: true }))
}

/// `POST /uploads/complete` — validate the submitted part list and assemble
/// the stored object.
pub async fn complete_upload(
    State(service): State<UploadService>,
    Json(payload): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, AppError> {
    let location = service
        .complete(&payload.key, &payload.upload_id, &payload.parts)
        .await?;
    Ok(Json(CompleteResponse {
        success: true,
        location,
    }))
}

/// `POST /uploads/abort` — discard the session and its transferred parts.
pub async fn abort_upload(
    State(service): State<UploadService>,
    Json(payload): Json<AbortRequest>,
) -> Result<Json<StatusResponse>, AppError> {
    service.abort(&payload.key, &payload.upload_id).await?;
    Ok(Json(StatusResponse { success: true }))
}

/// `GET /uploads/list` — stored objects with presigned read URLs.
pub async fn list_uploads(
    State(service): State<UploadService>,
) -> Result<Json<Vec<StoredUpload>>, AppError> {
    Ok(Json(service.list_stored().await?))
}

/// Query for `DELETE /uploads/destroy`.
#[derive(Debug, Deserialize)]
pub struct DestroyQuery {
    pub key: String,
}

/// `DELETE /uploads/destroy?key=` — remove a stored object.
pub async fn destroy_upload(
    State(service): State<UploadService>,
    Query(query): Query<DestroyQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    service.delete_stored(&query.key).await?;
    Ok(Json(StatusResponse { success: true }))
}
