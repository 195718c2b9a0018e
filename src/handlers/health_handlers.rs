//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness only, no I/O
//! - GET /readyz   -> session store + storage backend reachability

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

/// `GET /healthz`
///
/// Always 200 with a plain JSON body; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// Ready means both halves of the coordinator can answer: the session store
/// and the storage backend. The store check doubles as an in-progress
/// session count, which rides along in the response for operators. 200 when
/// both checks pass, 503 otherwise.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let sessions = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM upload_sessions WHERE status = 'in_progress'",
    )
    .fetch_one(&*service.db)
    .await;

    let database = match &sessions {
        Ok(_) => CheckStatus { ok: true, error: None },
        Err(err) => CheckStatus {
            ok: false,
            error: Some(err.to_string()),
        },
    };

    let backend = match service.probe_backend().await {
        Ok(()) => CheckStatus { ok: true, error: None },
        Err(err) => CheckStatus {
            ok: false,
            error: Some(err.to_string()),
        },
    };

    let ready = database.ok && backend.ok;
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" },
        active_sessions: sessions.ok(),
        checks: ReadyChecks { database, backend },
    };

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_sessions: Option<i64>,
    checks: ReadyChecks,
}

#[derive(Serialize)]
struct ReadyChecks {
    database: CheckStatus,
    backend: CheckStatus,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
