//! Liveness and readiness checks.
//!
//! - GET /healthz  -> process is up
//! - GET /readyz   -> state store answers and the staging directory is writable

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`. No I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// 200 when SQLite answers `SELECT 1` and a marker file can be written, read
/// back and removed under the staging directory; 503 otherwise.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*service.store.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {v}")),
        Err(e) => CheckStatus::failed(format!("error: {e}")),
    };

    let marker = service
        .staging_dir
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk = match fs::write(&marker, b"readyz").await {
        Ok(()) => {
            let check = match fs::read(&marker).await {
                Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
                Ok(_) => CheckStatus::failed("marker content mismatch".into()),
                Err(e) => CheckStatus::failed(format!("could not read marker: {e}")),
            };
            if let Err(e) = fs::remove_file(&marker).await {
                tracing::debug!(path = %marker.display(), error = %e, "failed to remove readiness marker");
            }
            check
        }
        Err(e) => CheckStatus::failed(format!("could not write marker: {e}")),
    };

    let ready = sqlite.ok && disk.ok;
    let checks = HashMap::from([("sqlite", sqlite), ("disk", disk)]);
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
