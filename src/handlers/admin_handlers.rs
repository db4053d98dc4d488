//! JSON admin surface mounted under `/api/v1`.
//!
//! Thin wrappers over `StorageService`: every handler resolves ids from the
//! path, calls one service operation and serialises the row it gets back.

use crate::{errors::AppError, services::storage_service::StorageService};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `GET /api/v1/objects?limit&offset`, newest first.
pub async fn list_objects(
    State(service): State<StorageService>,
    Query(q): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let objects = service
        .list_all_objects(q.limit.unwrap_or(100), q.offset.unwrap_or(0))
        .await?;
    Ok(Json(objects))
}

/// `GET /api/v1/objects/{id}` with contracts and restore state.
pub async fn get_object(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.object_details(id).await?))
}

pub async fn delete_object(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let object = service.delete_object_by_id(id).await?;
    Ok(Json(json!({ "deleted": object.id })))
}

/// `POST /api/v1/objects/{id}/restore`: 202 with the job to poll.
pub async fn restore_object(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let job = service.restore_object(id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn get_job(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.download_job(id).await?))
}

/// `POST /api/v1/objects/{id}/replicate`: hire one more custodian now.
pub async fn replicate_object(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let contract = service.replicate_object(id).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

pub async fn object_stats(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.object_stats(id).await?))
}

pub async fn audit_contract(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.audit_contract(id).await?))
}

pub async fn withdraw_contract(
    State(service): State<StorageService>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(service.withdraw_contract(id).await?))
}

/// `POST /api/v1/upload` as `multipart/form-data`.
///
/// Text fields `bucket`, `key` and `replicas` must precede the `file` field;
/// `key` defaults to the uploaded file name.
pub async fn upload_form(
    State(service): State<StorageService>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let bad_request = |msg: String| AppError::new(StatusCode::BAD_REQUEST, msg);

    let mut bucket: Option<String> = None;
    let mut key: Option<String> = None;
    let mut replicas: Option<i64> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "bucket" => bucket = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?),
            "key" => key = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?),
            "replicas" => {
                let raw = field.text().await.map_err(|e| bad_request(e.to_string()))?;
                replicas = Some(
                    raw.trim()
                        .parse()
                        .map_err(|_| bad_request(format!("replicas must be an integer, got `{raw}`")))?,
                );
            }
            "file" => {
                let bucket = bucket
                    .clone()
                    .ok_or_else(|| bad_request("`bucket` must come before `file`".into()))?;
                let key = key
                    .clone()
                    .or_else(|| field.file_name().map(str::to_string))
                    .ok_or_else(|| bad_request("missing `key` and file name".into()))?;

                let stream = field.map_err(io::Error::other);
                let object = service
                    .upload_object_stream(&bucket, &key, replicas, None, stream)
                    .await?;
                return Ok((StatusCode::CREATED, Json(object)));
            }
            _ => {}
        }
    }

    Err(bad_request("missing `file` field".into()))
}
