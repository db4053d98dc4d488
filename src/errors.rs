use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::{
    daemons::replicator::HireError,
    db::StoreError,
    network::NetworkError,
    services::{restore::RestoreError, storage_service::StorageError},
};

/// Seconds a client should wait before retrying a read whose restore is still running.
pub const RESTORE_RETRY_AFTER_SECS: u64 = 5;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Sent as `Retry-After` when set.
    pub retry_after: Option<u64>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
        StoreError::Integrity(_) | StoreError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn network_status(err: &NetworkError) -> StatusCode {
    match err {
        NetworkError::NotFound(_) => StatusCode::NOT_FOUND,
        NetworkError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        err if err.is_retriable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::BucketNotFound(_) | StorageError::ObjectNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            StorageError::BucketAlreadyExists(_)
            | StorageError::ObjectAlreadyExists { .. }
            | StorageError::BucketNotEmpty(_) => StatusCode::CONFLICT,
            StorageError::InvalidBucketName { .. }
            | StorageError::InvalidObjectKey
            | StorageError::InvalidReplicas(_)
            | StorageError::BadDigest => StatusCode::BAD_REQUEST,
            StorageError::Store(store) => store_status(store),
            StorageError::Network(network) => network_status(network),
            StorageError::Restore(restore) => match restore {
                RestoreError::Store(store) => store_status(store),
                RestoreError::Network(network) => network_status(network),
                RestoreError::Timeout { .. } | RestoreError::Interrupted(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                RestoreError::Integrity { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            StorageError::Hire(hire) => match hire {
                HireError::Exhausted(_) => StatusCode::CONFLICT,
                HireError::Hire { source, .. } => network_status(source),
                HireError::Store(store) => store_status(store),
            },
            StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let retriable = matches!(&err, StorageError::Restore(restore) if restore.is_retriable());
        let app = AppError::new(status, err.to_string());
        if retriable {
            app.with_retry_after(RESTORE_RETRY_AFTER_SECS)
        } else {
            app
        }
    }
}
