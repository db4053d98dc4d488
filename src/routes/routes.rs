//! HTTP surface.
//!
//! - **Health**: `GET /healthz`, `GET /readyz`
//! - **Admin** (JSON, under `/api/v1`)
//!   - `GET    /objects`                  — list objects (`limit`, `offset`)
//!   - `GET    /objects/{id}`             — object with contracts
//!   - `DELETE /objects/{id}`             — delete object, release custodians
//!   - `POST   /objects/{id}/restore`     — start a restore, returns the job
//!   - `POST   /objects/{id}/replicate`   — hire one more custodian
//!   - `GET    /objects/{id}/stats`       — transfer stats of the bag
//!   - `GET    /jobs/{id}`                — restore job state
//!   - `POST   /contracts/{id}/audit`     — audit one custodian now
//!   - `POST   /contracts/{id}/withdraw`  — remove custodian, fail contract
//!   - `POST   /upload`                   — multipart upload
//! - **S3-style**
//!   - `GET|PUT|DELETE /{bucket}`
//!   - `PUT|GET|HEAD|DELETE /{bucket}/{*key}`
//!
//! The admin router is nested before the bucket routes, so `api` is not
//! usable as a bucket name.

use crate::{
    handlers::{
        admin_handlers,
        health_handlers::{healthz, readyz},
        object_handlers::{
            create_bucket, delete_bucket, delete_object, get_object, head_object, list_objects,
            upload_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// JSON admin routes, relative to `/api/v1`.
pub fn admin_routes() -> Router<StorageService> {
    Router::new()
        .route("/objects", get(admin_handlers::list_objects))
        .route(
            "/objects/{id}",
            get(admin_handlers::get_object).delete(admin_handlers::delete_object),
        )
        .route("/objects/{id}/restore", post(admin_handlers::restore_object))
        .route(
            "/objects/{id}/replicate",
            post(admin_handlers::replicate_object),
        )
        .route("/objects/{id}/stats", get(admin_handlers::object_stats))
        .route("/jobs/{id}", get(admin_handlers::get_job))
        .route("/contracts/{id}/audit", post(admin_handlers::audit_contract))
        .route(
            "/contracts/{id}/withdraw",
            post(admin_handlers::withdraw_contract),
        )
        .route(
            "/upload",
            post(admin_handlers::upload_form).layer(DefaultBodyLimit::disable()),
        )
}

/// Build the full router. State (`StorageService`) is attached by the caller.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/api/v1", admin_routes())
        .route(
            "/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        .route(
            "/{bucket}",
            get(list_objects).put(create_bucket).delete(delete_bucket),
        )
}
