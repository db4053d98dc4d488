//! Fixtures shared by the unit tests.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;

use crate::{db::StateStore, models::object::NewObject, network::BagId};

/// Fresh in-memory store with the schema applied.
///
/// A single connection keeps every query on the same in-memory database.
pub async fn memory_store() -> StateStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await
        .unwrap();
    let store = StateStore::new(Arc::new(pool));
    store.apply_schema().await.unwrap();
    store
}

/// Deterministic bag id derived from a key.
pub fn bag_for(key: &str) -> BagId {
    use sha2::{Digest, Sha256};
    BagId::from_bytes(Sha256::digest(key.as_bytes()).into())
}

pub fn new_object(bucket: &str, key: &str, target_replicas: i64) -> NewObject {
    NewObject {
        bucket_name: bucket.into(),
        object_key: key.into(),
        bag_id: bag_for(&format!("{bucket}/{key}")),
        size_bytes: 42,
        target_replicas,
    }
}

/// Insert a contract in an arbitrary status and return its id.
pub async fn add_contract(store: &StateStore, object_id: i64, provider: &str, status: &str) -> i64 {
    let now = Utc::now();
    sqlx::query_scalar(
        "INSERT INTO contracts (object_id, provider_addr, contract_addr, balance_nano, status, last_check, created_at)
         VALUES (?, ?, ?, 200000000, ?, ?, ?)
         RETURNING id",
    )
    .bind(object_id)
    .bind(provider)
    .bind(format!("contract-{provider}-{object_id}"))
    .bind(status)
    .bind(now)
    .bind(now)
    .fetch_one(&*store.db)
    .await
    .unwrap()
}

pub async fn set_last_check(store: &StateStore, contract_id: i64, at: DateTime<Utc>) {
    sqlx::query("UPDATE contracts SET last_check = ?, created_at = ? WHERE id = ?")
        .bind(at)
        .bind(at)
        .bind(contract_id)
        .execute(&*store.db)
        .await
        .unwrap();
}

pub async fn backdate_object(store: &StateStore, object_id: i64, at: DateTime<Utc>) {
    sqlx::query("UPDATE objects SET created_at = ? WHERE id = ?")
        .bind(at)
        .bind(object_id)
        .execute(&*store.db)
        .await
        .unwrap();
}
