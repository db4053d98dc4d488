//! Durable state: objects, contracts, restore jobs and buckets in SQLite.
//!
//! Every status change is a conditional `UPDATE ... WHERE status = ...` and
//! reports whether it applied, so concurrent auditors and replicators can race
//! over the same rows without in-process locks. Timestamps are always bound
//! from Rust so stored values share one format and compare correctly.

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::debug;

mod buckets;
mod contracts;
mod downloads;
mod objects;

/// Schema applied at startup and by `--migrate`.
pub const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Page sizes for the loop queries.
pub const REPLICATION_BATCH: i64 = 50;
pub const AUDIT_BATCH: i64 = 20;
pub const CLEANING_BATCH: i64 = 50;
pub const PING_BATCH: i64 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("corrupt record: {0}")]
    Integrity(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Map `RowNotFound` onto a typed not-found error, leave everything else alone.
    pub(crate) fn from_lookup(err: sqlx::Error, entity: &'static str, id: impl ToString) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found(entity, id),
            other => Self::Sqlx(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the state store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct StateStore {
    pub db: Arc<SqlitePool>,
}

impl StateStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if needed) the database at `url` with foreign keys on.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Run every statement of [`SCHEMA`]. Statements are idempotent.
    pub async fn apply_schema(&self) -> StoreResult<usize> {
        let statements = schema_statements(SCHEMA);
        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }
}

/// Split a schema file into statements. `--` comment lines are dropped
/// first so a `;` inside a comment cannot end a statement.
fn schema_statements(sql: &str) -> Vec<String> {
    let code = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    code.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
