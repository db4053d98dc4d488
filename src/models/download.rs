//! Restore (download) job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// One attempt to bring an object's bytes back onto this host.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DownloadJob {
    pub id: i64,
    pub object_id: i64,
    pub status: JobStatus,
    pub error_msg: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
