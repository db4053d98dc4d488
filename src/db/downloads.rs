use chrono::Utc;

use super::{StateStore, StoreError, StoreResult};
use crate::models::download::DownloadJob;

const JOB_COLUMNS: &str = "id, object_id, status, error_msg, started_at, finished_at";

/// Error text recorded on jobs left `running` by a previous process.
pub const INTERRUPTED_JOB_MSG: &str = "Server restarted/crashed";

impl StateStore {
    pub async fn start_download_job(&self, object_id: i64) -> StoreResult<DownloadJob> {
        let sql = format!(
            "INSERT INTO downloads (object_id, status, started_at)
             VALUES (?, 'running', ?)
             RETURNING {JOB_COLUMNS}"
        );
        let job = sqlx::query_as::<_, DownloadJob>(&sql)
            .bind(object_id)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await?;
        Ok(job)
    }

    /// Close a running job. On success the object is flagged as local again in
    /// the same transaction; its replication status is left alone.
    ///
    /// Returns false if the job was not running (already finished or reset).
    pub async fn finish_download_job(
        &self,
        job_id: i64,
        success: bool,
        error_msg: Option<&str>,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        let status = if success { "completed" } else { "failed" };

        let object_id: Option<i64> = sqlx::query_scalar(
            "UPDATE downloads SET status = ?, error_msg = ?, finished_at = ?
             WHERE id = ? AND status = 'running'
             RETURNING object_id",
        )
        .bind(status)
        .bind(error_msg)
        .bind(Utc::now())
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(object_id) = object_id else {
            return Ok(false);
        };

        if success {
            sqlx::query("UPDATE objects SET is_local = 1 WHERE id = ? AND status != 'deleted'")
                .bind(object_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_download_job(&self, job_id: i64) -> StoreResult<DownloadJob> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM downloads WHERE id = ?");
        sqlx::query_as::<_, DownloadJob>(&sql)
            .bind(job_id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| StoreError::from_lookup(err, "download job", job_id))
    }

    pub async fn is_object_downloading(&self, object_id: i64) -> StoreResult<bool> {
        let running: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM downloads WHERE object_id = ? AND status = 'running')",
        )
        .bind(object_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(running)
    }

    /// Fail every job still marked running. Called once at startup, before any
    /// loop or request can start a new job.
    pub async fn reset_stuck_downloads(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE downloads SET status = 'failed', error_msg = ?, finished_at = ?
             WHERE status = 'running'",
        )
        .bind(INTERRUPTED_JOB_MSG)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }
}
