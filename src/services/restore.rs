//! Restore jobs: bringing an offloaded object's bytes back onto this host.
//!
//! Every restore is recorded as a job row. The network download always runs
//! on its own task, so a caller that gives up waiting (a dropped HTTP request)
//! never cancels the transfer or leaves the job unfinished.

use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    db::{StateStore, StoreError, StoreResult},
    models::{download::DownloadJob, object::Object},
    network::{NetworkError, StorageNetwork},
};

pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("restore of object {object_id} timed out (job {job_id}); retry later")]
    Timeout { object_id: i64, job_id: i64 },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("object {object_id} has a malformed bag id: {reason}")]
    Integrity { object_id: i64, reason: String },
    #[error("restore job {0} was interrupted")]
    Interrupted(i64),
}

impl RestoreError {
    /// Whether the caller should retry later rather than treat the object as lost.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Interrupted(_) => true,
            Self::Network(err) => err.is_retriable(),
            Self::Store(_) | Self::Integrity { .. } => false,
        }
    }
}

pub type RestoreResult<T> = Result<T, RestoreError>;

#[derive(Clone)]
pub struct RestoreTracker {
    store: StateStore,
    network: Arc<dyn StorageNetwork>,
    timeout: Duration,
}

impl RestoreTracker {
    pub fn new(store: StateStore, network: Arc<dyn StorageNetwork>, timeout: Duration) -> Self {
        Self {
            store,
            network,
            timeout,
        }
    }

    pub async fn start_job(&self, object_id: i64) -> StoreResult<DownloadJob> {
        let job = self.store.start_download_job(object_id).await?;
        info!(job_id = job.id, object_id, "restore job started");
        Ok(job)
    }

    /// Close a job. Success also flags the object as locally available.
    pub async fn finish_job(
        &self,
        job_id: i64,
        success: bool,
        error_msg: Option<&str>,
    ) -> StoreResult<bool> {
        let finished = self
            .store
            .finish_download_job(job_id, success, error_msg)
            .await?;
        if finished {
            if success {
                info!(job_id, "restore job completed");
            } else {
                warn!(job_id, error = error_msg.unwrap_or_default(), "restore job failed");
            }
        }
        Ok(finished)
    }

    /// Start a restore in the background and return its job immediately.
    pub async fn restore(&self, object: &Object) -> RestoreResult<DownloadJob> {
        let job = self.start_job(object.id).await?;
        let tracker = self.clone();
        let object = object.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            // outcome is recorded on the job row
            let _ = tracker.run_job(&object, job_id).await;
        });
        Ok(job)
    }

    /// Path of the object's bytes on this host, restoring them first if needed.
    ///
    /// Blocks for at most the tracker timeout. A timeout is retriable: the
    /// job is marked failed but the download keeps running and a later call
    /// will find the file.
    pub async fn fetch(&self, object: &Object) -> RestoreResult<PathBuf> {
        let bag = object.bag().map_err(|err| RestoreError::Integrity {
            object_id: object.id,
            reason: err.to_string(),
        })?;
        if let Some(path) = self.network.local_file(&bag, object.file_name()).await {
            return Ok(path);
        }

        let job = self.start_job(object.id).await?;
        let tracker = self.clone();
        let owned = object.clone();
        let job_id = job.id;
        tokio::spawn(async move { tracker.run_job(&owned, job_id).await })
            .await
            .map_err(|_| RestoreError::Interrupted(job_id))?
    }

    async fn run_job(&self, object: &Object, job_id: i64) -> RestoreResult<PathBuf> {
        let outcome = self.download(object, job_id).await;
        let finished = match &outcome {
            Ok(_) => self.finish_job(job_id, true, None).await,
            Err(err) => self.finish_job(job_id, false, Some(&err.to_string())).await,
        };
        if let Err(err) = finished {
            warn!(job_id, error = %err, "failed to record restore outcome");
        }
        outcome
    }

    async fn download(&self, object: &Object, job_id: i64) -> RestoreResult<PathBuf> {
        let bag = object.bag().map_err(|err| RestoreError::Integrity {
            object_id: object.id,
            reason: err.to_string(),
        })?;

        self.network.download_bag(&bag).await?;
        self.network
            .wait_for_file(&bag, object.file_name(), self.timeout)
            .await
            .map_err(|err| match err {
                NetworkError::Timeout(_) => RestoreError::Timeout {
                    object_id: object.id,
                    job_id,
                },
                other => RestoreError::Network(other),
            })
    }
}
