use futures::future::join_all;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::shard::Shard;

/// A fixed set of workers running the same loop body, one shard each.
pub struct WorkerPool {
    name: &'static str,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers (at least one). Each gets a clone of the pool's
    /// token, which is a child of `parent`, and its own shard.
    pub fn start<F, Fut>(
        name: &'static str,
        parent: &CancellationToken,
        count: usize,
        body: F,
    ) -> Self
    where
        F: Fn(CancellationToken, Shard) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let workers = Shard::all(count)
            .map(|shard| tokio::spawn(body(cancel.clone(), shard)))
            .collect::<Vec<_>>();

        info!(pool = name, workers = workers.len(), "worker pool started");
        Self {
            name,
            cancel,
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal cancellation and wait until every worker has returned.
    pub async fn stop(self) {
        self.cancel.cancel();
        for result in join_all(self.workers).await {
            if let Err(err) = result {
                error!(pool = self.name, error = %err, "worker panicked");
            }
        }
        info!(pool = self.name, "worker pool stopped");
    }
}
