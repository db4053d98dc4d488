//! The loop shape shared by the replicator, auditor, pinger and cleaner.
//!
//! A loop fetches one batch for its shard, processes the items strictly in
//! order, then sleeps according to how the pass went. Cancellation is checked
//! around the fetch, between items and during every sleep, so stopping a pool
//! waits for at most one unit of work.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{db::StoreResult, shard::Shard};

/// Sleep lengths after a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// After a pass that found nothing to do.
    pub idle: Duration,
    /// After the batch query failed.
    pub on_error: Duration,
    /// After a pass that processed at least one item.
    pub between_passes: Duration,
}

#[async_trait]
pub trait Reconciler: Send {
    type Item: Send;

    fn name(&self) -> &'static str;

    /// Load the next batch of work owned by `shard`.
    async fn fetch_batch(&mut self, shard: Shard) -> StoreResult<Vec<Self::Item>>;

    /// Handle one item. Per-item failures are logged here and never abort the pass.
    async fn process(&mut self, item: Self::Item);

    fn backoff(&self) -> Backoff;
}

#[derive(Debug, PartialEq, Eq)]
pub enum PassOutcome {
    Processed(usize),
    Idle,
    Failed,
    Cancelled,
}

pub async fn run_pass<R: Reconciler>(
    reconciler: &mut R,
    shard: Shard,
    cancel: &CancellationToken,
) -> PassOutcome {
    let batch = tokio::select! {
        _ = cancel.cancelled() => return PassOutcome::Cancelled,
        batch = reconciler.fetch_batch(shard) => batch,
    };

    let items = match batch {
        Ok(items) => items,
        Err(err) => {
            error!(loop_name = reconciler.name(), worker = %shard, error = %err, "failed to fetch batch");
            return PassOutcome::Failed;
        }
    };

    if items.is_empty() {
        return PassOutcome::Idle;
    }

    let mut processed = 0;
    for item in items {
        if cancel.is_cancelled() {
            return PassOutcome::Cancelled;
        }
        reconciler.process(item).await;
        processed += 1;
    }
    PassOutcome::Processed(processed)
}

/// Run passes until `cancel` fires.
pub async fn run_loop<R: Reconciler>(mut reconciler: R, shard: Shard, cancel: CancellationToken) {
    debug!(loop_name = reconciler.name(), worker = %shard, "loop started");
    loop {
        let backoff = reconciler.backoff();
        let pause = match run_pass(&mut reconciler, shard, &cancel).await {
            PassOutcome::Processed(n) => {
                debug!(loop_name = reconciler.name(), worker = %shard, items = n, "pass complete");
                backoff.between_passes
            }
            PassOutcome::Idle => {
                debug!(loop_name = reconciler.name(), worker = %shard, "nothing to do");
                backoff.idle
            }
            PassOutcome::Failed => backoff.on_error,
            PassOutcome::Cancelled => break,
        };
        if !sleep_or_cancel(pause, &cancel).await {
            break;
        }
    }
    debug!(loop_name = reconciler.name(), worker = %shard, "loop stopped");
}

/// Sleep for `pause`; returns false if cancelled first.
pub async fn sleep_or_cancel(pause: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(pause) => true,
    }
}
