//! Reclaims local disk for objects whose custodians hold enough copies.

use async_trait::async_trait;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use super::reconcile::{Backoff, Reconciler};
use crate::{
    db::{CLEANING_BATCH, StateStore, StoreResult},
    models::object::Object,
    network::StorageNetwork,
    shard::Shard,
};

pub const DEFAULT_MIN_AGE: Duration = Duration::from_secs(2 * 60);
pub const CLEANING_INTERVAL: Duration = Duration::from_secs(30);

pub struct Cleaner {
    store: StateStore,
    network: Arc<dyn StorageNetwork>,
    min_age: chrono::Duration,
}

impl Cleaner {
    pub fn new(store: StateStore, network: Arc<dyn StorageNetwork>, min_age: Duration) -> Self {
        Self {
            store,
            network,
            min_age: chrono::Duration::from_std(min_age).unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    async fn offload(&self, object: &Object) -> anyhow::Result<bool> {
        let bag = object.bag()?;

        // a restore may have started since the batch was read
        if self.store.is_object_downloading(object.id).await? {
            return Ok(false);
        }

        // identical uploads share the local directory
        if self.store.is_bag_pinned_by_others(&object.bag_id, object.id).await? {
            debug!(object_id = object.id, bag = %object.bag_id, "bag still needed by another object");
            return Ok(false);
        }

        self.network.delete_local_copy(&bag).await?;
        self.store.clear_bag_local(&object.bag_id).await?;
        Ok(true)
    }
}

#[async_trait]
impl Reconciler for Cleaner {
    type Item = Object;

    fn name(&self) -> &'static str {
        "cleaner"
    }

    async fn fetch_batch(&mut self, shard: Shard) -> StoreResult<Vec<Object>> {
        let created_before = Utc::now() - self.min_age;
        self.store
            .objects_ready_for_cleaning(shard, created_before, CLEANING_BATCH)
            .await
    }

    async fn process(&mut self, object: Object) {
        match self.offload(&object).await {
            Ok(true) => info!(object_id = object.id, bag = %object.bag_id, "local copy removed"),
            Ok(false) => {}
            Err(err) => {
                if err.is::<crate::network::BagIdError>() {
                    error!(object_id = object.id, bag = %object.bag_id, error = %err, "object has malformed bag id");
                } else {
                    warn!(object_id = object.id, error = %err, "failed to remove local copy");
                }
            }
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            idle: CLEANING_INTERVAL,
            on_error: CLEANING_INTERVAL,
            between_passes: CLEANING_INTERVAL,
        }
    }
}
