//! Lightweight liveness checks for active contracts. Observes and logs only.

use async_trait::async_trait;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use super::reconcile::{Backoff, Reconciler};
use crate::{
    db::{PING_BATCH, StateStore, StoreResult},
    models::contract::ContractWithBag,
    network::{BagId, StorageNetwork},
    shard::Shard,
};

/// Contracts younger than this are still settling and are not pinged.
pub const DEFAULT_MIN_CONTRACT_AGE: Duration = Duration::from_secs(12 * 60 * 60);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Pinger {
    store: StateStore,
    network: Arc<dyn StorageNetwork>,
    min_age: chrono::Duration,
    timeout: Duration,
    /// Highest contract id seen in the current sweep.
    cursor: i64,
}

impl Pinger {
    pub fn new(store: StateStore, network: Arc<dyn StorageNetwork>, min_age: Duration) -> Self {
        Self {
            store,
            network,
            min_age: chrono::Duration::from_std(min_age).unwrap_or_else(|_| chrono::Duration::days(365)),
            timeout: PING_TIMEOUT,
            cursor: 0,
        }
    }
}

#[async_trait]
impl Reconciler for Pinger {
    type Item = ContractWithBag;

    fn name(&self) -> &'static str {
        "pinger"
    }

    async fn fetch_batch(&mut self, shard: Shard) -> StoreResult<Vec<ContractWithBag>> {
        let created_before = Utc::now() - self.min_age;
        let batch = self
            .store
            .active_contracts(shard, created_before, self.cursor, PING_BATCH)
            .await?;
        match batch.last() {
            Some(last) => self.cursor = last.contract.id,
            // sweep finished; start over after the idle pause
            None => self.cursor = 0,
        }
        Ok(batch)
    }

    async fn process(&mut self, item: ContractWithBag) {
        let contract = &item.contract;
        let bag: BagId = match item.bag_id.parse() {
            Ok(bag) => bag,
            Err(err) => {
                warn!(contract_id = contract.id, error = %err, "contract points at malformed bag id");
                return;
            }
        };

        let ping = self.network.ping_custodian(&bag, &contract.provider_addr);
        match tokio::time::timeout(self.timeout, ping).await {
            Ok(Ok(())) => info!(contract_id = contract.id, custodian = %contract.provider_addr, "custodian alive"),
            Ok(Err(err)) => warn!(contract_id = contract.id, custodian = %contract.provider_addr, error = %err, "ping failed"),
            Err(_) => warn!(
                contract_id = contract.id,
                custodian = %contract.provider_addr,
                timeout_secs = self.timeout.as_secs(),
                "ping timed out"
            ),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            idle: Duration::from_secs(10),
            on_error: Duration::from_secs(5),
            between_passes: Duration::from_secs(5),
        }
    }
}
