//! Closes the gap between live and target replica counts.

use async_trait::async_trait;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

use super::reconcile::{Backoff, Reconciler};
use crate::{
    db::{REPLICATION_BATCH, StateStore, StoreError, StoreResult},
    models::{
        contract::{Contract, NewContract},
        object::ReplicationCandidate,
    },
    network::{BagId, NetworkError, StorageNetwork},
    providers::{ProviderDirectory, ProviderError},
    shard::Shard,
};

/// Escrow paid per hire, in nano units.
pub const BASE_ESCROW_NANO: u64 = 200_000_000;
/// Upper bound (exclusive) of the random amount added to each escrow.
pub const MAX_ESCROW_JITTER_NANO: u64 = 100_000_000;

/// Escrow amount for one hire. The jitter keeps concurrent hires of one bag
/// from producing identical transactions.
pub fn escrow_with_jitter<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    BASE_ESCROW_NANO + rng.gen_range(0..MAX_ESCROW_JITTER_NANO)
}

#[derive(Debug, Error)]
pub enum HireError {
    #[error(transparent)]
    Exhausted(#[from] ProviderError),
    #[error("hiring {custodian} failed: {source}")]
    Hire {
        custodian: String,
        #[source]
        source: NetworkError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pick one custodian outside `exclude`, hire it and record a pending contract.
///
/// The chosen custodian is appended to `exclude` whether or not the hire
/// succeeds, so repeated calls for one object never retry the same custodian.
#[allow(clippy::too_many_arguments)]
pub async fn hire_one<R: Rng + Send + ?Sized>(
    store: &StateStore,
    network: &dyn StorageNetwork,
    providers: &ProviderDirectory,
    object_id: i64,
    bag: &BagId,
    exclude: &mut Vec<String>,
    amount_nano: u64,
    rng: &mut R,
) -> Result<Contract, HireError> {
    let custodian = providers.find_candidate(exclude, rng)?;
    exclude.push(custodian.clone());

    let contract_addr = network
        .hire_custodian(bag, &custodian, amount_nano)
        .await
        .map_err(|source| HireError::Hire {
            custodian: custodian.clone(),
            source,
        })?;

    let contract = store
        .register_contract(&NewContract {
            object_id,
            provider_addr: custodian.clone(),
            contract_addr: contract_addr.clone(),
            balance_nano: amount_nano as i64,
        })
        .await
        .inspect_err(|err| {
            error!(
                object_id,
                custodian = %custodian,
                contract = %contract_addr,
                error = %err,
                "custodian hired but contract not recorded"
            );
        })?;

    Ok(contract)
}

pub struct Replicator {
    store: StateStore,
    network: Arc<dyn StorageNetwork>,
    providers: Arc<ProviderDirectory>,
    rng: StdRng,
}

impl Replicator {
    pub fn new(
        store: StateStore,
        network: Arc<dyn StorageNetwork>,
        providers: Arc<ProviderDirectory>,
    ) -> Self {
        Self::with_rng(store, network, providers, StdRng::from_entropy())
    }

    pub fn with_rng(
        store: StateStore,
        network: Arc<dyn StorageNetwork>,
        providers: Arc<ProviderDirectory>,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            network,
            providers,
            rng,
        }
    }
}

#[async_trait]
impl Reconciler for Replicator {
    type Item = ReplicationCandidate;

    fn name(&self) -> &'static str {
        "replicator"
    }

    async fn fetch_batch(&mut self, shard: Shard) -> StoreResult<Vec<ReplicationCandidate>> {
        self.store
            .objects_needing_replication(shard, REPLICATION_BATCH)
            .await
    }

    async fn process(&mut self, candidate: ReplicationCandidate) {
        let object = &candidate.object;
        let deficit = candidate.deficit();
        if deficit <= 0 {
            return;
        }

        let bag = match object.bag() {
            Ok(bag) => bag,
            Err(err) => {
                warn!(object_id = object.id, bag = %object.bag_id, error = %err, "skipping object with malformed bag id");
                return;
            }
        };

        let mut exclude = candidate.used_providers();
        for _ in 0..deficit {
            let amount = escrow_with_jitter(&mut self.rng);
            match hire_one(
                &self.store,
                self.network.as_ref(),
                &self.providers,
                object.id,
                &bag,
                &mut exclude,
                amount,
                &mut self.rng,
            )
            .await
            {
                Ok(contract) => info!(
                    object_id = object.id,
                    contract_id = contract.id,
                    custodian = %contract.provider_addr,
                    amount_nano = amount,
                    "custodian hired"
                ),
                Err(HireError::Hire { custodian, source }) => {
                    warn!(object_id = object.id, custodian = %custodian, error = %source, "hire failed");
                }
                Err(err @ HireError::Exhausted(_)) => {
                    warn!(object_id = object.id, error = %err, "no custodian available");
                    break;
                }
                Err(HireError::Store(err)) => {
                    error!(object_id = object.id, error = %err, "failed to record contract");
                    break;
                }
            }
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff {
            idle: Duration::from_secs(10),
            on_error: Duration::from_secs(5),
            between_passes: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        daemons::reconcile::{PassOutcome, run_pass},
        models::contract::ContractStatus,
        network::mock::MockNetwork,
        providers::KNOWN_PROVIDERS,
        test_support::{memory_store, new_object},
    };
    use std::collections::HashSet;
    use tokio_util::sync::CancellationToken;

    fn directory(n: usize) -> Arc<ProviderDirectory> {
        Arc::new(ProviderDirectory::new(
            KNOWN_PROVIDERS[..n].iter().map(|s| s.to_string()).collect(),
            false,
        ))
    }

    fn replicator(
        store: &StateStore,
        network: &Arc<MockNetwork>,
        providers: Arc<ProviderDirectory>,
    ) -> Replicator {
        Replicator::with_rng(
            store.clone(),
            network.clone(),
            providers,
            StdRng::seed_from_u64(42),
        )
    }

    #[test]
    fn escrow_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let amount = escrow_with_jitter(&mut rng);
            assert!((BASE_ESCROW_NANO..BASE_ESCROW_NANO + MAX_ESCROW_JITTER_NANO).contains(&amount));
        }
    }

    #[tokio::test]
    async fn empty_object_gets_target_distinct_custodians() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        let object = store.create_object(&new_object("b", "k", 3)).await.unwrap();

        let mut r = replicator(&store, &network, directory(8));
        let cancel = CancellationToken::new();
        assert_eq!(
            run_pass(&mut r, Shard::whole(), &cancel).await,
            PassOutcome::Processed(1)
        );

        let hired = network.hired_custodians();
        assert_eq!(hired.len(), 3);
        assert_eq!(hired.iter().collect::<HashSet<_>>().len(), 3);

        let contracts = store.object_contracts(object.id).await.unwrap();
        assert_eq!(contracts.len(), 3);
        assert!(contracts.iter().all(|c| c.status == ContractStatus::Pending));

        // Deficit closed: the next pass has nothing to do.
        assert_eq!(run_pass(&mut r, Shard::whole(), &cancel).await, PassOutcome::Idle);
    }

    #[tokio::test]
    async fn failed_hire_is_not_retried_within_the_pass() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        network.fail_hire(KNOWN_PROVIDERS[1]);
        let object = store.create_object(&new_object("b", "k", 3)).await.unwrap();

        let mut r = replicator(&store, &network, directory(3));
        run_pass(&mut r, Shard::whole(), &CancellationToken::new()).await;

        let mut hired = network.hired_custodians();
        hired.sort();
        let mut expected = vec![KNOWN_PROVIDERS[0].to_string(), KNOWN_PROVIDERS[2].to_string()];
        expected.sort();
        assert_eq!(hired, expected);
        assert_eq!(store.object_contracts(object.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_directory_leaves_object_pending() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        let object = store.create_object(&new_object("b", "k", 3)).await.unwrap();

        let mut r = replicator(&store, &network, directory(2));
        let cancel = CancellationToken::new();
        run_pass(&mut r, Shard::whole(), &cancel).await;
        assert_eq!(network.hired_custodians().len(), 2);

        // Both known custodians already hold a contract; nothing new is hired.
        run_pass(&mut r, Shard::whole(), &cancel).await;
        assert_eq!(network.hired_custodians().len(), 2);
        assert_eq!(store.object_contracts(object.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_slot_is_refilled_even_from_a_small_directory() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        let object = store.create_object(&new_object("b", "k", 3)).await.unwrap();

        let mut r = replicator(&store, &network, directory(3));
        let cancel = CancellationToken::new();
        run_pass(&mut r, Shard::whole(), &cancel).await;
        let contracts = store.object_contracts(object.id).await.unwrap();
        assert_eq!(contracts.len(), 3);

        assert!(store.mark_contract_failed(contracts[0].id).await.unwrap());
        run_pass(&mut r, Shard::whole(), &cancel).await;

        let contracts = store.object_contracts(object.id).await.unwrap();
        let live: Vec<_> = contracts
            .iter()
            .filter(|c| c.status != ContractStatus::Failed)
            .collect();
        assert_eq!(live.len(), 3);
        let distinct: HashSet<_> = live.iter().map(|c| c.provider_addr.as_str()).collect();
        assert_eq!(distinct.len(), 3);
        // the only free custodian was the one whose contract failed
        assert_eq!(contracts[3].provider_addr, contracts[0].provider_addr);
    }

    #[tokio::test]
    async fn live_custodians_are_not_hired_twice() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        let object = store.create_object(&new_object("b", "k", 2)).await.unwrap();
        crate::test_support::add_contract(&store, object.id, KNOWN_PROVIDERS[0], "active").await;

        let mut r = replicator(&store, &network, directory(2));
        run_pass(&mut r, Shard::whole(), &CancellationToken::new()).await;

        assert_eq!(network.hired_custodians(), vec![KNOWN_PROVIDERS[1].to_string()]);
    }
}
