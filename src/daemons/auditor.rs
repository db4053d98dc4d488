//! Verifies custodian health and drives the contract and object state machines.

use async_trait::async_trait;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use super::reconcile::{Backoff, Reconciler};
use crate::{
    db::{AUDIT_BATCH, StateStore, StoreResult},
    models::contract::{ContractStatus, ContractWithBag},
    network::{AuditReport, BagId, StorageNetwork},
    shard::Shard,
};

/// Contracts checked more recently than this are not due.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(10 * 60);

pub struct Auditor {
    store: StateStore,
    network: Arc<dyn StorageNetwork>,
    staleness: chrono::Duration,
}

impl Auditor {
    pub fn new(store: StateStore, network: Arc<dyn StorageNetwork>, staleness: Duration) -> Self {
        Self {
            store,
            network,
            staleness: chrono::Duration::from_std(staleness).unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    async fn on_healthy(&self, item: &ContractWithBag) -> StoreResult<()> {
        let contract = &item.contract;
        if contract.status != ContractStatus::Pending {
            return self.store.touch_contract(contract.id).await;
        }

        if self.store.promote_contract(contract.id).await? {
            info!(contract_id = contract.id, object_id = contract.object_id, custodian = %contract.provider_addr, "contract active");
        }
        if self
            .store
            .upgrade_object_if_replicated(contract.object_id)
            .await?
        {
            info!(object_id = contract.object_id, "object fully replicated");
        }
        Ok(())
    }

    async fn on_unhealthy(
        &self,
        item: &ContractWithBag,
        bag: &BagId,
        report: &AuditReport,
    ) -> StoreResult<()> {
        let contract = &item.contract;
        warn!(
            contract_id = contract.id,
            custodian = %contract.provider_addr,
            status = %report.status,
            reason = %report.reason,
            "custodian unhealthy"
        );

        // Local bookkeeping goes ahead whatever happens on-chain.
        match self
            .network
            .remove_custodian(bag, &contract.provider_addr)
            .await
        {
            Ok(tx) => info!(contract_id = contract.id, tx = %tx, "custodian removed"),
            Err(err) => warn!(contract_id = contract.id, error = %err, "custodian removal failed"),
        }

        if self.store.mark_contract_failed(contract.id).await? {
            info!(contract_id = contract.id, "contract failed");
        }
        if self
            .store
            .downgrade_object_if_underreplicated(contract.object_id)
            .await?
        {
            info!(object_id = contract.object_id, "object below target replicas");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for Auditor {
    type Item = ContractWithBag;

    fn name(&self) -> &'static str {
        "auditor"
    }

    async fn fetch_batch(&mut self, shard: Shard) -> StoreResult<Vec<ContractWithBag>> {
        let stale_before = Utc::now() - self.staleness;
        self.store
            .contracts_due_for_audit(shard, stale_before, AUDIT_BATCH)
            .await
    }

    async fn process(&mut self, item: ContractWithBag) {
        let contract_id = item.contract.id;

        let bag: BagId = match item.bag_id.parse() {
            Ok(bag) => bag,
            Err(err) => {
                warn!(contract_id, bag = %item.bag_id, error = %err, "contract points at malformed bag id");
                // keep it from pinning the head of the queue
                if let Err(err) = self.store.touch_contract(contract_id).await {
                    error!(contract_id, error = %err, "failed to touch contract");
                }
                return;
            }
        };

        let report = match self
            .network
            .audit_custodian(&bag, &item.contract.provider_addr)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                warn!(contract_id, custodian = %item.contract.provider_addr, error = %err, "audit failed; retrying next pass");
                return;
            }
        };

        let outcome = if report.healthy {
            self.on_healthy(&item).await
        } else {
            self.on_unhealthy(&item, &bag, &report).await
        };
        if let Err(err) = outcome {
            error!(contract_id, error = %err, "failed to record audit result");
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
        daemons::reconcile::run_pass,
        models::object::ObjectStatus,
        network::mock::MockNetwork,
        test_support::{add_contract, memory_store, new_object, set_last_check},
    };
    use tokio_util::sync::CancellationToken;

    fn stale_proof() -> AuditReport {
        AuditReport {
            healthy: false,
            status: "outdated".into(),
            reason: "stale proof".into(),
            last_proof_age_secs: Some(200_000),
        }
    }

    async fn due(store: &StateStore, contract_id: i64) {
        set_last_check(store, contract_id, Utc::now() - chrono::Duration::hours(1)).await;
    }

    fn auditor(store: &StateStore, network: &Arc<MockNetwork>) -> Auditor {
        Auditor::new(store.clone(), network.clone(), DEFAULT_STALENESS)
    }

    #[tokio::test]
    async fn healthy_pending_contract_promotes_and_upgrades_object() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        let object = store.create_object(&new_object("b", "k", 1)).await.unwrap();
        let contract = add_contract(&store, object.id, "P1", "pending").await;
        due(&store, contract).await;

        run_pass(&mut auditor(&store, &network), Shard::whole(), &CancellationToken::new()).await;

        let loaded = store.get_contract(contract).await.unwrap();
        assert_eq!(loaded.contract.status, ContractStatus::Active);
        assert_eq!(
            store.get_object(object.id).await.unwrap().status,
            ObjectStatus::Active
        );
    }

    #[tokio::test]
    async fn healthy_active_contract_only_refreshes_last_check() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        let object = store.create_object(&new_object("b", "k", 2)).await.unwrap();
        let contract = add_contract(&store, object.id, "P1", "active").await;
        due(&store, contract).await;
        let before = store.get_contract(contract).await.unwrap().contract.last_check;

        run_pass(&mut auditor(&store, &network), Shard::whole(), &CancellationToken::new()).await;

        let after = store.get_contract(contract).await.unwrap().contract;
        assert_eq!(after.status, ContractStatus::Active);
        assert!(after.last_check > before);
        assert_eq!(
            store.get_object(object.id).await.unwrap().status,
            ObjectStatus::Pending
        );
    }

    #[tokio::test]
    async fn stale_proof_evicts_last_custodian_and_downgrades_object() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        let object = store.create_object(&new_object("b", "k", 1)).await.unwrap();
        let contract = add_contract(&store, object.id, "P1", "active").await;
        assert!(store.upgrade_object_if_replicated(object.id).await.unwrap());
        due(&store, contract).await;
        network.script_audit("P1", stale_proof());

        run_pass(&mut auditor(&store, &network), Shard::whole(), &CancellationToken::new()).await;

        assert_eq!(network.removed_custodians(), vec!["P1".to_string()]);
        assert_eq!(
            store.get_contract(contract).await.unwrap().contract.status,
            ContractStatus::Failed
        );
        assert_eq!(
            store.get_object(object.id).await.unwrap().status,
            ObjectStatus::Pending
        );
    }

    #[tokio::test]
    async fn failed_removal_still_marks_contract_failed() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        network.state().failing_removals = true;
        let object = store.create_object(&new_object("b", "k", 1)).await.unwrap();
        let contract = add_contract(&store, object.id, "P1", "pending").await;
        due(&store, contract).await;
        network.script_audit("P1", AuditReport::missing());

        run_pass(&mut auditor(&store, &network), Shard::whole(), &CancellationToken::new()).await;

        assert_eq!(
            store.get_contract(contract).await.unwrap().contract.status,
            ContractStatus::Failed
        );
    }

    #[tokio::test]
    async fn unreachable_audit_leaves_contract_due() {
        let store = memory_store().await;
        let network = Arc::new(MockNetwork::new(std::env::temp_dir()));
        network.state().audit_errors.insert("P1".into());
        let object = store.create_object(&new_object("b", "k", 1)).await.unwrap();
        let contract = add_contract(&store, object.id, "P1", "active").await;
        due(&store, contract).await;

        let mut auditor = auditor(&store, &network);
        run_pass(&mut auditor, Shard::whole(), &CancellationToken::new()).await;

        let loaded = store.get_contract(contract).await.unwrap().contract;
        assert_eq!(loaded.status, ContractStatus::Active);
        assert!(network.removed_custodians().is_empty());
        let still_due = auditor.fetch_batch(Shard::whole()).await.unwrap();
        assert_eq!(still_due.len(), 1);
    }
}
