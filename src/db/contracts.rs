use chrono::{DateTime, Utc};

use super::{StateStore, StoreError, StoreResult};
use crate::{
    models::contract::{Contract, ContractWithBag, NewContract},
    shard::Shard,
};

const CONTRACT_COLUMNS: &str =
    "id, object_id, provider_addr, contract_addr, balance_nano, status, last_check, created_at";

const JOINED_COLUMNS: &str = "c.id, c.object_id, c.provider_addr, c.contract_addr, c.balance_nano,
     c.status, c.last_check, c.created_at, o.bag_id";

impl StateStore {
    /// Record a hire as a `pending` contract. Its `last_check` starts at creation
    /// so a brand-new contract is not audited immediately.
    pub async fn register_contract(&self, new: &NewContract) -> StoreResult<Contract> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO contracts (object_id, provider_addr, contract_addr, balance_nano, status, last_check, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)
             RETURNING {CONTRACT_COLUMNS}"
        );
        let contract = sqlx::query_as::<_, Contract>(&sql)
            .bind(new.object_id)
            .bind(&new.provider_addr)
            .bind(&new.contract_addr)
            .bind(new.balance_nano)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await?;
        Ok(contract)
    }

    /// `pending -> active`. Returns whether the contract changed.
    pub async fn promote_contract(&self, contract_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE contracts SET status = 'active', last_check = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(contract_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `{pending, active} -> failed`. Failed is terminal, so a second call is a no-op.
    pub async fn mark_contract_failed(&self, contract_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE contracts SET status = 'failed', last_check = ?
             WHERE id = ? AND status IN ('pending', 'active')",
        )
        .bind(Utc::now())
        .bind(contract_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh `last_check` without changing status.
    pub async fn touch_contract(&self, contract_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE contracts SET last_check = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(contract_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn get_contract(&self, contract_id: i64) -> StoreResult<ContractWithBag> {
        let sql = format!(
            "SELECT {JOINED_COLUMNS}
             FROM contracts c JOIN objects o ON o.id = c.object_id
             WHERE c.id = ?"
        );
        sqlx::query_as::<_, ContractWithBag>(&sql)
            .bind(contract_id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| StoreError::from_lookup(err, "contract", contract_id))
    }

    /// Every contract ever made for an object, oldest first.
    pub async fn object_contracts(&self, object_id: i64) -> StoreResult<Vec<Contract>> {
        let sql = format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE object_id = ? ORDER BY id");
        let rows = sqlx::query_as::<_, Contract>(&sql)
            .bind(object_id)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Live contracts in `shard` not checked since `stale_before`, least recently
    /// checked first, on objects that are not deleted.
    pub async fn contracts_due_for_audit(
        &self,
        shard: Shard,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<ContractWithBag>> {
        let sql = format!(
            "SELECT {JOINED_COLUMNS}
             FROM contracts c JOIN objects o ON o.id = c.object_id
             WHERE c.status IN ('pending', 'active')
               AND o.status != 'deleted'
               AND c.last_check < ?
               AND c.id % ? = ?
             ORDER BY c.last_check ASC
             LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ContractWithBag>(&sql)
            .bind(stale_before)
            .bind(shard.count() as i64)
            .bind(shard.index() as i64)
            .bind(limit)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Active contracts in `shard` created before `created_before` with id above
    /// `after_id`, in id order. Pingers page through with the last id they saw.
    pub async fn active_contracts(
        &self,
        shard: Shard,
        created_before: DateTime<Utc>,
        after_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<ContractWithBag>> {
        let sql = format!(
            "SELECT {JOINED_COLUMNS}
             FROM contracts c JOIN objects o ON o.id = c.object_id
             WHERE c.status = 'active'
               AND o.status != 'deleted'
               AND c.created_at < ?
               AND c.id > ?
               AND c.id % ? = ?
             ORDER BY c.id
             LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ContractWithBag>(&sql)
            .bind(created_before)
            .bind(after_id)
            .bind(shard.count() as i64)
            .bind(shard.index() as i64)
            .bind(limit)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    pub async fn count_active_contracts(&self, object_id: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM contracts WHERE object_id = ? AND status = 'active'",
        )
        .bind(object_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        db::AUDIT_BATCH,
        models::contract::{ContractStatus, NewContract},
        shard::Shard,
        test_support::{add_contract, memory_store, new_object, set_last_check},
    };
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn contract_transitions_never_leave_failed() {
        let store = memory_store().await;
        let object = store.create_object(&new_object("b", "k", 1)).await.unwrap();
        let contract = store
            .register_contract(&NewContract {
                object_id: object.id,
                provider_addr: "P1".into(),
                contract_addr: "C1".into(),
                balance_nano: 200_000_000,
            })
            .await
            .unwrap();
        assert_eq!(contract.status, ContractStatus::Pending);

        assert!(store.promote_contract(contract.id).await.unwrap());
        assert!(!store.promote_contract(contract.id).await.unwrap());

        assert!(store.mark_contract_failed(contract.id).await.unwrap());
        assert!(!store.mark_contract_failed(contract.id).await.unwrap());
        assert!(!store.promote_contract(contract.id).await.unwrap());

        let loaded = store.get_contract(contract.id).await.unwrap();
        assert_eq!(loaded.contract.status, ContractStatus::Failed);
        assert_eq!(loaded.bag_id, object.bag_id);
    }

    #[tokio::test]
    async fn audit_queue_is_stalest_first_and_skips_fresh_and_failed() {
        let store = memory_store().await;
        let object = store.create_object(&new_object("b", "k", 3)).await.unwrap();
        let now = Utc::now();

        let older = add_contract(&store, object.id, "P1", "active").await;
        let oldest = add_contract(&store, object.id, "P2", "pending").await;
        let fresh = add_contract(&store, object.id, "P3", "active").await;
        let failed = add_contract(&store, object.id, "P4", "failed").await;

        set_last_check(&store, older, now - Duration::minutes(20)).await;
        set_last_check(&store, oldest, now - Duration::minutes(40)).await;
        set_last_check(&store, fresh, now).await;
        set_last_check(&store, failed, now - Duration::hours(1)).await;

        let due: Vec<i64> = store
            .contracts_due_for_audit(Shard::whole(), now - Duration::minutes(10), AUDIT_BATCH)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.contract.id)
            .collect();
        assert_eq!(due, vec![oldest, older]);
    }

    #[tokio::test]
    async fn deleted_objects_drop_out_of_audit_queue() {
        let store = memory_store().await;
        let object = store.create_object(&new_object("b", "k", 1)).await.unwrap();
        let contract = add_contract(&store, object.id, "P1", "active").await;
        set_last_check(&store, contract, Utc::now() - Duration::hours(1)).await;

        store.delete_object(object.id).await.unwrap();

        assert!(
            store
                .contracts_due_for_audit(Shard::whole(), Utc::now(), AUDIT_BATCH)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
