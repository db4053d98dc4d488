use chrono::{DateTime, Utc};

use super::{StateStore, StoreError, StoreResult, is_unique_violation};
use crate::{
    models::object::{NewObject, Object, ReplicationCandidate},
    shard::Shard,
};

const OBJECT_COLUMNS: &str =
    "id, bucket_name, object_key, bag_id, size_bytes, target_replicas, status, is_local, created_at";

impl StateStore {
    /// Record a freshly uploaded object as `pending` and locally present.
    pub async fn create_object(&self, new: &NewObject) -> StoreResult<Object> {
        let sql = format!(
            "INSERT INTO objects (bucket_name, object_key, bag_id, size_bytes, target_replicas, status, is_local, created_at)
             VALUES (?, ?, ?, ?, ?, 'pending', 1, ?)
             RETURNING {OBJECT_COLUMNS}"
        );
        sqlx::query_as::<_, Object>(&sql)
            .bind(&new.bucket_name)
            .bind(&new.object_key)
            .bind(new.bag_id.to_hex())
            .bind(new.size_bytes)
            .bind(new.target_replicas)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::AlreadyExists(format!(
                        "object `{}/{}`",
                        new.bucket_name, new.object_key
                    ))
                } else {
                    StoreError::Sqlx(err)
                }
            })
    }

    pub async fn get_object(&self, id: i64) -> StoreResult<Object> {
        let sql = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?");
        sqlx::query_as::<_, Object>(&sql)
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| StoreError::from_lookup(err, "object", id))
    }

    /// Look up the live (non-deleted) object stored under `bucket/key`.
    pub async fn find_object(&self, bucket: &str, key: &str) -> StoreResult<Object> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE bucket_name = ? AND object_key = ? AND status != 'deleted'"
        );
        sqlx::query_as::<_, Object>(&sql)
            .bind(bucket)
            .bind(key)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| StoreError::from_lookup(err, "object", format!("{bucket}/{key}")))
    }

    /// Newest-first page of live objects across all buckets.
    pub async fn list_objects(&self, limit: i64, offset: i64) -> StoreResult<Vec<Object>> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE status != 'deleted'
             ORDER BY created_at DESC, id DESC
             LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, Object>(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Key-ordered live objects of one bucket, for S3 listings.
    pub async fn list_bucket_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        after: Option<&str>,
        limit: i64,
    ) -> StoreResult<Vec<Object>> {
        let mut builder = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE status != 'deleted' AND bucket_name = "
        ));
        builder.push_bind(bucket);

        if let Some(prefix) = prefix {
            // substr comparison avoids LIKE wildcards inside user keys
            builder.push(" AND substr(object_key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix);
        }
        if let Some(after) = after {
            builder.push(" AND object_key > ");
            builder.push_bind(after);
        }

        builder.push(" ORDER BY object_key ASC LIMIT ");
        builder.push_bind(limit);

        let rows = builder
            .build_query_as::<Object>()
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    pub async fn count_live_objects(&self, bucket: &str) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM objects WHERE bucket_name = ? AND status != 'deleted'",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// Objects in `shard` whose `{pending, active}` contract count is below target.
    ///
    /// `used_providers` lists the custodians currently holding a `pending` or
    /// `active` contract for the object; failed custodians are eligible again.
    pub async fn objects_needing_replication(
        &self,
        shard: Shard,
        limit: i64,
    ) -> StoreResult<Vec<ReplicationCandidate>> {
        let rows = sqlx::query_as::<_, ReplicationCandidate>(
            "SELECT o.id, o.bucket_name, o.object_key, o.bag_id, o.size_bytes,
                    o.target_replicas, o.status, o.is_local, o.created_at,
                    COALESCE(SUM(CASE WHEN c.status IN ('pending', 'active') THEN 1 ELSE 0 END), 0)
                        AS live_replicas,
                    GROUP_CONCAT(CASE WHEN c.status IN ('pending', 'active')
                                      THEN c.provider_addr END) AS used_providers
             FROM objects o
             LEFT JOIN contracts c ON c.object_id = o.id
             WHERE o.status != 'deleted'
               AND o.id % ? = ?
             GROUP BY o.id
             HAVING live_replicas < o.target_replicas
             ORDER BY o.id
             LIMIT ?",
        )
        .bind(shard.count() as i64)
        .bind(shard.index() as i64)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// `pending -> active`, only if enough contracts are active right now.
    /// Returns whether the object changed.
    pub async fn upgrade_object_if_replicated(&self, object_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE objects SET status = 'active'
             WHERE id = ?
               AND status = 'pending'
               AND (SELECT COUNT(*) FROM contracts
                    WHERE object_id = objects.id AND status = 'active') >= target_replicas",
        )
        .bind(object_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `active -> pending`, only if active contracts dropped below target.
    /// Returns whether the object changed.
    pub async fn downgrade_object_if_underreplicated(&self, object_id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE objects SET status = 'pending'
             WHERE id = ?
               AND status = 'active'
               AND (SELECT COUNT(*) FROM contracts
                    WHERE object_id = objects.id AND status = 'active') < target_replicas",
        )
        .bind(object_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Active, locally present objects in `shard` created before `created_before`
    /// with no running restore job.
    pub async fn objects_ready_for_cleaning(
        &self,
        shard: Shard,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Object>> {
        let rows = sqlx::query_as::<_, Object>(
            "SELECT o.id, o.bucket_name, o.object_key, o.bag_id, o.size_bytes,
                    o.target_replicas, o.status, o.is_local, o.created_at
             FROM objects o
             WHERE o.status = 'active'
               AND o.is_local = 1
               AND o.created_at < ?
               AND o.id % ? = ?
               AND NOT EXISTS (
                   SELECT 1 FROM downloads d
                   WHERE d.object_id = o.id AND d.status = 'running'
               )
             ORDER BY o.created_at ASC
             LIMIT ?",
        )
        .bind(created_before)
        .bind(shard.count() as i64)
        .bind(shard.index() as i64)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Live objects other than `except_id` stored under `bag_id`. Identical
    /// uploads share one bag, its local directory and its custodians.
    pub async fn count_live_objects_with_bag(&self, bag_id: &str, except_id: i64) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM objects
             WHERE bag_id = ? AND id != ? AND status != 'deleted'",
        )
        .bind(bag_id)
        .bind(except_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// Whether another live object sharing `bag_id` still needs the local copy:
    /// it is not yet active, or a restore for it is running.
    pub async fn is_bag_pinned_by_others(&self, bag_id: &str, except_id: i64) -> StoreResult<bool> {
        let pinned: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                 SELECT 1 FROM objects o
                 WHERE o.bag_id = ? AND o.id != ? AND o.status != 'deleted'
                   AND (o.status != 'active'
                        OR EXISTS (SELECT 1 FROM downloads d
                                   WHERE d.object_id = o.id AND d.status = 'running'))
             )",
        )
        .bind(bag_id)
        .bind(except_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(pinned)
    }

    /// Mark every live object under `bag_id` as no longer held locally.
    pub async fn clear_bag_local(&self, bag_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE objects SET is_local = 0 WHERE bag_id = ? AND status != 'deleted'",
        )
        .bind(bag_id)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_object_local(&self, object_id: i64, is_local: bool) -> StoreResult<()> {
        sqlx::query("UPDATE objects SET is_local = ? WHERE id = ?")
            .bind(is_local)
            .bind(object_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Soft-delete an object and retire its live contracts in one transaction.
    /// Returns false if the object was already deleted.
    pub async fn delete_object(&self, object_id: i64) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            "UPDATE objects SET status = 'deleted', is_local = 0
             WHERE id = ? AND status != 'deleted'",
        )
        .bind(object_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE contracts SET status = 'failed', last_check = ?
             WHERE object_id = ? AND status IN ('pending', 'active')",
        )
        .bind(Utc::now())
        .bind(object_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        db::{REPLICATION_BATCH, StoreError},
        models::object::ObjectStatus,
        shard::Shard,
        test_support::{add_contract, backdate_object, memory_store, new_object},
    };
    use chrono::{Duration, Utc};
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn live_key_is_unique_until_deleted() {
        let store = memory_store().await;
        let first = store.create_object(&new_object("docs", "a.txt", 1)).await.unwrap();

        assert!(matches!(
            store.create_object(&new_object("docs", "a.txt", 1)).await,
            Err(StoreError::AlreadyExists(_))
        ));

        assert!(store.delete_object(first.id).await.unwrap());
        assert!(!store.delete_object(first.id).await.unwrap());
        store.create_object(&new_object("docs", "a.txt", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn replication_shards_partition_the_unsharded_result() {
        let store = memory_store().await;
        for i in 0..23 {
            store
                .create_object(&new_object("b", &format!("k{i}"), 2))
                .await
                .unwrap();
        }

        let whole: BTreeSet<i64> = store
            .objects_needing_replication(Shard::whole(), 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.object.id)
            .collect();
        assert_eq!(whole.len(), 23);

        for count in 1..=5 {
            let mut union = BTreeSet::new();
            for shard in Shard::all(count) {
                let ids: Vec<i64> = store
                    .objects_needing_replication(shard, 1000)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|c| c.object.id)
                    .collect();
                for id in ids {
                    assert!(shard.contains(id));
                    assert!(union.insert(id), "id {id} appeared in two shards");
                }
            }
            assert_eq!(union, whole, "{count} workers");
        }
    }

    #[tokio::test]
    async fn replication_counts_pending_and_active_but_not_failed() {
        let store = memory_store().await;
        let object = store.create_object(&new_object("b", "k", 2)).await.unwrap();

        add_contract(&store, object.id, "P1", "pending").await;
        add_contract(&store, object.id, "P2", "failed").await;

        let batch = store
            .objects_needing_replication(Shard::whole(), REPLICATION_BATCH)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].live_replicas, 1);
        assert_eq!(batch[0].deficit(), 1);
        // only the live custodian is excluded; P2 failed and may be hired again
        assert_eq!(batch[0].used_providers(), vec!["P1"]);

        add_contract(&store, object.id, "P3", "active").await;
        assert!(
            store
                .objects_needing_replication(Shard::whole(), REPLICATION_BATCH)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn upgrade_is_conditional_and_idempotent() {
        let store = memory_store().await;
        let object = store.create_object(&new_object("b", "k", 2)).await.unwrap();

        add_contract(&store, object.id, "P1", "active").await;
        assert!(!store.upgrade_object_if_replicated(object.id).await.unwrap());
        assert_eq!(
            store.get_object(object.id).await.unwrap().status,
            ObjectStatus::Pending
        );

        add_contract(&store, object.id, "P2", "active").await;
        assert!(store.upgrade_object_if_replicated(object.id).await.unwrap());
        assert!(!store.upgrade_object_if_replicated(object.id).await.unwrap());
        assert_eq!(
            store.get_object(object.id).await.unwrap().status,
            ObjectStatus::Active
        );
    }

    #[tokio::test]
    async fn downgrade_only_when_below_target() {
        let store = memory_store().await;
        let object = store.create_object(&new_object("b", "k", 1)).await.unwrap();
        let contract = add_contract(&store, object.id, "P1", "active").await;
        store.upgrade_object_if_replicated(object.id).await.unwrap();

        assert!(!store.downgrade_object_if_underreplicated(object.id).await.unwrap());

        store.mark_contract_failed(contract).await.unwrap();
        assert!(store.downgrade_object_if_underreplicated(object.id).await.unwrap());
        assert!(!store.downgrade_object_if_underreplicated(object.id).await.unwrap());
        assert_eq!(
            store.get_object(object.id).await.unwrap().status,
            ObjectStatus::Pending
        );
    }

    #[tokio::test]
    async fn cleaning_skips_young_remote_and_restoring_objects() {
        let store = memory_store().await;
        let now = Utc::now();

        let mut ids = Vec::new();
        for key in ["old", "young", "restoring", "offloaded"] {
            let object = store.create_object(&new_object("b", key, 1)).await.unwrap();
            add_contract(&store, object.id, "P1", "active").await;
            store.upgrade_object_if_replicated(object.id).await.unwrap();
            backdate_object(&store, object.id, now - Duration::minutes(10)).await;
            ids.push(object.id);
        }
        backdate_object(&store, ids[1], now).await;
        store.start_download_job(ids[2]).await.unwrap();
        store.set_object_local(ids[3], false).await.unwrap();

        let ready = store
            .objects_ready_for_cleaning(Shard::whole(), now - Duration::minutes(2), 50)
            .await
            .unwrap();
        let ready: Vec<i64> = ready.into_iter().map(|o| o.id).collect();
        assert_eq!(ready, vec![ids[0]]);
    }

    #[tokio::test]
    async fn delete_retires_live_contracts() {
        let store = memory_store().await;
        let object = store.create_object(&new_object("b", "k", 2)).await.unwrap();
        add_contract(&store, object.id, "P1", "active").await;
        add_contract(&store, object.id, "P2", "pending").await;

        store.delete_object(object.id).await.unwrap();

        let contracts = store.object_contracts(object.id).await.unwrap();
        assert!(
            contracts
                .iter()
                .all(|c| c.status == crate::models::contract::ContractStatus::Failed)
        );
        assert!(matches!(
            store.find_object("b", "k").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn objects_sharing_a_bag_see_each_other_until_deleted() {
        let store = memory_store().await;
        let first = store.create_object(&new_object("x", "f.txt", 1)).await.unwrap();
        let mut twin = new_object("y", "f.txt", 1);
        twin.bag_id = first.bag().unwrap();
        let twin = store.create_object(&twin).await.unwrap();
        let other = store.create_object(&new_object("z", "g.txt", 1)).await.unwrap();

        assert_eq!(store.count_live_objects_with_bag(&first.bag_id, first.id).await.unwrap(), 1);
        assert_eq!(store.count_live_objects_with_bag(&other.bag_id, other.id).await.unwrap(), 0);

        // a pending twin still needs the local copy; an active one does not
        assert!(store.is_bag_pinned_by_others(&first.bag_id, first.id).await.unwrap());
        add_contract(&store, twin.id, "P1", "active").await;
        assert!(store.upgrade_object_if_replicated(twin.id).await.unwrap());
        assert!(!store.is_bag_pinned_by_others(&first.bag_id, first.id).await.unwrap());
        store.start_download_job(twin.id).await.unwrap();
        assert!(store.is_bag_pinned_by_others(&first.bag_id, first.id).await.unwrap());

        assert_eq!(store.clear_bag_local(&first.bag_id).await.unwrap(), 2);
        assert!(!store.get_object(twin.id).await.unwrap().is_local);
        assert!(store.get_object(other.id).await.unwrap().is_local);

        assert!(store.delete_object(twin.id).await.unwrap());
        assert_eq!(store.count_live_objects_with_bag(&first.bag_id, first.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bucket_listing_honours_prefix_and_cursor() {
        let store = memory_store().await;
        for key in ["a/1", "a/2", "a%/3", "b/1"] {
            store.create_object(&new_object("b", key, 1)).await.unwrap();
        }

        let keys = |rows: Vec<crate::models::object::Object>| {
            rows.into_iter().map(|o| o.object_key).collect::<Vec<_>>()
        };

        let all_a = store.list_bucket_objects("b", Some("a/"), None, 10).await.unwrap();
        assert_eq!(keys(all_a), vec!["a/1", "a/2"]);

        let after = store
            .list_bucket_objects("b", None, Some("a/1"), 10)
            .await
            .unwrap();
        assert_eq!(keys(after), vec!["a/2", "b/1"]);
    }
}
