use chrono::Utc;

use super::{StateStore, StoreError, StoreResult, is_unique_violation};
use crate::models::bucket::Bucket;

impl StateStore {
    pub async fn create_bucket(&self, name: &str) -> StoreResult<Bucket> {
        let bucket = Bucket {
            name: name.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO buckets (name, created_at) VALUES (?, ?)")
            .bind(&bucket.name)
            .bind(bucket.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::AlreadyExists(format!("bucket `{name}`")))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    pub async fn bucket_exists(&self, name: &str) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM buckets WHERE name = ?)")
                .bind(name)
                .fetch_one(&*self.db)
                .await?;
        Ok(exists)
    }

    pub async fn list_buckets(&self) -> StoreResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>("SELECT name, created_at FROM buckets ORDER BY name")
            .fetch_all(&*self.db)
            .await?;
        Ok(buckets)
    }

    pub async fn delete_bucket(&self, name: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("bucket", name));
        }
        Ok(())
    }
}
