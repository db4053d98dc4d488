//! Represents an object (one bag) awaiting or holding replication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::network::{BagId, BagIdError};

/// Replication status of an object.
///
/// `Active` is only ever written by the conditional upgrade transition, which
/// requires the active-contract count to meet the target at commit time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ObjectStatus {
    Pending,
    Active,
    Deleted,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }
}

/// A single uploaded object and the bag that carries its bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Row id; also the partition key for worker sharding.
    pub id: i64,

    /// Owning bucket.
    pub bucket_name: String,

    /// Object key (path-like identifier within the bucket).
    pub object_key: String,

    /// Hex-encoded bag digest.
    pub bag_id: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Number of custodians that should hold this bag.
    pub target_replicas: i64,

    pub status: ObjectStatus,

    /// Whether the bytes are currently materialised on this host.
    pub is_local: bool,

    pub created_at: DateTime<Utc>,
}

impl Object {
    /// Name of the file inside the bag (last segment of the key).
    pub fn file_name(&self) -> &str {
        self.object_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.object_key)
    }

    /// Parse the persisted digest.
    pub fn bag(&self) -> Result<BagId, BagIdError> {
        self.bag_id.parse()
    }
}

/// Insert payload for a freshly uploaded object.
#[derive(Clone, Debug)]
pub struct NewObject {
    pub bucket_name: String,
    pub object_key: String,
    pub bag_id: BagId,
    pub size_bytes: i64,
    pub target_replicas: i64,
}

/// An object whose live contract count is below its target.
#[derive(Clone, FromRow, Debug)]
pub struct ReplicationCandidate {
    #[sqlx(flatten)]
    pub object: Object,

    /// Contracts in `pending` or `active`.
    pub live_replicas: i64,

    /// Comma-separated custodians holding a `pending` or `active` contract.
    pub used_providers: Option<String>,
}

impl ReplicationCandidate {
    /// How many more custodians must be hired; never negative.
    pub fn deficit(&self) -> i64 {
        (self.object.target_replicas - self.live_replicas).max(0)
    }

    pub fn used_providers(&self) -> Vec<String> {
        self.used_providers
            .as_deref()
            .map(|joined| {
                joined
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(key: &str) -> Object {
        Object {
            id: 1,
            bucket_name: "photos".into(),
            object_key: key.into(),
            bag_id: "00".repeat(32),
            size_bytes: 10,
            target_replicas: 3,
            status: ObjectStatus::Pending,
            is_local: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn file_name_is_last_key_segment() {
        assert_eq!(object("2025/img.jpg").file_name(), "img.jpg");
        assert_eq!(object("flat.bin").file_name(), "flat.bin");
    }

    #[test]
    fn deficit_never_negative() {
        let mut candidate = ReplicationCandidate {
            object: object("a"),
            live_replicas: 1,
            used_providers: Some("A,B,".into()),
        };
        assert_eq!(candidate.deficit(), 2);
        assert_eq!(candidate.used_providers(), vec!["A", "B"]);

        candidate.live_replicas = 5;
        assert_eq!(candidate.deficit(), 0);
    }
}
