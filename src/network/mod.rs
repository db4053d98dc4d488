//! The storage network capability.
//!
//! Bag creation and seeding, peer transport and on-chain transactions are all
//! behind [`StorageNetwork`]; the replication loops only orchestrate calls to
//! it. [`loopback::LoopbackNetwork`] is the filesystem-backed implementation
//! used for single-host deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

pub mod loopback;

#[cfg(test)]
pub mod mock;

/// Length of a bag digest in bytes.
pub const BAG_ID_LEN: usize = 32;

/// Content address of an immutable bag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BagId([u8; BAG_ID_LEN]);

#[derive(Debug, Error)]
pub enum BagIdError {
    #[error("bag id is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("bag id must be 32 bytes, got {0}")]
    Length(usize),
}

impl BagId {
    pub fn from_bytes(bytes: [u8; BAG_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; BAG_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for BagId {
    type Err = BagIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim())?;
        let bytes: [u8; BAG_ID_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| BagIdError::Length(raw.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BagId({})", self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("custodian unreachable: {0}")]
    Unreachable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid custodian address `{0}`")]
    InvalidAddress(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

impl NetworkError {
    /// Transient conditions worth retrying on the next pass.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Unreachable(_) | Self::Io(_)
        )
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

/// What a custodian says about its own copy when asked directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustodianState {
    pub status: String,
    pub reason: String,
}

impl CustodianState {
    pub fn active() -> Self {
        Self {
            status: "active".into(),
            reason: String::new(),
        }
    }
}

/// Verdict of one audit.
#[derive(Clone, Debug, Serialize)]
pub struct AuditReport {
    pub healthy: bool,
    /// `active`, `missing`, `outdated`, `unreachable`, or whatever the custodian reports.
    pub status: String,
    pub reason: String,
    pub last_proof_age_secs: Option<u64>,
}

/// Proofs may lag the contract's max span by a tenth before they count as stale.
pub fn allowed_proof_delay(max_span: Duration) -> Duration {
    max_span + max_span / 10
}

impl AuditReport {
    pub fn healthy(last_proof_age: Option<Duration>) -> Self {
        Self {
            healthy: true,
            status: "active".into(),
            reason: String::new(),
            last_proof_age_secs: last_proof_age.map(|d| d.as_secs()),
        }
    }

    /// The custodian is not listed in the bag's storage contract at all.
    pub fn missing() -> Self {
        Self {
            healthy: false,
            status: "missing".into(),
            reason: "provider not found in contract list".into(),
            last_proof_age_secs: None,
        }
    }

    /// Canonical health rule.
    ///
    /// A proof older than [`allowed_proof_delay`] is a terminal verdict and
    /// wins over anything the custodian reports. Otherwise the custodian's own
    /// status decides: only `active` is healthy, and an unreachable custodian is
    /// unhealthy.
    pub fn assess(
        last_proof_at: DateTime<Utc>,
        max_span: Duration,
        now: DateTime<Utc>,
        reported: NetworkResult<CustodianState>,
    ) -> Self {
        let age = (now - last_proof_at).to_std().unwrap_or_default();
        let age_secs = Some(age.as_secs());

        if age > allowed_proof_delay(max_span) {
            return Self {
                healthy: false,
                status: "outdated".into(),
                reason: format!(
                    "proof outdated: last {}s ago, max span {}s",
                    age.as_secs(),
                    max_span.as_secs()
                ),
                last_proof_age_secs: age_secs,
            };
        }

        let (status, reason) = match reported {
            Ok(state) => (state.status, state.reason),
            Err(err) => ("unreachable".to_string(), err.to_string()),
        };
        let healthy = status == "active";
        let reason = if !healthy && reason.is_empty() {
            format!("status is {status}")
        } else {
            reason
        };

        Self {
            healthy,
            status,
            reason,
            last_proof_age_secs: age_secs,
        }
    }
}

/// Live transfer snapshot of one bag on this host.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BagStats {
    pub upload_speed: u64,
    pub uploaded_total: u64,
    pub peers: usize,
    pub active: bool,
    pub downloaded: u64,
    pub completed: bool,
}

/// Black-box client for the storage network and its escrow contracts.
#[async_trait]
pub trait StorageNetwork: Send + Sync {
    /// Turn a local file into a seeded bag and return its digest.
    async fn create_bag(&self, local_path: &Path) -> NetworkResult<BagId>;

    /// Start fetching a bag from the network. Idempotent while a download is running.
    async fn download_bag(&self, bag: &BagId) -> NetworkResult<()>;

    /// Block until `name` inside `bag` exists locally, or fail with [`NetworkError::Timeout`].
    async fn wait_for_file(&self, bag: &BagId, name: &str, timeout: Duration)
    -> NetworkResult<PathBuf>;

    /// Path of a materialised file, if it is on disk right now.
    async fn local_file(&self, bag: &BagId, name: &str) -> Option<PathBuf>;

    async fn audit_custodian(&self, bag: &BagId, custodian: &str) -> NetworkResult<AuditReport>;

    /// Cheap liveness check; callers bound it with their own timeout.
    async fn ping_custodian(&self, bag: &BagId, custodian: &str) -> NetworkResult<()>;

    /// Add `custodian` to the bag's storage contract, escrowing `amount_nano`.
    /// Returns the contract address.
    async fn hire_custodian(
        &self,
        bag: &BagId,
        custodian: &str,
        amount_nano: u64,
    ) -> NetworkResult<String>;

    /// Remove `custodian` from the bag's storage contract. Returns the transaction hash.
    async fn remove_custodian(&self, bag: &BagId, custodian: &str) -> NetworkResult<String>;

    /// Drop the local copy; custodians keep theirs.
    async fn delete_local_copy(&self, bag: &BagId) -> NetworkResult<()>;

    async fn bag_stats(&self, bag: &BagId) -> NetworkResult<BagStats>;
}
