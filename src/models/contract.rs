//! Represents one custodian's escrowed promise to hold one bag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Contract status. `Failed` is terminal: no transition leaves it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContractStatus {
    Pending,
    Active,
    Failed,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Contract {
    pub id: i64,

    /// Parent object.
    pub object_id: i64,

    /// Custodian address as it was handed to the hire call.
    pub provider_addr: String,

    /// On-chain storage contract address.
    pub contract_addr: String,

    /// Escrowed amount in nano units.
    pub balance_nano: i64,

    pub status: ContractStatus,

    /// Last time an audit confirmed (or created) this contract.
    pub last_check: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

/// A contract joined with its parent's bag digest, as handed to the auditor and pinger.
#[derive(Serialize, Clone, FromRow, Debug)]
pub struct ContractWithBag {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub contract: Contract,

    pub bag_id: String,
}

/// Insert payload for a freshly hired custodian.
#[derive(Clone, Debug)]
pub struct NewContract {
    pub object_id: i64,
    pub provider_addr: String,
    pub contract_addr: String,
    pub balance_nano: i64,
}
