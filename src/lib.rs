//! Replication keeper for content-addressed bags stored by untrusted custodians.
//!
//! Uploaded objects are turned into bags, custodians are hired through on-chain
//! escrow contracts, and four horizontally partitioned control loops keep the
//! replica count at target: the replicator hires, the auditor promotes and
//! evicts, the pinger checks liveness and the cleaner reclaims local disk.
//! The loops never talk to each other; every hand-off is a conditional status
//! transition in the state store.

pub mod config;
pub mod daemons;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod network;
pub mod providers;
pub mod routes;
pub mod services;
pub mod shard;

#[cfg(test)]
pub(crate) mod test_support;
