//! Background reconciliation loops.
//!
//! Each loop kind runs in its own [`pool::WorkerPool`]; every worker owns one
//! [`crate::shard::Shard`] of the rows its loop scans. Loops talk to each other
//! only through state-store transitions.

pub mod auditor;
pub mod cleaner;
pub mod pinger;
pub mod pool;
pub mod reconcile;
pub mod replicator;
