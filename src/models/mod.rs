//! Core data models for the replication service.
//!
//! These entities mirror the rows kept by the state store. They map cleanly to
//! database tables via `sqlx::FromRow` and serialize naturally as JSON via
//! `serde` for the admin surface.

pub mod bucket;
pub mod contract;
pub mod download;
pub mod object;
