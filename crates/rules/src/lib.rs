//! Rule-evaluation manager for a time-series monitoring system.
//!
//! This crate provides:
//! - YAML rule-group definitions (recording + alerting) with serde
//!   deserialization and validation
//! - A hot-reloadable [`manager::Manager`] with drain-and-swap
//!   reconfiguration that preserves in-flight alert state
//! - Per-group periodic evaluation at a deterministic, hash-jittered phase
//! - Static analysis of inter-rule data dependencies within a group
//! - Ordered concurrent evaluation batches bounded by a global admission
//!   semaphore

pub mod concurrency;
pub mod dependency;
pub mod group;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod rule;
pub mod schema;
pub mod signal;

#[cfg(test)]
pub(crate) mod testutil;
