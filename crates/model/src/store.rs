//! Trait seams for the external collaborators.
//!
//! The evaluation core treats the query engine, the sample store, and the
//! restoration source as pluggable interfaces. Hosts wire in concrete
//! implementations; tests use in-memory mocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::labels::Matcher;
use crate::sample::{QueryValue, Sample, Vector};

/// Errors produced by query execution.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("query engine error: {0}")]
    Engine(String),

    #[error("rule result is not a vector or scalar")]
    InvalidResultType,

    #[error("query cancelled")]
    Cancelled,
}

/// Errors produced by the sample store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("append failed: {0}")]
    Append(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("select failed: {0}")]
    Select(String),
}

// ── Query engine ────────────────────────────────────────────────────

/// Executes instant queries against the time-series backend.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Evaluate `expr` at the given timestamp.
    async fn instant_query(&self, expr: &str, at: DateTime<Utc>) -> Result<QueryValue, QueryError>;
}

#[async_trait]
impl<T: QueryEngine + ?Sized> QueryEngine for std::sync::Arc<T> {
    async fn instant_query(&self, expr: &str, at: DateTime<Utc>) -> Result<QueryValue, QueryError> {
        (**self).instant_query(expr, at).await
    }
}

// ── Appending ───────────────────────────────────────────────────────

/// A single batched write session against the sample store.
///
/// Appends are buffered until [`commit`](Appender::commit); an appender that
/// is dropped without committing discards its buffer.
#[async_trait]
pub trait Appender: Send {
    /// Buffer one sample for writing.
    async fn append(&mut self, sample: Sample) -> Result<(), StoreError>;

    /// Persist all buffered samples.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Hands out write sessions against the sample store.
pub trait Appendable: Send + Sync {
    fn appender(&self) -> Box<dyn Appender>;
}

impl<T: Appendable + ?Sized> Appendable for std::sync::Arc<T> {
    fn appender(&self) -> Box<dyn Appender> {
        (**self).appender()
    }
}

// ── Reading back ────────────────────────────────────────────────────

/// Read access to stored series, used for alert-state restoration.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Return the latest sample at or before `at` for every series matching
    /// all of `matchers`.
    async fn latest_samples(
        &self,
        at: DateTime<Utc>,
        matchers: &[Matcher],
    ) -> Result<Vector, StoreError>;
}

#[async_trait]
impl<T: Queryable + ?Sized> Queryable for std::sync::Arc<T> {
    async fn latest_samples(
        &self,
        at: DateTime<Utc>,
        matchers: &[Matcher],
    ) -> Result<Vector, StoreError> {
        (**self).latest_samples(at, matchers).await
    }
}
