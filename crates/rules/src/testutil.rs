//! Shared in-memory mocks for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_model::labels::Matcher;
use vigil_model::sample::{Sample, Vector};
use vigil_model::store::{Appendable, Appender, QueryError, Queryable, StoreError};

use crate::concurrency::RuleConcurrencyController;
use crate::group::{Group, GroupOptions};
use crate::manager::{EvalServices, NotifyFunc, QueryFunc};
use crate::metrics::RuleGroupMetrics;
use crate::rule::{Alert, EvalContext, Rule};

type QueryFn = dyn Fn(&str, DateTime<Utc>) -> Result<Vector, QueryError> + Send + Sync;

/// Query function driven by a closure, with optional latency injection and
/// in-flight concurrency tracking.
pub(crate) struct MockQuery {
    f: Box<QueryFn>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockQuery {
    pub(crate) fn new(
        f: impl Fn(&str, DateTime<Utc>) -> Result<Vector, QueryError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            f: Box::new(f),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Highest number of queries observed in flight at once.
    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryFunc for MockQuery {
    async fn query(
        &self,
        _ctx: &EvalContext,
        expr: &str,
        at: DateTime<Utc>,
    ) -> Result<Vector, QueryError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = (self.f)(expr, at);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Notifier that drops everything.
pub(crate) struct NullNotify;

#[async_trait]
impl NotifyFunc for NullNotify {
    async fn notify(&self, _ctx: &EvalContext, _expr: &str, _alerts: &[Alert]) {}
}

/// Queryable with no stored series.
pub(crate) struct EmptyQueryable;

#[async_trait]
impl Queryable for EmptyQueryable {
    async fn latest_samples(
        &self,
        _at: DateTime<Utc>,
        _matchers: &[Matcher],
    ) -> Result<Vector, StoreError> {
        Ok(Vec::new())
    }
}

/// Appendable collecting committed samples into a shared vector.
pub(crate) struct CollectingStore {
    pub(crate) samples: Arc<Mutex<Vec<Sample>>>,
}

impl Appendable for CollectingStore {
    fn appender(&self) -> Box<dyn Appender> {
        Box::new(BufAppender {
            buf: Vec::new(),
            sink: Arc::clone(&self.samples),
        })
    }
}

struct BufAppender {
    buf: Vec<Sample>,
    sink: Arc<Mutex<Vec<Sample>>>,
}

#[async_trait]
impl Appender for BufAppender {
    async fn append(&mut self, sample: Sample) -> Result<(), StoreError> {
        self.buf.push(sample);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.sink.lock().unwrap().extend(self.buf);
        Ok(())
    }
}

/// Build [`EvalServices`] around the given query function and controller;
/// returns the shared sink of committed samples alongside.
pub(crate) fn services_with(
    query: Arc<dyn QueryFunc>,
    concurrency: Arc<dyn RuleConcurrencyController>,
) -> (Arc<EvalServices>, Arc<Mutex<Vec<Sample>>>) {
    let samples = Arc::new(Mutex::new(Vec::new()));
    let services = Arc::new(EvalServices {
        query,
        notify: Arc::new(NullNotify),
        appendable: Arc::new(CollectingStore {
            samples: Arc::clone(&samples),
        }),
        queryable: Arc::new(EmptyQueryable),
        external_url: String::new(),
        resend_delay: Duration::from_secs(60),
        outage_tolerance: Duration::from_secs(3600),
        for_grace_period: Duration::from_secs(600),
        default_rule_query_offset: None,
        concurrency,
        metrics: Arc::new(RuleGroupMetrics::new()),
    });
    (services, samples)
}

/// Build a group named `g` in file `test.yml` with a 10s interval.
pub(crate) fn group_with(rules: Vec<Arc<dyn Rule>>, services: Arc<EvalServices>) -> Arc<Group> {
    group_with_interval(rules, services, Duration::from_secs(10))
}

pub(crate) fn group_with_interval(
    rules: Vec<Arc<dyn Rule>>,
    services: Arc<EvalServices>,
    interval: Duration,
) -> Arc<Group> {
    Group::new(GroupOptions {
        name: "g".to_string(),
        file: "test.yml".to_string(),
        interval,
        limit: 0,
        query_offset: None,
        external_url: String::new(),
        rules,
        should_restore: false,
        services,
        eval_iteration: None,
    })
}
