//! Per-group evaluation metrics.
//!
//! A [`RuleGroupMetrics`] registry tracks counters and gauges per group key.
//! Entries are created lazily on first touch and deleted when a group is
//! removed during a reload, so stale keys never accumulate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters and gauges for a single rule group.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupMetrics {
    /// Iterations scheduled, including ticks that were subsequently missed.
    pub iterations_scheduled: u64,
    /// Ticks skipped because the previous iteration overran the interval.
    pub iterations_missed: u64,
    /// Completed iterations.
    pub iteration_count: u64,
    /// Duration of the most recent iteration.
    pub last_duration: Duration,
    /// Rolling average iteration duration.
    pub avg_duration: Duration,
    /// Rule evaluations attempted.
    pub eval_total: u64,
    /// Rule evaluations that failed.
    pub eval_failures: u64,
    /// The group's evaluation interval.
    pub interval: Duration,
    /// Wall-clock time of the most recent evaluation.
    pub last_eval_time: Option<DateTime<Utc>>,
    /// Number of rules in the group.
    pub rules: usize,
    /// Samples produced by the most recent iteration.
    pub samples: u64,
}

/// Registry of [`GroupMetrics`] keyed by group key.
#[derive(Debug, Default)]
pub struct RuleGroupMetrics {
    groups: RwLock<HashMap<String, GroupMetrics>>,
}

impl RuleGroupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the entry for `key`, creating it if absent.
    fn with<F: FnOnce(&mut GroupMetrics)>(&self, key: &str, f: F) {
        let mut groups = self.groups.write().expect("metrics lock poisoned");
        f(groups.entry(key.to_string()).or_default());
    }

    /// Snapshot of one group's metrics.
    pub fn snapshot(&self, key: &str) -> Option<GroupMetrics> {
        self.groups
            .read()
            .expect("metrics lock poisoned")
            .get(key)
            .cloned()
    }

    /// Snapshot of every tracked group.
    pub fn all(&self) -> HashMap<String, GroupMetrics> {
        self.groups.read().expect("metrics lock poisoned").clone()
    }

    /// Delete all metrics for a removed group.
    pub fn remove_group(&self, key: &str) {
        self.groups
            .write()
            .expect("metrics lock poisoned")
            .remove(key);
    }

    /// Initialise the static gauges for a freshly built group.
    pub(crate) fn init_group(&self, key: &str, interval: Duration, rules: usize) {
        self.with(key, |m| {
            m.interval = interval;
            m.rules = rules;
        });
    }

    pub(crate) fn inc_iterations_scheduled(&self, key: &str, by: u64) {
        self.with(key, |m| m.iterations_scheduled += by);
    }

    pub(crate) fn inc_iterations_missed(&self, key: &str, by: u64) {
        self.with(key, |m| m.iterations_missed += by);
    }

    /// Record a completed iteration's duration (last + incremental mean).
    pub(crate) fn observe_iteration(&self, key: &str, duration: Duration) {
        self.with(key, |m| {
            m.iteration_count += 1;
            m.last_duration = duration;
            m.avg_duration = if m.iteration_count == 1 {
                duration
            } else {
                let prev = m.avg_duration.as_nanos() as f64;
                let cur = duration.as_nanos() as f64;
                Duration::from_nanos((prev + (cur - prev) / m.iteration_count as f64) as u64)
            };
        });
    }

    pub(crate) fn inc_eval_total(&self, key: &str) {
        self.with(key, |m| m.eval_total += 1);
    }

    pub(crate) fn inc_eval_failures(&self, key: &str) {
        self.with(key, |m| m.eval_failures += 1);
    }

    pub(crate) fn set_last_eval_time(&self, key: &str, at: DateTime<Utc>) {
        self.with(key, |m| m.last_eval_time = Some(at));
    }

    pub(crate) fn set_samples(&self, key: &str, samples: u64) {
        self.with(key, |m| m.samples = samples);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
