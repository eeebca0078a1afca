//! Periodic group evaluation.
//!
//! Each [`Group`] owns an ordered rule list and a scheduler task that ticks
//! at the group's interval, phase-shifted by a stable hash of its key so
//! groups with identical intervals spread across the period. Batches come
//! from the concurrency controller; admitted rules run as parallel tasks,
//! the rest evaluate inline in the dispatcher.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use vigil_model::labels::Labels;
use vigil_model::sample::{stale_nan, Sample};
use vigil_model::time::to_chrono;

use crate::manager::EvalServices;
use crate::rule::{rules_equal, EvalContext, Rule};
use crate::signal::Signal;

/// Stable encoding of a group's `(file, name)` identity, used as map key and
/// metric label.
pub fn group_key(file: &str, name: &str) -> String {
    format!("{};{}", file, name)
}

// ── Iteration hook ──────────────────────────────────────────────────

/// Pluggable per-iteration hook invoked at every tick.
///
/// Custom implementations should call [`Group::eval`] and
/// [`Group::record_iteration`] to keep group state and metrics maintained.
pub type EvalIterationFunc =
    Arc<dyn Fn(Arc<Group>, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The default iteration: evaluate, then update state and metrics.
pub fn default_eval_iteration() -> EvalIterationFunc {
    Arc::new(|group: Arc<Group>, ts| {
        Box::pin(async move {
            let start = Instant::now();
            Arc::clone(&group).eval(ts).await;
            group.record_iteration(ts, start.elapsed());
        })
    })
}

// ── Group ───────────────────────────────────────────────────────────

/// Construction parameters for [`Group::new`].
pub struct GroupOptions {
    pub name: String,
    pub file: String,
    pub interval: Duration,
    /// Maximum series a rule may produce per iteration (0 = unlimited).
    pub limit: usize,
    /// Group-level override of the manager's default query offset.
    pub query_offset: Option<Duration>,
    /// Prefix for generator URLs handed to rule evaluations.
    pub external_url: String,
    pub rules: Vec<Arc<dyn Rule>>,
    /// Restore alert for-state on the first tick.
    pub should_restore: bool,
    pub services: Arc<EvalServices>,
    /// Per-iteration hook; defaults to [`default_eval_iteration`].
    pub eval_iteration: Option<EvalIterationFunc>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Scheduled timestamp of the most recent evaluation.
    last_eval_ts: Option<DateTime<Utc>>,
    /// Wall-clock time the most recent iteration finished.
    last_evaluation: Option<DateTime<Utc>>,
    last_duration: Duration,
    /// Cumulative sum of per-rule evaluation durations.
    rule_eval_time_sum: Duration,
    /// Per rule index: series produced by the previous iteration.
    series_in_previous_eval: Vec<HashMap<String, Labels>>,
    /// Series orphaned by a reload, awaiting staleness markers.
    stale_series: Vec<Labels>,
}

/// A named, file-scoped bundle of rules sharing an evaluation interval.
pub struct Group {
    name: String,
    file: String,
    interval: Duration,
    query_offset: Option<Duration>,
    limit: usize,
    external_url: String,
    rules: Vec<Arc<dyn Rule>>,
    services: Arc<EvalServices>,
    eval_iteration: EvalIterationFunc,
    should_restore: AtomicBool,
    mark_stale: AtomicBool,
    started: AtomicBool,
    stopping: Signal,
    terminated: Signal,
    state: RwLock<GroupState>,
}

impl Group {
    pub fn new(opts: GroupOptions) -> Arc<Self> {
        let key = group_key(&opts.file, &opts.name);
        opts.services
            .metrics
            .init_group(&key, opts.interval, opts.rules.len());

        let rule_count = opts.rules.len();
        Arc::new(Self {
            name: opts.name,
            file: opts.file,
            interval: opts.interval,
            query_offset: opts.query_offset,
            limit: opts.limit,
            external_url: opts.external_url,
            rules: opts.rules,
            services: opts.services,
            eval_iteration: opts.eval_iteration.unwrap_or_else(default_eval_iteration),
            should_restore: AtomicBool::new(opts.should_restore),
            mark_stale: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopping: Signal::new(),
            terminated: Signal::new(),
            state: RwLock::new(GroupState {
                series_in_previous_eval: vec![HashMap::new(); rule_count],
                ..Default::default()
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn key(&self) -> String {
        group_key(&self.file, &self.name)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn query_offset(&self) -> Option<Duration> {
        self.query_offset
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }

    /// Scheduled timestamp of the most recent evaluation.
    pub fn last_eval_timestamp(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .expect("group state lock poisoned")
            .last_eval_ts
    }

    /// Wall-clock time the most recent iteration finished.
    pub fn last_evaluation(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .expect("group state lock poisoned")
            .last_evaluation
    }

    /// Duration of the most recent iteration.
    pub fn last_duration(&self) -> Duration {
        self.state
            .read()
            .expect("group state lock poisoned")
            .last_duration
    }

    /// Cumulative sum of per-rule evaluation durations across iterations.
    pub fn rule_eval_time_sum(&self) -> Duration {
        self.state
            .read()
            .expect("group state lock poisoned")
            .rule_eval_time_sum
    }

    /// Mark the group so its final drain writes staleness markers for every
    /// series it produced. Set on groups removed by a reload.
    pub fn set_mark_stale(&self) {
        self.mark_stale.store(true, Ordering::SeqCst);
    }

    /// Structural equality governing whether a reload reuses this instance.
    pub fn equals(&self, other: &Group) -> bool {
        self.name == other.name
            && self.file == other.file
            && self.interval == other.interval
            && self.query_offset == other.query_offset
            && self.limit == other.limit
            && self.rules.len() == other.rules.len()
            && self
                .rules
                .iter()
                .zip(&other.rules)
                .all(|(a, b)| rules_equal(a.as_ref(), b.as_ref()))
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Deterministic phase offset in `[0, interval)` derived from the group
    /// key. No randomness: the phase is stable across restarts.
    fn phase_offset(&self) -> Duration {
        let mut hasher = DefaultHasher::new();
        self.key().hash(&mut hasher);
        let interval_ns = self.interval.as_nanos().max(1) as u64;
        Duration::from_nanos(hasher.finish() % interval_ns)
    }

    /// The most recent instant `t ≤ now` with `t mod interval == offset`.
    pub fn eval_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.phase_offset().as_nanos() as i64;
        let interval = self.interval.as_nanos().max(1) as i64;
        let now_ns = now.timestamp_nanos_opt().unwrap_or_default();
        let adjusted = now_ns - offset;
        let base = adjusted - adjusted.rem_euclid(interval);
        DateTime::from_timestamp_nanos(base + offset)
    }

    /// Sleep until `at` or until the group starts stopping. Returns false
    /// when stopping.
    async fn sleep_until(&self, at: DateTime<Utc>) -> bool {
        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = self.stopping.wait() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// The scheduler loop. Runs until [`stop`](Group::stop); never runs two
    /// iterations concurrently.
    pub async fn run(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let key = self.key();
        debug!(group = %key, interval = ?self.interval, "starting group evaluation loop");

        let mut eval_ts = self.eval_timestamp(Utc::now()) + to_chrono(self.interval);
        loop {
            if !self.sleep_until(eval_ts).await {
                break;
            }

            self.services.metrics.inc_iterations_scheduled(&key, 1);
            (self.eval_iteration)(Arc::clone(&self), eval_ts).await;

            if self.should_restore.swap(false, Ordering::SeqCst) {
                self.restore_for_state(Utc::now()).await;
            }

            // Skip (never queue) ticks that fully elapsed during an overrun.
            let interval_ns = self.interval.as_nanos().max(1) as i64;
            let since_ns = (Utc::now() - eval_ts).num_nanoseconds().unwrap_or(0).max(0);
            let elapsed_ticks = since_ns / interval_ns;
            let missed = elapsed_ticks.saturating_sub(1).max(0) as u64;
            if missed > 0 {
                self.services.metrics.inc_iterations_missed(&key, missed);
                self.services.metrics.inc_iterations_scheduled(&key, missed);
                warn!(group = %key, missed, "iteration overran the interval, skipping ticks");
            }
            eval_ts += to_chrono(self.interval) * (missed as i32 + 1);
        }

        if self.mark_stale.load(Ordering::SeqCst) {
            self.cleanup_stale_series(Utc::now()).await;
        }
        debug!(group = %key, "group evaluation loop stopped");
        self.terminated.fire();
    }

    /// Signal termination and wait for the in-flight iteration to finish.
    /// After stop, no further ticks occur.
    pub async fn stop(&self) {
        self.stopping.fire();
        // A scheduler that never started drains itself at the first tick gate.
        if self.started.load(Ordering::SeqCst) {
            self.terminated.wait().await;
        }
    }

    // ── Evaluation ──────────────────────────────────────────────────

    /// Update group state and metrics after an iteration. Called by the
    /// default iteration hook; custom hooks should call it too.
    pub fn record_iteration(&self, ts: DateTime<Utc>, duration: Duration) {
        let key = self.key();
        self.services.metrics.observe_iteration(&key, duration);

        let per_rule_sum: Duration = self.rules.iter().map(|r| r.eval_duration()).sum();
        let now = Utc::now();
        {
            let mut state = self.state.write().expect("group state lock poisoned");
            state.last_eval_ts = Some(ts);
            state.last_evaluation = Some(now);
            state.last_duration = duration;
            state.rule_eval_time_sum += per_rule_sum;
        }
        self.services.metrics.set_last_eval_time(&key, now);
    }

    /// Evaluate every rule once at the scheduled timestamp `ts`.
    ///
    /// Batches are strictly ordered; rules within a batch run with no
    /// ordering guarantee. Cancellation abandons remaining batches.
    pub async fn eval(self: Arc<Self>, ts: DateTime<Utc>) {
        let key = self.key();
        let ctx = EvalContext::new(self.stopping.clone(), key.clone());
        let batches = self.services.concurrency.split_group_into_batches(&self);

        let mut samples_total: u64 = 0;
        for batch in batches {
            if ctx.is_cancelled() {
                debug!(group = %key, "evaluation cancelled, abandoning remaining batches");
                break;
            }
            let mut handles = Vec::new();
            for idx in batch {
                if self.services.concurrency.allow(&self, idx) {
                    let group = Arc::clone(&self);
                    let ctx = ctx.clone();
                    handles.push(tokio::spawn(async move {
                        let samples = group.eval_one(&ctx, idx, ts).await;
                        group.services.concurrency.done();
                        samples
                    }));
                } else {
                    // No admission slot: evaluate inline in the dispatcher.
                    samples_total += self.eval_one(&ctx, idx, ts).await;
                }
            }
            for handle in handles {
                match handle.await {
                    Ok(samples) => samples_total += samples,
                    Err(e) => warn!(group = %key, error = %e, "rule evaluation task panicked"),
                }
            }
        }

        if !ctx.is_cancelled() {
            self.flush_stale_series(ts).await;
        }
        self.services.metrics.set_samples(&key, samples_total);
    }

    /// Evaluate one rule, append its output, and write staleness markers for
    /// series it produced last iteration but not this one. Errors never
    /// propagate past the rule: they are logged and counted.
    async fn eval_one(&self, ctx: &EvalContext, idx: usize, ts: DateTime<Utc>) -> u64 {
        if ctx.is_cancelled() {
            return 0;
        }
        let rule = &self.rules[idx];
        let key = ctx.group_key();

        self.services.metrics.inc_eval_total(key);
        let query_offset = self.effective_query_offset();
        let query_time = ts - to_chrono(query_offset);

        let start = Instant::now();
        let result = rule
            .eval(
                ctx,
                query_time,
                query_offset,
                &*self.services.query,
                &self.external_url,
                self.limit,
            )
            .await;
        rule.set_eval_duration(start.elapsed());

        let vector = match result {
            Ok(v) => v,
            Err(e) => {
                rule.set_last_error(Some(e.to_string()));
                self.services.metrics.inc_eval_failures(key);
                warn!(group = %key, rule = %rule.name(), error = %e, "rule evaluation failed");
                return 0;
            }
        };
        rule.set_last_error(None);

        if let Some(alerting) = rule.as_alerting() {
            alerting
                .send_alerts(
                    ctx,
                    ts,
                    self.services.resend_delay,
                    self.interval,
                    &*self.services.notify,
                )
                .await;
        }

        let mut app = self.services.appendable.appender();
        let mut seen: HashMap<String, Labels> = HashMap::with_capacity(vector.len());
        let mut appended: u64 = 0;
        for sample in vector {
            let series_key = sample.metric.to_string();
            let metric = sample.metric.clone();
            match app.append(sample).await {
                Ok(()) => {
                    appended += 1;
                    seen.insert(series_key, metric);
                }
                Err(e) => {
                    warn!(group = %key, rule = %rule.name(), error = %e, "failed to append result sample");
                }
            }
        }

        let previous = {
            let state = self.state.read().expect("group state lock poisoned");
            state
                .series_in_previous_eval
                .get(idx)
                .cloned()
                .unwrap_or_default()
        };
        for (series_key, metric) in previous {
            if !seen.contains_key(&series_key) {
                if let Err(e) = app.append(Sample::new(metric, ts, stale_nan())).await {
                    debug!(group = %key, rule = %rule.name(), error = %e, "failed to append staleness marker");
                }
            }
        }

        if let Err(e) = app.commit().await {
            warn!(group = %key, rule = %rule.name(), error = %e, "failed to commit rule samples");
        }

        self.state
            .write()
            .expect("group state lock poisoned")
            .series_in_previous_eval[idx] = seen;
        appended
    }

    /// Group-level query offset, else the manager default, else zero.
    fn effective_query_offset(&self) -> Duration {
        self.query_offset
            .or_else(|| {
                self.services
                    .default_rule_query_offset
                    .as_ref()
                    .map(|f| f())
            })
            .unwrap_or_default()
    }

    /// Write staleness markers for series orphaned by a reload.
    async fn flush_stale_series(&self, ts: DateTime<Utc>) {
        let stale = {
            let mut state = self.state.write().expect("group state lock poisoned");
            std::mem::take(&mut state.stale_series)
        };
        if stale.is_empty() {
            return;
        }
        let mut app = self.services.appendable.appender();
        for metric in stale {
            if let Err(e) = app.append(Sample::new(metric, ts, stale_nan())).await {
                debug!(group = %self.key(), error = %e, "failed to append staleness marker");
            }
        }
        if let Err(e) = app.commit().await {
            warn!(group = %self.key(), error = %e, "failed to commit staleness markers");
        }
    }

    /// Write staleness markers for every series this group produced. Runs
    /// once after the final drain of a removed group.
    async fn cleanup_stale_series(&self, ts: DateTime<Utc>) {
        let series: Vec<Labels> = {
            let state = self.state.read().expect("group state lock poisoned");
            state
                .series_in_previous_eval
                .iter()
                .flat_map(|m| m.values().cloned())
                .chain(state.stale_series.iter().cloned())
                .collect()
        };
        if series.is_empty() {
            return;
        }
        debug!(group = %self.key(), count = series.len(), "writing staleness markers for removed group");
        let mut app = self.services.appendable.appender();
        for metric in series {
            if let Err(e) = app.append(Sample::new(metric, ts, stale_nan())).await {
                debug!(group = %self.key(), error = %e, "failed to append staleness marker");
            }
        }
        if let Err(e) = app.commit().await {
            warn!(group = %self.key(), error = %e, "failed to commit staleness markers");
        }
    }

    // ── Restoration and reload ──────────────────────────────────────

    /// One-shot alert for-state restoration, run after the first tick.
    async fn restore_for_state(&self, ts: DateTime<Utc>) {
        let key = self.key();
        debug!(group = %key, "restoring alert state");
        for rule in &self.rules {
            if let Some(alerting) = rule.as_alerting() {
                alerting
                    .restore_for_state(
                        &*self.services.queryable,
                        ts,
                        self.services.outage_tolerance,
                        self.services.for_grace_period,
                        &key,
                    )
                    .await;
            }
        }
    }

    /// Transfer runtime state from a drained older incarnation: alert maps,
    /// evaluation timestamps, and per-rule series tracking. Rules are
    /// matched by name; series of unmatched old rules are queued for
    /// staleness markers.
    pub fn copy_state(&self, from: &Group) {
        let from_state = from.state.read().expect("group state lock poisoned");
        let mut state = self.state.write().expect("group state lock poisoned");

        state.last_eval_ts = from_state.last_eval_ts;
        state.last_evaluation = from_state.last_evaluation;
        state.last_duration = from_state.last_duration;

        let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, rule) in from.rules.iter().enumerate() {
            by_name.entry(rule.name()).or_default().push(idx);
        }

        for (idx, rule) in self.rules.iter().enumerate() {
            let Some(candidates) = by_name.get_mut(rule.name()) else {
                continue;
            };
            if candidates.is_empty() {
                continue;
            }
            let from_idx = candidates.remove(0);
            state.series_in_previous_eval[idx] =
                from_state.series_in_previous_eval[from_idx].clone();
            if let (Some(new_alerting), Some(old_alerting)) = (
                rule.as_alerting(),
                from.rules[from_idx].as_alerting(),
            ) {
                new_alerting.copy_active_from(old_alerting);
            }
        }

        // Series of old rules with no counterpart get staleness markers on
        // the next evaluation.
        state.stale_series.extend(from_state.stale_series.iter().cloned());
        for (idx, rule) in from.rules.iter().enumerate() {
            let unmatched = by_name
                .get(rule.name())
                .is_some_and(|c| c.contains(&idx));
            if unmatched {
                state
                    .stale_series
                    .extend(from_state.series_in_previous_eval[idx].values().cloned());
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
