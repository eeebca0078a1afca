//! Alerting rules: the per-label-set alert state machine.
//!
//! Each distinct label set returned by the rule's expression owns one
//! [`Alert`] instance. Alerts move `pending → firing` once the `for`
//! hold-down elapses, keep firing through the `keep_firing_for` linger after
//! the series disappears, and are retained for a resend window after
//! resolution. Every tick persists one `ALERTS_FOR_STATE` sample per active
//! alert so the hold-down survives restarts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use vigil_model::expr::Expr;
use vigil_model::labels::{Labels, Matcher, ALERT_NAME, METRIC_NAME};
use vigil_model::sample::{is_stale_nan, Sample, Vector};
use vigil_model::store::Queryable;
use vigil_model::time::to_chrono;

use crate::manager::{NotifyFunc, QueryFunc};

use super::{EvalContext, EvalError, Rule, RuleCommon, RuleHealth, RuleKind};

/// Name of the series persisting each alert's `active_at` timestamp.
pub const ALERTS_FOR_STATE_NAME: &str = "ALERTS_FOR_STATE";

/// How long a resolved alert is retained before being dropped.
const RESOLVED_RETENTION: Duration = Duration::from_secs(15 * 60);

// ── Alert instances ─────────────────────────────────────────────────

/// Lifecycle state of a single alert instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    /// Resolved or never fired.
    Inactive,
    /// Series present, hold-down not yet elapsed.
    Pending,
    Firing,
}

/// One alert instance per distinct label set.
#[derive(Debug, Clone)]
pub struct Alert {
    pub state: AlertState,
    pub labels: Labels,
    pub annotations: Labels,
    /// Value of the sample that most recently sustained the alert.
    pub value: f64,
    /// When the series first appeared (start of the hold-down).
    pub active_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Horizon advertised to the notifier while the alert keeps firing.
    pub valid_until: Option<DateTime<Utc>>,
    /// When the series disappeared while the alert kept firing.
    pub keep_firing_since: Option<DateTime<Utc>>,
}

impl Alert {
    /// Whether the alert is due for (re)notification at `ts`.
    ///
    /// Pending alerts are never sent. A resolution is sent exactly once;
    /// firing alerts are resent after `resend_delay`.
    pub(crate) fn needs_sending(&self, ts: DateTime<Utc>, resend_delay: Duration) -> bool {
        if self.state == AlertState::Pending {
            return false;
        }
        if let Some(resolved) = self.resolved_at {
            return self.last_sent_at.is_none_or(|last| resolved > last);
        }
        match self.last_sent_at {
            None => true,
            Some(last) => last + to_chrono(resend_delay) <= ts,
        }
    }
}

// ── Alerting rule ───────────────────────────────────────────────────

/// A rule whose non-empty result creates or sustains alert instances.
#[derive(Debug)]
pub struct AlertingRule {
    name: String,
    expr: Expr,
    hold_for: Duration,
    keep_firing_for: Duration,
    labels: Labels,
    annotations: Labels,
    external_labels: Labels,
    /// False until for-state restoration has run (or was skipped).
    restored: AtomicBool,
    active: RwLock<HashMap<u64, Alert>>,
    common: RuleCommon,
}

impl AlertingRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        expr: Expr,
        hold_for: Duration,
        keep_firing_for: Duration,
        labels: Labels,
        annotations: Labels,
        external_labels: Labels,
        restored: bool,
    ) -> Self {
        Self {
            name: name.into(),
            expr,
            hold_for,
            keep_firing_for,
            labels,
            annotations,
            external_labels,
            restored: AtomicBool::new(restored),
            active: RwLock::new(HashMap::new()),
            common: RuleCommon::default(),
        }
    }

    pub fn hold_for(&self) -> Duration {
        self.hold_for
    }

    pub fn keep_firing_for(&self) -> Duration {
        self.keep_firing_for
    }

    pub fn annotations(&self) -> &Labels {
        &self.annotations
    }

    /// Whether for-state restoration has completed for this rule.
    pub fn restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    /// Snapshot of the current alert instances.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active
            .read()
            .expect("alert map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of the alerts currently in the firing state.
    pub fn firing_alerts(&self) -> Vec<Alert> {
        self.active
            .read()
            .expect("alert map lock poisoned")
            .values()
            .filter(|a| a.state == AlertState::Firing)
            .cloned()
            .collect()
    }

    /// Adopt the alert instances of an older incarnation of this rule.
    pub(crate) fn copy_active_from(&self, from: &AlertingRule) {
        let from_active = from.active.read().expect("alert map lock poisoned");
        let mut active = self.active.write().expect("alert map lock poisoned");
        for (fp, alert) in from_active.iter() {
            active.insert(*fp, alert.clone());
        }
    }

    fn for_state_sample(&self, alert: &Alert, ts: DateTime<Utc>) -> Sample {
        Sample::new(
            alert.labels.with(METRIC_NAME, ALERTS_FOR_STATE_NAME),
            ts,
            alert.active_at.timestamp() as f64,
        )
    }

    /// Send notifications for alerts due at `ts`, stamping `valid_until` and
    /// `last_sent_at`. Empty batches are not sent.
    pub(crate) async fn send_alerts(
        &self,
        ctx: &EvalContext,
        ts: DateTime<Utc>,
        resend_delay: Duration,
        interval: Duration,
        notify: &dyn NotifyFunc,
    ) {
        let delta = std::cmp::max(resend_delay, interval);
        let mut to_send = Vec::new();
        {
            let mut active = self.active.write().expect("alert map lock poisoned");
            for alert in active.values_mut() {
                if !alert.needs_sending(ts, resend_delay) {
                    continue;
                }
                alert.valid_until = Some(match alert.keep_firing_since {
                    // While lingering, advertise exactly the end of the window.
                    Some(since) if alert.state == AlertState::Firing => {
                        since + to_chrono(self.keep_firing_for)
                    }
                    _ => ts + to_chrono(delta * 4),
                });
                alert.last_sent_at = Some(ts);
                to_send.push(alert.clone());
            }
        }
        if !to_send.is_empty() {
            notify.notify(ctx, self.expr.source(), &to_send).await;
        }
    }

    /// Recover `active_at` for pending alerts from persisted
    /// `ALERTS_FOR_STATE` samples.
    ///
    /// Alerts whose outage exceeds `outage_tolerance` are left untouched;
    /// `for_grace_period` enforces a minimum wait before a restored alert
    /// may fire. Errors are non-fatal: the alert starts pending from the
    /// first evaluation as if no prior state existed.
    pub(crate) async fn restore_for_state(
        &self,
        queryable: &dyn Queryable,
        ts: DateTime<Utc>,
        outage_tolerance: Duration,
        for_grace_period: Duration,
        group_key: &str,
    ) {
        if self.hold_for.is_zero() {
            self.restored.store(true, Ordering::SeqCst);
            return;
        }

        let alerts: Vec<(u64, Labels)> = self
            .active
            .read()
            .expect("alert map lock poisoned")
            .iter()
            .map(|(fp, a)| (*fp, a.labels.clone()))
            .collect();

        for (fp, labels) in alerts {
            let mut matchers = vec![Matcher::eq(METRIC_NAME, ALERTS_FOR_STATE_NAME)];
            for (name, value) in labels.iter() {
                matchers.push(Matcher::eq(name, value));
            }

            let vector = match queryable.latest_samples(ts, &matchers).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        group = %group_key,
                        alert = %self.name,
                        error = %e,
                        "failed to restore alert state"
                    );
                    self.restored.store(true, Ordering::SeqCst);
                    return;
                }
            };
            let Some(sample) = vector.first() else {
                continue;
            };
            if is_stale_nan(sample.value) {
                continue;
            }
            let Some(restored_active_at) = DateTime::from_timestamp(sample.value as i64, 0) else {
                continue;
            };

            let down_at = sample.ts;
            let down_duration = ts - down_at;
            if down_duration >= to_chrono(outage_tolerance) {
                debug!(
                    group = %group_key,
                    alert = %self.name,
                    "outage exceeded tolerance, skipping alert state restoration"
                );
                continue;
            }

            let time_spent_pending = down_at - restored_active_at;
            let time_remaining = to_chrono(self.hold_for) - time_spent_pending;
            let active_at = if time_remaining <= chrono::Duration::zero() {
                // Should have fired already; fire on the next evaluation.
                restored_active_at
            } else if time_remaining < to_chrono(for_grace_period) {
                // Enforce a minimum wait before a restored alert may fire.
                ts + to_chrono(for_grace_period) - to_chrono(self.hold_for)
            } else {
                restored_active_at + down_duration
            };

            let mut active = self.active.write().expect("alert map lock poisoned");
            if let Some(alert) = active.get_mut(&fp) {
                debug!(
                    group = %group_key,
                    alert = %self.name,
                    active_at = %active_at,
                    "restored alert state"
                );
                alert.active_at = active_at;
            }
        }

        self.restored.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Rule for AlertingRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn expr(&self) -> &Expr {
        &self.expr
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn kind(&self) -> RuleKind {
        RuleKind::Alerting
    }

    async fn eval(
        &self,
        ctx: &EvalContext,
        query_time: DateTime<Utc>,
        query_offset: Duration,
        query: &dyn QueryFunc,
        _external_url: &str,
        limit: usize,
    ) -> Result<Vector, EvalError> {
        let ts = query_time + to_chrono(query_offset);
        let res = query.query(ctx, self.expr.source(), query_time).await?;

        let mut active = self.active.write().expect("alert map lock poisoned");

        // Create or refresh one alert per distinct result label set.
        let mut result_fps = HashSet::with_capacity(res.len());
        for sample in &res {
            let labels = self
                .external_labels
                .merge(&sample.metric.without(METRIC_NAME))
                .merge(&self.labels)
                .with(ALERT_NAME, self.name.as_str());
            let fp = labels.fingerprint();
            if !result_fps.insert(fp) {
                return Err(EvalError::DuplicateSeries);
            }
            let refreshed = match active.get_mut(&fp) {
                Some(alert) if alert.state != AlertState::Inactive => {
                    alert.value = sample.value;
                    alert.annotations = self.annotations.clone();
                    true
                }
                _ => false,
            };
            if !refreshed {
                // New alert, or a resolved one restarting from scratch.
                active.insert(
                    fp,
                    Alert {
                        state: AlertState::Pending,
                        labels,
                        annotations: self.annotations.clone(),
                        value: sample.value,
                        active_at: ts,
                        fired_at: None,
                        resolved_at: None,
                        last_sent_at: None,
                        valid_until: None,
                        keep_firing_since: None,
                    },
                );
            }
        }

        // Advance the state machine for every known alert.
        let mut vec = Vector::new();
        let mut gone = Vec::new();
        for (fp, alert) in active.iter_mut() {
            if !result_fps.contains(fp) {
                // The series disappeared.
                let mut keep_firing = false;
                if alert.state == AlertState::Firing && !self.keep_firing_for.is_zero() {
                    let since = *alert.keep_firing_since.get_or_insert(ts);
                    if ts - since < to_chrono(self.keep_firing_for) {
                        keep_firing = true;
                    }
                }
                if alert.state == AlertState::Pending
                    || alert
                        .resolved_at
                        .is_some_and(|r| ts - r > to_chrono(RESOLVED_RETENTION))
                {
                    gone.push(*fp);
                    continue;
                }
                if alert.state != AlertState::Inactive && !keep_firing {
                    alert.state = AlertState::Inactive;
                    alert.resolved_at = Some(ts);
                }
                if keep_firing {
                    vec.push(self.for_state_sample(alert, ts));
                }
                continue;
            }

            // Series present again: any linger window is void.
            alert.keep_firing_since = None;
            if alert.state == AlertState::Pending && ts - alert.active_at >= to_chrono(self.hold_for)
            {
                alert.state = AlertState::Firing;
                alert.fired_at = Some(ts);
            }
            vec.push(self.for_state_sample(alert, ts));
        }
        for fp in gone {
            active.remove(&fp);
        }

        if limit > 0 && result_fps.len() > limit {
            // The produced set is over budget; drop all state so a lower
            // cardinality result starts from a clean slate.
            active.clear();
            return Err(EvalError::LimitExceeded {
                got: result_fps.len(),
                limit,
            });
        }

        Ok(vec)
    }

    fn last_error(&self) -> Option<String> {
        self.common.last_error()
    }

    fn set_last_error(&self, err: Option<String>) {
        self.common.set_last_error(err)
    }

    fn health(&self) -> RuleHealth {
        self.common.health()
    }

    fn eval_duration(&self) -> Duration {
        self.common.eval_duration()
    }

    fn set_eval_duration(&self, d: Duration) {
        self.common.set_eval_duration(d)
    }

    fn set_dependency_rules(&self, deps: Vec<usize>) {
        self.common.set_dependencies(deps)
    }

    fn set_dependent_rules(&self, deps: Vec<usize>) {
        self.common.set_dependents(deps)
    }

    fn dependency_rules(&self) -> Option<Vec<usize>> {
        self.common.dependencies()
    }

    fn dependent_rules(&self) -> Option<Vec<usize>> {
        self.common.dependents()
    }

    fn as_alerting(&self) -> Option<&AlertingRule> {
        Some(self)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
