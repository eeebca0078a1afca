//! The rule manager: a hot-reloadable registry of rule groups.
//!
//! [`Manager::update`] performs the drain-and-swap reload dance: load all
//! files or keep the previous set, reuse structurally equal groups, stop and
//! copy state into replacements, and start new groups gated on the one-shot
//! `block` signal released by [`Manager::run`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use vigil_model::labels::{matches_all, Labels, Matcher};
use vigil_model::sample::{QueryValue, Sample, Vector};
use vigil_model::store::{Appendable, QueryEngine, QueryError, Queryable};

use crate::concurrency::{ConcurrentController, RuleConcurrencyController, SequentialController};
use crate::dependency::{DefaultDependencyController, RuleDependencyController};
use crate::group::{EvalIterationFunc, Group, GroupOptions};
use crate::loader::{FileLoader, GroupLoader, RuleError};
use crate::metrics::RuleGroupMetrics;
use crate::rule::{Alert, AlertingRule, EvalContext, RecordingRule, Rule, RuleKind};
use crate::signal::Signal;

// ── Collaborator seams ──────────────────────────────────────────────

/// Executes an instant query on behalf of a rule evaluation.
#[async_trait]
pub trait QueryFunc: Send + Sync {
    async fn query(
        &self,
        ctx: &EvalContext,
        expr: &str,
        at: DateTime<Utc>,
    ) -> Result<Vector, QueryError>;
}

#[async_trait]
impl<T: QueryFunc + ?Sized> QueryFunc for Arc<T> {
    async fn query(
        &self,
        ctx: &EvalContext,
        expr: &str,
        at: DateTime<Utc>,
    ) -> Result<Vector, QueryError> {
        (**self).query(ctx, expr, at).await
    }
}

/// Delivers notifications about alerts generated by the given expression.
#[async_trait]
pub trait NotifyFunc: Send + Sync {
    async fn notify(&self, ctx: &EvalContext, expr: &str, alerts: &[Alert]);
}

#[async_trait]
impl<T: NotifyFunc + ?Sized> NotifyFunc for Arc<T> {
    async fn notify(&self, ctx: &EvalContext, expr: &str, alerts: &[Alert]) {
        (**self).notify(ctx, expr, alerts).await
    }
}

/// [`QueryFunc`] backed by a [`QueryEngine`].
///
/// Scalar results are wrapped as a one-sample vector with empty labels; any
/// other non-vector shape is an error.
pub struct EngineQueryFunc {
    engine: Arc<dyn QueryEngine>,
}

impl EngineQueryFunc {
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl QueryFunc for EngineQueryFunc {
    async fn query(
        &self,
        _ctx: &EvalContext,
        expr: &str,
        at: DateTime<Utc>,
    ) -> Result<Vector, QueryError> {
        match self.engine.instant_query(expr, at).await? {
            QueryValue::Vector(v) => Ok(v),
            QueryValue::Scalar(s) => Ok(vec![Sample::new(Labels::new(), s.ts, s.value)]),
            _ => Err(QueryError::InvalidResultType),
        }
    }
}

// ── Notification payloads ───────────────────────────────────────────

/// One alert as handed to the downstream sender.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPayload {
    pub labels: Labels,
    pub annotations: Labels,
    /// When the alert started firing.
    pub starts_at: Option<DateTime<Utc>>,
    /// Resolution time if resolved, else the advertised validity horizon.
    pub ends_at: Option<DateTime<Utc>>,
    /// Console link for the generating expression.
    pub generator_url: String,
}

/// Downstream delivery of alert payloads.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, alerts: Vec<AlertPayload>);
}

/// [`NotifyFunc`] that maps alerts to [`AlertPayload`]s for a sender.
/// Empty batches are never sent.
pub struct SendAlerts {
    sender: Arc<dyn AlertSender>,
    external_url: String,
}

impl SendAlerts {
    pub fn new(sender: Arc<dyn AlertSender>, external_url: impl Into<String>) -> Self {
        Self {
            sender,
            external_url: external_url.into(),
        }
    }
}

#[async_trait]
impl NotifyFunc for SendAlerts {
    async fn notify(&self, _ctx: &EvalContext, expr: &str, alerts: &[Alert]) {
        if alerts.is_empty() {
            return;
        }
        let generator_url = format!("{}{}", self.external_url, link_for_expression(expr));
        let payloads = alerts
            .iter()
            .map(|a| AlertPayload {
                labels: a.labels.clone(),
                annotations: a.annotations.clone(),
                starts_at: a.fired_at,
                ends_at: a.resolved_at.or(a.valid_until),
                generator_url: generator_url.clone(),
            })
            .collect();
        self.sender.send(payloads).await;
    }
}

/// Console link for an expression.
pub fn link_for_expression(expr: &str) -> String {
    format!("/graph?g0.expr={}&g0.tab=1", query_escape(expr))
}

/// `application/x-www-form-urlencoded` escaping.
fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

// ── Options ─────────────────────────────────────────────────────────

/// Everything a group needs from its manager to evaluate rules.
pub struct EvalServices {
    pub query: Arc<dyn QueryFunc>,
    pub notify: Arc<dyn NotifyFunc>,
    pub appendable: Arc<dyn Appendable>,
    pub queryable: Arc<dyn Queryable>,
    /// Prefix for generator URLs stamped on outgoing alerts.
    pub external_url: String,
    pub resend_delay: Duration,
    pub outage_tolerance: Duration,
    pub for_grace_period: Duration,
    /// Default offset subtracted from the evaluation timestamp before
    /// querying, for groups without their own `query_offset`.
    pub default_rule_query_offset: Option<Arc<dyn Fn() -> Duration + Send + Sync>>,
    pub concurrency: Arc<dyn RuleConcurrencyController>,
    pub metrics: Arc<RuleGroupMetrics>,
}

/// Options for [`Manager::new`]. Optional fields default as documented.
pub struct ManagerOptions {
    pub external_url: String,
    pub query: Arc<dyn QueryFunc>,
    pub notify: Arc<dyn NotifyFunc>,
    pub appendable: Arc<dyn Appendable>,
    pub queryable: Arc<dyn Queryable>,
    /// Alerts whose outage exceeds this window are not restored (default 1h).
    pub outage_tolerance: Duration,
    /// Minimum wait before a restored alert may fire (default 10m).
    pub for_grace_period: Duration,
    /// Minimum spacing between renotifications of a firing alert (default 1m).
    pub resend_delay: Duration,
    pub default_rule_query_offset: Option<Arc<dyn Fn() -> Duration + Send + Sync>>,
    /// Global admission budget when concurrent evaluation is enabled
    /// (default 4).
    pub max_concurrent_evals: usize,
    pub concurrent_evals_enabled: bool,
    /// Defaults to [`FileLoader`].
    pub group_loader: Option<Arc<dyn GroupLoader>>,
    /// Defaults to the variant selected by `concurrent_evals_enabled`.
    pub concurrency_controller: Option<Arc<dyn RuleConcurrencyController>>,
    /// Defaults to [`DefaultDependencyController`].
    pub dependency_controller: Option<Arc<dyn RuleDependencyController>>,
    /// Defaults to a fresh registry.
    pub metrics: Option<Arc<RuleGroupMetrics>>,
}

impl ManagerOptions {
    pub fn new(
        query: Arc<dyn QueryFunc>,
        notify: Arc<dyn NotifyFunc>,
        appendable: Arc<dyn Appendable>,
        queryable: Arc<dyn Queryable>,
    ) -> Self {
        Self {
            external_url: String::new(),
            query,
            notify,
            appendable,
            queryable,
            outage_tolerance: Duration::from_secs(3600),
            for_grace_period: Duration::from_secs(600),
            resend_delay: Duration::from_secs(60),
            default_rule_query_offset: None,
            max_concurrent_evals: 4,
            concurrent_evals_enabled: false,
            group_loader: None,
            concurrency_controller: None,
            dependency_controller: None,
            metrics: None,
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Returned by [`Manager::update`] when loading fails; the previous rule
/// set stays active.
#[derive(Debug, thiserror::Error)]
#[error("error loading rules, previous rule set preserved")]
pub struct UpdateError;

/// Manages recording and alerting rule groups.
pub struct Manager {
    services: Arc<EvalServices>,
    loader: Arc<dyn GroupLoader>,
    dependency: Arc<dyn RuleDependencyController>,
    groups: tokio::sync::RwLock<HashMap<String, Arc<Group>>>,
    /// Released once by `run`; group schedulers wait on it so reloads during
    /// bootstrap never query a half-initialised backend.
    block: Signal,
    done: Signal,
    /// Set by the first successful update; later loads skip for-state
    /// restoration.
    restored: AtomicBool,
}

impl Manager {
    pub fn new(opts: ManagerOptions) -> Self {
        let concurrency = opts.concurrency_controller.unwrap_or_else(|| {
            if opts.concurrent_evals_enabled {
                Arc::new(ConcurrentController::new(opts.max_concurrent_evals.max(1)))
            } else {
                Arc::new(SequentialController)
            }
        });
        let services = Arc::new(EvalServices {
            query: opts.query,
            notify: opts.notify,
            appendable: opts.appendable,
            queryable: opts.queryable,
            external_url: opts.external_url,
            resend_delay: opts.resend_delay,
            outage_tolerance: opts.outage_tolerance,
            for_grace_period: opts.for_grace_period,
            default_rule_query_offset: opts.default_rule_query_offset,
            concurrency,
            metrics: opts.metrics.unwrap_or_default(),
        });
        Self {
            services,
            loader: opts.group_loader.unwrap_or_else(|| Arc::new(FileLoader)),
            dependency: opts
                .dependency_controller
                .unwrap_or_else(|| Arc::new(DefaultDependencyController)),
            groups: tokio::sync::RwLock::new(HashMap::new()),
            block: Signal::new(),
            done: Signal::new(),
            restored: AtomicBool::new(false),
        }
    }

    /// The per-group metrics registry.
    pub fn metrics(&self) -> Arc<RuleGroupMetrics> {
        Arc::clone(&self.services.metrics)
    }

    /// Start processing: release the bootstrap gate and block until
    /// [`stop`](Manager::stop).
    pub async fn run(&self) {
        info!("starting rule manager");
        self.block.fire();
        self.done.wait().await;
    }

    /// Stop every group's evaluation cycle. Idempotent; `update` is a no-op
    /// afterwards.
    pub async fn stop(&self) {
        let groups = self.groups.write().await;
        if self.done.is_fired() {
            return;
        }
        info!("stopping rule manager");
        for group in groups.values() {
            group.stop().await;
        }
        self.done.fire();
        info!("rule manager stopped");
    }

    /// Hot reload: replace the rule set with the groups loaded from `files`.
    ///
    /// On load failure the previous rule set stays active. Structurally
    /// equal groups are reused in place (alert state untouched); replaced
    /// groups are drained, their state copied into the successor, and the
    /// successor started gated on the bootstrap signal.
    pub async fn update(
        &self,
        interval: Duration,
        files: &[PathBuf],
        external_labels: Labels,
        external_url: &str,
        eval_iteration: Option<EvalIterationFunc>,
    ) -> Result<(), UpdateError> {
        let mut groups_guard = self.groups.write().await;
        if self.done.is_fired() {
            return Ok(());
        }

        let loaded = match self.load_groups(interval, &external_labels, external_url, &eval_iteration, files) {
            Ok(groups) => groups,
            Err(errs) => {
                for e in errs {
                    error!(error = %e, "loading groups failed");
                }
                return Err(UpdateError);
            }
        };
        self.restored.store(true, Ordering::SeqCst);

        let mut old_groups = std::mem::take(&mut *groups_guard);
        let mut next = HashMap::with_capacity(loaded.len());
        let mut tasks = Vec::new();

        for (key, new_group) in loaded {
            let old = old_groups.remove(&key);
            if let Some(ref old_group) = old {
                if old_group.equals(&new_group) {
                    // Unchanged: keep the existing instance and its state.
                    next.insert(key, Arc::clone(old_group));
                    continue;
                }
            }
            next.insert(key, Arc::clone(&new_group));

            let block = self.block.clone();
            tasks.push(tokio::spawn(async move {
                if let Some(old_group) = old {
                    old_group.stop().await;
                    new_group.copy_state(&old_group);
                }
                // Start evaluating only once the manager is told to run.
                tokio::spawn(async move {
                    block.wait().await;
                    new_group.run().await;
                });
            }));
        }

        // Drain removed groups and delete their metric label values.
        for (key, old_group) in old_groups {
            let metrics = Arc::clone(&self.services.metrics);
            tasks.push(tokio::spawn(async move {
                old_group.set_mark_stale();
                old_group.stop().await;
                metrics.remove_group(&key);
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
        *groups_guard = next;
        Ok(())
    }

    /// Load and build groups from `files`; all-or-nothing.
    fn load_groups(
        &self,
        interval: Duration,
        external_labels: &Labels,
        external_url: &str,
        eval_iteration: &Option<EvalIterationFunc>,
        files: &[PathBuf],
    ) -> Result<HashMap<String, Arc<Group>>, Vec<RuleError>> {
        let should_restore = !self.restored.load(Ordering::SeqCst);
        let external_url = if external_url.is_empty() {
            self.services.external_url.clone()
        } else {
            external_url.to_string()
        };
        let mut groups = HashMap::new();

        for file in files {
            let rule_file = self.loader.load(file)?;
            let file_name = display_path(file);

            for spec in rule_file.groups {
                let mut rules: Vec<Arc<dyn Rule>> = Vec::with_capacity(spec.rules.len());
                for rule_spec in &spec.rules {
                    let expr = self
                        .loader
                        .parse(&rule_spec.expr)
                        .map_err(|e| vec![e])?;
                    let labels = Labels::from_maps([&spec.labels, &rule_spec.labels]);

                    if let Some(alert) = &rule_spec.alert {
                        rules.push(Arc::new(AlertingRule::new(
                            alert,
                            expr,
                            rule_spec.hold_for.unwrap_or_default(),
                            rule_spec.keep_firing_for.unwrap_or_default(),
                            labels,
                            Labels::from_map(&rule_spec.annotations),
                            external_labels.clone(),
                            self.restored.load(Ordering::SeqCst),
                        )));
                    } else if let Some(record) = &rule_spec.record {
                        rules.push(Arc::new(RecordingRule::new(record, expr, labels)));
                    }
                }

                // Dependency edges live on the rules themselves.
                self.dependency.analyse_rules(&rules);

                let group = Group::new(GroupOptions {
                    name: spec.name,
                    file: file_name.clone(),
                    interval: spec.interval.unwrap_or(interval),
                    limit: spec.limit,
                    query_offset: spec.query_offset,
                    external_url: external_url.clone(),
                    rules,
                    should_restore,
                    services: Arc::clone(&self.services),
                    eval_iteration: eval_iteration.clone(),
                });
                groups.insert(group.key(), group);
            }
        }
        Ok(groups)
    }

    /// The manager's groups, sorted by `(file, name)`.
    pub async fn rule_groups(&self) -> Vec<Arc<Group>> {
        let groups = self.groups.read().await;
        let mut out: Vec<Arc<Group>> = groups.values().cloned().collect();
        out.sort_by(|a, b| (a.file(), a.name()).cmp(&(b.file(), b.name())));
        out
    }

    /// Every rule whose labels satisfy at least one matcher set (all rules
    /// when no sets are given).
    pub async fn rules(&self, matcher_sets: &[Vec<Matcher>]) -> Vec<Arc<dyn Rule>> {
        let groups = self.groups.read().await;
        let mut out = Vec::new();
        for group in groups.values() {
            for rule in group.rules() {
                if matcher_sets.is_empty()
                    || matcher_sets.iter().any(|set| matches_all(set, rule.labels()))
                {
                    out.push(Arc::clone(rule));
                }
            }
        }
        out
    }

    /// Every alerting rule (each element satisfies `as_alerting()`).
    pub async fn alerting_rules(&self) -> Vec<Arc<dyn Rule>> {
        self.rules(&[])
            .await
            .into_iter()
            .filter(|r| r.kind() == RuleKind::Alerting)
            .collect()
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

// ── Tests ───────────────────────────────────────────────────────────
