//! The polymorphic rule capability set.
//!
//! Rules come in two variants, dispatched through the [`Rule`] trait:
//! [`RecordingRule`] persists its result as a derived series, and
//! [`AlertingRule`] turns non-empty results into alert instances. Dependency
//! introspection uses stable rule indices within the owning group so the
//! graph carries no pointer cycles.

mod alerting;
mod recording;

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_model::expr::Expr;
use vigil_model::labels::Labels;
use vigil_model::sample::Vector;
use vigil_model::store::QueryError;

use crate::manager::QueryFunc;
use crate::signal::Signal;

pub use alerting::{Alert, AlertState, AlertingRule, ALERTS_FOR_STATE_NAME};
pub use recording::RecordingRule;

// ── Errors ──────────────────────────────────────────────────────────

/// Errors produced by a single rule evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("vector contains metrics with the same labelset after applying rule labels")]
    DuplicateSeries,

    #[error("exceeded limit of {limit} with {got} series")]
    LimitExceeded { got: usize, limit: usize },

    #[error("evaluation cancelled")]
    Cancelled,
}

// ── Evaluation context ──────────────────────────────────────────────

/// Cancellation and identity context threaded through an evaluation, from
/// the group scheduler down into the query function and notifier.
#[derive(Debug, Clone)]
pub struct EvalContext {
    stop: Signal,
    group_key: String,
}

impl EvalContext {
    pub fn new(stop: Signal, group_key: impl Into<String>) -> Self {
        Self {
            stop,
            group_key: group_key.into(),
        }
    }

    /// Key of the group this evaluation belongs to.
    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    /// Whether the owning group or manager is stopping.
    pub fn is_cancelled(&self) -> bool {
        self.stop.is_fired()
    }

    /// Resolves when the owning group or manager starts stopping. Query and
    /// notify implementations can `select!` against this to return promptly.
    pub async fn cancelled(&self) {
        self.stop.wait().await
    }
}

// ── Rule kinds and health ───────────────────────────────────────────

/// The two rule variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Recording,
    Alerting,
}

/// Health of a rule's most recent evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleHealth {
    /// Not evaluated yet.
    #[default]
    Unknown,
    /// Last evaluation succeeded.
    Good,
    /// Last evaluation failed.
    Bad,
}

// ── Rule trait ──────────────────────────────────────────────────────

/// Capability set shared by recording and alerting rules.
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// The parsed query expression.
    fn expr(&self) -> &Expr;

    /// The rule's static labels (group labels merged with per-rule labels).
    fn labels(&self) -> &Labels;

    fn kind(&self) -> RuleKind;

    /// Evaluate the rule.
    ///
    /// `query_time` is already offset-adjusted (`T_eval − query_offset`);
    /// produced samples and alert-state transitions are stamped at
    /// `query_time + query_offset`.
    async fn eval(
        &self,
        ctx: &EvalContext,
        query_time: DateTime<Utc>,
        query_offset: Duration,
        query: &dyn QueryFunc,
        external_url: &str,
        limit: usize,
    ) -> Result<Vector, EvalError>;

    fn last_error(&self) -> Option<String>;

    /// Record the outcome of the last evaluation; `None` marks it healthy.
    fn set_last_error(&self, err: Option<String>);

    fn health(&self) -> RuleHealth;

    fn eval_duration(&self) -> Duration;

    fn set_eval_duration(&self, d: Duration);

    /// Record the indices of rules this rule reads from (analysis result).
    fn set_dependency_rules(&self, deps: Vec<usize>);

    /// Record the indices of rules that read this rule's output.
    fn set_dependent_rules(&self, deps: Vec<usize>);

    /// Indices of rules this rule depends on; `None` until analysed.
    fn dependency_rules(&self) -> Option<Vec<usize>>;

    /// Indices of rules depending on this one; `None` until analysed.
    fn dependent_rules(&self) -> Option<Vec<usize>>;

    /// True iff the analyser proved the rule has no dependants and no
    /// dependencies.
    fn no_dependency_rules(&self) -> bool {
        matches!(
            (
                self.dependency_rules().as_deref(),
                self.dependent_rules().as_deref()
            ),
            (Some([]), Some([]))
        )
    }

    fn as_alerting(&self) -> Option<&AlertingRule> {
        None
    }

    fn as_recording(&self) -> Option<&RecordingRule> {
        None
    }
}

/// Structural equality used by group reload comparison: same kind, name,
/// normalised expression text, labels, and (for alerting rules) annotations
/// and hold durations.
pub fn rules_equal(a: &dyn Rule, b: &dyn Rule) -> bool {
    if a.kind() != b.kind()
        || a.name() != b.name()
        || a.expr().source() != b.expr().source()
        || a.labels() != b.labels()
    {
        return false;
    }
    match (a.as_alerting(), b.as_alerting()) {
        (Some(x), Some(y)) => {
            x.hold_for() == y.hold_for()
                && x.keep_firing_for() == y.keep_firing_for()
                && x.annotations() == y.annotations()
        }
        (None, None) => true,
        _ => false,
    }
}

// ── Shared per-rule runtime state ───────────────────────────────────

/// Evaluation health and dependency-analysis state common to both variants.
#[derive(Debug, Default)]
pub(crate) struct RuleCommon {
    state: RwLock<CommonState>,
}

#[derive(Debug, Default)]
struct CommonState {
    health: RuleHealth,
    last_error: Option<String>,
    eval_duration: Duration,
    dependencies: Option<Vec<usize>>,
    dependents: Option<Vec<usize>>,
}

impl RuleCommon {
    pub(crate) fn last_error(&self) -> Option<String> {
        self.state.read().expect("rule state lock poisoned").last_error.clone()
    }

    pub(crate) fn set_last_error(&self, err: Option<String>) {
        let mut st = self.state.write().expect("rule state lock poisoned");
        st.health = if err.is_some() {
            RuleHealth::Bad
        } else {
            RuleHealth::Good
        };
        st.last_error = err;
    }

    pub(crate) fn health(&self) -> RuleHealth {
        self.state.read().expect("rule state lock poisoned").health
    }

    pub(crate) fn eval_duration(&self) -> Duration {
        self.state.read().expect("rule state lock poisoned").eval_duration
    }

    pub(crate) fn set_eval_duration(&self, d: Duration) {
        self.state.write().expect("rule state lock poisoned").eval_duration = d;
    }

    pub(crate) fn set_dependencies(&self, deps: Vec<usize>) {
        self.state.write().expect("rule state lock poisoned").dependencies = Some(deps);
    }

    pub(crate) fn set_dependents(&self, deps: Vec<usize>) {
        self.state.write().expect("rule state lock poisoned").dependents = Some(deps);
    }

    pub(crate) fn dependencies(&self) -> Option<Vec<usize>> {
        self.state.read().expect("rule state lock poisoned").dependencies.clone()
    }

    pub(crate) fn dependents(&self) -> Option<Vec<usize>> {
        self.state.read().expect("rule state lock poisoned").dependents.clone()
    }
}
