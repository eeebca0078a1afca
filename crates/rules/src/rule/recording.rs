//! Recording rules: persist a query result as a named derived series.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_model::expr::Expr;
use vigil_model::labels::{Labels, METRIC_NAME};
use vigil_model::sample::Vector;
use vigil_model::time::to_chrono;

use crate::manager::QueryFunc;

use super::{EvalContext, EvalError, Rule, RuleCommon, RuleHealth, RuleKind};

/// A rule whose result is recorded as samples of a named series.
#[derive(Debug)]
pub struct RecordingRule {
    name: String,
    expr: Expr,
    labels: Labels,
    common: RuleCommon,
}

impl RecordingRule {
    pub fn new(name: impl Into<String>, expr: Expr, labels: Labels) -> Self {
        Self {
            name: name.into(),
            expr,
            labels,
            common: RuleCommon::default(),
        }
    }
}

#[async_trait]
impl Rule for RecordingRule {
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
        RuleKind::Recording
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
        let eval_time = query_time + to_chrono(query_offset);
        let mut vector = query.query(ctx, self.expr.source(), query_time).await?;

        // Rename each series to the rule's output name and stamp it with the
        // rule's static labels at the evaluation timestamp.
        let mut seen = HashSet::with_capacity(vector.len());
        for sample in &mut vector {
            sample.metric = sample
                .metric
                .merge(&self.labels)
                .with(METRIC_NAME, self.name.as_str());
            sample.ts = eval_time;
            if !seen.insert(sample.metric.fingerprint()) {
                return Err(EvalError::DuplicateSeries);
            }
        }

        if limit > 0 && vector.len() > limit {
            return Err(EvalError::LimitExceeded {
                got: vector.len(),
                limit,
            });
        }

        Ok(vector)
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

    fn as_recording(&self) -> Option<&RecordingRule> {
        Some(self)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
