//! Concurrency control for rule evaluation.
//!
//! A [`RuleConcurrencyController`] partitions a group's rules into ordered
//! batches that respect the dependency DAG, and owns the global admission
//! budget. Admission is strictly non-blocking: when the budget is exhausted
//! the caller evaluates inline instead of queueing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::group::Group;

/// Indices of rules that may be evaluated with no ordering constraint.
pub type ConcurrentRules = Vec<usize>;

/// Bounds and orders concurrent rule evaluation.
///
/// Concurrency is controlled globally, not per group: one controller is
/// shared by every group the manager owns.
pub trait RuleConcurrencyController: Send + Sync {
    /// Split a group into ordered batches. Evaluating all rules of batch *k*
    /// before starting batch *k+1* is sufficient to respect dependencies.
    fn split_group_into_batches(&self, group: &Group) -> Vec<ConcurrentRules>;

    /// Non-blocking admission for one rule evaluation. When this returns
    /// true the caller must call [`done`](RuleConcurrencyController::done)
    /// exactly once after the evaluation completes.
    fn allow(&self, group: &Group, rule_idx: usize) -> bool;

    /// Release a previously acquired admission slot.
    fn done(&self);
}

impl<T: RuleConcurrencyController + ?Sized> RuleConcurrencyController for Arc<T> {
    fn split_group_into_batches(&self, group: &Group) -> Vec<ConcurrentRules> {
        (**self).split_group_into_batches(group)
    }

    fn allow(&self, group: &Group, rule_idx: usize) -> bool {
        (**self).allow(group, rule_idx)
    }

    fn done(&self) {
        (**self).done()
    }
}

// ── Sequential (default) ────────────────────────────────────────────

/// Runs every rule sequentially: one singleton batch per rule in source
/// order, admission always denied.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialController;

impl RuleConcurrencyController for SequentialController {
    fn split_group_into_batches(&self, group: &Group) -> Vec<ConcurrentRules> {
        (0..group.rules().len()).map(|i| vec![i]).collect()
    }

    fn allow(&self, _group: &Group, _rule_idx: usize) -> bool {
        false
    }

    fn done(&self) {}
}

// ── Concurrent ──────────────────────────────────────────────────────

/// Admits up to `max_concurrency` rule evaluations process-wide and layers
/// each group's DAG into concurrently evaluable batches.
#[derive(Debug)]
pub struct ConcurrentController {
    semaphore: Semaphore,
}

impl ConcurrentController {
    /// Create a controller with the given global budget (`max ≥ 1`).
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrency.max(1)),
        }
    }
}

impl RuleConcurrencyController for ConcurrentController {
    fn split_group_into_batches(&self, group: &Group) -> Vec<ConcurrentRules> {
        let rules = group.rules();

        // Indeterminate analysis on any rule forces the sequential plan.
        if rules
            .iter()
            .any(|r| r.dependency_rules().is_none() || r.dependent_rules().is_none())
        {
            info!(
                group = %group.name(),
                "rule dependencies indeterminate, falling back to sequential rule evaluation"
            );
            return SequentialController.split_group_into_batches(group);
        }

        // Kahn's layering: peel off rules whose dependencies have all been
        // scheduled in earlier batches.
        let mut remaining: HashMap<usize, HashSet<usize>> = HashMap::new();
        let mut first = ConcurrentRules::new();
        for (idx, rule) in rules.iter().enumerate() {
            if rule.no_dependency_rules() {
                first.push(idx);
                continue;
            }
            let deps = rule.dependency_rules().unwrap_or_default();
            remaining.insert(idx, deps.into_iter().collect());
        }
        if first.is_empty() {
            info!(
                group = %group.name(),
                "no rules without dependencies found, falling back to sequential rule evaluation"
            );
            return SequentialController.split_group_into_batches(group);
        }

        let mut order = vec![first];
        while !remaining.is_empty() {
            let previous = order.last().expect("order is never empty").clone();
            for &idx in &previous {
                for dependent in rules[idx].dependent_rules().unwrap_or_default() {
                    if let Some(deps) = remaining.get_mut(&dependent) {
                        deps.remove(&idx);
                    }
                }
            }

            let mut batch: ConcurrentRules = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(&idx, _)| idx)
                .collect();
            if batch.is_empty() {
                warn!(
                    group = %group.name(),
                    "cyclic rule dependencies detected, falling back to sequential rule evaluation"
                );
                return SequentialController.split_group_into_batches(group);
            }
            batch.sort_unstable();
            for idx in &batch {
                remaining.remove(idx);
            }
            order.push(batch);
        }

        order
    }

    fn allow(&self, _group: &Group, _rule_idx: usize) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn done(&self) {
        self.semaphore.add_permits(1);
    }
}

// ── Tests ───────────────────────────────────────────────────────────
