//! Static analysis of inter-rule data dependencies within a group.
//!
//! A rule R1 depends on R2 iff R2 is a recording rule and R1's expression
//! reads R2's output series. The analysis is conservative: if any rule's
//! expression cannot be resolved to a closed selector set, or an output name
//! has more than one producer, no map is built and evaluation stays
//! sequential.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use vigil_model::expr::Selector;
use vigil_model::labels::{Labels, MatchOp};

use crate::rule::{Rule, RuleKind};

/// Bidirectional dependency graph over a group's rules, addressed by stable
/// rule index.
#[derive(Debug, Default)]
pub struct DependencyMap {
    dependencies: HashMap<usize, BTreeSet<usize>>,
    dependents: HashMap<usize, BTreeSet<usize>>,
}

impl DependencyMap {
    /// Build the dependency map for a rule list.
    ///
    /// Returns `None` (forcing sequential evaluation) when the group has
    /// fewer than two rules, when any expression is not statically
    /// analysable, or when an output series name is produced by more than
    /// one rule.
    pub fn build(rules: &[Arc<dyn Rule>]) -> Option<Self> {
        if rules.len() <= 1 {
            return None;
        }

        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            if rule.kind() == RuleKind::Recording
                && producers.insert(rule.name(), idx).is_some()
            {
                // Ambiguous producer.
                return None;
            }
        }

        let mut map = DependencyMap::default();
        for (idx, rule) in rules.iter().enumerate() {
            let selectors = rule.expr().selectors()?;
            for selector in selectors {
                let Some(&producer) = producers.get(selector.name.as_str()) else {
                    continue;
                };
                if producer == idx {
                    continue;
                }
                if selector_compatible(selector, rules[producer].labels()) {
                    map.dependencies.entry(idx).or_default().insert(producer);
                    map.dependents.entry(producer).or_default().insert(idx);
                }
            }
        }
        Some(map)
    }

    /// Indices of the rules `idx` reads from, in ascending order.
    pub fn dependencies(&self, idx: usize) -> Vec<usize> {
        self.dependencies
            .get(&idx)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Indices of the rules reading `idx`'s output, in ascending order.
    pub fn dependents(&self, idx: usize) -> Vec<usize> {
        self.dependents
            .get(&idx)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Whether a selector could match the output of a producer carrying the
/// given static labels. Only a contradicting equality matcher can rule a
/// producer out; anything else keeps the edge (conservative).
fn selector_compatible(selector: &Selector, producer_labels: &Labels) -> bool {
    selector.matchers.iter().all(|m| {
        let Some(value) = producer_labels.get(&m.name) else {
            // The producer does not pin this label; samples may carry any value.
            return true;
        };
        match m.op {
            MatchOp::Eq => value == m.value,
            MatchOp::NotEq => value != m.value,
        }
    })
}

// ── Controller ──────────────────────────────────────────────────────

/// Analyses dependencies between a group's rules and stores the result on
/// the rules themselves.
pub trait RuleDependencyController: Send + Sync {
    /// For each rule proven to have no dependants and/or dependencies, call
    /// `set_dependent_rules` / `set_dependency_rules` with the analysis
    /// result. Leaving a rule un-analysed forces sequential evaluation.
    fn analyse_rules(&self, rules: &[Arc<dyn Rule>]);
}

impl<T: RuleDependencyController + ?Sized> RuleDependencyController for Arc<T> {
    fn analyse_rules(&self, rules: &[Arc<dyn Rule>]) {
        (**self).analyse_rules(rules)
    }
}

/// The default controller: [`DependencyMap::build`] applied to every group.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDependencyController;

impl RuleDependencyController for DefaultDependencyController {
    fn analyse_rules(&self, rules: &[Arc<dyn Rule>]) {
        let Some(map) = DependencyMap::build(rules) else {
            return;
        };
        for (idx, rule) in rules.iter().enumerate() {
            rule.set_dependency_rules(map.dependencies(idx));
            rule.set_dependent_rules(map.dependents(idx));
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
