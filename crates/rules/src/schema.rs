//! Rule-file format with serde deserialization.
//!
//! A rule file holds a list of named groups; each group holds recording
//! rules (`record:` + `expr:`) and alerting rules (`alert:` + `expr:` with
//! optional `for:`, `keep_firing_for:`, labels and annotations). Group-level
//! labels are merged into each rule with per-rule labels winning.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vigil_model::labels::{ALERT_NAME, METRIC_NAME};
use vigil_model::time::serde_duration_opt;

// ── File and group specs ────────────────────────────────────────────

/// A parsed rule file: the top-level `groups:` list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

/// A named rule group sharing one evaluation interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSpec {
    pub name: String,
    /// Evaluation interval; defaults to the manager-wide interval.
    #[serde(default, with = "serde_duration_opt", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    /// Offset subtracted from the evaluation timestamp before querying.
    #[serde(default, with = "serde_duration_opt", skip_serializing_if = "Option::is_none")]
    pub query_offset: Option<Duration>,
    /// Maximum number of series a rule may produce per iteration (0 = unlimited).
    #[serde(default)]
    pub limit: usize,
    /// Group-level labels merged into each rule.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// A single recording or alerting rule definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Output series name; present on recording rules only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    /// Alert name; present on alerting rules only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    pub expr: String,
    /// Hold-down before a pending alert may fire.
    #[serde(
        default,
        rename = "for",
        with = "serde_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub hold_for: Option<Duration>,
    /// Linger window after resolution during which the alert keeps firing.
    #[serde(default, with = "serde_duration_opt", skip_serializing_if = "Option::is_none")]
    pub keep_firing_for: Option<Duration>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl RuleSpec {
    /// Whether this is an alerting rule.
    pub fn is_alerting(&self) -> bool {
        self.alert.is_some()
    }
}

// ── Validation ──────────────────────────────────────────────────────

/// Whether `name` is a valid series/alert name (`[a-zA-Z_:][a-zA-Z0-9_:]*`).
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

impl RuleFile {
    /// Validate structural constraints. Returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut seen_groups = HashSet::new();

        for group in &self.groups {
            if group.name.is_empty() {
                problems.push("group name must not be empty".to_string());
            }
            if !seen_groups.insert(group.name.as_str()) {
                problems.push(format!("group name repeated in the same file: {:?}", group.name));
            }
            for reserved in [METRIC_NAME, ALERT_NAME] {
                if group.labels.contains_key(reserved) {
                    problems.push(format!(
                        "group {:?}: label {:?} is reserved",
                        group.name, reserved
                    ));
                }
            }
            for (idx, rule) in group.rules.iter().enumerate() {
                let at = format!("group {:?}, rule {}", group.name, idx);
                match (&rule.record, &rule.alert) {
                    (Some(_), Some(_)) => {
                        problems.push(format!("{}: only one of record and alert may be set", at));
                    }
                    (None, None) => {
                        problems.push(format!("{}: one of record or alert must be set", at));
                    }
                    (Some(record), None) => {
                        if !is_valid_name(record) {
                            problems.push(format!("{}: invalid recording rule name {:?}", at, record));
                        }
                        if rule.hold_for.is_some() {
                            problems.push(format!("{}: 'for' is not allowed on recording rules", at));
                        }
                        if rule.keep_firing_for.is_some() {
                            problems.push(format!(
                                "{}: 'keep_firing_for' is not allowed on recording rules",
                                at
                            ));
                        }
                        if !rule.annotations.is_empty() {
                            problems.push(format!(
                                "{}: annotations are not allowed on recording rules",
                                at
                            ));
                        }
                    }
                    (None, Some(alert)) => {
                        if !is_valid_name(alert) {
                            problems.push(format!("{}: invalid alert name {:?}", at, alert));
                        }
                    }
                }
                if rule.expr.trim().is_empty() {
                    problems.push(format!("{}: expr must not be empty", at));
                }
                for reserved in [METRIC_NAME, ALERT_NAME] {
                    if rule.labels.contains_key(reserved) {
                        problems.push(format!("{}: label {:?} is reserved", at, reserved));
                    }
                }
            }
        }
        problems
    }
}

// ── Tests ───────────────────────────────────────────────────────────
