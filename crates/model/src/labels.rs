//! Label sets and equality matchers.
//!
//! A [`Labels`] value is a sorted name→value map identifying a series, an
//! alert instance, or a rule's static labels. Fingerprints are stable hashes
//! over the sorted pairs and are used to key per-label-set alert state.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Reserved label carrying the series name.
pub const METRIC_NAME: &str = "__name__";

/// Reserved label carrying the alert name on alerting-rule output.
pub const ALERT_NAME: &str = "alertname";

// ── Labels ──────────────────────────────────────────────────────────

/// An immutable, sorted set of name→value labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Create an empty label set.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build a label set from name/value pairs.
    pub fn from_pairs<N, V, I>(pairs: I) -> Self
    where
        N: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (N, V)>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }

    /// Build a label set from a plain map.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        Self(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Build a label set from several maps, later maps overriding earlier ones.
    pub fn from_maps<'a, I>(maps: I) -> Self
    where
        I: IntoIterator<Item = &'a HashMap<String, String>>,
    {
        let mut out = BTreeMap::new();
        for map in maps {
            for (k, v) in map {
                out.insert(k.clone(), v.clone());
            }
        }
        Self(out)
    }

    /// Look up a label value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Whether a label with the given name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// The series name (`__name__` label), if present.
    pub fn name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    /// Return a copy with the given label set (replacing any existing value).
    pub fn with(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut out = self.0.clone();
        out.insert(name.into(), value.into());
        Self(out)
    }

    /// Return a copy with the given label removed.
    pub fn without(&self, name: &str) -> Self {
        let mut out = self.0.clone();
        out.remove(name);
        Self(out)
    }

    /// Merge `other` over `self`: labels in `other` win on conflict.
    pub fn merge(&self, other: &Labels) -> Self {
        let mut out = self.0.clone();
        for (k, v) in &other.0 {
            out.insert(k.clone(), v.clone());
        }
        Self(out)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Deterministic fingerprint over the sorted pairs.
    ///
    /// Stable across processes and restarts; used to key alert state maps.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (k, v) in &self.0 {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", k, v)?;
        }
        write!(f, "}}")
    }
}

// ── Matchers ────────────────────────────────────────────────────────

/// Comparison operator of a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    /// Label value must equal the matcher value.
    Eq,
    /// Label value must not equal the matcher value.
    NotEq,
}

/// A single label matcher, e.g. `job="api"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl Matcher {
    /// Equality matcher `name="value"`.
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Eq,
            value: value.into(),
        }
    }

    /// Inequality matcher `name!="value"`.
    pub fn not_eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::NotEq,
            value: value.into(),
        }
    }

    /// Whether the matcher accepts the given label set.
    ///
    /// An absent label is treated as the empty string, so `name!=""` requires
    /// presence and `name=""` requires absence.
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.name).unwrap_or("");
        match self.op {
            MatchOp::Eq => value == self.value,
            MatchOp::NotEq => value != self.value,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            MatchOp::Eq => "=",
            MatchOp::NotEq => "!=",
        };
        write!(f, "{}{}{:?}", self.name, op, self.value)
    }
}

/// Whether every matcher in the set accepts the given label set.
pub fn matches_all(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

// ── Tests ───────────────────────────────────────────────────────────
