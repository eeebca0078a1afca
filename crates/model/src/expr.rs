//! Query expressions with conservative static selector analysis.
//!
//! The evaluation core never interprets expressions itself (the query engine
//! does), but the dependency analyser needs to know which series an
//! expression *reads*. [`Expr::parse`] extracts that set with a conservative
//! scanner: when the expression contains anything it cannot resolve to a
//! closed set of selectors, the analysis is marked indeterminate and callers
//! fall back to sequential evaluation.

use crate::labels::{Matcher, METRIC_NAME};

/// A series selector inside an expression: a name plus label matchers.
///
/// Only equality/inequality matchers are retained; regex matchers are
/// dropped, which can only widen (never miss) a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub name: String,
    pub matchers: Vec<Matcher>,
}

/// A parsed query expression: normalised source text plus the statically
/// extracted selector set (`None` when indeterminate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
    source: String,
    selectors: Option<Vec<Selector>>,
}

impl Expr {
    /// Parse an expression: normalise the text and extract selectors.
    pub fn parse(input: &str) -> Self {
        let source = normalize(input);
        let chars: Vec<char> = source.chars().collect();
        let selectors = analyse(&chars);
        Self { source, selectors }
    }

    /// The whitespace-normalised expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The series read by this expression, or `None` when the expression
    /// could not be statically analysed.
    pub fn selectors(&self) -> Option<&[Selector]> {
        self.selectors.as_deref()
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

// ── Normalisation ───────────────────────────────────────────────────

/// Collapse whitespace runs outside string literals into single spaces.
fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.trim().chars().peekable();
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if let Some(quote) = in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            in_string = Some(c);
            out.push(c);
            continue;
        }
        if c.is_whitespace() {
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            out.push(' ');
            continue;
        }
        out.push(c);
    }
    out
}

// ── Selector extraction ─────────────────────────────────────────────

/// Words that look like identifiers but never name a series.
const KEYWORDS: &[&str] = &[
    "by", "without", "on", "ignoring", "group_left", "group_right", "offset",
    "bool", "and", "or", "unless", "atan2", "sum", "min", "max", "avg",
    "group", "stddev", "stdvar", "count", "count_values", "bottomk", "topk",
    "quantile", "limitk", "limit_ratio",
];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

/// Matcher operators recognised inside a selector block.
enum Op {
    Eq,
    NotEq,
    Re,
    NotRe,
}

fn analyse(chars: &[char]) -> Option<Vec<Selector>> {
    let len = chars.len();
    let mut out = Vec::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];

        if c == '"' || c == '\'' {
            (_, i) = read_string(chars, i)?;
            continue;
        }
        if c == '[' {
            // Range or subquery: contents are durations, never selectors.
            i = chars[i..].iter().position(|&c| c == ']').map(|p| i + p + 1)?;
            continue;
        }
        if c.is_ascii_digit() {
            // Number or duration literal (5m, 1e5, 0x1f).
            while i < len && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            continue;
        }
        if is_ident_start(c) {
            let start = i;
            while i < len && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();

            let mut j = i;
            while j < len && chars[j].is_whitespace() {
                j += 1;
            }
            if j < len && chars[j] == '(' {
                // Function or aggregation call.
                continue;
            }
            if KEYWORDS.contains(&ident.as_str()) {
                continue;
            }
            if j < len && chars[j] == '{' {
                let (matchers, block_name, end) = parse_matchers(chars, j)?;
                if block_name.is_some() {
                    // Name given both outside and inside the braces.
                    return None;
                }
                out.push(Selector {
                    name: ident,
                    matchers,
                });
                i = end;
            } else {
                out.push(Selector {
                    name: ident,
                    matchers: Vec::new(),
                });
            }
            continue;
        }
        if c == '{' {
            let (matchers, block_name, end) = parse_matchers(chars, i)?;
            // A bare matcher block must carry an equality __name__ matcher.
            let name = block_name?;
            out.push(Selector { name, matchers });
            i = end;
            continue;
        }

        // Operators, parens, commas.
        i += 1;
    }

    Some(out)
}

/// Parse a `{label=~"value", ...}` block starting at the opening brace.
///
/// Returns the retained matchers, the name contributed by an equality
/// `__name__` matcher (if any), and the index past the closing brace.
fn parse_matchers(chars: &[char], open: usize) -> Option<(Vec<Matcher>, Option<String>, usize)> {
    let len = chars.len();
    let mut matchers = Vec::new();
    let mut name = None;
    let mut i = open + 1;

    loop {
        while i < len && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= len {
            return None;
        }
        if chars[i] == '}' {
            return Some((matchers, name, i + 1));
        }

        if !is_ident_start(chars[i]) {
            return None;
        }
        let start = i;
        while i < len && is_ident_char(chars[i]) {
            i += 1;
        }
        let label: String = chars[start..i].iter().collect();

        while i < len && chars[i].is_whitespace() {
            i += 1;
        }
        let op = match chars.get(i)? {
            '=' => {
                i += 1;
                if chars.get(i) == Some(&'~') {
                    i += 1;
                    Op::Re
                } else {
                    Op::Eq
                }
            }
            '!' => {
                i += 1;
                match chars.get(i)? {
                    '=' => {
                        i += 1;
                        Op::NotEq
                    }
                    '~' => {
                        i += 1;
                        Op::NotRe
                    }
                    _ => return None,
                }
            }
            _ => return None,
        };

        while i < len && chars[i].is_whitespace() {
            i += 1;
        }
        let (value, next) = read_string(chars, i)?;
        i = next;

        match (label.as_str(), op) {
            (METRIC_NAME, Op::Eq) => name = Some(value),
            (METRIC_NAME, _) => return None,
            (_, Op::Eq) => matchers.push(Matcher::eq(label, value)),
            (_, Op::NotEq) => matchers.push(Matcher::not_eq(label, value)),
            // Regex matchers cannot exclude a producer; drop them.
            (_, Op::Re) | (_, Op::NotRe) => {}
        }

        while i < len && chars[i].is_whitespace() {
            i += 1;
        }
        match chars.get(i) {
            Some(',') => i += 1,
            Some('}') => {}
            _ => return None,
        }
    }
}

/// Read a quoted string starting at `i`; returns the contents and the index
/// past the closing quote.
fn read_string(chars: &[char], i: usize) -> Option<(String, usize)> {
    let quote = *chars.get(i)?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let mut out = String::new();
    let mut j = i + 1;
    while j < chars.len() {
        let c = chars[j];
        if c == '\\' {
            if let Some(&next) = chars.get(j + 1) {
                out.push(next);
                j += 2;
                continue;
            }
            return None;
        }
        if c == quote {
            return Some((out, j + 1));
        }
        out.push(c);
        j += 1;
    }
    None
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn names(expr: &str) -> Option<Vec<String>> {
        Expr::parse(expr)
            .selectors()
            .map(|s| s.iter().map(|sel| sel.name.clone()).collect())
    }

    #[test]
    fn bare_metric() {
        assert_eq!(names("up"), Some(vec!["up".to_string()]));
    }

    #[test]
    fn function_arguments_are_scanned() {
        assert_eq!(
            names("rate(http_requests_total[5m])"),
            Some(vec!["http_requests_total".to_string()])
        );
        assert_eq!(names("clamp_max(foo, 1)"), Some(vec!["foo".to_string()]));
    }

    #[test]
    fn arithmetic_and_set_operators() {
        assert_eq!(names("r1 + 1"), Some(vec!["r1".to_string()]));
        assert_eq!(
            names("a and b unless c"),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn aggregations_are_not_selectors() {
        assert_eq!(
            names("sum by (job) (rate(x[5m]))"),
            Some(vec!["x".to_string()])
        );
        assert_eq!(names("count(up)"), Some(vec!["up".to_string()]));
    }

    #[test]
    fn matcher_blocks() {
        let expr = Expr::parse(r#"up{job="api", env!="dev"}"#);
        let sels = expr.selectors().unwrap();
        assert_eq!(sels.len(), 1);
        assert_eq!(sels[0].name, "up");
        assert_eq!(
            sels[0].matchers,
            vec![Matcher::eq("job", "api"), Matcher::not_eq("env", "dev")]
        );
    }

    #[test]
    fn name_from_bare_block() {
        assert_eq!(
            names(r#"{__name__="up", job="api"}"#),
            Some(vec!["up".to_string()])
        );
    }

    #[test]
    fn bare_block_without_name_is_indeterminate() {
        assert_eq!(names(r#"{job="api"}"#), None);
    }

    #[test]
    fn regex_name_matcher_is_indeterminate() {
        assert_eq!(names(r#"{__name__=~"up.*"}"#), None);
    }

    #[test]
    fn regex_label_matchers_are_dropped() {
        let expr = Expr::parse(r#"x{job=~"a.*"}"#);
        let sels = expr.selectors().unwrap();
        assert_eq!(sels[0].name, "x");
        assert!(sels[0].matchers.is_empty());
    }

    #[test]
    fn offset_and_durations() {
        assert_eq!(names("x offset 5m"), Some(vec!["x".to_string()]));
        assert_eq!(names("avg_over_time(y[1h:5m])"), Some(vec!["y".to_string()]));
    }

    #[test]
    fn unclosed_block_is_indeterminate() {
        assert_eq!(names(r#"up{job="api""#), None);
        assert_eq!(names(r#"up{job="#), None);
    }

    #[test]
    fn strings_are_skipped() {
        assert_eq!(
            names(r#"label_replace(m, "dst", "$1", "src", "(.*)")"#),
            Some(vec!["m".to_string()])
        );
    }

    #[test]
    fn normalisation_collapses_whitespace() {
        let expr = Expr::parse("r1   +\n\t1");
        assert_eq!(expr.source(), "r1 + 1");
        // string contents keep their spacing
        let expr = Expr::parse(r#"x{job="a  b"}"#);
        assert_eq!(expr.source(), r#"x{job="a  b"}"#);
    }
}
