//! Human-readable duration parsing (`90s`, `2h30m`, `1d`, `250ms`).
//!
//! Rule files express intervals and hold durations as compact strings.
//! Components can be combined (`1h30m`); a bare number is seconds.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by [`parse_duration`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,

    #[error("unexpected character '{0}' in duration")]
    UnexpectedChar(char),

    #[error("unknown duration unit '{0}'")]
    UnknownUnit(char),

    #[error("trailing digits without a unit")]
    TrailingDigits,

    #[error("duration component out of range")]
    OutOfRange,
}

/// Parse a duration string.
///
/// Supported units: `d` (days), `h` (hours), `m` (minutes), `s` (seconds),
/// `ms` (milliseconds). Components can be combined: `2h30m`, `1d12h`, `90s`.
/// A bare number is interpreted as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut saw_unit = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        if num.is_empty() {
            return Err(DurationParseError::UnexpectedChar(c));
        }
        let n: u64 = num
            .parse()
            .map_err(|_| DurationParseError::OutOfRange)?;
        num.clear();
        let component = match c {
            'd' => Duration::from_secs(n.checked_mul(86_400).ok_or(DurationParseError::OutOfRange)?),
            'h' => Duration::from_secs(n.checked_mul(3_600).ok_or(DurationParseError::OutOfRange)?),
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    Duration::from_millis(n)
                } else {
                    Duration::from_secs(n.checked_mul(60).ok_or(DurationParseError::OutOfRange)?)
                }
            }
            's' => Duration::from_secs(n),
            other => return Err(DurationParseError::UnknownUnit(other)),
        };
        total += component;
        saw_unit = true;
    }

    if !num.is_empty() {
        if saw_unit {
            // Ambiguous: "30m15" has trailing digits after a unit.
            return Err(DurationParseError::TrailingDigits);
        }
        let n: u64 = num
            .parse()
            .map_err(|_| DurationParseError::OutOfRange)?;
        total = Duration::from_secs(n);
    }

    Ok(total)
}

/// Format a duration in the compact form accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let mut out = String::new();
    let mut secs = d.as_secs();
    let millis = d.subsec_millis();

    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3_600;
    secs %= 3_600;
    let mins = secs / 60;
    secs %= 60;

    if days > 0 {
        out.push_str(&format!("{}d", days));
    }
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        out.push_str(&format!("{}m", mins));
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    if millis > 0 {
        out.push_str(&format!("{}ms", millis));
    }
    out
}

/// Convert a std duration to a chrono duration, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

// ── Serde adapters ──────────────────────────────────────────────────

/// Raw YAML representation: a duration string or bare seconds.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Seconds(u64),
}

impl RawDuration {
    fn resolve<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            RawDuration::Text(s) => parse_duration(&s).map_err(E::custom),
            RawDuration::Seconds(n) => Ok(Duration::from_secs(n)),
        }
    }
}

/// Serde adapter for `Option<Duration>` fields holding `5m`-style strings.
///
/// Use with `#[serde(default, with = "serde_duration_opt")]`.
pub mod serde_duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_duration, RawDuration};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_some(&format_duration(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        match Option::<RawDuration>::deserialize(de)? {
            Some(raw) => raw.resolve().map(Some),
            None => Ok(None),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
