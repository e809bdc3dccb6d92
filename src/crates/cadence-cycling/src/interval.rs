//! Cycle intervals: signed offsets within a cycling domain
//!
//! An interval added to a point yields a point; added to another interval
//! it yields an interval. The textual form is `P<n>` for integer intervals
//! and an ISO-8601 duration (`P1D`, `PT6H`, `PT30S`, ...) for date-time
//! intervals, with an optional leading `-` for negative offsets.

use crate::error::{CyclingError, Result};
use crate::point::CyclingMode;
use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A signed offset in a cycling domain
///
/// Date-time intervals are held at second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleInterval {
    /// Integer-domain offset
    Integer(i64),
    /// Date-time-domain offset
    Duration(Duration),
}

impl CycleInterval {
    /// The domain this interval belongs to
    pub fn mode(&self) -> CyclingMode {
        match self {
            CycleInterval::Integer(_) => CyclingMode::Integer,
            CycleInterval::Duration(_) => CyclingMode::DateTime,
        }
    }

    /// A zero interval in the given domain
    pub fn zero(mode: CyclingMode) -> Self {
        match mode {
            CyclingMode::Integer => CycleInterval::Integer(0),
            CyclingMode::DateTime => CycleInterval::Duration(Duration::zero()),
        }
    }

    /// The smallest positive step in the given domain
    ///
    /// `P1` for integers, one second for date-times. Used for single-shot
    /// sequences where the step never actually advances.
    pub fn unit(mode: CyclingMode) -> Self {
        match mode {
            CyclingMode::Integer => CycleInterval::Integer(1),
            CyclingMode::DateTime => CycleInterval::Duration(Duration::seconds(1)),
        }
    }

    /// True if the offset is zero
    pub fn is_zero(&self) -> bool {
        match self {
            CycleInterval::Integer(n) => *n == 0,
            CycleInterval::Duration(d) => d.is_zero(),
        }
    }

    /// True if the offset is strictly negative
    pub fn is_negative(&self) -> bool {
        match self {
            CycleInterval::Integer(n) => *n < 0,
            CycleInterval::Duration(d) => *d < Duration::zero(),
        }
    }

    /// The negated interval
    pub fn neg(&self) -> Self {
        match self {
            CycleInterval::Integer(n) => CycleInterval::Integer(-n),
            CycleInterval::Duration(d) => CycleInterval::Duration(-*d),
        }
    }

    /// Add another interval of the same domain
    pub fn add(&self, other: &CycleInterval) -> Result<Self> {
        match (self, other) {
            (CycleInterval::Integer(a), CycleInterval::Integer(b)) => a
                .checked_add(*b)
                .map(CycleInterval::Integer)
                .ok_or_else(|| CyclingError::Overflow(format!("{} + {}", a, b))),
            (CycleInterval::Duration(a), CycleInterval::Duration(b)) => a
                .checked_add(b)
                .map(CycleInterval::Duration)
                .ok_or_else(|| CyclingError::Overflow(format!("{} + {}", a, b))),
            _ => Err(CyclingError::DomainMismatch {
                left: self.mode().to_string(),
                right: other.mode().to_string(),
            }),
        }
    }

    /// Multiply by an integer factor
    pub fn mul(&self, factor: i64) -> Result<Self> {
        match self {
            CycleInterval::Integer(n) => n
                .checked_mul(factor)
                .map(CycleInterval::Integer)
                .ok_or_else(|| CyclingError::Overflow(format!("{} * {}", n, factor))),
            CycleInterval::Duration(d) => d
                .num_seconds()
                .checked_mul(factor)
                .map(|s| CycleInterval::Duration(Duration::seconds(s)))
                .ok_or_else(|| CyclingError::Overflow(format!("{} * {}", d, factor))),
        }
    }

    /// Number of whole steps of `self` in `span`, rounding towards negative
    /// infinity, plus whether the division was exact
    ///
    /// Both intervals must share a domain and `self` must be non-zero.
    pub fn div_steps(&self, span: &CycleInterval) -> Result<(i64, bool)> {
        let (step, span) = match (self, span) {
            (CycleInterval::Integer(a), CycleInterval::Integer(b)) => (*a, *b),
            (CycleInterval::Duration(a), CycleInterval::Duration(b)) => {
                (a.num_seconds(), b.num_seconds())
            }
            _ => {
                return Err(CyclingError::DomainMismatch {
                    left: self.mode().to_string(),
                    right: span.mode().to_string(),
                })
            }
        };
        if step == 0 {
            return Err(CyclingError::InvalidStep("P0".to_string()));
        }
        Ok((span.div_euclid(step), span.rem_euclid(step) == 0))
    }
}

impl fmt::Display for CycleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleInterval::Integer(n) => {
                if *n < 0 {
                    write!(f, "-P{}", -n)
                } else {
                    write!(f, "P{}", n)
                }
            }
            CycleInterval::Duration(d) => {
                let total = d.num_seconds();
                let sign = if total < 0 { "-" } else { "" };
                let mut secs = total.abs();
                if secs == 0 {
                    return write!(f, "PT0S");
                }
                let days = secs / 86_400;
                secs %= 86_400;
                let hours = secs / 3_600;
                secs %= 3_600;
                let mins = secs / 60;
                secs %= 60;
                write!(f, "{}P", sign)?;
                if days > 0 {
                    write!(f, "{}D", days)?;
                }
                if hours > 0 || mins > 0 || secs > 0 {
                    write!(f, "T")?;
                    if hours > 0 {
                        write!(f, "{}H", hours)?;
                    }
                    if mins > 0 {
                        write!(f, "{}M", mins)?;
                    }
                    if secs > 0 {
                        write!(f, "{}S", secs)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl FromStr for CycleInterval {
    type Err = CyclingError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let body = body
            .strip_prefix('P')
            .ok_or_else(|| CyclingError::InvalidInterval(s.to_string()))?;

        // Bare digits after P: an integer-domain interval.
        if !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit()) {
            let n: i64 = body
                .parse()
                .map_err(|_| CyclingError::InvalidInterval(s.to_string()))?;
            return Ok(CycleInterval::Integer(if negative { -n } else { n }));
        }

        // ISO-8601 duration: [nD][T[nH][nM][nS]] at second resolution.
        let mut secs: i64 = 0;
        let (date_part, time_part) = match body.split_once('T') {
            Some((d, t)) => (d, t),
            None => (body, ""),
        };
        for (part, in_time) in [(date_part, false), (time_part, true)] {
            let mut digits = String::new();
            for ch in part.chars() {
                if ch.is_ascii_digit() {
                    digits.push(ch);
                    continue;
                }
                let n: i64 = digits
                    .parse()
                    .map_err(|_| CyclingError::InvalidInterval(s.to_string()))?;
                digits.clear();
                let unit = match (ch, in_time) {
                    ('W', false) => 7 * 86_400,
                    ('D', false) => 86_400,
                    ('H', true) => 3_600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return Err(CyclingError::InvalidInterval(s.to_string())),
                };
                secs = n
                    .checked_mul(unit)
                    .and_then(|v| secs.checked_add(v))
                    .ok_or_else(|| CyclingError::Overflow(s.to_string()))?;
            }
            if !digits.is_empty() {
                return Err(CyclingError::InvalidInterval(s.to_string()));
            }
        }
        if body == "T" || (date_part.is_empty() && time_part.is_empty()) {
            return Err(CyclingError::InvalidInterval(s.to_string()));
        }
        Ok(CycleInterval::Duration(Duration::seconds(if negative {
            -secs
        } else {
            secs
        })))
    }
}

impl Serialize for CycleInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CycleInterval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
