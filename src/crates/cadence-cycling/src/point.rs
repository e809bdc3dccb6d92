//! Cycle points: immutable positions in a cycling domain
//!
//! A [`CyclePoint`] is a value from one of two totally-ordered domains:
//! plain integers, or ISO-8601 date-time instants (held in UTC). Workflows
//! use exactly one domain; combining values from different domains fails
//! loudly.

use crate::error::{CyclingError, Result};
use crate::interval::CycleInterval;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The value domain a point or interval belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclingMode {
    /// Plain integer cycling (1, 2, 3, ...)
    Integer,
    /// ISO-8601 date-time cycling, standardised to UTC
    DateTime,
}

impl fmt::Display for CyclingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclingMode::Integer => write!(f, "integer"),
            CyclingMode::DateTime => write!(f, "datetime"),
        }
    }
}

/// A discrete position at which the graph may instantiate
///
/// Points are immutable and totally ordered within their domain. The
/// canonical textual form is the decimal integer for the integer domain and
/// an RFC 3339 UTC timestamp with second precision for the date-time domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePoint {
    /// Integer-domain point
    Integer(i64),
    /// Date-time-domain point (UTC, second precision)
    DateTime(DateTime<Utc>),
}

impl CyclePoint {
    /// The domain this point belongs to
    pub fn mode(&self) -> CyclingMode {
        match self {
            CyclePoint::Integer(_) => CyclingMode::Integer,
            CyclePoint::DateTime(_) => CyclingMode::DateTime,
        }
    }

    /// Parse a point string in the given domain
    pub fn parse(s: &str, mode: CyclingMode) -> Result<Self> {
        match mode {
            CyclingMode::Integer => s
                .trim()
                .parse::<i64>()
                .map(CyclePoint::Integer)
                .map_err(|_| CyclingError::InvalidPoint(s.to_string())),
            CyclingMode::DateTime => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| CyclePoint::DateTime(dt.with_timezone(&Utc)).standardise())
                .map_err(|_| CyclingError::InvalidPoint(s.to_string())),
        }
    }

    /// Reduce the point to canonical form
    ///
    /// Integer points are already canonical; date-time points are truncated
    /// to whole seconds in UTC.
    pub fn standardise(self) -> Self {
        match self {
            CyclePoint::Integer(n) => CyclePoint::Integer(n),
            CyclePoint::DateTime(dt) => {
                let secs = dt.timestamp();
                CyclePoint::DateTime(
                    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(dt),
                )
            }
        }
    }

    /// Add an interval, yielding a new point
    pub fn add(&self, interval: &CycleInterval) -> Result<Self> {
        match (self, interval) {
            (CyclePoint::Integer(p), CycleInterval::Integer(i)) => p
                .checked_add(*i)
                .map(CyclePoint::Integer)
                .ok_or_else(|| CyclingError::Overflow(format!("{} + {}", p, i))),
            (CyclePoint::DateTime(p), CycleInterval::Duration(d)) => p
                .checked_add_signed(*d)
                .map(CyclePoint::DateTime)
                .ok_or_else(|| CyclingError::Overflow(format!("{} + {}", p, d))),
            _ => Err(self.mismatch(interval.mode())),
        }
    }

    /// Subtract an interval, yielding a new point
    pub fn sub(&self, interval: &CycleInterval) -> Result<Self> {
        self.add(&interval.neg())
    }

    /// The signed interval from `other` to `self`
    pub fn diff(&self, other: &CyclePoint) -> Result<CycleInterval> {
        match (self, other) {
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => a
                .checked_sub(*b)
                .map(CycleInterval::Integer)
                .ok_or_else(|| CyclingError::Overflow(format!("{} - {}", a, b))),
            (CyclePoint::DateTime(a), CyclePoint::DateTime(b)) => {
                Ok(CycleInterval::Duration(a.signed_duration_since(*b)))
            }
            _ => Err(self.mismatch(other.mode())),
        }
    }

    /// Compare two points, failing if their domains differ
    pub fn checked_cmp(&self, other: &CyclePoint) -> Result<Ordering> {
        match (self, other) {
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => Ok(a.cmp(b)),
            (CyclePoint::DateTime(a), CyclePoint::DateTime(b)) => Ok(a.cmp(b)),
            _ => Err(self.mismatch(other.mode())),
        }
    }

    fn mismatch(&self, other: CyclingMode) -> CyclingError {
        CyclingError::DomainMismatch {
            left: self.mode().to_string(),
            right: other.to_string(),
        }
    }
}

impl Ord for CyclePoint {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.checked_cmp(other) {
            Ok(ord) => ord,
            Err(e) => panic!("cycle point comparison across domains: {}", e),
        }
    }
}

impl PartialOrd for CyclePoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePoint::Integer(n) => write!(f, "{}", n),
            CyclePoint::DateTime(dt) => {
                write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        }
    }
}

impl FromStr for CyclePoint {
    type Err = CyclingError;

    /// Parse without a known domain: integer first, then RFC 3339
    fn from_str(s: &str) -> Result<Self> {
        CyclePoint::parse(s, CyclingMode::Integer)
            .or_else(|_| CyclePoint::parse(s, CyclingMode::DateTime))
    }
}

impl Serialize for CyclePoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CyclePoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_point() {
        let p = CyclePoint::parse("5", CyclingMode::Integer).unwrap();
        assert_eq!(p, CyclePoint::Integer(5));
        assert_eq!(p.to_string(), "5");
    }

    #[test]
    fn test_parse_datetime_point() {
        let p = CyclePoint::parse("2026-01-01T00:00:00Z", CyclingMode::DateTime).unwrap();
        assert_eq!(p.mode(), CyclingMode::DateTime);
        assert_eq!(p.to_string(), "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_parse_rejects_wrong_domain() {
        assert!(CyclePoint::parse("not-a-point", CyclingMode::Integer).is_err());
        assert!(CyclePoint::parse("5x", CyclingMode::DateTime).is_err());
    }

    #[test]
    fn test_add_and_sub_integer() {
        let p = CyclePoint::Integer(3);
        let q = p.add(&CycleInterval::Integer(2)).unwrap();
        assert_eq!(q, CyclePoint::Integer(5));
        assert_eq!(q.sub(&CycleInterval::Integer(2)).unwrap(), p);
    }

    #[test]
    fn test_add_datetime() {
        let p: CyclePoint = "2026-01-01T00:00:00Z".parse().unwrap();
        let q = p.add(&CycleInterval::Duration(chrono::Duration::hours(6))).unwrap();
        assert_eq!(q.to_string(), "2026-01-01T06:00:00Z");
    }

    #[test]
    fn test_domain_mismatch_fails() {
        let p = CyclePoint::Integer(1);
        let d = CycleInterval::Duration(chrono::Duration::hours(1));
        assert!(matches!(p.add(&d), Err(CyclingError::DomainMismatch { .. })));

        let q: CyclePoint = "2026-01-01T00:00:00Z".parse().unwrap();
        assert!(p.checked_cmp(&q).is_err());
    }

    #[test]
    #[should_panic(expected = "across domains")]
    fn test_ord_panics_on_mixed_domains() {
        let p = CyclePoint::Integer(1);
        let q: CyclePoint = "2026-01-01T00:00:00Z".parse().unwrap();
        let _ = p < q;
    }

    #[test]
    fn test_diff() {
        let a = CyclePoint::Integer(7);
        let b = CyclePoint::Integer(3);
        assert_eq!(a.diff(&b).unwrap(), CycleInterval::Integer(4));
    }

    #[test]
    fn test_standardise_truncates_subsecond() {
        let dt = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.750Z")
            .unwrap()
            .with_timezone(&Utc);
        let p = CyclePoint::DateTime(dt).standardise();
        assert_eq!(p.to_string(), "2026-01-01T00:00:00Z");
    }

    #[test]
    fn test_serde_round_trip() {
        let p = CyclePoint::Integer(12);
        let s = serde_json::to_string(&p).unwrap();
        assert_eq!(s, "\"12\"");
        let back: CyclePoint = serde_json::from_str(&s).unwrap();
        assert_eq!(back, p);
    }
}
