//! Recurrence rules over a cycling domain
//!
//! A [`CycleSequence`] enumerates the points `start + k * step` for
//! `k = 0, 1, 2, ...`, optionally bounded by a stop point or an occurrence
//! limit, and optionally skipping an exclusion list.

use crate::error::{CyclingError, Result};
use crate::interval::CycleInterval;
use crate::point::CyclePoint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A recurrence rule: initial point, step, optional bounds and exclusions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSequence {
    start: CyclePoint,
    step: CycleInterval,
    stop: Option<CyclePoint>,
    limit: Option<u64>,
    exclusions: Vec<CyclePoint>,
}

impl CycleSequence {
    /// Create an unbounded sequence from a start point and step
    ///
    /// The step must be strictly positive and share the start point's
    /// domain.
    pub fn new(start: CyclePoint, step: CycleInterval) -> Result<Self> {
        if step.mode() != start.mode() {
            return Err(CyclingError::DomainMismatch {
                left: start.mode().to_string(),
                right: step.mode().to_string(),
            });
        }
        if step.is_zero() || step.is_negative() {
            return Err(CyclingError::InvalidStep(step.to_string()));
        }
        Ok(Self {
            start,
            step,
            stop: None,
            limit: None,
            exclusions: Vec::new(),
        })
    }

    /// A single-occurrence sequence at one point
    pub fn once(point: CyclePoint) -> Self {
        Self {
            start: point,
            step: CycleInterval::unit(point.mode()),
            stop: None,
            limit: Some(1),
            exclusions: Vec::new(),
        }
    }

    /// Bound the sequence at a final point (inclusive)
    pub fn with_stop(mut self, stop: CyclePoint) -> Result<Self> {
        stop.checked_cmp(&self.start)?;
        self.stop = Some(stop);
        Ok(self)
    }

    /// Bound the sequence at a number of occurrences
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Exclude the listed points from the sequence
    pub fn with_exclusions(mut self, exclusions: Vec<CyclePoint>) -> Result<Self> {
        for p in &exclusions {
            p.checked_cmp(&self.start)?;
        }
        self.exclusions = exclusions;
        Ok(self)
    }

    /// The sequence's initial point (which may itself be excluded)
    pub fn start(&self) -> &CyclePoint {
        &self.start
    }

    /// The sequence step
    pub fn step(&self) -> &CycleInterval {
        &self.step
    }

    /// True if `p` lies on the recurrence and is not excluded
    pub fn is_on_sequence(&self, p: &CyclePoint) -> Result<bool> {
        if p.checked_cmp(&self.start)? == std::cmp::Ordering::Less {
            return Ok(false);
        }
        let (k, exact) = self.step.div_steps(&p.diff(&self.start)?)?;
        if !exact || !self.within_bounds(k, p)? {
            return Ok(false);
        }
        Ok(!self.exclusions.contains(p))
    }

    /// The smallest valid point `>= p`, or `None` past the sequence end
    pub fn first_point_after(&self, p: &CyclePoint) -> Result<Option<CyclePoint>> {
        let k = if p.checked_cmp(&self.start)? != std::cmp::Ordering::Greater {
            0
        } else {
            let (q, exact) = self.step.div_steps(&p.diff(&self.start)?)?;
            if exact {
                q
            } else {
                q + 1
            }
        };
        self.search_from(k)
    }

    /// The first valid point of the sequence
    pub fn first_point(&self) -> Result<Option<CyclePoint>> {
        self.search_from(0)
    }

    /// The smallest valid point strictly after `current`
    pub fn next_point(&self, current: &CyclePoint) -> Result<Option<CyclePoint>> {
        let k = if current.checked_cmp(&self.start)? == std::cmp::Ordering::Less {
            0
        } else {
            let (q, _) = self.step.div_steps(&current.diff(&self.start)?)?;
            q + 1
        };
        self.search_from(k)
    }

    fn within_bounds(&self, k: i64, p: &CyclePoint) -> Result<bool> {
        if k < 0 {
            return Ok(false);
        }
        if let Some(limit) = self.limit {
            if k as u64 >= limit {
                return Ok(false);
            }
        }
        if let Some(stop) = &self.stop {
            if p.checked_cmp(stop)? == std::cmp::Ordering::Greater {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn search_from(&self, mut k: i64) -> Result<Option<CyclePoint>> {
        if k < 0 {
            k = 0;
        }
        loop {
            let candidate = self.start.add(&self.step.mul(k)?)?;
            if !self.within_bounds(k, &candidate)? {
                return Ok(None);
            }
            if self.exclusions.contains(&candidate) {
                k += 1;
                continue;
            }
            return Ok(Some(candidate));
        }
    }
}

impl fmt::Display for CycleSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.limit {
            Some(1) => write!(f, "R1/{}", self.start),
            Some(n) => write!(f, "R{}/{}/{}", n, self.start, self.step),
            None => write!(f, "R/{}/{}", self.start, self.step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i64) -> CyclePoint {
        CyclePoint::Integer(n)
    }

    fn seq(start: i64, step: i64) -> CycleSequence {
        CycleSequence::new(p(start), CycleInterval::Integer(step)).unwrap()
    }

    #[test]
    fn test_rejects_zero_or_negative_step() {
        assert!(CycleSequence::new(p(1), CycleInterval::Integer(0)).is_err());
        assert!(CycleSequence::new(p(1), CycleInterval::Integer(-1)).is_err());
    }

    #[test]
    fn test_is_on_sequence() {
        let s = seq(1, 3);
        assert!(s.is_on_sequence(&p(1)).unwrap());
        assert!(s.is_on_sequence(&p(7)).unwrap());
        assert!(!s.is_on_sequence(&p(2)).unwrap());
        assert!(!s.is_on_sequence(&p(-2)).unwrap());
    }

    #[test]
    fn test_first_point_after() {
        let s = seq(1, 3);
        assert_eq!(s.first_point_after(&p(1)).unwrap(), Some(p(1)));
        assert_eq!(s.first_point_after(&p(2)).unwrap(), Some(p(4)));
        assert_eq!(s.first_point_after(&p(-5)).unwrap(), Some(p(1)));
    }

    #[test]
    fn test_next_point() {
        let s = seq(1, 3);
        assert_eq!(s.next_point(&p(1)).unwrap(), Some(p(4)));
        assert_eq!(s.next_point(&p(2)).unwrap(), Some(p(4)));
        assert_eq!(s.next_point(&p(0)).unwrap(), Some(p(1)));
    }

    #[test]
    fn test_stop_bound() {
        let s = seq(1, 2).with_stop(p(5)).unwrap();
        assert_eq!(s.next_point(&p(5)).unwrap(), None);
        assert_eq!(s.first_point_after(&p(6)).unwrap(), None);
        assert!(s.is_on_sequence(&p(5)).unwrap());
        assert!(!s.is_on_sequence(&p(7)).unwrap());
    }

    #[test]
    fn test_occurrence_limit() {
        let s = seq(1, 1).with_limit(3);
        assert!(s.is_on_sequence(&p(3)).unwrap());
        assert!(!s.is_on_sequence(&p(4)).unwrap());
        assert_eq!(s.next_point(&p(3)).unwrap(), None);
    }

    #[test]
    fn test_single_occurrence() {
        let s = CycleSequence::once(p(5));
        assert_eq!(s.first_point().unwrap(), Some(p(5)));
        assert_eq!(s.next_point(&p(5)).unwrap(), None);
        assert!(!s.is_on_sequence(&p(6)).unwrap());
    }

    #[test]
    fn test_exclusions_are_skipped() {
        let s = seq(1, 1).with_exclusions(vec![p(2), p(3)]).unwrap();
        assert!(!s.is_on_sequence(&p(2)).unwrap());
        assert_eq!(s.next_point(&p(1)).unwrap(), Some(p(4)));
        assert_eq!(s.first_point_after(&p(2)).unwrap(), Some(p(4)));
    }

    #[test]
    fn test_datetime_sequence() {
        let start: CyclePoint = "2026-01-01T00:00:00Z".parse().unwrap();
        let s = CycleSequence::new(start, "PT6H".parse().unwrap()).unwrap();
        let q = s.next_point(&start).unwrap().unwrap();
        assert_eq!(q.to_string(), "2026-01-01T06:00:00Z");
        assert!(s
            .is_on_sequence(&"2026-01-02T00:00:00Z".parse().unwrap())
            .unwrap());
        assert!(!s
            .is_on_sequence(&"2026-01-01T03:00:00Z".parse().unwrap())
            .unwrap());
    }
}
