//! Prerequisite objects
//!
//! A prerequisite is a disjunction of conjunctive clauses over
//! `(cycle, task, output)` triples. Each triple tracks how it was
//! satisfied: naturally (the upstream produced the output) or forced (a
//! user command). Reversals respect the distinction: removing an upstream
//! only reverses natural satisfactions, never forced ones.

use cadence_cycling::CyclePoint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a prerequisite triple was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SatisfiedState {
    /// Not satisfied
    Unsatisfied,
    /// Satisfied by the upstream producing the output
    Naturally,
    /// Satisfied by user command
    Forced,
}

impl SatisfiedState {
    /// True unless unsatisfied
    pub fn is_satisfied(&self) -> bool {
        !matches!(self, SatisfiedState::Unsatisfied)
    }
}

impl fmt::Display for SatisfiedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SatisfiedState::Unsatisfied => write!(f, "unsatisfied"),
            SatisfiedState::Naturally => write!(f, "naturally"),
            SatisfiedState::Forced => write!(f, "forced"),
        }
    }
}

/// The `(cycle, task, output)` key of one prerequisite triple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrereqKey {
    /// Upstream cycle point
    pub point: CyclePoint,
    /// Upstream task name
    pub task: String,
    /// Upstream output label
    pub output: String,
}

impl PrereqKey {
    /// Build a key from its parts
    pub fn new(point: CyclePoint, task: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            point,
            task: task.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for PrereqKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.point, self.task, self.output)
    }
}

/// One triple with its satisfaction state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereqTriple {
    /// The triple's key
    pub key: PrereqKey,
    /// Current satisfaction state
    pub state: SatisfiedState,
}

/// A prerequisite of one task instance
///
/// Satisfied when any disjunctive clause has every triple satisfied.
/// Clauses and triples are held in sorted key order so satisfaction walks
/// are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisite {
    clauses: Vec<Vec<PrereqTriple>>,
    /// Satisfaction removes the holding instance instead of running it
    pub suicide: bool,
}

impl Prerequisite {
    /// Build a prerequisite from disjunctive clauses of keys
    ///
    /// Triples start unsatisfied. Each clause is sorted by key, and the
    /// clauses themselves are sorted by their key lists, fixing the
    /// iteration order.
    pub fn new(clauses: Vec<Vec<PrereqKey>>, suicide: bool) -> Self {
        let mut clauses: Vec<Vec<PrereqTriple>> = clauses
            .into_iter()
            .map(|mut keys| {
                keys.sort();
                keys.dedup();
                keys.into_iter()
                    .map(|key| PrereqTriple {
                        key,
                        state: SatisfiedState::Unsatisfied,
                    })
                    .collect()
            })
            .collect();
        clauses.sort_by(|a, b| {
            let ka: Vec<&PrereqKey> = a.iter().map(|t| &t.key).collect();
            let kb: Vec<&PrereqKey> = b.iter().map(|t| &t.key).collect();
            ka.cmp(&kb)
        });
        Self { clauses, suicide }
    }

    /// True if no clause carries any triple
    pub fn is_empty(&self) -> bool {
        self.clauses.iter().all(|c| c.is_empty())
    }

    /// Set every triple matching `key`; returns true if anything changed
    ///
    /// A forced satisfaction upgrades a natural one (and vice versa is a
    /// no-op): once satisfied, the stronger reason wins for bookkeeping
    /// but the satisfaction itself never flips back here.
    pub fn satisfy(&mut self, key: &PrereqKey, state: SatisfiedState) -> bool {
        let mut changed = false;
        for clause in &mut self.clauses {
            for triple in clause.iter_mut() {
                if &triple.key == key && !triple.state.is_satisfied() {
                    triple.state = state;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Reverse a natural satisfaction of `key`; forced ones are untouched
    ///
    /// Used when an upstream task is removed while this instance is still
    /// waiting. Returns true if anything changed.
    pub fn unset_naturally_satisfied(&mut self, key: &PrereqKey) -> bool {
        let mut changed = false;
        for clause in &mut self.clauses {
            for triple in clause.iter_mut() {
                if &triple.key == key && triple.state == SatisfiedState::Naturally {
                    triple.state = SatisfiedState::Unsatisfied;
                    changed = true;
                }
            }
        }
        changed
    }

    /// True if any disjunctive clause is fully satisfied
    pub fn all_satisfied(&self) -> bool {
        self.clauses
            .iter()
            .any(|clause| clause.iter().all(|t| t.state.is_satisfied()))
    }

    /// True if any single triple is satisfied
    ///
    /// Decides whether a downstream should stay spawned after an upstream
    /// removal.
    pub fn any_satisfied_output(&self) -> bool {
        self.clauses
            .iter()
            .any(|clause| clause.iter().any(|t| t.state.is_satisfied()))
    }

    /// Iterate all triples, in the fixed sorted order
    pub fn iter_triples(&self) -> impl Iterator<Item = &PrereqTriple> {
        self.clauses.iter().flatten()
    }

    /// Keys of all triples, in the fixed sorted order
    pub fn keys(&self) -> Vec<&PrereqKey> {
        self.iter_triples().map(|t| &t.key).collect()
    }

    /// Triples satisfied by force, for persistence
    pub fn forced_triples(&self) -> Vec<&PrereqKey> {
        self.iter_triples()
            .filter(|t| t.state == SatisfiedState::Forced)
            .map(|t| &t.key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(point: i64, task: &str) -> PrereqKey {
        PrereqKey::new(CyclePoint::Integer(point), task, "succeeded")
    }

    fn conjunction(keys: Vec<PrereqKey>) -> Prerequisite {
        Prerequisite::new(vec![keys], false)
    }

    #[test]
    fn test_conjunction_satisfaction() {
        let mut p = conjunction(vec![key(1, "a"), key(1, "b")]);
        assert!(!p.all_satisfied());

        assert!(p.satisfy(&key(1, "a"), SatisfiedState::Naturally));
        assert!(!p.all_satisfied());
        assert!(p.any_satisfied_output());

        assert!(p.satisfy(&key(1, "b"), SatisfiedState::Naturally));
        assert!(p.all_satisfied());
    }

    #[test]
    fn test_disjunction_any_clause_suffices() {
        let mut p = Prerequisite::new(
            vec![vec![key(1, "a")], vec![key(1, "b")]],
            false,
        );
        p.satisfy(&key(1, "b"), SatisfiedState::Naturally);
        assert!(p.all_satisfied());
    }

    #[test]
    fn test_satisfy_is_idempotent() {
        let mut p = conjunction(vec![key(1, "a")]);
        assert!(p.satisfy(&key(1, "a"), SatisfiedState::Naturally));
        assert!(!p.satisfy(&key(1, "a"), SatisfiedState::Naturally));
        assert!(!p.satisfy(&key(1, "a"), SatisfiedState::Forced));
    }

    #[test]
    fn test_unset_only_reverses_natural() {
        let mut p = conjunction(vec![key(1, "a"), key(1, "b")]);
        p.satisfy(&key(1, "a"), SatisfiedState::Naturally);
        p.satisfy(&key(1, "b"), SatisfiedState::Forced);

        assert!(p.unset_naturally_satisfied(&key(1, "a")));
        assert!(!p.unset_naturally_satisfied(&key(1, "b")));
        assert!(p.any_satisfied_output());
        assert!(!p.all_satisfied());
    }

    #[test]
    fn test_deterministic_key_order() {
        let p = Prerequisite::new(
            vec![vec![key(2, "z"), key(1, "b"), key(1, "a")]],
            false,
        );
        let keys: Vec<String> = p.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(
            keys,
            vec!["1/a:succeeded", "1/b:succeeded", "2/z:succeeded"]
        );
    }

    #[test]
    fn test_forced_triples_for_persistence() {
        let mut p = conjunction(vec![key(1, "a"), key(1, "b")]);
        p.satisfy(&key(1, "b"), SatisfiedState::Forced);
        let forced: Vec<String> = p.forced_triples().iter().map(|k| k.to_string()).collect();
        assert_eq!(forced, vec!["1/b:succeeded"]);
    }
}
