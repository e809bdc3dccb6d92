//! Flow number management
//!
//! A flow is an identified concurrent run of the graph, labelled by a
//! positive integer. Flow numbers are allocated strictly monotonically and
//! never reused, even after a flow ends. Proxies carry sets of flow
//! numbers because flows merge when they meet at a task.

use crate::error::InputError;
use cadence_db::models::FlowRow;
use cadence_db::{DbOp, PendingOps};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// A set of flow numbers, sorted for deterministic persistence
pub type FlowNums = BTreeSet<i64>;

/// Description and birth time of one flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMeta {
    /// User-facing description
    pub description: String,
    /// Allocation time
    pub created_at: DateTime<Utc>,
}

/// A user's flow selector, translated from CLI tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowSelection {
    /// No explicit selection: follow the target tasks' own flows, or all
    /// active flows for inactive targets
    Default,
    /// Allocate a new flow number
    New,
    /// The reserved no-flow group
    NoFlow,
    /// Explicit flow numbers
    Numbers(FlowNums),
}

/// Allocator and registry of flow numbers
#[derive(Debug, Default)]
pub struct FlowManager {
    counter: i64,
    flows: BTreeMap<i64, FlowMeta>,
}

impl FlowManager {
    /// A fresh manager with no flows allocated
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted rows
    ///
    /// The counter resumes from the highest number ever allocated so
    /// numbers are never reused across restarts.
    pub fn load(rows: &[FlowRow]) -> Self {
        let mut flows = BTreeMap::new();
        let mut counter = 0;
        for row in rows {
            counter = counter.max(row.flow_num);
            flows.insert(
                row.flow_num,
                FlowMeta {
                    description: row.description.clone(),
                    created_at: row
                        .created_at
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                },
            );
        }
        Self { counter, flows }
    }

    /// Allocate the next flow number and record it durably
    pub fn allocate(
        &mut self,
        description: impl Into<String>,
        now: DateTime<Utc>,
        pending: &mut PendingOps,
    ) -> i64 {
        self.counter += 1;
        let description = description.into();
        info!(flow = self.counter, description = %description, "new flow");
        self.flows.insert(
            self.counter,
            FlowMeta {
                description: description.clone(),
                created_at: now,
            },
        );
        pending.push(DbOp::InsertFlow(FlowRow {
            flow_num: self.counter,
            description,
            created_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }));
        self.counter
    }

    /// Highest number allocated so far
    pub fn counter(&self) -> i64 {
        self.counter
    }

    /// Metadata for a flow, if it was ever allocated
    pub fn meta(&self, flow: i64) -> Option<&FlowMeta> {
        self.flows.get(&flow)
    }

    /// Translate user CLI tokens into a flow selection
    ///
    /// Accepted forms: positive integers, `new`, `none`, or `all`.
    /// `all` is the pre-v2 spelling of "no selection" and normalises to
    /// [`FlowSelection::Default`]. Keywords cannot be combined with
    /// numbers or each other.
    pub fn parse_selection(tokens: &[String]) -> Result<FlowSelection, InputError> {
        if tokens.is_empty() {
            return Ok(FlowSelection::Default);
        }
        if tokens.iter().any(|t| t == "all") {
            if tokens.len() > 1 {
                return Err(InputError::new(
                    "flow selector 'all' cannot be combined with other values",
                ));
            }
            warn!("flow selector 'all' is deprecated; treating as no selection");
            return Ok(FlowSelection::Default);
        }
        if tokens.iter().any(|t| t == "new" || t == "none") {
            if tokens.len() > 1 {
                return Err(InputError::new(
                    "flow selectors 'new' and 'none' cannot be combined with other values",
                ));
            }
            return Ok(if tokens[0] == "new" {
                FlowSelection::New
            } else {
                FlowSelection::NoFlow
            });
        }
        let mut nums = FlowNums::new();
        for token in tokens {
            let n: i64 = token.parse().map_err(|_| {
                InputError::new(format!(
                    "invalid flow value {:?}: expected flow numbers, 'new', 'none' or 'all'",
                    token
                ))
            })?;
            if n < 1 {
                return Err(InputError::new(format!(
                    "invalid flow number {}: flow numbers are positive",
                    n
                )));
            }
            nums.insert(n);
        }
        Ok(FlowSelection::Numbers(nums))
    }

    /// Encode a flow set the way the database stores it, e.g. `[1,2]`
    pub fn to_db_string(nums: &FlowNums) -> String {
        let list: Vec<i64> = nums.iter().copied().collect();
        serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string())
    }

    /// Decode a database flow set string
    pub fn from_db_string(s: &str) -> Result<FlowNums, serde_json::Error> {
        let list: Vec<i64> = serde_json::from_str(s)?;
        Ok(list.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_monotonic() {
        let mut manager = FlowManager::new();
        let mut pending = PendingOps::new();
        let now = Utc::now();
        assert_eq!(manager.allocate("first", now, &mut pending), 1);
        assert_eq!(manager.allocate("second", now, &mut pending), 2);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_load_resumes_counter() {
        let rows = vec![
            FlowRow {
                flow_num: 1,
                description: "original flow".into(),
                created_at: "2026-01-01T00:00:00Z".into(),
            },
            FlowRow {
                flow_num: 3,
                description: "rerun".into(),
                created_at: "2026-01-02T00:00:00Z".into(),
            },
        ];
        let mut manager = FlowManager::load(&rows);
        let mut pending = PendingOps::new();
        assert_eq!(manager.allocate("next", Utc::now(), &mut pending), 4);
    }

    #[test]
    fn test_parse_selection_forms() {
        let parse = |tokens: &[&str]| {
            FlowManager::parse_selection(
                &tokens.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
        };
        assert_eq!(parse(&[]).unwrap(), FlowSelection::Default);
        assert_eq!(parse(&["all"]).unwrap(), FlowSelection::Default);
        assert_eq!(parse(&["new"]).unwrap(), FlowSelection::New);
        assert_eq!(parse(&["none"]).unwrap(), FlowSelection::NoFlow);
        assert_eq!(
            parse(&["2", "1"]).unwrap(),
            FlowSelection::Numbers([1, 2].into_iter().collect())
        );
    }

    #[test]
    fn test_parse_selection_rejects_bad_tokens() {
        let parse = |tokens: &[&str]| {
            FlowManager::parse_selection(
                &tokens.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
        };
        assert!(parse(&["wild"]).is_err());
        assert!(parse(&["0"]).is_err());
        assert!(parse(&["new", "1"]).is_err());
        assert!(parse(&["all", "2"]).is_err());
    }

    #[test]
    fn test_db_string_round_trip() {
        let nums: FlowNums = [2, 1].into_iter().collect();
        let s = FlowManager::to_db_string(&nums);
        assert_eq!(s, "[1,2]");
        assert_eq!(FlowManager::from_db_string(&s).unwrap(), nums);
    }
}
