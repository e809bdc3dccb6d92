//! External trigger (xtrigger) evaluation
//!
//! An xtrigger is a periodically evaluated external predicate identified
//! by a label. Satisfaction carries an output payload injected into the
//! gated task's environment. The built-in `wall_clock` label is evaluated
//! inline against the cycle point; user functions are registered through
//! the [`XtriggerFunc`] trait.

use crate::config::XtriggerConfig;
use cadence_cycling::{CycleInterval, CyclePoint, CyclingError};
use cadence_db::models::XtriggerRow;
use cadence_db::{DbOp, PendingOps};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info};

/// The built-in wall-clock xtrigger label
pub const WALL_CLOCK: &str = "wall_clock";

/// A user-registered external predicate
///
/// Returns `Some(payload)` when satisfied, `None` when not (yet). The
/// payload becomes environment content for gated tasks.
pub trait XtriggerFunc: Send + Sync {
    /// Evaluate the predicate once
    fn call(&self, args: &[Value], now: DateTime<Utc>) -> Option<Value>;
}

/// True once the wall clock passes `point + offset`
///
/// Only defined for date-time cycling; an integer point is a domain error.
pub fn wall_clock_satisfied(
    point: &CyclePoint,
    offset: Option<&CycleInterval>,
    now: DateTime<Utc>,
) -> Result<bool, CyclingError> {
    let trigger_at = match offset {
        Some(offset) => point.add(offset)?,
        None => *point,
    };
    match trigger_at {
        CyclePoint::DateTime(t) => Ok(now >= t),
        CyclePoint::Integer(_) => Err(CyclingError::DomainMismatch {
            left: "integer".to_string(),
            right: "datetime".to_string(),
        }),
    }
}

/// Evaluator and result cache for declared xtriggers
pub struct XtriggerManager {
    configs: BTreeMap<String, XtriggerConfig>,
    funcs: HashMap<String, Arc<dyn XtriggerFunc>>,
    satisfied: HashMap<String, Value>,
    last_eval: HashMap<String, DateTime<Utc>>,
}

impl XtriggerManager {
    /// Create a manager for the declared xtriggers
    pub fn new(configs: BTreeMap<String, XtriggerConfig>) -> Self {
        Self {
            configs,
            funcs: HashMap::new(),
            satisfied: HashMap::new(),
            last_eval: HashMap::new(),
        }
    }

    /// Register the function behind a label
    pub fn register(&mut self, function: impl Into<String>, func: Arc<dyn XtriggerFunc>) {
        self.funcs.insert(function.into(), func);
    }

    /// Restore satisfied results from persisted rows
    pub fn load_results(&mut self, rows: &[XtriggerRow]) {
        for row in rows {
            if let Ok(value) = serde_json::from_str(&row.result) {
                self.satisfied.insert(row.label.clone(), value);
            }
        }
    }

    /// Swap in new declarations on reload, keeping satisfied results
    pub fn reload(&mut self, configs: BTreeMap<String, XtriggerConfig>) {
        self.configs = configs;
        self.satisfied.retain(|label, _| self.configs.contains_key(label));
    }

    /// True if the labelled xtrigger has reported satisfied
    pub fn is_satisfied(&self, label: &str) -> bool {
        self.satisfied.contains_key(label)
    }

    /// All labels currently satisfied
    pub fn satisfied_labels(&self) -> Vec<String> {
        self.satisfied.keys().cloned().collect()
    }

    /// The payload of a satisfied xtrigger
    pub fn result(&self, label: &str) -> Option<&Value> {
        self.satisfied.get(label)
    }

    /// Force-satisfy a label (group trigger semantics)
    pub fn force_satisfy(&mut self, label: &str) {
        self.satisfied
            .entry(label.to_string())
            .or_insert(Value::Bool(true));
    }

    /// Evaluate all due, unsatisfied xtriggers
    ///
    /// Returns the labels that became satisfied this call. Results are
    /// recorded durably so a satisfied xtrigger stays satisfied across
    /// restart.
    pub fn evaluate_due(&mut self, now: DateTime<Utc>, pending: &mut PendingOps) -> Vec<String> {
        let mut newly = Vec::new();
        for (label, config) in &self.configs {
            if self.satisfied.contains_key(label) {
                continue;
            }
            if let Some(last) = self.last_eval.get(label) {
                let due = *last
                    + chrono::Duration::from_std(config.interval)
                        .unwrap_or_else(|_| chrono::Duration::seconds(10));
                if now < due {
                    continue;
                }
            }
            self.last_eval.insert(label.clone(), now);
            let func = match self.funcs.get(&config.function) {
                Some(func) => func,
                None => {
                    debug!(label = %label, function = %config.function, "xtrigger function not registered");
                    continue;
                }
            };
            if let Some(payload) = func.call(&config.args, now) {
                info!(label = %label, "xtrigger satisfied");
                pending.push(DbOp::UpsertXtrigger(XtriggerRow {
                    label: label.clone(),
                    args_hash: args_hash(&config.args),
                    result: serde_json::to_string(&payload).unwrap_or_else(|_| "null".into()),
                }));
                self.satisfied.insert(label.clone(), payload);
                newly.push(label.clone());
            }
        }
        newly
    }
}

/// Stable hash of an xtrigger's call arguments
fn args_hash(args: &[Value]) -> String {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(args)
        .unwrap_or_default()
        .hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct AfterCount {
        threshold: u64,
        calls: std::sync::atomic::AtomicU64,
    }

    impl XtriggerFunc for AfterCount {
        fn call(&self, _args: &[Value], _now: DateTime<Utc>) -> Option<Value> {
            let n = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            (n >= self.threshold).then(|| serde_json::json!({"calls": n}))
        }
    }

    fn config(function: &str) -> XtriggerConfig {
        XtriggerConfig {
            function: function.to_string(),
            args: vec![],
            interval: Duration::from_secs(0),
        }
    }

    #[test]
    fn test_wall_clock() {
        let point: CyclePoint = "2026-01-01T00:00:00Z".parse().unwrap();
        let before: DateTime<Utc> = "2025-12-31T23:00:00Z".parse().unwrap();
        let after: DateTime<Utc> = "2026-01-01T01:00:00Z".parse().unwrap();
        assert!(!wall_clock_satisfied(&point, None, before).unwrap());
        assert!(wall_clock_satisfied(&point, None, after).unwrap());

        let offset: CycleInterval = "PT2H".parse().unwrap();
        assert!(!wall_clock_satisfied(&point, Some(&offset), after).unwrap());
    }

    #[test]
    fn test_wall_clock_integer_domain_fails() {
        let point = CyclePoint::Integer(1);
        assert!(wall_clock_satisfied(&point, None, Utc::now()).is_err());
    }

    #[test]
    fn test_evaluate_until_satisfied() {
        let mut configs = BTreeMap::new();
        configs.insert("data_ready".to_string(), config("poll_data"));
        let mut manager = XtriggerManager::new(configs);
        manager.register(
            "poll_data",
            Arc::new(AfterCount {
                threshold: 2,
                calls: Default::default(),
            }),
        );

        let mut pending = PendingOps::new();
        assert!(manager.evaluate_due(Utc::now(), &mut pending).is_empty());
        let newly = manager.evaluate_due(Utc::now(), &mut pending);
        assert_eq!(newly, vec!["data_ready".to_string()]);
        assert!(manager.is_satisfied("data_ready"));
        assert_eq!(pending.len(), 1);

        // Satisfied labels are not re-evaluated.
        assert!(manager.evaluate_due(Utc::now(), &mut pending).is_empty());
    }

    #[test]
    fn test_force_satisfy() {
        let mut manager = XtriggerManager::new(BTreeMap::new());
        manager.force_satisfy("anything");
        assert!(manager.is_satisfied("anything"));
    }
}
