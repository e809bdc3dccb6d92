//! Broadcast runtime overrides
//!
//! A broadcast overrides runtime settings for a set of cycles and a set of
//! namespaces (task or family names). Precedence: a more specific
//! namespace beats a family, and a narrower cycle scope beats all-cycles.
//! Broadcasts are evaluated at the moment a task prepares to run.

use crate::graph::taskdef::RuntimeConfig;
use cadence_cycling::{CyclePoint, CyclingMode};
use cadence_db::models::BroadcastRow;
use cadence_db::{DbOp, PendingOps};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Cycle scope stored as `*` (all cycles) or a point string
const ALL_CYCLES: &str = "*";

/// One broadcast entry: a scope plus its setting overrides
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEntry {
    /// Cycle scope; `None` applies to every cycle
    pub point: Option<CyclePoint>,
    /// Task or family name the override targets
    pub namespace: String,
    /// Overrides keyed by dotted setting path
    pub settings: BTreeMap<String, Value>,
}

/// Holder and applier of broadcast overrides
#[derive(Debug, Default)]
pub struct BroadcastManager {
    entries: Vec<BroadcastEntry>,
}

impl BroadcastManager {
    /// An empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted rows
    pub fn load(rows: &[BroadcastRow], mode: CyclingMode) -> Self {
        let mut manager = Self::new();
        for row in rows {
            let point = if row.point == ALL_CYCLES {
                None
            } else {
                match CyclePoint::parse(&row.point, mode) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(point = %row.point, error = %e, "dropping unparseable broadcast row");
                        continue;
                    }
                }
            };
            let value: Value = serde_json::from_str(&row.value).unwrap_or(Value::Null);
            manager.insert(point, &row.namespace, &row.setting_path, value);
        }
        manager
    }

    /// Install a broadcast for each (cycle, namespace) pair
    pub fn put(
        &mut self,
        points: &[Option<CyclePoint>],
        namespaces: &[String],
        settings: &BTreeMap<String, Value>,
        pending: &mut PendingOps,
    ) {
        for point in points {
            for namespace in namespaces {
                for (path, value) in settings {
                    self.insert(*point, namespace, path, value.clone());
                    pending.push(DbOp::UpsertBroadcast(BroadcastRow {
                        point: point.map(|p| p.to_string()).unwrap_or_else(|| ALL_CYCLES.into()),
                        namespace: namespace.clone(),
                        setting_path: path.clone(),
                        value: serde_json::to_string(value).unwrap_or_else(|_| "null".into()),
                    }));
                }
                info!(
                    point = %point.map(|p| p.to_string()).unwrap_or_else(|| ALL_CYCLES.into()),
                    namespace = %namespace,
                    settings = settings.len(),
                    "broadcast installed"
                );
            }
        }
    }

    /// Remove broadcasts matching the given scopes; returns the number of
    /// settings cleared
    pub fn clear(
        &mut self,
        points: &[Option<CyclePoint>],
        namespaces: &[String],
        pending: &mut PendingOps,
    ) -> usize {
        let mut cleared = 0;
        self.entries.retain(|entry| {
            let hit = points.contains(&entry.point) && namespaces.contains(&entry.namespace);
            if hit {
                for path in entry.settings.keys() {
                    pending.push(DbOp::DeleteBroadcast {
                        point: entry
                            .point
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| ALL_CYCLES.into()),
                        namespace: entry.namespace.clone(),
                        setting_path: path.clone(),
                    });
                    cleared += 1;
                }
            }
            !hit
        });
        cleared
    }

    /// Overlay applicable broadcasts onto a task's runtime
    ///
    /// Applied lowest precedence first: all-cycle family overrides, then
    /// all-cycle task overrides, then point-scoped family, then
    /// point-scoped task. Families apply outermost first so inner
    /// families win.
    pub fn apply(
        &self,
        runtime: &RuntimeConfig,
        task: &str,
        families: &[String],
        point: &CyclePoint,
    ) -> RuntimeConfig {
        let mut effective = runtime.clone();
        for point_scope in [None, Some(*point)] {
            for namespace in families.iter().map(String::as_str).chain([task]) {
                for entry in &self.entries {
                    if entry.point == point_scope && entry.namespace == namespace {
                        for (path, value) in &entry.settings {
                            apply_setting(&mut effective, path, value);
                        }
                    }
                }
            }
        }
        effective
    }

    /// Whether any broadcast is installed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, point: Option<CyclePoint>, namespace: &str, path: &str, value: Value) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.point == point && e.namespace == namespace)
        {
            entry.settings.insert(path.to_string(), value);
            return;
        }
        let mut settings = BTreeMap::new();
        settings.insert(path.to_string(), value);
        self.entries.push(BroadcastEntry {
            point,
            namespace: namespace.to_string(),
            settings,
        });
    }
}

/// Apply one dotted-path override to a runtime record
fn apply_setting(runtime: &mut RuntimeConfig, path: &str, value: &Value) {
    match path.split_once('.') {
        Some(("environment", key)) => {
            if let Some(s) = value.as_str() {
                runtime.environment.insert(key.to_string(), s.to_string());
            }
        }
        Some(("directives", key)) => {
            if let Some(s) = value.as_str() {
                runtime.directives.insert(key.to_string(), s.to_string());
            }
        }
        None if path == "command" => {
            if let Some(s) = value.as_str() {
                runtime.command = s.to_string();
            }
        }
        None if path == "platform" => {
            if let Some(s) = value.as_str() {
                runtime.platform = s.to_string();
            }
        }
        None if path == "execution_time_limit" => {
            if let Some(secs) = value.as_u64() {
                runtime.execution_time_limit = Some(Duration::from_secs(secs));
            }
        }
        _ => warn!(path = %path, "ignoring broadcast to unknown setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i64) -> CyclePoint {
        CyclePoint::Integer(n)
    }

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_task_override_beats_family() {
        let mut manager = BroadcastManager::new();
        let mut pending = PendingOps::new();
        manager.put(
            &[None],
            &["FAM".to_string()],
            &settings(&[("environment.MODE", "family")]),
            &mut pending,
        );
        manager.put(
            &[None],
            &["model".to_string()],
            &settings(&[("environment.MODE", "task")]),
            &mut pending,
        );

        let effective = manager.apply(
            &RuntimeConfig::default(),
            "model",
            &["FAM".to_string()],
            &p(1),
        );
        assert_eq!(effective.environment.get("MODE").map(String::as_str), Some("task"));
    }

    #[test]
    fn test_point_scope_beats_all_cycles() {
        let mut manager = BroadcastManager::new();
        let mut pending = PendingOps::new();
        manager.put(
            &[None],
            &["model".to_string()],
            &settings(&[("command", "run-generic")]),
            &mut pending,
        );
        manager.put(
            &[Some(p(3))],
            &["model".to_string()],
            &settings(&[("command", "run-special")]),
            &mut pending,
        );

        let at3 = manager.apply(&RuntimeConfig::default(), "model", &[], &p(3));
        assert_eq!(at3.command, "run-special");
        let at4 = manager.apply(&RuntimeConfig::default(), "model", &[], &p(4));
        assert_eq!(at4.command, "run-generic");
    }

    #[test]
    fn test_clear_removes_and_queues_deletes() {
        let mut manager = BroadcastManager::new();
        let mut pending = PendingOps::new();
        manager.put(
            &[None],
            &["model".to_string()],
            &settings(&[("environment.A", "1"), ("environment.B", "2")]),
            &mut pending,
        );
        let cleared = manager.clear(&[None], &["model".to_string()], &mut pending);
        assert_eq!(cleared, 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_load_round_trip() {
        let rows = vec![BroadcastRow {
            point: "2".into(),
            namespace: "model".into(),
            setting_path: "platform".into(),
            value: "\"hpc\"".into(),
        }];
        let manager = BroadcastManager::load(&rows, CyclingMode::Integer);
        let effective = manager.apply(&RuntimeConfig::default(), "model", &[], &p(2));
        assert_eq!(effective.platform, "hpc");
    }
}
