//! Task instance identifiers and user selectors

use crate::error::InputError;
use crate::task_state::TaskStatus;
use cadence_cycling::{CyclePoint, CyclingMode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a task instance: a cycle point plus a task name
///
/// Ordered by point then name, which gives the pool map a deterministic
/// iteration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    /// The instance's cycle point
    pub point: CyclePoint,
    /// The task definition name
    pub name: String,
}

impl TaskId {
    /// Build an id from its parts
    pub fn new(point: CyclePoint, name: impl Into<String>) -> Self {
        Self {
            point,
            name: name.into(),
        }
    }

    /// Parse a `cycle/name` string in the given cycling mode
    pub fn parse(s: &str, mode: CyclingMode) -> Result<Self, InputError> {
        let (cycle, name) = s
            .split_once('/')
            .ok_or_else(|| InputError::new(format!("invalid task id (expected cycle/name): {}", s)))?;
        if name.is_empty() || name.contains('/') {
            return Err(InputError::new(format!("invalid task name in id: {}", s)));
        }
        let point = CyclePoint::parse(cycle, mode)
            .map_err(|e| InputError::new(format!("invalid cycle point in id {}: {}", s, e)))?;
        Ok(Self::new(point, name))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.point, self.name)
    }
}

/// A parsed user task selector: `[cycle/]name[:status]`, globs allowed
///
/// A missing cycle matches every point. Both the cycle and name parts may
/// use `*` wildcards.
#[derive(Debug, Clone)]
pub struct TaskSelector {
    /// Original selector text, for warnings about unmatched selectors
    pub text: String,
    cycle: Option<GlobPattern>,
    name: GlobPattern,
    status: Option<TaskStatus>,
}

impl TaskSelector {
    /// Parse a selector string
    ///
    /// The status separator is the last `:` after the last `/`, so colons
    /// inside a date-time cycle point are left alone.
    pub fn parse(s: &str) -> Result<Self, InputError> {
        let name_start = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (body, status) = match s[name_start..].rsplit_once(':') {
            Some((name_part, status_str)) => {
                let status = status_str
                    .parse::<TaskStatus>()
                    .map_err(InputError::new)?;
                (&s[..name_start + name_part.len()], Some(status))
            }
            None => (s, None),
        };
        let (cycle, name) = match body.split_once('/') {
            Some((cycle, name)) => (Some(GlobPattern::new(cycle)?), name),
            None => (None, body),
        };
        if name.is_empty() {
            return Err(InputError::new(format!("invalid task selector: {}", s)));
        }
        Ok(Self {
            text: s.to_string(),
            cycle,
            name: GlobPattern::new(name)?,
            status,
        })
    }

    /// Test a live instance against the selector
    pub fn matches(&self, id: &TaskId, status: TaskStatus) -> bool {
        if let Some(required) = self.status {
            if status != required {
                return false;
            }
        }
        if let Some(cycle) = &self.cycle {
            if !cycle.matches(&id.point.to_string()) {
                return false;
            }
        }
        self.name.matches(&id.name)
    }

    /// If the selector names exactly one instance, return it
    ///
    /// Requires a literal cycle and name with no status filter; used to
    /// address tasks that are not (yet) in the pool.
    pub fn as_exact(&self, mode: CyclingMode) -> Option<TaskId> {
        if self.status.is_some() {
            return None;
        }
        let cycle = self.cycle.as_ref()?.literal()?;
        let name = self.name.literal()?;
        let point = CyclePoint::parse(&cycle, mode).ok()?;
        Some(TaskId::new(point, name))
    }
}

/// A `*`-wildcard pattern compiled to a regex
#[derive(Debug, Clone)]
struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    fn new(pattern: &str) -> Result<Self, InputError> {
        let mut re = String::from("^");
        for ch in pattern.chars() {
            match ch {
                '*' => re.push_str(".*"),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');
        let regex = Regex::new(&re)
            .map_err(|e| InputError::new(format!("invalid pattern {}: {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    fn matches(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }

    fn literal(&self) -> Option<String> {
        if self.source.contains('*') {
            None
        } else {
            Some(self.source.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(point: i64, name: &str) -> TaskId {
        TaskId::new(CyclePoint::Integer(point), name)
    }

    #[test]
    fn test_id_display_and_parse() {
        let a = id(3, "model");
        assert_eq!(a.to_string(), "3/model");
        assert_eq!(TaskId::parse("3/model", CyclingMode::Integer).unwrap(), a);
        assert!(TaskId::parse("model", CyclingMode::Integer).is_err());
        assert!(TaskId::parse("x/model", CyclingMode::Integer).is_err());
    }

    #[test]
    fn test_selector_name_only() {
        let sel = TaskSelector::parse("model").unwrap();
        assert!(sel.matches(&id(1, "model"), TaskStatus::Waiting));
        assert!(sel.matches(&id(9, "model"), TaskStatus::Running));
        assert!(!sel.matches(&id(1, "post"), TaskStatus::Waiting));
    }

    #[test]
    fn test_selector_with_cycle_and_status() {
        let sel = TaskSelector::parse("2/model:waiting").unwrap();
        assert!(sel.matches(&id(2, "model"), TaskStatus::Waiting));
        assert!(!sel.matches(&id(2, "model"), TaskStatus::Running));
        assert!(!sel.matches(&id(3, "model"), TaskStatus::Waiting));
    }

    #[test]
    fn test_selector_globs() {
        let sel = TaskSelector::parse("*/mod*").unwrap();
        assert!(sel.matches(&id(7, "model"), TaskStatus::Waiting));
        assert!(!sel.matches(&id(7, "postproc"), TaskStatus::Waiting));
    }

    #[test]
    fn test_selector_as_exact() {
        let sel = TaskSelector::parse("2/model").unwrap();
        assert_eq!(sel.as_exact(CyclingMode::Integer), Some(id(2, "model")));
        assert_eq!(
            TaskSelector::parse("*/model").unwrap().as_exact(CyclingMode::Integer),
            None
        );
        assert_eq!(
            TaskSelector::parse("2/model:waiting").unwrap().as_exact(CyclingMode::Integer),
            None
        );
        // Name-only selectors address every cycle, never one instance.
        assert_eq!(
            TaskSelector::parse("model").unwrap().as_exact(CyclingMode::Integer),
            None
        );
    }

    #[test]
    fn test_selector_bad_status() {
        assert!(TaskSelector::parse("model:sleeping").is_err());
    }

    #[test]
    fn test_selector_datetime_cycle_keeps_its_colons() {
        let pid = TaskId::new("2026-01-01T06:00:00Z".parse().unwrap(), "model");
        let sel = TaskSelector::parse("2026-01-01T06:00:00Z/model").unwrap();
        assert!(sel.matches(&pid, TaskStatus::Running));
        let sel = TaskSelector::parse("2026-01-01T06:00:00Z/model:running").unwrap();
        assert!(sel.matches(&pid, TaskStatus::Running));
        assert!(!sel.matches(&pid, TaskStatus::Waiting));
    }
}
