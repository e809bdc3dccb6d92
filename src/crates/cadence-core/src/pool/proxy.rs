//! Live task instances
//!
//! A [`TaskProxy`] is the mutable instance of a task definition at one
//! cycle point, tagged with the flows it belongs to. The pool owns all
//! proxies; nothing else mutates their status.

use crate::flow::{FlowManager, FlowNums};
use crate::graph::taskdef::{TaskDef, OUTPUT_EXPIRED};
use crate::id::TaskId;
use crate::prereq::{Prerequisite, PrereqKey, SatisfiedState};
use crate::task_state::TaskStatus;
use cadence_db::models::{TaskPoolRow, TaskStateRow};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A live instance of a task definition at a specific cycle point
#[derive(Debug, Clone)]
pub struct TaskProxy {
    /// Instance identity
    pub id: TaskId,
    /// The shared, immutable definition
    pub taskdef: Arc<TaskDef>,
    /// Flows this instance belongs to; empty only for the no-flow group
    pub flow_nums: FlowNums,
    /// Current status
    pub status: TaskStatus,
    /// Held: skipped by release while waiting
    pub is_held: bool,
    /// Late: a pre-active status past the late time, reported once
    pub is_late: bool,
    /// Queued for release (set while sitting in an execution queue, and by
    /// `trigger --on-resume` while the workflow is paused)
    pub is_queued: bool,
    /// Manually triggered: release bypasses the usual readiness gates
    pub is_manual_trigger: bool,
    /// Prerequisite objects
    pub prerequisites: Vec<Prerequisite>,
    /// Suicide prerequisites; satisfaction removes the instance
    pub suicide_prerequisites: Vec<Prerequisite>,
    /// Satisfaction map of gating xtrigger labels
    pub xtriggers: BTreeMap<String, bool>,
    /// Satisfaction map of external trigger messages
    pub external_triggers: BTreeMap<String, bool>,
    /// Completed outputs with how they completed
    pub completed_outputs: BTreeMap<String, SatisfiedState>,
    /// Latest job submission number, 0 before any submission
    pub submit_num: u32,
    /// Execution attempt number, counted at execution failure
    pub try_num: u32,
    /// Submission attempt number, counted at submission failure
    pub sub_try_num: u32,
    /// Waiting-for-retry: do not release before this instant
    pub retry_timer: Option<DateTime<Utc>>,
    /// When the latest job was submitted
    pub submit_time: Option<DateTime<Utc>>,
    /// When the latest job started executing
    pub start_time: Option<DateTime<Utc>>,
    /// Platform the current job is associated with
    pub platform: Option<String>,
    /// Instant after which the task counts as late
    pub late_time: Option<DateTime<Utc>>,
    /// Instant after which the task clock-expires
    pub expire_time: Option<DateTime<Utc>>,
    /// Execution queue this task belongs to
    pub queue: String,
    /// Creation time, for the state history record
    pub created_at: DateTime<Utc>,
}

impl TaskProxy {
    /// Create a waiting proxy
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        taskdef: Arc<TaskDef>,
        id: TaskId,
        flow_nums: FlowNums,
        prerequisites: Vec<Prerequisite>,
        suicide_prerequisites: Vec<Prerequisite>,
        queue: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let xtriggers = taskdef
            .xtrigger_labels
            .iter()
            .map(|l| (l.clone(), false))
            .collect();
        let external_triggers = taskdef
            .external_triggers
            .iter()
            .map(|m| (m.clone(), false))
            .collect();
        Self {
            id,
            taskdef,
            flow_nums,
            status: TaskStatus::Waiting,
            is_held: false,
            is_late: false,
            is_queued: false,
            is_manual_trigger: false,
            prerequisites,
            suicide_prerequisites,
            xtriggers,
            external_triggers,
            completed_outputs: BTreeMap::new(),
            submit_num: 0,
            try_num: 0,
            sub_try_num: 0,
            retry_timer: None,
            submit_time: None,
            start_time: None,
            platform: None,
            late_time: None,
            expire_time: None,
            queue: queue.into(),
            created_at: now,
        }
    }

    /// Move to a new status, logging the transition
    ///
    /// Returns false (and changes nothing) if the transition is not legal
    /// for the lifecycle.
    pub fn set_status(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                task = %self.id,
                from = %self.status,
                to = %next,
                "ignoring illegal status transition"
            );
            return false;
        }
        debug!(task = %self.id, from = %self.status, to = %next, "status change");
        self.status = next;
        true
    }

    /// True for `preparing`, `submitted` and `running`
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// True for the terminal statuses
    pub fn is_finished(&self) -> bool {
        self.status.is_final()
    }

    /// Whether the instance has met its completion condition
    ///
    /// Complete means every required output has been completed, or the
    /// instance clock-expired (expiry is an accepted end). A failed task
    /// whose `succeeded` output is optional is complete; one with
    /// `succeeded` required is not.
    pub fn is_complete(&self) -> bool {
        if self.status == TaskStatus::Expired {
            return true;
        }
        self.taskdef
            .required_outputs()
            .iter()
            .all(|label| self.completed_outputs.contains_key(label))
    }

    /// True if every normal prerequisite is satisfied
    pub fn prereqs_all_satisfied(&self) -> bool {
        self.prerequisites.iter().all(|p| p.all_satisfied())
    }

    /// True if any suicide prerequisite is satisfied
    pub fn suicide_satisfied(&self) -> bool {
        self.suicide_prerequisites.iter().any(|p| p.all_satisfied())
    }

    /// True if all xtriggers and external triggers are satisfied
    pub fn gates_all_satisfied(&self) -> bool {
        self.xtriggers.values().all(|v| *v) && self.external_triggers.values().all(|v| *v)
    }

    /// Readiness check for the release scan
    pub fn ready_to_run(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Waiting || self.is_held {
            return false;
        }
        if let Some(until) = self.retry_timer {
            if now < until {
                return false;
            }
        }
        if self.is_manual_trigger {
            return true;
        }
        self.prereqs_all_satisfied() && self.gates_all_satisfied()
    }

    /// Satisfy a prerequisite triple; returns true if anything changed
    pub fn satisfy_prereq(&mut self, key: &PrereqKey, state: SatisfiedState) -> bool {
        let mut changed = false;
        for prereq in &mut self.prerequisites {
            changed |= prereq.satisfy(key, state);
        }
        for prereq in &mut self.suicide_prerequisites {
            changed |= prereq.satisfy(key, state);
        }
        changed
    }

    /// Reverse the natural satisfaction of a triple
    pub fn unset_naturally_satisfied(&mut self, key: &PrereqKey) -> bool {
        let mut changed = false;
        for prereq in &mut self.prerequisites {
            changed |= prereq.unset_naturally_satisfied(key);
        }
        for prereq in &mut self.suicide_prerequisites {
            changed |= prereq.unset_naturally_satisfied(key);
        }
        changed
    }

    /// True if any prerequisite triple is satisfied at all
    pub fn any_prereq_satisfied(&self) -> bool {
        self.prerequisites.iter().any(|p| p.any_satisfied_output())
    }

    /// Complete an output; returns true if it was newly completed
    pub fn add_output(&mut self, label: &str, state: SatisfiedState) -> bool {
        if self.completed_outputs.contains_key(label) {
            return false;
        }
        self.completed_outputs.insert(label.to_string(), state);
        true
    }

    /// Merge additional flow numbers in; returns true if the set grew
    pub fn merge_flows(&mut self, flows: &FlowNums) -> bool {
        let before = self.flow_nums.len();
        self.flow_nums.extend(flows.iter().copied());
        self.flow_nums.len() > before
    }

    /// Mark the instance expired and record the `expired` output
    pub fn expire(&mut self) {
        self.set_status(TaskStatus::Expired);
        self.add_output(OUTPUT_EXPIRED, SatisfiedState::Naturally);
    }

    /// Reset for a retry: back to waiting with an armed retry timer
    pub fn arm_retry(&mut self, delay: std::time::Duration, now: DateTime<Utc>) {
        self.set_status(TaskStatus::Waiting);
        self.retry_timer =
            Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        self.platform = None;
    }

    /// The live-pool database row for this proxy
    pub fn pool_row(&self) -> TaskPoolRow {
        TaskPoolRow {
            cycle: self.id.point.to_string(),
            name: self.id.name.clone(),
            flow_nums: FlowManager::to_db_string(&self.flow_nums),
            status: self.status.to_string(),
            is_held: self.is_held,
            is_late: self.is_late,
        }
    }

    /// The state-history database row for this proxy
    pub fn state_row(&self, now: DateTime<Utc>) -> TaskStateRow {
        TaskStateRow {
            cycle: self.id.point.to_string(),
            name: self.id.name.clone(),
            flow_nums: FlowManager::to_db_string(&self.flow_nums),
            submit_num: self.submit_num as i64,
            status: self.status.to_string(),
            time_created: self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            time_updated: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::taskdef::OUTPUT_SUCCEEDED;
    use cadence_cycling::{CycleInterval, CyclePoint, CycleSequence};

    fn make_proxy(prereqs: Vec<Prerequisite>) -> TaskProxy {
        let seq =
            CycleSequence::new(CyclePoint::Integer(1), CycleInterval::Integer(1)).unwrap();
        let def = Arc::new(TaskDef::new("a", vec![seq]));
        TaskProxy::new(
            def,
            TaskId::new(CyclePoint::Integer(1), "a"),
            [1].into_iter().collect(),
            prereqs,
            Vec::new(),
            "default",
            Utc::now(),
        )
    }

    fn prereq(task: &str) -> Prerequisite {
        Prerequisite::new(
            vec![vec![PrereqKey::new(CyclePoint::Integer(1), task, OUTPUT_SUCCEEDED)]],
            false,
        )
    }

    #[test]
    fn test_ready_to_run_gates() {
        let now = Utc::now();
        let mut proxy = make_proxy(vec![prereq("up")]);
        assert!(!proxy.ready_to_run(now));

        proxy.satisfy_prereq(
            &PrereqKey::new(CyclePoint::Integer(1), "up", OUTPUT_SUCCEEDED),
            SatisfiedState::Naturally,
        );
        assert!(proxy.ready_to_run(now));

        proxy.is_held = true;
        assert!(!proxy.ready_to_run(now));
        proxy.is_held = false;

        proxy.retry_timer = Some(now + chrono::Duration::seconds(60));
        assert!(!proxy.ready_to_run(now));
    }

    #[test]
    fn test_manual_trigger_bypasses_prereqs() {
        let mut proxy = make_proxy(vec![prereq("up")]);
        proxy.is_manual_trigger = true;
        assert!(proxy.ready_to_run(Utc::now()));
    }

    #[test]
    fn test_completion_requires_required_outputs() {
        let mut proxy = make_proxy(vec![]);
        assert!(!proxy.is_complete());
        proxy.add_output(OUTPUT_SUCCEEDED, SatisfiedState::Naturally);
        assert!(proxy.is_complete());
    }

    #[test]
    fn test_expired_counts_as_complete() {
        let mut proxy = make_proxy(vec![]);
        proxy.expire();
        assert_eq!(proxy.status, TaskStatus::Expired);
        assert!(proxy.is_complete());
        assert!(proxy.completed_outputs.contains_key(OUTPUT_EXPIRED));
    }

    #[test]
    fn test_add_output_idempotent() {
        let mut proxy = make_proxy(vec![]);
        assert!(proxy.add_output(OUTPUT_SUCCEEDED, SatisfiedState::Naturally));
        assert!(!proxy.add_output(OUTPUT_SUCCEEDED, SatisfiedState::Forced));
    }

    #[test]
    fn test_merge_flows() {
        let mut proxy = make_proxy(vec![]);
        assert!(proxy.merge_flows(&[2].into_iter().collect()));
        assert!(!proxy.merge_flows(&[1, 2].into_iter().collect()));
        assert_eq!(proxy.pool_row().flow_nums, "[1,2]");
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut proxy = make_proxy(vec![]);
        proxy.set_status(TaskStatus::Preparing);
        proxy.set_status(TaskStatus::Submitted);
        proxy.set_status(TaskStatus::Running);
        proxy.set_status(TaskStatus::Succeeded);
        assert!(!proxy.set_status(TaskStatus::Running));
        assert_eq!(proxy.status, TaskStatus::Succeeded);
    }
}
