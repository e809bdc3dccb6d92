//! Task event manager
//!
//! Normalises incoming task messages into state transitions on the pool,
//! persists the consequences, fires configured event handlers, and drives
//! the retry and late-task logic.

use crate::error::Result;
use crate::graph::taskdef::{
    OUTPUT_FAILED, OUTPUT_STARTED, OUTPUT_SUBMITTED, OUTPUT_SUBMIT_FAILED, OUTPUT_SUCCEEDED,
};
use crate::id::TaskId;
use crate::pool::pool::TaskPool;
use crate::prereq::SatisfiedState;
use crate::task_state::TaskStatus;
use cadence_db::{DbOp, PendingOps};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Severity tag on an incoming task message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageSeverity {
    /// Routine progress
    Info,
    /// Something unexpected but survivable
    Warning,
    /// A failure report
    Critical,
}

/// An asynchronous task outcome message
#[derive(Debug, Clone)]
pub struct TaskMessage {
    /// The reporting task instance
    pub id: TaskId,
    /// Submission number the message belongs to, if the sender knows it
    pub submit_num: Option<u32>,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Message severity
    pub severity: MessageSeverity,
    /// Message text; lifecycle keywords and declared output labels drive
    /// transitions, anything else is informational
    pub message: String,
}

impl TaskMessage {
    /// Convenience constructor for lifecycle messages
    pub fn new(id: TaskId, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            submit_num: None,
            timestamp,
            severity: MessageSeverity::Info,
            message: message.into(),
        }
    }
}

/// Receiver of fired events
///
/// The scheduler installs a sink; production uses [`LogEventSink`], tests
/// install recorders. Handler command execution is delegated to the sink
/// so the core never shells out itself.
pub trait EventSink: Send {
    /// A task-level event with its configured handler commands
    fn task_event(&mut self, id: &TaskId, event: &str, handlers: &[String], message: &str);
    /// A workflow-level event with its configured handler commands
    fn workflow_event(&mut self, event: &str, handlers: &[String], message: &str);
}

/// Default sink: structured logging only
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn task_event(&mut self, id: &TaskId, event: &str, handlers: &[String], message: &str) {
        info!(task = %id, event = %event, handlers = handlers.len(), message = %message, "task event");
    }

    fn workflow_event(&mut self, event: &str, handlers: &[String], message: &str) {
        info!(event = %event, handlers = handlers.len(), message = %message, "workflow event");
    }
}

/// Effects of processing one message
#[derive(Debug, Default)]
pub struct MessageOutcome {
    /// Active instances removed by suicide whose jobs must be killed
    pub to_kill: Vec<TaskId>,
}

/// The event manager
pub struct EventManager {
    sink: Box<dyn EventSink>,
}

impl EventManager {
    /// Create an event manager over a sink
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Fold one task message into the pool
    pub fn process_message(
        &mut self,
        pool: &mut TaskPool,
        msg: &TaskMessage,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<MessageOutcome> {
        let mut outcome = MessageOutcome::default();
        let Some(proxy) = pool.get(&msg.id) else {
            // Not in the pool: worth recording only if it is a terminal
            // outcome trickling in for a withdrawn instance.
            match msg.message.as_str() {
                OUTPUT_SUCCEEDED | OUTPUT_FAILED | OUTPUT_SUBMIT_FAILED => {
                    info!(task = %msg.id, message = %msg.message, "orphan outcome recorded");
                }
                _ => debug!(task = %msg.id, message = %msg.message, "message for unknown task ignored"),
            }
            return Ok(outcome);
        };
        if let Some(n) = msg.submit_num {
            if n != proxy.submit_num {
                debug!(
                    task = %msg.id,
                    message_submit = n,
                    current_submit = proxy.submit_num,
                    "ignoring message for superseded submission"
                );
                return Ok(outcome);
            }
        }

        match msg.message.as_str() {
            OUTPUT_SUBMITTED => {
                self.transition(pool, &msg.id, TaskStatus::Submitted, pending, now);
                if let Some(proxy) = pool.get_mut(&msg.id) {
                    proxy.submit_time = Some(msg.timestamp);
                }
                self.complete_output(pool, &msg.id, OUTPUT_SUBMITTED, &mut outcome, pending, now)?;
                self.fire(pool, &msg.id, "submitted", &msg.message);
            }
            OUTPUT_STARTED => {
                self.transition(pool, &msg.id, TaskStatus::Running, pending, now);
                if let Some(proxy) = pool.get_mut(&msg.id) {
                    proxy.start_time = Some(msg.timestamp);
                }
                self.complete_output(pool, &msg.id, OUTPUT_STARTED, &mut outcome, pending, now)?;
                self.fire(pool, &msg.id, "started", &msg.message);
            }
            OUTPUT_SUCCEEDED => {
                self.transition(pool, &msg.id, TaskStatus::Succeeded, pending, now);
                self.complete_output(pool, &msg.id, OUTPUT_SUCCEEDED, &mut outcome, pending, now)?;
                self.fire(pool, &msg.id, "succeeded", &msg.message);
                if !pool.remove_if_complete(&msg.id, pending, now)? {
                    if let Some(proxy) = pool.get(&msg.id) {
                        warn!(
                            task = %msg.id,
                            missing = ?proxy
                                .taskdef
                                .required_outputs()
                                .iter()
                                .filter(|l| !proxy.completed_outputs.contains_key(*l))
                                .collect::<Vec<_>>(),
                            "succeeded but incomplete: required outputs missing"
                        );
                    }
                }
            }
            OUTPUT_FAILED => {
                self.handle_failed(pool, &msg.id, &mut outcome, pending, now)?;
            }
            OUTPUT_SUBMIT_FAILED => {
                self.handle_submit_failed(pool, &msg.id, &mut outcome, pending, now)?;
            }
            other => {
                let is_output = proxy.taskdef.has_output(other);
                if is_output {
                    self.complete_output(pool, &msg.id, other, &mut outcome, pending, now)?;
                    self.fire(pool, &msg.id, "custom-output", other);
                } else {
                    match msg.severity {
                        MessageSeverity::Warning => {
                            warn!(task = %msg.id, message = %msg.message, "task message")
                        }
                        MessageSeverity::Critical => {
                            warn!(task = %msg.id, severity = "critical", message = %msg.message, "task message")
                        }
                        MessageSeverity::Info => {
                            info!(task = %msg.id, message = %msg.message, "task message")
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Emit the single late event for pre-active tasks past their late
    /// time
    ///
    /// The late flag is persisted, so a restart does not re-fire the
    /// event.
    pub fn check_late(
        &mut self,
        pool: &mut TaskPool,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Vec<TaskId> {
        let candidates: Vec<TaskId> = pool
            .iter()
            .filter(|p| {
                !p.is_late
                    && p.status.is_pre_active()
                    && p.late_time.map(|t| now >= t).unwrap_or(false)
            })
            .map(|p| p.id.clone())
            .collect();
        let mut late = Vec::new();
        for id in candidates {
            if let Some(proxy) = pool.get_mut(&id) {
                proxy.is_late = true;
                warn!(task = %id, "task is late");
                pending.push(DbOp::UpsertPool(proxy.pool_row()));
            }
            self.fire(pool, &id, "late", "task has not started on time");
            late.push(id);
        }
        late
    }

    /// Fire a task-level event through the sink
    pub fn fire_task_event(&mut self, pool: &TaskPool, id: &TaskId, event: &str, message: &str) {
        self.fire(pool, id, event, message);
    }

    /// Fire a workflow-level event through the sink
    pub fn fire_workflow_event(
        &mut self,
        handlers: &std::collections::BTreeMap<String, Vec<String>>,
        event: &str,
        message: &str,
    ) {
        let commands = handlers.get(event).cloned().unwrap_or_default();
        self.sink.workflow_event(event, &commands, message);
    }

    fn handle_failed(
        &mut self,
        pool: &mut TaskPool,
        id: &TaskId,
        outcome: &mut MessageOutcome,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let retry_delay = {
            let Some(proxy) = pool.get_mut(id) else {
                return Ok(());
            };
            proxy.try_num += 1;
            let attempt = proxy.try_num as usize;
            proxy.taskdef.runtime.retry_delays.get(attempt - 1).copied()
        };
        match retry_delay {
            Some(delay) => {
                if let Some(proxy) = pool.get_mut(id) {
                    proxy.arm_retry(delay, now);
                    info!(
                        task = %id,
                        attempt = proxy.try_num,
                        delay_secs = delay.as_secs(),
                        "failed, retrying after delay"
                    );
                    pending.push(DbOp::UpsertPool(proxy.pool_row()));
                    pending.push(DbOp::UpsertState(proxy.state_row(now)));
                }
                self.fire(pool, id, "retry", "job failed, retrying");
            }
            None => {
                self.transition(pool, id, TaskStatus::Failed, pending, now);
                warn!(task = %id, "failed, no retries left");
                self.complete_output(pool, id, OUTPUT_FAILED, outcome, pending, now)?;
                self.fire(pool, id, "failed", "job failed");
                pool.remove_if_complete(id, pending, now)?;
            }
        }
        Ok(())
    }

    fn handle_submit_failed(
        &mut self,
        pool: &mut TaskPool,
        id: &TaskId,
        outcome: &mut MessageOutcome,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let retry_delay = {
            let Some(proxy) = pool.get_mut(id) else {
                return Ok(());
            };
            proxy.sub_try_num += 1;
            let attempt = proxy.sub_try_num as usize;
            proxy
                .taskdef
                .runtime
                .submission_retry_delays
                .get(attempt - 1)
                .copied()
        };
        match retry_delay {
            Some(delay) => {
                if let Some(proxy) = pool.get_mut(id) {
                    proxy.arm_retry(delay, now);
                    info!(
                        task = %id,
                        attempt = proxy.sub_try_num,
                        delay_secs = delay.as_secs(),
                        "submission failed, retrying after delay"
                    );
                    pending.push(DbOp::UpsertPool(proxy.pool_row()));
                    pending.push(DbOp::UpsertState(proxy.state_row(now)));
                }
                self.fire(pool, id, "submission-retry", "submission failed, retrying");
            }
            None => {
                self.transition(pool, id, TaskStatus::SubmitFailed, pending, now);
                warn!(task = %id, "submission failed, no retries left");
                self.complete_output(pool, id, OUTPUT_SUBMIT_FAILED, outcome, pending, now)?;
                self.fire(pool, id, "submission-failed", "job submission failed");
                pool.remove_if_complete(id, pending, now)?;
            }
        }
        Ok(())
    }

    fn transition(
        &mut self,
        pool: &mut TaskPool,
        id: &TaskId,
        next: TaskStatus,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) {
        if let Some(proxy) = pool.get_mut(id) {
            if proxy.set_status(next) {
                pending.push(DbOp::UpsertPool(proxy.pool_row()));
                pending.push(DbOp::UpsertState(proxy.state_row(now)));
            }
        }
    }

    fn complete_output(
        &mut self,
        pool: &mut TaskPool,
        id: &TaskId,
        label: &str,
        outcome: &mut MessageOutcome,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let newly = match pool.get_mut(id) {
            Some(proxy) => proxy.add_output(label, SatisfiedState::Naturally),
            None => false,
        };
        if newly {
            let satisfy =
                pool.satisfy_downstreams(id, label, SatisfiedState::Naturally, pending, now)?;
            outcome.to_kill.extend(satisfy.to_kill);
        }
        Ok(())
    }

    fn fire(&mut self, pool: &TaskPool, id: &TaskId, event: &str, message: &str) {
        let handlers = pool
            .get(id)
            .and_then(|p| p.taskdef.runtime.handlers.get(event).cloned())
            .unwrap_or_default();
        self.sink.task_event(id, event, &handlers, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::flow::FlowNums;
    use crate::graph::store::GraphStore;
    use crate::graph::taskdef::{Dependency, TaskDef, TaskTrigger};
    use cadence_cycling::{CycleInterval, CyclePoint, CycleSequence, CyclingMode};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl EventSink for Recorder {
        fn task_event(&mut self, id: &TaskId, event: &str, _handlers: &[String], _message: &str) {
            self.events.lock().unwrap().push((id.to_string(), event.to_string()));
        }

        fn workflow_event(&mut self, event: &str, _handlers: &[String], _message: &str) {
            self.events.lock().unwrap().push(("workflow".to_string(), event.to_string()));
        }
    }

    fn p(n: i64) -> CyclePoint {
        CyclePoint::Integer(n)
    }

    fn seq() -> CycleSequence {
        CycleSequence::new(p(1), CycleInterval::Integer(1)).unwrap()
    }

    fn setup(defs: Vec<TaskDef>) -> (TaskPool, EventManager, Arc<Mutex<Vec<(String, String)>>>) {
        let mut config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        for def in defs {
            config.add_task(def);
        }
        let graph = Arc::new(GraphStore::compile(&config).unwrap());
        let mut pool = TaskPool::new(graph, &config);
        pool.initialise([1].into_iter().collect::<FlowNums>()).unwrap();
        let recorder = Recorder::default();
        let events = Arc::clone(&recorder.events);
        (pool, EventManager::new(Box::new(recorder)), events)
    }

    fn spawn(pool: &mut TaskPool, name: &str, point: i64) -> TaskId {
        let mut pending = PendingOps::new();
        pool.spawn(
            name,
            &p(point),
            &[1].into_iter().collect(),
            "test",
            &mut pending,
            Utc::now(),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_started_then_succeeded() {
        let (mut pool, mut events, log) = setup(vec![TaskDef::new("a", vec![seq()])]);
        let id = spawn(&mut pool, "a", 1);
        let mut pending = PendingOps::new();
        let now = Utc::now();

        pool.get_mut(&id).unwrap().set_status(TaskStatus::Preparing);
        events
            .process_message(&mut pool, &TaskMessage::new(id.clone(), "submitted", now), &mut pending, now)
            .unwrap();
        assert_eq!(pool.get(&id).unwrap().status, TaskStatus::Submitted);

        events
            .process_message(&mut pool, &TaskMessage::new(id.clone(), "started", now), &mut pending, now)
            .unwrap();
        assert_eq!(pool.get(&id).unwrap().status, TaskStatus::Running);

        events
            .process_message(&mut pool, &TaskMessage::new(id.clone(), "succeeded", now), &mut pending, now)
            .unwrap();
        // Complete: removed from the pool.
        assert!(pool.get(&id).is_none());

        let fired: Vec<String> = log.lock().unwrap().iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(fired, vec!["submitted", "started", "succeeded"]);
    }

    #[test]
    fn test_failure_with_retry_returns_to_waiting() {
        let mut def = TaskDef::new("a", vec![seq()]);
        def.runtime.retry_delays = vec![std::time::Duration::from_secs(30)];
        let (mut pool, mut events, log) = setup(vec![def]);
        let id = spawn(&mut pool, "a", 1);
        let mut pending = PendingOps::new();
        let now = Utc::now();

        pool.get_mut(&id).unwrap().set_status(TaskStatus::Preparing);
        pool.get_mut(&id).unwrap().set_status(TaskStatus::Submitted);
        pool.get_mut(&id).unwrap().set_status(TaskStatus::Running);
        events
            .process_message(&mut pool, &TaskMessage::new(id.clone(), "failed", now), &mut pending, now)
            .unwrap();

        let proxy = pool.get(&id).unwrap();
        assert_eq!(proxy.status, TaskStatus::Waiting);
        assert!(proxy.retry_timer.is_some());
        assert!(!proxy.ready_to_run(now));
        let fired: Vec<String> = log.lock().unwrap().iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(fired, vec!["retry"]);
    }

    #[test]
    fn test_failure_without_retries_stays_failed() {
        let (mut pool, mut events, log) = setup(vec![TaskDef::new("a", vec![seq()])]);
        let id = spawn(&mut pool, "a", 1);
        let mut pending = PendingOps::new();
        let now = Utc::now();

        pool.get_mut(&id).unwrap().set_status(TaskStatus::Preparing);
        pool.get_mut(&id).unwrap().set_status(TaskStatus::Running);
        events
            .process_message(&mut pool, &TaskMessage::new(id.clone(), "failed", now), &mut pending, now)
            .unwrap();

        // Incomplete failed tasks are retained for intervention.
        assert_eq!(pool.get(&id).unwrap().status, TaskStatus::Failed);
        let fired: Vec<String> = log.lock().unwrap().iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(fired, vec!["failed"]);
    }

    #[test]
    fn test_failed_output_spawns_failure_downstream() {
        let handler = TaskDef::new("recover", vec![seq()]).with_dependency(Dependency::all(vec![
            TaskTrigger {
                task: "a".to_string(),
                offset: None,
                output: OUTPUT_FAILED.to_string(),
            },
        ]));
        let (mut pool, mut events, _) = setup(vec![TaskDef::new("a", vec![seq()]), handler]);
        let id = spawn(&mut pool, "a", 1);
        let mut pending = PendingOps::new();
        let now = Utc::now();

        pool.get_mut(&id).unwrap().set_status(TaskStatus::Preparing);
        pool.get_mut(&id).unwrap().set_status(TaskStatus::Running);
        events
            .process_message(&mut pool, &TaskMessage::new(id.clone(), "failed", now), &mut pending, now)
            .unwrap();

        let recover = TaskId::new(p(1), "recover");
        let proxy = pool.get(&recover).expect("failure downstream spawned");
        assert!(proxy.prereqs_all_satisfied());
    }

    #[test]
    fn test_custom_output_message() {
        let def = TaskDef::new("a", vec![seq()]).with_output("report-ready", false);
        let (mut pool, mut events, _) = setup(vec![def]);
        let id = spawn(&mut pool, "a", 1);
        let mut pending = PendingOps::new();
        let now = Utc::now();

        events
            .process_message(
                &mut pool,
                &TaskMessage::new(id.clone(), "report-ready", now),
                &mut pending,
                now,
            )
            .unwrap();
        assert!(pool.get(&id).unwrap().completed_outputs.contains_key("report-ready"));
    }

    #[test]
    fn test_stale_submit_num_ignored() {
        let (mut pool, mut events, _) = setup(vec![TaskDef::new("a", vec![seq()])]);
        let id = spawn(&mut pool, "a", 1);
        pool.get_mut(&id).unwrap().submit_num = 2;
        let mut pending = PendingOps::new();
        let now = Utc::now();

        let mut msg = TaskMessage::new(id.clone(), "started", now);
        msg.submit_num = Some(1);
        events.process_message(&mut pool, &msg, &mut pending, now).unwrap();
        assert_eq!(pool.get(&id).unwrap().status, TaskStatus::Waiting);
    }

    #[test]
    fn test_late_event_fires_once() {
        let (mut pool, mut events, log) = setup(vec![TaskDef::new("a", vec![seq()])]);
        let id = spawn(&mut pool, "a", 1);
        let now = Utc::now();
        pool.get_mut(&id).unwrap().late_time = Some(now - chrono::Duration::seconds(1));
        let mut pending = PendingOps::new();

        assert_eq!(events.check_late(&mut pool, &mut pending, now), vec![id.clone()]);
        assert!(events.check_late(&mut pool, &mut pending, now).is_empty());
        let fired: Vec<String> = log.lock().unwrap().iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(fired, vec!["late"]);
    }
}
