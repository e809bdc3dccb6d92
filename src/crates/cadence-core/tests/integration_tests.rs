//! End-to-end scheduler scenarios
//!
//! Each test drives the scheduler tick by tick with a mock job runner and
//! feeds task outcomes through the message ingress, the same way a job
//! message router would.

use async_trait::async_trait;
use cadence_core::config::{EventsConfig, RunaheadLimit, WorkflowConfig};
use cadence_core::events::{EventSink, TaskMessage};
use cadence_core::graph::taskdef::{Dependency, TaskDef, TaskTrigger, OUTPUT_SUCCEEDED};
use cadence_core::id::TaskId;
use cadence_core::jobs::{
    JobDescriptor, JobError, JobPollStatus, JobRunner, KillOutcome, PreparedJob, SubmitHandle,
};
use cadence_core::scheduler::{Scheduler, SchedulerOptions, TickOutcome};
use cadence_core::task_state::TaskStatus;
use cadence_cycling::{CycleInterval, CyclePoint, CycleSequence, CyclingMode};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Runner that accepts everything and records submissions in order
#[derive(Default)]
struct MockRunner {
    submitted: Mutex<Vec<String>>,
    descriptors: Mutex<Vec<JobDescriptor>>,
    killed: Mutex<Vec<String>>,
}

#[async_trait]
impl JobRunner for MockRunner {
    async fn prepare(&self, descriptor: &JobDescriptor) -> Result<PreparedJob, JobError> {
        Ok(PreparedJob {
            descriptor: descriptor.clone(),
        })
    }

    async fn submit(&self, prepared: PreparedJob) -> Result<SubmitHandle, JobError> {
        let id = prepared.descriptor.id.clone();
        self.submitted.lock().unwrap().push(id.to_string());
        self.descriptors.lock().unwrap().push(prepared.descriptor.clone());
        Ok(SubmitHandle {
            id,
            submit_num: prepared.descriptor.submit_num,
            platform: prepared.descriptor.platform.clone(),
            job_ref: format!("job-{}", prepared.descriptor.submit_num),
        })
    }

    async fn poll(
        &self,
        handles: Vec<SubmitHandle>,
    ) -> Vec<(SubmitHandle, JobPollStatus, Option<String>)> {
        handles
            .into_iter()
            .map(|h| (h, JobPollStatus::Running, None))
            .collect()
    }

    async fn kill(&self, handles: Vec<SubmitHandle>) -> Vec<(SubmitHandle, KillOutcome)> {
        for handle in &handles {
            self.killed.lock().unwrap().push(handle.id.to_string());
        }
        handles
            .into_iter()
            .map(|h| (h, KillOutcome::Killed))
            .collect()
    }
}

/// Sink that records fired events
#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<(String, String)>>>,
}

impl EventSink for RecordingSink {
    fn task_event(&mut self, id: &TaskId, event: &str, _handlers: &[String], _message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((id.to_string(), event.to_string()));
    }

    fn workflow_event(&mut self, event: &str, _handlers: &[String], _message: &str) {
        self.events
            .lock()
            .unwrap()
            .push(("workflow".to_string(), event.to_string()));
    }
}

struct Harness {
    scheduler: Scheduler,
    msg_tx: mpsc::UnboundedSender<TaskMessage>,
    client: cadence_core::commands::SchedulerClient,
    runner: Arc<MockRunner>,
    events: Arc<Mutex<Vec<(String, String)>>>,
}

impl Harness {
    async fn start(config: WorkflowConfig) -> Self {
        Self::start_with_options(config, SchedulerOptions::default()).await
    }

    async fn start_with_options(config: WorkflowConfig, options: SchedulerOptions) -> Self {
        let runner = Arc::new(MockRunner::default());
        let sink = RecordingSink::default();
        let events = Arc::clone(&sink.events);
        let (scheduler, client, msg_tx) = Scheduler::with_sink(
            config,
            Arc::clone(&runner) as Arc<dyn JobRunner>,
            options,
            Box::new(sink),
        )
        .await
        .unwrap();
        Self {
            scheduler,
            msg_tx,
            client,
            runner,
            events,
        }
    }

    /// Run one tick and let worker tasks settle
    async fn tick(&mut self) -> TickOutcome {
        let outcome = self.scheduler.tick(Utc::now()).await.unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        outcome
    }

    /// Run `n` ticks, ignoring outcomes
    async fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick().await;
        }
    }

    /// Report a message for a task
    fn send(&self, id: &TaskId, message: &str) {
        self.msg_tx
            .send(TaskMessage::new(id.clone(), message, Utc::now()))
            .unwrap();
    }

    /// Report the full success lifecycle for a task
    fn succeed(&self, id: &TaskId) {
        self.send(id, "started");
        self.send(id, "succeeded");
    }

    fn submitted(&self) -> Vec<String> {
        self.runner.submitted.lock().unwrap().clone()
    }

    fn pool_ids(&self) -> Vec<String> {
        self.scheduler
            .pool()
            .iter()
            .map(|p| p.id.to_string())
            .collect()
    }

    fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.scheduler.pool().get(id).map(|p| p.status)
    }

    fn workflow_events(&self, event: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, e)| target == "workflow" && e == event)
            .count()
    }
}

fn p(n: i64) -> CyclePoint {
    CyclePoint::Integer(n)
}

fn id(point: i64, name: &str) -> TaskId {
    TaskId::new(p(point), name)
}

fn once_at(point: i64) -> CycleSequence {
    CycleSequence::once(p(point))
}

fn repeat(start: i64, step: i64) -> CycleSequence {
    CycleSequence::new(p(start), CycleInterval::Integer(step)).unwrap()
}

fn task(name: &str, seq: CycleSequence) -> TaskDef {
    TaskDef::new(name, vec![seq])
}

fn depends(def: TaskDef, upstreams: &[&str]) -> TaskDef {
    def.with_dependency(Dependency::all(
        upstreams.iter().map(|u| TaskTrigger::succeeded(*u)).collect(),
    ))
}

/// `a => b => c`, single shot at point 1
fn chain_config() -> WorkflowConfig {
    let mut config = WorkflowConfig::new("chain", CyclingMode::Integer, p(1));
    config.add_task(task("a", once_at(1)));
    config.add_task(depends(task("b", once_at(1)), &["a"]));
    config.add_task(depends(task("c", once_at(1)), &["b"]));
    config
}

#[tokio::test]
async fn test_linear_chain_runs_in_dependency_order() {
    let mut h = Harness::start(chain_config()).await;

    h.ticks(2).await;
    assert_eq!(h.submitted(), vec!["1/a"]);

    h.succeed(&id(1, "a"));
    h.ticks(3).await;
    assert_eq!(h.submitted(), vec!["1/a", "1/b"]);

    h.succeed(&id(1, "b"));
    h.ticks(3).await;
    assert_eq!(h.submitted(), vec!["1/a", "1/b", "1/c"]);

    h.succeed(&id(1, "c"));
    h.ticks(2).await;
    // Everything complete: the workflow shuts itself down.
    let outcome = h.tick().await;
    assert!(matches!(outcome, TickOutcome::Stop(_)));
}

#[tokio::test]
async fn test_runahead_zero_window() {
    // a[-P1] => a with a zero runahead window: exactly one instance live.
    let mut config = WorkflowConfig::new("cycle", CyclingMode::Integer, p(1));
    config.runahead_limit = RunaheadLimit::Interval(CycleInterval::Integer(0));
    config.add_task(task("a", repeat(1, 1)).with_dependency(Dependency::all(vec![
        TaskTrigger::offset("a", CycleInterval::Integer(-1), OUTPUT_SUCCEEDED),
    ])));
    let mut h = Harness::start(config).await;

    h.ticks(3).await;
    assert_eq!(h.pool_ids(), vec!["1/a"]);

    h.succeed(&id(1, "a"));
    h.ticks(3).await;
    assert_eq!(h.pool_ids(), vec!["2/a"]);

    h.succeed(&id(2, "a"));
    h.ticks(3).await;
    assert_eq!(h.pool_ids(), vec!["3/a"]);
}

#[tokio::test]
async fn test_group_trigger_reruns_subgraph() {
    // x => a; a => b & c => d; d => e; off => b
    let mut config = WorkflowConfig::new("group", CyclingMode::Integer, p(1));
    config.add_task(task("x", once_at(1)));
    config.add_task(task("off", once_at(1)));
    config.add_task(depends(task("a", once_at(1)), &["x"]));
    config.add_task(
        depends(task("b", once_at(1)), &["a"]).with_dependency(Dependency::all(vec![
            TaskTrigger::succeeded("off"),
        ])),
    );
    config.add_task(depends(task("c", once_at(1)), &["a"]));
    config.add_task(depends(task("d", once_at(1)), &["b", "c"]));
    config.add_task(depends(task("e", once_at(1)), &["d"]));

    let mut h = Harness::start_with_options(
        config,
        SchedulerOptions {
            start_paused: true,
            ..SchedulerOptions::default()
        },
    )
    .await;

    // Keep the off-group feeders from ever running.
    h.tick().await;
    h.client.hold(&["1/x", "1/off"]).unwrap();
    h.tick().await;
    h.client.resume().unwrap();

    h.client
        .trigger(&["1/a", "1/b", "1/c", "1/d"], &[], false)
        .unwrap();
    h.ticks(3).await;
    // Only the group-start runs first: its x prerequisite was forced.
    assert_eq!(h.submitted(), vec!["1/a"]);

    h.succeed(&id(1, "a"));
    h.ticks(3).await;
    let mut wave = h.submitted();
    wave.sort();
    assert_eq!(wave, vec!["1/a", "1/b", "1/c"]);

    h.succeed(&id(1, "b"));
    h.succeed(&id(1, "c"));
    h.ticks(3).await;
    assert!(h.submitted().contains(&"1/d".to_string()));

    // e follows naturally from d.
    h.succeed(&id(1, "d"));
    h.ticks(3).await;
    assert!(h.submitted().contains(&"1/e".to_string()));

    // The feeders never ran.
    assert!(!h.submitted().contains(&"1/x".to_string()));
    assert!(!h.submitted().contains(&"1/off".to_string()));
}

#[tokio::test]
async fn test_flow_merge_on_manual_trigger() {
    let mut h = Harness::start(chain_config()).await;
    h.ticks(2).await;
    assert_eq!(h.submitted(), vec!["1/a"]);

    // Trigger 1/b in a new flow before flow 1 reaches it.
    h.client.trigger(&["1/b"], &["new"], false).unwrap();
    h.ticks(3).await;
    assert_eq!(h.submitted(), vec!["1/a", "1/b"]);
    let b_flows = h.scheduler.pool().get(&id(1, "b")).unwrap().flow_nums.clone();
    assert_eq!(b_flows.into_iter().collect::<Vec<i64>>(), vec![2]);

    // Flow 1 catches up: the two instances merge rather than duplicate.
    h.succeed(&id(1, "a"));
    h.ticks(3).await;
    let b = h.scheduler.pool().get(&id(1, "b")).unwrap();
    assert_eq!(
        b.flow_nums.iter().copied().collect::<Vec<i64>>(),
        vec![1, 2]
    );
    assert_eq!(b.pool_row().flow_nums, "[1,2]");
    // 1/b was not resubmitted by the merge.
    assert_eq!(h.submitted(), vec!["1/a", "1/b"]);
}

#[tokio::test]
async fn test_reload_graph_change() {
    // a => b => c, reloaded into a => b & d => c while 1/b waits.
    let mut config = WorkflowConfig::new("reload", CyclingMode::Integer, p(1));
    config.add_task(task("a", once_at(1)));
    config.add_task(depends(task("b", once_at(1)), &["a"]));
    config.add_task(depends(task("c", once_at(1)), &["b"]));

    let mut h = Harness::start(config).await;
    h.ticks(2).await;
    h.client.pause().unwrap();
    h.succeed(&id(1, "a"));
    h.ticks(2).await;
    assert_eq!(h.status_of(&id(1, "b")), Some(TaskStatus::Waiting));

    let mut new_config = WorkflowConfig::new("reload", CyclingMode::Integer, p(1));
    new_config.add_task(task("a", once_at(1)));
    new_config.add_task(depends(task("b", once_at(1)), &["a"]));
    new_config.add_task(depends(task("d", once_at(1)), &["a"]));
    new_config.add_task(depends(task("c", once_at(1)), &["b", "d"]));
    h.client.reload(new_config).unwrap();
    h.ticks(2).await;

    // The added task appears, satisfied by a's recorded output.
    assert_eq!(h.status_of(&id(1, "d")), Some(TaskStatus::Waiting));

    h.client.resume().unwrap();
    h.ticks(3).await;
    let mut submitted = h.submitted();
    submitted.sort();
    assert_eq!(submitted, vec!["1/a", "1/b", "1/d"]);

    // c now needs both b and d.
    h.succeed(&id(1, "b"));
    h.ticks(3).await;
    assert!(!h.submitted().contains(&"1/c".to_string()));
    h.succeed(&id(1, "d"));
    h.ticks(3).await;
    assert!(h.submitted().contains(&"1/c".to_string()));
}

#[tokio::test]
async fn test_stall_detection_fires_once() {
    // a & b => c; a fails with no retries; b succeeds; stall.
    let mut config = WorkflowConfig::new("stall", CyclingMode::Integer, p(1));
    config.events = EventsConfig {
        stall_timeout: None,
        abort_on_stall: false,
        ..EventsConfig::default()
    };
    config.add_task(task("a", once_at(1)));
    config.add_task(task("b", once_at(1)));
    config.add_task(depends(task("c", once_at(1)), &["a", "b"]));

    let mut h = Harness::start(config).await;
    h.ticks(2).await;

    h.send(&id(1, "a"), "started");
    h.send(&id(1, "a"), "failed");
    h.succeed(&id(1, "b"));
    h.ticks(3).await;

    let mut pool = h.pool_ids();
    pool.sort();
    assert_eq!(pool, vec!["1/a", "1/c"]);
    assert_eq!(h.status_of(&id(1, "a")), Some(TaskStatus::Failed));
    assert_eq!(h.status_of(&id(1, "c")), Some(TaskStatus::Waiting));

    h.ticks(5).await;
    assert_eq!(h.workflow_events("stall"), 1);
}

#[tokio::test]
async fn test_restart_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions {
        run_dir: Some(dir.path().to_path_buf()),
        ..SchedulerOptions::default()
    };

    {
        let mut h = Harness::start_with_options(chain_config(), options.clone()).await;
        h.ticks(3).await;
        assert_eq!(h.status_of(&id(1, "a")), Some(TaskStatus::Submitted));
    }

    // Restart over the same run directory.
    let h = Harness::start_with_options(chain_config(), options).await;
    assert_eq!(h.pool_ids(), vec!["1/a"]);
    assert_eq!(h.status_of(&id(1, "a")), Some(TaskStatus::Submitted));
    assert_eq!(h.workflow_events("restart"), 1);
}

#[tokio::test]
async fn test_hold_release_idempotence() {
    let mut h = Harness::start_with_options(
        chain_config(),
        SchedulerOptions {
            start_paused: true,
            ..SchedulerOptions::default()
        },
    )
    .await;
    h.tick().await;

    h.client.hold(&["1/a"]).unwrap();
    h.client.hold(&["1/a"]).unwrap();
    h.tick().await;
    assert!(h.scheduler.pool().get(&id(1, "a")).unwrap().is_held);

    h.client.release(&["1/a"]).unwrap();
    h.client.release(&["1/a"]).unwrap();
    h.tick().await;
    assert!(!h.scheduler.pool().get(&id(1, "a")).unwrap().is_held);

    // Held through a resume: the task only runs once released.
    h.client.hold(&["1/a"]).unwrap();
    h.client.resume().unwrap();
    h.ticks(2).await;
    assert!(h.submitted().is_empty());
    h.client.release(&["1/a"]).unwrap();
    h.ticks(2).await;
    assert_eq!(h.submitted(), vec!["1/a"]);
}

#[tokio::test]
async fn test_set_outputs_is_idempotent() {
    let mut h = Harness::start_with_options(
        chain_config(),
        SchedulerOptions {
            start_paused: true,
            ..SchedulerOptions::default()
        },
    )
    .await;
    h.tick().await;

    // Completing a's required outputs by command spawns b, satisfied.
    h.client.set(&["1/a"], &[], &[], &[]).unwrap();
    h.tick().await;
    assert!(h.scheduler.pool().get(&id(1, "a")).is_none());
    let b = h.scheduler.pool().get(&id(1, "b")).unwrap();
    assert!(b.prereqs_all_satisfied());

    // A second identical set changes nothing.
    h.client.set(&["1/a"], &[], &[], &[]).unwrap();
    h.tick().await;
    let mut pool = h.pool_ids();
    pool.sort();
    assert_eq!(pool, vec!["1/b"]);
}

#[tokio::test]
async fn test_trigger_at_stop_point_runs_then_stops() {
    let mut config = WorkflowConfig::new("bounded", CyclingMode::Integer, p(1));
    config.stop_point = Some(p(1));
    config.add_task(task("a", repeat(1, 1)));
    let mut h = Harness::start(config).await;

    h.ticks(2).await;
    assert_eq!(h.submitted(), vec!["1/a"]);

    h.succeed(&id(1, "a"));
    h.ticks(2).await;
    // Nothing beyond the stop point spawns; the workflow completes.
    let outcome = h.tick().await;
    assert!(matches!(outcome, TickOutcome::Stop(_)));
    assert_eq!(h.submitted(), vec!["1/a"]);
}

#[tokio::test]
async fn test_remove_then_retrigger_is_pristine() {
    let mut h = Harness::start(chain_config()).await;
    h.ticks(2).await;
    h.succeed(&id(1, "a"));
    h.ticks(3).await;
    // b is running in flow 1.
    assert!(h.submitted().contains(&"1/b".to_string()));

    h.client.remove(&["1/b"], &[]).unwrap();
    h.ticks(2).await;
    assert!(h.scheduler.pool().get(&id(1, "b")).is_none());
    assert!(h
        .runner
        .killed
        .lock()
        .unwrap()
        .contains(&"1/b".to_string()));

    // Retriggering in the same flow yields a fresh run of b.
    h.client.trigger(&["1/b"], &["1"], false).unwrap();
    h.ticks(3).await;
    assert!(h.scheduler.pool().get(&id(1, "b")).is_some());
    assert_eq!(
        h.submitted().iter().filter(|s| *s == "1/b").count(),
        2,
        "b resubmitted after remove + trigger"
    );
}

#[tokio::test]
async fn test_broadcast_applies_at_job_preparation() {
    let mut h = Harness::start_with_options(
        chain_config(),
        SchedulerOptions {
            start_paused: true,
            ..SchedulerOptions::default()
        },
    )
    .await;
    h.tick().await;

    let settings: std::collections::BTreeMap<String, serde_json::Value> =
        [("environment.MODE".to_string(), serde_json::json!("fast"))]
            .into_iter()
            .collect();
    h.client.broadcast(&["1"], &["a"], settings).unwrap();
    h.client.resume().unwrap();
    h.ticks(3).await;

    let descriptors = h.runner.descriptors.lock().unwrap();
    let a = descriptors.iter().find(|d| d.id.name == "a").unwrap();
    assert_eq!(a.environment.get("MODE").map(String::as_str), Some("fast"));
}

#[tokio::test]
async fn test_pause_resume_gates_release() {
    let mut h = Harness::start(chain_config()).await;
    h.client.pause().unwrap();
    h.ticks(2).await;
    assert!(h.submitted().is_empty());
    assert_eq!(h.status_of(&id(1, "a")), Some(TaskStatus::Waiting));

    h.client.resume().unwrap();
    h.ticks(2).await;
    assert_eq!(h.submitted(), vec!["1/a"]);
}

#[tokio::test]
async fn test_queue_limit_bounds_concurrency() {
    use cadence_core::config::QueueConfig;
    let mut config = WorkflowConfig::new("queued", CyclingMode::Integer, p(1));
    config.queues.insert(
        "serial".to_string(),
        QueueConfig {
            limit: 1,
            members: ["a".to_string(), "b".to_string()].into_iter().collect(),
        },
    );
    config.add_task(task("a", once_at(1)));
    config.add_task(task("b", once_at(1)));
    let mut h = Harness::start(config).await;

    h.ticks(3).await;
    // Only one of the two parentless tasks is released.
    assert_eq!(h.submitted().len(), 1);

    let first = h.submitted()[0].clone();
    let first_id = if first == "1/a" { id(1, "a") } else { id(1, "b") };
    h.succeed(&first_id);
    h.ticks(3).await;
    assert_eq!(h.submitted().len(), 2);
}

#[tokio::test]
async fn test_suicide_prerequisite_removes_holder() {
    // b waits on x and a; a failing removes b instead of running it.
    let mut config = WorkflowConfig::new("suicide", CyclingMode::Integer, p(1));
    config.add_task(task("a", once_at(1)));
    config.add_task(task("x", once_at(1)));
    config.add_task(
        depends(task("b", once_at(1)), &["x", "a"]).with_dependency(Dependency {
            clauses: vec![vec![TaskTrigger {
                task: "a".to_string(),
                offset: None,
                output: "failed".to_string(),
            }]],
            suicide: true,
        }),
    );
    let mut h = Harness::start(config).await;
    h.ticks(2).await;

    h.succeed(&id(1, "x"));
    h.ticks(2).await;
    assert_eq!(h.status_of(&id(1, "b")), Some(TaskStatus::Waiting));

    h.send(&id(1, "a"), "started");
    h.send(&id(1, "a"), "failed");
    h.ticks(2).await;

    assert!(h.scheduler.pool().get(&id(1, "b")).is_none());
    assert_eq!(h.status_of(&id(1, "a")), Some(TaskStatus::Failed));
    assert!(!h.submitted().contains(&"1/b".to_string()));
}

#[tokio::test]
async fn test_xtrigger_gates_release() {
    use cadence_core::config::XtriggerConfig;
    use cadence_core::xtrigger::XtriggerFunc;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct AfterCount {
        threshold: u64,
        calls: AtomicU64,
    }

    impl XtriggerFunc for AfterCount {
        fn call(&self, _args: &[serde_json::Value], _now: DateTime<Utc>) -> Option<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (n >= self.threshold).then(|| serde_json::json!({ "calls": n }))
        }
    }

    let mut config = WorkflowConfig::new("gated", CyclingMode::Integer, p(1));
    config.xtriggers.insert(
        "data_ready".to_string(),
        XtriggerConfig {
            function: "poll_data".to_string(),
            args: vec![],
            interval: std::time::Duration::from_secs(0),
        },
    );
    let mut def = task("a", once_at(1));
    def.xtrigger_labels.push("data_ready".to_string());
    config.add_task(def);

    let mut h = Harness::start(config).await;
    h.scheduler.register_xtrigger(
        "poll_data",
        Arc::new(AfterCount {
            threshold: 3,
            calls: AtomicU64::new(0),
        }),
    );

    h.ticks(2).await;
    assert!(h.submitted().is_empty());

    h.ticks(3).await;
    assert_eq!(h.submitted(), vec!["1/a"]);
}

#[tokio::test]
async fn test_clean_stop_waits_for_active_jobs() {
    let mut h = Harness::start(chain_config()).await;
    h.ticks(2).await;
    assert_eq!(h.status_of(&id(1, "a")), Some(TaskStatus::Submitted));

    h.client
        .stop(cadence_core::commands::StopMode::RequestClean, None, None, None, None)
        .unwrap();
    // Active job still out there: the scheduler keeps ticking.
    h.tick().await;
    let outcome = h.scheduler.tick(Utc::now()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Continue));

    h.succeed(&id(1, "a"));
    h.ticks(2).await;
    let outcome = h.scheduler.tick(Utc::now()).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Stop(_)));
    // b never started: no new submissions after the stop request.
    assert_eq!(h.submitted(), vec!["1/a"]);
}
