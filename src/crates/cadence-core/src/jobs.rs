//! Job manager
//!
//! Prepares job descriptors from effective runtimes, dispatches them
//! through the [`JobRunner`] interface on worker tasks, polls and kills,
//! and guards the at-most-once submission invariant. Results come back to
//! the main loop over a channel as [`JobEvent`] values.
//!
//! In simulation mode jobs never reach the runner: they succeed (or fail,
//! per task simulation config) after a simulated run length.

use crate::config::RunMode;
use crate::error::PlatformLookupError;
use crate::events::{MessageSeverity, TaskMessage};
use crate::flow::{FlowManager, FlowNums};
use crate::graph::taskdef::{RuntimeConfig, TaskDef};
use crate::id::TaskId;
use async_trait::async_trait;
use cadence_cycling::CyclingMode;
use cadence_db::models::TaskJobRow;
use cadence_db::{DbOp, PendingOps};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A failure inside the job runner
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct JobError(pub String);

/// Everything the runner needs to build and submit one job
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// The owning task instance
    pub id: TaskId,
    /// Submission number, 1-based
    pub submit_num: u32,
    /// Target platform
    pub platform: String,
    /// Job script
    pub command: String,
    /// Full job environment, including the reserved variables
    pub environment: BTreeMap<String, String>,
    /// Batch system directives
    pub directives: BTreeMap<String, String>,
    /// Wall-clock limit
    pub execution_time_limit: Option<std::time::Duration>,
}

/// A runner-prepared job, ready to submit
#[derive(Debug, Clone)]
pub struct PreparedJob {
    /// The descriptor the job was prepared from
    pub descriptor: JobDescriptor,
}

/// Handle to a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitHandle {
    /// The owning task instance
    pub id: TaskId,
    /// Submission number the handle belongs to
    pub submit_num: u32,
    /// Platform the job went to
    pub platform: String,
    /// Runner-side job reference (batch id, pid, ...)
    pub job_ref: String,
}

/// Job state as reported by a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPollStatus {
    /// Accepted, not yet executing
    Submitted,
    /// Executing
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished unsuccessfully
    Failed,
    /// Never got into the batch system
    SubmitFailed,
}

/// Result of a kill request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// The job was terminated
    Killed,
    /// The kill failed
    Error(String),
}

/// The pluggable job execution backend
///
/// All calls are dispatched on worker tasks; implementations may block on
/// network or process I/O.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Materialise a job (write job scripts, stage files)
    async fn prepare(&self, descriptor: &JobDescriptor) -> Result<PreparedJob, JobError>;
    /// Hand a prepared job to the platform
    async fn submit(&self, prepared: PreparedJob) -> Result<SubmitHandle, JobError>;
    /// Poll the platform for job states
    async fn poll(&self, handles: Vec<SubmitHandle>)
        -> Vec<(SubmitHandle, JobPollStatus, Option<String>)>;
    /// Terminate jobs
    async fn kill(&self, handles: Vec<SubmitHandle>) -> Vec<(SubmitHandle, KillOutcome)>;
}

/// Worker-side result delivered back to the main loop
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A job was accepted by its platform
    Submitted {
        /// Owning task instance
        id: TaskId,
        /// Submission number
        submit_num: u32,
        /// Handle for later poll/kill
        handle: SubmitHandle,
    },
    /// A job never made it into the platform
    SubmitFailed {
        /// Owning task instance
        id: TaskId,
        /// Submission number
        submit_num: u32,
        /// What went wrong
        error: String,
    },
    /// A poll returned a job state
    PollStatus {
        /// Owning task instance
        id: TaskId,
        /// Submission number
        submit_num: u32,
        /// Reported state
        status: JobPollStatus,
        /// Runner payload, if any
        payload: Option<String>,
    },
    /// A kill request completed
    KillDone {
        /// Owning task instance
        id: TaskId,
        /// Submission number
        submit_num: u32,
        /// How it went
        outcome: KillOutcome,
    },
}

/// One submission request from the pool
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// The task instance to run
    pub id: TaskId,
    /// Submission number to use
    pub submit_num: u32,
    /// Effective runtime (taskdef + inherited runtime + broadcasts)
    pub runtime: RuntimeConfig,
    /// The instance's flow numbers
    pub flow_nums: FlowNums,
}

/// A job running under simulation
#[derive(Debug, Clone)]
struct SimJob {
    id: TaskId,
    submit_num: u32,
    end_time: DateTime<Utc>,
    fail: bool,
    started_sent: bool,
}

/// The job manager
pub struct JobManager {
    runner: Arc<dyn JobRunner>,
    run_mode: RunMode,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    live: HashMap<(TaskId, u32), SubmitHandle>,
    submit_guard: HashSet<(TaskId, u32)>,
    max_submit: HashMap<TaskId, u32>,
    initialised_platforms: HashSet<String>,
    sim_jobs: Vec<SimJob>,
    poll_interval: std::time::Duration,
    last_poll: Option<DateTime<Utc>>,
    workflow_name: String,
    run_dir: String,
}

impl JobManager {
    /// Create a manager; the receiver side of the returned channel is
    /// drained by the main loop
    pub fn new(
        runner: Arc<dyn JobRunner>,
        run_mode: RunMode,
        workflow_name: impl Into<String>,
        run_dir: impl Into<String>,
        poll_interval: std::time::Duration,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                runner,
                run_mode,
                events_tx,
                live: HashMap::new(),
                submit_guard: HashSet::new(),
                max_submit: HashMap::new(),
                initialised_platforms: HashSet::new(),
                sim_jobs: Vec::new(),
                poll_interval,
                last_poll: None,
                workflow_name: workflow_name.into(),
                run_dir: run_dir.into(),
            },
            events_rx,
        )
    }

    /// Number of jobs currently tracked as live
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// The next usable submission number for a task
    ///
    /// A respawned instance restarts its own counter at zero; the manager
    /// remembers every number it has guarded so the at-most-once
    /// invariant holds across remove-and-retrigger.
    pub fn next_submit_num(&self, id: &TaskId, current: u32) -> u32 {
        let floor = self.max_submit.get(id).copied().unwrap_or(0);
        (current + 1).max(floor + 1)
    }

    /// Submit one job, at most once per `(task, submit_num)`
    pub fn submit(
        &mut self,
        request: JobRequest,
        taskdef: &TaskDef,
        try_num: u32,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) {
        let guard_key = (request.id.clone(), request.submit_num);
        let max = self.max_submit.entry(request.id.clone()).or_insert(0);
        *max = (*max).max(request.submit_num);
        if !self.submit_guard.insert(guard_key) {
            warn!(
                task = %request.id,
                submit_num = request.submit_num,
                "duplicate submission suppressed"
            );
            return;
        }
        if self.initialised_platforms.insert(request.runtime.platform.clone()) {
            info!(platform = %request.runtime.platform, "initialising platform");
        }
        pending.push(DbOp::UpsertJob(TaskJobRow {
            cycle: request.id.point.to_string(),
            name: request.id.name.clone(),
            submit_num: request.submit_num as i64,
            platform: request.runtime.platform.clone(),
            submit_time: Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
            start_time: None,
            end_time: None,
            status: "submitted".to_string(),
        }));

        if self.run_mode == RunMode::Simulation {
            let fail = taskdef
                .simulation
                .fail_cycle_points
                .contains(&request.id.point)
                && (!taskdef.simulation.fail_try_1_only || try_num == 0);
            let run_length = chrono::Duration::from_std(taskdef.simulation.run_length)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
            debug!(task = %request.id, fail = fail, "simulated submission");
            self.sim_jobs.push(SimJob {
                id: request.id.clone(),
                submit_num: request.submit_num,
                end_time: now + run_length,
                fail,
                started_sent: false,
            });
            let _ = self.events_tx.send(JobEvent::Submitted {
                id: request.id.clone(),
                submit_num: request.submit_num,
                handle: SubmitHandle {
                    id: request.id,
                    submit_num: request.submit_num,
                    platform: "simulation".to_string(),
                    job_ref: "simulated".to_string(),
                },
            });
            return;
        }

        let descriptor = self.build_descriptor(&request);
        let runner = Arc::clone(&self.runner);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match runner.prepare(&descriptor).await {
                Ok(prepared) => runner.submit(prepared).await,
                Err(e) => Err(e),
            };
            let event = match result {
                Ok(handle) => JobEvent::Submitted {
                    id: descriptor.id.clone(),
                    submit_num: descriptor.submit_num,
                    handle,
                },
                Err(e) => JobEvent::SubmitFailed {
                    id: descriptor.id.clone(),
                    submit_num: descriptor.submit_num,
                    error: e.to_string(),
                },
            };
            let _ = events_tx.send(event);
        });
    }

    /// Record a handle once the platform accepted the job
    pub fn note_submitted(&mut self, id: &TaskId, submit_num: u32, handle: SubmitHandle) {
        self.live.insert((id.clone(), submit_num), handle);
    }

    /// Forget a job that reached a terminal state
    pub fn note_finished(&mut self, id: &TaskId, submit_num: u32) {
        self.live.remove(&(id.clone(), submit_num));
        self.sim_jobs
            .retain(|j| !(j.id == *id && j.submit_num == submit_num));
    }

    /// Poll all live jobs if the poll interval has elapsed
    pub fn poll_due(&mut self, now: DateTime<Utc>) {
        let due = match self.last_poll {
            Some(last) => {
                now >= last
                    + chrono::Duration::from_std(self.poll_interval)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60))
            }
            None => false,
        };
        if self.last_poll.is_none() {
            self.last_poll = Some(now);
            return;
        }
        if due && !self.live.is_empty() {
            self.last_poll = Some(now);
            self.poll_handles(self.live.values().cloned().collect());
        }
    }

    /// Poll specific task instances now
    ///
    /// Unknown instances are a warning no-op.
    pub fn poll_tasks(&mut self, ids: &[TaskId]) {
        let handles: Vec<SubmitHandle> = self
            .live
            .iter()
            .filter(|((id, _), _)| ids.contains(id))
            .map(|(_, handle)| handle.clone())
            .collect();
        for id in ids {
            if !self.live.keys().any(|(live_id, _)| live_id == id) {
                warn!(task = %id, "poll: no live job");
            }
        }
        if !handles.is_empty() {
            self.poll_handles(handles);
        }
    }

    /// Kill the live jobs of the given instances
    ///
    /// A kill for an instance with no live job is a warning no-op.
    pub fn kill_tasks(&mut self, ids: &[TaskId]) {
        let handles: Vec<SubmitHandle> = self
            .live
            .iter()
            .filter(|((id, _), _)| ids.contains(id))
            .map(|(_, handle)| handle.clone())
            .collect();
        for id in ids {
            if !self.live.keys().any(|(live_id, _)| live_id == id) {
                warn!(task = %id, "kill: no live job");
            }
        }
        // Simulated jobs die immediately.
        let mut killed_sim = Vec::new();
        self.sim_jobs.retain(|job| {
            if ids.contains(&job.id) {
                killed_sim.push((job.id.clone(), job.submit_num));
                false
            } else {
                true
            }
        });
        for (id, submit_num) in killed_sim {
            let _ = self.events_tx.send(JobEvent::KillDone {
                id,
                submit_num,
                outcome: KillOutcome::Killed,
            });
        }
        if handles.is_empty() {
            return;
        }
        let runner = Arc::clone(&self.runner);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            for (handle, outcome) in runner.kill(handles).await {
                let _ = events_tx.send(JobEvent::KillDone {
                    id: handle.id,
                    submit_num: handle.submit_num,
                    outcome,
                });
            }
        });
    }

    /// Advance simulated jobs; returns the task messages they produced
    pub fn check_simulation(&mut self, now: DateTime<Utc>) -> Vec<TaskMessage> {
        let mut messages = Vec::new();
        let mut finished = Vec::new();
        for job in &mut self.sim_jobs {
            if !job.started_sent {
                job.started_sent = true;
                messages.push(TaskMessage {
                    id: job.id.clone(),
                    submit_num: Some(job.submit_num),
                    timestamp: now,
                    severity: MessageSeverity::Info,
                    message: "started".to_string(),
                });
            }
            if now >= job.end_time {
                messages.push(TaskMessage {
                    id: job.id.clone(),
                    submit_num: Some(job.submit_num),
                    timestamp: now,
                    severity: if job.fail {
                        MessageSeverity::Critical
                    } else {
                        MessageSeverity::Info
                    },
                    message: if job.fail { "failed" } else { "succeeded" }.to_string(),
                });
                finished.push((job.id.clone(), job.submit_num));
            }
        }
        for (id, submit_num) in finished {
            self.note_finished(&id, submit_num);
        }
        messages
    }

    /// Re-associate live job rows with proxies after a restart
    ///
    /// Each recorded platform must still resolve; the restored handles
    /// are polled once by the caller to reconcile state.
    pub fn restore(
        &mut self,
        rows: &[TaskJobRow],
        known_platforms: &HashSet<String>,
        mode: CyclingMode,
    ) -> Result<Vec<TaskId>, PlatformLookupError> {
        let mut restored = Vec::new();
        for row in rows {
            if !known_platforms.contains(&row.platform) {
                return Err(PlatformLookupError {
                    platform: row.platform.clone(),
                });
            }
            let Ok(point) = cadence_cycling::CyclePoint::parse(&row.cycle, mode) else {
                continue;
            };
            let id = TaskId::new(point, row.name.as_str());
            let submit_num = row.submit_num as u32;
            self.submit_guard.insert((id.clone(), submit_num));
            let max = self.max_submit.entry(id.clone()).or_insert(0);
            *max = (*max).max(submit_num);
            if self.initialised_platforms.insert(row.platform.clone()) {
                info!(platform = %row.platform, "re-initialising platform after restart");
            }
            self.live.insert(
                (id.clone(), submit_num),
                SubmitHandle {
                    id: id.clone(),
                    submit_num,
                    platform: row.platform.clone(),
                    job_ref: format!("restored/{}/{}", id, submit_num),
                },
            );
            restored.push(id);
        }
        Ok(restored)
    }

    fn poll_handles(&self, handles: Vec<SubmitHandle>) {
        let runner = Arc::clone(&self.runner);
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            for (handle, status, payload) in runner.poll(handles).await {
                let _ = events_tx.send(JobEvent::PollStatus {
                    id: handle.id,
                    submit_num: handle.submit_num,
                    status,
                    payload,
                });
            }
        });
    }

    fn build_descriptor(&self, request: &JobRequest) -> JobDescriptor {
        let mut environment = request.runtime.environment.clone();
        environment.insert("CADENCE_WORKFLOW_NAME".into(), self.workflow_name.clone());
        environment.insert("CADENCE_WORKFLOW_RUN_DIR".into(), self.run_dir.clone());
        environment.insert(
            "CADENCE_WORKFLOW_SHARE_DIR".into(),
            format!("{}/share", self.run_dir),
        );
        environment.insert(
            "CADENCE_WORKFLOW_WORK_DIR".into(),
            format!("{}/work", self.run_dir),
        );
        environment.insert("CADENCE_TASK_CYCLE_POINT".into(), request.id.point.to_string());
        environment.insert("CADENCE_TASK_NAME".into(), request.id.name.clone());
        environment.insert(
            "CADENCE_TASK_SUBMIT_NUMBER".into(),
            request.submit_num.to_string(),
        );
        environment.insert(
            "CADENCE_TASK_FLOW_NUMBERS".into(),
            FlowManager::to_db_string(&request.flow_nums),
        );
        JobDescriptor {
            id: request.id.clone(),
            submit_num: request.submit_num,
            platform: request.runtime.platform.clone(),
            command: request.runtime.command.clone(),
            environment,
            directives: request.runtime.directives.clone(),
            execution_time_limit: request.runtime.execution_time_limit,
        }
    }
}
