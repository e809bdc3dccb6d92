//! The scheduler main loop
//!
//! A single task owns the pool, the prerequisite state and the
//! persistence queue. Each tick runs the fixed phase order: reload,
//! commands, release, job I/O, message folding, persistence, shutdown
//! evaluation, health checks. Worker-side job results return over
//! channels and are folded in as ordinary task messages.

use crate::broadcast::BroadcastManager;
use crate::commands::{command_channel, Command, SchedulerClient, StopMode};
use crate::config::WorkflowConfig;
use crate::contact::{ContactFile, ContactInfo};
use crate::error::{CommandFailedError, CoreError, Result, SchedulerError, SchedulerStop};
use crate::events::{EventManager, EventSink, LogEventSink, TaskMessage};
use crate::flow::{FlowManager, FlowNums, FlowSelection};
use crate::graph::store::GraphStore;
use crate::graph::taskdef::OUTPUT_SUCCEEDED;
use crate::id::TaskId;
use crate::jobs::{JobEvent, JobManager, JobPollStatus, JobRequest, JobRunner, KillOutcome};
use crate::logging::VerbosityHandle;
use crate::pool::pool::TaskPool;
use crate::task_state::TaskStatus;
use crate::xtrigger::XtriggerManager;
use cadence_db::models::TaskJobRow;
use cadence_db::repositories::{
    BroadcastsRepository, FlowsRepository, ParamsRepository, TaskJobsRepository,
    TaskOutputsRepository, TaskPoolRepository, TaskPrereqsRepository, TaskStatesRepository,
    XtriggersRepository,
};
use cadence_db::{DbOp, PendingOps, WorkflowDatabase};
use cadence_cycling::CyclePoint;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameter keys in `workflow_params`
mod params {
    pub const UUID: &str = "uuid";
    pub const INITIAL_POINT: &str = "initial_point";
    pub const FINAL_POINT: &str = "final_point";
    pub const STOP_POINT: &str = "stop_point";
    pub const HOLD_POINT: &str = "hold_point";
    pub const PAUSED: &str = "paused";
}

/// Mutable per-tick flags, owned by the main loop
#[derive(Debug, Default, Clone, Copy)]
pub struct TickFlags {
    /// Something externally observable changed this tick
    pub state_changed: bool,
    /// Run the next tick on the expedited cadence
    pub expedite: bool,
}

/// Start-up options for a scheduler run
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Run directory for the databases and contact file; `None` runs
    /// fully in memory (tests)
    pub run_dir: Option<PathBuf>,
    /// Start paused
    pub start_paused: bool,
    /// Interval between routine job polls
    pub poll_interval: std::time::Duration,
    /// Normal tick cadence
    pub tick_interval: std::time::Duration,
    /// Expedited tick cadence used while work is pending
    pub quick_tick_interval: std::time::Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            run_dir: None,
            start_paused: false,
            poll_interval: std::time::Duration::from_secs(60),
            tick_interval: std::time::Duration::from_secs(1),
            quick_tick_interval: std::time::Duration::from_millis(500),
        }
    }
}

/// What a tick decided about continuing
#[derive(Debug)]
pub enum TickOutcome {
    /// Keep running
    Continue,
    /// Leave the main loop cleanly
    Stop(SchedulerStop),
}

/// The cycling workflow scheduler
pub struct Scheduler {
    config: WorkflowConfig,
    pool: TaskPool,
    flows: FlowManager,
    events: EventManager,
    jobs: JobManager,
    job_events_rx: mpsc::UnboundedReceiver<JobEvent>,
    broadcasts: BroadcastManager,
    xtriggers: XtriggerManager,
    db: WorkflowDatabase,
    pending: PendingOps,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    msg_rx: mpsc::UnboundedReceiver<TaskMessage>,
    uuid: String,
    contact: Option<ContactFile>,
    verbosity: Option<VerbosityHandle>,
    options: SchedulerOptions,
    is_paused: bool,
    stop_mode: Option<StopMode>,
    stop_clock: Option<DateTime<Utc>>,
    stop_task: Option<TaskId>,
    stop_flow: Option<i64>,
    pending_reload: Option<Box<WorkflowConfig>>,
    tick_flags: TickFlags,
    stall_since: Option<DateTime<Utc>>,
    stall_handled: bool,
    last_activity: DateTime<Utc>,
    inactivity_fired: bool,
    auto_restart_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    /// Build a scheduler over a resolved configuration and a job runner
    ///
    /// Returns the scheduler, the command client, and the task message
    /// ingress used by message routers. A pre-existing database in the
    /// run directory makes this a restart.
    pub async fn new(
        config: WorkflowConfig,
        runner: Arc<dyn JobRunner>,
        options: SchedulerOptions,
    ) -> Result<(Self, SchedulerClient, mpsc::UnboundedSender<TaskMessage>)> {
        Self::with_sink(config, runner, options, Box::new(LogEventSink)).await
    }

    /// Like [`Scheduler::new`] with a custom event sink (tests)
    pub async fn with_sink(
        config: WorkflowConfig,
        runner: Arc<dyn JobRunner>,
        options: SchedulerOptions,
        sink: Box<dyn EventSink>,
    ) -> Result<(Self, SchedulerClient, mpsc::UnboundedSender<TaskMessage>)> {
        let graph = Arc::new(GraphStore::compile(&config)?);
        let db = match &options.run_dir {
            Some(dir) => WorkflowDatabase::open(dir).await?,
            None => WorkflowDatabase::open_in_memory().await?,
        };
        let is_restart = ParamsRepository::get(db.pool(), params::UUID).await?.is_some();

        let run_dir_display = options
            .run_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| format!("memory/{}", config.name));
        let (jobs, job_events_rx) = JobManager::new(
            runner,
            config.run_mode,
            config.name.clone(),
            run_dir_display,
            options.poll_interval,
        );
        let (client, cmd_rx) = command_channel(config.cycling_mode);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        let pool = TaskPool::new(Arc::clone(&graph), &config);
        let xtriggers = XtriggerManager::new(config.xtriggers.clone());
        let now = Utc::now();
        let mut scheduler = Self {
            is_paused: options.start_paused,
            config,
            pool,
            flows: FlowManager::new(),
            events: EventManager::new(sink),
            jobs,
            job_events_rx,
            broadcasts: BroadcastManager::new(),
            xtriggers,
            db,
            pending: PendingOps::new(),
            cmd_rx,
            msg_rx,
            uuid: Uuid::new_v4().to_string(),
            contact: options.run_dir.as_deref().map(ContactFile::new),
            verbosity: None,
            options,
            stop_mode: None,
            stop_clock: None,
            stop_task: None,
            stop_flow: None,
            pending_reload: None,
            tick_flags: TickFlags::default(),
            stall_since: None,
            stall_handled: false,
            last_activity: now,
            inactivity_fired: false,
            auto_restart_at: None,
        };

        if is_restart {
            scheduler.load_restart(now).await?;
        } else {
            scheduler.load_cold_start(now).await?;
        }

        if let Some(contact) = &scheduler.contact {
            contact.write(&ContactInfo {
                uuid: scheduler.uuid.clone(),
                host: "localhost".to_string(),
                port: None,
                pid: std::process::id(),
            })?;
        }
        scheduler.pending.flush(scheduler.db.pool()).await?;
        Ok((scheduler, client, msg_tx))
    }

    /// The workflow's current paused state
    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    /// Read-only view of the pool (introspection and tests)
    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    /// The run UUID
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Install the reloadable logging filter handle
    ///
    /// Without one, the set-verbosity command reports failure instead of
    /// pretending to work.
    pub fn set_verbosity_handle(&mut self, handle: VerbosityHandle) {
        self.verbosity = Some(handle);
    }

    /// Register the function behind a declared xtrigger
    pub fn register_xtrigger(
        &mut self,
        function: impl Into<String>,
        func: Arc<dyn crate::xtrigger::XtriggerFunc>,
    ) {
        self.xtriggers.register(function, func);
    }

    /// Feed an external trigger message to waiting tasks
    pub fn external_trigger(&mut self, message: &str) -> bool {
        self.pool.apply_external_trigger(message)
    }

    /// Run the main loop until a stop
    ///
    /// `SchedulerStop` leaves cleanly; a `SchedulerError` shuts down and
    /// propagates; any other error is a bug, logged and followed by an
    /// orderly shutdown.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            let now = Utc::now();
            match self.tick(now).await {
                Ok(TickOutcome::Continue) => {
                    let interval = if self.tick_flags.expedite {
                        self.options.quick_tick_interval
                    } else {
                        self.options.tick_interval
                    };
                    tokio::time::sleep(interval).await;
                }
                Ok(TickOutcome::Stop(stop)) => {
                    info!(reason = %stop.0, "scheduler stopping");
                    self.shutdown(&stop.0).await?;
                    return Ok(());
                }
                Err(CoreError::Scheduler(e)) => {
                    error!(error = %e, "unrecoverable fault, shutting down");
                    let _ = self.shutdown("scheduler error").await;
                    return Err(CoreError::Scheduler(e));
                }
                Err(other) => {
                    // A bug: contain it, attempt an orderly shutdown.
                    error!(error = %other, "unexpected error in main loop");
                    let _ = self.shutdown("internal error").await;
                    return Err(other);
                }
            }
        }
    }

    /// One iteration of the fixed phase order
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.tick_flags = TickFlags::default();

        // 1. Pending reload, unless a stop has superseded it.
        if self.pending_reload.is_some() {
            if self.stop_mode.is_some() {
                warn!("reload aborted by stop request");
                self.pending_reload = None;
            } else if self.pool.iter().any(|p| p.status == TaskStatus::Preparing) {
                // Flush preparing tasks through the job manager first.
                self.tick_flags.expedite = true;
            } else if let Some(new_config) = self.pending_reload.take() {
                self.perform_reload(*new_config, now)?;
            }
        }

        // 2. Drain the command queue.
        while let Ok(command) = self.cmd_rx.try_recv() {
            let name = command.name();
            match self.execute_command(command, now).await {
                Ok(()) => {}
                Err(CoreError::CommandFailed(e)) => {
                    warn!(command = %name, error = %e, "command failed");
                }
                Err(CoreError::Scheduler(e)) => return Err(CoreError::Scheduler(e)),
                Err(other) => {
                    warn!(command = %name, error = %other, "command failed");
                }
            }
            self.tick_flags.state_changed = true;
        }

        // 3. Evaluate xtriggers and release runahead-admitted tasks.
        if !self.xtriggers.evaluate_due(now, &mut self.pending).is_empty() {
            self.tick_flags.state_changed = true;
        }
        // Re-applied every tick so instances spawned after satisfaction
        // see the gate open too.
        for label in self.xtriggers.satisfied_labels() {
            self.pool.apply_xtrigger(&label);
        }
        self.pool.check_spawn_parentless(&mut self.pending, now)?;
        let release = self.pool.release_ready(
            self.is_paused,
            self.stop_mode.is_some(),
            now,
            &mut self.pending,
        )?;
        for id in &release.expired {
            self.events
                .fire_task_event(&self.pool, id, "expired", "task expired");
            self.tick_flags.state_changed = true;
        }
        for id in release.released {
            self.submit_released(id, now);
            self.tick_flags.state_changed = true;
        }

        // 4. Job manager I/O.
        self.jobs.poll_due(now);
        let sim_messages = self.jobs.check_simulation(now);

        // 5. Fold in job events and task messages.
        let mut messages: Vec<TaskMessage> = sim_messages;
        while let Ok(event) = self.job_events_rx.try_recv() {
            if let Some(message) = self.job_event_to_message(event, now) {
                messages.push(message);
            }
        }
        while let Ok(message) = self.msg_rx.try_recv() {
            messages.push(message);
        }
        let mut to_kill = Vec::new();
        for message in messages {
            let terminal = matches!(
                message.message.as_str(),
                "succeeded" | "failed" | "submit-failed"
            );
            let submit_num = message
                .submit_num
                .or_else(|| self.pool.get(&message.id).map(|p| p.submit_num));
            let outcome = self
                .events
                .process_message(&mut self.pool, &message, &mut self.pending, now)?;
            to_kill.extend(outcome.to_kill);
            if terminal {
                // Whatever delivered the outcome, the job is done.
                if let Some(submit_num) = submit_num {
                    self.jobs.note_finished(&message.id, submit_num);
                }
            }
            self.tick_flags.state_changed = true;
        }
        if !to_kill.is_empty() {
            self.jobs.kill_tasks(&to_kill);
        }
        self.events.check_late(&mut self.pool, &mut self.pending, now);
        self.pool.check_spawn_parentless(&mut self.pending, now)?;

        // 6. Commit this tick's writes.
        if !self.pending.is_empty() {
            self.pending.flush(self.db.pool()).await?;
            if let Err(e) = self.db.checkpoint_public() {
                warn!(error = %e, "public replica refresh failed; will repair on health check");
            }
            self.tick_flags.state_changed = true;
        }
        if self.tick_flags.state_changed {
            self.last_activity = now;
            self.tick_flags.expedite = true;
        }

        // 7. Shutdown conditions.
        if let Some(outcome) = self.evaluate_shutdown(now) {
            return Ok(outcome);
        }

        // 8. Health checks.
        self.health_check(now).await?;

        Ok(TickOutcome::Continue)
    }

    /// Execute one validated command (phase 2)
    async fn execute_command(&mut self, command: Command, now: DateTime<Utc>) -> Result<()> {
        let name = command.name();
        debug!(command = %name, "executing command");
        let result = self.dispatch_command(command, now).await;
        result.map_err(|e| e.into_command_failure(name))
    }

    async fn dispatch_command(&mut self, command: Command, now: DateTime<Utc>) -> Result<()> {
        match command {
            Command::Stop {
                mode,
                after_point,
                after_clock,
                after_task,
                flow_num,
            } => {
                if let Some(point) = after_point {
                    info!(point = %point, "will stop after cycle point");
                    self.pool.set_stop_point(Some(point));
                    self.pending.push(DbOp::SetParam {
                        key: params::STOP_POINT.into(),
                        value: point.to_string(),
                    });
                } else if let Some(clock) = after_clock {
                    info!(clock = %clock, "will stop after wall-clock time");
                    self.stop_clock = Some(clock);
                } else if let Some(task) = after_task {
                    info!(task = %task, "will stop after task succeeds");
                    self.stop_task = Some(task);
                } else if let Some(flow) = flow_num {
                    info!(flow = flow, "will stop when flow drains");
                    self.stop_flow = Some(flow);
                } else {
                    info!(mode = %mode, "stop requested");
                    self.stop_mode = Some(mode);
                }
                Ok(())
            }
            Command::Pause => {
                if !self.is_paused {
                    info!("workflow paused");
                    self.is_paused = true;
                    self.pending.push(DbOp::SetParam {
                        key: params::PAUSED.into(),
                        value: "1".into(),
                    });
                }
                Ok(())
            }
            Command::Resume => {
                if self.is_paused {
                    info!("workflow resumed");
                    self.is_paused = false;
                    self.pool.clear_deferred();
                    self.pending.push(DbOp::SetParam {
                        key: params::PAUSED.into(),
                        value: "0".into(),
                    });
                }
                Ok(())
            }
            Command::Hold { tasks } => {
                let matched = self.pool.match_selectors(&tasks);
                self.pool.hold(&matched.active, &mut self.pending, now);
                Ok(())
            }
            Command::Release { tasks } => {
                let matched = self.pool.match_selectors(&tasks);
                self.pool
                    .release_held(&matched.active, &mut self.pending, now);
                Ok(())
            }
            Command::SetHoldPoint { point } => {
                self.pool.set_hold_point(point, &mut self.pending, now);
                self.pending.push(DbOp::SetParam {
                    key: params::HOLD_POINT.into(),
                    value: point.to_string(),
                });
                Ok(())
            }
            Command::ReleaseHoldPoint => {
                self.pool.release_hold_point();
                self.pending.push(DbOp::DeleteParam {
                    key: params::HOLD_POINT.into(),
                });
                Ok(())
            }
            Command::Trigger {
                tasks,
                flow,
                on_resume,
            } => {
                let matched = self.pool.match_selectors(&tasks);
                if matched.active.is_empty() && matched.inactive.is_empty() {
                    return Err(CommandFailedError::new("trigger", "no tasks matched").into());
                }
                let outcome = self.pool.group_trigger(
                    &matched,
                    &flow,
                    on_resume,
                    &mut self.flows,
                    &mut self.pending,
                    now,
                )?;
                if !outcome.to_kill.is_empty() {
                    self.jobs.kill_tasks(&outcome.to_kill);
                }
                Ok(())
            }
            Command::Set {
                tasks,
                outputs,
                prereqs,
                flow,
            } => {
                let matched = self.pool.match_selectors(&tasks);
                let mut targets = matched.active;
                targets.extend(matched.inactive);
                if targets.is_empty() {
                    return Err(CommandFailedError::new("set", "no tasks matched").into());
                }
                self.pool.set_prereqs_and_outputs(
                    &targets,
                    &outputs,
                    &prereqs,
                    &flow,
                    &mut self.flows,
                    &mut self.pending,
                    now,
                )
            }
            Command::Remove { tasks, flow } => {
                let matched = self.pool.match_selectors(&tasks);
                let mut targets = matched.active;
                targets.extend(matched.inactive);
                if targets.is_empty() {
                    return Err(CommandFailedError::new("remove", "no tasks matched").into());
                }
                let flow = match flow {
                    FlowSelection::New => {
                        return Err(
                            CommandFailedError::new("remove", "--flow=new is not removable").into()
                        )
                    }
                    other => other,
                };
                let (_, to_kill) =
                    self.pool
                        .remove_tasks(&targets, &flow, &mut self.pending, now);
                if !to_kill.is_empty() {
                    self.jobs.kill_tasks(&to_kill);
                }
                Ok(())
            }
            Command::Kill { tasks } => {
                let matched = self.pool.match_selectors(&tasks);
                self.jobs.kill_tasks(&matched.active);
                Ok(())
            }
            Command::Poll { tasks } => {
                let matched = self.pool.match_selectors(&tasks);
                self.jobs.poll_tasks(&matched.active);
                Ok(())
            }
            Command::Broadcast {
                points,
                namespaces,
                settings,
            } => {
                self.broadcasts
                    .put(&points, &namespaces, &settings, &mut self.pending);
                Ok(())
            }
            Command::ClearBroadcast { points, namespaces } => {
                let cleared = self
                    .broadcasts
                    .clear(&points, &namespaces, &mut self.pending);
                info!(cleared = cleared, "broadcast settings cleared");
                Ok(())
            }
            Command::Reload { config } => {
                if self.stop_mode.is_some() {
                    return Err(
                        CommandFailedError::new("reload", "stop in progress, reload refused")
                            .into(),
                    );
                }
                info!("reload queued");
                self.pending_reload = Some(config);
                Ok(())
            }
            Command::SetVerbosity { level } => {
                let Some(handle) = &self.verbosity else {
                    return Err(CommandFailedError::new(
                        "set-verbosity",
                        "no reloadable logging filter installed",
                    )
                    .into());
                };
                let filter = crate::logging::parse_directive(&level)?;
                handle
                    .reload(filter)
                    .map_err(|e| CommandFailedError::new("set-verbosity", e))?;
                info!(level = %level, "verbosity changed");
                Ok(())
            }
        }
    }

    /// Swap in a reloaded configuration (within one tick)
    fn perform_reload(&mut self, new_config: WorkflowConfig, now: DateTime<Utc>) -> Result<()> {
        let graph = match GraphStore::compile(&new_config) {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                // Revert: the old graph store stays in force.
                error!(error = %e, "reload failed, keeping previous configuration");
                self.events.fire_workflow_event(
                    &self.config.events.handlers,
                    "reload-fail",
                    &e.to_string(),
                );
                return Ok(());
            }
        };
        let was_paused = self.is_paused;
        self.is_paused = true;
        let (added, deleted) =
            self.pool
                .swap_graph(Arc::clone(&graph), &new_config, &mut self.pending, now)?;
        self.xtriggers.reload(new_config.xtriggers.clone());
        self.config = new_config;
        self.pool.check_spawn_parentless(&mut self.pending, now)?;
        self.is_paused = was_paused;
        info!(added = ?added, deleted = ?deleted, "reload complete");
        self.events
            .fire_workflow_event(&self.config.events.handlers, "reload", "reload complete");
        Ok(())
    }

    /// Hand one released task to the job manager
    fn submit_released(&mut self, id: TaskId, now: DateTime<Utc>) {
        let next_submit = match self.pool.get(&id) {
            Some(proxy) => self.jobs.next_submit_num(&id, proxy.submit_num),
            None => return,
        };
        let Some(proxy) = self.pool.get_mut(&id) else {
            return;
        };
        proxy.submit_num = next_submit;
        proxy.is_manual_trigger = false;
        let effective = self.broadcasts.apply(
            &proxy.taskdef.runtime,
            &id.name,
            &proxy.taskdef.families,
            &id.point,
        );
        proxy.platform = Some(effective.platform.clone());
        let request = JobRequest {
            id: id.clone(),
            submit_num: proxy.submit_num,
            runtime: effective,
            flow_nums: proxy.flow_nums.clone(),
        };
        let taskdef = Arc::clone(&proxy.taskdef);
        let try_num = proxy.try_num;
        self.pending.push(DbOp::UpsertPool(proxy.pool_row()));
        self.pending.push(DbOp::UpsertState(proxy.state_row(now)));
        self.jobs
            .submit(request, &taskdef, try_num, &mut self.pending, now);
    }

    /// Convert a worker-side job event into a task message
    fn job_event_to_message(&mut self, event: JobEvent, now: DateTime<Utc>) -> Option<TaskMessage> {
        match event {
            JobEvent::Submitted {
                id,
                submit_num,
                handle,
            } => {
                self.jobs.note_submitted(&id, submit_num, handle);
                let mut message = TaskMessage::new(id, "submitted", now);
                message.submit_num = Some(submit_num);
                Some(message)
            }
            JobEvent::SubmitFailed {
                id,
                submit_num,
                error,
            } => {
                warn!(task = %id, error = %error, "submission failed");
                self.push_job_update(&id, submit_num, "submit-failed", now);
                let mut message = TaskMessage::new(id, "submit-failed", now);
                message.submit_num = Some(submit_num);
                Some(message)
            }
            JobEvent::PollStatus {
                id,
                submit_num,
                status,
                payload: _,
            } => {
                let text = match status {
                    JobPollStatus::Submitted => "submitted",
                    JobPollStatus::Running => "started",
                    JobPollStatus::Succeeded => "succeeded",
                    JobPollStatus::Failed => "failed",
                    JobPollStatus::SubmitFailed => "submit-failed",
                };
                if matches!(
                    status,
                    JobPollStatus::Succeeded | JobPollStatus::Failed | JobPollStatus::SubmitFailed
                ) {
                    self.jobs.note_finished(&id, submit_num);
                    self.push_job_update(&id, submit_num, text, now);
                }
                let mut message = TaskMessage::new(id, text, now);
                message.submit_num = Some(submit_num);
                Some(message)
            }
            JobEvent::KillDone {
                id,
                submit_num,
                outcome,
            } => match outcome {
                KillOutcome::Killed => {
                    self.jobs.note_finished(&id, submit_num);
                    self.push_job_update(&id, submit_num, "failed", now);
                    let mut message = TaskMessage::new(id, "failed", now);
                    message.submit_num = Some(submit_num);
                    Some(message)
                }
                KillOutcome::Error(e) => {
                    warn!(task = %id, error = %e, "kill failed");
                    None
                }
            },
        }
    }

    fn push_job_update(&mut self, id: &TaskId, submit_num: u32, status: &str, now: DateTime<Utc>) {
        let platform = self
            .pool
            .get(id)
            .and_then(|p| p.platform.clone())
            .unwrap_or_else(|| "localhost".to_string());
        let (start_time, end_time) = match status {
            "started" => (Some(now), None),
            "succeeded" | "failed" => (None, Some(now)),
            _ => (None, None),
        };
        self.pending.push(DbOp::UpsertJob(TaskJobRow {
            cycle: id.point.to_string(),
            name: id.name.clone(),
            submit_num: submit_num as i64,
            platform,
            submit_time: None,
            start_time: start_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            end_time: end_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            status: status.to_string(),
        }));
    }

    /// Evaluate the stop conditions
    fn evaluate_shutdown(&mut self, now: DateTime<Utc>) -> Option<TickOutcome> {
        // Scoped stops arm the plain stop mode when their condition hits.
        if let Some(clock) = self.stop_clock {
            if now >= clock {
                info!("stop clock reached");
                self.stop_mode = Some(StopMode::RequestClean);
                self.stop_clock = None;
            }
        }
        if let Some(task) = self.stop_task.clone() {
            if self.pool.get(&task).is_none()
                && self.pool.has_remembered_output(&task, OUTPUT_SUCCEEDED)
            {
                info!(task = %task, "stop task succeeded");
                self.stop_mode = Some(StopMode::RequestClean);
                self.stop_task = None;
            }
        }
        if let Some(flow) = self.stop_flow {
            if !self.pool.active_flow_nums().contains(&flow) {
                info!(flow = flow, "stop flow drained");
                self.stop_mode = Some(StopMode::RequestClean);
                self.stop_flow = None;
            }
        }

        match self.stop_mode {
            Some(StopMode::RequestNow) | Some(StopMode::RequestNowNow) => {
                return Some(TickOutcome::Stop(SchedulerStop(format!(
                    "{}",
                    self.stop_mode.unwrap_or(StopMode::RequestNow)
                ))));
            }
            Some(mode) => {
                // Clean modes wait for active work to finish.
                let active = self.pool.iter().filter(|p| p.is_active()).count();
                if active == 0 && self.jobs.live_count() == 0 {
                    return Some(TickOutcome::Stop(SchedulerStop(mode.to_string())));
                }
            }
            None => {}
        }

        // Workflow complete: nothing live, nothing left to spawn.
        if self.pool.is_exhausted() {
            return Some(TickOutcome::Stop(SchedulerStop(
                "workflow complete".to_string(),
            )));
        }

        // Stall handling.
        if self.pool.is_stalled(now) {
            let since = *self.stall_since.get_or_insert(now);
            if !self.stall_handled {
                let due = match self.config.events.stall_timeout {
                    Some(timeout) => {
                        now >= since
                            + chrono::Duration::from_std(timeout)
                                .unwrap_or_else(|_| chrono::Duration::zero())
                    }
                    None => true,
                };
                if due {
                    warn!("workflow stalled");
                    self.events.fire_workflow_event(
                        &self.config.events.handlers,
                        "stall",
                        "no task is active or releasable",
                    );
                    self.stall_handled = true;
                    if self.config.events.abort_on_stall {
                        return Some(TickOutcome::Stop(SchedulerStop("stalled".to_string())));
                    }
                }
            }
        } else {
            self.stall_since = None;
            self.stall_handled = false;
        }

        // Inactivity timeout.
        if let Some(timeout) = self.config.events.inactivity_timeout {
            let deadline = self.last_activity
                + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
            if now >= deadline && !self.inactivity_fired {
                warn!("inactivity timeout");
                self.events.fire_workflow_event(
                    &self.config.events.handlers,
                    "inactivity-timeout",
                    "no workflow activity",
                );
                self.inactivity_fired = true;
                return Some(TickOutcome::Stop(SchedulerStop(
                    "inactivity timeout".to_string(),
                )));
            }
        }

        // A condemned host arms a delayed auto stop.
        if let Some(at) = self.auto_restart_at {
            if now >= at {
                return Some(TickOutcome::Stop(SchedulerStop(
                    "auto restart".to_string(),
                )));
            }
        }

        None
    }

    /// Run-environment health checks
    async fn health_check(&mut self, _now: DateTime<Utc>) -> Result<()> {
        self.db.health_check().await.map_err(SchedulerError::from)?;
        if let Some(run_dir) = &self.options.run_dir {
            if !run_dir.is_dir() {
                return Err(SchedulerError::RunDirectoryLost(
                    run_dir.display().to_string(),
                )
                .into());
            }
        }
        if let Some(contact) = &self.contact {
            contact.check(&self.uuid).map_err(CoreError::from)?;
        }
        Ok(())
    }

    /// Mark this host condemned: stop (for restart elsewhere) after a
    /// jittered delay
    pub fn condemn_host(&mut self, now: DateTime<Utc>) {
        use rand::Rng;
        let jitter = rand::thread_rng().gen_range(0..30);
        let at = now + chrono::Duration::seconds(jitter);
        warn!(restart_at = %at, "host condemned, arming auto restart");
        self.auto_restart_at = Some(at);
        self.events.fire_workflow_event(
            &self.config.events.handlers,
            "host-condemned",
            "auto restart armed",
        );
    }

    /// Final flush and teardown
    async fn shutdown(&mut self, reason: &str) -> Result<()> {
        let skip_flush = matches!(self.stop_mode, Some(StopMode::RequestNowNow));
        if !skip_flush {
            self.pending.flush(self.db.pool()).await?;
            let _ = self.db.checkpoint_public();
        }
        self.events
            .fire_workflow_event(&self.config.events.handlers, "shutdown", reason);
        if let Some(contact) = &self.contact {
            contact.remove();
        }
        self.db.close().await;
        info!(reason = %reason, "shutdown complete");
        Ok(())
    }

    /// First-start initialisation: flow 1, parentless spawning, params
    async fn load_cold_start(&mut self, now: DateTime<Utc>) -> Result<()> {
        info!(workflow = %self.config.name, "cold start");
        let flow = self.flows.allocate("original flow", now, &mut self.pending);
        let default_flows: FlowNums = [flow].into_iter().collect();
        self.pool.initialise(default_flows)?;
        self.pool.set_stop_point(self.config.stop_point);

        self.pending.push(DbOp::SetParam {
            key: params::UUID.into(),
            value: self.uuid.clone(),
        });
        self.pending.push(DbOp::SetParam {
            key: params::INITIAL_POINT.into(),
            value: self.config.initial_point.to_string(),
        });
        if let Some(final_point) = &self.config.final_point {
            self.pending.push(DbOp::SetParam {
                key: params::FINAL_POINT.into(),
                value: final_point.to_string(),
            });
        }
        if let Some(stop_point) = &self.config.stop_point {
            self.pending.push(DbOp::SetParam {
                key: params::STOP_POINT.into(),
                value: stop_point.to_string(),
            });
        }
        self.pending.push(DbOp::SetParam {
            key: params::PAUSED.into(),
            value: if self.is_paused { "1" } else { "0" }.into(),
        });

        self.pool.check_spawn_parentless(&mut self.pending, now)?;
        self.events
            .fire_workflow_event(&self.config.events.handlers, "startup", "cold start");
        Ok(())
    }

    /// Restart: reconstruct pool, flows, outputs and live jobs
    async fn load_restart(&mut self, now: DateTime<Utc>) -> Result<()> {
        info!(workflow = %self.config.name, "restart");
        let pool_db = self.db.pool().clone();

        // Parameters.
        if let Some(paused) = ParamsRepository::get(&pool_db, params::PAUSED).await? {
            self.is_paused = paused == "1";
        }
        let mode = self.config.cycling_mode;
        if let Some(stop) = ParamsRepository::get(&pool_db, params::STOP_POINT).await? {
            if let Ok(point) = CyclePoint::parse(&stop, mode) {
                self.pool.set_stop_point(Some(point));
            }
        }

        // Flows resume from the recorded counter.
        let flow_rows = FlowsRepository::load_all(&pool_db).await?;
        self.flows = FlowManager::load(&flow_rows);
        let default_flows: FlowNums = if self.flows.counter() == 0 {
            let flow = self.flows.allocate("original flow", now, &mut self.pending);
            [flow].into_iter().collect()
        } else {
            FlowNums::new()
        };
        self.pool.initialise(default_flows)?;

        // Completed outputs, then the live pool over them.
        let output_rows = TaskOutputsRepository::load_all(&pool_db).await?;
        self.pool.load_remembered_outputs(&output_rows);
        let prereq_rows = TaskPrereqsRepository::load_all(&pool_db).await?;
        let pool_rows = TaskPoolRepository::load_all(&pool_db).await?;
        let mut restored_flows = FlowNums::new();
        for row in &pool_rows {
            let submit_num =
                TaskStatesRepository::max_submit_num(&pool_db, &row.cycle, &row.name).await? as u32;
            if let Some(id) = self
                .pool
                .restore_proxy(row, &prereq_rows, submit_num, now)?
            {
                if let Some(proxy) = self.pool.get(&id) {
                    restored_flows.extend(proxy.flow_nums.iter().copied());
                }
            }
        }
        if !restored_flows.is_empty() {
            // Parentless spawning continues in the flows of the restored
            // pool.
            let graph = Arc::clone(self.pool.graph());
            let mut pointers = Vec::new();
            for def in graph.taskdefs() {
                let latest = self
                    .pool
                    .iter()
                    .filter(|p| p.id.name == def.name)
                    .map(|p| p.id.point)
                    .chain(self.pool.remembered_points(&def.name))
                    .max();
                if let Some(latest) = latest {
                    pointers.push((def.name.clone(), def.next_point(&latest)?));
                }
            }
            for (name, pointer) in pointers {
                self.pool.set_spawn_pointer(&name, pointer);
            }
            self.pool.set_default_flows(restored_flows);
        }

        // Broadcasts and xtriggers.
        let broadcast_rows = BroadcastsRepository::load_all(&pool_db).await?;
        self.broadcasts = BroadcastManager::load(&broadcast_rows, mode);
        let xtrigger_rows = XtriggersRepository::load_all(&pool_db).await?;
        self.xtriggers.load_results(&xtrigger_rows);

        // Live jobs: re-associate and poll once to reconcile. Rows for
        // tasks no longer in the configuration are orphans: their
        // unresolvable platforms downgrade to a warning.
        let mut job_rows = TaskJobsRepository::load_live(&pool_db).await?;
        job_rows.retain(|row| {
            let known = self.config.taskdefs.contains_key(&row.name);
            if !known {
                warn!(task = %row.name, platform = %row.platform, "dropping job row for orphaned task");
            }
            known
        });
        let mut known_platforms: HashSet<String> = self
            .config
            .taskdefs
            .values()
            .map(|d| d.runtime.platform.clone())
            .collect();
        known_platforms.insert("localhost".to_string());
        let restored = self
            .jobs
            .restore(&job_rows, &known_platforms, mode)
            .map_err(CoreError::from)?;
        if !restored.is_empty() {
            self.jobs.poll_tasks(&restored);
        }

        // This run's identity supersedes the old one.
        self.pending.push(DbOp::SetParam {
            key: params::UUID.into(),
            value: self.uuid.clone(),
        });
        self.events
            .fire_workflow_event(&self.config.events.handlers, "restart", "restart");
        Ok(())
    }
}
