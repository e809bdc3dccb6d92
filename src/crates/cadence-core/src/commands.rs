//! Validated user commands
//!
//! Commands run in two phases: argument validation happens in
//! [`SchedulerClient`] before anything is queued (an [`InputError`] goes
//! straight back to the caller, CLI exit code 2), and execution happens
//! inside the main loop, where an expected failure surfaces as a logged
//! `CommandFailedError` (exit code 1) without crashing the scheduler.

use crate::error::InputError;
use crate::flow::{FlowManager, FlowSelection};
use crate::config::WorkflowConfig;
use crate::graph::taskdef::OUTPUT_SUCCEEDED;
use crate::id::{TaskId, TaskSelector};
use crate::prereq::PrereqKey;
use cadence_cycling::{CyclePoint, CyclingMode};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// How the scheduler should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// No new submissions; wait for active jobs to finish
    RequestClean,
    /// Shut down now; leave active jobs running
    RequestNow,
    /// Like `RequestNow` but skip flushing preparing tasks
    RequestNowNow,
    /// Raised by the auto-shutdown predicate
    Auto,
    /// Raised by the abort-on-task-failure setting
    AutoOnTaskFailure,
}

impl std::fmt::Display for StopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopMode::RequestClean => "request-clean",
            StopMode::RequestNow => "request-now",
            StopMode::RequestNowNow => "request-now-now",
            StopMode::Auto => "auto",
            StopMode::AutoOnTaskFailure => "auto-on-task-failure",
        };
        write!(f, "{}", s)
    }
}

/// A validated command awaiting execution in the main loop
#[derive(Debug)]
pub enum Command {
    /// Stop the scheduler, optionally scoped
    Stop {
        /// Stop mode
        mode: StopMode,
        /// Stop after this cycle point completes
        after_point: Option<CyclePoint>,
        /// Stop after this wall-clock time
        after_clock: Option<DateTime<Utc>>,
        /// Stop after this task succeeds
        after_task: Option<TaskId>,
        /// Stop by draining this flow
        flow_num: Option<i64>,
    },
    /// Pause the workflow: nothing releases
    Pause,
    /// Resume a paused workflow
    Resume,
    /// Hold matched tasks
    Hold {
        /// Target selectors
        tasks: Vec<TaskSelector>,
    },
    /// Release matched held tasks
    Release {
        /// Target selectors
        tasks: Vec<TaskSelector>,
    },
    /// Hold every task beyond a point
    SetHoldPoint {
        /// The hold point
        point: CyclePoint,
    },
    /// Clear the hold point
    ReleaseHoldPoint,
    /// Group-trigger matched tasks
    Trigger {
        /// Target selectors
        tasks: Vec<TaskSelector>,
        /// Flow selection
        flow: FlowSelection,
        /// Defer release until the workflow resumes
        on_resume: bool,
    },
    /// Force-satisfy prerequisites and/or complete outputs
    Set {
        /// Target selectors
        tasks: Vec<TaskSelector>,
        /// Output labels to complete; empty defaults to required outputs
        outputs: Vec<String>,
        /// Prerequisite triples to force-satisfy
        prereqs: Vec<PrereqKey>,
        /// Flow selection
        flow: FlowSelection,
    },
    /// Remove matched tasks from flows
    Remove {
        /// Target selectors
        tasks: Vec<TaskSelector>,
        /// Flow selection
        flow: FlowSelection,
    },
    /// Kill the jobs of matched tasks
    Kill {
        /// Target selectors
        tasks: Vec<TaskSelector>,
    },
    /// Poll the jobs of matched tasks
    Poll {
        /// Target selectors
        tasks: Vec<TaskSelector>,
    },
    /// Install runtime overrides for (cycle, namespace) scopes
    Broadcast {
        /// Cycle scopes; `None` applies to every cycle
        points: Vec<Option<CyclePoint>>,
        /// Target task or family names
        namespaces: Vec<String>,
        /// Overrides keyed by dotted setting path
        settings: std::collections::BTreeMap<String, serde_json::Value>,
    },
    /// Remove runtime overrides
    ClearBroadcast {
        /// Cycle scopes; `None` applies to every cycle
        points: Vec<Option<CyclePoint>>,
        /// Target task or family names
        namespaces: Vec<String>,
    },
    /// Swap in a newly resolved configuration
    Reload {
        /// The re-resolved workflow configuration
        config: Box<WorkflowConfig>,
    },
    /// Change the logging verbosity
    SetVerbosity {
        /// A `tracing` filter directive, e.g. `debug`
        level: String,
    },
}

impl Command {
    /// The command's user-facing name
    pub fn name(&self) -> &'static str {
        match self {
            Command::Stop { .. } => "stop",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Hold { .. } => "hold",
            Command::Release { .. } => "release",
            Command::SetHoldPoint { .. } => "set-hold-point",
            Command::ReleaseHoldPoint => "release-hold-point",
            Command::Trigger { .. } => "trigger",
            Command::Set { .. } => "set",
            Command::Remove { .. } => "remove",
            Command::Kill { .. } => "kill",
            Command::Poll { .. } => "poll",
            Command::Broadcast { .. } => "broadcast",
            Command::ClearBroadcast { .. } => "clear-broadcast",
            Command::Reload { .. } => "reload",
            Command::SetVerbosity { .. } => "set-verbosity",
        }
    }
}

/// Programmatic command entry points (phase 1: validation)
///
/// Each method maps 1:1 to a user command, validates its arguments and
/// queues the command for the main loop. Validation failures return
/// [`InputError`] without queueing anything.
#[derive(Clone)]
pub struct SchedulerClient {
    tx: mpsc::UnboundedSender<Command>,
    mode: CyclingMode,
}

impl SchedulerClient {
    /// Build a client over the command channel
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>, mode: CyclingMode) -> Self {
        Self { tx, mode }
    }

    /// Request a stop, optionally scoped
    pub fn stop(
        &self,
        mode: StopMode,
        after_point: Option<&str>,
        after_clock: Option<DateTime<Utc>>,
        after_task: Option<&str>,
        flow_num: Option<i64>,
    ) -> Result<(), InputError> {
        let after_point = after_point
            .map(|s| {
                CyclePoint::parse(s, self.mode)
                    .map_err(|e| InputError::new(format!("invalid stop point: {}", e)))
            })
            .transpose()?;
        let after_task = after_task
            .map(|s| TaskId::parse(s, self.mode))
            .transpose()?;
        if let Some(n) = flow_num {
            if n < 1 {
                return Err(InputError::new("stop flow number must be positive"));
            }
        }
        self.send(Command::Stop {
            mode,
            after_point,
            after_clock,
            after_task,
            flow_num,
        })
    }

    /// Pause the workflow
    pub fn pause(&self) -> Result<(), InputError> {
        self.send(Command::Pause)
    }

    /// Resume a paused workflow
    pub fn resume(&self) -> Result<(), InputError> {
        self.send(Command::Resume)
    }

    /// Hold matched tasks
    pub fn hold(&self, selectors: &[&str]) -> Result<(), InputError> {
        self.send(Command::Hold {
            tasks: parse_selectors(selectors)?,
        })
    }

    /// Release matched held tasks
    pub fn release(&self, selectors: &[&str]) -> Result<(), InputError> {
        self.send(Command::Release {
            tasks: parse_selectors(selectors)?,
        })
    }

    /// Hold everything beyond a point
    pub fn set_hold_point(&self, point: &str) -> Result<(), InputError> {
        let point = CyclePoint::parse(point, self.mode)
            .map_err(|e| InputError::new(format!("invalid hold point: {}", e)))?;
        self.send(Command::SetHoldPoint { point })
    }

    /// Clear the hold point
    pub fn release_hold_point(&self) -> Result<(), InputError> {
        self.send(Command::ReleaseHoldPoint)
    }

    /// Group-trigger matched tasks
    pub fn trigger(
        &self,
        selectors: &[&str],
        flow_tokens: &[&str],
        on_resume: bool,
    ) -> Result<(), InputError> {
        self.send(Command::Trigger {
            tasks: parse_selectors(selectors)?,
            flow: parse_flow(flow_tokens)?,
            on_resume,
        })
    }

    /// Force-satisfy prerequisites and/or complete outputs
    pub fn set(
        &self,
        selectors: &[&str],
        outputs: &[&str],
        prereqs: &[&str],
        flow_tokens: &[&str],
    ) -> Result<(), InputError> {
        let prereqs = prereqs
            .iter()
            .map(|s| parse_prereq(s, self.mode))
            .collect::<Result<Vec<_>, _>>()?;
        self.send(Command::Set {
            tasks: parse_selectors(selectors)?,
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            prereqs,
            flow: parse_flow(flow_tokens)?,
        })
    }

    /// Remove matched tasks from flows
    pub fn remove(&self, selectors: &[&str], flow_tokens: &[&str]) -> Result<(), InputError> {
        self.send(Command::Remove {
            tasks: parse_selectors(selectors)?,
            flow: parse_flow(flow_tokens)?,
        })
    }

    /// Kill the jobs of matched tasks
    pub fn kill(&self, selectors: &[&str]) -> Result<(), InputError> {
        self.send(Command::Kill {
            tasks: parse_selectors(selectors)?,
        })
    }

    /// Poll the jobs of matched tasks
    pub fn poll(&self, selectors: &[&str]) -> Result<(), InputError> {
        self.send(Command::Poll {
            tasks: parse_selectors(selectors)?,
        })
    }

    /// Install runtime overrides; a point of `*` means every cycle
    pub fn broadcast(
        &self,
        points: &[&str],
        namespaces: &[&str],
        settings: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<(), InputError> {
        if settings.is_empty() {
            return Err(InputError::new("broadcast requires at least one setting"));
        }
        self.send(Command::Broadcast {
            points: self.parse_broadcast_points(points)?,
            namespaces: parse_namespaces(namespaces)?,
            settings,
        })
    }

    /// Remove runtime overrides matching the given scopes
    pub fn clear_broadcast(
        &self,
        points: &[&str],
        namespaces: &[&str],
    ) -> Result<(), InputError> {
        self.send(Command::ClearBroadcast {
            points: self.parse_broadcast_points(points)?,
            namespaces: parse_namespaces(namespaces)?,
        })
    }

    /// Reload with a newly resolved configuration
    pub fn reload(&self, config: WorkflowConfig) -> Result<(), InputError> {
        self.send(Command::Reload {
            config: Box::new(config),
        })
    }

    /// Change the logging verbosity
    pub fn set_verbosity(&self, level: &str) -> Result<(), InputError> {
        if level.is_empty() {
            return Err(InputError::new("verbosity level cannot be empty"));
        }
        self.send(Command::SetVerbosity {
            level: level.to_string(),
        })
    }

    fn parse_broadcast_points(
        &self,
        points: &[&str],
    ) -> Result<Vec<Option<CyclePoint>>, InputError> {
        if points.is_empty() {
            return Ok(vec![None]);
        }
        points
            .iter()
            .map(|s| {
                if *s == "*" {
                    Ok(None)
                } else {
                    CyclePoint::parse(s, self.mode)
                        .map(Some)
                        .map_err(|e| InputError::new(format!("invalid broadcast point: {}", e)))
                }
            })
            .collect()
    }

    fn send(&self, command: Command) -> Result<(), InputError> {
        self.tx
            .send(command)
            .map_err(|_| InputError::new("scheduler is no longer accepting commands"))
    }
}

fn parse_namespaces(namespaces: &[&str]) -> Result<Vec<String>, InputError> {
    if namespaces.is_empty() {
        return Err(InputError::new("at least one namespace is required"));
    }
    Ok(namespaces.iter().map(|s| s.to_string()).collect())
}

fn parse_selectors(selectors: &[&str]) -> Result<Vec<TaskSelector>, InputError> {
    if selectors.is_empty() {
        return Err(InputError::new("at least one task selector is required"));
    }
    selectors.iter().map(|s| TaskSelector::parse(s)).collect()
}

fn parse_flow(tokens: &[&str]) -> Result<FlowSelection, InputError> {
    let tokens: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
    FlowManager::parse_selection(&tokens)
}

/// Parse a prerequisite triple `cycle/task[:output]`
fn parse_prereq(s: &str, mode: CyclingMode) -> Result<PrereqKey, InputError> {
    let (body, output) = match s.rsplit_once(':') {
        Some((body, output)) if !output.is_empty() => (body, output.to_string()),
        Some(_) => return Err(InputError::new(format!("empty output in prerequisite: {}", s))),
        None => (s, OUTPUT_SUCCEEDED.to_string()),
    };
    let id = TaskId::parse(body, mode)?;
    Ok(PrereqKey::new(id.point, id.name, output))
}

/// Build a command channel pair
pub(crate) fn command_channel(
    mode: CyclingMode,
) -> (SchedulerClient, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SchedulerClient::new(tx, mode), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (SchedulerClient, mpsc::UnboundedReceiver<Command>) {
        command_channel(CyclingMode::Integer)
    }

    #[test]
    fn test_trigger_validates_before_queueing() {
        let (client, mut rx) = client();
        assert!(client.trigger(&["1/a", "b"], &["new"], false).is_ok());
        assert!(matches!(rx.try_recv().unwrap(), Command::Trigger { .. }));

        // Bad flow token: nothing queued.
        assert!(client.trigger(&["1/a"], &["sideways"], false).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_selectors_rejected() {
        let (client, mut rx) = client();
        assert!(client.hold(&[]).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_point_parsed_in_cycling_mode() {
        let (client, mut rx) = client();
        assert!(client
            .stop(StopMode::RequestClean, Some("5"), None, None, None)
            .is_ok());
        match rx.try_recv().unwrap() {
            Command::Stop { after_point, .. } => {
                assert_eq!(after_point, Some(CyclePoint::Integer(5)));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(client
            .stop(StopMode::RequestClean, Some("not-a-point"), None, None, None)
            .is_err());
    }

    #[test]
    fn test_parse_prereq_default_output() {
        let key = parse_prereq("2/model", CyclingMode::Integer).unwrap();
        assert_eq!(key.to_string(), "2/model:succeeded");
        let key = parse_prereq("2/model:failed", CyclingMode::Integer).unwrap();
        assert_eq!(key.output, "failed");
        assert!(parse_prereq("model", CyclingMode::Integer).is_err());
        assert!(parse_prereq("2/model:", CyclingMode::Integer).is_err());
    }

    #[test]
    fn test_broadcast_validation() {
        let (client, mut rx) = client();
        let settings: std::collections::BTreeMap<String, serde_json::Value> =
            [("environment.MODE".to_string(), serde_json::json!("fast"))]
                .into_iter()
                .collect();

        client.broadcast(&["*", "2"], &["model"], settings.clone()).unwrap();
        match rx.try_recv().unwrap() {
            Command::Broadcast { points, .. } => {
                assert_eq!(points, vec![None, Some(CyclePoint::Integer(2))]);
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(client.broadcast(&["x"], &["model"], settings.clone()).is_err());
        assert!(client.broadcast(&["*"], &[], settings).is_err());
        assert!(client
            .broadcast(&["*"], &["model"], Default::default())
            .is_err());
    }

    #[test]
    fn test_set_command_round_trip() {
        let (client, mut rx) = client();
        client
            .set(&["1/a"], &["succeeded"], &["1/up:started"], &[])
            .unwrap();
        match rx.try_recv().unwrap() {
            Command::Set {
                tasks,
                outputs,
                prereqs,
                flow,
            } => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(outputs, vec!["succeeded"]);
                assert_eq!(prereqs[0].to_string(), "1/up:started");
                assert_eq!(flow, FlowSelection::Default);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
