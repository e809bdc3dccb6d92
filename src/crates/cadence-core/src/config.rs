//! Resolved workflow configuration
//!
//! The configuration front-end (workflow file parser) is an external
//! collaborator: the core consumes an already-resolved [`WorkflowConfig`]
//! value. Reload swaps in a whole new value.

use crate::graph::taskdef::TaskDef;
use cadence_cycling::{CycleInterval, CyclePoint, CyclingMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// How far ahead of the earliest unfinished point the pool may extend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunaheadLimit {
    /// A cycle-distance bound: `earliest_unfinished + interval`
    Interval(CycleInterval),
    /// A bound on the number of distinct active cycle points
    Count(u64),
}

/// One execution queue: a name, a concurrency limit and its member tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum members active at once
    pub limit: usize,
    /// Names of member tasks
    pub members: BTreeSet<String>,
}

/// Declaration of an external trigger function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XtriggerConfig {
    /// Registered function name
    pub function: String,
    /// Call arguments
    pub args: Vec<serde_json::Value>,
    /// Re-evaluation interval
    pub interval: Duration,
}

/// Special task class declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTasks {
    /// Tasks gated on the wall clock, with their offsets
    pub clock_trigger: BTreeMap<String, CycleInterval>,
    /// Tasks that expire when the wall clock passes point + offset
    pub clock_expire: BTreeMap<String, CycleInterval>,
    /// Tasks gated on an external trigger message
    pub external_trigger: BTreeMap<String, String>,
    /// Tasks whose next instance waits for the current one to finish
    pub sequential: BTreeSet<String>,
}

/// Workflow-level event settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Abort if no task activity for this long
    pub inactivity_timeout: Option<Duration>,
    /// Fire the stall handler this long after a stall is detected
    pub stall_timeout: Option<Duration>,
    /// Abort the scheduler when the stall timer fires
    pub abort_on_stall: bool,
    /// Workflow event handler commands keyed by event name
    pub handlers: BTreeMap<String, Vec<String>>,
}

/// Whether jobs really run or are simulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Jobs are dispatched through the job runner
    Live,
    /// Jobs succeed (or fail, per task simulation config) after a
    /// simulated run length without touching the job runner
    Simulation,
}

/// The fully resolved input to the scheduler core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name
    pub name: String,
    /// The single cycling domain of this workflow
    pub cycling_mode: CyclingMode,
    /// First cycle point of the graph
    pub initial_point: CyclePoint,
    /// Last cycle point of the graph, if bounded
    pub final_point: Option<CyclePoint>,
    /// Point to stop after, if requested at start-up
    pub stop_point: Option<CyclePoint>,
    /// Runahead window
    pub runahead_limit: RunaheadLimit,
    /// Task definitions by name
    pub taskdefs: BTreeMap<String, TaskDef>,
    /// Family memberships: family name to member task names
    pub families: BTreeMap<String, Vec<String>>,
    /// Execution queues; tasks not named anywhere land in the default
    /// queue
    pub queues: BTreeMap<String, QueueConfig>,
    /// External trigger declarations by label
    pub xtriggers: BTreeMap<String, XtriggerConfig>,
    /// Special task classes
    pub special_tasks: SpecialTasks,
    /// Workflow event settings
    pub events: EventsConfig,
    /// Live or simulation execution
    pub run_mode: RunMode,
}

/// Name of the queue tasks fall into when not assigned elsewhere
pub const DEFAULT_QUEUE: &str = "default";

impl WorkflowConfig {
    /// A minimal configuration: one unbounded default queue, live mode
    pub fn new(name: impl Into<String>, cycling_mode: CyclingMode, initial_point: CyclePoint) -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(
            DEFAULT_QUEUE.to_string(),
            QueueConfig {
                limit: 0,
                members: BTreeSet::new(),
            },
        );
        Self {
            name: name.into(),
            cycling_mode,
            initial_point,
            final_point: None,
            stop_point: None,
            runahead_limit: RunaheadLimit::Count(5),
            taskdefs: BTreeMap::new(),
            families: BTreeMap::new(),
            queues,
            xtriggers: BTreeMap::new(),
            special_tasks: SpecialTasks::default(),
            events: EventsConfig::default(),
            run_mode: RunMode::Live,
        }
    }

    /// Add a task definition
    pub fn add_task(&mut self, def: TaskDef) -> &mut Self {
        self.taskdefs.insert(def.name.clone(), def);
        self
    }

    /// The queue a task belongs to
    pub fn queue_for(&self, task: &str) -> &str {
        for (name, queue) in &self.queues {
            if name != DEFAULT_QUEUE && queue.members.contains(task) {
                return name;
            }
        }
        DEFAULT_QUEUE
    }
}
