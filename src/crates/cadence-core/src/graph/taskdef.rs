//! Immutable task definitions
//!
//! A [`TaskDef`] is the compiled description of one task: the sequences it
//! is valid at, its inbound triggers, declared outputs, and resolved
//! runtime settings. Definitions never change after compilation; a reload
//! swaps the whole store.

use cadence_cycling::{CycleInterval, CycleSequence};
use cadence_cycling::CyclePoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Output label completed when a job is accepted by its platform
pub const OUTPUT_SUBMITTED: &str = "submitted";
/// Output label completed when job submission fails terminally
pub const OUTPUT_SUBMIT_FAILED: &str = "submit-failed";
/// Output label completed when a job starts executing
pub const OUTPUT_STARTED: &str = "started";
/// Output label completed when a job finishes successfully
pub const OUTPUT_SUCCEEDED: &str = "succeeded";
/// Output label completed when a job fails terminally
pub const OUTPUT_FAILED: &str = "failed";
/// Output label completed when a task clock-expires
pub const OUTPUT_EXPIRED: &str = "expired";

/// A declared output of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Output label
    pub label: String,
    /// Whether the instance is incomplete until this output is produced
    pub required: bool,
}

/// One inbound trigger: an upstream `(task, point offset, output)` edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTrigger {
    /// Upstream task (or family, before expansion) name
    pub task: String,
    /// Upstream point offset relative to the downstream instance
    ///
    /// `None` means same-cycle; `a[-P1] => b` compiles to `Some(-P1)`.
    pub offset: Option<CycleInterval>,
    /// Upstream output label the trigger fires on
    pub output: String,
}

impl TaskTrigger {
    /// A same-cycle trigger on an upstream's `succeeded` output
    pub fn succeeded(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            offset: None,
            output: OUTPUT_SUCCEEDED.to_string(),
        }
    }

    /// A trigger on a prior-cycle instance of an upstream
    pub fn offset(task: impl Into<String>, offset: CycleInterval, output: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            offset: Some(offset),
            output: output.into(),
        }
    }
}

/// One prerequisite template: an OR of ANDed triggers
///
/// The outer vector is the disjunction; each inner vector is a
/// conjunction that satisfies the dependency on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Disjunctive clauses of conjoined triggers
    pub clauses: Vec<Vec<TaskTrigger>>,
    /// Whether satisfaction removes the holding instance instead of
    /// running it
    pub suicide: bool,
}

impl Dependency {
    /// A plain conjunction of triggers
    pub fn all(triggers: Vec<TaskTrigger>) -> Self {
        Self {
            clauses: vec![triggers],
            suicide: false,
        }
    }
}

/// Simulation-mode behaviour for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Simulated execution length
    pub run_length: Duration,
    /// Cycle points at which the simulated job fails (empty: never)
    pub fail_cycle_points: Vec<CyclePoint>,
    /// Only fail the first attempt, so retries succeed
    pub fail_try_1_only: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            run_length: Duration::from_secs(10),
            fail_cycle_points: Vec::new(),
            fail_try_1_only: true,
        }
    }
}

/// Resolved runtime settings for a task, post-inheritance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Job script
    pub command: String,
    /// Target platform name
    pub platform: String,
    /// Job environment variables
    pub environment: BTreeMap<String, String>,
    /// Batch system resource directives
    pub directives: BTreeMap<String, String>,
    /// Execution retry delays; length bounds the number of retries
    pub retry_delays: Vec<Duration>,
    /// Submission retry delays
    pub submission_retry_delays: Vec<Duration>,
    /// Wall-clock limit passed to the platform
    pub execution_time_limit: Option<Duration>,
    /// Task event handler commands keyed by event name
    pub handlers: BTreeMap<String, Vec<String>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            platform: "localhost".to_string(),
            environment: BTreeMap::new(),
            directives: BTreeMap::new(),
            retry_delays: Vec::new(),
            submission_retry_delays: Vec::new(),
            execution_time_limit: None,
            handlers: BTreeMap::new(),
        }
    }
}

/// The immutable compiled description of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    /// Task name, unique within the workflow
    pub name: String,
    /// Parent families, outermost first
    pub families: Vec<String>,
    /// Sequences this task is valid at
    pub sequences: Vec<CycleSequence>,
    /// Prerequisite templates (graph edges into this task)
    pub dependencies: Vec<Dependency>,
    /// Declared outputs; always includes the standard lifecycle outputs
    pub outputs: Vec<TaskOutput>,
    /// Labels of xtriggers gating this task
    pub xtrigger_labels: Vec<String>,
    /// External trigger messages gating this task
    pub external_triggers: Vec<String>,
    /// Wall-clock trigger offset (`special_tasks.clock_trigger`)
    pub clock_trigger_offset: Option<CycleInterval>,
    /// Clock-expire offset (`special_tasks.clock_expire`)
    pub clock_expire_offset: Option<CycleInterval>,
    /// Offset past the cycle point after which the task is late
    pub late_offset: Option<CycleInterval>,
    /// Next-cycle instance only spawns after this one finishes
    pub sequential: bool,
    /// Resolved runtime settings
    pub runtime: RuntimeConfig,
    /// Simulation-mode behaviour
    pub simulation: SimulationConfig,
}

impl TaskDef {
    /// Create a definition with the standard outputs and default runtime
    pub fn new(name: impl Into<String>, sequences: Vec<CycleSequence>) -> Self {
        Self {
            name: name.into(),
            families: Vec::new(),
            sequences,
            dependencies: Vec::new(),
            outputs: Self::standard_outputs(),
            xtrigger_labels: Vec::new(),
            external_triggers: Vec::new(),
            clock_trigger_offset: None,
            clock_expire_offset: None,
            late_offset: None,
            sequential: false,
            runtime: RuntimeConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }

    /// The standard lifecycle outputs; only `succeeded` is required
    pub fn standard_outputs() -> Vec<TaskOutput> {
        [
            (OUTPUT_SUBMITTED, false),
            (OUTPUT_SUBMIT_FAILED, false),
            (OUTPUT_STARTED, false),
            (OUTPUT_SUCCEEDED, true),
            (OUTPUT_FAILED, false),
            (OUTPUT_EXPIRED, false),
        ]
        .into_iter()
        .map(|(label, required)| TaskOutput {
            label: label.to_string(),
            required,
        })
        .collect()
    }

    /// Add a dependency template
    pub fn with_dependency(mut self, dep: Dependency) -> Self {
        self.dependencies.push(dep);
        self
    }

    /// Declare a custom output
    pub fn with_output(mut self, label: impl Into<String>, required: bool) -> Self {
        self.outputs.push(TaskOutput {
            label: label.into(),
            required,
        });
        self
    }

    /// Mark a standard output optional or required
    ///
    /// `succeeded` made optional declares a task allowed to fail.
    pub fn set_output_required(mut self, label: &str, required: bool) -> Self {
        for out in &mut self.outputs {
            if out.label == label {
                out.required = required;
            }
        }
        self
    }

    /// True if a declared output carries the given label
    pub fn has_output(&self, label: &str) -> bool {
        self.outputs.iter().any(|o| o.label == label)
    }

    /// Labels of the required outputs
    pub fn required_outputs(&self) -> Vec<String> {
        self.outputs
            .iter()
            .filter(|o| o.required)
            .map(|o| o.label.clone())
            .collect()
    }

    /// True if the task has no graph edges into it at any point
    pub fn is_parentless(&self) -> bool {
        self.dependencies.iter().all(|d| d.suicide)
    }

    /// True if `point` lies on any of the task's sequences
    pub fn is_valid_at(&self, point: &CyclePoint) -> cadence_cycling::Result<bool> {
        for seq in &self.sequences {
            if seq.is_on_sequence(point)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Smallest on-sequence point `>= p`, across all sequences
    pub fn first_point_after(&self, p: &CyclePoint) -> cadence_cycling::Result<Option<CyclePoint>> {
        let mut best: Option<CyclePoint> = None;
        for seq in &self.sequences {
            if let Some(q) = seq.first_point_after(p)? {
                best = match best {
                    Some(b) if b <= q => Some(b),
                    _ => Some(q),
                };
            }
        }
        Ok(best)
    }

    /// Smallest on-sequence point strictly after `p`, across all sequences
    pub fn next_point(&self, p: &CyclePoint) -> cadence_cycling::Result<Option<CyclePoint>> {
        let mut best: Option<CyclePoint> = None;
        for seq in &self.sequences {
            if let Some(q) = seq.next_point(p)? {
                best = match best {
                    Some(b) if b <= q => Some(b),
                    _ => Some(q),
                };
            }
        }
        Ok(best)
    }
}
