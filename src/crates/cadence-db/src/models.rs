//! Row models for the scheduler database
//!
//! Cycle points and timestamps are stored as their canonical strings and
//! flow number sets as JSON arrays (e.g. `[1,2]`) due to SQLite type
//! limitations. Decoding back into scheduler types happens in the core
//! crate, which owns those types.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One key/value scheduler parameter
///
/// Holds initial/final/stop points, the run UUID, the paused flag and
/// similar restart-relevant scalars.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowParamRow {
    /// Parameter key
    pub key: String,
    /// Parameter value, canonical string form
    pub value: String,
}

/// One live task instance in the pool
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskPoolRow {
    /// Cycle point, canonical string form
    pub cycle: String,
    /// Task name
    pub name: String,
    /// Flow numbers as a JSON array, sorted ascending
    pub flow_nums: String,
    /// Task status name
    pub status: String,
    /// Held flag
    pub is_held: bool,
    /// Late flag (persisted so the late event never re-fires on restart)
    pub is_late: bool,
}

/// Historical state record for a task instance
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskStateRow {
    /// Cycle point, canonical string form
    pub cycle: String,
    /// Task name
    pub name: String,
    /// Flow numbers as a JSON array, sorted ascending
    pub flow_nums: String,
    /// Latest job submission number (0 before first submission)
    pub submit_num: i64,
    /// Task status name
    pub status: String,
    /// RFC 3339 creation timestamp
    pub time_created: String,
    /// RFC 3339 last-update timestamp
    pub time_updated: String,
}

/// One completed output of a task instance
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskOutputRow {
    /// Cycle point, canonical string form
    pub cycle: String,
    /// Task name
    pub name: String,
    /// Flow numbers as a JSON array, sorted ascending
    pub flow_nums: String,
    /// Output label
    pub output: String,
    /// How the output completed: "naturally" or "forced"
    pub reason: String,
}

/// A forced prerequisite satisfaction that must survive restart
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskPrereqRow {
    /// Downstream cycle point, canonical string form
    pub cycle: String,
    /// Downstream task name
    pub name: String,
    /// Upstream cycle point of the satisfied triple
    pub prereq_cycle: String,
    /// Upstream task name of the satisfied triple
    pub prereq_name: String,
    /// Upstream output label of the satisfied triple
    pub prereq_output: String,
    /// Satisfaction reason, "forced"
    pub reason: String,
}

/// One job submission record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskJobRow {
    /// Cycle point, canonical string form
    pub cycle: String,
    /// Task name
    pub name: String,
    /// Submission number, 1-based
    pub submit_num: i64,
    /// Platform the job was submitted to
    pub platform: String,
    /// RFC 3339 submit timestamp
    pub submit_time: Option<String>,
    /// RFC 3339 execution start timestamp
    pub start_time: Option<String>,
    /// RFC 3339 execution end timestamp
    pub end_time: Option<String>,
    /// Job status name
    pub status: String,
}

/// One broadcast setting override
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BroadcastRow {
    /// Cycle scope: a point string or "*" for all cycles
    pub point: String,
    /// Namespace scope: task or family name
    pub namespace: String,
    /// Dotted path of the overridden setting
    pub setting_path: String,
    /// JSON-encoded override value
    pub value: String,
}

/// Latest result of an xtrigger evaluation
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct XtriggerRow {
    /// Xtrigger label
    pub label: String,
    /// Hash of the concrete call arguments
    pub args_hash: String,
    /// JSON-encoded result payload
    pub result: String,
}

/// One allocated flow number
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FlowRow {
    /// The flow number
    pub flow_num: i64,
    /// User-facing description of the flow
    pub description: String,
    /// RFC 3339 allocation timestamp
    pub created_at: String,
}
