//! Scheduler runtime for the cadence cycling workflow scheduler
//!
//! This crate is the core: the dependency-driven task pool, the
//! flow/cycle propagation engine, the command and event processing loop,
//! and the failure/retry model. The configuration front-end, job
//! executors and user interfaces are external collaborators behind the
//! [`config::WorkflowConfig`] input value, the [`jobs::JobRunner`] trait
//! and the [`commands::SchedulerClient`] command surface.

pub mod broadcast;
pub mod commands;
pub mod config;
pub mod contact;
pub mod error;
pub mod events;
pub mod flow;
pub mod graph;
pub mod id;
pub mod jobs;
pub mod logging;
pub mod pool;
pub mod prereq;
pub mod scheduler;
pub mod task_state;
pub mod xtrigger;

pub use commands::{SchedulerClient, StopMode};
pub use config::{RunMode, RunaheadLimit, WorkflowConfig};
pub use error::{
    CommandFailedError, ConfigError, CoreError, InputError, PlatformLookupError, Result,
    SchedulerError, SchedulerStop,
};
pub use events::{EventSink, MessageSeverity, TaskMessage};
pub use flow::{FlowManager, FlowNums, FlowSelection};
pub use graph::{GraphStore, TaskDef};
pub use id::{TaskId, TaskSelector};
pub use jobs::{JobDescriptor, JobRunner, JobPollStatus, KillOutcome, PreparedJob, SubmitHandle};
pub use logging::{init_verbosity, VerbosityHandle};
pub use pool::{TaskPool, TaskProxy};
pub use scheduler::{Scheduler, SchedulerOptions, TickOutcome};
pub use task_state::TaskStatus;
