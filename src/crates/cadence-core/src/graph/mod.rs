//! Compiled graph: task definitions and the immutable store

pub mod store;
pub mod taskdef;

pub use store::{ChildEdge, GraphStore};
pub use taskdef::{
    Dependency, RuntimeConfig, SimulationConfig, TaskDef, TaskOutput, TaskTrigger,
};
