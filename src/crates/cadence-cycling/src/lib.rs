//! Cycling kernel for the cadence workflow scheduler
//!
//! Provides the point, interval and sequence arithmetic that the scheduler
//! uses to enumerate successive cycle instances of the task graph. Two
//! value domains are supported behind one interface: plain integers and
//! ISO-8601 date-times. Mixing domains is a programming error and fails
//! loudly.

pub mod error;
pub mod interval;
pub mod point;
pub mod sequence;

pub use error::{CyclingError, Result};
pub use interval::CycleInterval;
pub use point::{CyclePoint, CyclingMode};
pub use sequence::CycleSequence;
