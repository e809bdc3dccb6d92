//! Live task pool: proxies, queues and the pool itself

pub mod pool;
pub mod proxy;
pub mod queues;

pub use pool::{
    GroupTriggerOutcome, MatchResult, ReleaseOutcome, SatisfyOutcome, TaskPool,
};
pub use proxy::TaskProxy;
pub use queues::TaskQueues;
