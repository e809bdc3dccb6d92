//! Table repositories
//!
//! One repository struct per table, with static methods generic over the
//! executor so the same SQL serves both direct pool access and the per-tick
//! write transaction.

pub mod broadcasts_repo;
pub mod flows_repo;
pub mod params_repo;
pub mod task_jobs_repo;
pub mod task_outputs_repo;
pub mod task_pool_repo;
pub mod task_prereqs_repo;
pub mod task_states_repo;
pub mod xtriggers_repo;

pub use broadcasts_repo::BroadcastsRepository;
pub use flows_repo::FlowsRepository;
pub use params_repo::ParamsRepository;
pub use task_jobs_repo::TaskJobsRepository;
pub use task_outputs_repo::TaskOutputsRepository;
pub use task_pool_repo::TaskPoolRepository;
pub use task_prereqs_repo::TaskPrereqsRepository;
pub use task_states_repo::TaskStatesRepository;
pub use xtriggers_repo::XtriggersRepository;

/// Executor bound shared by all repository methods
pub trait SqliteExec<'a>: sqlx::Executor<'a, Database = sqlx::Sqlite> {}
impl<'a, T> SqliteExec<'a> for T where T: sqlx::Executor<'a, Database = sqlx::Sqlite> {}
