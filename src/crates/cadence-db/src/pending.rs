//! Per-tick batched write queue
//!
//! Scheduler components never write to the database directly: they queue
//! [`DbOp`] values here during a tick, and the main loop flushes the whole
//! batch inside one transaction at the end of the tick. This keeps the
//! on-disk pool in step with the in-memory pool after every commit.

use crate::connection::DatabasePool;
use crate::error::Result;
use crate::models::{
    BroadcastRow, FlowRow, TaskJobRow, TaskOutputRow, TaskPoolRow, TaskPrereqRow, TaskStateRow,
    XtriggerRow,
};
use crate::repositories::{
    BroadcastsRepository, FlowsRepository, ParamsRepository, TaskJobsRepository,
    TaskOutputsRepository, TaskPoolRepository, TaskPrereqsRepository, TaskStatesRepository,
    XtriggersRepository,
};
use tracing::debug;

/// One queued database mutation
#[derive(Debug, Clone)]
pub enum DbOp {
    /// Set a workflow parameter
    SetParam {
        /// Parameter key
        key: String,
        /// Parameter value
        value: String,
    },
    /// Delete a workflow parameter
    DeleteParam {
        /// Parameter key
        key: String,
    },
    /// Insert or replace a live pool row
    UpsertPool(TaskPoolRow),
    /// Remove a live pool row
    DeletePool {
        /// Cycle point string
        cycle: String,
        /// Task name
        name: String,
    },
    /// Insert or update a task state history row
    UpsertState(TaskStateRow),
    /// Record a completed output
    UpsertOutput(TaskOutputRow),
    /// Erase the outputs of a task instance in one flow set
    DeleteOutputsForFlows {
        /// Cycle point string
        cycle: String,
        /// Task name
        name: String,
        /// Flow set as stored (JSON array string)
        flow_nums: String,
    },
    /// Record a forced prerequisite satisfaction
    UpsertPrereq(TaskPrereqRow),
    /// Erase stored prerequisite satisfactions for a task instance
    DeletePrereqsForTask {
        /// Cycle point string
        cycle: String,
        /// Task name
        name: String,
    },
    /// Insert or update a job record
    UpsertJob(TaskJobRow),
    /// Record a broadcast setting
    UpsertBroadcast(BroadcastRow),
    /// Remove a broadcast setting
    DeleteBroadcast {
        /// Cycle scope
        point: String,
        /// Namespace scope
        namespace: String,
        /// Setting path
        setting_path: String,
    },
    /// Record an xtrigger result
    UpsertXtrigger(XtriggerRow),
    /// Record a newly allocated flow
    InsertFlow(FlowRow),
}

/// Queue of database mutations awaiting the end-of-tick commit
#[derive(Debug, Default)]
pub struct PendingOps {
    ops: Vec<DbOp>,
}

impl PendingOps {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one mutation
    pub fn push(&mut self, op: DbOp) {
        self.ops.push(op);
    }

    /// Number of queued mutations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop everything queued without writing
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Apply every queued mutation inside one transaction
    ///
    /// The queue is drained on success and preserved on failure so a
    /// transient commit error can be retried next tick.
    pub async fn flush(&mut self, pool: &DatabasePool) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let mut tx = pool.begin().await?;
        for op in &self.ops {
            match op {
                DbOp::SetParam { key, value } => {
                    ParamsRepository::set(&mut *tx, key, value).await?
                }
                DbOp::DeleteParam { key } => ParamsRepository::delete(&mut *tx, key).await?,
                DbOp::UpsertPool(row) => TaskPoolRepository::upsert(&mut *tx, row).await?,
                DbOp::DeletePool { cycle, name } => {
                    TaskPoolRepository::delete(&mut *tx, cycle, name).await?
                }
                DbOp::UpsertState(row) => TaskStatesRepository::upsert(&mut *tx, row).await?,
                DbOp::UpsertOutput(row) => TaskOutputsRepository::upsert(&mut *tx, row).await?,
                DbOp::DeleteOutputsForFlows {
                    cycle,
                    name,
                    flow_nums,
                } => {
                    TaskOutputsRepository::delete_for_flows(&mut *tx, cycle, name, flow_nums)
                        .await?
                }
                DbOp::UpsertPrereq(row) => TaskPrereqsRepository::upsert(&mut *tx, row).await?,
                DbOp::DeletePrereqsForTask { cycle, name } => {
                    TaskPrereqsRepository::delete_for_task(&mut *tx, cycle, name).await?
                }
                DbOp::UpsertJob(row) => TaskJobsRepository::upsert(&mut *tx, row).await?,
                DbOp::UpsertBroadcast(row) => {
                    BroadcastsRepository::upsert(&mut *tx, row).await?
                }
                DbOp::DeleteBroadcast {
                    point,
                    namespace,
                    setting_path,
                } => {
                    BroadcastsRepository::delete(&mut *tx, point, namespace, setting_path)
                        .await?
                }
                DbOp::UpsertXtrigger(row) => XtriggersRepository::upsert(&mut *tx, row).await?,
                DbOp::InsertFlow(row) => FlowsRepository::insert(&mut *tx, row).await?,
            }
        }
        tx.commit().await?;
        debug!(ops = self.ops.len(), "committed pending database operations");
        self.ops.clear();
        Ok(())
    }
}
