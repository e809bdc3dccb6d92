//! Execution queues
//!
//! Each queue has a concurrency limit; release-eligible tasks wait in
//! their queue and are let out FIFO, up to `limit - currently_active` per
//! tick. A limit of zero means unlimited.

use crate::config::{QueueConfig, DEFAULT_QUEUE};
use crate::id::TaskId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

/// One named queue
#[derive(Debug)]
struct Queue {
    limit: usize,
    waiting: VecDeque<TaskId>,
}

/// The set of execution queues
#[derive(Debug)]
pub struct TaskQueues {
    queues: BTreeMap<String, Queue>,
}

impl TaskQueues {
    /// Build queues from configuration; a default queue always exists
    pub fn new(configs: &BTreeMap<String, QueueConfig>) -> Self {
        let mut queues = BTreeMap::new();
        for (name, config) in configs {
            queues.insert(
                name.clone(),
                Queue {
                    limit: config.limit,
                    waiting: VecDeque::new(),
                },
            );
        }
        queues.entry(DEFAULT_QUEUE.to_string()).or_insert(Queue {
            limit: 0,
            waiting: VecDeque::new(),
        });
        Self { queues }
    }

    /// Add a ready task to its queue unless already queued
    pub fn push(&mut self, queue: &str, id: TaskId) {
        let queue_entry = self
            .queues
            .get_mut(queue)
            .unwrap_or_else(|| panic!("queue {} not configured", queue));
        if !queue_entry.waiting.contains(&id) {
            debug!(task = %id, queue = %queue, "queued");
            queue_entry.waiting.push_back(id);
        }
    }

    /// Remove a task from whichever queue holds it
    pub fn remove(&mut self, id: &TaskId) {
        for queue in self.queues.values_mut() {
            queue.waiting.retain(|queued| queued != id);
        }
    }

    /// Release tasks FIFO, respecting each queue's limit
    ///
    /// `active_counts` is the number of currently active tasks per queue.
    pub fn release(&mut self, active_counts: &HashMap<String, usize>) -> Vec<TaskId> {
        let mut released = Vec::new();
        for (name, queue) in &mut self.queues {
            let active = active_counts.get(name).copied().unwrap_or(0);
            let headroom = if queue.limit == 0 {
                usize::MAX
            } else {
                queue.limit.saturating_sub(active)
            };
            for _ in 0..headroom {
                match queue.waiting.pop_front() {
                    Some(id) => released.push(id),
                    None => break,
                }
            }
        }
        released
    }

    /// Total queued tasks across all queues
    pub fn len(&self) -> usize {
        self.queues.values().map(|q| q.waiting.len()).sum()
    }

    /// True if no task is queued anywhere
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
