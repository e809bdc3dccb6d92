//! The task pool
//!
//! Owns the live set of task proxies and is the only component that
//! mutates their status. Spawning is output-driven: a downstream instance
//! enters the pool when an upstream output first contributes to one of its
//! prerequisites; parentless instances are spawned up to the runahead
//! window by the spawn pointer walk.

use crate::config::{RunaheadLimit, WorkflowConfig};
use crate::error::{CoreError, Result};
use crate::flow::{FlowManager, FlowNums, FlowSelection};
use crate::graph::store::GraphStore;
use crate::id::{TaskId, TaskSelector};
use crate::pool::proxy::TaskProxy;
use crate::pool::queues::TaskQueues;
use crate::prereq::{PrereqKey, SatisfiedState};
use crate::task_state::TaskStatus;
use cadence_db::models::{TaskOutputRow, TaskPoolRow, TaskPrereqRow};
use cadence_db::{DbOp, PendingOps};
use cadence_cycling::CyclePoint;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outputs remembered for one task instance, per flow set
#[derive(Debug, Clone, Default)]
struct RememberedOutputs {
    entries: Vec<(FlowNums, BTreeSet<String>)>,
}

impl RememberedOutputs {
    fn record(&mut self, flows: &FlowNums, output: &str) {
        for (entry_flows, outputs) in &mut self.entries {
            if entry_flows == flows {
                outputs.insert(output.to_string());
                return;
            }
        }
        self.entries.push((
            flows.clone(),
            [output.to_string()].into_iter().collect(),
        ));
    }

    fn contains(&self, output: &str, flows: &FlowNums) -> bool {
        self.entries.iter().any(|(entry_flows, outputs)| {
            outputs.contains(output) && !entry_flows.is_disjoint(flows)
        })
    }

    fn erase_flows(&mut self, flows: &FlowNums) {
        for (entry_flows, _) in &mut self.entries {
            entry_flows.retain(|f| !flows.contains(f));
        }
        self.entries.retain(|(entry_flows, _)| !entry_flows.is_empty());
    }
}

/// What a release pass produced
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    /// Instances moved to `preparing`, ready for the job manager
    pub released: Vec<TaskId>,
    /// Instances that clock-expired during the pass
    pub expired: Vec<TaskId>,
}

/// What an output-satisfaction walk produced
#[derive(Debug, Default)]
pub struct SatisfyOutcome {
    /// Active instances removed by suicide whose jobs must be killed
    pub to_kill: Vec<TaskId>,
}

/// What a group trigger produced
#[derive(Debug, Default)]
pub struct GroupTriggerOutcome {
    /// Active instances whose jobs must be killed (rerun members)
    pub to_kill: Vec<TaskId>,
    /// Instances primed to run by the trigger
    pub triggered: Vec<TaskId>,
}

/// Result of matching user selectors against the pool
#[derive(Debug, Default)]
pub struct MatchResult {
    /// Matched live instances
    pub active: Vec<TaskId>,
    /// Matched instances not (yet) in the pool
    pub inactive: Vec<TaskId>,
    /// Selectors that matched nothing
    pub unmatched: Vec<String>,
}

/// The live set of task instances
pub struct TaskPool {
    graph: Arc<GraphStore>,
    runahead_limit: RunaheadLimit,
    final_point: Option<CyclePoint>,
    stop_point: Option<CyclePoint>,
    hold_point: Option<CyclePoint>,
    tasks: BTreeMap<TaskId, TaskProxy>,
    queues: TaskQueues,
    queue_assignment: HashMap<String, String>,
    remembered: BTreeMap<TaskId, RememberedOutputs>,
    spawn_next: BTreeMap<String, Option<CyclePoint>>,
    deferred: BTreeSet<TaskId>,
    default_flows: FlowNums,
}

impl TaskPool {
    /// Build an empty pool over a compiled graph
    pub fn new(graph: Arc<GraphStore>, config: &WorkflowConfig) -> Self {
        let queue_assignment = config
            .taskdefs
            .keys()
            .map(|name| (name.clone(), config.queue_for(name).to_string()))
            .collect();
        Self {
            graph,
            runahead_limit: config.runahead_limit.clone(),
            final_point: config.final_point,
            stop_point: config.stop_point,
            hold_point: None,
            tasks: BTreeMap::new(),
            queues: TaskQueues::new(&config.queues),
            queue_assignment,
            remembered: BTreeMap::new(),
            spawn_next: BTreeMap::new(),
            deferred: BTreeSet::new(),
            default_flows: FlowNums::new(),
        }
    }

    /// Initialise spawn pointers and the default flow set (cold start)
    pub fn initialise(&mut self, default_flows: FlowNums) -> Result<()> {
        self.default_flows = default_flows;
        let initial = *self.graph.initial_point();
        for def in self.graph.taskdefs() {
            let first = def.first_point_after(&initial)?;
            self.spawn_next.insert(def.name.clone(), first);
        }
        Ok(())
    }

    /// The compiled graph currently in force
    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if no instance is live
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Look up one instance
    pub fn get(&self, id: &TaskId) -> Option<&TaskProxy> {
        self.tasks.get(id)
    }

    /// Mutable lookup, for the event and job managers
    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskProxy> {
        self.tasks.get_mut(id)
    }

    /// Iterate live instances in deterministic (point, name) order
    pub fn iter(&self) -> impl Iterator<Item = &TaskProxy> {
        self.tasks.values()
    }

    /// Union of flow numbers over all live instances
    pub fn active_flow_nums(&self) -> FlowNums {
        let mut flows = FlowNums::new();
        for proxy in self.tasks.values() {
            flows.extend(proxy.flow_nums.iter().copied());
        }
        flows
    }

    /// The stop point currently in force, if any
    pub fn stop_point(&self) -> Option<&CyclePoint> {
        self.stop_point.as_ref()
    }

    /// Set (or clear) the stop point
    pub fn set_stop_point(&mut self, point: Option<CyclePoint>) {
        self.stop_point = point;
    }

    /// Hold every instance at a cycle beyond `point`, now and on spawn
    pub fn set_hold_point(&mut self, point: CyclePoint, pending: &mut PendingOps, now: DateTime<Utc>) {
        self.hold_point = Some(point);
        let ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|p| p.id.point > point && p.status == TaskStatus::Waiting && !p.is_held)
            .map(|p| p.id.clone())
            .collect();
        for id in ids {
            self.hold_one(&id, pending, now);
        }
    }

    /// Clear the hold point (held instances stay held)
    pub fn release_hold_point(&mut self) {
        self.hold_point = None;
    }

    /// Hold specific instances; idempotent
    pub fn hold(&mut self, ids: &[TaskId], pending: &mut PendingOps, now: DateTime<Utc>) {
        for id in ids {
            self.hold_one(id, pending, now);
        }
    }

    /// Release held instances; idempotent
    pub fn release_held(&mut self, ids: &[TaskId], pending: &mut PendingOps, now: DateTime<Utc>) {
        for id in ids {
            if let Some(proxy) = self.tasks.get_mut(id) {
                if proxy.is_held {
                    proxy.is_held = false;
                    info!(task = %id, "released from hold");
                    let row = proxy.pool_row();
                    let state = proxy.state_row(now);
                    pending.push(DbOp::UpsertPool(row));
                    pending.push(DbOp::UpsertState(state));
                }
            }
        }
    }

    /// Clear on-resume deferrals; the release scan may now take them
    pub fn clear_deferred(&mut self) {
        self.deferred.clear();
    }

    /// Resolve user selectors against the pool and the graph
    pub fn match_selectors(&self, selectors: &[TaskSelector]) -> MatchResult {
        let mut result = MatchResult::default();
        for selector in selectors {
            let mut hit = false;
            for proxy in self.tasks.values() {
                if selector.matches(&proxy.id, proxy.status) {
                    result.active.push(proxy.id.clone());
                    hit = true;
                }
            }
            if !hit {
                if let Some(id) = selector.as_exact(self.graph.cycling_mode()) {
                    if let Some(def) = self.graph.taskdef(&id.name) {
                        if def.is_valid_at(&id.point).unwrap_or(false)
                            && !self.tasks.contains_key(&id)
                            && !self.beyond_bounds(&id.point)
                        {
                            result.inactive.push(id);
                            hit = true;
                        }
                    }
                }
            }
            if !hit {
                warn!(selector = %selector.text, "no task matched selector");
                result.unmatched.push(selector.text.clone());
            }
        }
        result.active.sort();
        result.active.dedup();
        result.inactive.sort();
        result.inactive.dedup();
        result
    }

    /// Spawn an instance if absent; merge flows if present
    ///
    /// Respects the stop point, final point and the task's sequences.
    /// Returns the id if the instance is (now) in the pool.
    pub fn spawn(
        &mut self,
        name: &str,
        point: &CyclePoint,
        flows: &FlowNums,
        reason: &str,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        let def = match self.graph.taskdef(name) {
            Some(def) => Arc::clone(def),
            None => {
                warn!(task = %name, "cannot spawn: no such task definition");
                return Ok(None);
            }
        };
        if !def.is_valid_at(point)? {
            debug!(task = %name, point = %point, "not spawning: off sequence");
            return Ok(None);
        }
        if self.beyond_bounds(point) {
            debug!(task = %name, point = %point, "not spawning: beyond stop point");
            return Ok(None);
        }

        let id = TaskId::new(*point, name);
        if let Some(proxy) = self.tasks.get_mut(&id) {
            if proxy.merge_flows(flows) {
                info!(task = %id, flows = ?proxy.flow_nums, "merged flows");
                let row = proxy.pool_row();
                let state = proxy.state_row(now);
                pending.push(DbOp::UpsertPool(row));
                pending.push(DbOp::UpsertState(state));
            }
            return Ok(Some(id));
        }

        let (prereqs, suicide) = self.graph.instantiate_prereqs(name, point)?;
        let queue = self
            .queue_assignment
            .get(name)
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_QUEUE.to_string());
        let mut proxy = TaskProxy::new(def.clone(), id.clone(), flows.clone(), prereqs, suicide, queue, now);

        // Satisfy against outputs already completed in overlapping flows.
        let keys: Vec<PrereqKey> = proxy
            .prerequisites
            .iter()
            .chain(proxy.suicide_prerequisites.iter())
            .flat_map(|p| p.keys().into_iter().cloned())
            .collect();
        for key in keys {
            let upstream = TaskId::new(key.point, key.task.as_str());
            if let Some(remembered) = self.remembered.get(&upstream) {
                if remembered.contains(&key.output, &proxy.flow_nums) {
                    proxy.satisfy_prereq(&key, SatisfiedState::Naturally);
                }
            }
        }

        if let Some(hold_point) = &self.hold_point {
            if point > hold_point {
                proxy.is_held = true;
            }
        }
        if let Some(offset) = &def.late_offset {
            if let Ok(CyclePoint::DateTime(t)) = point.add(offset) {
                proxy.late_time = Some(t);
            }
        }
        if let Some(offset) = &def.clock_expire_offset {
            if let Ok(CyclePoint::DateTime(t)) = point.add(offset) {
                proxy.expire_time = Some(t);
            }
        }

        info!(task = %id, flows = ?proxy.flow_nums, reason = %reason, "spawned");
        pending.push(DbOp::UpsertPool(proxy.pool_row()));
        pending.push(DbOp::UpsertState(proxy.state_row(now)));
        self.tasks.insert(id.clone(), proxy);
        Ok(Some(id))
    }

    /// Walk parentless tasks and spawn instances up to the runahead window
    ///
    /// Invoked after any event that shifts the earliest live point.
    pub fn check_spawn_parentless(
        &mut self,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>> {
        let mut spawned = Vec::new();
        let names: Vec<String> = self.spawn_next.keys().cloned().collect();
        for name in names {
            loop {
                let Some(Some(point)) = self.spawn_next.get(&name).cloned() else {
                    break;
                };
                if self.beyond_bounds(&point) {
                    self.spawn_next.insert(name.clone(), None);
                    break;
                }
                if !self.within_runahead(&point)? {
                    break;
                }
                let def = match self.graph.taskdef(&name) {
                    Some(def) => Arc::clone(def),
                    None => break,
                };
                let id = TaskId::new(point, name.as_str());
                let handled = self.tasks.contains_key(&id)
                    || self
                        .remembered
                        .get(&id)
                        .map(|r| !r.entries.is_empty())
                        .unwrap_or(false);
                if handled {
                    // Already spawned (or already ran): move along.
                    let next = def.next_point(&point)?;
                    self.spawn_next.insert(name.clone(), next);
                    continue;
                }
                if def.sequential && self.has_unfinished_before(&name, &point) {
                    break;
                }
                let (prereqs, _) = self.graph.instantiate_prereqs(&name, &point)?;
                if !prereqs.is_empty() {
                    // Not parentless here: upstream outputs will spawn it.
                    break;
                }
                let flows = self.default_flows.clone();
                if let Some(id) = self.spawn(&name, &point, &flows, "parentless", pending, now)? {
                    spawned.push(id);
                }
                let next = def.next_point(&point)?;
                self.spawn_next.insert(name.clone(), next);
            }
        }
        Ok(spawned)
    }

    /// Release eligible instances: queue them, then let queues release
    ///
    /// A paused workflow releases only manually triggered instances; a
    /// stopping workflow releases nothing. Returns the released ids (now
    /// `preparing`) plus any instances that clock-expired during the
    /// pass.
    pub fn release_ready(
        &mut self,
        paused: bool,
        stopping: bool,
        now: DateTime<Utc>,
        pending: &mut PendingOps,
    ) -> Result<ReleaseOutcome> {
        let mut outcome = ReleaseOutcome::default();

        // Clock-expiry pass.
        let expire_ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|p| {
                p.status == TaskStatus::Waiting
                    && p.expire_time.map(|t| now >= t).unwrap_or(false)
            })
            .map(|p| p.id.clone())
            .collect();
        for id in expire_ids {
            if let Some(proxy) = self.tasks.get_mut(&id) {
                proxy.expire();
                warn!(task = %id, "task expired");
                pending.push(DbOp::UpsertPool(proxy.pool_row()));
                pending.push(DbOp::UpsertState(proxy.state_row(now)));
            }
            let _ = self.satisfy_downstreams(
                &id,
                crate::graph::taskdef::OUTPUT_EXPIRED,
                SatisfiedState::Naturally,
                pending,
                now,
            )?;
            self.remove_if_complete(&id, pending, now)?;
            outcome.expired.push(id);
        }

        // Queueing pass.
        let candidate_ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|p| !p.is_queued && !self.deferred.contains(&p.id))
            .filter(|p| p.ready_to_run(now))
            .map(|p| p.id.clone())
            .collect();
        for id in candidate_ids {
            if !self.within_runahead(&id.point)? {
                continue;
            }
            if !self.clock_trigger_satisfied(&id, now)? {
                continue;
            }
            if let Some(proxy) = self.tasks.get_mut(&id) {
                proxy.is_queued = true;
                let queue = proxy.queue.clone();
                self.queues.push(&queue, id);
            }
        }

        if stopping {
            return Ok(outcome);
        }
        let released_ids = if paused {
            // Manual triggers run even while paused; everything else
            // stays queued for resume.
            let manual: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|p| {
                    p.is_queued && p.is_manual_trigger && !self.deferred.contains(&p.id)
                })
                .map(|p| p.id.clone())
                .collect();
            for id in &manual {
                self.queues.remove(id);
            }
            manual
        } else {
            // Release pass, bounded per queue by currently active
            // members.
            let mut active_counts: HashMap<String, usize> = HashMap::new();
            for proxy in self.tasks.values() {
                if proxy.is_active() {
                    *active_counts.entry(proxy.queue.clone()).or_default() += 1;
                }
            }
            self.queues.release(&active_counts)
        };
        for id in released_ids {
            if let Some(proxy) = self.tasks.get_mut(&id) {
                let satisfied_by: Vec<String> = proxy
                    .prerequisites
                    .iter()
                    .flat_map(|p| p.iter_triples())
                    .filter(|t| t.state.is_satisfied())
                    .map(|t| t.key.to_string())
                    .collect();
                proxy.is_queued = false;
                proxy.set_status(TaskStatus::Preparing);
                info!(task = %id, satisfied_by = ?satisfied_by, "resolved dependencies");
                pending.push(DbOp::UpsertPool(proxy.pool_row()));
                pending.push(DbOp::UpsertState(proxy.state_row(now)));
                outcome.released.push(id);
            }
        }
        Ok(outcome)
    }

    /// Record an output and propagate it to downstream instances
    ///
    /// Spawns downstreams that the output first makes satisfiable,
    /// satisfies their matching prerequisite triples, and executes any
    /// suicide prerequisites the output completes.
    pub fn satisfy_downstreams(
        &mut self,
        upstream: &TaskId,
        output: &str,
        state: SatisfiedState,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<SatisfyOutcome> {
        let mut outcome = SatisfyOutcome::default();
        let flows = match self.tasks.get(upstream) {
            Some(proxy) => proxy.flow_nums.clone(),
            None => self.default_flows.clone(),
        };
        self.record_output(upstream, output, &flows, pending);

        let edges: Vec<crate::graph::store::ChildEdge> = self
            .graph
            .children(&upstream.name)
            .iter()
            .filter(|e| e.output == output)
            .cloned()
            .collect();
        let key = PrereqKey::new(upstream.point, upstream.name.clone(), output);

        for edge in edges {
            let child_point = self.graph.child_point(&edge, &upstream.point)?;
            let child_id = TaskId::new(child_point, edge.child.as_str());

            if edge.suicide {
                // Suicide prerequisites only act on live instances.
                if let Some(child) = self.tasks.get_mut(&child_id) {
                    child.satisfy_prereq(&key, state);
                    if child.suicide_satisfied() {
                        info!(task = %child_id, "suicide prerequisite satisfied, removing");
                        if child.is_active() {
                            outcome.to_kill.push(child_id.clone());
                        }
                        self.erase(&child_id, pending);
                    }
                }
                continue;
            }

            if flows.is_empty() {
                // No-flow activity does not spawn downstream activity.
                if let Some(child) = self.tasks.get_mut(&child_id) {
                    child.satisfy_prereq(&key, state);
                }
                continue;
            }

            if let Some(child) = self.spawn(&edge.child, &child_point, &flows, "downstream", pending, now)? {
                if let Some(proxy) = self.tasks.get_mut(&child) {
                    if proxy.satisfy_prereq(&key, state) {
                        pending.push(DbOp::UpsertPool(proxy.pool_row()));
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Drop a finished instance that has met its completion condition
    ///
    /// Returns true if the instance left the pool.
    pub fn remove_if_complete(
        &mut self,
        id: &TaskId,
        pending: &mut PendingOps,
        _now: DateTime<Utc>,
    ) -> Result<bool> {
        let done = match self.tasks.get(id) {
            Some(proxy) => proxy.is_finished() && proxy.is_complete(),
            None => false,
        };
        if done {
            debug!(task = %id, "complete, leaving the pool");
            self.erase(id, pending);
        }
        Ok(done)
    }

    /// Remove instances from the given flows
    ///
    /// Downstream instances that lose their only satisfied prerequisites
    /// as a consequence are removed as well. Returns the fully removed
    /// ids and the active ones whose jobs must be killed.
    pub fn remove_tasks(
        &mut self,
        ids: &[TaskId],
        flows_sel: &FlowSelection,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> (Vec<TaskId>, Vec<TaskId>) {
        let mut removed = Vec::new();
        let mut to_kill = Vec::new();
        let mut worklist: Vec<TaskId> = ids.to_vec();

        while let Some(id) = worklist.pop() {
            let Some(proxy) = self.tasks.get_mut(&id) else {
                // Inactive target: scrub its durable traces so a future
                // spawn is pristine.
                if let Some(remembered) = self.remembered.get_mut(&id) {
                    for (entry_flows, _) in &remembered.entries {
                        pending.push(DbOp::DeleteOutputsForFlows {
                            cycle: id.point.to_string(),
                            name: id.name.clone(),
                            flow_nums: FlowManager::to_db_string(entry_flows),
                        });
                    }
                    remembered.entries.clear();
                }
                pending.push(DbOp::DeletePrereqsForTask {
                    cycle: id.point.to_string(),
                    name: id.name.clone(),
                });
                continue;
            };
            let to_remove: FlowNums = match flows_sel {
                FlowSelection::Numbers(nums) => {
                    nums.intersection(&proxy.flow_nums).copied().collect()
                }
                _ => proxy.flow_nums.clone(),
            };
            if to_remove.is_empty() {
                warn!(task = %id, "not removable: no overlap with requested flows");
                continue;
            }
            proxy.flow_nums.retain(|f| !to_remove.contains(f));
            if !proxy.flow_nums.is_empty() {
                info!(task = %id, removed_flows = ?to_remove, "removed from flows");
                pending.push(DbOp::UpsertPool(proxy.pool_row()));
                pending.push(DbOp::UpsertState(proxy.state_row(now)));
                continue;
            }

            // Flow set emptied: the instance leaves the pool.
            let was_active = proxy.is_active();
            let produced: Vec<String> = proxy.completed_outputs.keys().cloned().collect();
            info!(task = %id, "removed from the pool");
            if was_active {
                to_kill.push(id.clone());
            }
            self.erase(&id, pending);
            if let Some(remembered) = self.remembered.get_mut(&id) {
                remembered.erase_flows(&to_remove);
            }
            pending.push(DbOp::DeleteOutputsForFlows {
                cycle: id.point.to_string(),
                name: id.name.clone(),
                flow_nums: FlowManager::to_db_string(&to_remove),
            });
            pending.push(DbOp::DeletePrereqsForTask {
                cycle: id.point.to_string(),
                name: id.name.clone(),
            });

            // Walk downstream: reverse natural satisfactions this instance
            // provided, and drop children left with nothing satisfied.
            let edges: Vec<crate::graph::store::ChildEdge> =
                self.graph.children(&id.name).to_vec();
            for edge in edges {
                if !produced.contains(&edge.output) {
                    continue;
                }
                let Ok(child_point) = self.graph.child_point(&edge, &id.point) else {
                    continue;
                };
                let child_id = TaskId::new(child_point, edge.child.as_str());
                let key = PrereqKey::new(id.point, id.name.clone(), edge.output.clone());
                if let Some(child) = self.tasks.get_mut(&child_id) {
                    if child.status != TaskStatus::Waiting || child.is_manual_trigger {
                        continue;
                    }
                    child.unset_naturally_satisfied(&key);
                    if !child.any_prereq_satisfied() && !child.is_queued {
                        worklist.push(child_id);
                    } else {
                        pending.push(DbOp::UpsertPool(child.pool_row()));
                    }
                }
            }

            // Reset the spawn pointer so the cycle can respawn if
            // triggered again.
            if let Some(pointer) = self.spawn_next.get_mut(&id.name) {
                let reset = match pointer {
                    Some(next) => id.point < *next,
                    None => true,
                };
                if reset {
                    *pointer = Some(id.point);
                }
            }
            removed.push(id);
        }
        (removed, to_kill)
    }

    /// Force-satisfy prerequisites and/or complete outputs (`set`)
    ///
    /// With neither outputs nor prerequisites given, the task's required
    /// outputs are completed. Downstreams spawn as if the outputs had
    /// been produced naturally. Idempotent.
    #[allow(clippy::too_many_arguments)]
    pub fn set_prereqs_and_outputs(
        &mut self,
        targets: &[TaskId],
        outputs: &[String],
        prereqs: &[PrereqKey],
        flows_sel: &FlowSelection,
        flow_mgr: &mut FlowManager,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let flows = self.resolve_flow_selection(flows_sel, targets, flow_mgr, pending, now);
        for id in targets {
            if self.tasks.get(id).is_none() {
                self.spawn(&id.name.clone(), &id.point, &flows, "set", pending, now)?;
            }
            let Some(proxy) = self.tasks.get_mut(id) else {
                continue;
            };

            if !prereqs.is_empty() {
                for key in prereqs {
                    if proxy.satisfy_prereq(key, SatisfiedState::Forced) {
                        info!(task = %id, prereq = %key, "prerequisite force-satisfied");
                        pending.push(DbOp::UpsertPrereq(TaskPrereqRow {
                            cycle: id.point.to_string(),
                            name: id.name.clone(),
                            prereq_cycle: key.point.to_string(),
                            prereq_name: key.task.clone(),
                            prereq_output: key.output.clone(),
                            reason: SatisfiedState::Forced.to_string(),
                        }));
                    }
                }
                pending.push(DbOp::UpsertPool(proxy.pool_row()));
            }

            let labels: Vec<String> = if outputs.is_empty() && prereqs.is_empty() {
                proxy.taskdef.required_outputs()
            } else {
                outputs.to_vec()
            };
            let mut newly = Vec::new();
            for label in &labels {
                if !proxy.taskdef.has_output(label) {
                    warn!(task = %id, output = %label, "no such declared output");
                    continue;
                }
                if proxy.add_output(label, SatisfiedState::Forced) {
                    newly.push(label.clone());
                }
            }
            if !newly.is_empty() {
                let flows_for_record = proxy.flow_nums.clone();
                for label in &newly {
                    info!(task = %id, output = %label, "output completed by command");
                    self.note_forced_output(id, label, &flows_for_record, pending);
                }
                if newly.iter().any(|l| l == crate::graph::taskdef::OUTPUT_SUCCEEDED) {
                    if let Some(proxy) = self.tasks.get_mut(id) {
                        proxy.set_status(TaskStatus::Succeeded);
                        pending.push(DbOp::UpsertPool(proxy.pool_row()));
                        pending.push(DbOp::UpsertState(proxy.state_row(now)));
                    }
                }
                for label in &newly {
                    // Downstreams react as if the output were natural.
                    self.satisfy_downstreams(id, label, SatisfiedState::Naturally, pending, now)?;
                }
                self.remove_if_complete(id, pending, now)?;
            }
        }
        Ok(())
    }

    /// Group trigger: an atomic rerun of a connected sub-graph
    #[allow(clippy::too_many_arguments)]
    pub fn group_trigger(
        &mut self,
        matched: &MatchResult,
        flows_sel: &FlowSelection,
        on_resume: bool,
        flow_mgr: &mut FlowManager,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<GroupTriggerOutcome> {
        let mut outcome = GroupTriggerOutcome::default();
        let mut members: Vec<TaskId> = matched.active.clone();
        members.extend(matched.inactive.iter().cloned());
        members.sort();
        members.dedup();
        if members.is_empty() {
            return Ok(outcome);
        }

        // Warn-and-ignore: a no-flow trigger of already-active tasks
        // would strand running instances, so the selector is dropped.
        let flows_sel = if matches!(flows_sel, FlowSelection::NoFlow) && !matched.active.is_empty()
        {
            warn!("ignoring --flow=none for tasks already active in the pool");
            &FlowSelection::Default
        } else {
            flows_sel
        };
        let flows = self.resolve_flow_selection(flows_sel, &members, flow_mgr, pending, now);

        for group in connected_subgroups(&members, &self.graph) {
            // Group-start tasks have no prerequisite on another member.
            let starts: Vec<TaskId> = group
                .iter()
                .filter(|id| {
                    !group
                        .iter()
                        .any(|other| *id != other && self.graph.depends_on(id, other))
                })
                .cloned()
                .collect();
            let rest: Vec<TaskId> = group
                .iter()
                .filter(|id| !starts.contains(id))
                .cloned()
                .collect();

            // Rerun members restart pristine: remove them (killing active
            // jobs) and respawn with the group's flows.
            let remove_sel = FlowSelection::Numbers(flows.clone());
            let (_, kills) = self.remove_tasks(&rest, &remove_sel, pending, now);
            outcome.to_kill.extend(kills);
            for id in &rest {
                self.spawn(&id.name.clone(), &id.point, &flows, "group rerun", pending, now)?;
                self.force_satisfy_off_group(id, &group, pending);
            }

            for id in &starts {
                self.spawn(&id.name.clone(), &id.point, &flows, "trigger", pending, now)?;
                self.force_satisfy_off_group(id, &group, pending);
                if let Some(proxy) = self.tasks.get_mut(id) {
                    proxy.merge_flows(&flows);
                    proxy.is_manual_trigger = true;
                    proxy.retry_timer = None;
                    for value in proxy.xtriggers.values_mut() {
                        *value = true;
                    }
                    for value in proxy.external_triggers.values_mut() {
                        *value = true;
                    }
                    if on_resume {
                        proxy.is_queued = true;
                        self.deferred.insert(id.clone());
                    }
                    pending.push(DbOp::UpsertPool(proxy.pool_row()));
                    pending.push(DbOp::UpsertState(proxy.state_row(now)));
                    outcome.triggered.push(id.clone());
                }
            }
        }
        Ok(outcome)
    }

    /// Apply a satisfied xtrigger label to every gated instance
    pub fn apply_xtrigger(&mut self, label: &str) {
        for proxy in self.tasks.values_mut() {
            if let Some(value) = proxy.xtriggers.get_mut(label) {
                *value = true;
            }
        }
    }

    /// Apply an external trigger message; returns true if any task gated
    /// on it
    pub fn apply_external_trigger(&mut self, message: &str) -> bool {
        let mut matched = false;
        for proxy in self.tasks.values_mut() {
            if let Some(value) = proxy.external_triggers.get_mut(message) {
                *value = true;
                matched = true;
            }
        }
        matched
    }

    /// Stall check: non-empty pool, nothing active, nothing can become
    /// releasable without intervention
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        if self.tasks.is_empty() {
            return false;
        }
        if !self.queues.is_empty() {
            return false;
        }
        for proxy in self.tasks.values() {
            if proxy.is_active() {
                return false;
            }
            if proxy.status == TaskStatus::Waiting {
                if proxy.ready_to_run(now) {
                    return false;
                }
                // Pending retries, clock gates and external triggers
                // resolve themselves.
                if proxy.retry_timer.map(|t| t > now).unwrap_or(false) {
                    return false;
                }
                if proxy.expire_time.is_some() || proxy.taskdef.clock_trigger_offset.is_some() {
                    return false;
                }
                if proxy.xtriggers.values().any(|v| !*v)
                    || proxy.external_triggers.values().any(|v| !*v)
                {
                    return false;
                }
            }
        }
        true
    }

    /// Earliest point with an unfinished instance (the runahead base)
    pub fn runahead_base(&self) -> Option<CyclePoint> {
        let mut base: Option<CyclePoint> = None;
        for proxy in self.tasks.values() {
            if proxy.is_finished() && proxy.is_complete() {
                continue;
            }
            base = match base {
                Some(b) if b <= proxy.id.point => Some(b),
                _ => Some(proxy.id.point),
            };
        }
        if base.is_none() {
            for next in self.spawn_next.values().flatten() {
                base = match base {
                    Some(b) if b <= *next => Some(b),
                    _ => Some(*next),
                };
            }
        }
        base
    }

    /// Whether the workflow has run out of work entirely
    pub fn is_exhausted(&self) -> bool {
        self.tasks.is_empty() && self.spawn_next.values().all(|p| p.is_none())
    }

    /// Swap in a reloaded graph store
    ///
    /// Waiting instances get their prerequisite objects rebuilt from the
    /// new definitions, keeping already-satisfied triples satisfied.
    /// Instances of deleted tasks are dropped if waiting; added tasks get
    /// spawn pointers. Returns (added, deleted) task names.
    pub fn swap_graph(
        &mut self,
        graph: Arc<GraphStore>,
        config: &WorkflowConfig,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let old = Arc::clone(&self.graph);
        self.graph = graph;
        self.runahead_limit = config.runahead_limit.clone();
        self.final_point = config.final_point;
        self.queue_assignment = config
            .taskdefs
            .keys()
            .map(|name| (name.clone(), config.queue_for(name).to_string()))
            .collect();

        let added: Vec<String> = self
            .graph
            .taskdefs()
            .map(|d| d.name.clone())
            .filter(|name| old.taskdef(name).is_none())
            .collect();
        let deleted: Vec<String> = old
            .taskdefs()
            .map(|d| d.name.clone())
            .filter(|name| self.graph.taskdef(name).is_none())
            .collect();

        for name in &added {
            info!(task = %name, "reload: task added");
            if let Some(def) = self.graph.taskdef(name) {
                let first = def.first_point_after(self.graph.initial_point())?;
                self.spawn_next.insert(name.clone(), first);
            }
        }
        for name in &deleted {
            info!(task = %name, "reload: task deleted");
            self.spawn_next.remove(name);
            let ids: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|p| &p.id.name == name && p.status == TaskStatus::Waiting)
                .map(|p| p.id.clone())
                .collect();
            for id in ids {
                self.erase(&id, pending);
            }
        }

        // Added tasks whose inbound outputs were already produced spawn
        // immediately (spawning re-checks recorded outputs).
        let mut respawns: Vec<(String, CyclePoint, FlowNums)> = Vec::new();
        for (upstream, remembered) in &self.remembered {
            for edge in self.graph.children(&upstream.name) {
                if !added.contains(&edge.child) || edge.suicide {
                    continue;
                }
                for (flows, outputs) in &remembered.entries {
                    if outputs.contains(&edge.output) && !flows.is_empty() {
                        if let Ok(child_point) = self.graph.child_point(edge, &upstream.point) {
                            respawns.push((edge.child.clone(), child_point, flows.clone()));
                        }
                    }
                }
            }
        }
        for (name, point, flows) in respawns {
            self.spawn(&name, &point, &flows, "reload", pending, now)?;
        }

        // Rebuild prerequisites of waiting instances against the new
        // graph; satisfaction earned under the old graph is kept.
        let waiting: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|p| p.status == TaskStatus::Waiting)
            .map(|p| p.id.clone())
            .collect();
        for id in waiting {
            let def = match self.graph.taskdef(&id.name) {
                Some(def) => Arc::clone(def),
                None => continue,
            };
            let (mut prereqs, mut suicide) = self.graph.instantiate_prereqs(&id.name, &id.point)?;
            if let Some(proxy) = self.tasks.get_mut(&id) {
                let old_states: HashMap<PrereqKey, SatisfiedState> = proxy
                    .prerequisites
                    .iter()
                    .chain(proxy.suicide_prerequisites.iter())
                    .flat_map(|p| p.iter_triples())
                    .filter(|t| t.state.is_satisfied())
                    .map(|t| (t.key.clone(), t.state))
                    .collect();
                for prereq in prereqs.iter_mut().chain(suicide.iter_mut()) {
                    let keys: Vec<PrereqKey> = prereq.keys().into_iter().cloned().collect();
                    for key in keys {
                        if let Some(state) = old_states.get(&key) {
                            prereq.satisfy(&key, *state);
                        }
                    }
                }
                proxy.taskdef = def;
                proxy.prerequisites = prereqs;
                proxy.suicide_prerequisites = suicide;
            }
            // New triples may be satisfiable from remembered outputs.
            let keys: Vec<PrereqKey> = self
                .tasks
                .get(&id)
                .map(|p| {
                    p.prerequisites
                        .iter()
                        .flat_map(|pr| pr.keys().into_iter().cloned())
                        .collect()
                })
                .unwrap_or_default();
            for key in keys {
                let upstream = TaskId::new(key.point, key.task.as_str());
                let flows = self.tasks.get(&id).map(|p| p.flow_nums.clone()).unwrap_or_default();
                if let Some(remembered) = self.remembered.get(&upstream) {
                    if remembered.contains(&key.output, &flows) {
                        if let Some(proxy) = self.tasks.get_mut(&id) {
                            proxy.satisfy_prereq(&key, SatisfiedState::Naturally);
                        }
                    }
                }
            }
            if let Some(proxy) = self.tasks.get(&id) {
                pending.push(DbOp::UpsertPool(proxy.pool_row()));
                pending.push(DbOp::UpsertState(proxy.state_row(now)));
            }
        }
        Ok((added, deleted))
    }

    /// Override the flow set used for parentless spawning
    pub fn set_default_flows(&mut self, flows: FlowNums) {
        self.default_flows = flows;
    }

    /// Override one spawn pointer (restart bookkeeping)
    pub fn set_spawn_pointer(&mut self, name: &str, point: Option<CyclePoint>) {
        self.spawn_next.insert(name.to_string(), point);
    }

    /// Instances with remembered outputs for a task name, latest first
    pub fn remembered_points(&self, name: &str) -> Vec<CyclePoint> {
        let mut points: Vec<CyclePoint> = self
            .remembered
            .iter()
            .filter(|(id, rem)| id.name == name && !rem.entries.is_empty())
            .map(|(id, _)| id.point)
            .collect();
        points.sort();
        points.reverse();
        points
    }

    /// True if the instance has a remembered output with this label in
    /// any flow
    pub fn has_remembered_output(&self, id: &TaskId, output: &str) -> bool {
        self.remembered
            .get(id)
            .map(|rem| {
                rem.entries
                    .iter()
                    .any(|(_, outputs)| outputs.contains(output))
            })
            .unwrap_or(false)
    }

    /// Restore remembered outputs from persisted rows (restart)
    pub fn load_remembered_outputs(&mut self, rows: &[TaskOutputRow]) {
        for row in rows {
            let Ok(point) = CyclePoint::parse(&row.cycle, self.graph.cycling_mode()) else {
                continue;
            };
            let Ok(flows) = FlowManager::from_db_string(&row.flow_nums) else {
                continue;
            };
            let id = TaskId::new(point, row.name.as_str());
            self.remembered.entry(id).or_default().record(&flows, &row.output);
        }
    }

    /// Restore one pool row into a live proxy (restart)
    pub fn restore_proxy(
        &mut self,
        row: &TaskPoolRow,
        forced: &[TaskPrereqRow],
        submit_num: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskId>> {
        let point = CyclePoint::parse(&row.cycle, self.graph.cycling_mode())
            .map_err(CoreError::from)?;
        let Some(def) = self.graph.taskdef(&row.name).cloned() else {
            warn!(task = %row.name, "restart: dropping pool row for unknown task");
            return Ok(None);
        };
        let flows = FlowManager::from_db_string(&row.flow_nums)
            .map_err(|e| cadence_db::StoreError::corrupt("task_pool.flow_nums", e))
            .map_err(CoreError::from)?;
        let id = TaskId::new(point, row.name.as_str());
        let (prereqs, suicide) = self.graph.instantiate_prereqs(&row.name, &point)?;
        let queue = self
            .queue_assignment
            .get(&row.name)
            .cloned()
            .unwrap_or_else(|| crate::config::DEFAULT_QUEUE.to_string());
        let mut proxy = TaskProxy::new(def, id.clone(), flows, prereqs, suicide, queue, now);
        proxy.status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|e| cadence_db::StoreError::corrupt("task_pool.status", e))
            .map_err(CoreError::from)?;
        proxy.is_held = row.is_held;
        proxy.is_late = row.is_late;
        proxy.submit_num = submit_num;

        // Natural satisfactions come back from remembered outputs, forced
        // ones from their own table.
        let keys: Vec<PrereqKey> = proxy
            .prerequisites
            .iter()
            .flat_map(|p| p.keys().into_iter().cloned())
            .collect();
        for key in keys {
            let upstream = TaskId::new(key.point, key.task.as_str());
            if let Some(remembered) = self.remembered.get(&upstream) {
                if remembered.contains(&key.output, &proxy.flow_nums) {
                    proxy.satisfy_prereq(&key, SatisfiedState::Naturally);
                }
            }
        }
        for row in forced {
            if row.cycle == id.point.to_string() && row.name == id.name {
                let Ok(prereq_point) =
                    CyclePoint::parse(&row.prereq_cycle, self.graph.cycling_mode())
                else {
                    continue;
                };
                let key = PrereqKey::new(
                    prereq_point,
                    row.prereq_name.clone(),
                    row.prereq_output.clone(),
                );
                proxy.satisfy_prereq(&key, SatisfiedState::Forced);
            }
        }

        self.tasks.insert(id.clone(), proxy);
        Ok(Some(id))
    }

    fn hold_one(&mut self, id: &TaskId, pending: &mut PendingOps, now: DateTime<Utc>) {
        if let Some(proxy) = self.tasks.get_mut(id) {
            if !proxy.is_held {
                proxy.is_held = true;
                info!(task = %id, "held");
                let row = proxy.pool_row();
                let state = proxy.state_row(now);
                pending.push(DbOp::UpsertPool(row));
                pending.push(DbOp::UpsertState(state));
            }
        }
        self.queues.remove(id);
        if let Some(proxy) = self.tasks.get_mut(id) {
            proxy.is_queued = false;
        }
    }

    fn erase(&mut self, id: &TaskId, pending: &mut PendingOps) {
        if self.tasks.remove(id).is_some() {
            self.queues.remove(id);
            self.deferred.remove(id);
            pending.push(DbOp::DeletePool {
                cycle: id.point.to_string(),
                name: id.name.clone(),
            });
        }
    }

    fn record_output(
        &mut self,
        id: &TaskId,
        output: &str,
        flows: &FlowNums,
        pending: &mut PendingOps,
    ) {
        let remembered = self.remembered.entry(id.clone()).or_default();
        if !remembered.contains(output, flows) {
            remembered.record(flows, output);
            pending.push(DbOp::UpsertOutput(TaskOutputRow {
                cycle: id.point.to_string(),
                name: id.name.clone(),
                flow_nums: FlowManager::to_db_string(flows),
                output: output.to_string(),
                reason: SatisfiedState::Naturally.to_string(),
            }));
        }
    }

    /// Record a command-completed output; the later natural-satisfaction
    /// walk sees it as already recorded
    fn note_forced_output(
        &mut self,
        id: &TaskId,
        output: &str,
        flows: &FlowNums,
        pending: &mut PendingOps,
    ) {
        let remembered = self.remembered.entry(id.clone()).or_default();
        if !remembered.contains(output, flows) {
            remembered.record(flows, output);
        }
        pending.push(DbOp::UpsertOutput(TaskOutputRow {
            cycle: id.point.to_string(),
            name: id.name.clone(),
            flow_nums: FlowManager::to_db_string(flows),
            output: output.to_string(),
            reason: SatisfiedState::Forced.to_string(),
        }));
    }

    fn force_satisfy_off_group(
        &mut self,
        id: &TaskId,
        group: &[TaskId],
        pending: &mut PendingOps,
    ) {
        let Some(proxy) = self.tasks.get_mut(id) else {
            return;
        };
        // Deterministic order: prerequisite triples are already sorted.
        let keys: Vec<PrereqKey> = proxy
            .prerequisites
            .iter()
            .flat_map(|p| p.keys().into_iter().cloned())
            .filter(|key| {
                !group
                    .iter()
                    .any(|member| member.name == key.task && member.point == key.point)
            })
            .collect();
        for key in keys {
            if proxy.satisfy_prereq(&key, SatisfiedState::Forced) {
                info!(task = %id, prereq = %key, "off-group prerequisite force-satisfied");
                pending.push(DbOp::UpsertPrereq(TaskPrereqRow {
                    cycle: id.point.to_string(),
                    name: id.name.clone(),
                    prereq_cycle: key.point.to_string(),
                    prereq_name: key.task.clone(),
                    prereq_output: key.output.clone(),
                    reason: SatisfiedState::Forced.to_string(),
                }));
            }
        }
    }

    fn resolve_flow_selection(
        &mut self,
        sel: &FlowSelection,
        targets: &[TaskId],
        flow_mgr: &mut FlowManager,
        pending: &mut PendingOps,
        now: DateTime<Utc>,
    ) -> FlowNums {
        match sel {
            FlowSelection::Numbers(nums) => nums.clone(),
            FlowSelection::New => {
                let description = format!(
                    "manual trigger of {}",
                    targets
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                [flow_mgr.allocate(description, now, pending)]
                    .into_iter()
                    .collect()
            }
            FlowSelection::NoFlow => FlowNums::new(),
            FlowSelection::Default => {
                let mut flows = FlowNums::new();
                for id in targets {
                    if let Some(proxy) = self.tasks.get(id) {
                        flows.extend(proxy.flow_nums.iter().copied());
                    }
                }
                if flows.is_empty() {
                    flows = self.active_flow_nums();
                }
                if flows.is_empty() {
                    flows = self.default_flows.clone();
                }
                flows
            }
        }
    }

    fn beyond_bounds(&self, point: &CyclePoint) -> bool {
        if let Some(stop) = &self.stop_point {
            if point > stop {
                return true;
            }
        }
        if let Some(final_point) = &self.final_point {
            if point > final_point {
                return true;
            }
        }
        false
    }

    fn within_runahead(&self, point: &CyclePoint) -> Result<bool> {
        let Some(base) = self.runahead_base() else {
            return Ok(true);
        };
        match &self.runahead_limit {
            RunaheadLimit::Interval(interval) => {
                let bound = base.add(interval)?;
                Ok(*point <= bound)
            }
            RunaheadLimit::Count(n) => {
                let mut points: BTreeSet<CyclePoint> = self
                    .tasks
                    .values()
                    .filter(|p| !(p.is_finished() && p.is_complete()))
                    .map(|p| p.id.point)
                    .collect();
                if points.contains(point) {
                    return Ok(true);
                }
                points.insert(*point);
                let rank = points.iter().position(|p| p == point).unwrap_or(0);
                Ok(rank < *n as usize)
            }
        }
    }

    fn clock_trigger_satisfied(&self, id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let Some(proxy) = self.tasks.get(id) else {
            return Ok(false);
        };
        if proxy.is_manual_trigger {
            return Ok(true);
        }
        match &proxy.taskdef.clock_trigger_offset {
            Some(offset) => Ok(crate::xtrigger::wall_clock_satisfied(
                &id.point,
                Some(offset),
                now,
            )?),
            None => Ok(true),
        }
    }

    fn has_unfinished_before(&self, name: &str, point: &CyclePoint) -> bool {
        self.tasks.values().any(|p| {
            p.id.name == name && p.id.point < *point && !(p.is_finished() && p.is_complete())
        })
    }
}

/// Partition ids into connected subgroups under graph adjacency
fn connected_subgroups(members: &[TaskId], graph: &GraphStore) -> Vec<Vec<TaskId>> {
    let mut groups: Vec<Vec<TaskId>> = Vec::new();
    let mut assigned: BTreeSet<TaskId> = BTreeSet::new();
    for seed in members {
        if assigned.contains(seed) {
            continue;
        }
        let mut group = vec![seed.clone()];
        assigned.insert(seed.clone());
        let mut frontier = vec![seed.clone()];
        while let Some(current) = frontier.pop() {
            for other in members {
                if assigned.contains(other) {
                    continue;
                }
                if graph.depends_on(&current, other) || graph.depends_on(other, &current) {
                    assigned.insert(other.clone());
                    group.push(other.clone());
                    frontier.push(other.clone());
                }
            }
        }
        group.sort();
        groups.push(group);
    }
    groups
}
