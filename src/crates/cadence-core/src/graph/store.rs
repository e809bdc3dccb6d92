//! Immutable compiled graph store
//!
//! Built once from the resolved configuration and swapped atomically on
//! reload. Answers, for any `(task, cycle point)`: the inbound triggers
//! instantiated as prerequisite objects, the outbound children used to
//! walk downstream, and the task definition itself.

use crate::config::WorkflowConfig;
use crate::error::ConfigError;
use crate::graph::taskdef::{Dependency, TaskDef, TaskTrigger};
use crate::id::TaskId;
use crate::prereq::{Prerequisite, PrereqKey};
use cadence_cycling::{CycleInterval, CyclePoint, CyclingMode};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// One outbound edge: a downstream task triggered by an output of this one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEdge {
    /// Downstream task name
    pub child: String,
    /// The trigger's upstream offset as compiled into the child
    ///
    /// The downstream instance sits at `upstream_point - offset`.
    pub offset: Option<CycleInterval>,
    /// Upstream output label the edge fires on
    pub output: String,
    /// Whether the edge belongs to a suicide prerequisite
    pub suicide: bool,
}

/// The compiled, immutable task graph
#[derive(Debug)]
pub struct GraphStore {
    cycling_mode: CyclingMode,
    initial_point: CyclePoint,
    taskdefs: BTreeMap<String, Arc<TaskDef>>,
    families: BTreeMap<String, Vec<String>>,
    children: HashMap<String, Vec<ChildEdge>>,
}

impl GraphStore {
    /// Compile the configuration into a graph store
    ///
    /// Family triggers are expanded to member conjunctions, special task
    /// classes are folded into the definitions, and the graph is
    /// validated: undefined references, domain mixing and same-cycle
    /// dependency loops are all [`ConfigError`]s.
    pub fn compile(config: &WorkflowConfig) -> Result<Self, ConfigError> {
        if config.taskdefs.is_empty() {
            return Err(ConfigError::new("empty graph: no task definitions"));
        }

        // Family members must be defined tasks.
        for (family, members) in &config.families {
            for member in members {
                if !config.taskdefs.contains_key(member) {
                    return Err(ConfigError::new(format!(
                        "family {} lists undefined task {}",
                        family, member
                    )));
                }
            }
        }

        let mut taskdefs = BTreeMap::new();
        for (name, def) in &config.taskdefs {
            let mut def = def.clone();

            for family in &def.families {
                if !config.families.contains_key(family) {
                    return Err(ConfigError::new(format!(
                        "task {} names undefined parent family {}",
                        name, family
                    )));
                }
            }
            for seq in &def.sequences {
                if seq.start().mode() != config.cycling_mode {
                    return Err(ConfigError::new(format!(
                        "task {} sequence mixes cycling domains",
                        name
                    )));
                }
            }

            def.dependencies = def
                .dependencies
                .iter()
                .map(|dep| expand_dependency(dep, &config.families))
                .collect();

            // Fold special task classes into the compiled definition.
            if let Some(offset) = config.special_tasks.clock_trigger.get(name) {
                def.clock_trigger_offset = Some(*offset);
            }
            if let Some(offset) = config.special_tasks.clock_expire.get(name) {
                def.clock_expire_offset = Some(*offset);
            }
            if let Some(message) = config.special_tasks.external_trigger.get(name) {
                if !def.external_triggers.contains(message) {
                    def.external_triggers.push(message.clone());
                }
            }
            if config.special_tasks.sequential.contains(name) {
                def.sequential = true;
            }

            taskdefs.insert(name.clone(), Arc::new(def));
        }

        // Post-expansion, every trigger must reference a defined task with
        // a domain-consistent offset.
        for def in taskdefs.values() {
            for dep in &def.dependencies {
                for trigger in dep.clauses.iter().flatten() {
                    if !taskdefs.contains_key(&trigger.task) {
                        return Err(ConfigError::new(format!(
                            "task {} depends on undefined task {}",
                            def.name, trigger.task
                        )));
                    }
                    if let Some(offset) = &trigger.offset {
                        if offset.mode() != config.cycling_mode {
                            return Err(ConfigError::new(format!(
                                "task {} trigger on {} mixes cycling domains",
                                def.name, trigger.task
                            )));
                        }
                    }
                }
            }
            for label in &def.xtrigger_labels {
                if label != crate::xtrigger::WALL_CLOCK && !config.xtriggers.contains_key(label) {
                    return Err(ConfigError::new(format!(
                        "task {} references undeclared xtrigger {}",
                        def.name, label
                    )));
                }
            }
        }

        detect_same_cycle_loop(&taskdefs)?;

        let mut children: HashMap<String, Vec<ChildEdge>> = HashMap::new();
        for def in taskdefs.values() {
            for dep in &def.dependencies {
                for trigger in dep.clauses.iter().flatten() {
                    children
                        .entry(trigger.task.clone())
                        .or_default()
                        .push(ChildEdge {
                            child: def.name.clone(),
                            offset: trigger.offset,
                            output: trigger.output.clone(),
                            suicide: dep.suicide,
                        });
                }
            }
        }
        for edges in children.values_mut() {
            edges.sort_by(|a, b| (&a.child, &a.output).cmp(&(&b.child, &b.output)));
            edges.dedup();
        }

        Ok(Self {
            cycling_mode: config.cycling_mode,
            initial_point: config.initial_point,
            taskdefs,
            families: config.families.clone(),
            children,
        })
    }

    /// The workflow's cycling domain
    pub fn cycling_mode(&self) -> CyclingMode {
        self.cycling_mode
    }

    /// The workflow's initial point
    pub fn initial_point(&self) -> &CyclePoint {
        &self.initial_point
    }

    /// Look up a task definition
    pub fn taskdef(&self, name: &str) -> Option<&Arc<TaskDef>> {
        self.taskdefs.get(name)
    }

    /// All task definitions, in name order
    pub fn taskdefs(&self) -> impl Iterator<Item = &Arc<TaskDef>> {
        self.taskdefs.values()
    }

    /// Member tasks of a family, if defined
    pub fn family_members(&self, family: &str) -> Option<&[String]> {
        self.families.get(family).map(|v| v.as_slice())
    }

    /// Outbound edges of a task
    pub fn children(&self, name: &str) -> &[ChildEdge] {
        self.children.get(name).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The downstream point of a child edge fired from `upstream_point`
    pub fn child_point(
        &self,
        edge: &ChildEdge,
        upstream_point: &CyclePoint,
    ) -> cadence_cycling::Result<CyclePoint> {
        match &edge.offset {
            Some(offset) => upstream_point.sub(offset),
            None => Ok(*upstream_point),
        }
    }

    /// Instantiate the prerequisite objects of `(name, point)`
    ///
    /// Triggers whose upstream instance falls before the initial point or
    /// off the upstream's sequences are dropped (the dependency cannot
    /// apply there); a clause that loses all its triggers satisfies its
    /// whole dependency, which is then omitted. The result splits into
    /// (normal, suicide) prerequisites.
    pub fn instantiate_prereqs(
        &self,
        name: &str,
        point: &CyclePoint,
    ) -> cadence_cycling::Result<(Vec<Prerequisite>, Vec<Prerequisite>)> {
        let mut normal = Vec::new();
        let mut suicide = Vec::new();
        let def = match self.taskdefs.get(name) {
            Some(def) => def,
            None => return Ok((normal, suicide)),
        };

        for dep in &def.dependencies {
            let mut clauses: Vec<Vec<PrereqKey>> = Vec::new();
            let mut trivially_satisfied = false;
            for clause in &dep.clauses {
                let mut keys = Vec::new();
                let mut dropped = 0usize;
                for trigger in clause {
                    match self.resolve_trigger(trigger, point)? {
                        Some(key) => keys.push(key),
                        None => dropped += 1,
                    }
                }
                if keys.is_empty() && dropped > 0 {
                    // Every triple fell away: the clause holds vacuously.
                    trivially_satisfied = true;
                    break;
                }
                if !keys.is_empty() {
                    clauses.push(keys);
                }
            }
            if trivially_satisfied || clauses.is_empty() {
                continue;
            }
            let prereq = Prerequisite::new(clauses, dep.suicide);
            if dep.suicide {
                suicide.push(prereq);
            } else {
                normal.push(prereq);
            }
        }
        Ok((normal, suicide))
    }

    /// True if `downstream` has a compiled trigger on `upstream` at the
    /// matching cycle offset
    ///
    /// This is the adjacency used to partition a group trigger into
    /// connected subgroups.
    pub fn depends_on(&self, downstream: &TaskId, upstream: &TaskId) -> bool {
        let def = match self.taskdefs.get(&downstream.name) {
            Some(def) => def,
            None => return false,
        };
        for dep in &def.dependencies {
            for trigger in dep.clauses.iter().flatten() {
                if trigger.task != upstream.name {
                    continue;
                }
                let upstream_point = match &trigger.offset {
                    Some(offset) => match downstream.point.add(offset) {
                        Ok(p) => p,
                        Err(_) => continue,
                    },
                    None => downstream.point,
                };
                if upstream_point == upstream.point {
                    return true;
                }
            }
        }
        false
    }

    fn resolve_trigger(
        &self,
        trigger: &TaskTrigger,
        point: &CyclePoint,
    ) -> cadence_cycling::Result<Option<PrereqKey>> {
        let upstream_point = match &trigger.offset {
            Some(offset) => point.add(offset)?,
            None => *point,
        };
        if upstream_point.checked_cmp(&self.initial_point)? == std::cmp::Ordering::Less {
            return Ok(None);
        }
        if let Some(upstream) = self.taskdefs.get(&trigger.task) {
            if !upstream.is_valid_at(&upstream_point)? {
                return Ok(None);
            }
        }
        Ok(Some(PrereqKey::new(
            upstream_point,
            trigger.task.clone(),
            trigger.output.clone(),
        )))
    }
}

/// Expand family references in a dependency into member conjunctions
fn expand_dependency(dep: &Dependency, families: &BTreeMap<String, Vec<String>>) -> Dependency {
    let clauses = dep
        .clauses
        .iter()
        .map(|clause| {
            let mut expanded = Vec::new();
            for trigger in clause {
                match families.get(&trigger.task) {
                    Some(members) => {
                        for member in members {
                            expanded.push(TaskTrigger {
                                task: member.clone(),
                                offset: trigger.offset,
                                output: trigger.output.clone(),
                            });
                        }
                    }
                    None => expanded.push(trigger.clone()),
                }
            }
            expanded
        })
        .collect();
    Dependency {
        clauses,
        suicide: dep.suicide,
    }
}

/// Reject same-cycle dependency loops
fn detect_same_cycle_loop(taskdefs: &BTreeMap<String, Arc<TaskDef>>) -> Result<(), ConfigError> {
    // Zero-offset edges only: cross-cycle references are what make a
    // cycling graph repeat, not a loop.
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for def in taskdefs.values() {
        for dep in &def.dependencies {
            if dep.suicide {
                continue;
            }
            for trigger in dep.clauses.iter().flatten() {
                let zero_offset = match &trigger.offset {
                    Some(offset) => offset.is_zero(),
                    None => true,
                };
                if zero_offset {
                    edges
                        .entry(trigger.task.as_str())
                        .or_default()
                        .push(def.name.as_str());
                }
            }
        }
    }

    let mut visiting: HashSet<&str> = HashSet::new();
    let mut done: HashSet<&str> = HashSet::new();
    for start in taskdefs.keys() {
        visit(start.as_str(), &edges, &mut visiting, &mut done)?;
    }
    return Ok(());

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), ConfigError> {
        if done.contains(node) {
            return Ok(());
        }
        if !visiting.insert(node) {
            return Err(ConfigError::new(format!(
                "cyclic graph: same-cycle dependency loop involving {}",
                node
            )));
        }
        if let Some(nexts) = edges.get(node) {
            for next in nexts {
                visit(next, edges, visiting, done)?;
            }
        }
        visiting.remove(node);
        done.insert(node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::taskdef::OUTPUT_SUCCEEDED;
    use cadence_cycling::CycleSequence;

    fn p(n: i64) -> CyclePoint {
        CyclePoint::Integer(n)
    }

    fn seq(start: i64, step: i64) -> CycleSequence {
        CycleSequence::new(p(start), CycleInterval::Integer(step)).unwrap()
    }

    fn basic_config() -> WorkflowConfig {
        let mut config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        config.add_task(TaskDef::new("a", vec![seq(1, 1)]));
        config.add_task(
            TaskDef::new("b", vec![seq(1, 1)])
                .with_dependency(Dependency::all(vec![TaskTrigger::succeeded("a")])),
        );
        config
    }

    #[test]
    fn test_compile_and_children() {
        let store = GraphStore::compile(&basic_config()).unwrap();
        let edges = store.children("a");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].child, "b");
        assert_eq!(edges[0].output, OUTPUT_SUCCEEDED);
        assert!(store.children("b").is_empty());
    }

    #[test]
    fn test_empty_graph_rejected() {
        let config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        assert!(GraphStore::compile(&config).is_err());
    }

    #[test]
    fn test_undefined_upstream_rejected() {
        let mut config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        config.add_task(
            TaskDef::new("b", vec![seq(1, 1)])
                .with_dependency(Dependency::all(vec![TaskTrigger::succeeded("ghost")])),
        );
        let err = GraphStore::compile(&config).unwrap_err();
        assert!(err.to_string().contains("undefined task ghost"));
    }

    #[test]
    fn test_undefined_family_rejected() {
        let mut config = basic_config();
        let mut def = config.taskdefs.get("a").unwrap().clone();
        def.families = vec!["GHOSTFAM".to_string()];
        config.add_task(def);
        assert!(GraphStore::compile(&config).is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let mut config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        config.add_task(
            TaskDef::new("a", vec![seq(1, 1)])
                .with_dependency(Dependency::all(vec![TaskTrigger::succeeded("b")])),
        );
        config.add_task(
            TaskDef::new("b", vec![seq(1, 1)])
                .with_dependency(Dependency::all(vec![TaskTrigger::succeeded("a")])),
        );
        let err = GraphStore::compile(&config).unwrap_err();
        assert!(err.to_string().contains("cyclic graph"));
    }

    #[test]
    fn test_cross_cycle_self_reference_allowed() {
        let mut config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        config.add_task(TaskDef::new("a", vec![seq(1, 1)]).with_dependency(
            Dependency::all(vec![TaskTrigger::offset(
                "a",
                CycleInterval::Integer(-1),
                OUTPUT_SUCCEEDED,
            )]),
        ));
        assert!(GraphStore::compile(&config).is_ok());
    }

    #[test]
    fn test_family_trigger_expands_to_member_conjunction() {
        let mut config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        config.families.insert(
            "PREP".to_string(),
            vec!["fetch".to_string(), "decode".to_string()],
        );
        config.add_task(TaskDef::new("fetch", vec![seq(1, 1)]));
        config.add_task(TaskDef::new("decode", vec![seq(1, 1)]));
        config.add_task(
            TaskDef::new("model", vec![seq(1, 1)])
                .with_dependency(Dependency::all(vec![TaskTrigger::succeeded("PREP")])),
        );

        let store = GraphStore::compile(&config).unwrap();
        let (normal, _) = store.instantiate_prereqs("model", &p(1)).unwrap();
        assert_eq!(normal.len(), 1);
        let keys: Vec<String> = normal[0].keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["1/decode:succeeded", "1/fetch:succeeded"]);
    }

    #[test]
    fn test_pre_initial_triggers_dropped() {
        let mut config = WorkflowConfig::new("demo", CyclingMode::Integer, p(1));
        config.add_task(TaskDef::new("a", vec![seq(1, 1)]).with_dependency(
            Dependency::all(vec![TaskTrigger::offset(
                "a",
                CycleInterval::Integer(-1),
                OUTPUT_SUCCEEDED,
            )]),
        ));
        let store = GraphStore::compile(&config).unwrap();

        // At the initial point the only trigger is pre-initial: parentless.
        let (normal, _) = store.instantiate_prereqs("a", &p(1)).unwrap();
        assert!(normal.is_empty());

        // At point 2 the trigger resolves to 1/a.
        let (normal, _) = store.instantiate_prereqs("a", &p(2)).unwrap();
        assert_eq!(normal.len(), 1);
        assert_eq!(normal[0].keys()[0].to_string(), "1/a:succeeded");
    }

    #[test]
    fn test_depends_on_adjacency() {
        let store = GraphStore::compile(&basic_config()).unwrap();
        assert!(store.depends_on(&TaskId::new(p(1), "b"), &TaskId::new(p(1), "a")));
        assert!(!store.depends_on(&TaskId::new(p(1), "b"), &TaskId::new(p(2), "a")));
        assert!(!store.depends_on(&TaskId::new(p(1), "a"), &TaskId::new(p(1), "b")));
    }
}
