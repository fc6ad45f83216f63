//! The build engine: resolves per-package task definitions, constructs the
//! reachable task DAG, and drives its execution.
//!
//! Construction happens through [`EngineBuilder`]; the resulting
//! [`Engine<Built>`] is immutable and can be walked concurrently.

mod builder;
mod builder_errors;
mod execute;
mod graph_visualizer;
mod resolver;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use petgraph::prelude::*;
use railyard_repository::package_graph::PackageName;
use railyard_task_id::TaskId;

pub use crate::{
    builder::EngineBuilder,
    builder_errors::Error,
    execute::{ExecOutcome, ExecuteError, ExecutionOptions, Message, StopExecution, TaskDispatch},
    graph_visualizer::{render_dot, render_mermaid},
    resolver::{ResolvedTaskDefinitions, TaskDefinitionResolver},
};

/// How a task relates to the tasks it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// A `dependsOn` edge. Forces the target task into existence.
    Strong,
    /// A `before`/`after` edge. Wires ordering between tasks that already
    /// exist; never causes instantiation.
    Weak,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Aggregation-only: succeeds iff every dependency succeeds.
    Target,
    /// Runs a shell command; the only kind that executes.
    Script { command: String },
    /// The `pre<name>` / `<name>` / `post<name>` lifecycle wrapper. Holds the
    /// parts by node index and aggregates their outcomes.
    Composite {
        pre: Option<NodeIndex>,
        main: NodeIndex,
        post: Option<NodeIndex>,
    },
}

/// A node in the task graph. Immutable once construction finishes.
#[derive(Debug, Clone)]
pub struct Task {
    package: PackageName,
    /// Script and target tasks carry their name; the synthetic lifecycle
    /// wrapper does not.
    name: Option<String>,
    kind: TaskKind,
}

impl Task {
    pub fn package(&self) -> &PackageName {
        &self.package
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Script { command } => Some(command),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, TaskKind::Script { .. })
    }

    /// The id this task is addressed by, when it has a public name.
    pub fn task_id(&self) -> Option<TaskId<'static>> {
        self.name
            .as_ref()
            .map(|name| TaskId::from_owned(self.package.to_string(), name.clone()))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}#{}", self.package, name),
            // The lifecycle wrapper is anonymous; point at what it wraps.
            None => match &self.kind {
                TaskKind::Composite { .. } => write!(f, "{}#(lifecycle)", self.package),
                _ => write!(f, "{}#(unnamed)", self.package),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The task graph plus everything execution needs: the leaf-task skeleton and
/// scheduling weights.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    /// Full task graph. Edge `a -> b` means `a` waits for `b`.
    task_graph: Graph<Task, EdgeKind>,
    /// Public names to the node dependable under that name (the composite
    /// when a lifecycle wrapper exists).
    task_lookup: HashMap<TaskId<'static>, NodeIndex>,
    /// Registered tasks per package, in creation order. Used by the `*` and
    /// `^*` expansions.
    package_tasks: HashMap<PackageName, Vec<NodeIndex>>,
    /// Leaf-task skeleton: nodes carry task-graph indices of script tasks.
    exec_graph: Graph<NodeIndex, ()>,
    exec_lookup: HashMap<NodeIndex, petgraph::graph::NodeIndex>,
    /// Scheduling priority per leaf: 1 + the weights of the leaves that
    /// depend on it.
    weights: HashMap<NodeIndex, u64>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        Self {
            marker: std::marker::PhantomData,
            task_graph: Graph::default(),
            task_lookup: HashMap::default(),
            package_tasks: HashMap::default(),
            exec_graph: Graph::default(),
            exec_lookup: HashMap::default(),
            weights: HashMap::default(),
        }
    }

    /// Adds a task node without registering a public name (used for the
    /// anonymous lifecycle wrapper and the script it wraps).
    pub(crate) fn add_task(&mut self, task: Task) -> NodeIndex {
        self.task_graph.add_node(task)
    }

    /// Makes an existing node dependable under a public name.
    pub(crate) fn register(&mut self, task_id: TaskId<'static>, index: NodeIndex) {
        let package = self.task_graph[index].package.clone();
        self.task_lookup.insert(task_id, index);
        self.package_tasks.entry(package).or_default().push(index);
    }

    pub(crate) fn lookup(&self, task_id: &TaskId<'_>) -> Option<NodeIndex> {
        self.task_lookup.get(&task_id.clone().into_owned()).copied()
    }

    pub(crate) fn task(&self, index: NodeIndex) -> &Task {
        &self.task_graph[index]
    }

    pub(crate) fn tasks_in_package(&self, package: &PackageName) -> &[NodeIndex] {
        self.package_tasks
            .get(package)
            .map(|tasks| tasks.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn task_graph_ref(&self) -> &Graph<Task, EdgeKind> {
        &self.task_graph
    }

    /// Adds an edge unless the pair is already connected; a strong edge is
    /// never downgraded to a weak one.
    pub(crate) fn connect(&mut self, from: NodeIndex, to: NodeIndex, kind: EdgeKind) {
        if from == to {
            return;
        }
        if self.task_graph.find_edge(from, to).is_none() {
            self.task_graph.add_edge(from, to, kind);
        }
    }

    /// Collapses the graph to its leaf-task skeleton and computes weights,
    /// sealing the engine.
    pub(crate) fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            task_lookup,
            package_tasks,
            ..
        } = self;

        // Replace each non-leaf dependency with the set of leaf tasks it
        // ultimately gates.
        let mut closures: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
        for index in task_graph.node_indices() {
            leaf_closure(&task_graph, index, &mut closures);
        }

        let mut exec_graph = Graph::new();
        let mut exec_lookup = HashMap::new();
        for index in task_graph.node_indices() {
            if task_graph[index].is_leaf() {
                exec_lookup.insert(index, exec_graph.add_node(index));
            }
        }
        for (&task_index, &exec_index) in &exec_lookup {
            for dep in task_graph.neighbors_directed(task_index, Direction::Outgoing) {
                // A leaf dependency's closure is itself; an aggregator's is
                // the leaves it gates.
                for leaf in &closures[&dep] {
                    if *leaf == task_index {
                        continue;
                    }
                    let dep_exec = exec_lookup[leaf];
                    if exec_graph.find_edge(exec_index, dep_exec).is_none() {
                        exec_graph.add_edge(exec_index, dep_exec, ());
                    }
                }
            }
        }

        // Weight: 1 + the sum of the weights of the leaves that depend on
        // this one. Memoized walk from each node towards its dependents.
        let mut weights = HashMap::new();
        for exec_index in exec_graph.node_indices() {
            leaf_weight(&exec_graph, exec_index, &mut weights);
        }
        let weights = weights
            .into_iter()
            .map(|(exec_index, weight)| (exec_graph[exec_index], weight))
            .collect();

        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            task_lookup,
            package_tasks,
            exec_graph,
            exec_lookup,
            weights,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of leaf tasks a node gates: itself when it is a leaf, otherwise
/// the union over its dependencies.
fn leaf_closure(
    graph: &Graph<Task, EdgeKind>,
    index: NodeIndex,
    closures: &mut HashMap<NodeIndex, HashSet<NodeIndex>>,
) -> HashSet<NodeIndex> {
    if let Some(closure) = closures.get(&index) {
        return closure.clone();
    }
    let closure = if graph[index].is_leaf() {
        HashSet::from([index])
    } else {
        let mut union = HashSet::new();
        for dep in graph.neighbors_directed(index, Direction::Outgoing) {
            union.extend(leaf_closure(graph, dep, closures));
        }
        union
    };
    closures.insert(index, closure.clone());
    closure
}

fn leaf_weight(
    graph: &Graph<NodeIndex, ()>,
    index: petgraph::graph::NodeIndex,
    weights: &mut HashMap<petgraph::graph::NodeIndex, u64>,
) -> u64 {
    if let Some(&weight) = weights.get(&index) {
        return weight;
    }
    // Mark in-progress to keep accidental cycles from recursing forever; the
    // graph is validated acyclic before sealing.
    weights.insert(index, 1);
    let mut weight = 1;
    for dependent in graph.neighbors_directed(index, Direction::Incoming) {
        weight += leaf_weight(graph, dependent, weights);
    }
    weights.insert(index, weight);
    weight
}

impl Engine<Built> {
    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.task_graph[index]
    }

    pub fn task_by_id(&self, task_id: &TaskId<'_>) -> Option<&Task> {
        let index = self.task_lookup.get(&task_id.clone().into_owned())?;
        Some(&self.task_graph[*index])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.task_graph.node_weights()
    }

    pub fn task_count(&self) -> usize {
        self.task_graph.node_count()
    }

    /// Every leaf (script) task, by task-graph index.
    pub fn leaf_tasks(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.exec_graph.node_weights().copied()
    }

    pub fn leaf_count(&self) -> usize {
        self.exec_graph.node_count()
    }

    pub fn weight(&self, index: NodeIndex) -> u64 {
        self.weights.get(&index).copied().unwrap_or(1)
    }

    /// Direct leaf dependencies of a leaf task.
    pub fn leaf_dependencies(&self, index: NodeIndex) -> HashSet<NodeIndex> {
        let Some(exec_index) = self.exec_lookup.get(&index) else {
            return HashSet::new();
        };
        self.exec_graph
            .neighbors_directed(*exec_index, Direction::Outgoing)
            .map(|dep| self.exec_graph[dep])
            .collect()
    }

    /// Direct dependencies of the task registered under `task_id` in the
    /// full task graph.
    pub fn dependencies(&self, task_id: &TaskId<'_>) -> Option<Vec<&Task>> {
        let index = self.task_lookup.get(&task_id.clone().into_owned())?;
        Some(
            self.task_graph
                .neighbors_directed(*index, Direction::Outgoing)
                .map(|dep| &self.task_graph[dep])
                .collect(),
        )
    }

    pub(crate) fn task_graph(&self) -> &Graph<Task, EdgeKind> {
        &self.task_graph
    }

    pub(crate) fn exec_graph(&self) -> &Graph<NodeIndex, ()> {
        &self.exec_graph
    }
}
