//! Construction of the task graph from matched packages and target names.
//!
//! The build runs in phases: seed the targets on every matched package,
//! expand `dependsOn` transitively through a work queue (strong edges, which
//! instantiate tasks), then — once the reachable set is frozen — resolve the
//! weak `before`/`after` ordering edges, validate, and collapse to the
//! leaf-task skeleton.

use std::collections::{HashMap, VecDeque};

use petgraph::prelude::NodeIndex;
use railyard_config::{BuildConfig, DependencySpec, TaskDefinition};
use railyard_graph_utils as graph;
use railyard_repository::package_graph::{PackageGraph, PackageName};
use railyard_task_id::{TaskId, TaskName};
use tracing::{debug, trace};

use crate::{
    resolver::{ResolvedTaskDefinitions, TaskDefinitionResolver},
    Building, Built, EdgeKind, Engine, Error, Task, TaskKind,
};

pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    config: &'a BuildConfig,
    workspaces: Vec<PackageName>,
    tasks: Vec<TaskName<'static>>,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(package_graph: &'a PackageGraph, config: &'a BuildConfig) -> Self {
        Self {
            package_graph,
            config,
            workspaces: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// The matched packages the targets are requested on.
    pub fn with_workspaces(mut self, workspaces: Vec<PackageName>) -> Self {
        self.workspaces = workspaces;
        self
    }

    /// The target task names from the command line.
    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    pub fn build(self) -> Result<Engine<Built>, Error> {
        if self.workspaces.is_empty() || self.tasks.is_empty() {
            return Ok(Engine::new().seal());
        }

        let mut state = BuilderState {
            engine: Engine::new(),
            package_graph: self.package_graph,
            resolver: TaskDefinitionResolver::new(self.config),
            resolved: HashMap::new(),
            definitions: HashMap::new(),
            composites: HashMap::new(),
            queue: VecDeque::new(),
        };

        // Phase A: seed each target on each matched package. A target that
        // cannot be created on a matched package is fatal.
        for workspace in &self.workspaces {
            for task in &self.tasks {
                let task_id = task.task_id_for_package(workspace.as_str());
                if task.is_package_qualified() && task_id.package() != workspace.as_str() {
                    continue;
                }
                let package = PackageName::from(task_id.package());
                if state.create_task(&package, task_id.task())?.is_none() {
                    return Err(Error::MissingScript {
                        package,
                        task: task_id.task().to_string(),
                    });
                }
            }
        }

        // Phase B: walk `dependsOn` until no task instantiates another.
        while let Some((node, definition)) = state.queue.pop_front() {
            state.expand_depends_on(node, &definition)?;
        }

        // Phase D: the reachable set is frozen; wire the ordering-only edges.
        state.resolve_weak_edges();

        graph::validate_graph(state.engine.task_graph_ref())?;

        // Phase E: collapse to leaves and compute weights.
        Ok(state.engine.seal())
    }
}

struct BuilderState<'a> {
    engine: Engine<Building>,
    package_graph: &'a PackageGraph,
    resolver: TaskDefinitionResolver<'a>,
    resolved: HashMap<PackageName, ResolvedTaskDefinitions>,
    /// Definition each node was created from; lifecycle wrappers have none.
    definitions: HashMap<NodeIndex, TaskDefinition>,
    /// Wrapped script task to its lifecycle wrapper. A definition tracked on
    /// the script belongs to the composite when ordering edges are wired.
    composites: HashMap<NodeIndex, NodeIndex>,
    /// Tasks whose `dependsOn` entries have not been walked yet.
    queue: VecDeque<(NodeIndex, TaskDefinition)>,
}

/// Which ordering list a wildcard appeared in. The mirrored-field exclusion
/// compares the same list on the candidate.
#[derive(Clone, Copy, PartialEq)]
enum WeakField {
    Before,
    After,
}

impl<'a> BuilderState<'a> {
    /// Creates (or returns) the task dependable as `name` in `package`.
    ///
    /// Returns `None` when the package has no such script, or the script
    /// shells back into the orchestrator (the user is expected to configure a
    /// `dependsOn` instead). Callers decide whether that is fatal.
    fn create_task(
        &mut self,
        package: &PackageName,
        name: &str,
    ) -> Result<Option<NodeIndex>, Error> {
        let task_id = TaskId::from_owned(package.to_string(), name.to_string());
        if let Some(existing) = self.engine.lookup(&task_id) {
            return Ok(Some(existing));
        }

        let definition = self
            .resolved_definitions(package)?
            .get(name)
            .unwrap_or_else(default_script_definition);

        if !definition.script {
            trace!("creating target task {task_id}");
            let node = self.engine.add_task(Task {
                package: package.clone(),
                name: Some(name.to_string()),
                kind: TaskKind::Target,
            });
            self.engine.register(task_id, node);
            self.track(node, definition);
            return Ok(Some(node));
        }

        let package_json = self
            .package_graph
            .package_json(package)
            .ok_or_else(|| Error::MissingPackageJson {
                package: package.clone(),
            })?;
        let Some(command) = package_json.script(name) else {
            return Ok(None);
        };
        if railyard_config::is_orchestrator_invocation(command) {
            debug!("{task_id} recurses into the orchestrator; not created");
            return Ok(None);
        }
        let command = command.to_string();

        trace!("creating script task {task_id}");
        let main = self.engine.add_task(Task {
            package: package.clone(),
            name: Some(name.to_string()),
            kind: TaskKind::Script { command },
        });
        self.track(main, definition);

        // `pre<name>` runs strictly before, `post<name>` strictly after; the
        // three are wrapped into a composite that carries the public name.
        let pre = self.create_task(package, &format!("pre{name}"))?;
        let post = self.create_task(package, &format!("post{name}"))?;

        if pre.is_none() && post.is_none() {
            self.engine.register(task_id, main);
            return Ok(Some(main));
        }

        let composite = self.engine.add_task(Task {
            package: package.clone(),
            name: None,
            kind: TaskKind::Composite { pre, main, post },
        });
        if let Some(pre) = pre {
            self.engine.connect(main, pre, EdgeKind::Strong);
            self.engine.connect(composite, pre, EdgeKind::Strong);
        }
        self.engine.connect(composite, main, EdgeKind::Strong);
        if let Some(post) = post {
            self.engine.connect(post, main, EdgeKind::Strong);
            self.engine.connect(composite, post, EdgeKind::Strong);
        }
        self.engine.register(task_id, composite);
        self.composites.insert(main, composite);
        Ok(Some(composite))
    }

    fn track(&mut self, node: NodeIndex, definition: TaskDefinition) {
        self.definitions.insert(node, definition.clone());
        self.queue.push_back((node, definition));
    }

    fn resolved_definitions(
        &mut self,
        package: &PackageName,
    ) -> Result<&ResolvedTaskDefinitions, Error> {
        if !self.resolved.contains_key(package) {
            let info = self.package_graph.package_info(package).ok_or_else(|| {
                Error::MissingPackageJson {
                    package: package.clone(),
                }
            })?;
            let resolved = self.resolver.resolve(info)?;
            self.resolved.insert(package.clone(), resolved);
        }
        Ok(&self.resolved[package])
    }

    /// Phase B for one task: walk its `dependsOn` entries, instantiating the
    /// tasks they point at and adding strong edges.
    fn expand_depends_on(
        &mut self,
        node: NodeIndex,
        definition: &TaskDefinition,
    ) -> Result<(), Error> {
        let owner = self.engine.task(node);
        let owner_package = owner.package().clone();
        let dependent = owner.to_string();

        for spec in &definition.depends_on {
            match spec {
                DependencySpec::Task(name) => {
                    let dep = self.create_task(&owner_package, name)?.ok_or_else(|| {
                        Error::MissingTask {
                            package: owner_package.clone(),
                            task: name.clone(),
                            dependent: dependent.clone(),
                        }
                    })?;
                    self.engine.connect(node, dep, EdgeKind::Strong);
                }
                DependencySpec::Upstream(name) => {
                    // Best-effort fan-out: dependency packages without the
                    // task are skipped.
                    let dep_packages: Vec<PackageName> = self
                        .package_graph
                        .immediate_dependencies(&owner_package)
                        .into_iter()
                        .flatten()
                        .cloned()
                        .collect();
                    for dep_package in dep_packages {
                        if let Some(dep) = self.create_task(&dep_package, name)? {
                            self.engine.connect(node, dep, EdgeKind::Strong);
                        }
                    }
                }
                DependencySpec::Package { package, task } => {
                    let dep_package = PackageName::from(package.as_str());
                    let is_dependency = self
                        .package_graph
                        .immediate_dependencies(&owner_package)
                        .is_some_and(|deps| deps.contains(&dep_package));
                    if !is_dependency {
                        return Err(Error::PackageNotADependency {
                            owner: owner_package.clone(),
                            package: package.clone(),
                            task: task.clone(),
                            dependent: dependent.clone(),
                        });
                    }
                    let dep = self.create_task(&dep_package, task)?.ok_or_else(|| {
                        Error::MissingTask {
                            package: dep_package,
                            task: task.clone(),
                            dependent: dependent.clone(),
                        }
                    })?;
                    self.engine.connect(node, dep, EdgeKind::Strong);
                }
                DependencySpec::All | DependencySpec::UpstreamAll => {
                    // Config loading rewrites wildcards out of dependsOn;
                    // reaching one here is a configuration bug.
                    debug_assert!(false, "wildcard survived into dependsOn");
                    return Err(Error::WildcardInDependsOn {
                        dependent,
                        entry: spec.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Phase D: resolve `before` and `after` against the frozen task set.
    /// Unknown references are skipped, never instantiated.
    fn resolve_weak_edges(&mut self) {
        let entries: Vec<(NodeIndex, TaskDefinition)> = self
            .definitions
            .iter()
            .map(|(node, definition)| (*node, definition.clone()))
            .collect();

        for (node, definition) in entries {
            // A definition tracked on a wrapped script belongs to the
            // composite: the composite is the unit dependable under the
            // task's public name, so ordering edges attach to it.
            let anchor = self.composites.get(&node).copied().unwrap_or(node);
            for spec in &definition.before {
                // `before: X` adds this task as a dependency of X.
                for target in self.weak_targets(anchor, spec, WeakField::Before) {
                    self.connect_weak(target, anchor);
                }
            }
            for spec in &definition.after {
                // `after: Y` makes this task wait for Y.
                for target in self.weak_targets(anchor, spec, WeakField::After) {
                    self.connect_weak(anchor, target);
                }
            }
        }
    }

    /// Adds a weak edge. A composite never runs anything itself and only
    /// incoming edges collapse through it, so an edge *out* of a composite is
    /// also anchored on its first part — that is what actually holds the
    /// lifecycle back.
    fn connect_weak(&mut self, from: NodeIndex, to: NodeIndex) {
        let entry = match self.engine.task(from).kind() {
            TaskKind::Composite { pre, main, .. } => Some((*pre).unwrap_or(*main)),
            _ => None,
        };
        if let Some(entry) = entry {
            self.engine.connect(entry, to, EdgeKind::Weak);
        }
        self.engine.connect(from, to, EdgeKind::Weak);
    }

    fn weak_targets(
        &self,
        owner: NodeIndex,
        spec: &DependencySpec,
        field: WeakField,
    ) -> Vec<NodeIndex> {
        let owner_package = self.engine.task(owner).package().clone();
        match spec {
            DependencySpec::Task(name) => self
                .engine
                .lookup(&TaskId::new(owner_package.as_str(), name))
                .filter(|target| *target != owner)
                .into_iter()
                .collect(),
            DependencySpec::Package { package, task } => self
                .engine
                .lookup(&TaskId::new(package.as_str(), task))
                .filter(|target| *target != owner)
                .into_iter()
                .collect(),
            DependencySpec::Upstream(name) => self
                .dependency_packages(&owner_package)
                .iter()
                .filter_map(|dep_package| {
                    self.engine
                        .lookup(&TaskId::new(dep_package.as_str(), name))
                })
                .collect(),
            // Every other registered task in the same package, except those
            // that carry a wildcard in the same list; two wildcards never
            // order each other.
            DependencySpec::All => self
                .engine
                .tasks_in_package(&owner_package)
                .iter()
                .copied()
                .filter(|candidate| *candidate != owner)
                .filter(|candidate| !self.field_has_wildcard(*candidate, field))
                .collect(),
            DependencySpec::UpstreamAll => self
                .dependency_packages(&owner_package)
                .iter()
                .flat_map(|dep_package| self.engine.tasks_in_package(dep_package))
                .copied()
                .collect(),
        }
    }

    fn dependency_packages(&self, package: &PackageName) -> Vec<PackageName> {
        self.package_graph
            .immediate_dependencies(package)
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Whether the task registered at `node` uses `*` in the given list. For
    /// a lifecycle wrapper the wrapped script's definition answers.
    fn field_has_wildcard(&self, node: NodeIndex, field: WeakField) -> bool {
        let definition = match self.engine.task(node).kind() {
            TaskKind::Composite { main, .. } => self.definitions.get(main),
            _ => self.definitions.get(&node),
        };
        let Some(definition) = definition else {
            return false;
        };
        let list = match field {
            WeakField::Before => &definition.before,
            WeakField::After => &definition.after,
        };
        list.iter().any(|spec| matches!(spec, DependencySpec::All))
    }
}

fn default_script_definition() -> TaskDefinition {
    TaskDefinition {
        script: true,
        depends_on: Vec::new(),
        before: Vec::new(),
        after: Vec::new(),
    }
}
