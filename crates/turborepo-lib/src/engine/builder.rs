//! Task graph construction.
//!
//! Starting from the requested task names and the filtered package set,
//! seed every (package, task) pair that resolves to a runnable task, then
//! expand `dependsOn` edges breadth-first: `^task` fans out across the
//! package graph's workspace dependencies, plain `task` stays within the
//! package, and `pkg#task` is an explicit edge. A per-package `turbo.json`
//! entry replaces the root definition for that task wholesale.

use std::collections::{HashMap, HashSet, VecDeque};

use itertools::Itertools;
use turborepo_graph_utils as graph;

use super::{Building, Built, Engine};
use crate::{
    package_graph::{PackageGraph, PackageName, PackageNode},
    task_id::{TaskId, TaskName, ROOT_PKG_NAME},
    turbo_json::{TaskDefinition, TurboJson},
};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("Could not find the following tasks in project: {names}")]
    MissingTasks { names: String },
    #[error("Could not find package \"{package}\" referenced by task {task_id}")]
    MissingPackageFromTask { package: String, task_id: String },
    #[error(
        "{dependant} depends on {task_id}, but that task is not defined: the package has no such \
         script and no pipeline entry names it"
    )]
    MissingTaskFromExplicitDependency { task_id: String, dependant: String },
    #[error("root task {task_id} must be declared in the root turbo.json")]
    MissingRootTask { task_id: String },
    #[error(transparent)]
    Graph(#[from] graph::Error),
}

pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    root_turbo_json: &'a TurboJson,
    workspace_turbo_jsons: &'a HashMap<PackageName, TurboJson>,
    workspaces: Vec<PackageName>,
    tasks: Vec<TaskName<'static>>,
    tasks_only: bool,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        package_graph: &'a PackageGraph,
        root_turbo_json: &'a TurboJson,
        workspace_turbo_jsons: &'a HashMap<PackageName, TurboJson>,
    ) -> Self {
        Self {
            package_graph,
            root_turbo_json,
            workspace_turbo_jsons,
            workspaces: Vec::new(),
            tasks: Vec::new(),
            tasks_only: false,
        }
    }

    pub fn with_workspaces(mut self, workspaces: Vec<PackageName>) -> Self {
        self.workspaces = workspaces;
        self
    }

    pub fn with_tasks<I: IntoIterator<Item = TaskName<'static>>>(mut self, tasks: I) -> Self {
        self.tasks = tasks.into_iter().collect();
        self
    }

    /// `--only`: run exactly the requested (package, task) pairs with no
    /// dependency edges.
    pub fn with_tasks_only(mut self, tasks_only: bool) -> Self {
        self.tasks_only = tasks_only;
        self
    }

    // The set of tasks the engine is allowed to include when --only is
    // set: exactly the product of the filtered packages and the CLI task
    // names.
    fn allowed_tasks(&self) -> Option<HashSet<TaskId<'static>>> {
        if self.tasks_only {
            Some(
                self.workspaces
                    .iter()
                    .cartesian_product(self.tasks.iter())
                    .map(|(package, task_name)| {
                        task_name
                            .task_id()
                            .unwrap_or_else(|| TaskId::new(package.as_str(), task_name.task()))
                            .into_owned()
                    })
                    .collect(),
            )
        } else {
            None
        }
    }

    /// Resolves the task definition for a task id, or `None` when the
    /// task does not apply to that package. The package's own turbo.json
    /// entry is preferred; a `pkg#task` key in the root pipeline beats the
    /// plain `task` key.
    fn task_definition(&self, task_id: &TaskId) -> Option<TaskDefinition> {
        let workspace_json = self
            .workspace_turbo_jsons
            .get(&PackageName::from(task_id.package()));
        let raw = workspace_json
            .and_then(|turbo_json| {
                turbo_json
                    .pipeline
                    .get(&task_id.as_task_name().into_owned())
            })
            .or_else(|| self.root_turbo_json.pipeline.task_definition(task_id))?;
        Some(TaskDefinition::from(raw.clone()))
    }

    /// Whether this (package, task) pair produces a node: the package must
    /// define the script, or a pipeline entry must name the package
    /// explicitly.
    fn is_runnable(&self, task_id: &TaskId) -> bool {
        let has_script = self
            .package_graph
            .package_json(&PackageName::from(task_id.package()))
            .is_some_and(|package_json| package_json.scripts.contains_key(task_id.task()));
        if has_script {
            return true;
        }

        let qualified = TaskName::from(task_id.to_string().as_str()).into_owned();
        if self.root_turbo_json.pipeline.contains_key(&qualified) {
            return true;
        }
        self.workspace_turbo_jsons
            .get(&PackageName::from(task_id.package()))
            .is_some_and(|turbo_json| {
                turbo_json
                    .pipeline
                    .contains_key(&task_id.as_task_name().into_owned())
            })
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        // No packages in scope means an empty (but valid) graph.
        if self.workspaces.is_empty() {
            return Ok(Engine::default().seal());
        }

        let allowed_tasks = self.allowed_tasks();
        let mut missing_tasks: HashSet<&TaskName<'static>> = self.tasks.iter().collect();
        let mut traversal_queue = VecDeque::new();

        for (workspace, task) in self.workspaces.iter().cartesian_product(self.tasks.iter()) {
            let task_id = task
                .task_id()
                .unwrap_or_else(|| TaskId::new(workspace.as_str(), task.task()))
                .into_owned();

            if self.is_runnable(&task_id) {
                missing_tasks.remove(task);

                // Root tasks only enter the graph when declared explicitly
                // (`//#task`); a bare task name never schedules the root
                // package.
                if !matches!(workspace, PackageName::Root)
                    || task.package() == Some(ROOT_PKG_NAME)
                {
                    traversal_queue.push_back(task_id);
                }
            }
        }

        if !missing_tasks.is_empty() {
            let names = missing_tasks
                .into_iter()
                .map(|task| task.to_string())
                .sorted()
                .join(", ");
            return Err(BuilderError::MissingTasks { names });
        }

        let mut visited = HashSet::new();
        let mut engine: Engine<Building> = Engine::default();

        while let Some(task_id) = traversal_queue.pop_front() {
            if visited.contains(&task_id) {
                continue;
            }
            visited.insert(task_id.clone());

            if task_id.package() != ROOT_PKG_NAME
                && self
                    .package_graph
                    .package_json(&PackageName::from(task_id.package()))
                    .is_none()
            {
                // A pipeline entry references a package that isn't in the
                // package graph; that's a configuration error, not a
                // silently-droppable edge.
                return Err(BuilderError::MissingPackageFromTask {
                    package: task_id.package().to_string(),
                    task_id: task_id.to_string(),
                });
            }

            let task_definition = self.task_definition(&task_id).unwrap_or_default();

            let to_task_index = engine.get_index(&task_id);
            let mut has_deps = false;

            let dep_pkgs = self
                .package_graph
                .immediate_dependencies(&PackageNode::Workspace(PackageName::from(
                    task_id.package(),
                )));

            // `^task` edges: one per workspace dependency that can run the
            // task. Dependencies that don't define it are skipped without
            // comment; that's the normal shape of a partial pipeline.
            for (from, dependency_workspace) in task_definition
                .topological_dependencies
                .iter()
                .cartesian_product(dep_pkgs.iter().flatten())
            {
                let PackageNode::Workspace(dependency_workspace) = dependency_workspace else {
                    continue;
                };
                let from_task_id =
                    TaskId::new(dependency_workspace.as_str(), from.task()).into_owned();
                if !self.is_runnable(&from_task_id) {
                    continue;
                }
                if let Some(allowed) = &allowed_tasks {
                    if !allowed.contains(&from_task_id) {
                        continue;
                    }
                }
                let from_task_index = engine.get_index(&from_task_id);
                engine
                    .task_graph_mut()
                    .add_edge(to_task_index, from_task_index, ());
                has_deps = true;
                traversal_queue.push_back(from_task_id);
            }

            // Plain and `pkg#task` edges.
            for dep in &task_definition.task_dependencies {
                let from_task_id = dep
                    .task_id()
                    .map(|id| id.into_owned())
                    .unwrap_or_else(|| {
                        TaskId::new(task_id.package(), dep.task()).into_owned()
                    });

                let explicit = dep.is_package_task();
                if !explicit && !self.is_runnable(&from_task_id) {
                    // same-package dependency the package doesn't define:
                    // dropped silently
                    continue;
                }
                if explicit {
                    // An explicit `pkg#task` target is a configuration
                    // claim, so a missing package or task is an error
                    // rather than a dropped edge.
                    if from_task_id.package() != ROOT_PKG_NAME
                        && self
                            .package_graph
                            .package_json(&PackageName::from(from_task_id.package()))
                            .is_none()
                    {
                        return Err(BuilderError::MissingPackageFromTask {
                            package: from_task_id.package().to_string(),
                            task_id: from_task_id.to_string(),
                        });
                    }
                    if !self.is_runnable(&from_task_id) {
                        return Err(BuilderError::MissingTaskFromExplicitDependency {
                            task_id: from_task_id.to_string(),
                            dependant: task_id.to_string(),
                        });
                    }
                }
                if let Some(allowed) = &allowed_tasks {
                    if !allowed.contains(&from_task_id) {
                        continue;
                    }
                }
                let from_task_index = engine.get_index(&from_task_id);
                engine
                    .task_graph_mut()
                    .add_edge(to_task_index, from_task_index, ());
                has_deps = true;
                traversal_queue.push_back(from_task_id.clone());
            }

            engine.add_definition(task_id.clone(), task_definition);
            if !has_deps {
                engine.connect_to_root(&task_id);
            }
        }

        graph::validate_graph(engine.task_graph_mut())?;

        Ok(engine.seal())
    }
}
