mod builder;
mod dot;
mod execute;

use std::collections::{HashMap, HashSet};

pub use builder::{BuilderError, EngineBuilder};
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
use petgraph::Graph;

use crate::{
    package_graph::{PackageGraph, PackageName},
    task_id::TaskId,
    turbo_json::TaskDefinition,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

impl std::fmt::Display for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task) => task.fmt(f),
        }
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

/// The task graph. Built once per run, then read-only: edges point from a
/// task to the tasks it depends on, with a synthetic root node under
/// every entry point so the walker has a single sink.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId<'static>, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId<'static>, TaskDefinition>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    pub fn add_definition(
        &mut self,
        task_id: TaskId<'static>,
        definition: TaskDefinition,
    ) -> Option<TaskDefinition> {
        self.task_definitions.insert(task_id, definition)
    }

    pub fn task_graph_mut(&mut self) -> &mut Graph<TaskNode, ()> {
        &mut self.task_graph
    }

    // Seals the task graph from being mutated
    pub fn seal(self) -> Engine<Built> {
        let Engine {
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
            ..
        } = self;
        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.task_graph.node_weights()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.tasks().filter_map(|task| match task {
            TaskNode::Task(task_id) => Some(task_id),
            TaskNode::Root => None,
        })
    }

    pub fn task_definition(&self, task_id: &TaskId<'static>) -> Option<&TaskDefinition> {
        self.task_definitions.get(task_id)
    }

    pub fn task_definitions(&self) -> &HashMap<TaskId<'static>, TaskDefinition> {
        &self.task_definitions
    }

    pub fn task_graph(&self) -> &Graph<TaskNode, ()> {
        &self.task_graph
    }

    /// Enforces the executor's preconditions: nothing may depend on a
    /// persistent task (it never exits, so the dependent would never
    /// start), and there must be enough concurrency for every persistent
    /// task to hold a slot at once.
    pub fn validate(
        &self,
        package_graph: &PackageGraph,
        concurrency: u32,
    ) -> Result<(), Vec<ValidateError>> {
        let mut persistent_count = 0;
        let mut validation_errors = Vec::new();

        for node_index in self.task_graph.node_indices() {
            let TaskNode::Task(task_id) = self
                .task_graph
                .node_weight(node_index)
                .expect("graph should contain weight for node index")
            else {
                continue;
            };

            if self
                .task_definitions
                .get(task_id)
                .is_some_and(|task_def| task_def.persistent)
            {
                persistent_count += 1;
            }

            for dep_index in self
                .task_graph
                .neighbors_directed(node_index, petgraph::Direction::Outgoing)
            {
                let TaskNode::Task(dep_id) = self
                    .task_graph
                    .node_weight(dep_index)
                    .expect("index comes from iterating the graph and must be present")
                else {
                    continue;
                };

                let Some(dep_definition) = self.task_definitions.get(dep_id) else {
                    validation_errors.push(ValidateError::MissingTask {
                        task_id: dep_id.to_string(),
                        package_name: dep_id.package().to_string(),
                    });
                    continue;
                };

                // A persistent dependency with no runnable script never
                // actually blocks anyone.
                let has_script = package_graph
                    .package_json(&PackageName::from(dep_id.package()))
                    .is_some_and(|package_json| package_json.scripts.contains_key(dep_id.task()));

                if dep_definition.persistent && has_script {
                    validation_errors.push(ValidateError::DependencyOnPersistentTask {
                        persistent_task: dep_id.to_string(),
                        dependant: task_id.to_string(),
                    });
                }
            }
        }

        if persistent_count >= concurrency {
            validation_errors.push(ValidateError::PersistentTasksExceedConcurrency {
                persistent_count,
                concurrency,
            })
        }

        match validation_errors.is_empty() {
            true => Ok(()),
            false => Err(validation_errors),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("Cannot find task definition for {task_id} in package {package_name}")]
    MissingTask {
        task_id: String,
        package_name: String,
    },
    #[error("\"{persistent_task}\" is a persistent task, \"{dependant}\" cannot depend on it")]
    DependencyOnPersistentTask {
        persistent_task: String,
        dependant: String,
    },
    #[error(
        "You have {persistent_count} persistent tasks, but `turbo` is configured for concurrency \
         of {concurrency}. Set --concurrency to at least {persistent_count}"
    )]
    PersistentTasksExceedConcurrency {
        persistent_count: u32,
        concurrency: u32,
    },
}

#[cfg(test)]
mod test {
    use turbopath::AnchoredSystemPathBuf;

    use super::*;
    use crate::package_graph::PackageJson;

    fn package_graph_with_scripts(scripts: &[(&str, &[&str])]) -> PackageGraph {
        let mut builder = PackageGraph::builder(PackageJson::default());
        for (name, script_names) in scripts {
            builder = builder.with_package(
                *name,
                AnchoredSystemPathBuf::from_raw(format!("packages/{name}")).unwrap(),
                PackageJson {
                    name: Some(name.to_string()),
                    scripts: script_names
                        .iter()
                        .map(|script| (script.to_string(), format!("echo {script}")))
                        .collect(),
                    ..Default::default()
                },
                None,
            );
        }
        builder.build().unwrap()
    }

    fn persistent_definition() -> TaskDefinition {
        TaskDefinition {
            persistent: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_depending_on_persistent_task_is_rejected() {
        let package_graph = package_graph_with_scripts(&[("app", &["build", "dev"])]);

        let mut engine = Engine::new();
        let build = TaskId::new("app", "build").into_owned();
        let dev = TaskId::new("app", "dev").into_owned();
        let build_index = engine.get_index(&build);
        let dev_index = engine.get_index(&dev);
        engine.task_graph_mut().add_edge(build_index, dev_index, ());
        engine.connect_to_root(&dev);
        engine.add_definition(build.clone(), TaskDefinition::default());
        engine.add_definition(dev.clone(), persistent_definition());
        let engine = engine.seal();

        let errors = engine.validate(&package_graph, 10).unwrap_err();
        assert!(errors
            .iter()
            .any(|error| matches!(error, ValidateError::DependencyOnPersistentTask { .. })));
    }

    #[test]
    fn test_persistent_dependency_without_script_is_allowed() {
        // `dev` is persistent in the pipeline, but the package has no
        // `dev` script, so nothing long-running ever blocks `build`
        let package_graph = package_graph_with_scripts(&[("app", &["build"])]);

        let mut engine = Engine::new();
        let build = TaskId::new("app", "build").into_owned();
        let dev = TaskId::new("app", "dev").into_owned();
        let build_index = engine.get_index(&build);
        let dev_index = engine.get_index(&dev);
        engine.task_graph_mut().add_edge(build_index, dev_index, ());
        engine.connect_to_root(&dev);
        engine.add_definition(build.clone(), TaskDefinition::default());
        engine.add_definition(dev.clone(), persistent_definition());
        let engine = engine.seal();

        assert!(engine.validate(&package_graph, 10).is_ok());
    }

    #[test]
    fn test_persistent_tasks_need_enough_concurrency() {
        let package_graph = package_graph_with_scripts(&[("app", &["dev"]), ("web", &["dev"])]);

        let mut engine = Engine::new();
        for package in ["app", "web"] {
            let dev = TaskId::new(package, "dev").into_owned();
            engine.get_index(&dev);
            engine.connect_to_root(&dev);
            engine.add_definition(dev, persistent_definition());
        }
        let engine = engine.seal();

        let errors = engine.validate(&package_graph, 2).unwrap_err();
        assert!(errors.iter().any(|error| matches!(
            error,
            ValidateError::PersistentTasksExceedConcurrency { .. }
        )));

        assert!(engine.validate(&package_graph, 3).is_ok());
    }
}
