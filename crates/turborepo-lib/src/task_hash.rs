//! Task fingerprinting.
//!
//! Each task's fingerprint folds together the global hash, the content
//! hashes of its input files, its dependencies' fingerprints, the
//! package's external dependency hash, and the declared env surface. Two
//! runs over identical bytes with identical declarations produce
//! identical fingerprints; that property is what makes the cache safe.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf, RelativeUnixPathBuf};
use turborepo_env::EnvironmentVariableMap;
use turborepo_hash::TurboHash;

use crate::{
    cli::EnvMode,
    engine::TaskNode,
    hash::{FileHashes, TaskHashable},
    opts::RunOpts,
    package_graph::{PackageGraph, PackageName},
    task_id::TaskId,
    turbo_json::TaskDefinition,
    scm::SCM,
};

/// Hashed as the value of a declared env var that isn't set, keeping
/// "unset" distinct from "set to the empty string".
const UNSET_ENV_SENTINEL: &str = "\u{0}unset";

/// Env vars a strict-mode child still needs to function at all.
const STRICT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "SHELL", "TMPDIR", "SYSTEMROOT"];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing package info for {0}")]
    MissingPackage(String),
    #[error("cannot find hash for {0} in task hash tracker")]
    MissingDependencyTaskHash(String),
    #[error(transparent)]
    Hash(#[from] turborepo_hash::Error),
    #[error(transparent)]
    Scm(#[from] crate::scm::Error),
    #[error(transparent)]
    Env(#[from] turborepo_env::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Walk(#[from] turborepo_globwalk::WalkError),
}

/// The per-task input file hashes, computed for every task in the graph
/// before execution starts.
#[derive(Debug, Default)]
pub struct PackageInputsHashes {
    hashes: HashMap<TaskId<'static>, String>,
    expanded_hashes: HashMap<TaskId<'static>, FileHashes>,
}

impl PackageInputsHashes {
    pub fn calculate_file_hashes<'a>(
        scm: &SCM,
        all_tasks: impl Iterator<Item = &'a TaskNode>,
        package_graph: &PackageGraph,
        task_definitions: &HashMap<TaskId<'static>, TaskDefinition>,
        repo_root: &AbsoluteSystemPath,
    ) -> Result<PackageInputsHashes, Error> {
        let mut hashes = HashMap::new();
        let mut expanded_hashes = HashMap::new();

        for task in all_tasks {
            let TaskNode::Task(task_id) = task else {
                continue;
            };

            let package_name = PackageName::from(task_id.package());
            let package_info = package_graph
                .package_info(&package_name)
                .ok_or_else(|| Error::MissingPackage(task_id.package().to_string()))?;
            let definition = task_definitions
                .get(task_id)
                .cloned()
                .unwrap_or_default();

            let package_dir = repo_root.resolve(&package_info.package_path);

            // Package-relative files to hash: the declared inputs, or the
            // version-control view of the package when inputs are empty.
            let files: Vec<AnchoredSystemPathBuf> = if definition.inputs.is_empty() {
                let mut files =
                    scm.tracked_files(repo_root, &package_info.package_path)?;
                // The manifest always participates, tracked or not.
                let manifest = AnchoredSystemPathBuf::from_raw("package.json")?;
                if package_dir.resolve(&manifest).exists() && !files.contains(&manifest) {
                    files.push(manifest);
                }
                files
            } else {
                let mut inclusions = Vec::new();
                let mut exclusions = Vec::new();
                for glob in &definition.inputs {
                    if let Some(exclusion) = glob.strip_prefix('!') {
                        exclusions.push(exclusion.to_string());
                    } else {
                        inclusions.push(glob.clone());
                    }
                }
                let found = turborepo_globwalk::globwalk(
                    &package_dir,
                    &inclusions,
                    &exclusions,
                    turborepo_globwalk::WalkType::Files,
                )?;
                let mut files = found
                    .into_iter()
                    .map(|path| package_dir.anchor(&path))
                    .collect::<Result<Vec<_>, _>>()?;
                files.sort();
                files
            };

            let mut file_hashes = HashMap::new();
            for file in files {
                let absolute_path = package_dir.resolve(&file);
                let hash = turborepo_hash::hash_file(&absolute_path)?;
                file_hashes.insert(file.to_unix(), hash);
            }

            let file_hashes = FileHashes(file_hashes);
            hashes.insert(task_id.clone(), file_hashes.hash());
            expanded_hashes.insert(task_id.clone(), file_hashes);
        }

        Ok(PackageInputsHashes {
            hashes,
            expanded_hashes,
        })
    }

    pub fn hash_for_task<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a str> {
        self.hashes.get(task_id).map(|s| s.as_str())
    }
}

/// Shared, mutable record of what has been hashed and executed so far.
/// Dependent tasks read their dependencies' hashes out of it, and the run
/// summary drains it at the end.
#[derive(Debug, Default, Clone)]
pub struct TaskHashTracker {
    state: std::sync::Arc<std::sync::Mutex<TaskHashTrackerState>>,
}

#[derive(Debug, Default)]
pub struct TaskHashTrackerState {
    package_task_hashes: HashMap<TaskId<'static>, String>,
    package_task_outputs: HashMap<TaskId<'static>, Vec<AnchoredSystemPathBuf>>,
    package_task_cache: HashMap<TaskId<'static>, Option<turborepo_cache::CacheHitMetadata>>,
    package_task_inputs: HashMap<TaskId<'static>, FileHashes>,
}

impl TaskHashTracker {
    pub fn hash(&self, task_id: &TaskId) -> Option<String> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_hashes.get(task_id).cloned()
    }

    fn insert_hash(&self, task_id: TaskId<'static>, hash: String, inputs: FileHashes) {
        let mut state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_hashes.insert(task_id.clone(), hash);
        state.package_task_inputs.insert(task_id, inputs);
    }

    pub fn insert_expanded_outputs(
        &self,
        task_id: TaskId<'static>,
        outputs: Vec<AnchoredSystemPathBuf>,
    ) {
        let mut state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_outputs.insert(task_id, outputs);
    }

    pub fn expanded_outputs(&self, task_id: &TaskId) -> Option<Vec<AnchoredSystemPathBuf>> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_outputs.get(task_id).cloned()
    }

    pub fn insert_cache_status(
        &self,
        task_id: TaskId<'static>,
        cache_status: Option<turborepo_cache::CacheHitMetadata>,
    ) {
        let mut state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_cache.insert(task_id, cache_status);
    }

    pub fn cache_status(&self, task_id: &TaskId) -> Option<turborepo_cache::CacheHitMetadata> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_cache.get(task_id).copied().flatten()
    }

    pub fn expanded_inputs(&self, task_id: &TaskId) -> Option<FileHashes> {
        let state = self.state.lock().expect("hash tracker mutex poisoned");
        state.package_task_inputs.get(task_id).cloned()
    }
}

pub struct TaskHasher<'a> {
    package_inputs_hashes: PackageInputsHashes,
    run_opts: &'a RunOpts,
    env_at_execution_start: &'a EnvironmentVariableMap,
    global_hash: &'a str,
    task_hash_tracker: TaskHashTracker,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        package_inputs_hashes: PackageInputsHashes,
        run_opts: &'a RunOpts,
        env_at_execution_start: &'a EnvironmentVariableMap,
        global_hash: &'a str,
    ) -> Self {
        Self {
            package_inputs_hashes,
            run_opts,
            env_at_execution_start,
            global_hash,
            task_hash_tracker: TaskHashTracker::default(),
        }
    }

    pub fn calculate_task_hash(
        &self,
        task_id: &TaskId<'static>,
        task_definition: &TaskDefinition,
        task_env_mode: EnvMode,
        package_graph: &PackageGraph,
        dependency_set: HashSet<&TaskNode>,
        command: &str,
    ) -> Result<String, Error> {
        let package_name = PackageName::from(task_id.package());
        let package_info = package_graph
            .package_info(&package_name)
            .ok_or_else(|| Error::MissingPackage(task_id.package().to_string()))?;

        let hash_of_files = self
            .package_inputs_hashes
            .hash_for_task(task_id)
            .unwrap_or_default();

        // Dependency fingerprints are folded in sorted so the set's
        // iteration order never shows up in the hash.
        let mut task_dependency_hashes = dependency_set
            .into_iter()
            .filter_map(|node| match node {
                TaskNode::Root => None,
                TaskNode::Task(dep_id) => Some(
                    self.task_hash_tracker
                        .hash(dep_id)
                        .ok_or_else(|| Error::MissingDependencyTaskHash(dep_id.to_string())),
                ),
            })
            .collect::<Result<Vec<_>, _>>()?;
        task_dependency_hashes.sort();

        let resolved_env_vars = self.resolve_declared_env(&task_definition.env)?;

        let outputs =
            task_definition.repo_relative_hashable_outputs(task_id, &package_info.package_path);

        let task_hashable = TaskHashable {
            global_hash: self.global_hash,
            task_dependency_hashes,
            hash_of_files,
            external_deps_hash: package_info.external_deps_hash.clone(),
            package_dir: package_info.package_path.to_unix(),
            task: task_id.task(),
            command,
            outputs,
            pass_thru_args: &[],
            env: &task_definition.env,
            resolved_env_vars,
            pass_thru_env: task_definition
                .pass_through_env
                .as_deref()
                .unwrap_or_default(),
            env_mode: task_env_mode,
        };

        let task_hash = task_hashable.hash();
        debug!("task {} hash is {}", task_id, task_hash);

        let expanded_inputs = self
            .package_inputs_hashes
            .expanded_hashes
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        self.task_hash_tracker
            .insert_hash(task_id.clone(), task_hash.clone(), expanded_inputs);

        Ok(task_hash)
    }

    /// Sorted `k=v` pairs for the declared env allowlist. Wildcards
    /// contribute whatever matches; exact names that are absent from the
    /// environment contribute the unset sentinel.
    fn resolve_declared_env(&self, declared: &[String]) -> Result<Vec<String>, Error> {
        let matched = self.env_at_execution_start.from_wildcards(declared)?;
        let mut pairs = matched.to_hashable();
        for name in declared {
            if !name.contains('*') && !matched.contains_key(name) {
                pairs.push(format!("{name}={UNSET_ENV_SENTINEL}"));
            }
        }
        pairs.sort();
        Ok(pairs)
    }

    /// The environment the child process actually receives.
    pub fn env(
        &self,
        task_definition: &TaskDefinition,
        task_env_mode: EnvMode,
    ) -> Result<EnvironmentVariableMap, Error> {
        match task_env_mode {
            EnvMode::Strict => {
                let mut patterns: Vec<String> = task_definition.env.clone();
                patterns.extend(
                    task_definition
                        .pass_through_env
                        .iter()
                        .flatten()
                        .cloned(),
                );
                patterns.extend(STRICT_ENV_ALLOWLIST.iter().map(|name| name.to_string()));
                Ok(self.env_at_execution_start.from_wildcards(&patterns)?)
            }
            // Loose (and infer without a pass-through declaration) hands
            // the full ambient environment to the child.
            EnvMode::Loose | EnvMode::Infer => Ok(self.env_at_execution_start.clone()),
        }
    }

    pub fn task_hash_tracker(&self) -> TaskHashTracker {
        self.task_hash_tracker.clone()
    }

    pub fn run_opts(&self) -> &RunOpts {
        self.run_opts
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use turbopath::AnchoredSystemPathBuf;

    use super::*;
    use crate::package_graph::{PackageGraph, PackageJson};

    fn test_package_graph() -> PackageGraph {
        PackageGraph::builder(PackageJson::default())
            .with_package(
                "a",
                AnchoredSystemPathBuf::from_raw("packages/a").unwrap(),
                PackageJson {
                    name: Some("a".to_string()),
                    ..Default::default()
                },
                None,
            )
            .build()
            .unwrap()
    }

    fn run_opts() -> RunOpts {
        RunOpts {
            tasks: vec!["build".to_string()],
            concurrency: 10,
            parallel: false,
            env_mode: EnvMode::Infer,
            continue_on_error: false,
            only: false,
            dry_run: None,
            graph: None,
            profile: None,
            single_package: false,
            log_prefix: crate::cli::LogPrefix::Auto,
            summarize: false,
        }
    }

    fn env(pairs: &[(&str, &str)]) -> EnvironmentVariableMap {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvironmentVariableMap::from(map)
    }

    fn hash_task(
        ambient: &EnvironmentVariableMap,
        definition: &TaskDefinition,
        command: &str,
    ) -> String {
        let package_graph = test_package_graph();
        let opts = run_opts();
        let hasher = TaskHasher::new(PackageInputsHashes::default(), &opts, ambient, "global");
        hasher
            .calculate_task_hash(
                &TaskId::new("a", "build").into_owned(),
                definition,
                EnvMode::Infer,
                &package_graph,
                HashSet::new(),
                command,
            )
            .unwrap()
    }

    fn hash_with_env(ambient: &EnvironmentVariableMap, definition: &TaskDefinition) -> String {
        hash_task(ambient, definition, "tsc --build")
    }

    #[test]
    fn test_declared_env_value_changes_hash() {
        let definition = TaskDefinition {
            env: vec!["NODE_ENV".to_string()],
            ..Default::default()
        };
        let first = hash_with_env(&env(&[("NODE_ENV", "production")]), &definition);
        let second = hash_with_env(&env(&[("NODE_ENV", "development")]), &definition);
        assert_ne!(first, second);
    }

    #[test]
    fn test_unset_env_distinct_from_empty() {
        let definition = TaskDefinition {
            env: vec!["NODE_ENV".to_string()],
            ..Default::default()
        };
        let unset = hash_with_env(&env(&[]), &definition);
        let empty = hash_with_env(&env(&[("NODE_ENV", "")]), &definition);
        assert_ne!(unset, empty);
    }

    #[test]
    fn test_passthrough_value_does_not_change_hash() {
        let definition = TaskDefinition {
            pass_through_env: Some(vec!["AWS_SECRET".to_string()]),
            ..Default::default()
        };
        let first = hash_with_env(&env(&[("AWS_SECRET", "one")]), &definition);
        let second = hash_with_env(&env(&[("AWS_SECRET", "two")]), &definition);
        assert_eq!(first, second);
    }

    #[test]
    fn test_undeclared_env_does_not_change_hash() {
        let definition = TaskDefinition::default();
        let first = hash_with_env(&env(&[("RANDOM_VAR", "one")]), &definition);
        let second = hash_with_env(&env(&[("RANDOM_VAR", "two")]), &definition);
        assert_eq!(first, second);
    }

    #[test]
    fn test_command_change_invalidates_hash() {
        // editing only the script body must miss the cache, even when the
        // declared inputs don't cover the manifest
        let definition = TaskDefinition {
            inputs: vec!["src/**".to_string()],
            ..Default::default()
        };
        let ambient = env(&[]);
        let first = hash_task(&ambient, &definition, "tsc --build");
        let second = hash_task(&ambient, &definition, "tsc --build --force");
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_dependency_hash_errors() {
        let package_graph = test_package_graph();
        let opts = run_opts();
        let ambient = env(&[]);
        let hasher = TaskHasher::new(PackageInputsHashes::default(), &opts, &ambient, "global");

        let dep = TaskNode::Task(TaskId::new("a", "prepare").into_owned());
        let result = hasher.calculate_task_hash(
            &TaskId::new("a", "build").into_owned(),
            &TaskDefinition::default(),
            EnvMode::Infer,
            &package_graph,
            [&dep].into_iter().collect(),
            "tsc --build",
        );
        assert!(matches!(result, Err(Error::MissingDependencyTaskHash(_))));
    }

    #[test]
    fn test_strict_env_filters() {
        let opts = run_opts();
        let ambient = env(&[("NODE_ENV", "production"), ("RANDOM", "junk"), ("PATH", "/bin")]);
        let hasher = TaskHasher::new(PackageInputsHashes::default(), &opts, &ambient, "global");

        let definition = TaskDefinition {
            env: vec!["NODE_ENV".to_string()],
            ..Default::default()
        };
        let strict_env = hasher.env(&definition, EnvMode::Strict).unwrap();
        assert!(strict_env.contains_key("NODE_ENV"));
        assert!(strict_env.contains_key("PATH"));
        assert!(!strict_env.contains_key("RANDOM"));

        let loose_env = hasher.env(&definition, EnvMode::Loose).unwrap();
        assert!(loose_env.contains_key("RANDOM"));
    }
}
