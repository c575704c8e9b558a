//! `turbo.json` parsing and the resolved task definitions.
//!
//! The root configuration declares the pipeline (task selectors mapped to
//! task definitions) plus workspace-wide hash inputs. A package may carry
//! its own `turbo.json` whose entries replace the root definition for that
//! task wholesale; no field-level merging is attempted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::task_id::{TaskId, TaskName};

pub const CONFIG_FILE: &str = "turbo.json";

/// Directory, relative to each package, that holds the captured log files.
pub const LOG_DIR: &str = ".turbo";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no \"{CONFIG_FILE}\" found at repository root")]
    NoTurboJson,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[clap(rename_all = "kebab-case")]
pub enum OutputLogsMode {
    #[default]
    Full,
    HashOnly,
    NewOnly,
    ErrorsOnly,
    None,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline(BTreeMap<TaskName<'static>, RawTaskDefinition>);

impl std::ops::Deref for Pipeline {
    type Target = BTreeMap<TaskName<'static>, RawTaskDefinition>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Pipeline {
    /// Looks up the most specific entry for a task id: the `pkg#task` key
    /// wins over the plain `task` key.
    pub fn task_definition(&self, task_id: &TaskId) -> Option<&RawTaskDefinition> {
        let qualified = TaskName::from(task_id.to_string().as_str()).into_owned();
        self.0
            .get(&qualified)
            .or_else(|| self.0.get(&task_id.as_task_name().into_owned()))
    }
}

impl FromIterator<(TaskName<'static>, RawTaskDefinition)> for Pipeline {
    fn from_iter<T: IntoIterator<Item = (TaskName<'static>, RawTaskDefinition)>>(iter: T) -> Self {
        Pipeline(iter.into_iter().collect())
    }
}

/// A task definition as written in `turbo.json`, before resolution.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTaskDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_through_env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_logs: Option<OutputLogsMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTurboJson {
    #[serde(rename = "$schema")]
    #[allow(dead_code)]
    schema: Option<String>,
    #[serde(default)]
    global_dependencies: Vec<String>,
    #[serde(default)]
    global_env: Vec<String>,
    global_pass_through_env: Option<Vec<String>>,
    global_cache_key: Option<String>,
    #[serde(default)]
    pipeline: Pipeline,
}

/// The parsed root (or per-package) configuration file.
#[derive(Debug, Default, Clone)]
pub struct TurboJson {
    pub global_deps: Vec<String>,
    pub global_env: Vec<String>,
    pub global_pass_through_env: Option<Vec<String>>,
    pub global_cache_key: Option<String>,
    pub pipeline: Pipeline,
}

impl TurboJson {
    pub fn load(
        repo_root: &AbsoluteSystemPath,
        dir: &AnchoredSystemPath,
    ) -> Result<Option<TurboJson>, Error> {
        let path = repo_root.resolve(dir).join_component(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = path.read_to_string().map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        let raw: RawTurboJson =
            serde_json::from_str(&contents).map_err(|source| Error::Parse {
                path: path.to_string(),
                source,
            })?;
        Ok(Some(TurboJson {
            global_deps: raw.global_dependencies,
            global_env: raw.global_env,
            global_pass_through_env: raw.global_pass_through_env,
            global_cache_key: raw.global_cache_key,
            pipeline: raw.pipeline,
        }))
    }

    pub fn load_root(repo_root: &AbsoluteSystemPath) -> Result<TurboJson, Error> {
        Self::load(repo_root, AnchoredSystemPath::empty())?.ok_or(Error::NoTurboJson)
    }
}

/// Output glob lists split into inclusions and `!`-prefixed exclusions.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TaskOutputs {
    pub inclusions: Vec<String>,
    pub exclusions: Vec<String>,
}

/// A fully resolved task definition attached to a task node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub outputs: TaskOutputs,
    pub cache: bool,

    /// Tasks that must run in this same package before this one.
    pub task_dependencies: Vec<TaskName<'static>>,
    /// Tasks that must run in this package's workspace dependencies
    /// (declared with the `^` prefix).
    pub topological_dependencies: Vec<TaskName<'static>>,

    pub env: Vec<String>,
    pub pass_through_env: Option<Vec<String>>,
    pub inputs: Vec<String>,
    pub output_logs: OutputLogsMode,
    pub persistent: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            outputs: TaskOutputs::default(),
            cache: true,
            task_dependencies: Vec::new(),
            topological_dependencies: Vec::new(),
            env: Vec::new(),
            pass_through_env: None,
            inputs: Vec::new(),
            output_logs: OutputLogsMode::default(),
            persistent: false,
        }
    }
}

const TOPOLOGICAL_PIPELINE_DELIMITER: &str = "^";

impl From<RawTaskDefinition> for TaskDefinition {
    fn from(raw: RawTaskDefinition) -> Self {
        let mut outputs = TaskOutputs::default();
        for glob in raw.outputs.unwrap_or_default() {
            if let Some(exclusion) = glob.strip_prefix('!') {
                outputs.exclusions.push(exclusion.to_string());
            } else {
                outputs.inclusions.push(glob);
            }
        }
        outputs.inclusions.sort();
        outputs.exclusions.sort();

        let mut task_dependencies: Vec<TaskName> = Vec::new();
        let mut topological_dependencies: Vec<TaskName> = Vec::new();
        for dependency in raw.depends_on.unwrap_or_default() {
            if let Some(topo_dependency) =
                dependency.strip_prefix(TOPOLOGICAL_PIPELINE_DELIMITER)
            {
                topological_dependencies.push(TaskName::from(topo_dependency.to_string()));
            } else {
                task_dependencies.push(TaskName::from(dependency));
            }
        }

        task_dependencies.sort();
        topological_dependencies.sort();

        Self {
            outputs,
            cache: raw.cache.unwrap_or(true),
            task_dependencies,
            topological_dependencies,
            env: raw.env.unwrap_or_default(),
            pass_through_env: raw.pass_through_env,
            inputs: raw.inputs.unwrap_or_default(),
            output_logs: raw.output_logs.unwrap_or_default(),
            persistent: raw.persistent.unwrap_or_default(),
        }
    }
}

impl TaskDefinition {
    /// The log file path for a task, relative to its package directory.
    /// `:` is not portable in file names, so it's escaped.
    pub fn workspace_relative_log_file(task_name: &str) -> AnchoredSystemPathBuf {
        let escaped = task_name.replace(':', "$colon$");
        AnchoredSystemPathBuf::from_raw(format!("{LOG_DIR}/turbo-{escaped}.log"))
            .expect("log file path is relative")
    }

    fn sharable_workspace_relative_log_file(task_name: &str) -> String {
        let escaped = task_name.replace(':', "$colon$");
        format!("{LOG_DIR}/turbo-{escaped}.log")
    }

    /// Output globs rebased onto the repository root, with the log file
    /// appended; this is the form the cache and the hasher consume.
    pub fn repo_relative_hashable_outputs(
        &self,
        task_id: &TaskId,
        workspace_dir: &AnchoredSystemPath,
    ) -> TaskOutputs {
        let make_glob_repo_relative = |glob: &str| -> String {
            let mut repo_relative_glob = workspace_dir.to_unix().as_str().to_string();
            if !repo_relative_glob.is_empty() {
                repo_relative_glob.push('/');
            }
            repo_relative_glob.push_str(glob);
            repo_relative_glob
        };

        let mut inclusion_globs: Vec<String> = self
            .outputs
            .inclusions
            .iter()
            .map(|glob| make_glob_repo_relative(glob))
            .collect();
        inclusion_globs.push(make_glob_repo_relative(
            &Self::sharable_workspace_relative_log_file(task_id.task()),
        ));

        let exclusion_globs: Vec<String> = self
            .outputs
            .exclusions
            .iter()
            .map(|glob| make_glob_repo_relative(glob))
            .collect();

        TaskOutputs {
            inclusions: inclusion_globs,
            exclusions: exclusion_globs,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(
        "{}",
        TaskDefinition::default()
        ; "empty task definition"
    )]
    #[test_case(
        r#"{ "persistent": false }"#,
        TaskDefinition::default()
        ; "just persistent"
    )]
    #[test_case(
        r#"{
          "dependsOn": ["^build", "prepare", "cli#compile"],
          "env": ["OS"],
          "passThroughEnv": ["AWS_SECRET_KEY"],
          "outputs": ["dist/**", "!dist/cache/**"],
          "cache": false,
          "inputs": ["src/**"],
          "outputLogs": "new-only",
          "persistent": true
        }"#,
        TaskDefinition {
            outputs: TaskOutputs {
                inclusions: vec!["dist/**".to_string()],
                exclusions: vec!["dist/cache/**".to_string()],
            },
            cache: false,
            task_dependencies: vec![
                TaskName::from("cli#compile"),
                TaskName::from("prepare"),
            ],
            topological_dependencies: vec![TaskName::from("build")],
            env: vec!["OS".to_string()],
            pass_through_env: Some(vec!["AWS_SECRET_KEY".to_string()]),
            inputs: vec!["src/**".to_string()],
            output_logs: OutputLogsMode::NewOnly,
            persistent: true,
        }
        ; "full"
    )]
    fn test_deserialize_task_definition(json: &str, expected: TaskDefinition) {
        let raw: RawTaskDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(TaskDefinition::from(raw), expected);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let result: Result<RawTaskDefinition, _> =
            serde_json::from_str(r#"{ "dependson": ["^build"] }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_escape_log_file() {
        let build_log = TaskDefinition::workspace_relative_log_file("build");
        assert_eq!(build_log.to_unix().as_str(), ".turbo/turbo-build.log");

        let scoped_log = TaskDefinition::workspace_relative_log_file("build:prod");
        assert_eq!(
            scoped_log.to_unix().as_str(),
            ".turbo/turbo-build$colon$prod.log"
        );
    }

    #[test]
    fn test_relative_output_globs() {
        let task_defn = TaskDefinition {
            outputs: TaskOutputs {
                inclusions: vec![".next/**".to_string()],
                exclusions: vec![".next/bad-file".to_string()],
            },
            ..Default::default()
        };

        let task_id = TaskId::new("foo", "build");
        let workspace_dir = AnchoredSystemPathBuf::from_raw("apps/foo").unwrap();

        let relative_outputs =
            task_defn.repo_relative_hashable_outputs(&task_id, &workspace_dir);
        assert_eq!(
            relative_outputs,
            TaskOutputs {
                inclusions: vec![
                    "apps/foo/.next/**".to_string(),
                    "apps/foo/.turbo/turbo-build.log".to_string(),
                ],
                exclusions: vec!["apps/foo/.next/bad-file".to_string()],
            }
        );
    }

    #[test]
    fn test_pipeline_specific_key_wins() {
        let pipeline: Pipeline = serde_json::from_str(
            r#"{
                "build": { "outputs": ["dist/**"] },
                "web#build": { "outputs": ["out/**"] }
            }"#,
        )
        .unwrap();

        let web_build = pipeline
            .task_definition(&TaskId::new("web", "build"))
            .unwrap();
        assert_eq!(web_build.outputs, Some(vec!["out/**".to_string()]));

        let docs_build = pipeline
            .task_definition(&TaskId::new("docs", "build"))
            .unwrap();
        assert_eq!(docs_build.outputs, Some(vec!["dist/**".to_string()]));
    }
}
