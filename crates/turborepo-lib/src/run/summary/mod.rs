mod execution;
mod global_hash;
mod task;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
pub use execution::{ExecutionTracker, SummaryState, TaskExecutionSummary, TaskTracker};
pub use global_hash::GlobalHashSummary;
use serde::Serialize;
use svix_ksuid::{Ksuid, KsuidLike};
pub use task::{SinglePackageTaskSummary, TaskCacheSummary, TaskSummary};
use thiserror::Error;
use tracing::warn;
use turbopath::AbsoluteSystemPath;
use turborepo_ui::ColorConfig;

use crate::{
    cli::{DryRunMode, EnvMode},
    get_version,
    opts::RunOpts,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to write run summary: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize run summary to JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

// NOTE: When changing the schema, bump this so consumers can tell which
// layout they're reading.
const RUN_SUMMARY_SCHEMA_VERSION: &str = "1";

const RUNS_DIR: &[&str] = &[".turbo", "runs"];

enum RunType {
    Real,
    DryText,
    DryJson,
}

/// The serialized shape of a run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    id: String,
    version: String,
    turbo_version: String,
    monorepo: bool,
    global_hash_summary: GlobalHashSummary,
    packages: Vec<String>,
    env_mode: EnvMode,
    execution_summary: Option<ExecutionSummaryJson>,
    tasks: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionSummaryJson {
    command: String,
    success: usize,
    failed: usize,
    cached: usize,
    attempted: usize,
    start_time: i64,
    end_time: i64,
    exit_code: i32,
}

/// Collects everything the summary needs over the course of a run:
/// the execution counters (via [`ExecutionTracker`]) and the per-task
/// summaries pushed by the visitor as tasks finish.
#[derive(Debug)]
pub struct RunTracker {
    execution_tracker: ExecutionTracker,
    task_summaries: Arc<Mutex<Vec<TaskSummary>>>,
    run_type: RunType,
    should_save: bool,
    synthesized_command: String,
}

impl std::fmt::Debug for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunType::Real => "real",
            RunType::DryText => "dry-text",
            RunType::DryJson => "dry-json",
        })
    }
}

impl RunTracker {
    pub fn new(start_time: DateTime<Local>, run_opts: &RunOpts) -> Self {
        let run_type = match run_opts.dry_run {
            None => RunType::Real,
            Some(DryRunMode::Text) => RunType::DryText,
            Some(DryRunMode::Json) => RunType::DryJson,
        };

        Self {
            execution_tracker: ExecutionTracker::new(start_time),
            task_summaries: Arc::new(Mutex::new(Vec::new())),
            run_type,
            should_save: run_opts.summarize,
            synthesized_command: run_opts.synthesize_command(),
        }
    }

    pub fn track_task(&self, task_id: crate::task_id::TaskId<'static>) -> TaskTracker<()> {
        self.execution_tracker.task_tracker(task_id)
    }

    pub fn add_task_summary(&self, summary: TaskSummary) {
        self.task_summaries
            .lock()
            .expect("task summary mutex poisoned")
            .push(summary);
    }

    /// A handle task futures can push their summaries through.
    pub fn summaries_handle(&self) -> Arc<Mutex<Vec<TaskSummary>>> {
        self.task_summaries.clone()
    }

    pub fn is_dry_run(&self) -> bool {
        !matches!(self.run_type, RunType::Real)
    }

    /// Closes the run: folds the counters, prints the epilogue (or the
    /// dry-run rendering), and writes the summary file when requested.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        self,
        exit_code: i32,
        repo_root: &AbsoluteSystemPath,
        packages: Vec<String>,
        global_hash_summary: GlobalHashSummary,
        global_env_mode: EnvMode,
        run_opts: &RunOpts,
        color_config: ColorConfig,
    ) -> Result<(), Error> {
        let Self {
            execution_tracker,
            task_summaries,
            run_type,
            should_save,
            synthesized_command,
        } = self;

        let start_time = execution_tracker.start_time;
        let state = execution_tracker
            .finish()
            .await
            .unwrap_or_else(|e| panic!("execution tracker panicked: {e}"));
        let end_time = Local::now();

        let mut task_summaries = {
            let mut lock = task_summaries.lock().expect("mutex poisoned");
            std::mem::take(&mut *lock)
        };
        task_summaries.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let single_package = run_opts.single_package;
        let tasks: Vec<serde_json::Value> = task_summaries
            .iter()
            .map(|summary| {
                if single_package {
                    serde_json::to_value(SinglePackageTaskSummary::from(summary.clone()))
                } else {
                    serde_json::to_value(summary.clone())
                }
            })
            .collect::<Result<_, _>>()?;

        let run_summary = RunSummary {
            id: Ksuid::new(None, None).to_string(),
            version: RUN_SUMMARY_SCHEMA_VERSION.to_string(),
            turbo_version: get_version().to_string(),
            monorepo: !single_package,
            global_hash_summary,
            packages: if single_package {
                Vec::new()
            } else {
                packages
            },
            env_mode: global_env_mode,
            execution_summary: Some(ExecutionSummaryJson {
                command: synthesized_command,
                success: state.success,
                failed: state.failed,
                cached: state.cached,
                attempted: state.attempted(),
                start_time: start_time.timestamp_millis(),
                end_time: end_time.timestamp_millis(),
                exit_code,
            }),
            tasks,
        };

        match run_type {
            RunType::DryJson => {
                println!("{}", serde_json::to_string_pretty(&run_summary)?);
            }
            RunType::DryText => {
                print_dry_text(&run_summary);
            }
            RunType::Real => {
                let failed_tasks = task_summaries
                    .iter()
                    .filter(|summary| {
                        summary.execution.as_ref().is_some_and(|execution| {
                            matches!(
                                execution.state,
                                execution::ExecutionState::BuildFailed { .. }
                            )
                        })
                    })
                    .map(|summary| summary.task_id.to_string())
                    .collect();

                execution::print_summary_line(
                    &state,
                    start_time,
                    end_time,
                    color_config,
                    failed_tasks,
                );

                if should_save {
                    if let Err(err) = save_summary(repo_root, &run_summary) {
                        warn!("unable to save run summary: {err}");
                    }
                }

                if let Some(profile_path) = &run_opts.profile {
                    if let Err(err) = save_profile(repo_root, profile_path, &task_summaries) {
                        warn!("unable to write profile: {err}");
                    }
                }
            }
        }

        Ok(())
    }
}

fn print_dry_text(run_summary: &RunSummary) {
    println!();
    println!("Tasks to Run");
    for task in &run_summary.tasks {
        let task_id = task
            .get("taskId")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        let hash = task
            .get("hash")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        let command = task
            .get("command")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        println!("{task_id}");
        println!("  Task    = {command}");
        println!("  Hash    = {hash}");
    }
}

fn save_summary(
    repo_root: &AbsoluteSystemPath,
    run_summary: &RunSummary,
) -> Result<(), Error> {
    let json = serde_json::to_string_pretty(run_summary)?;
    let summary_path = repo_root
        .join_components(RUNS_DIR)
        .join_component(&format!("{}.json", run_summary.id));
    summary_path.ensure_dir()?;
    summary_path.create_with_contents(json)?;
    Ok(())
}

/// Writes per-task timings in the Chrome tracing format so a run can be
/// inspected in a trace viewer.
fn save_profile(
    repo_root: &AbsoluteSystemPath,
    profile_path: &str,
    task_summaries: &[TaskSummary],
) -> Result<(), Error> {
    let events: Vec<serde_json::Value> = task_summaries
        .iter()
        .filter_map(|summary| {
            let execution = summary.execution.as_ref()?;
            Some(serde_json::json!({
                "name": summary.task_id.to_string(),
                "ph": "X",
                "pid": 1,
                "tid": 1,
                "ts": execution.started_at.timestamp_micros(),
                "dur": execution.duration().num_microseconds().unwrap_or_default(),
            }))
        })
        .collect();

    let path = turbopath::AbsoluteSystemPathBuf::from_unknown(repo_root, profile_path);
    path.ensure_dir()?;
    path.create_with_contents(serde_json::to_string(&events)?)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::cli::LogPrefix;

    fn run_opts(summarize: bool, single_package: bool) -> RunOpts {
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
            single_package,
            log_prefix: LogPrefix::Auto,
            summarize,
        }
    }

    fn global_hash_summary() -> GlobalHashSummary {
        GlobalHashSummary {
            root_key: "key".to_string(),
            files: Default::default(),
            hash_of_external_dependencies: "external".to_string(),
            root_pipeline: "pipeline".to_string(),
            env_vars: Vec::new(),
            passthrough_env_vars: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_summary_file_written() -> Result<()> {
        let repo = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(repo.path())?;
        let opts = run_opts(true, false);

        let tracker = RunTracker::new(Local::now(), &opts);
        let task = tracker.track_task(crate::task_id::TaskId::new("a", "build").into_owned());
        let task = task.start().await;
        let execution = task.build_succeeded(0).await;
        tracker.add_task_summary(TaskSummary {
            task_id: crate::task_id::TaskId::new("a", "build").into_owned(),
            task: "build".to_string(),
            package: "a".to_string(),
            hash: "beef".to_string(),
            cache: TaskCacheSummary::cache_miss(),
            command: "echo build".to_string(),
            outputs: Vec::new(),
            excluded_outputs: Vec::new(),
            log_file: "packages/a/.turbo/turbo-build.log".to_string(),
            expanded_outputs: Vec::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            resolved_task_definition: Default::default(),
            environment_variables: Vec::new(),
            execution: Some(execution),
        });

        tracker
            .finish(
                0,
                &repo_root,
                vec!["a".to_string()],
                global_hash_summary(),
                EnvMode::Infer,
                &opts,
                turborepo_ui::ColorConfig::new(true),
            )
            .await?;

        let runs_dir = repo_root.join_components(&[".turbo", "runs"]);
        let entries: Vec<_> = std::fs::read_dir(runs_dir.as_std_path())?
            .map(|entry| entry.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);

        let contents = std::fs::read_to_string(entries[0].path())?;
        let parsed: serde_json::Value = serde_json::from_str(&contents)?;
        assert_eq!(parsed["version"], "1");
        assert_eq!(parsed["executionSummary"]["attempted"], 1);
        assert_eq!(parsed["executionSummary"]["success"], 1);
        assert_eq!(parsed["tasks"][0]["taskId"], "a#build");
        Ok(())
    }

    #[tokio::test]
    async fn test_single_package_drops_workspace_fields() -> Result<()> {
        let repo = tempfile::tempdir()?;
        let repo_root = AbsoluteSystemPathBuf::try_from(repo.path())?;
        let opts = run_opts(true, true);

        let tracker = RunTracker::new(Local::now(), &opts);
        tracker.add_task_summary(TaskSummary {
            task_id: crate::task_id::TaskId::new("//", "build").into_owned(),
            task: "build".to_string(),
            package: "//".to_string(),
            hash: "beef".to_string(),
            cache: TaskCacheSummary::cache_miss(),
            command: "echo build".to_string(),
            outputs: Vec::new(),
            excluded_outputs: Vec::new(),
            log_file: ".turbo/turbo-build.log".to_string(),
            expanded_outputs: Vec::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            resolved_task_definition: Default::default(),
            environment_variables: Vec::new(),
            execution: None,
        });

        tracker
            .finish(
                0,
                &repo_root,
                vec!["//".to_string()],
                global_hash_summary(),
                EnvMode::Infer,
                &opts,
                turborepo_ui::ColorConfig::new(true),
            )
            .await?;

        let runs_dir = repo_root.join_components(&[".turbo", "runs"]);
        let entry = std::fs::read_dir(runs_dir.as_std_path())?
            .next()
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(entry.path())?)?;
        assert_eq!(parsed["monorepo"], false);
        assert_eq!(parsed["packages"], serde_json::json!([]));
        assert_eq!(parsed["tasks"][0]["taskId"], "build");
        assert!(parsed["tasks"][0].get("package").is_none());
        Ok(())
    }
}
