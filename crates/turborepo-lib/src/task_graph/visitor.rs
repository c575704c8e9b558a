//! Drives task execution: receives ready tasks from the engine, hashes
//! them, consults the run cache, and spawns the ones that miss. One
//! `ExecContext` future runs per task; the visitor loop itself only does
//! bookkeeping.

use std::{
    io::Write,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use console::StyledObject;
use futures::{stream::FuturesUnordered, StreamExt};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf};
use turborepo_env::EnvironmentVariableMap;
use turborepo_process::{ChildExit, Command, ProcessManager};
use turborepo_ui::{ColorConfig, PrefixedUI, PrefixedWriter};

use crate::{
    cli::{EnvMode, LogPrefix},
    engine::{Engine, ExecutionOptions, Message, StopExecution, TaskNode},
    opts::RunOpts,
    package_graph::{PackageGraph, PackageName},
    run::{
        cache::{Flight, FlightOutcome, RunCache, TaskCache},
        summary::{RunTracker, TaskCacheSummary, TaskSummary, TaskTracker},
    },
    task_hash::TaskHasher,
    task_id::{TaskId, ROOT_PKG_NAME},
    turbo_json::OutputLogsMode,
};

/// How long a child gets between SIGINT and SIGKILL on shutdown.
const CHILD_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Recorded as the command for tasks that exist only through an explicit
/// pipeline entry with no backing script.
const NONEXISTENT_COMMAND: &str = "<NONEXISTENT>";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot find package {package_name} for task {task_id}")]
    MissingPackage {
        package_name: PackageName,
        task_id: TaskId<'static>,
    },
    #[error(
        "root task {task_name} ({command}) looks like it invokes turbo and might cause a loop"
    )]
    RecursiveTurbo { task_name: String, command: String },
    #[error("Could not find definition for task")]
    MissingDefinition,
    #[error("error while executing engine: {0}")]
    Engine(#[from] crate::engine::ExecuteError),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error("error registering task summary: {0}")]
    Summary(#[from] crate::run::summary::Error),
}

/// A task that failed during a run. These accumulate instead of aborting
/// the loop so `--continue` can report them all at the end.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub task_id: String,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl TaskError {
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} exited: {}", self.task_id, self.message)
    }
}

// This holds the whole world
pub struct Visitor<'a> {
    dry: bool,
    global_env_mode: EnvMode,
    manager: ProcessManager,
    run_opts: &'a RunOpts,
    package_graph: Arc<PackageGraph>,
    repo_root: &'a AbsoluteSystemPath,
    run_cache: Arc<RunCache>,
    run_tracker: RunTracker,
    task_hasher: TaskHasher<'a>,
    color_config: ColorConfig,
}

impl<'a> Visitor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        package_graph: Arc<PackageGraph>,
        run_cache: Arc<RunCache>,
        run_tracker: RunTracker,
        task_hasher: TaskHasher<'a>,
        run_opts: &'a RunOpts,
        repo_root: &'a AbsoluteSystemPath,
        manager: ProcessManager,
        color_config: ColorConfig,
    ) -> Self {
        Self {
            dry: false,
            global_env_mode: run_opts.env_mode,
            manager,
            run_opts,
            package_graph,
            repo_root,
            run_cache,
            run_tracker,
            task_hasher,
            color_config,
        }
    }

    pub fn dry_run(&mut self) {
        self.dry = true;
    }

    pub fn run_tracker(self) -> RunTracker {
        self.run_tracker
    }

    #[tracing::instrument(skip_all)]
    pub async fn visit(&self, engine: Arc<Engine>) -> Result<Vec<TaskError>, Error> {
        let concurrency = self.run_opts.concurrency as usize;
        let (node_sender, mut node_stream) = mpsc::channel(concurrency);

        let engine_handle = {
            let engine = engine.clone();
            tokio::spawn(engine.execute(
                ExecutionOptions::new(self.run_opts.parallel, concurrency),
                node_sender,
            ))
        };
        let mut tasks = FuturesUnordered::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        // Tasks that failed, or were skipped because a dependency failed.
        // Dependents of anything in here never start, even under
        // `--continue`.
        let failed_or_skipped: Arc<Mutex<std::collections::HashSet<TaskId<'static>>>> =
            Arc::new(Mutex::new(std::collections::HashSet::new()));

        while let Some(message) = node_stream.recv().await {
            let Message { info, callback } = message;
            let package_name = PackageName::from(info.package());

            let workspace_info = self
                .package_graph
                .package_info(&package_name)
                .ok_or_else(|| Error::MissingPackage {
                    package_name: package_name.clone(),
                    task_id: info.clone(),
                })?;

            let command = workspace_info
                .package_json
                .scripts
                .get(info.task())
                .cloned();

            if let Some(cmd) = &command {
                if info.package() == ROOT_PKG_NAME && turbo_regex().is_match(cmd) {
                    return Err(Error::RecursiveTurbo {
                        task_name: info.to_string(),
                        command: cmd.to_string(),
                    });
                }
            }

            let task_definition = engine
                .task_definition(&info)
                .ok_or(Error::MissingDefinition)?;

            // `infer` resolves per task: a declared pass-through surface
            // implies strict, otherwise loose.
            let task_env_mode = match self.global_env_mode {
                EnvMode::Infer if task_definition.pass_through_env.is_some() => EnvMode::Strict,
                EnvMode::Infer => EnvMode::Loose,
                mode => mode,
            };

            let dependency_set = engine.dependencies(&info).ok_or(Error::MissingDefinition)?;

            // The resolved command participates in the fingerprint, so
            // editing only the script body in the manifest invalidates
            // the task even when its declared inputs don't cover
            // package.json.
            let task_hash = self.task_hasher.calculate_task_hash(
                &info,
                task_definition,
                task_env_mode,
                &self.package_graph,
                dependency_set,
                command.as_deref().unwrap_or(NONEXISTENT_COMMAND),
            )?;

            let mut execution_env = self.task_hasher.env(task_definition, task_env_mode)?;
            // Always last so it can't be overridden by ambient env.
            execution_env.insert("TURBO_HASH".to_owned(), task_hash.clone());

            let task_cache = self.run_cache.task_cache(
                task_definition,
                &workspace_info.package_path,
                info.clone(),
                &task_hash,
            );

            let dependencies = sorted_task_ids(engine.dependencies(&info));
            let dependents = sorted_task_ids(engine.dependents(&info));

            let summary_base = TaskSummary {
                task_id: info.clone(),
                task: info.task().to_string(),
                package: info.package().to_string(),
                hash: task_hash.clone(),
                cache: TaskCacheSummary::cache_miss(),
                command: command.clone().unwrap_or_else(|| NONEXISTENT_COMMAND.to_string()),
                outputs: task_definition.outputs.inclusions.clone(),
                excluded_outputs: task_definition.outputs.exclusions.clone(),
                log_file: task_cache.log_file_path().to_string(),
                expanded_outputs: Vec::new(),
                dependencies,
                dependents,
                resolved_task_definition: task_definition.clone(),
                environment_variables: execution_env.names(),
                execution: None,
            };

            if self.dry {
                let cache_status = task_cache.exists().await.unwrap_or_default();
                let mut summary = summary_base;
                summary.cache = TaskCacheSummary::from(cache_status);
                self.run_tracker.add_task_summary(summary);
                callback.send(Ok(())).ok();
                continue;
            }

            let has_failed_dependency = {
                let set = failed_or_skipped.lock().expect("failure set poisoned");
                summary_base
                    .dependencies
                    .iter()
                    .any(|dep| set.contains(dep))
            };
            if has_failed_dependency {
                failed_or_skipped
                    .lock()
                    .expect("failure set poisoned")
                    .insert(info.into_owned());
                self.run_tracker.add_task_summary(summary_base);
                callback.send(Ok(())).ok();
                continue;
            }

            let Some(command) = command else {
                // A node that exists only through an explicit pipeline
                // entry: nothing to execute, but downstream tasks can
                // still count on the hash existing.
                self.run_tracker.add_task_summary(summary_base);
                callback.send(Ok(())).ok();
                continue;
            };

            let exec_context = ExecContext {
                task_id: info.clone(),
                command,
                package_dir: self.repo_root.resolve(&workspace_info.package_path),
                execution_env,
                manager: self.manager.clone(),
                task_cache,
                continue_on_error: self.run_opts.continue_on_error,
                pretty_prefix: self.prefix_with_color(&info),
                color_config: self.color_config,
                errors: errors.clone(),
                failed_or_skipped: failed_or_skipped.clone(),
                summaries: self.run_tracker.summaries_handle(),
                summary_base,
            };
            let tracker = self.run_tracker.track_task(info.into_owned());

            tasks.push(tokio::spawn(async move {
                exec_context.execute(tracker, callback).await;
            }));
        }

        // Wait for the engine and for all task futures.
        engine_handle.await.expect("engine execution panicked")?;
        while let Some(result) = tasks.next().await {
            result.unwrap_or_else(|e| panic!("task executor panicked: {e}"));
        }

        let errors = Arc::into_inner(errors)
            .expect("only one strong reference to errors should remain")
            .into_inner()
            .expect("mutex poisoned");

        Ok(errors)
    }

    fn prefix(&self, task_id: &TaskId) -> String {
        match self.run_opts.log_prefix {
            LogPrefix::None => String::new(),
            LogPrefix::Task if self.run_opts.single_package => task_id.task().to_string(),
            LogPrefix::Auto | LogPrefix::Task => task_id.to_string(),
        }
    }

    fn prefix_with_color(&self, task_id: &TaskId) -> StyledObject<String> {
        self.run_cache
            .color_selector()
            .prefix_with_color(&task_id.to_string(), &self.prefix(task_id))
    }
}

fn sorted_task_ids(nodes: Option<std::collections::HashSet<&TaskNode>>) -> Vec<TaskId<'static>> {
    let mut ids: Vec<_> = nodes
        .into_iter()
        .flatten()
        .filter_map(|node| match node {
            TaskNode::Root => None,
            TaskNode::Task(task_id) => Some(task_id.clone()),
        })
        .collect();
    ids.sort();
    ids
}

fn turbo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)turbo(?:$|\s)").unwrap())
}

/// Everything one task execution needs, moved into its spawned future.
struct ExecContext {
    task_id: TaskId<'static>,
    command: String,
    package_dir: AbsoluteSystemPathBuf,
    execution_env: EnvironmentVariableMap,
    manager: ProcessManager,
    task_cache: TaskCache,
    continue_on_error: bool,
    pretty_prefix: StyledObject<String>,
    color_config: ColorConfig,
    errors: Arc<Mutex<Vec<TaskError>>>,
    failed_or_skipped: Arc<Mutex<std::collections::HashSet<TaskId<'static>>>>,
    summaries: Arc<Mutex<Vec<TaskSummary>>>,
    summary_base: TaskSummary,
}

impl ExecContext {
    fn mark_failed(&self) {
        self.failed_or_skipped
            .lock()
            .expect("failure set poisoned")
            .insert(self.task_id.clone());
    }
}

enum ExecOutcome {
    /// Ran (or replayed) successfully.
    Success,
    /// The task either failed to spawn or exited non-zero.
    TaskFailed {
        exit_code: Option<i32>,
        message: String,
    },
    /// The run is shutting down; the task did not finish.
    Shutdown,
}

impl ExecContext {
    async fn execute(
        mut self,
        tracker: TaskTracker<()>,
        callback: oneshot::Sender<Result<(), StopExecution>>,
    ) {
        let tracker = tracker.start().await;

        let mut prefixed_ui = PrefixedUI::new(
            self.color_config,
            StdWriter::Out(std::io::stdout()),
            StdWriter::Err(std::io::stderr()),
        )
        .with_output_prefix(self.pretty_prefix.clone())
        .with_warn_prefix(self.pretty_prefix.clone())
        .with_error_prefix(self.pretty_prefix.clone());

        // Single-flight only matters when a cache entry could come out of
        // this execution; bypass modes make followers meaningless.
        let flight = if self.task_cache.bypasses_cache() {
            None
        } else {
            match self.task_cache.begin_flight().await {
                Flight::Leader(guard) => Some(guard),
                Flight::Follower(outcome) => {
                    self.finish_follower(outcome, tracker, callback, &mut prefixed_ui)
                        .await;
                    return;
                }
            }
        };

        // Try to replay from cache before spawning anything.
        match self.task_cache.restore_outputs(&mut prefixed_ui).await {
            Ok(Some(cache_hit)) => {
                let execution = tracker.cached().await;
                if let Some(guard) = flight {
                    guard.complete(FlightOutcome::Done);
                }
                let mut summary = self.summary_base.clone();
                summary.cache = TaskCacheSummary::from(Some(cache_hit));
                summary.expanded_outputs = self.task_cache.expanded_outputs().to_vec();
                summary.execution = Some(execution);
                self.summaries
                    .lock()
                    .expect("summaries poisoned")
                    .push(summary);
                callback.send(Ok(())).ok();
                return;
            }
            Ok(None) => {}
            Err(err) => {
                // Cache problems never fail the task.
                warn!("error fetching from cache: {err}");
            }
        }

        let outcome = self.run_command(&mut prefixed_ui).await;

        match outcome {
            ExecOutcome::Success => {
                let execution = tracker.build_succeeded(0).await;
                if let Some(guard) = flight {
                    guard.complete(FlightOutcome::Done);
                }
                let mut summary = self.summary_base.clone();
                summary.expanded_outputs = self.task_cache.expanded_outputs().to_vec();
                summary.execution = Some(execution);
                self.summaries
                    .lock()
                    .expect("summaries poisoned")
                    .push(summary);
                callback.send(Ok(())).ok();
            }
            ExecOutcome::TaskFailed { exit_code, message } => {
                self.mark_failed();
                let execution = tracker.build_failed(exit_code, &message).await;
                if let Some(guard) = flight {
                    guard.complete(FlightOutcome::Failed);
                }
                let mut summary = self.summary_base.clone();
                summary.execution = Some(execution);
                self.summaries
                    .lock()
                    .expect("summaries poisoned")
                    .push(summary);
                self.errors
                    .lock()
                    .expect("errors poisoned")
                    .push(TaskError {
                        task_id: self.task_id.to_string(),
                        exit_code,
                        message,
                    });
                let result = if self.continue_on_error {
                    Ok(())
                } else {
                    Err(StopExecution)
                };
                callback.send(result).ok();
            }
            ExecOutcome::Shutdown => {
                self.mark_failed();
                let execution = tracker.cancel().await;
                // leave the flight guard to report failure on drop
                drop(flight);
                let mut summary = self.summary_base.clone();
                summary.execution = Some(execution);
                self.summaries
                    .lock()
                    .expect("summaries poisoned")
                    .push(summary);
                // the engine walk is being canceled anyway; don't
                // double-trigger
                callback.send(Ok(())).ok();
            }
        }
    }

    async fn finish_follower<W: Write>(
        &mut self,
        outcome: FlightOutcome,
        tracker: TaskTracker<chrono::DateTime<chrono::Local>>,
        callback: oneshot::Sender<Result<(), StopExecution>>,
        prefixed_ui: &mut PrefixedUI<W>,
    ) {
        match outcome {
            FlightOutcome::Done => {
                // The leader stored the artifact; this fetch is a local
                // hit.
                match self.task_cache.restore_outputs(prefixed_ui).await {
                    Ok(Some(cache_hit)) => {
                        let execution = tracker.cached().await;
                        let mut summary = self.summary_base.clone();
                        summary.cache = TaskCacheSummary::from(Some(cache_hit));
                        summary.expanded_outputs = self.task_cache.expanded_outputs().to_vec();
                        summary.execution = Some(execution);
                        self.summaries
                            .lock()
                            .expect("summaries poisoned")
                            .push(summary);
                        callback.send(Ok(())).ok();
                    }
                    _ => {
                        // the artifact vanished between completion and our
                        // fetch; degrade to a failure rather than racing a
                        // second build
                        self.mark_failed();
                        let message = "task with identical fingerprint produced no artifact"
                            .to_string();
                        let execution = tracker.build_failed(None, &message).await;
                        let mut summary = self.summary_base.clone();
                        summary.execution = Some(execution);
                        self.summaries
                            .lock()
                            .expect("summaries poisoned")
                            .push(summary);
                        self.errors
                            .lock()
                            .expect("errors poisoned")
                            .push(TaskError {
                                task_id: self.task_id.to_string(),
                                exit_code: None,
                                message,
                            });
                        callback
                            .send(if self.continue_on_error {
                                Ok(())
                            } else {
                                Err(StopExecution)
                            })
                            .ok();
                    }
                }
            }
            FlightOutcome::Failed | FlightOutcome::Pending => {
                self.mark_failed();
                let message =
                    "another task with the same fingerprint failed to build".to_string();
                let execution = tracker.build_failed(None, &message).await;
                let mut summary = self.summary_base.clone();
                summary.execution = Some(execution);
                self.summaries
                    .lock()
                    .expect("summaries poisoned")
                    .push(summary);
                self.errors
                    .lock()
                    .expect("errors poisoned")
                    .push(TaskError {
                        task_id: self.task_id.to_string(),
                        exit_code: None,
                        message,
                    });
                callback
                    .send(if self.continue_on_error {
                        Ok(())
                    } else {
                        Err(StopExecution)
                    })
                    .ok();
            }
        }
    }

    /// Spawns the script and streams its output to the log file and,
    /// depending on the output mode, the terminal.
    async fn run_command<W: Write>(&mut self, prefixed_ui: &mut PrefixedUI<W>) -> ExecOutcome {
        let start = std::time::Instant::now();
        let mut cmd = Command::new(shell());
        cmd.args([shell_flag(), self.command.as_str()]);
        cmd.current_dir(self.package_dir.clone());
        cmd.env_clear();
        cmd.envs(self.execution_env.iter());

        let mut child = match self.manager.spawn(cmd, CHILD_GRACE_PERIOD) {
            Some(Ok(child)) => child,
            Some(Err(err)) => {
                return ExecOutcome::TaskFailed {
                    exit_code: None,
                    message: format!("unable to spawn child process: {err}"),
                };
            }
            // the manager is shutting down; no process was started
            None => return ExecOutcome::Shutdown,
        };

        let log_writer = match self.log_writer() {
            Ok(log_writer) => log_writer,
            Err(err) => {
                error!("unable to create log file: {err}");
                return ExecOutcome::TaskFailed {
                    exit_code: None,
                    message: format!("unable to create log file: {err}"),
                };
            }
        };

        let stream_to_terminal = matches!(
            self.task_cache.output_logs(),
            OutputLogsMode::Full | OutputLogsMode::NewOnly
        );

        let mut output = CaptureWriter {
            log: log_writer,
            terminal: stream_to_terminal.then(|| {
                PrefixedWriter::new(
                    self.color_config,
                    self.pretty_prefix.clone(),
                    std::io::stdout(),
                )
            }),
        };

        let exit = match child.wait_with_piped_outputs(&mut output).await {
            Ok(exit) => exit,
            Err(err) => {
                error!("error reading task output: {err}");
                None
            }
        };
        if let Err(err) = output.flush() {
            debug!("error flushing task output: {err}");
        }

        match exit {
            Some(ChildExit::Finished(Some(0))) => {
                if let Err(err) = self
                    .task_cache
                    .save_outputs(start.elapsed().as_millis() as u64)
                    .await
                {
                    // A capture failure doesn't change the task's result.
                    warn!("error caching output: {err}");
                }
                ExecOutcome::Success
            }
            Some(ChildExit::Finished(Some(code))) => {
                let message = format!("command exited ({code})");
                prefixed_ui.error(format!("command finished with error: {message}"));
                if let Err(err) = self.task_cache.on_error(prefixed_ui) {
                    debug!("unable to replay error logs: {err}");
                }
                ExecOutcome::TaskFailed {
                    exit_code: Some(code),
                    message,
                }
            }
            Some(ChildExit::Finished(None)) | Some(ChildExit::Failed) => ExecOutcome::TaskFailed {
                exit_code: None,
                message: "child process exited without a status".to_string(),
            },
            Some(ChildExit::Interrupted)
            | Some(ChildExit::Killed)
            | Some(ChildExit::KilledExternal)
            | None => ExecOutcome::Shutdown,
        }
    }

    fn log_writer(&self) -> std::io::Result<std::io::BufWriter<std::fs::File>> {
        let log_path = self.task_cache.log_file_path();
        log_path.ensure_dir()?;
        let file = std::fs::File::create(log_path.as_std_path())?;
        Ok(std::io::BufWriter::new(file))
    }
}

fn shell() -> &'static str {
    if cfg!(windows) {
        "cmd"
    } else {
        "sh"
    }
}

fn shell_flag() -> &'static str {
    if cfg!(windows) {
        "/C"
    } else {
        "-c"
    }
}

// A tiny enum that lets stdout and stderr share a writer type without
// reaching for Box<dyn Write>.
enum StdWriter {
    Out(std::io::Stdout),
    Err(std::io::Stderr),
}

impl StdWriter {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            StdWriter::Out(out) => out,
            StdWriter::Err(err) => err,
        }
    }
}

impl Write for StdWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer().flush()
    }
}

/// Tees child output: the log file always gets every byte; the terminal
/// only sees it in the streaming output modes.
struct CaptureWriter<T: Write> {
    log: std::io::BufWriter<std::fs::File>,
    terminal: Option<T>,
}

impl<T: Write> Write for CaptureWriter<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.log.write_all(buf)?;
        if let Some(terminal) = &mut self.terminal {
            terminal.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.log.flush()?;
        if let Some(terminal) = &mut self.terminal {
            terminal.flush()?;
        }
        Ok(())
    }
}
