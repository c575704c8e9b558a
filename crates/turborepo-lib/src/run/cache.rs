//! Task-aware caching semantics on top of the artifact cache: replay on
//! hit, capture on successful build, and at-most-one concurrent build per
//! fingerprint.

use std::{
    collections::HashMap,
    io::Write,
    sync::{Arc, Mutex},
};

use tokio::sync::watch;
use tracing::{debug, warn};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};
use turborepo_cache::{AsyncCache, CacheError, CacheHitMetadata};
use turborepo_ui::{replay_logs, ColorConfig, ColorSelector, PrefixedUI};

use crate::{
    opts::RunCacheOpts,
    task_id::TaskId,
    turbo_json::{OutputLogsMode, TaskDefinition, TaskOutputs},
};

/// What the first resolver of a fingerprint reported; late arrivals react
/// to this instead of executing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlightOutcome {
    /// Still running.
    Pending,
    /// Finished and (when cacheable) stored; a re-fetch will hit.
    Done,
    /// Finished unsuccessfully; nothing was stored.
    Failed,
}

/// Outcome of asking to resolve a fingerprint: either this caller is the
/// one that must run the task, or another in-flight resolution was joined.
pub enum Flight {
    Leader(FlightGuard),
    Follower(FlightOutcome),
}

/// Held by the task that owns a fingerprint's execution. Dropping without
/// `complete` counts as a failure so waiting followers never hang.
pub struct FlightGuard {
    table: Arc<Mutex<HashMap<String, watch::Receiver<FlightOutcome>>>>,
    sender: Option<watch::Sender<FlightOutcome>>,
    hash: String,
}

impl FlightGuard {
    pub fn complete(mut self, outcome: FlightOutcome) {
        if let Some(sender) = self.sender.take() {
            sender.send(outcome).ok();
        }
        self.remove();
    }

    fn remove(&self) {
        self.table
            .lock()
            .expect("single-flight table poisoned")
            .remove(&self.hash);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.send(FlightOutcome::Failed).ok();
            self.remove();
        }
    }
}

pub struct RunCache {
    task_output_logs_override: Option<OutputLogsMode>,
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    repo_root: AbsoluteSystemPathBuf,
    color_selector: ColorSelector,
    color_config: ColorConfig,
    single_flight: Arc<Mutex<HashMap<String, watch::Receiver<FlightOutcome>>>>,
}

impl RunCache {
    pub fn new(
        cache: AsyncCache,
        repo_root: &AbsoluteSystemPath,
        opts: &RunCacheOpts,
        color_selector: ColorSelector,
        color_config: ColorConfig,
    ) -> Self {
        RunCache {
            task_output_logs_override: opts.task_output_logs_override,
            cache,
            reads_disabled: opts.skip_reads,
            writes_disabled: opts.skip_writes,
            repo_root: repo_root.to_owned(),
            color_selector,
            color_config,
            single_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: &TaskDefinition,
        workspace_dir: &AnchoredSystemPath,
        task_id: TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        let log_file_path = self
            .repo_root
            .resolve(workspace_dir)
            .resolve(&TaskDefinition::workspace_relative_log_file(task_id.task()));
        let repo_relative_globs =
            task_definition.repo_relative_hashable_outputs(&task_id, workspace_dir);

        let mut task_output_logs = task_definition.output_logs;
        if let Some(task_output_logs_override) = self.task_output_logs_override {
            task_output_logs = task_output_logs_override;
        }

        let caching_disabled = !task_definition.cache;

        TaskCache {
            expanded_outputs: Vec::new(),
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_owned(),
            task_id,
            task_output_logs,
            caching_disabled,
            log_file_path,
        }
    }

    /// Claims the right to resolve a fingerprint. The first caller becomes
    /// the leader; everyone else waits for the leader's outcome.
    pub async fn begin_flight(&self, hash: &str) -> Flight {
        let receiver = {
            let mut table = self
                .single_flight
                .lock()
                .expect("single-flight table poisoned");
            match table.get(hash) {
                Some(receiver) => Some(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(FlightOutcome::Pending);
                    table.insert(hash.to_string(), receiver);
                    return Flight::Leader(FlightGuard {
                        table: self.single_flight.clone(),
                        sender: Some(sender),
                        hash: hash.to_string(),
                    });
                }
            }
        };

        let mut receiver = receiver.expect("either leader or receiver");
        loop {
            let outcome = *receiver.borrow();
            if outcome != FlightOutcome::Pending {
                return Flight::Follower(outcome);
            }
            if receiver.changed().await.is_err() {
                // Leader dropped without reporting; treat as failed.
                return Flight::Follower(FlightOutcome::Failed);
            }
        }
    }

    /// Waits for queued cache writes, then closes the cache.
    pub async fn shutdown_cache(&self) {
        if let Err(err) = self.cache.shutdown().await {
            debug!("error shutting down cache: {err}");
        }
    }

    pub fn color_selector(&self) -> &ColorSelector {
        &self.color_selector
    }
}

pub struct TaskCache {
    expanded_outputs: Vec<turbopath::AnchoredSystemPathBuf>,
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    task_id: TaskId<'static>,
    task_output_logs: OutputLogsMode,
    caching_disabled: bool,
    log_file_path: AbsoluteSystemPathBuf,
}

impl TaskCache {
    pub fn is_caching_disabled(&self) -> bool {
        self.caching_disabled
    }

    /// True when this task can never produce or consume a cache entry in
    /// this run (cache:false, --force, or --no-cache).
    pub fn bypasses_cache(&self) -> bool {
        self.caching_disabled
            || self.run_cache.reads_disabled
            || self.run_cache.writes_disabled
    }

    pub fn output_logs(&self) -> OutputLogsMode {
        self.task_output_logs
    }

    pub fn log_file_path(&self) -> &AbsoluteSystemPath {
        &self.log_file_path
    }

    pub fn expanded_outputs(&self) -> &[turbopath::AnchoredSystemPathBuf] {
        &self.expanded_outputs
    }

    /// Existence probe used by dry runs; never materializes outputs.
    pub async fn exists(&self) -> Result<Option<CacheHitMetadata>, CacheError> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            return Ok(None);
        }
        self.run_cache.cache.exists(&self.hash).await
    }

    /// Attempts to replay this task from cache. On a hit the artifact is
    /// extracted, the captured log replayed per the output mode, and the
    /// hit metadata returned. A miss (or bypass) prints the corresponding
    /// status line and returns `None`, telling the caller to execute.
    pub async fn restore_outputs<W: Write>(
        &mut self,
        prefixed_ui: &mut PrefixedUI<W>,
    ) -> Result<Option<CacheHitMetadata>, CacheError> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                prefixed_ui.output(format!(
                    "cache bypass, force executing {}",
                    self.hash
                ));
            }
            return Ok(None);
        }

        let cache_status = self
            .run_cache
            .cache
            .fetch(&self.run_cache.repo_root, &self.hash)
            .await?;

        let Some((cache_hit_metadata, restored_files)) = cache_status else {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                prefixed_ui.output(format!("cache miss, executing {}", self.hash));
            }
            return Ok(None);
        };

        self.expanded_outputs = restored_files;

        match self.task_output_logs {
            OutputLogsMode::Full => {
                debug!("log file path: {}", self.log_file_path);
                prefixed_ui.output(format!("cache hit, replaying logs {}", self.hash));
                self.replay_log_file(prefixed_ui)?;
            }
            OutputLogsMode::NewOnly => {
                prefixed_ui.output(format!(
                    "cache hit, suppressing logs {}",
                    self.hash
                ));
            }
            OutputLogsMode::HashOnly => {
                prefixed_ui.output(format!("cache hit, suppressing logs {}", self.hash));
            }
            OutputLogsMode::None | OutputLogsMode::ErrorsOnly => {}
        }

        Ok(Some(cache_hit_metadata))
    }

    pub fn replay_log_file<W: Write>(
        &self,
        prefixed_ui: &mut PrefixedUI<W>,
    ) -> Result<(), CacheError> {
        if self.log_file_path.exists() {
            replay_logs(prefixed_ui.output_prefixed_writer(), &self.log_file_path)
                .map_err(|err| CacheError::IO(std::io::Error::other(err.to_string())))?;
        }
        Ok(())
    }

    /// Replay the log for `errors-only` mode after a failure.
    pub fn on_error<W: Write>(
        &self,
        prefixed_ui: &mut PrefixedUI<W>,
    ) -> Result<(), CacheError> {
        if self.task_output_logs == OutputLogsMode::ErrorsOnly {
            prefixed_ui.output(format!("cache miss, executing {}", self.hash));
            self.replay_log_file(prefixed_ui)?;
        }
        Ok(())
    }

    /// Captures the task's outputs (every file matched by the resolved
    /// output globs, which include the log file) into the cache.
    pub async fn save_outputs(&mut self, duration: u64) -> Result<(), CacheError> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        debug!("caching outputs: outputs: {:?}", &self.repo_relative_globs);

        let files_to_be_cached = turborepo_globwalk::globwalk(
            &self.run_cache.repo_root,
            &self.repo_relative_globs.inclusions,
            &self.repo_relative_globs.exclusions,
            turborepo_globwalk::WalkType::All,
        )
        .map_err(|err| CacheError::IO(std::io::Error::other(err.to_string())))?;

        let mut relative_paths = files_to_be_cached
            .into_iter()
            .map(|path| self.run_cache.repo_root.anchor(&path))
            .collect::<Result<Vec<_>, _>>()?;
        relative_paths.sort();

        self.run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                self.hash.clone(),
                relative_paths.clone(),
                duration,
            )
            .await?;

        self.expanded_outputs = relative_paths;

        Ok(())
    }

    pub async fn begin_flight(&self) -> Flight {
        self.run_cache.begin_flight(&self.hash).await
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn task_id(&self) -> &TaskId<'static> {
        &self.task_id
    }

    /// Builds the status UI for this task: colored prefix, warnings to
    /// stderr.
    pub fn prefixed_ui<W: Write>(&self, out: W, err: W, prefix: &str) -> PrefixedUI<W> {
        let style = self
            .run_cache
            .color_selector
            .prefix_with_color(&self.task_id.to_string(), prefix);
        PrefixedUI::new(self.run_cache.color_config, out, err)
            .with_output_prefix(style.clone())
            .with_warn_prefix(style.clone())
            .with_error_prefix(style)
    }
}

/// Warn-and-continue wrapper for cache write failures; the task itself
/// already succeeded.
pub fn log_save_failure(task_id: &TaskId, err: CacheError) {
    warn!("unable to cache {task_id}: {err}");
}
