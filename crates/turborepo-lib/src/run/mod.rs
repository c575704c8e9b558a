//! One invocation of `turbo run`: wires the collaborators together and
//! walks the phases in order — workspace model, filter, graph, global
//! hash, input hashing, execution, summary.

pub mod cache;
pub(crate) mod global_hash;
pub mod scope;
pub mod summary;

use std::{
    collections::{HashMap, HashSet},
    io::Write,
    sync::Arc,
};

use chrono::Local;
pub use cache::{RunCache, TaskCache};
use tracing::debug;
use turbopath::AbsoluteSystemPathBuf;
use turborepo_api_client::{APIAuth, APIClient};
use turborepo_cache::AsyncCache;
use turborepo_env::EnvironmentVariableMap;
use turborepo_process::ProcessManager;
use turborepo_ui::{cprint, cprintln, ColorConfig, ColorSelector, BOLD_GREY, GREY};

use crate::{
    cli::{Args, Command, EXIT_CONFIG_ERROR},
    engine::{Engine, EngineBuilder, ValidateError},
    get_version,
    opts::Opts,
    package_graph::{PackageGraph, PackageJson, PackageName},
    run::{global_hash::get_global_hash_inputs, summary::RunTracker},
    scm::SCM,
    signal::{SignalHandler, SignalSubscriber},
    task_graph::{TaskError, Visitor},
    task_hash::{PackageInputsHashes, TaskHasher},
    task_id::TaskName,
    turbo_json::TurboJson,
};

const DEFAULT_API_URL: &str = "https://vercel.com/api";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("run requires a task to execute")]
    NoTasks,
    #[error(transparent)]
    Opts(#[from] crate::opts::Error),
    #[error(transparent)]
    PackageGraph(#[from] crate::package_graph::Error),
    #[error(transparent)]
    TurboJson(#[from] crate::turbo_json::Error),
    #[error(transparent)]
    Scope(#[from] scope::ResolutionError),
    #[error(transparent)]
    Builder(#[from] crate::engine::BuilderError),
    #[error("{0}")]
    EngineValidation(String),
    #[error(transparent)]
    Cache(#[from] turborepo_cache::CacheError),
    #[error(transparent)]
    ApiClient(#[from] turborepo_api_client::Error),
    #[error(transparent)]
    TaskHash(#[from] crate::task_hash::Error),
    #[error(transparent)]
    Visitor(#[from] crate::task_graph::VisitorError),
    #[error(transparent)]
    Summary(#[from] summary::Error),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error("unable to write graph: {0}")]
    GraphOutput(#[from] std::io::Error),
}

impl Error {
    /// Configuration and graph-shape problems exit 2; everything else is
    /// a runtime failure and exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NoTasks
            | Error::Opts(_)
            | Error::TurboJson(_)
            | Error::Scope(_)
            | Error::Builder(_)
            | Error::EngineValidation(_)
            | Error::PackageGraph(_) => EXIT_CONFIG_ERROR,
            _ => 1,
        }
    }
}

pub struct Run {
    processes: ProcessManager,
    opts: Opts,
    repo_root: AbsoluteSystemPathBuf,
    color_config: ColorConfig,
    api_url: String,
    api_auth: Option<APIAuth>,
}

impl Run {
    pub fn new(args: &Args, repo_root: AbsoluteSystemPathBuf) -> Result<Self, Error> {
        let Some(Command::Run(run_args)) = &args.command else {
            return Err(Error::NoTasks);
        };
        if run_args.tasks.is_empty() {
            return Err(Error::NoTasks);
        }
        let opts = Opts::try_from(run_args.as_ref())?;

        let api_auth = args.token.as_ref().map(|token| APIAuth {
            team_id: None,
            token: token.clone(),
            team_slug: args.team.clone(),
        });

        Ok(Self {
            processes: ProcessManager::new(),
            opts,
            repo_root,
            color_config: ColorConfig::infer(),
            api_url: args
                .api
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_auth,
        })
    }

    fn connect_process_manager(&self, signal_subscriber: SignalSubscriber) {
        let manager = self.processes.clone();
        tokio::spawn(async move {
            let _guard = signal_subscriber.listen().await;
            manager.stop().await;
        });
    }

    fn print_run_prelude(&self, filtered_pkgs: &HashSet<PackageName>) {
        let targets_list = self.opts.run_opts.tasks.join(", ");
        if self.opts.run_opts.single_package {
            cprint!(self.color_config, GREY, "{}", "• Running ");
            cprint!(self.color_config, BOLD_GREY, "{}\n", targets_list);
        } else {
            let mut packages = filtered_pkgs
                .iter()
                .map(|workspace_name| workspace_name.to_string())
                .collect::<Vec<String>>();
            packages.sort();
            cprintln!(
                self.color_config,
                GREY,
                "• Packages in scope: {}",
                packages.join(", ")
            );
            cprint!(self.color_config, GREY, "{} ", "• Running");
            cprint!(self.color_config, BOLD_GREY, "{}", targets_list);
            cprint!(self.color_config, GREY, " in {} packages\n", filtered_pkgs.len());
        }

        let use_http_cache = !self.opts.cache_opts.skip_remote && self.api_auth.is_some();
        if use_http_cache {
            cprintln!(self.color_config, GREY, "• Remote caching enabled");
        } else {
            cprintln!(self.color_config, GREY, "• Remote caching disabled");
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&self, signal_handler: &SignalHandler) -> Result<i32, Error> {
        let start_at = Local::now();
        if let Some(subscriber) = signal_handler.subscribe() {
            self.connect_process_manager(subscriber);
        }

        let scm = SCM::new(&self.repo_root);

        let root_package_json =
            PackageJson::load(&self.repo_root.join_component("package.json"))?;
        let root_turbo_json = TurboJson::load_root(&self.repo_root)?;

        let pkg_dep_graph = PackageGraph::builder(root_package_json)
            .with_discovery(&self.repo_root)?
            .build()?;
        debug!(
            "workspace has {} packages",
            pkg_dep_graph.len()
        );

        // Per-package overrides, loaded once up front.
        let workspace_turbo_jsons: HashMap<PackageName, TurboJson> = pkg_dep_graph
            .packages()
            .filter(|(name, _)| !matches!(name, PackageName::Root))
            .filter_map(|(name, info)| {
                TurboJson::load(&self.repo_root, &info.package_path)
                    .transpose()
                    .map(|result| result.map(|turbo_json| (name.clone(), turbo_json)))
            })
            .collect::<Result<_, _>>()?;

        let filtered_pkgs = {
            let (mut filtered_pkgs, is_all_packages) = scope::resolve_packages(
                &self.opts.scope_opts,
                &self.repo_root,
                &pkg_dep_graph,
                &scm,
            )?;

            if is_all_packages {
                for target in self.opts.run_opts.tasks.iter() {
                    let mut task_name = TaskName::from(target.as_str()).into_owned();
                    // A bare task name only reaches the root package when
                    // declared as `//#task`.
                    if !task_name.is_package_task() {
                        task_name = task_name.into_root_task()
                    }

                    if root_turbo_json.pipeline.contains_key(&task_name) {
                        filtered_pkgs.insert(PackageName::Root);
                        break;
                    }
                }
            }

            filtered_pkgs
        };

        let env_at_execution_start = EnvironmentVariableMap::infer();

        let engine = self.build_engine(
            &pkg_dep_graph,
            &root_turbo_json,
            &workspace_turbo_jsons,
            &filtered_pkgs,
        )?;

        if let Some(graph_output) = &self.opts.run_opts.graph {
            if graph_output.is_empty() {
                engine.dot_graph(std::io::stdout())?;
            } else {
                let file = std::fs::File::create(graph_output)?;
                engine.dot_graph(file)?;
            }
            return Ok(0);
        }

        if self.opts.run_opts.dry_run.is_none() {
            self.print_run_prelude(&filtered_pkgs);
        }

        let api_client = match &self.api_auth {
            Some(_) => Some(APIClient::new(&self.api_url, None, get_version())?),
            None => None,
        };

        let cache_opts = turborepo_cache::CacheOpts {
            cache_dir: self
                .opts
                .cache_opts
                .override_dir
                .clone()
                .unwrap_or_else(|| camino::Utf8PathBuf::from(".turbo/cache")),
            remote_cache_read_only: self.opts.cache_opts.remote_cache_read_only,
            skip_remote: self.opts.cache_opts.skip_remote,
            skip_filesystem: self.opts.cache_opts.skip_filesystem,
            workers: self.opts.cache_opts.workers,
            remote_cache_opts: Some(turborepo_cache::RemoteCacheOpts::new(
                self.api_auth
                    .as_ref()
                    .and_then(|auth| auth.team_id.clone()),
                std::env::var("TURBO_REMOTE_CACHE_SIGNATURE_KEY").is_ok(),
            )),
        };

        let async_cache = AsyncCache::new(
            &cache_opts,
            &self.repo_root,
            api_client,
            self.api_auth.clone(),
        )?;

        let root_external_deps_hash = pkg_dep_graph.root_external_deps_hash();
        let global_hash_inputs = get_global_hash_inputs(
            &self.repo_root,
            root_external_deps_hash,
            &root_turbo_json,
            &env_at_execution_start,
            self.opts.run_opts.env_mode,
        )?;
        let global_hash = global_hash_inputs.calculate_global_hash_from_inputs();

        let run_cache = Arc::new(RunCache::new(
            async_cache,
            &self.repo_root,
            &self.opts.runcache_opts,
            ColorSelector::default(),
            self.color_config,
        ));
        if let Some(subscriber) = signal_handler.subscribe() {
            let run_cache = run_cache.clone();
            tokio::spawn(async move {
                let _guard = subscriber.listen().await;
                let spinner = turborepo_ui::start_spinner("...Finishing writing to cache...");
                run_cache.shutdown_cache().await;
                spinner.finish_and_clear();
            });
        }

        let package_inputs_hashes = PackageInputsHashes::calculate_file_hashes(
            &scm,
            engine.tasks(),
            &pkg_dep_graph,
            engine.task_definitions(),
            &self.repo_root,
        )?;

        let task_hasher = TaskHasher::new(
            package_inputs_hashes,
            &self.opts.run_opts,
            &env_at_execution_start,
            &global_hash,
        );

        let run_tracker = RunTracker::new(start_at, &self.opts.run_opts);
        let pkg_dep_graph = Arc::new(pkg_dep_graph);
        let engine = Arc::new(engine);

        let mut visitor = Visitor::new(
            pkg_dep_graph.clone(),
            run_cache.clone(),
            run_tracker,
            task_hasher,
            &self.opts.run_opts,
            &self.repo_root,
            self.processes.clone(),
            self.color_config,
        );

        if self.opts.run_opts.dry_run.is_some() {
            visitor.dry_run();
        }

        // we look for this log line to mark the start of the run in
        // benchmarks, so please don't remove it
        debug!("running visitor");
        let errors = visitor.visit(engine.clone()).await?;

        let exit_code = errors
            .iter()
            .filter_map(TaskError::exit_code)
            .max()
            // We hit some error, it shouldn't be exit code 0
            .unwrap_or(if errors.is_empty() { 0 } else { 1 });

        for err in &errors {
            writeln!(std::io::stderr(), "{err}").ok();
        }

        let mut packages: Vec<String> = filtered_pkgs
            .iter()
            .map(|name| name.to_string())
            .collect();
        packages.sort();

        let global_hash_summary = summary::GlobalHashSummary::from(&global_hash_inputs);
        visitor
            .run_tracker()
            .finish(
                exit_code,
                &self.repo_root,
                packages,
                global_hash_summary,
                self.opts.run_opts.env_mode,
                &self.opts.run_opts,
                self.color_config,
            )
            .await?;

        // Remote-cache writes are awaited before the run ends; failures
        // were already logged by the cache workers.
        run_cache.shutdown_cache().await;

        Ok(exit_code)
    }

    fn build_engine(
        &self,
        pkg_dep_graph: &PackageGraph,
        root_turbo_json: &TurboJson,
        workspace_turbo_jsons: &HashMap<PackageName, TurboJson>,
        filtered_pkgs: &HashSet<PackageName>,
    ) -> Result<Engine, Error> {
        let engine = EngineBuilder::new(pkg_dep_graph, root_turbo_json, workspace_turbo_jsons)
            .with_workspaces(filtered_pkgs.iter().cloned().collect())
            .with_tasks(
                self.opts
                    .run_opts
                    .tasks
                    .iter()
                    .map(|task| TaskName::from(task.as_str()).into_owned()),
            )
            .with_tasks_only(self.opts.run_opts.only)
            .build()?;

        if !self.opts.run_opts.parallel {
            engine
                .validate(pkg_dep_graph, self.opts.run_opts.concurrency)
                .map_err(|errors| {
                    Error::EngineValidation(
                        errors
                            .iter()
                            .map(ValidateError::to_string)
                            .collect::<Vec<_>>()
                            .join("\n"),
                    )
                })?;
        }

        Ok(engine)
    }
}
