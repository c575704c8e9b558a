//! Command-line surface. Parsing only; everything downstream consumes the
//! typed [`crate::opts::Opts`] produced from these args.

use std::backtrace::Backtrace;
use std::process;

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::error;
use turbopath::AbsoluteSystemPathBuf;

use crate::{get_version, run::Run, signal::SignalHandler};

/// Exit code used when the run was interrupted by a signal, mirroring the
/// shell convention of 128 + SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;
/// Exit code for configuration and graph construction errors.
pub const EXIT_CONFIG_ERROR: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Run(#[from] crate::run::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[clap(rename_all = "lowercase")]
pub enum EnvMode {
    #[default]
    Infer,
    Loose,
    Strict,
}

impl std::fmt::Display for EnvMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EnvMode::Infer => "infer",
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum DryRunMode {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogPrefix {
    #[default]
    Auto,
    None,
    Task,
}

#[derive(Parser, Debug)]
#[clap(author, version = get_version(), about = "The build system that makes ship happen", long_about = None)]
#[clap(disable_help_subcommand = true)]
pub struct Args {
    /// Override the endpoint for API calls
    #[clap(long, global = true, env = "TURBO_API", value_parser)]
    pub api: Option<String>,
    /// Set the auth token for API calls
    #[clap(long, global = true, env = "TURBO_TOKEN", value_parser)]
    pub token: Option<String>,
    /// Set the team slug for API calls
    #[clap(long, global = true, env = "TURBO_TEAM", value_parser)]
    pub team: Option<String>,
    /// The directory in which to run turbo
    #[clap(long, global = true, value_parser)]
    pub cwd: Option<Utf8PathBuf>,
    /// Verbosity (can be repeated)
    #[clap(short, long, global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run tasks across projects in your monorepo
    Run(Box<RunArgs>),
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Tasks to run
    pub tasks: Vec<String>,
    /// Filter the packages to run tasks in
    #[clap(long, action = ArgAction::Append)]
    pub filter: Vec<String>,
    /// Limit the concurrency of task execution. Accepts a number or a
    /// percentage of logical CPUs (e.g. 50%)
    #[clap(long)]
    pub concurrency: Option<String>,
    /// Execute all tasks in parallel, ignoring the dependency graph
    #[clap(long)]
    pub parallel: bool,
    /// Continue execution when a task fails
    #[clap(long = "continue")]
    pub continue_execution: bool,
    /// Ignore the existing cache for these tasks (still writes new entries)
    #[clap(long, env = "TURBO_FORCE")]
    pub force: bool,
    /// Avoid saving task results to the cache
    #[clap(long)]
    pub no_cache: bool,
    /// Set the level of streamed task output
    #[clap(long, value_enum)]
    pub output_logs: Option<crate::turbo_json::OutputLogsMode>,
    /// Set how task logs are prefixed
    #[clap(long, value_enum)]
    pub log_prefix: Option<LogPrefix>,
    /// Override the local cache directory
    #[clap(long, env = "TURBO_CACHE_DIR")]
    pub cache_dir: Option<Utf8PathBuf>,
    /// Write a Chrome-tracing profile of the run to the given file
    #[clap(long)]
    pub profile: Option<String>,
    /// Number of concurrent cache uploads
    #[clap(long, default_value_t = 10)]
    pub cache_workers: u32,
    /// Only use the remote cache, skipping the filesystem tier
    #[clap(long, env = "TURBO_REMOTE_ONLY")]
    pub remote_only: bool,
    /// Treat remote cache as read-only
    #[clap(long, env = "TURBO_REMOTE_CACHE_READ_ONLY")]
    pub remote_cache_read_only: bool,
    /// Don't read from or write to the remote cache
    #[clap(long)]
    pub no_remote_cache: bool,
    /// Plan the run without executing anything
    #[clap(long = "dry-run", num_args = 0..=1, default_missing_value = "text", value_enum)]
    pub dry_run: Option<DryRunMode>,
    /// Generate a run summary under .turbo/runs
    #[clap(long, env = "TURBO_RUN_SUMMARY", num_args = 0..=1, default_missing_value = "true")]
    pub summarize: Option<bool>,
    /// Emit the task graph in DOT format, to stdout or to a file
    #[clap(long, num_args = 0..=1, default_missing_value = "")]
    pub graph: Option<String>,
    /// Run only the specified tasks, not their dependencies
    #[clap(long)]
    pub only: bool,
    /// Treat the repository as a single package
    #[clap(long)]
    pub single_package: bool,
    /// Environment variable mode for task execution
    #[clap(long, value_enum, default_value_t = EnvMode::Infer)]
    pub env_mode: EnvMode,
}

/// CLI entry point: parse args, stand up the signal handler, run, and
/// translate the outcome into a process exit code.
pub async fn main() -> i32 {
    let args = Args::parse();

    init_tracing(args.verbosity);

    let Some(Command::Run(_)) = &args.command else {
        error!("no command specified, try `turbo run <task>`");
        return EXIT_CONFIG_ERROR;
    };

    let repo_root = match AbsoluteSystemPathBuf::cwd() {
        Ok(invocation_dir) => match &args.cwd {
            Some(cwd) => AbsoluteSystemPathBuf::from_unknown(&invocation_dir, cwd),
            None => invocation_dir,
        },
        Err(err) => {
            error!("invalid working directory: {err}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let handler = SignalHandler::new(crate::signal::signal_stream());

    let run = match Run::new(&args, repo_root) {
        Ok(run) => run,
        Err(err) => {
            error!("{err}");
            return err.exit_code();
        }
    };

    let exit_code = match run.run(&handler).await {
        Ok(exit_code) => {
            if handler.interrupted() {
                EXIT_INTERRUPTED
            } else {
                exit_code
            }
        }
        Err(err) => {
            error!("{err}");
            err.exit_code()
        }
    };

    // Make sure subscribers (cache flush, process shutdown) finish before
    // the process exits.
    handler.close().await;

    exit_code
}

fn init_tracing(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_directive = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Guard against a panic poisoning the terminal: restore the cursor and
/// report where the crash came from.
pub fn panic_handler(panic_info: &std::panic::PanicInfo) {
    let backtrace = Backtrace::capture();
    eprintln!("turbo crashed: {panic_info}\n{backtrace}");
    process::exit(1);
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> RunArgs {
        let args = Args::try_parse_from(args.iter().copied()).unwrap();
        match args.command {
            Some(Command::Run(run_args)) => *run_args,
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_basic_run() {
        let run_args = parse(&["turbo", "run", "build"]);
        assert_eq!(run_args.tasks, vec!["build"]);
        assert!(!run_args.parallel);
    }

    #[test]
    fn test_filters_accumulate() {
        let run_args = parse(&["turbo", "run", "test", "--filter=web", "--filter=!docs"]);
        assert_eq!(run_args.filter, vec!["web", "!docs"]);
    }

    #[test]
    fn test_dry_run_defaults_to_text() {
        let run_args = parse(&["turbo", "run", "build", "--dry-run"]);
        assert_eq!(run_args.dry_run, Some(DryRunMode::Text));

        let run_args = parse(&["turbo", "run", "build", "--dry-run", "json"]);
        assert_eq!(run_args.dry_run, Some(DryRunMode::Json));
    }

    #[test]
    fn test_graph_optional_value() {
        let run_args = parse(&["turbo", "run", "build", "--graph"]);
        assert_eq!(run_args.graph.as_deref(), Some(""));

        let run_args = parse(&["turbo", "run", "build", "--graph", "out.dot"]);
        assert_eq!(run_args.graph.as_deref(), Some("out.dot"));
    }
}
