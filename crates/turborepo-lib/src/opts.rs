use camino::Utf8PathBuf;
use thiserror::Error;

use crate::{
    cli::{DryRunMode, EnvMode, LogPrefix, RunArgs},
    turbo_json::OutputLogsMode,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "invalid value for --concurrency CLI flag. This should be a positive integer greater than \
         or equal to 1: {0}"
    )]
    InvalidConcurrency(String),
    #[error(
        "invalid percentage value for --concurrency CLI flag. This should be a percentage of CPU \
         cores, between 1% and 100%: {0}"
    )]
    InvalidConcurrencyPercentage(f64),
}

#[derive(Debug)]
pub struct Opts {
    pub run_opts: RunOpts,
    pub cache_opts: CacheOpts,
    pub runcache_opts: RunCacheOpts,
    pub scope_opts: ScopeOpts,
}

impl TryFrom<&RunArgs> for Opts {
    type Error = Error;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            run_opts: RunOpts::try_from(args)?,
            cache_opts: CacheOpts::from(args),
            runcache_opts: RunCacheOpts::from(args),
            scope_opts: ScopeOpts::from(args),
        })
    }
}

#[derive(Debug, Default)]
pub struct CacheOpts {
    pub override_dir: Option<Utf8PathBuf>,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    pub remote_cache_read_only: bool,
    pub workers: u32,
}

impl From<&RunArgs> for CacheOpts {
    fn from(args: &RunArgs) -> Self {
        CacheOpts {
            override_dir: args.cache_dir.clone(),
            skip_remote: args.no_remote_cache,
            skip_filesystem: args.remote_only,
            remote_cache_read_only: args.remote_cache_read_only,
            workers: args.cache_workers,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunCacheOpts {
    /// `--force`: execute everything, never read the cache.
    pub skip_reads: bool,
    /// `--no-cache`: never store results.
    pub skip_writes: bool,
    pub task_output_logs_override: Option<OutputLogsMode>,
}

impl From<&RunArgs> for RunCacheOpts {
    fn from(args: &RunArgs) -> Self {
        RunCacheOpts {
            skip_reads: args.force,
            skip_writes: args.no_cache,
            task_output_logs_override: args.output_logs,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScopeOpts {
    pub filter_patterns: Vec<String>,
}

impl From<&RunArgs> for ScopeOpts {
    fn from(args: &RunArgs) -> Self {
        ScopeOpts {
            filter_patterns: args.filter.clone(),
        }
    }
}

#[derive(Debug)]
pub struct RunOpts {
    pub tasks: Vec<String>,
    pub concurrency: u32,
    pub parallel: bool,
    pub env_mode: EnvMode,
    pub continue_on_error: bool,
    pub only: bool,
    pub dry_run: Option<DryRunMode>,
    pub graph: Option<String>,
    pub profile: Option<String>,
    pub single_package: bool,
    pub log_prefix: LogPrefix,
    pub summarize: bool,
}

impl RunOpts {
    pub fn synthesize_command(&self) -> String {
        let mut command = format!("turbo run {}", self.tasks.join(" "));
        if self.parallel {
            command.push_str(" --parallel");
        }
        if self.continue_on_error {
            command.push_str(" --continue");
        }
        if self.only {
            command.push_str(" --only");
        }
        command
    }

    pub fn should_redirect_stderr_to_stdout(&self) -> bool {
        // If we're capturing output for caching, interleaving out/err in
        // one stream keeps replay faithful.
        true
    }
}

const DEFAULT_CONCURRENCY: u32 = 10;

impl TryFrom<&RunArgs> for RunOpts {
    type Error = Error;

    fn try_from(args: &RunArgs) -> Result<Self, Self::Error> {
        let concurrency = args
            .concurrency
            .as_deref()
            .map(parse_concurrency)
            .transpose()?
            .unwrap_or(DEFAULT_CONCURRENCY);

        Ok(Self {
            tasks: args.tasks.clone(),
            concurrency,
            parallel: args.parallel,
            env_mode: args.env_mode,
            continue_on_error: args.continue_execution,
            only: args.only,
            dry_run: args.dry_run,
            graph: args.graph.clone(),
            profile: args.profile.clone(),
            single_package: args.single_package,
            log_prefix: args.log_prefix.unwrap_or_default(),
            summarize: args.summarize.unwrap_or(false),
        })
    }
}

fn parse_concurrency(concurrency_raw: &str) -> Result<u32, Error> {
    if let Some(percent) = concurrency_raw.strip_suffix('%') {
        let percent = percent
            .parse::<f64>()
            .map_err(|_| Error::InvalidConcurrency(concurrency_raw.to_string()))?;
        return if percent > 0.0 && percent.is_finite() {
            Ok((num_cpus::get() as f64 * percent / 100.0).max(1.0) as u32)
        } else {
            Err(Error::InvalidConcurrencyPercentage(percent))
        };
    }
    match concurrency_raw.parse::<u32>() {
        Ok(concurrency) if concurrency >= 1 => Ok(concurrency),
        Ok(_) | Err(_) => Err(Error::InvalidConcurrency(concurrency_raw.to_string())),
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("1", Some(1) ; "one")]
    #[test_case("16", Some(16) ; "sixteen")]
    #[test_case("0", None ; "zero is invalid")]
    #[test_case("-3", None ; "negative is invalid")]
    #[test_case("banana", None ; "words are invalid")]
    fn test_parse_concurrency(input: &str, expected: Option<u32>) {
        assert_eq!(parse_concurrency(input).ok(), expected);
    }

    #[test]
    fn test_parse_concurrency_percent() {
        let parsed = parse_concurrency("100%").unwrap();
        assert_eq!(parsed, num_cpus::get() as u32);
        assert!(parse_concurrency("0%").is_err());
        assert!(parse_concurrency("-50%").is_err());
    }

    #[test]
    fn test_synthesized_command() {
        let opts = RunOpts {
            tasks: vec!["build".to_string(), "test".to_string()],
            concurrency: 10,
            parallel: true,
            env_mode: EnvMode::Infer,
            continue_on_error: false,
            only: false,
            dry_run: None,
            graph: None,
            profile: None,
            single_package: false,
            log_prefix: LogPrefix::Auto,
            summarize: false,
        };
        assert_eq!(opts.synthesize_command(), "turbo run build test --parallel");
    }
}
