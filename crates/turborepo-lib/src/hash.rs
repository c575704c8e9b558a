//! hash module
//!
//! The records that feed the fingerprint hasher. Each implements
//! [`TurboHash`] by writing itself into the canonical encoder; the field
//! order here is part of the hash schema, so reordering fields is a
//! cache-busting change (as is bumping `HASH_SCHEMA_VERSION`).

use std::collections::HashMap;

use turbopath::RelativeUnixPathBuf;
use turborepo_hash::{CanonicalEncoder, TurboHash};

use crate::{cli::EnvMode, turbo_json::TaskOutputs};

/// Bumped whenever the layout of the hashed records changes, so stale
/// artifacts from older binaries never collide with new ones.
pub const HASH_SCHEMA_VERSION: &str = "1";

/// Mixed into every global hash. Changing it invalidates every cache
/// entry everywhere, which is exactly the escape hatch it exists to be.
pub const GLOBAL_CACHE_KEY: &str = "I can't see ya, but I know you're here";

pub struct TaskHashable<'a> {
    // hashes
    pub global_hash: &'a str,
    pub task_dependency_hashes: Vec<String>,
    pub hash_of_files: &'a str,
    pub external_deps_hash: String,

    // task
    pub package_dir: RelativeUnixPathBuf,
    pub task: &'a str,
    pub command: &'a str,
    pub outputs: TaskOutputs,
    pub pass_thru_args: &'a [String],

    // env
    pub env: &'a [String],
    pub resolved_env_vars: EnvVarPairs,
    pub pass_thru_env: &'a [String],
    pub env_mode: EnvMode,
}

pub struct GlobalHashable<'a> {
    pub global_cache_key: &'a str,
    pub global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: &'a str,
    pub root_pipeline_hash: &'a str,
    pub env: &'a [String],
    pub resolved_env_vars: EnvVarPairs,
    pub pass_through_env: &'a [String],
    pub env_mode: EnvMode,
}

pub struct Package {
    pub key: String,
    pub version: String,
}

pub struct LockFilePackages(pub Vec<Package>);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileHashes(pub HashMap<RelativeUnixPathBuf, String>);

type EnvVarPairs = Vec<String>;

impl EnvMode {
    fn hash_label(&self) -> &'static str {
        match self {
            EnvMode::Infer => "infer",
            EnvMode::Loose => "loose",
            EnvMode::Strict => "strict",
        }
    }
}

impl TurboHash for TaskOutputs {
    fn encode(&self, enc: &mut CanonicalEncoder) {
        enc.write_str_list(&self.inclusions);
        enc.write_str_list(&self.exclusions);
    }
}

impl TurboHash for LockFilePackages {
    fn encode(&self, enc: &mut CanonicalEncoder) {
        let LockFilePackages(packages) = self;
        let mut pairs: Vec<(&str, &str)> = packages
            .iter()
            .map(|Package { key, version }| (key.as_str(), version.as_str()))
            .collect();
        enc.write_sorted_map(&mut pairs);
    }
}

impl TurboHash for FileHashes {
    fn encode(&self, enc: &mut CanonicalEncoder) {
        let FileHashes(file_hashes) = self;
        let mut pairs: Vec<(&str, &str)> = file_hashes
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect();
        enc.write_sorted_map(&mut pairs);
    }
}

impl TurboHash for TaskHashable<'_> {
    fn encode(&self, enc: &mut CanonicalEncoder) {
        enc.write_str(HASH_SCHEMA_VERSION);
        enc.write_str(self.global_hash);
        enc.write_str_list(&self.task_dependency_hashes);
        enc.write_str(self.hash_of_files);
        enc.write_str(&self.external_deps_hash);
        enc.write_str(self.package_dir.as_str());
        enc.write_str(self.task);
        enc.write_str(self.command);
        self.outputs.encode(enc);
        enc.write_str_list(self.pass_thru_args);
        enc.write_str_list(self.env);
        enc.write_str_list(&self.resolved_env_vars);
        enc.write_str_list(self.pass_thru_env);
        enc.write_str(self.env_mode.hash_label());
    }
}

impl TurboHash for GlobalHashable<'_> {
    fn encode(&self, enc: &mut CanonicalEncoder) {
        enc.write_str(HASH_SCHEMA_VERSION);
        enc.write_str(self.global_cache_key);
        FileHashes(self.global_file_hash_map.clone()).encode(enc);
        enc.write_str(self.root_external_deps_hash);
        enc.write_str(self.root_pipeline_hash);
        enc.write_str_list(self.env);
        enc.write_str_list(&self.resolved_env_vars);
        enc.write_str_list(self.pass_through_env);
        enc.write_str(self.env_mode.hash_label());
    }
}
