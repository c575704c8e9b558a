use std::collections::BTreeMap;

use serde::Serialize;
use turbopath::RelativeUnixPathBuf;

use crate::run::global_hash::GlobalHashableInputs;

/// The global-hash portion of the serialized run summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalHashSummary {
    pub root_key: String,
    pub files: BTreeMap<RelativeUnixPathBuf, String>,
    pub hash_of_external_dependencies: String,
    pub root_pipeline: String,
    pub env_vars: Vec<String>,
    pub passthrough_env_vars: Vec<String>,
}

impl From<&GlobalHashableInputs<'_>> for GlobalHashSummary {
    fn from(inputs: &GlobalHashableInputs) -> Self {
        Self {
            root_key: inputs.global_cache_key.to_string(),
            // sorted map so the serialization is stable
            files: inputs
                .global_file_hash_map
                .iter()
                .map(|(path, hash)| (path.clone(), hash.clone()))
                .collect(),
            hash_of_external_dependencies: inputs.root_external_deps_hash.clone(),
            root_pipeline: inputs.root_pipeline_hash.clone(),
            env_vars: inputs
                .resolved_env_vars
                .as_ref()
                .map(|vars| vars.all.names())
                .unwrap_or_default(),
            passthrough_env_vars: inputs.pass_through_env.to_vec(),
        }
    }
}
