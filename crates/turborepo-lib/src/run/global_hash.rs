use std::collections::HashMap;

use tracing::debug;
use turbopath::{AbsoluteSystemPath, RelativeUnixPathBuf};
use turborepo_env::{DetailedMap, EnvironmentVariableMap};
use turborepo_hash::TurboHash;

use crate::{
    cli::EnvMode,
    hash::{GlobalHashable, GLOBAL_CACHE_KEY},
    task_hash,
    turbo_json::TurboJson,
};

/// Files under the repo root that always contribute to the global hash,
/// whether or not they're listed as global dependencies.
const IMPLICIT_GLOBAL_FILES: &[&str] = &["package.json", "turbo.json"];

/// Everything workspace-wide that invalidates caches when it changes.
/// Assembled once per run and folded into every task fingerprint.
#[derive(Default)]
pub struct GlobalHashableInputs<'a> {
    pub global_cache_key: &'a str,
    pub global_file_hash_map: HashMap<RelativeUnixPathBuf, String>,
    pub root_external_deps_hash: String,
    pub root_pipeline_hash: String,
    pub env: &'a [String],
    // Option is only here to allow #[derive(Default)]
    pub resolved_env_vars: Option<DetailedMap>,
    pub pass_through_env: &'a [String],
    pub env_mode: EnvMode,
}

#[allow(clippy::too_many_arguments)]
pub fn get_global_hash_inputs<'a>(
    repo_root: &AbsoluteSystemPath,
    root_external_deps_hash: String,
    root_turbo_json: &'a TurboJson,
    env_at_execution_start: &EnvironmentVariableMap,
    env_mode: EnvMode,
) -> Result<GlobalHashableInputs<'a>, task_hash::Error> {
    let mut global_file_hash_map = HashMap::new();

    // Declared global dependency globs, expanded against the repo root.
    if !root_turbo_json.global_deps.is_empty() {
        let files = turborepo_globwalk::globwalk(
            repo_root,
            &root_turbo_json.global_deps,
            &["node_modules/**".to_string(), ".git/**".to_string()],
            turborepo_globwalk::WalkType::Files,
        )?;
        for file in files {
            let anchored = repo_root.anchor(&file)?;
            let hash = turborepo_hash::hash_file(&file)?;
            global_file_hash_map.insert(anchored.to_unix(), hash);
        }
    }

    for name in IMPLICIT_GLOBAL_FILES {
        let path = repo_root.join_component(name);
        if path.exists() {
            let hash = turborepo_hash::hash_file(&path)?;
            global_file_hash_map.insert(RelativeUnixPathBuf::new(*name)?, hash);
        }
    }

    let resolved_env_vars = {
        let user_env_var_set = env_at_execution_start
            .wildcard_map_from_wildcards_unresolved(&root_turbo_json.global_env)?;

        let mut all_env_var_map = EnvironmentVariableMap::default();
        all_env_var_map.union(&user_env_var_set.inclusions);
        all_env_var_map.difference(&user_env_var_set.exclusions);

        let mut explicit_env_var_map = EnvironmentVariableMap::default();
        explicit_env_var_map.union(&user_env_var_set.inclusions);
        explicit_env_var_map.difference(&user_env_var_set.exclusions);

        DetailedMap {
            all: all_env_var_map.clone(),
            by_source: turborepo_env::BySource {
                explicit: explicit_env_var_map,
                matching: EnvironmentVariableMap::default(),
            },
        }
    };

    // The pipeline's shape is part of the global hash: its serialized
    // form is stable because the map is ordered.
    let root_pipeline_hash = turborepo_hash::hash_bytes(
        serde_json::to_string(&root_turbo_json.pipeline)
            .expect("pipeline is serializable")
            .as_bytes(),
    );

    Ok(GlobalHashableInputs {
        global_cache_key: root_turbo_json
            .global_cache_key
            .as_deref()
            .unwrap_or(GLOBAL_CACHE_KEY),
        global_file_hash_map,
        root_external_deps_hash,
        root_pipeline_hash,
        env: &root_turbo_json.global_env,
        resolved_env_vars: Some(resolved_env_vars),
        pass_through_env: root_turbo_json
            .global_pass_through_env
            .as_deref()
            .unwrap_or_default(),
        env_mode,
    })
}

impl GlobalHashableInputs<'_> {
    pub fn calculate_global_hash_from_inputs(&self) -> String {
        let resolved_env_vars = self
            .resolved_env_vars
            .as_ref()
            .map(|vars| vars.all.to_hashable())
            .unwrap_or_default();

        let hashable = GlobalHashable {
            global_cache_key: self.global_cache_key,
            global_file_hash_map: self.global_file_hash_map.clone(),
            root_external_deps_hash: &self.root_external_deps_hash,
            root_pipeline_hash: &self.root_pipeline_hash,
            env: self.env,
            resolved_env_vars,
            pass_through_env: self.pass_through_env,
            env_mode: self.env_mode,
        };

        let hash = hashable.hash();
        debug!("global hash: {}", hash);
        hash
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use turbopath::AbsoluteSystemPathBuf;

    use super::*;
    use crate::turbo_json::Pipeline;

    fn repo_with_turbo_json(global_deps: &[&str]) -> Result<(tempfile::TempDir, TurboJson)> {
        let dir = tempfile::tempdir()?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        root.join_component("package.json")
            .create_with_contents("{}")?;
        root.join_component("global.css")
            .create_with_contents("body {}")?;
        let turbo_json = TurboJson {
            global_deps: global_deps.iter().map(|s| s.to_string()).collect(),
            pipeline: Pipeline::default(),
            ..Default::default()
        };
        Ok((dir, turbo_json))
    }

    #[test]
    fn test_global_file_change_invalidates_hash() -> Result<()> {
        let (dir, turbo_json) = repo_with_turbo_json(&["global.css"])?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let env = EnvironmentVariableMap::default();

        let before = get_global_hash_inputs(
            &root,
            "root-deps".to_string(),
            &turbo_json,
            &env,
            EnvMode::Infer,
        )?
        .calculate_global_hash_from_inputs();

        root.join_component("global.css")
            .create_with_contents("body { color: red }")?;

        let after = get_global_hash_inputs(
            &root,
            "root-deps".to_string(),
            &turbo_json,
            &env,
            EnvMode::Infer,
        )?
        .calculate_global_hash_from_inputs();

        assert_ne!(before, after);
        Ok(())
    }

    #[test]
    fn test_non_global_file_change_keeps_hash() -> Result<()> {
        let (dir, turbo_json) = repo_with_turbo_json(&["global.css"])?;
        let root = AbsoluteSystemPathBuf::try_from(dir.path())?;
        let env = EnvironmentVariableMap::default();

        let before = get_global_hash_inputs(
            &root,
            "root-deps".to_string(),
            &turbo_json,
            &env,
            EnvMode::Infer,
        )?
        .calculate_global_hash_from_inputs();

        let unrelated = root.join_component("unrelated.txt");
        unrelated.create_with_contents("new file")?;

        let after = get_global_hash_inputs(
            &root,
            "root-deps".to_string(),
            &turbo_json,
            &env,
            EnvMode::Infer,
        )?
        .calculate_global_hash_from_inputs();

        assert_eq!(before, after);
        Ok(())
    }
}
