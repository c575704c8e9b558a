use serde::Serialize;
use turbopath::AnchoredSystemPathBuf;
use turborepo_cache::{CacheHitMetadata, CacheSource};

use super::execution::TaskExecutionSummary;
use crate::{task_id::TaskId, turbo_json::TaskDefinition};

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskCacheSummary {
    // Deprecated, but kept for parity with the JSON consumers
    pub local: bool,
    pub remote: bool,
    pub status: CacheStatus,
    // Present unless a cache miss
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CacheSource>,
    // 0 if a cache miss
    pub time_saved: u64,
}

#[derive(Debug, Serialize, Copy, Clone, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl TaskCacheSummary {
    pub fn cache_miss() -> Self {
        Self {
            local: false,
            remote: false,
            status: CacheStatus::Miss,
            source: None,
            time_saved: 0,
        }
    }
}

impl From<Option<CacheHitMetadata>> for TaskCacheSummary {
    fn from(value: Option<CacheHitMetadata>) -> Self {
        value.map_or_else(
            Self::cache_miss,
            |CacheHitMetadata { source, time_saved }| {
                // These deprecated fields are derived from the hit source;
                // a local hit does not imply the remote cache was even
                // consulted.
                let (local, remote) = match source {
                    CacheSource::Local => (true, false),
                    CacheSource::Remote => (false, true),
                };
                Self {
                    local,
                    remote,
                    status: CacheStatus::Hit,
                    source: Some(source),
                    time_saved,
                }
            },
        )
    }
}

/// One task's entry in the serialized run summary.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId<'static>,
    pub task: String,
    pub package: String,
    pub hash: String,
    pub cache: TaskCacheSummary,
    pub command: String,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub expanded_outputs: Vec<AnchoredSystemPathBuf>,
    pub dependencies: Vec<TaskId<'static>>,
    pub dependents: Vec<TaskId<'static>>,
    pub resolved_task_definition: TaskDefinition,
    pub environment_variables: Vec<String>,
    pub execution: Option<TaskExecutionSummary>,
}

/// The single-package rendering drops workspace qualifiers.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SinglePackageTaskSummary {
    pub task_id: String,
    pub task: String,
    pub hash: String,
    pub cache: TaskCacheSummary,
    pub command: String,
    pub outputs: Vec<String>,
    pub excluded_outputs: Vec<String>,
    pub log_file: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub resolved_task_definition: TaskDefinition,
    pub environment_variables: Vec<String>,
    pub execution: Option<TaskExecutionSummary>,
}

impl From<TaskSummary> for SinglePackageTaskSummary {
    fn from(value: TaskSummary) -> Self {
        let TaskSummary {
            task_id,
            hash,
            cache,
            command,
            outputs,
            excluded_outputs,
            log_file,
            dependencies,
            dependents,
            resolved_task_definition,
            environment_variables,
            execution,
            ..
        } = value;
        Self {
            task_id: task_id.task().to_string(),
            task: task_id.task().to_string(),
            hash,
            cache,
            command,
            outputs,
            excluded_outputs,
            log_file,
            dependencies: dependencies
                .into_iter()
                .map(|dep| dep.task().to_string())
                .collect(),
            dependents: dependents
                .into_iter()
                .map(|dep| dep.task().to_string())
                .collect(),
            resolved_task_definition,
            environment_variables,
            execution,
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case(
        TaskCacheSummary::cache_miss(),
        json!({
            "local": false,
            "remote": false,
            "status": "MISS",
            "timeSaved": 0,
        })
        ; "cache miss"
    )]
    #[test_case(
        TaskCacheSummary::from(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: 6,
        })),
        json!({
            "local": true,
            "remote": false,
            "status": "HIT",
            "source": "LOCAL",
            "timeSaved": 6,
        })
        ; "local cache hit"
    )]
    #[test_case(
        TaskCacheSummary::from(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: 25,
        })),
        json!({
            "local": false,
            "remote": true,
            "status": "HIT",
            "source": "REMOTE",
            "timeSaved": 25,
        })
        ; "remote cache hit"
    )]
    fn test_serialization(value: impl serde::Serialize, expected: serde_json::Value) {
        assert_eq!(serde_json::to_value(value).unwrap(), expected);
    }
}
