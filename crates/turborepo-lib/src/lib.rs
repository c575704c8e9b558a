//! The run engine: task-graph construction, fingerprinting, the two-tier
//! run cache, the bounded-concurrency executor, and the run summary.
//!
//! The crate deliberately has no opinion about how workspaces are
//! discovered or what a lockfile looks like; those collaborators hand
//! their results in through `package_graph` and `scm`.

pub mod cli;
mod engine;
mod hash;
mod opts;
pub mod package_graph;
pub mod run;
pub mod scm;
mod signal;
mod task_graph;
mod task_hash;
pub mod task_id;
pub mod turbo_json;

pub use cli::Args;
pub use engine::{Engine, EngineBuilder};
pub use signal::SignalHandler;

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
