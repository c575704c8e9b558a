//! `process`
//!
//! Spawning and supervision of the child processes that run package
//! scripts. The manager tracks every spawned child so a single stop call
//! (from a signal handler or a failed task under bail) shuts the whole
//! set down, forwarding SIGINT first and escalating to SIGKILL after the
//! configured grace period.

mod child;
mod command;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

pub use child::{Child, ChildExit, ShutdownStyle};
pub use command::Command;
use tokio::task::JoinSet;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct ProcessManager {
    state: Arc<Mutex<ProcessManagerInner>>,
}

#[derive(Debug)]
struct ProcessManagerInner {
    is_closing: bool,
    children: Vec<Child>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProcessManagerInner {
                is_closing: false,
                children: Vec::new(),
            })),
        }
    }

    /// Spawn a new child process running the given command.
    ///
    /// Returns `None` if the manager is already shutting down, in which
    /// case no process was started.
    pub fn spawn(
        &self,
        command: Command,
        stop_timeout: Duration,
    ) -> Option<std::io::Result<Child>> {
        let mut lock = self.state.lock().expect("process manager mutex poisoned");
        if lock.is_closing {
            return None;
        }
        let child = Child::spawn(command, ShutdownStyle::Graceful(stop_timeout));
        if let Ok(child) = &child {
            lock.children.push(child.clone());
        }
        Some(child)
    }

    /// Stop the manager, closing all child processes. On posix systems
    /// children receive a SIGINT and, after the grace period, a SIGKILL.
    pub async fn stop(&self) {
        self.close(|mut child| async move { child.stop().await })
            .await
    }

    /// Stop the manager, waiting for all child processes to exit on their
    /// own.
    pub async fn wait(&self) {
        self.close(|mut child| async move { child.wait().await })
            .await
    }

    async fn close<F, C>(&self, callback: F)
    where
        F: Fn(Child) -> C + Clone + Send + 'static,
        C: std::future::Future<Output = Option<ChildExit>> + Send + 'static,
    {
        let children = {
            let mut lock = self.state.lock().expect("process manager mutex poisoned");
            lock.is_closing = true;
            lock.children.clone()
        };

        let mut set = JoinSet::new();
        for child in children {
            let callback = callback.clone();
            set.spawn(async move { callback(child).await });
        }

        debug!("waiting for {} processes to exit", set.len());

        while let Some(out) = set.join_next().await {
            trace!("process exited: {:?}", out);
        }
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn get_command() -> Command {
        let mut cmd = Command::new("sleep");
        cmd.args(["1"]);
        cmd
    }

    #[tokio::test]
    async fn test_basic() {
        let manager = ProcessManager::new();
        manager
            .spawn(get_command(), Duration::from_secs(2))
            .unwrap()
            .unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_multiple() {
        let manager = ProcessManager::new();

        for _ in 0..3 {
            manager
                .spawn(get_command(), Duration::from_secs(2))
                .unwrap()
                .unwrap();
        }

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_spawn() {
        let manager = ProcessManager::new();
        manager.stop().await;
        assert!(manager
            .spawn(get_command(), Duration::from_secs(2))
            .is_none());
    }
}
