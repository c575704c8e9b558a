use std::sync::{Arc, Mutex};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;
use turborepo_graph_utils::Walker;

use super::{Engine, TaskNode};
use crate::task_id::TaskId;

/// A unit of work handed to the visitor, with a callback the visitor uses
/// to report the task's fate back to the scheduler.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

// Type aliases to make changing the data sent to the visitor easier later
type VisitorData = TaskId<'static>;
type VisitorResult = Result<(), StopExecution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    parallel: bool,
    concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Semaphore closed before all tasks finished")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("Engine visitor closed channel before walk finished")]
    Visitor,
}

impl From<mpsc::error::SendError<Message<VisitorData, VisitorResult>>> for ExecuteError {
    fn from(
        _: mpsc::error::SendError<Message<TaskId<'static>, Result<(), StopExecution>>>,
    ) -> Self {
        ExecuteError::Visitor
    }
}

/// Sentinel the visitor returns to stop scheduling. Tasks already running
/// are not interrupted by this; it only prevents new admissions.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

impl Engine {
    /// Walk the task graph, sending ready task ids to the visitor while
    /// honoring the concurrency limit. A visitor callback of
    /// `Err(StopExecution)` cancels the walk: running tasks finish, no new
    /// ones start.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<VisitorData, VisitorResult>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let sema = Arc::new(Semaphore::new(concurrency));
        let mut tasks: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walker, mut nodes) = Walker::new(&self.task_graph).walk();
        let walker = Arc::new(Mutex::new(walker));

        while let Some((node_id, done)) = nodes.recv().await {
            let visitor = visitor.clone();
            let sema = sema.clone();
            let walker = walker.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let TaskNode::Task(task_id) = this
                    .task_graph
                    .node_weight(node_id)
                    .expect("node id should be present")
                else {
                    // The root node has no work attached.
                    if done.send(()).is_err() {
                        debug!("walker callback receiver dropped before the root node finished");
                    }
                    return Ok(());
                };

                // Acquire a concurrency slot unless we're in parallel mode
                let _permit = match parallel {
                    false => Some(sema.acquire().await?),
                    true => None,
                };

                let (message, result) = Message::new(task_id.clone());
                visitor.send(message).await?;

                let outcome = result.await.unwrap_or_else(|_| {
                    // A dropped callback is treated as a completed task.
                    tracing::trace!("visitor dropped callback sender without sending result");
                    Ok(())
                });

                if let Err(StopExecution) = outcome {
                    if walker
                        .lock()
                        .expect("Walker mutex poisoned")
                        .cancel()
                        .is_err()
                    {
                        debug!("unable to cancel graph walk");
                    }
                }
                if done.send(()).is_err() {
                    debug!("walk done receiver dropped before node was finished");
                }
                Ok(())
            }));
        }

        while let Some(res) = tasks.next().await {
            res.expect("unable to join task")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::turbo_json::TaskDefinition;

    fn linear_engine() -> Engine {
        // a#build depends on b#build
        let mut engine = Engine::new();
        let a = TaskId::new("a", "build").into_owned();
        let b = TaskId::new("b", "build").into_owned();
        let a_index = engine.get_index(&a);
        let b_index = engine.get_index(&b);
        engine.task_graph_mut().add_edge(a_index, b_index, ());
        engine.connect_to_root(&b);
        engine.add_definition(a.clone(), TaskDefinition::default());
        engine.add_definition(b.clone(), TaskDefinition::default());
        engine.seal()
    }

    #[tokio::test]
    async fn test_dependency_order() {
        let engine = Arc::new(linear_engine());
        let (tx, mut rx) = mpsc::channel(8);

        let execute = tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), tx));

        let mut visited = Vec::new();
        while let Some(Message { info, callback }) = rx.recv().await {
            visited.push(info.to_string());
            callback.send(Ok(())).unwrap();
        }

        execute.await.unwrap().unwrap();
        assert_eq!(visited, vec!["b#build", "a#build"]);
    }

    #[tokio::test]
    async fn test_stop_execution_prevents_dependents() {
        let engine = Arc::new(linear_engine());
        let (tx, mut rx) = mpsc::channel(8);

        let execute = tokio::spawn(engine.execute(ExecutionOptions::new(false, 2), tx));

        let mut visited = Vec::new();
        while let Some(Message { info, callback }) = rx.recv().await {
            visited.push(info.to_string());
            // fail the first task
            callback.send(Err(StopExecution)).unwrap();
        }

        execute.await.unwrap().unwrap();
        assert_eq!(visited, vec!["b#build"]);
    }

    #[tokio::test]
    async fn test_concurrency_one_serializes() {
        // two independent tasks, concurrency 1: the second message only
        // arrives after the first callback fires
        let mut engine = Engine::new();
        let a = TaskId::new("a", "build").into_owned();
        let b = TaskId::new("b", "build").into_owned();
        engine.get_index(&a);
        engine.get_index(&b);
        engine.connect_to_root(&a);
        engine.connect_to_root(&b);
        engine.add_definition(a.clone(), TaskDefinition::default());
        engine.add_definition(b.clone(), TaskDefinition::default());
        let engine = Arc::new(engine.seal());

        let (tx, mut rx) = mpsc::channel(8);
        let execute = tokio::spawn(engine.execute(ExecutionOptions::new(false, 1), tx));

        let Message { callback, .. } = rx.recv().await.expect("first task should arrive");

        // While the first task holds the only slot, no second task may be
        // admitted.
        let no_second_task =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(no_second_task.is_err(), "second task admitted early");

        callback.send(Ok(())).unwrap();

        let Message { callback, .. } = rx.recv().await.expect("second task should arrive");
        callback.send(Ok(())).unwrap();

        assert!(rx.recv().await.is_none());
        execute.await.unwrap().unwrap();
    }
}
