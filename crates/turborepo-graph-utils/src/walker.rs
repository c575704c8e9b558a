use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
};

use futures::{stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, trace};

/// Emits graph nodes once every node they depend on has been marked done.
///
/// One supervisor task owns the schedule: it keeps a remaining-dependency
/// count per node, seeds the ready queue with the in-degree-zero nodes,
/// and hands each ready node to the caller along with a oneshot used to
/// mark it finished. Every completion decrements the counts of the
/// finished node's dependents and enqueues the ones that reach zero.
/// Cancellation is a watch channel the supervisor checks between
/// completions: nothing new is admitted, but nodes already handed out are
/// still waited on.
pub struct Walker<N, S> {
    marker: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    node_events: Option<mpsc::Receiver<WalkMessage<N>>>,
    supervisor: Option<JoinHandle<()>>,
}

pub struct Start;
pub struct Walking;

pub type WalkMessage<N> = (N, oneshot::Sender<()>);

// These constraints might look stiff, but all petgraph node ids are
// Copy + Eq integers, so Hash + Send + 'static are not unreasonable asks.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Start> {
    /// Create a walker for a DAG. The graph must not be mutated after the
    /// walker is built; emitted ids could otherwise dangle.
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, mut cancel_rx) = watch::channel(false);

        // dependency_counts[n] = distinct unfinished dependencies of n;
        // dependents[d] = the nodes whose counts drop when d finishes.
        // Duplicate edges are collapsed so a count can never underflow.
        let mut dependency_counts: HashMap<N, usize> = HashMap::new();
        let mut dependents: HashMap<N, Vec<N>> = HashMap::new();
        let mut order: Vec<N> = Vec::new();
        for node in graph.node_identifiers() {
            order.push(node);
            let deps: HashSet<N> = graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect();
            dependency_counts.insert(node, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        // At most order.len() nodes get emitted, so sends never block.
        // The buffer must be at least 1 or mpsc::channel panics.
        let (node_tx, node_rx) = mpsc::channel(std::cmp::max(order.len(), 1));

        let supervisor = tokio::spawn(async move {
            let mut ready: VecDeque<N> = order
                .iter()
                .copied()
                .filter(|node| dependency_counts[node] == 0)
                .collect();
            let mut in_flight = FuturesUnordered::new();

            loop {
                while let Some(node) = ready.pop_front() {
                    let (done_tx, done_rx) = oneshot::channel::<()>();
                    if node_tx.send((node, done_tx)).await.is_err() {
                        // The receiving end was dropped without cancel;
                        // nothing can mark nodes done anymore.
                        trace!("walk receiver dropped before the walk finished");
                        return;
                    }
                    in_flight.push(async move {
                        // A dropped callback counts as completion.
                        done_rx.await.ok();
                        node
                    });
                }

                if in_flight.is_empty() {
                    break;
                }

                tokio::select! {
                    // Prefer the cancel when it races a completion, so we
                    // never admit another node past the cancellation.
                    biased;
                    _ = cancel_rx.changed() => {
                        debug!("walk canceled, waiting for in-flight nodes");
                        while in_flight.next().await.is_some() {}
                        return;
                    }
                    Some(node) = in_flight.next() => {
                        for dependent in dependents.get(&node).into_iter().flatten() {
                            let count = dependency_counts
                                .get_mut(dependent)
                                .expect("all nodes have a dependency count");
                            *count -= 1;
                            if *count == 0 {
                                ready.push_back(*dependent);
                            }
                        }
                    }
                }
            }
        });

        Self {
            marker: std::marker::PhantomData,
            cancel,
            node_events: Some(node_rx),
            supervisor: Some(supervisor),
        }
    }

    /// Start the walk, returning a channel that yields nodes whose
    /// dependencies have all finished. The caller owns marking each node
    /// done through the provided oneshot.
    pub fn walk(self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            cancel,
            mut node_events,
            supervisor,
            ..
        } = self;
        let node_events = node_events
            .take()
            .expect("walking graph with walker that has already been used");
        (
            Walker {
                marker: std::marker::PhantomData,
                cancel,
                node_events: None,
                supervisor,
            },
            node_events,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Cancel the walk. Nodes already handed out still get waited on;
    /// nothing new becomes ready afterwards.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for the supervisor to stop. Used after a cancel to make the
    /// shutdown deterministic.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        if let Some(supervisor) = self.supervisor {
            supervisor.await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn test_ordering() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (mut walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            // Cancel after the first node
            walker.cancel().unwrap();

            visited.push(index);
            done.send(()).unwrap();
        }
        assert_eq!(visited, vec![c]);
        // After a cancel the supervisor must still terminate
        walker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_edges_complete_once() {
        // Two parallel edges a -> b must not leave a's count stuck above
        // zero after b finishes once.
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_edge(a, b, ());
        g.add_edge(a, b, ());

        let walker = Walker::new(&g);
        let mut visited = Vec::new();
        let (walker, mut node_emitter) = walker.walk();
        while let Some((index, done)) = node_emitter.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![b, a]);
    }

    #[tokio::test]
    async fn test_dependencies_block_dependents() {
        // a -- b -- c
        //   \
        //    - d -- e
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        let e = g.add_node("e");
        g.add_edge(a, b, ());
        g.add_edge(a, d, ());
        g.add_edge(b, c, ());
        g.add_edge(d, e, ());

        // Hold e's completion until b is finished to pin the order down.
        let walker = Walker::new(&g);
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (walker, mut node_emitter) = walker.walk();
        let (b_done, is_b_done) = oneshot::channel::<()>();
        let mut b_done = Some(b_done);
        let mut is_b_done = Some(is_b_done);
        while let Some((index, done)) = node_emitter.recv().await {
            if index == e {
                let is_b_done = is_b_done.take().unwrap();
                let visited = visited.clone();
                tokio::spawn(async move {
                    is_b_done.await.unwrap();
                    visited.lock().unwrap().push(index);
                    done.send(()).unwrap();
                });
            } else if index == b {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
                b_done.take().unwrap().send(()).unwrap();
            } else {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.lock().unwrap().as_slice(), &[c, b, e, d, a]);
    }
}
