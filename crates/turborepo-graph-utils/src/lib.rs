//! Additional utilities to be used with `petgraph`: cycle detection over
//! task graphs and a dependency-ordered concurrent walker.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, Reversed},
};
use thiserror::Error;

pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n\t{cycle_line}")]
    CyclicDependencies { cycle_line: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

pub fn transitive_closure<N: Hash + Eq + PartialEq, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, ()>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();

    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

/// Checks the graph for cycles and self-dependencies.
///
/// Cycle detection is an iterative DFS with the usual gray/black coloring:
/// hitting a gray node again means a back edge, and the gray stack at that
/// point names the cycle's members.
pub fn validate_graph<N: Display + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors = vec![Color::White; graph.node_count()];

    for start in graph.node_indices() {
        if colors[start.index()] != Color::White {
            continue;
        }

        // Iterative DFS to sidestep stack limits on deep graphs. Each
        // frame holds the node and its remaining neighbor iterator.
        let mut stack = vec![(start, graph.neighbors(start))];
        colors[start.index()] = Color::Gray;

        while let Some((node, neighbors)) = stack.last_mut() {
            match neighbors.next() {
                Some(next) => match colors[next.index()] {
                    Color::White => {
                        colors[next.index()] = Color::Gray;
                        stack.push((next, graph.neighbors(next)));
                    }
                    Color::Gray => {
                        // Back edge found. The portion of the stack from
                        // `next` onward is the cycle.
                        let cycle_start = stack
                            .iter()
                            .position(|(n, _)| *n == next)
                            .expect("gray node must be on the stack");
                        let cycle_line = stack[cycle_start..]
                            .iter()
                            .map(|(n, _)| graph.node_weight(*n).unwrap().to_string())
                            .chain(std::iter::once(
                                graph.node_weight(next).unwrap().to_string(),
                            ))
                            .join(" -> ");
                        return Err(Error::CyclicDependencies { cycle_line });
                    }
                    Color::Black => {}
                },
                None => {
                    colors[node.index()] = Color::Black;
                    stack.pop();
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use petgraph::graph::Graph;

    use super::*;

    #[test]
    fn test_cycle_err_names_back_edge() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");

        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        let err = validate_graph(&g).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Cyclic dependency detected"), "{message}");
        assert!(message.contains("a -> b -> c -> a"), "{message}");
    }

    #[test]
    fn test_self_dependency() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());

        let err = validate_graph(&g).unwrap_err();
        assert_eq!(err.to_string(), "a depends on itself");
    }

    #[test]
    fn test_dag_is_valid() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        // diamond: a -> b -> c, a -> c
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(a, c, ());

        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_transitive_closure() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(d, c, ());

        let downstream = transitive_closure(&g, Some(a), petgraph::Direction::Outgoing);
        assert_eq!(downstream, ["a", "b", "c"].iter().collect());

        let upstream = transitive_closure(&g, Some(c), petgraph::Direction::Incoming);
        assert_eq!(upstream, ["a", "b", "c", "d"].iter().collect());
    }
}
