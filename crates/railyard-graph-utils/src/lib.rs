//! Helpers shared by the package graph and the task graph: DAG validation,
//! transitive closure, and a concurrent walker that releases a node only once
//! every node it depends on has finished.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, Reversed},
};
use thiserror::Error;

pub use crate::walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected: {cycle}")]
    CyclicDependencies { cycle: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Collects every node reachable from `indices` in the given direction.
pub fn transitive_closure<N: Hash + Eq, I: IntoIterator<Item = NodeIndex>, E>(
    graph: &Graph<N, E>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut reached = HashSet::new();

    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(index, _) = event {
            reached.insert(
                graph
                    .node_weight(index)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    reached
}

/// Rejects graphs with cycles or self-edges. The error message names every
/// member of each strongly connected component so the user can see the
/// offending dependency chain.
pub fn validate_graph<N: Display, E>(graph: &Graph<N, E>) -> Result<(), Error> {
    let cycles = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .collect::<Vec<_>>();

    if !cycles.is_empty() {
        let cycle = cycles
            .into_iter()
            .map(|component| {
                component
                    .into_iter()
                    .map(|index| {
                        graph
                            .node_weight(index)
                            .expect("scc member should be present")
                    })
                    .format(" -> ")
                    .to_string()
            })
            .join("; ");
        return Err(Error::CyclicDependencies { cycle });
    }

    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use petgraph::graph::Graph;

    use super::*;

    #[test]
    fn test_cycle_err_message() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        let err = validate_graph(&g).unwrap_err();
        assert_snapshot!(err.to_string(), @"Cyclic dependency detected: c -> b -> a");
    }

    #[test]
    fn test_self_edge() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        g.add_edge(a, a, ());

        let err = validate_graph(&g).unwrap_err();
        assert_snapshot!(err.to_string(), @"a depends on itself");
    }

    #[test]
    fn test_valid_dag() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(a, c, ());
        g.add_edge(b, c, ());

        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_transitive_closure_directions() {
        // a -> b -> c, d isolated
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let downstream = transitive_closure(&g, Some(a), petgraph::Direction::Outgoing);
        assert_eq!(downstream, ["a", "b", "c"].iter().collect());

        let upstream = transitive_closure(&g, Some(c), petgraph::Direction::Incoming);
        assert_eq!(upstream, ["a", "b", "c"].iter().collect());

        let none: HashSet<&&str> =
            transitive_closure(&g, None::<NodeIndex>, petgraph::Direction::Outgoing);
        assert!(none.is_empty());
    }

}
