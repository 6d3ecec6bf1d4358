//! Emission order of code blocks
//!
//! Strongly connected components of the call graph are collapsed into
//! blocks, then blocks are emitted dependencies-first. Among blocks that are
//! ready at the same time the one discovered earliest goes first, so the
//! order is a pure function of the graph.

use petgraph::algo::condensation;
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::errors::BuildError;
use crate::shared::models::DependencyGraph;

/// Node indices (into `graph.nodes`) grouped into blocks, callees before
/// callers. Members of one block are sorted by discovery order.
pub fn order_blocks(graph: &DependencyGraph) -> Result<Vec<Vec<usize>>, BuildError> {
    let (calls, _) = graph.call_graph();
    let mut dag = condensation(calls, true);
    for members in dag.node_weights_mut() {
        members.sort_unstable_by_key(|&i| graph.nodes[i].discovery_index);
    }

    let first_seen = |idx: NodeIndex| -> usize {
        dag[idx]
            .first()
            .map(|&i| graph.nodes[i].discovery_index)
            .unwrap_or(usize::MAX)
    };

    // Pending callee count per block; a block is ready at zero
    let mut pending: Vec<usize> = dag
        .node_indices()
        .map(|idx| dag.edges_directed(idx, Direction::Outgoing).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = dag
        .node_indices()
        .filter(|idx| pending[idx.index()] == 0)
        .map(|idx| Reverse((first_seen(idx), idx.index())))
        .collect();

    let mut ordered = Vec::with_capacity(dag.node_count());
    while let Some(Reverse((_, block))) = ready.pop() {
        let idx = NodeIndex::new(block);
        for caller in dag.neighbors_directed(idx, Direction::Incoming) {
            let count = &mut pending[caller.index()];
            *count -= 1;
            if *count == 0 {
                ready.push(Reverse((first_seen(caller), caller.index())));
            }
        }
        ordered.push(dag[idx].clone());
    }

    if ordered.len() < dag.node_count() {
        let mut members: Vec<String> = dag
            .node_indices()
            .filter(|idx| pending[idx.index()] > 0)
            .flat_map(|idx| dag[idx].iter().map(|&i| graph.nodes[i].qualified_name.clone()))
            .collect();
        members.sort();
        return Err(BuildError::CycleUnresolved { members });
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::models::{
        Arguments, CodeNode, DeclaringScope, DependencyEdge, EdgeKind,
    };

    fn graph(spec: &[(&str, &[&str])]) -> DependencyGraph {
        let nodes: Vec<CodeNode> = spec
            .iter()
            .enumerate()
            .map(|(i, (qn, callees))| CodeNode {
                qualified_name: qn.to_string(),
                module: "m".to_string(),
                symbol: qn.trim_start_matches("m.").to_string(),
                scope: DeclaringScope::Module,
                line: i + 1,
                source: String::new(),
                rendered: String::new(),
                captures: Vec::new(),
                callees: callees.iter().map(|c| c.to_string()).collect(),
                externals: Vec::new(),
                discovery_index: i,
            })
            .collect();
        let edges = nodes
            .iter()
            .flat_map(|n| {
                n.callees.iter().map(move |c| DependencyEdge {
                    from: n.qualified_name.clone(),
                    to: c.clone(),
                    kind: EdgeKind::Calls,
                    circular: false,
                })
            })
            .collect();
        DependencyGraph {
            entry: nodes[0].qualified_name.clone(),
            nodes,
            edges,
            externals: Vec::new(),
            bindings: Vec::new(),
            file_refs: Vec::new(),
            unresolved: Vec::new(),
            filesystem_aliases: Vec::new(),
            module_cycles: Vec::new(),
            arguments: Arguments::default(),
            data_files: Vec::new(),
        }
    }

    #[test]
    fn test_chain_emits_callees_first() {
        let g = graph(&[("m.a", &["m.b"]), ("m.b", &["m.c"]), ("m.c", &[])]);
        assert_eq!(order_blocks(&g).unwrap(), vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn test_cycle_is_one_block() {
        let g = graph(&[
            ("m.main", &["m.even"]),
            ("m.even", &["m.odd"]),
            ("m.odd", &["m.even"]),
        ]);
        assert_eq!(order_blocks(&g).unwrap(), vec![vec![1, 2], vec![0]]);
    }

    #[test]
    fn test_ready_blocks_follow_discovery_order() {
        let g = graph(&[
            ("m.main", &["m.c", "m.b", "m.a"]),
            ("m.a", &[]),
            ("m.b", &[]),
            ("m.c", &[]),
        ]);
        assert_eq!(
            order_blocks(&g).unwrap(),
            vec![vec![1], vec![2], vec![3], vec![0]]
        );
    }

    #[test]
    fn test_self_recursion_stays_single_block() {
        let g = graph(&[("m.fact", &["m.fact"])]);
        assert_eq!(order_blocks(&g).unwrap(), vec![vec![0]]);
    }
}
