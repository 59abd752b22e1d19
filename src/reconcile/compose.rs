use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ReconcileError, Result};
use crate::reconcile::features::{FeatureKey, TileId};
use crate::reconcile::overlap::TileGraph;

// Union of every tile's overlap graph. Composition is set union on nodes
// and edges, so it is commutative and idempotent, and absorbing a graph
// never mutates the input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalGraph {
    nodes: BTreeSet<FeatureKey>,
    edges: BTreeMap<(FeatureKey, FeatureKey), f32>,
}

impl GlobalGraph {
    pub fn new() -> GlobalGraph {
        GlobalGraph::default()
    }

    pub fn absorb(&mut self, graph: &TileGraph) {
        for key in graph.nodes() {
            self.nodes.insert(key);
        }
        for (a, b, w) in graph.edges() {
            // edges are already in canonical endpoint order; duplicate
            // sightings of an edge keep the larger weight so the result
            // is independent of absorption order
            self.edges
                .entry((a, b))
                .and_modify(|cur| *cur = cur.max(w))
                .or_insert(w);
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains_node(&self, key: FeatureKey) -> bool {
        self.nodes.contains(&key)
    }

    // ascending key order
    pub fn nodes(&self) -> impl Iterator<Item = FeatureKey> + '_ {
        self.nodes.iter().copied()
    }

    // ascending endpoint order
    pub fn edges(&self) -> impl Iterator<Item = (FeatureKey, FeatureKey, f32)> + '_ {
        self.edges.iter().map(|(&(a, b), &w)| (a, b, w))
    }
}

// input order does not affect the result
pub fn compose_graphs<'a>(graphs: impl IntoIterator<Item = &'a TileGraph>) -> GlobalGraph {
    let mut global = GlobalGraph::new();
    for graph in graphs {
        global.absorb(graph);
    }
    global
}

// Resolution may only run once every expected tile has contributed a
// graph. Reports the full set of absent tiles at once.
pub fn validate_complete(expected: &[TileId], present: &BTreeSet<TileId>) -> Result<()> {
    let missing: Vec<TileId> = expected
        .iter()
        .copied()
        .filter(|tile| !present.contains(tile))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ReconcileError::IncompleteComposition { missing })
    }
}
