//! Join-aware depth-first walk
//!
//! An aggregating node is expanded only after all of its incoming flows have
//! been seen. Preheat uses this walk to check graph shape; the runtime
//! counts arrivals at joins the same way with [`JoinCounter`].

use std::collections::{HashMap, HashSet};

use super::element::{NodeIdx, ProcessGraph};

/// Arrivals observed at each join
#[derive(Debug, Clone, Default)]
pub struct JoinCounter {
    arrivals: HashMap<NodeIdx, usize>,
}

impl JoinCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one arrival; true when this one completes the join
    pub fn arrive(&mut self, node: NodeIdx, required: usize) -> bool {
        let count = self.arrivals.entry(node).or_insert(0);
        *count += 1;
        *count >= required.max(1)
    }

    pub fn arrivals(&self, node: NodeIdx) -> usize {
        self.arrivals.get(&node).copied().unwrap_or(0)
    }

    pub fn reset(&mut self, node: NodeIdx) {
        self.arrivals.remove(&node);
    }
}

/// Outcome of one walk from the start event
#[derive(Debug, Clone, Default)]
pub struct Walk {
    /// Expanded nodes in visit order
    pub order: Vec<NodeIdx>,
    pub expanded: HashSet<NodeIdx>,
    /// Joins with missing arrivals and how many they saw
    pub starved: HashMap<NodeIdx, usize>,
}

impl Walk {
    pub fn reached(&self, node: NodeIdx) -> bool {
        self.expanded.contains(&node)
    }
}

/// Walk the graph from `entry` with an explicit stack
pub fn walk(graph: &ProcessGraph, entry: NodeIdx) -> Walk {
    let mut result = Walk::default();
    let mut joins = JoinCounter::new();
    let mut stack = vec![entry];

    while let Some(idx) = stack.pop() {
        let node = graph.node(idx);
        if node.is_aggregating() && idx != entry {
            if !joins.arrive(idx, node.incoming().len()) {
                continue;
            }
            joins.reset(idx);
        }
        if !result.expanded.insert(idx) {
            continue;
        }
        result.order.push(idx);

        // Reverse so the first declared flow is expanded first
        for flow in node.outgoing().iter().rev() {
            if let Some(edge) = graph.flow(*flow) {
                stack.push(edge.target);
            }
        }
    }

    for (idx, node) in graph.nodes().iter().enumerate() {
        let seen = joins.arrivals(idx);
        if node.is_aggregating() && seen > 0 && !result.reached(idx) {
            result.starved.insert(idx, seen);
        }
    }
    result
}
