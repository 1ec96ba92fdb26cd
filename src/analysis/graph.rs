//! Subtask dependency graph.
//!
//! Nodes are the subtasks still to be scheduled in a stage; an edge `a -> b`
//! means `b` needs `a`'s result first. Cycles are allowed in the graph so the
//! analyzer can report them instead of failing on insertion.

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

use crate::analysis::plan::PlannedSubtask;
use crate::error::{Error, Result};

pub struct SubtaskGraph {
    graph: DiGraph<PlannedSubtask, ()>,
    index: HashMap<String, NodeIndex>,
}

impl SubtaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a subtask. Returns the existing node when the name is already present.
    pub fn add_subtask(&mut self, subtask: PlannedSubtask) -> NodeIndex {
        if let Some(&idx) = self.index.get(&subtask.name) {
            return idx;
        }
        let name = subtask.name.clone();
        let idx = self.graph.add_node(subtask);
        self.index.insert(name, idx);
        idx
    }

    /// Record that `to` depends on `from`.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        let from_idx = self.node(from)?;
        let to_idx = self.node(to)?;
        if self.graph.find_edge(from_idx, to_idx).is_none() {
            self.graph.add_edge(from_idx, to_idx, ());
        }
        Ok(())
    }

    fn node(&self, name: &str) -> Result<NodeIndex> {
        self.index.get(name).copied().ok_or_else(|| {
            Error::InternalAnalyzerError(format!("subtask {} not in graph", name))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Names of the subtasks `name` depends on, in insertion order.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        deps.sort();
        deps.into_iter()
            .filter_map(|d| self.graph.node_weight(d))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Groups of subtasks that sit on a dependency cycle, including self-loops.
    ///
    /// Members of each group are sorted by insertion order, and groups by
    /// their first member, so the output is stable for equal inputs.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1
                    || scc
                        .first()
                        .map(|&n| self.graph.find_edge(n, n).is_some())
                        .unwrap_or(false)
            })
            .map(|mut scc| {
                scc.sort();
                scc
            })
            .collect();
        groups.sort();
        groups
            .into_iter()
            .map(|scc| {
                scc.into_iter()
                    .filter_map(|n| self.graph.node_weight(n))
                    .map(|s| s.name.clone())
                    .collect()
            })
            .collect()
    }

    /// Subtasks whose in-graph dependencies are all in `completed`, in
    /// insertion order.
    pub fn ready(&self, completed: &HashSet<String>) -> Vec<&PlannedSubtask> {
        self.graph
            .node_indices()
            .filter_map(|idx| {
                let subtask = self.graph.node_weight(idx)?;
                if completed.contains(&subtask.name) {
                    return None;
                }
                let satisfied = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| completed.contains(&d.name))
                            .unwrap_or(false)
                    });
                satisfied.then_some(subtask)
            })
            .collect()
    }

    /// Every subtask ordered after its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&PlannedSubtask>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|s| s.name.as_str())
                .unwrap_or("unknown");
            Error::InternalAnalyzerError(format!("cycle at subtask {}", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect())
    }
}

impl Default for SubtaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubtaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtaskGraph")
            .field("subtasks", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
