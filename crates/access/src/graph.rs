//! Role grant graph built on `petgraph`.
//!
//! Nodes are roles, edges point from grantor to grantee. Traversals sort by
//! role name wherever petgraph would otherwise leak insertion order, so a
//! given specification always compiles to the same plan.

use std::collections::{BTreeSet, HashMap, VecDeque};

use bastion_core::{GrantEdge, RoleName};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::ValidationError;

/// Directed graph of roles and the grants between them.
#[derive(Debug, Default)]
pub struct RoleGraph {
    graph: DiGraph<RoleName, GrantEdge>,
    index_map: HashMap<RoleName, NodeIndex>,
}

impl RoleGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role; adding it twice is a no-op.
    pub fn add_role(&mut self, role: RoleName) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&role) {
            return idx;
        }
        let idx = self.graph.add_node(role.clone());
        self.index_map.insert(role, idx);
        idx
    }

    /// Add an edge, adding its endpoints as needed.
    pub fn add_edge(&mut self, edge: GrantEdge) {
        let from = self.add_role(edge.grantor.clone());
        let to = self.add_role(edge.grantee.clone());
        self.graph.add_edge(from, to, edge);
    }

    fn sorted_neighbors(&self, idx: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        neighbors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        neighbors.dedup();
        neighbors
    }

    /// Find a cycle, if any, as a closed path `[a, b, ..., a]`.
    ///
    /// Self-grants come back as `[a, a]`. When several cycles exist the one
    /// through the alphabetically smallest role is reported.
    pub fn find_cycle(&self) -> Option<Vec<RoleName>> {
        let mut candidates: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .collect();

        for scc in &mut candidates {
            scc.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        }
        candidates.sort_by(|a, b| self.graph[a[0]].cmp(&self.graph[b[0]]));

        let scc = candidates.first()?;
        let start = scc[0];
        if self.graph.contains_edge(start, start) {
            let role = self.graph[start].clone();
            return Some(vec![role.clone(), role]);
        }

        // Shortest way back to `start` without leaving the component.
        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.sorted_neighbors(idx, Direction::Outgoing) {
                if !members.contains(&next) {
                    continue;
                }
                if next == start {
                    let mut path = vec![self.graph[start].clone()];
                    let mut cursor = idx;
                    while cursor != start {
                        path.push(self.graph[cursor].clone());
                        cursor = parent[&cursor];
                    }
                    path.push(self.graph[start].clone());
                    path.reverse();
                    return Some(path);
                }
                if !parent.contains_key(&next) {
                    parent.insert(next, idx);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Group roles into levels using Kahn's algorithm.
    ///
    /// Every role's grantors sit in strictly earlier levels, so roles in one
    /// level never depend on each other. Levels are sorted by name.
    pub fn compute_levels(&self) -> Result<Vec<Vec<RoleName>>, ValidationError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut levels = Vec::new();
        let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();

        while !remaining.is_empty() {
            let current_level: Vec<NodeIndex> = remaining
                .iter()
                .filter(|idx| in_degree[*idx] == 0)
                .copied()
                .collect();

            if current_level.is_empty() {
                return Err(ValidationError::CycleDetected {
                    cycle: self.find_cycle().unwrap_or_default(),
                });
            }

            for &idx in &current_level {
                for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    in_degree.entry(neighbor).and_modify(|deg| *deg -= 1);
                }
            }

            remaining.retain(|idx| !current_level.contains(idx));

            let mut level: Vec<RoleName> = current_level
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect();
            level.sort();
            levels.push(level);
        }

        Ok(levels)
    }

    /// Roles reachable from `root` along grant edges, `root` included.
    pub fn reachable_from(&self, root: &RoleName) -> BTreeSet<RoleName> {
        let Some(&start) = self.index_map.get(root) else {
            return BTreeSet::new();
        };
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }
}
