//! Dependency graph over a definition's nodes.

use super::{DependencyEdge, TaskSpec};
use crate::errors::{CycleDetectedError, DanglingDependencyError, DefinitionError};
use std::collections::{BTreeSet, HashMap};

/// Index-based view of the nodes and their dependencies.
///
/// Node indices follow insertion order, which is also the tie-break of
/// [`DependencyGraph::topological_order`].
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Builds the graph, failing on references to unknown nodes.
    pub fn build(nodes: &[TaskSpec], edges: &[DependencyEdge]) -> Result<Self, DefinitionError> {
        let ids: Vec<String> = nodes.iter().map(|n| n.task_id.clone()).collect();
        let index: HashMap<String, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let mut graph = Self {
            upstream: vec![Vec::new(); ids.len()],
            downstream: vec![Vec::new(); ids.len()],
            ids,
            index,
        };

        let primary = nodes
            .iter()
            .filter_map(|n| n.upstream_task_id.as_deref().map(|up| (up, n.task_id.as_str())));
        let extra = edges
            .iter()
            .map(|e| (e.upstream.as_str(), e.downstream.as_str()));

        for (up, down) in primary.chain(extra) {
            let Some(&to) = graph.index.get(down) else {
                return Err(DanglingDependencyError::missing_downstream(down, up).into());
            };
            let Some(&from) = graph.index.get(up) else {
                return Err(DanglingDependencyError::new(down, up).into());
            };
            graph.link(from, to);
        }
        Ok(graph)
    }

    fn link(&mut self, from: usize, to: usize) {
        if !self.upstream[to].contains(&from) {
            self.upstream[to].push(from);
            self.downstream[from].push(to);
        }
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true for a graph without nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The task id at `idx`.
    #[must_use]
    pub fn id(&self, idx: usize) -> &str {
        &self.ids[idx]
    }

    /// The index of a task id.
    #[must_use]
    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    /// Nodes that must finish before `idx` starts.
    #[must_use]
    pub fn upstream(&self, idx: usize) -> &[usize] {
        &self.upstream[idx]
    }

    /// Nodes waiting on `idx`.
    #[must_use]
    pub fn downstream(&self, idx: usize) -> &[usize] {
        &self.downstream[idx]
    }

    /// Kahn's algorithm; among ready nodes the earliest inserted goes first.
    pub fn topological_order(&self) -> Result<Vec<usize>, CycleDetectedError> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(idx) = ready.pop_first() {
            order.push(idx);
            for &next in &self.downstream[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() < self.len() {
            let cycle = self.find_cycle().unwrap_or_else(|| {
                (0..self.len())
                    .filter(|i| in_degree[*i] > 0)
                    .map(|i| self.ids[i].clone())
                    .collect()
            });
            return Err(CycleDetectedError::new(cycle));
        }
        Ok(order)
    }

    /// Topological order as task ids.
    pub fn topological_ids(&self) -> Result<Vec<String>, CycleDetectedError> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|i| self.ids[i].clone())
            .collect())
    }

    /// Returns one cycle as a closed path (`a -> b -> a`), if any.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = vec![false; self.len()];
        let mut on_stack = vec![false; self.len()];
        let mut path = Vec::new();

        for start in 0..self.len() {
            if !visited[start] {
                if let Some(cycle) = self.dfs_cycle(start, &mut visited, &mut on_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut [bool],
        on_stack: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited[node] = true;
        on_stack[node] = true;
        path.push(node);

        for &next in &self.downstream[node] {
            if !visited[next] {
                if let Some(cycle) = self.dfs_cycle(next, visited, on_stack, path) {
                    return Some(cycle);
                }
            } else if on_stack[next] {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[next].clone());
                return Some(cycle);
            }
        }

        path.pop();
        on_stack[node] = false;
        None
    }
}
