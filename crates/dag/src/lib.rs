// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Directed graph primitives for dependency resolution.
//!
//! Unlike a general purpose graph, edges here always read
//! `package depends-on dependency`, and ordering queries return
//! dependency-first sequences. Cycles may be *stored* freely; they are
//! detected when an ordering is requested so the offending chain can be
//! reported back to the user in full.

use std::collections::{HashMap, HashSet};

use petgraph::prelude::DiGraph;

/// NodeIndex as employed throughout cairn
pub type NodeIndex = petgraph::prelude::NodeIndex<u32>;

/// Encapsulation of petgraph providing the mechanisms dependency
/// resolution needs: cycle reporting and deterministic ordering
#[derive(Debug, Clone)]
pub struct Dag<N> {
    graph: DiGraph<N, (), u32>,
    indices: HashMap<N, NodeIndex>,
}

impl<N> Default for Dag<N> {
    fn default() -> Self {
        Self {
            graph: DiGraph::default(),
            indices: HashMap::default(),
        }
    }
}

impl<N> Dag<N>
where
    N: Clone + Eq + std::hash::Hash + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds node N to the graph and returns the index.
    /// If N already exists, it'll return the index of that node.
    pub fn add_node_or_get_index(&mut self, node: &N) -> NodeIndex {
        if let Some(index) = self.indices.get(node) {
            *index
        } else {
            let index = self.graph.add_node(node.clone());
            self.indices.insert(node.clone(), index);
            index
        }
    }

    pub fn node_exists(&self, node: &N) -> bool {
        self.indices.contains_key(node)
    }

    pub fn get_index(&self, node: &N) -> Option<NodeIndex> {
        self.indices.get(node).copied()
    }

    /// Add an edge `from depends-on to`, creating either node on demand.
    /// Duplicate edges are collapsed; cycles are accepted here and
    /// surface later via [`Self::dependency_order`].
    pub fn add_dependency(&mut self, from: &N, to: &N) {
        let a = self.add_node_or_get_index(from);
        let b = self.add_node_or_get_index(to);

        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &'_ N> {
        self.graph.node_indices().map(|i| &self.graph[i])
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Direct dependencies of `node`, lexicographically ordered
    pub fn dependencies(&self, node: &N) -> Vec<&N> {
        let Some(index) = self.get_index(node) else {
            return vec![];
        };

        let mut deps: Vec<_> = self.graph.neighbors(index).map(|i| &self.graph[i]).collect();
        deps.sort();
        deps
    }

    /// Every node reachable from `start`, excluding `start` itself
    pub fn closure(&self, start: &N) -> Vec<N> {
        let Some(root) = self.get_index(start) else {
            return vec![];
        };

        let mut seen = HashSet::from([root]);
        let mut stack = vec![root];
        let mut out = vec![];

        while let Some(index) = stack.pop() {
            for next in self.graph.neighbors(index) {
                if seen.insert(next) {
                    out.push(self.graph[next].clone());
                    stack.push(next);
                }
            }
        }

        out.sort();
        out
    }

    /// Transpose the graph, returning the clone
    pub fn transpose(&self) -> Self {
        let mut graph = self.graph.clone();
        graph.reverse();

        let indices = graph
            .node_indices()
            .map(|i| (graph[i].clone(), i))
            .collect();

        Self { graph, indices }
    }

    /// Dependency-first ordering of everything reachable from `start`:
    /// each node appears strictly after all of its dependencies.
    ///
    /// Cycle detection is a three color depth first visit; hitting a
    /// node already on the visiting chain reconstructs the full cycle
    /// path, which begins and ends at the same node. Among nodes of
    /// equal rank the lexicographically smaller name is emitted first.
    pub fn dependency_order(&self, start: &N) -> Result<Vec<N>, Error<N>> {
        let root = self
            .get_index(start)
            .ok_or_else(|| Error::UnknownNode(start.clone()))?;

        let reachable = self.visit(root)?;
        Ok(self.ranked_order(&reachable))
    }

    /// Dependency-first ordering of the entire graph
    pub fn dependency_order_all(&self) -> Result<Vec<N>, Error<N>> {
        let mut reachable = HashSet::new();

        for index in self.graph.node_indices() {
            if !reachable.contains(&index) {
                reachable.extend(self.visit(index)?);
            }
        }

        Ok(self.ranked_order(&reachable))
    }

    /// Three color DFS from `root`; returns the reachable set or the
    /// cycle path
    fn visit(&self, root: NodeIndex) -> Result<HashSet<NodeIndex>, Error<N>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Visiting,
            Done,
        }

        enum Frame {
            Enter(NodeIndex),
            Exit(NodeIndex),
        }

        let mut colors: HashMap<NodeIndex, Color> = HashMap::new();
        let mut chain: Vec<NodeIndex> = vec![];
        let mut stack = vec![Frame::Enter(root)];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(index) => {
                    if colors.contains_key(&index) {
                        continue;
                    }

                    colors.insert(index, Color::Visiting);
                    chain.push(index);
                    stack.push(Frame::Exit(index));

                    let mut children: Vec<_> = self.graph.neighbors(index).collect();
                    // Reverse sort: the stack pops smallest first
                    children.sort_by(|a, b| self.graph[*b].cmp(&self.graph[*a]));

                    for child in children {
                        match colors.get(&child) {
                            Some(Color::Done) => {}
                            Some(Color::Visiting) => {
                                let from =
                                    chain.iter().position(|i| *i == child).unwrap_or_default();
                                let mut path: Vec<N> = chain[from..]
                                    .iter()
                                    .map(|i| self.graph[*i].clone())
                                    .collect();
                                path.push(self.graph[child].clone());
                                return Err(Error::Cycle(path));
                            }
                            None => stack.push(Frame::Enter(child)),
                        }
                    }
                }
                Frame::Exit(index) => {
                    colors.insert(index, Color::Done);
                    chain.pop();
                }
            }
        }

        Ok(colors.into_keys().collect())
    }

    /// Kahn ordering over `members`, ties broken lexicographically
    fn ranked_order(&self, members: &HashSet<NodeIndex>) -> Vec<N> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let mut out_degree: HashMap<NodeIndex, usize> = members
            .iter()
            .map(|&index| {
                let degree = self
                    .graph
                    .neighbors(index)
                    .filter(|n| members.contains(n))
                    .count();
                (index, degree)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(&N, NodeIndex)>> = out_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&index, _)| Reverse((&self.graph[index], index)))
            .collect();

        let mut order = vec![];

        while let Some(Reverse((node, index))) = ready.pop() {
            order.push(node.clone());

            // Releasing `index` may ready its dependents
            for parent in self
                .graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
            {
                if let Some(degree) = out_degree.get_mut(&parent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((&self.graph[parent], parent)));
                    }
                }
            }
        }

        order
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error<N> {
    UnknownNode(N),
    /// The reconstructed path begins and ends at the same node
    Cycle(Vec<N>),
}

#[cfg(test)]
mod test {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> Dag<String> {
        let mut dag = Dag::new();
        for (from, to) in edges {
            dag.add_dependency(&(*from).to_owned(), &(*to).to_owned());
        }
        dag
    }

    #[test]
    fn dependency_first_order() {
        let dag = graph(&[("a", "b"), ("b", "c")]);

        let order = dag.dependency_order(&"a".to_owned()).unwrap();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn equal_rank_breaks_lexicographically() {
        let dag = graph(&[
            ("top", "zeta"),
            ("top", "alpha"),
            ("top", "mid"),
            ("mid", "zeta"),
        ]);

        let order = dag.dependency_order(&"top".to_owned()).unwrap();
        assert_eq!(order, vec!["alpha", "zeta", "mid", "top"]);
    }

    #[test]
    fn cycle_reports_full_path() {
        let dag = graph(&[("x", "y"), ("y", "z"), ("z", "x")]);

        let err = dag.dependency_order(&"x".to_owned()).unwrap_err();
        let Error::Cycle(path) = err else {
            panic!("expected cycle");
        };

        assert_eq!(path.first(), path.last());
        assert!(path.len() >= 4);
        for node in &path {
            assert!(["x", "y", "z"].contains(&node.as_str()));
        }
    }

    #[test]
    fn closure_and_transpose() {
        let dag = graph(&[("a", "b"), ("b", "c"), ("d", "c")]);

        assert_eq!(dag.closure(&"a".to_owned()), vec!["b", "c"]);

        let reverse = dag.transpose();
        assert_eq!(reverse.closure(&"c".to_owned()), vec!["a", "b", "d"]);
    }

    #[test]
    fn unknown_node() {
        let dag = graph(&[("a", "b")]);
        assert!(matches!(
            dag.dependency_order(&"nope".to_owned()),
            Err(Error::UnknownNode(_))
        ));
    }

    #[test]
    fn whole_graph_order_is_topological() {
        let dag = graph(&[("a", "b"), ("c", "b"), ("b", "d")]);

        let order = dag.dependency_order_all().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();

        assert!(pos("d") < pos("b"));
        assert!(pos("b") < pos("a"));
        assert!(pos("b") < pos("c"));
        assert_eq!(order.len(), 4);
    }
}
