//! Directed graphs of task dependencies.
//!
//! A [`DirectedGraph`] maps every node to its children. Task graphs use it in
//! two directions:
//!
//! * the **dependency graph**, where the children of a node are the nodes it
//!   needs as input,
//! * the **forward graph**, where the children of a node are the nodes
//!   consuming its output.
//!
//! A [`DependencyDag`] holds both and can only be created from an acyclic
//! dependency graph.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::GraphError;

/// An immutable directed graph. Nodes without children are only stored
/// implicitly, as children of other nodes.
#[derive(Debug, Clone)]
pub struct DirectedGraph<N> {
    children: HashMap<N, HashSet<N>>,
}

impl<N> Default for DirectedGraph<N> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
        }
    }
}

impl<N: Clone + Eq + Hash> DirectedGraph<N> {
    pub fn builder() -> DirectedGraphBuilder<N> {
        DirectedGraphBuilder::default()
    }

    pub fn children(&self, node: &N) -> impl Iterator<Item = &N> {
        self.children.get(node).into_iter().flatten()
    }

    pub fn has_children(&self, node: &N) -> bool {
        self.children.contains_key(node)
    }

    /// Every node with at least one child.
    pub fn parents(&self) -> impl Iterator<Item = &N> {
        self.children.keys()
    }

    /// Every node mentioned by the graph.
    pub fn nodes(&self) -> HashSet<N> {
        let mut nodes = HashSet::new();
        for (node, children) in &self.children {
            nodes.insert(node.clone());
            nodes.extend(children.iter().cloned());
        }
        nodes
    }

    /// The graph with every edge reversed.
    pub fn reverse(&self) -> Self {
        let mut reversed: HashMap<N, HashSet<N>> = HashMap::with_capacity(self.children.len());
        for (node, children) in &self.children {
            for child in children {
                reversed
                    .entry(child.clone())
                    .or_default()
                    .insert(node.clone());
            }
        }
        Self { children: reversed }
    }

    /// The nodes of `nodes` without children.
    pub fn end_nodes<'a>(&self, nodes: impl IntoIterator<Item = &'a N>) -> Vec<N>
    where
        N: 'a,
    {
        nodes
            .into_iter()
            .filter(|node| !self.has_children(node))
            .cloned()
            .collect()
    }

    /// Every node reachable from `start`, `start` included.
    pub fn reachable_nodes<'a>(&self, start: impl IntoIterator<Item = &'a N>) -> HashSet<N>
    where
        N: 'a,
    {
        let mut reached = HashSet::new();
        let mut stack: Vec<&N> = start.into_iter().collect();
        while let Some(node) = stack.pop() {
            if reached.insert(node.clone()) {
                stack.extend(self.children(node));
            }
        }
        reached
    }

    /// Maps every leaf reachable from the given roots to the roots it is
    /// reachable from.
    pub fn all_leaf_to_root_nodes<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a N>,
    ) -> HashMap<N, HashSet<N>>
    where
        N: 'a,
    {
        let mut result: HashMap<N, HashSet<N>> = HashMap::new();
        for root in roots {
            for node in self.reachable_nodes([root]) {
                if !self.has_children(&node) {
                    result.entry(node).or_default().insert(root.clone());
                }
            }
        }
        result
    }

    /// Finds a cycle, returned as a path starting and ending on the same
    /// node.
    pub fn find_cycle(&self) -> Option<Vec<N>> {
        let mut graph = DiGraph::<N, ()>::new();
        let mut indices: HashMap<N, NodeIndex> = HashMap::new();
        let mut index_of = |graph: &mut DiGraph<N, ()>, node: &N| match indices.entry(node.clone()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => *entry.insert(graph.add_node(node.clone())),
        };

        for (node, children) in &self.children {
            let from = index_of(&mut graph, node);
            for child in children {
                let to = index_of(&mut graph, child);
                graph.add_edge(from, to, ());
            }
        }

        let cycle = toposort(&graph, None).err()?;
        self.path_back_to(&graph[cycle.node_id()])
    }

    /// Shortest path from `start` back to itself.
    fn path_back_to(&self, start: &N) -> Option<Vec<N>> {
        let mut parents: HashMap<&N, &N> = HashMap::new();
        let mut queue: VecDeque<&N> = VecDeque::from([start]);

        while let Some(node) = queue.pop_front() {
            for child in self.children(node) {
                if child == start {
                    let mut path = vec![start.clone()];
                    let mut current = node;
                    while current != start {
                        path.push(current.clone());
                        current = parents[current];
                    }
                    path[1..].reverse();
                    path.push(start.clone());
                    return Some(path);
                }
                if let Entry::Vacant(entry) = parents.entry(child) {
                    entry.insert(node);
                    queue.push_back(child);
                }
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct DirectedGraphBuilder<N> {
    children: HashMap<N, HashSet<N>>,
}

impl<N> Default for DirectedGraphBuilder<N> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
        }
    }
}

impl<N: Clone + Eq + Hash> DirectedGraphBuilder<N> {
    pub fn add_child(&mut self, node: N, child: N) -> &mut Self {
        self.children.entry(node).or_default().insert(child);
        self
    }

    pub fn add_node_with_children(&mut self, node: N, children: impl IntoIterator<Item = N>) -> &mut Self {
        self.children.entry(node).or_default().extend(children);
        self
    }

    pub fn build(self) -> DirectedGraph<N> {
        let children = self
            .children
            .into_iter()
            .filter(|(_, children)| !children.is_empty())
            .collect();
        DirectedGraph { children }
    }
}

/// A dependency graph known to be acyclic, together with its forward graph.
#[derive(Debug, Clone)]
pub struct DependencyDag<N> {
    dependency_graph: DirectedGraph<N>,
    forward_graph: DirectedGraph<N>,
}

impl<N: Clone + Eq + Hash + Display> DependencyDag<N> {
    /// Fails if the graph contains a cycle.
    pub fn new(dependency_graph: DirectedGraph<N>) -> Result<Self, GraphError> {
        if let Some(cycle) = dependency_graph.find_cycle() {
            let cycle = cycle.iter().map(ToString::to_string).collect();
            return Err(GraphError::Cycle(cycle));
        }

        let forward_graph = dependency_graph.reverse();
        Ok(Self {
            dependency_graph,
            forward_graph,
        })
    }
}

impl<N: Clone + Eq + Hash> DependencyDag<N> {
    pub fn dependency_graph(&self) -> &DirectedGraph<N> {
        &self.dependency_graph
    }

    pub fn forward_graph(&self) -> &DirectedGraph<N> {
        &self.forward_graph
    }

    /// The same graph with the roles of dependencies and dependents swapped.
    pub fn reverse(&self) -> Self {
        Self {
            dependency_graph: self.forward_graph.clone(),
            forward_graph: self.dependency_graph.clone(),
        }
    }
}

/// Orders the members of `filter` reachable from `roots` so that every node
/// comes after the nodes it depends on.
///
/// Runs a depth-first post-order traversal of `graph` from each root in
/// turn, visiting each node once. The graph must be acyclic.
pub fn sort_recursively<'a, N>(
    graph: &DirectedGraph<N>,
    roots: impl IntoIterator<Item = &'a N>,
    filter: &HashSet<N>,
) -> Vec<N>
where
    N: Clone + Eq + Hash + 'a,
{
    let mut result = Vec::new();
    let mut visited: HashSet<&N> = HashSet::new();
    // (node, children already pushed)
    let mut stack: Vec<(&N, bool)> = Vec::new();

    for root in roots {
        stack.push((root, false));
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                if filter.contains(node) {
                    result.push(node.clone());
                }
                continue;
            }
            if !visited.insert(node) {
                continue;
            }

            stack.push((node, true));
            for child in graph.children(node) {
                if !visited.contains(child) {
                    stack.push((child, false));
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&'static str, &'static str)]) -> DirectedGraph<&'static str> {
        let mut builder = DirectedGraph::builder();
        for &(node, child) in edges {
            builder.add_child(node, child);
        }
        builder.build()
    }

    fn position(order: &[&str], node: &str) -> usize {
        order.iter().position(|n| *n == node).unwrap()
    }

    #[test]
    fn test_cycle_rejected() {
        let err = DependencyDag::new(graph(&[("a", "b"), ("b", "a")])).unwrap_err();
        match err {
            GraphError::Cycle(path) => {
                assert_eq!(path.len(), 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        assert!(DependencyDag::new(graph(&[("a", "a")])).is_err());
    }

    #[test]
    fn test_long_cycle_path() {
        let cyclic = graph(&[("root", "a"), ("a", "b"), ("b", "c"), ("c", "a")]);
        let cycle = cyclic.find_cycle().unwrap();
        assert_eq!(cycle.len(), 4);
        for pair in cycle.windows(2) {
            assert!(cyclic.children(&pair[0]).any(|c| *c == pair[1]));
        }
    }

    #[test]
    fn test_forward_graph() {
        let dag = DependencyDag::new(graph(&[("app", "lib"), ("test", "lib")])).unwrap();
        let mut users: Vec<_> = dag.forward_graph().children(&"lib").copied().collect();
        users.sort();
        assert_eq!(users, vec!["app", "test"]);
        assert!(!dag.forward_graph().has_children(&"app"));

        let reversed = dag.reverse();
        assert!(reversed.dependency_graph().has_children(&"lib"));
    }

    #[test]
    fn test_sort_recursively_orders_dependencies_first() {
        // d depends on b and c, both depend on a
        let g = graph(&[("d", "b"), ("d", "c"), ("b", "a"), ("c", "a"), ("e", "c")]);
        let all = g.nodes();
        let order = sort_recursively(&g, &["d", "e"], &all);

        assert_eq!(order.len(), 5);
        for (node, dep) in [("d", "b"), ("d", "c"), ("b", "a"), ("c", "a"), ("e", "c")] {
            assert!(position(&order, dep) < position(&order, node));
        }
    }

    #[test]
    fn test_sort_recursively_filters() {
        let g = graph(&[("d", "b"), ("b", "a"), ("d", "x")]);
        let filter = HashSet::from(["a", "d"]);
        assert_eq!(sort_recursively(&g, &["d"], &filter), vec!["a", "d"]);
    }

    #[test]
    fn test_leaf_to_root_nodes() {
        let g = graph(&[("r1", "m"), ("m", "l1"), ("m", "l2"), ("r2", "l2")]);
        let map = g.all_leaf_to_root_nodes(&["r1", "r2"]);

        assert_eq!(map[&"l1"], HashSet::from(["r1"]));
        assert_eq!(map[&"l2"], HashSet::from(["r1", "r2"]));
        assert!(!map.contains_key(&"m"));
    }

    #[test]
    fn test_reachable_and_end_nodes() {
        let g = graph(&[("a", "b"), ("b", "c"), ("x", "y")]);
        assert_eq!(g.reachable_nodes(&["a"]), HashSet::from(["a", "b", "c"]));
        assert_eq!(g.end_nodes(&["a", "c", "y"]), vec!["c", "y"]);
    }
}
