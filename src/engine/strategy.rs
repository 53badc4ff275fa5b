use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use crate::engine::{RestrictableNode, TaskNodeKey};
use crate::graph::{DependencyDag, sort_recursively};

/// Decides when the nodes of a running graph may start.
pub trait TaskExecutionRestrictionStrategy: Send {
    /// Called once for every node that finished, whatever the outcome.
    fn set_node_computed(&mut self, key: &TaskNodeKey);
}

/// Creates the restriction strategy of a graph about to be executed.
///
/// Implementations may release nodes right away, from within
/// `build_strategy`. Every node must eventually be released provided that
/// the graph keeps reporting computed nodes.
pub trait RestrictionStrategyFactory: Send + Sync {
    fn build_strategy(
        &self,
        graph: &DependencyDag<TaskNodeKey>,
        nodes: &[RestrictableNode],
    ) -> Box<dyn TaskExecutionRestrictionStrategy>;
}

/// Releases every node immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerRestrictionStrategy;

struct Unrestricted;

impl TaskExecutionRestrictionStrategy for Unrestricted {
    fn set_node_computed(&mut self, _: &TaskNodeKey) {}
}

impl RestrictionStrategyFactory for EagerRestrictionStrategy {
    fn build_strategy(
        &self,
        _: &DependencyDag<TaskNodeKey>,
        nodes: &[RestrictableNode],
    ) -> Box<dyn TaskExecutionRestrictionStrategy> {
        for node in nodes {
            node.release();
        }
        Box::new(Unrestricted)
    }
}

/// Limits how many leaf outputs are retained at once.
///
/// Nodes with dependencies are released immediately. Leaf nodes (nodes
/// without dependencies) are released end node by end node: releasing an end
/// node releases every leaf it transitively depends on. New end nodes are
/// scheduled while fewer than `max_retained_leaf_nodes` leafs are held by
/// end nodes that have not been computed yet. The limit is approximate: it
/// can be exceeded by the leafs of a single end node, and at least one end
/// node is always scheduled so the graph keeps making progress.
#[derive(Debug, Clone, Copy)]
pub struct WeakLeafsOfEndNodesRestrictingStrategy {
    max_retained_leaf_nodes: usize,
}

impl WeakLeafsOfEndNodesRestrictingStrategy {
    /// A limit of zero is treated as one.
    pub fn new(max_retained_leaf_nodes: usize) -> Self {
        Self {
            max_retained_leaf_nodes: max_retained_leaf_nodes.max(1),
        }
    }

    pub fn max_retained_leaf_nodes(&self) -> usize {
        self.max_retained_leaf_nodes
    }
}

impl RestrictionStrategyFactory for WeakLeafsOfEndNodesRestrictingStrategy {
    fn build_strategy(
        &self,
        graph: &DependencyDag<TaskNodeKey>,
        nodes: &[RestrictableNode],
    ) -> Box<dyn TaskExecutionRestrictionStrategy> {
        let mut strategy = LeafRestriction::new(self.max_retained_leaf_nodes, graph, nodes);
        let released = strategy.schedule();
        release_all(released);
        Box::new(strategy)
    }
}

fn release_all(nodes: Vec<RestrictableNode>) {
    for node in nodes {
        node.release();
    }
}

/// Insertion ordered set. Removal is lazy: removed entries stay in the queue
/// until they are polled.
struct OrderedSet<N> {
    order: VecDeque<N>,
    members: HashSet<N>,
}

impl<N> Default for OrderedSet<N> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<N: Clone + Eq + Hash> OrderedSet<N> {
    fn insert(&mut self, node: N) {
        if self.members.insert(node.clone()) {
            self.order.push_back(node);
        }
    }

    fn remove(&mut self, node: &N) -> bool {
        self.members.remove(node)
    }

    fn poll(&mut self) -> Option<N> {
        while let Some(node) = self.order.pop_front() {
            if self.members.remove(&node) {
                return Some(node);
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

struct LeafRestriction {
    max_retained_leaf_nodes: usize,
    /// Leafs not yet released.
    leaf_nodes: HashMap<TaskNodeKey, RestrictableNode>,
    end_nodes_to_leafs: HashMap<TaskNodeKey, HashSet<TaskNodeKey>>,
    leafs_to_end_nodes: HashMap<TaskNodeKey, HashSet<TaskNodeKey>>,

    end_node_queue: OrderedSet<TaskNodeKey>,
    computed_end_nodes: HashSet<TaskNodeKey>,
    released_not_computed_end_nodes: HashSet<TaskNodeKey>,
    /// End nodes sharing a released leaf, scheduled ahead of the queue.
    retaining_not_computed_end_nodes: OrderedSet<TaskNodeKey>,
    /// Released leafs and the uncomputed end nodes still needing them.
    scheduled_leaf_nodes: HashMap<TaskNodeKey, HashSet<TaskNodeKey>>,
}

impl LeafRestriction {
    fn new(
        max_retained_leaf_nodes: usize,
        graph: &DependencyDag<TaskNodeKey>,
        nodes: &[RestrictableNode],
    ) -> Self {
        let dependencies = graph.dependency_graph();
        let forward = graph.forward_graph();

        let mut leaf_nodes = HashMap::new();
        let mut end_nodes: Vec<TaskNodeKey> = Vec::new();
        let mut seen_end_nodes = HashSet::new();

        for node in nodes {
            let key = node.key();
            if dependencies.has_children(key) {
                node.release();
            } else {
                leaf_nodes.insert(key.clone(), node.clone());
            }

            if !forward.has_children(key) && seen_end_nodes.insert(key.clone()) {
                end_nodes.push(key.clone());
            }
        }

        let mut missing: Vec<&TaskNodeKey> = dependencies
            .parents()
            .filter(|key| !forward.has_children(key) && !seen_end_nodes.contains(*key))
            .collect();
        missing.sort();
        end_nodes.extend(missing.into_iter().cloned());

        let leaf_set: HashSet<TaskNodeKey> = leaf_nodes.keys().cloned().collect();
        let sorted_leafs = sort_recursively(dependencies, &end_nodes, &leaf_set);

        let end_nodes_to_leafs = forward.all_leaf_to_root_nodes(&sorted_leafs);
        let leafs_to_end_nodes = dependencies.all_leaf_to_root_nodes(&end_nodes);

        // End nodes are queued in the order their first leaf is computed.
        let mut end_node_queue = OrderedSet::default();
        for leaf in &sorted_leafs {
            let mut ends: Vec<&TaskNodeKey> = leafs_to_end_nodes
                .get(leaf)
                .into_iter()
                .flatten()
                .filter(|end| end_nodes_to_leafs.contains_key(*end))
                .collect();
            ends.sort();
            for end in ends {
                end_node_queue.insert(end.clone());
            }
        }

        Self {
            max_retained_leaf_nodes,
            leaf_nodes,
            end_nodes_to_leafs,
            leafs_to_end_nodes,
            end_node_queue,
            computed_end_nodes: HashSet::new(),
            released_not_computed_end_nodes: HashSet::new(),
            retaining_not_computed_end_nodes: OrderedSet::default(),
            scheduled_leaf_nodes: HashMap::new(),
        }
    }

    fn poll_next_end_node(&mut self) -> Option<TaskNodeKey> {
        match self.retaining_not_computed_end_nodes.poll() {
            Some(end_node) => {
                self.end_node_queue.remove(&end_node);
                Some(end_node)
            }
            None => self.end_node_queue.poll(),
        }
    }

    fn schedule_one(&mut self, released: &mut Vec<RestrictableNode>) {
        let Some(end_node) = self.poll_next_end_node() else {
            return;
        };

        if !self.computed_end_nodes.contains(&end_node) {
            self.released_not_computed_end_nodes.insert(end_node.clone());
        }

        let leafs: Vec<TaskNodeKey> = self
            .end_nodes_to_leafs
            .get(&end_node)
            .map(|leafs| leafs.iter().cloned().collect())
            .unwrap_or_default();

        for leaf in leafs {
            self.add_scheduled_leaf(&leaf);
            if let Some(node) = self.leaf_nodes.remove(&leaf) {
                released.push(node);
            }
        }
    }

    fn add_scheduled_leaf(&mut self, leaf: &TaskNodeKey) {
        let mut retaining = self.scheduled_leaf_nodes.remove(leaf).unwrap_or_default();

        for end_node in self.leafs_to_end_nodes.get(leaf).into_iter().flatten() {
            if self.computed_end_nodes.contains(end_node) {
                continue;
            }
            if !self.released_not_computed_end_nodes.contains(end_node) {
                self.retaining_not_computed_end_nodes.insert(end_node.clone());
            }
            retaining.insert(end_node.clone());
        }

        if !retaining.is_empty() {
            self.scheduled_leaf_nodes.insert(leaf.clone(), retaining);
        }
    }

    fn remove_scheduled_leaf(&mut self, end_node: &TaskNodeKey, leaf: &TaskNodeKey) {
        if let Some(retaining) = self.scheduled_leaf_nodes.get_mut(leaf) {
            retaining.remove(end_node);
            if retaining.is_empty() {
                self.scheduled_leaf_nodes.remove(leaf);
            }
        }
    }

    /// Returns the nodes to release. They are released by the caller so
    /// release actions never run while the state is being updated.
    fn schedule(&mut self) -> Vec<RestrictableNode> {
        let mut released = Vec::new();

        if self.released_not_computed_end_nodes.is_empty() {
            self.schedule_one(&mut released);
        }

        while !self.end_node_queue.is_empty()
            && self.scheduled_leaf_nodes.len() < self.max_retained_leaf_nodes
        {
            self.schedule_one(&mut released);
        }

        released
    }
}

impl TaskExecutionRestrictionStrategy for LeafRestriction {
    fn set_node_computed(&mut self, key: &TaskNodeKey) {
        let Some(leafs) = self.end_nodes_to_leafs.get(key) else {
            return;
        };
        let leafs: Vec<TaskNodeKey> = leafs.iter().cloned().collect();

        self.computed_end_nodes.insert(key.clone());
        self.released_not_computed_end_nodes.remove(key);
        self.retaining_not_computed_end_nodes.remove(key);

        for leaf in &leafs {
            self.remove_scheduled_leaf(key, leaf);
        }

        let released = self.schedule();
        tracing::trace!(node = %key, released = released.len(), "End node computed");
        release_all(released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DirectedGraph;
    use std::sync::{Arc, Mutex};

    fn key(name: &str) -> TaskNodeKey {
        TaskNodeKey::new(name, "")
    }

    type Released = Arc<Mutex<Vec<String>>>;

    /// `edges` maps a node to the nodes it depends on.
    fn setup(edges: &[(&str, &[&str])], isolated: &[&str]) -> (DependencyDag<TaskNodeKey>, Vec<RestrictableNode>, Released) {
        let mut builder = DirectedGraph::builder();
        let mut names: Vec<&str> = isolated.to_vec();
        for &(node, deps) in edges {
            builder.add_node_with_children(key(node), deps.iter().map(|d| key(d)));
            names.push(node);
            names.extend(deps.iter().copied());
        }
        names.sort();
        names.dedup();

        let released: Released = Arc::default();
        let nodes = names
            .into_iter()
            .map(|name| {
                let released = released.clone();
                let label = name.to_string();
                RestrictableNode::new(key(name), move || {
                    released.lock().unwrap().push(label.clone());
                })
            })
            .collect();

        (DependencyDag::new(builder.build()).unwrap(), nodes, released)
    }

    fn released_set(released: &Released) -> HashSet<String> {
        released.lock().unwrap().iter().cloned().collect()
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_eager_releases_everything() {
        let (graph, nodes, released) = setup(&[("end", &["a", "b"])], &["alone"]);
        EagerRestrictionStrategy.build_strategy(&graph, &nodes);
        assert_eq!(released_set(&released), set(&["a", "alone", "b", "end"]));
    }

    #[test]
    fn test_weak_leafs_release_one_end_node_at_a_time() {
        let (graph, nodes, released) = setup(
            &[("e1", &["l1", "l2"]), ("e2", &["l3"]), ("e3", &["l4"])],
            &[],
        );
        let mut strategy = WeakLeafsOfEndNodesRestrictingStrategy::new(1).build_strategy(&graph, &nodes);

        // Non-leaf nodes are released immediately, leafs of a single end node.
        let first = released_set(&released);
        assert!(first.is_superset(&set(&["e1", "e2", "e3"])));
        let first_leafs: HashSet<String> = first.difference(&set(&["e1", "e2", "e3"])).cloned().collect();
        assert!(first_leafs == set(&["l1", "l2"]) || first_leafs == set(&["l3"]) || first_leafs == set(&["l4"]));

        for end in ["e1", "e2", "e3"] {
            strategy.set_node_computed(&key(end));
        }
        assert_eq!(released_set(&released), set(&["e1", "e2", "e3", "l1", "l2", "l3", "l4"]));
    }

    #[test]
    fn test_weak_leafs_progress_after_computation() {
        let (graph, nodes, released) = setup(&[("e1", &["l1"]), ("e2", &["l2"])], &[]);
        let mut strategy = WeakLeafsOfEndNodesRestrictingStrategy::new(1).build_strategy(&graph, &nodes);

        let leafs = |released: &Released| {
            released_set(released)
                .into_iter()
                .filter(|n| n.starts_with('l'))
                .count()
        };
        assert_eq!(leafs(&released), 1);

        let first_end = if released_set(&released).contains("l1") { "e1" } else { "e2" };
        strategy.set_node_computed(&key(first_end));
        assert_eq!(leafs(&released), 2);
    }

    #[test]
    fn test_weak_leafs_release_shared_leaf_end_nodes_first() {
        // "shared" is needed by both e1 and e2, so releasing it for one of
        // them schedules the other before e3.
        let (graph, nodes, released) = setup(
            &[("e1", &["shared"]), ("e2", &["shared", "own"]), ("e3", &["other"])],
            &[],
        );
        let mut strategy = WeakLeafsOfEndNodesRestrictingStrategy::new(1).build_strategy(&graph, &nodes);

        let computed = if released_set(&released).contains("own") { "e2" } else { "e1" };
        strategy.set_node_computed(&key(computed));

        let now = released_set(&released);
        assert!(now.contains("shared"));
        assert!(now.contains("own"));
    }

    #[test]
    fn test_large_limit_releases_everything() {
        let (graph, nodes, released) = setup(&[("e1", &["l1"]), ("e2", &["l2"])], &["alone"]);
        WeakLeafsOfEndNodesRestrictingStrategy::new(100).build_strategy(&graph, &nodes);
        assert_eq!(released_set(&released), set(&["alone", "e1", "e2", "l1", "l2"]));
    }

    #[test]
    fn test_zero_limit_is_one() {
        assert_eq!(WeakLeafsOfEndNodesRestrictingStrategy::new(0).max_retained_leaf_nodes(), 1);
    }
}
