use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::engine::{
    NodeTaskRef, RestrictionStrategyFactory, TaskFactoryConfig, TaskGraphExecutor,
    TaskNodeCreateArgs, TaskNodeKey,
};
use crate::error::{GraphError, OperationCanceled, is_canceled_error};
use crate::graph::{DependencyDag, DirectedGraph};
use crate::utils::catch_panic;

/// Collects the requested nodes of a graph, then creates them together with
/// every node they transitively need.
///
/// ```no_run
/// # use jtrim::cancel::CancellationToken;
/// # use jtrim::engine::*;
/// let numbers = TaskFactoryConfig::from_fn("num", |_, args| {
///     let value: u64 = args.arg().parse()?;
///     Ok(node_fn(move |_, _| Ok(value)))
/// });
///
/// let mut builder = CollectingTaskGraphBuilder::new([numbers]);
/// builder.add_node(TaskNodeKey::new("num", "3")).unwrap();
///
/// let cancel = CancellationToken::uncancelable();
/// let graph = builder.build_graph(&cancel, Box::new(EagerRestrictionStrategy)).unwrap();
/// let result = graph.execute(&cancel).unwrap();
/// ```
#[derive(Debug)]
pub struct CollectingTaskGraphBuilder {
    configs: HashMap<Arc<str>, TaskFactoryConfig>,
    node_keys: Vec<TaskNodeKey>,
    node_key_set: HashSet<TaskNodeKey>,
}

impl CollectingTaskGraphBuilder {
    /// Registers the given factories. A later factory with the same name
    /// replaces an earlier one.
    pub fn new(configs: impl IntoIterator<Item = TaskFactoryConfig>) -> Self {
        let configs = configs
            .into_iter()
            .map(|config| (Arc::from(config.name()), config))
            .collect();

        Self {
            configs,
            node_keys: Vec::new(),
            node_key_set: HashSet::new(),
        }
    }

    /// Requests a node. Requested nodes are the results of the graph.
    pub fn add_node(&mut self, key: TaskNodeKey) -> Result<(), GraphError> {
        if !self.configs.contains_key(key.factory()) {
            return Err(GraphError::MissingFactory(key.factory().to_string()));
        }
        if !self.node_key_set.insert(key.clone()) {
            return Err(GraphError::DuplicateNode(key.to_string()));
        }
        self.node_keys.push(key);
        Ok(())
    }

    pub fn node_keys(&self) -> &[TaskNodeKey] {
        &self.node_keys
    }

    /// Creates every node reachable from the requested ones. The requested
    /// nodes become the result nodes of the returned executor.
    pub fn build_graph(
        &self,
        cancel: &CancellationToken,
        strategy: Box<dyn RestrictionStrategyFactory>,
    ) -> Result<TaskGraphExecutor, GraphError> {
        let span = tracing::info_span!("build_graph", requested = self.node_keys.len());
        let _enter = span.enter();

        let mut nodes: HashMap<TaskNodeKey, NodeTaskRef> = HashMap::new();
        let mut graph = DirectedGraph::builder();
        let mut queue: VecDeque<TaskNodeKey> = self.node_keys.iter().cloned().collect();
        let mut seen: HashSet<TaskNodeKey> = self.node_key_set.clone();

        while let Some(key) = queue.pop_front() {
            cancel.check_canceled()?;

            let config = self
                .configs
                .get(key.factory())
                .ok_or_else(|| GraphError::MissingFactory(key.factory().to_string()))?;

            let mut args = TaskNodeCreateArgs::new(key.clone(), config.node_properties().clone());
            let compute = catch_panic(|| config.factory().create_task_node(cancel, &mut args))
                .map_err(|e| {
                    if is_canceled_error(&e) {
                        GraphError::Canceled(OperationCanceled)
                    } else {
                        GraphError::NodeCreation(key.to_string(), e)
                    }
                })?;

            let (properties, inputs) = args.into_parts();
            for input in &inputs {
                if seen.insert(input.clone()) {
                    queue.push_back(input.clone());
                }
            }
            tracing::trace!(node = %key, inputs = inputs.len(), "Created task node");

            graph.add_node_with_children(key.clone(), inputs);
            nodes.insert(key, NodeTaskRef::new(properties, compute));
        }

        let graph = DependencyDag::new(graph.build())?;
        tracing::debug!(nodes = nodes.len(), "Task graph built");

        let mut executor = TaskGraphExecutor::new(graph, nodes, strategy);
        executor
            .properties_mut()
            .result_node_keys
            .extend(self.node_keys.iter().cloned());
        Ok(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EagerRestrictionStrategy, node_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leaf_factory(created: Arc<AtomicUsize>) -> TaskFactoryConfig {
        TaskFactoryConfig::from_fn("leaf", move |_, _| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(node_fn(|_, _| Ok(1u32)))
        })
    }

    fn pair_factory() -> TaskFactoryConfig {
        TaskFactoryConfig::from_fn("pair", |_, args| {
            let arg = args.arg().to_string();
            let _ = args.bind_input::<u32>(TaskNodeKey::new("leaf", format!("{arg}.a")));
            let _ = args.bind_input::<u32>(TaskNodeKey::new("leaf", "shared"));
            Ok(node_fn(|_, inputs| Ok(inputs.len())))
        })
    }

    #[test]
    fn test_add_node_validation() {
        let mut builder = CollectingTaskGraphBuilder::new([pair_factory()]);
        assert!(builder.add_node(TaskNodeKey::new("pair", "x")).is_ok());
        assert!(matches!(
            builder.add_node(TaskNodeKey::new("pair", "x")),
            Err(GraphError::DuplicateNode(_))
        ));
        assert!(matches!(
            builder.add_node(TaskNodeKey::new("missing", "x")),
            Err(GraphError::MissingFactory(_))
        ));
    }

    #[test]
    fn test_shared_inputs_created_once() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut builder = CollectingTaskGraphBuilder::new([pair_factory(), leaf_factory(created.clone())]);
        builder.add_node(TaskNodeKey::new("pair", "x")).unwrap();
        builder.add_node(TaskNodeKey::new("pair", "y")).unwrap();

        let cancel = CancellationToken::uncancelable();
        let executor = builder
            .build_graph(&cancel, Box::new(EagerRestrictionStrategy))
            .unwrap();

        // x.a, y.a and shared
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(executor.node_count(), 5);
    }

    #[test]
    fn test_missing_input_factory() {
        let mut builder = CollectingTaskGraphBuilder::new([pair_factory()]);
        builder.add_node(TaskNodeKey::new("pair", "x")).unwrap();

        let result = builder.build_graph(&CancellationToken::uncancelable(), Box::new(EagerRestrictionStrategy));
        assert!(matches!(result, Err(GraphError::MissingFactory(name)) if name == "leaf"));
    }

    #[test]
    fn test_cycle_detected() {
        let cyclic = TaskFactoryConfig::from_fn("loop", |_, args| {
            let next = if args.arg() == "a" { "b" } else { "a" };
            let _ = args.bind_input::<u32>(TaskNodeKey::new("loop", next));
            Ok(node_fn(|_, _| Ok(0u32)))
        });

        let mut builder = CollectingTaskGraphBuilder::new([cyclic]);
        builder.add_node(TaskNodeKey::new("loop", "a")).unwrap();

        let result = builder.build_graph(&CancellationToken::uncancelable(), Box::new(EagerRestrictionStrategy));
        assert!(matches!(result, Err(GraphError::Cycle(path)) if path.len() == 3));
    }

    #[test]
    fn test_factory_failure_and_panic() {
        let failing = TaskFactoryConfig::from_fn("fail", |_, args| {
            if args.arg() == "panic" {
                panic!("factory panicked");
            }
            anyhow::bail!("cannot create")
        });

        for arg in ["error", "panic"] {
            let mut builder = CollectingTaskGraphBuilder::new([failing.clone()]);
            builder.add_node(TaskNodeKey::new("fail", arg)).unwrap();
            let result = builder.build_graph(&CancellationToken::uncancelable(), Box::new(EagerRestrictionStrategy));
            assert!(matches!(result, Err(GraphError::NodeCreation(key, _)) if key == format!("fail({arg})")));
        }
    }

    #[test]
    fn test_canceled_build() {
        let created = Arc::new(AtomicUsize::new(0));
        let mut builder = CollectingTaskGraphBuilder::new([leaf_factory(created.clone())]);
        builder.add_node(TaskNodeKey::new("leaf", "a")).unwrap();

        let result = builder.build_graph(&CancellationToken::canceled(), Box::new(EagerRestrictionStrategy));
        assert!(matches!(result, Err(GraphError::Canceled(_))));
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }
}
