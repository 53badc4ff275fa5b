//! Task graphs.
//!
//! Nodes are created on demand by task factories: a factory receives the key
//! of the node to create, binds the inputs the node needs (which creates
//! those nodes in turn) and returns the function computing the node. Once
//! every node is created, the graph executes each node as soon as its inputs
//! are available and the restriction strategy admitted it.
//!
//! Outputs are type-erased as [`Dynamic`]. A [`TaskInputRef<R>`] remembers
//! the type of the input it refers to, so reading an input is checked once,
//! when it is downcast.

mod builder;
mod node;
mod runner;
mod strategy;

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::Dynamic;
use crate::cancel::CancellationToken;
use crate::error::GraphError;
use crate::executor::{SyncTaskExecutor, TaskExecutor};

pub use builder::CollectingTaskGraphBuilder;
pub use node::RestrictableNode;
pub use runner::{
    Diagnostics, ErrorHandler, NodeExecution, TaskGraphExecutionResult, TaskGraphExecutor,
    TaskGraphExecutorProperties,
};
pub use strategy::{
    EagerRestrictionStrategy, RestrictionStrategyFactory, TaskExecutionRestrictionStrategy,
    WeakLeafsOfEndNodesRestrictingStrategy,
};

/// Identifies a node: the factory creating it and the argument passed to
/// that factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskNodeKey {
    factory: Arc<str>,
    arg: Arc<str>,
}

impl TaskNodeKey {
    pub fn new(factory: impl Into<Arc<str>>, arg: impl Into<Arc<str>>) -> Self {
        Self {
            factory: factory.into(),
            arg: arg.into(),
        }
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn arg(&self) -> &str {
        &self.arg
    }
}

impl Display for TaskNodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.arg.is_empty() {
            write!(f, "{}", self.factory)
        } else {
            write!(f, "{}({})", self.factory, self.arg)
        }
    }
}

/// The function computing a node. Called at most once.
pub type NodeFn = Box<dyn FnOnce(&CancellationToken, &NodeInputs) -> anyhow::Result<Dynamic> + Send>;

/// Wraps a typed node function.
pub fn node_fn<R, F>(compute: F) -> NodeFn
where
    R: Send + Sync + 'static,
    F: FnOnce(&CancellationToken, &NodeInputs) -> anyhow::Result<R> + Send + 'static,
{
    Box::new(move |cancel, inputs| Ok(Arc::new(compute(cancel, inputs)?) as Dynamic))
}

/// How a node is computed.
#[derive(Clone)]
pub struct TaskNodeProperties {
    executor: Arc<dyn TaskExecutor>,
}

impl TaskNodeProperties {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    pub fn set_executor(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executor = executor;
    }
}

/// Nodes are computed on the thread scheduling them unless configured
/// otherwise.
impl Default for TaskNodeProperties {
    fn default() -> Self {
        Self::new(Arc::new(SyncTaskExecutor))
    }
}

impl Debug for TaskNodeProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskNodeProperties").finish_non_exhaustive()
    }
}

/// A created node: its function and the properties it runs with.
pub struct NodeTaskRef {
    properties: TaskNodeProperties,
    compute: NodeFn,
}

impl NodeTaskRef {
    pub fn new(properties: TaskNodeProperties, compute: NodeFn) -> Self {
        Self {
            properties,
            compute,
        }
    }

    pub fn properties(&self) -> &TaskNodeProperties {
        &self.properties
    }

    pub(crate) fn into_parts(self) -> (TaskNodeProperties, NodeFn) {
        (self.properties, self.compute)
    }
}

/// Reference to an input bound while creating a node.
pub struct TaskInputRef<R> {
    key: TaskNodeKey,
    _marker: PhantomData<fn() -> R>,
}

impl<R> TaskInputRef<R> {
    pub fn key(&self) -> &TaskNodeKey {
        &self.key
    }
}

impl<R> Clone for TaskInputRef<R> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R> Debug for TaskInputRef<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TaskInputRef").field(&self.key).finish()
    }
}

/// What a factory gets to create a node with.
pub struct TaskNodeCreateArgs {
    key: TaskNodeKey,
    properties: TaskNodeProperties,
    inputs: Vec<TaskNodeKey>,
}

impl TaskNodeCreateArgs {
    pub(crate) fn new(key: TaskNodeKey, properties: TaskNodeProperties) -> Self {
        Self {
            key,
            properties,
            inputs: Vec::new(),
        }
    }

    pub fn key(&self) -> &TaskNodeKey {
        &self.key
    }

    pub fn arg(&self) -> &str {
        self.key.arg()
    }

    pub fn properties(&self) -> &TaskNodeProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut TaskNodeProperties {
        &mut self.properties
    }

    /// Declares that the node needs the output of `key`, of type `R`.
    pub fn bind_input<R>(&mut self, key: TaskNodeKey) -> TaskInputRef<R> {
        if !self.inputs.contains(&key) {
            self.inputs.push(key.clone());
        }
        TaskInputRef {
            key,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_parts(self) -> (TaskNodeProperties, Vec<TaskNodeKey>) {
        (self.properties, self.inputs)
    }
}

/// The outputs of the inputs of a node.
#[derive(Default)]
pub struct NodeInputs {
    values: HashMap<TaskNodeKey, Dynamic>,
}

impl NodeInputs {
    pub(crate) fn new(values: HashMap<TaskNodeKey, Dynamic>) -> Self {
        Self { values }
    }

    pub fn get<R: Send + Sync + 'static>(&self, input: &TaskInputRef<R>) -> anyhow::Result<Arc<R>> {
        let value = self
            .values
            .get(&input.key)
            .ok_or_else(|| anyhow::anyhow!("Input '{}' is not available", input.key))?;

        value
            .clone()
            .downcast::<R>()
            .map_err(|_| GraphError::ResultTypeMismatch(input.key.to_string()).into())
    }

    pub fn get_dynamic(&self, key: &TaskNodeKey) -> Option<&Dynamic> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Creates the nodes of one factory.
pub trait TaskFactory: Send + Sync {
    fn create_task_node(
        &self,
        cancel: &CancellationToken,
        args: &mut TaskNodeCreateArgs,
    ) -> anyhow::Result<NodeFn>;
}

impl<F> TaskFactory for F
where
    F: Fn(&CancellationToken, &mut TaskNodeCreateArgs) -> anyhow::Result<NodeFn> + Send + Sync,
{
    fn create_task_node(
        &self,
        cancel: &CancellationToken,
        args: &mut TaskNodeCreateArgs,
    ) -> anyhow::Result<NodeFn> {
        self(cancel, args)
    }
}

/// A factory registered under a name, with the default properties of the
/// nodes it creates.
#[derive(Clone)]
pub struct TaskFactoryConfig {
    name: Arc<str>,
    factory: Arc<dyn TaskFactory>,
    node_properties: TaskNodeProperties,
}

impl TaskFactoryConfig {
    pub fn new(name: impl Into<Arc<str>>, factory: impl TaskFactory + 'static) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            node_properties: TaskNodeProperties::default(),
        }
    }

    /// Registers a closure as factory.
    pub fn from_fn<F>(name: impl Into<Arc<str>>, factory: F) -> Self
    where
        F: Fn(&CancellationToken, &mut TaskNodeCreateArgs) -> anyhow::Result<NodeFn>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, factory)
    }

    /// Nodes of this factory run on `executor` unless the factory overrides
    /// it.
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.node_properties.set_executor(executor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn factory(&self) -> &dyn TaskFactory {
        self.factory.as_ref()
    }

    pub(crate) fn node_properties(&self) -> &TaskNodeProperties {
        &self.node_properties
    }
}

impl Debug for TaskFactoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFactoryConfig")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(TaskNodeKey::new("sum", "1..3").to_string(), "sum(1..3)");
        assert_eq!(TaskNodeKey::new("config", "").to_string(), "config");
    }

    #[test]
    fn test_bind_input_deduplicates() {
        let mut args = TaskNodeCreateArgs::new(TaskNodeKey::new("sum", "x"), TaskNodeProperties::default());
        let a: TaskInputRef<u32> = args.bind_input(TaskNodeKey::new("num", "1"));
        let _: TaskInputRef<u32> = args.bind_input(TaskNodeKey::new("num", "1"));
        assert_eq!(a.key().arg(), "1");

        let (_, inputs) = args.into_parts();
        assert_eq!(inputs.len(), 1);
    }

    #[test]
    fn test_inputs_downcast() {
        let key = TaskNodeKey::new("num", "1");
        let inputs = NodeInputs::new(HashMap::from([(key.clone(), Arc::new(7u32) as Dynamic)]));

        let mut args = TaskNodeCreateArgs::new(TaskNodeKey::new("sum", ""), TaskNodeProperties::default());
        let good: TaskInputRef<u32> = args.bind_input(key.clone());
        let bad: TaskInputRef<String> = args.bind_input(key);
        let missing: TaskInputRef<u32> = args.bind_input(TaskNodeKey::new("num", "2"));

        assert_eq!(*inputs.get(&good).unwrap(), 7);
        assert!(inputs.get(&bad).is_err());
        assert!(inputs.get(&missing).is_err());
    }
}
