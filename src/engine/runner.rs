mod diagnostics;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::Dynamic;
use crate::cancel::{CancellationSource, CancellationToken};
use crate::engine::{
    NodeInputs, NodeTaskRef, RestrictableNode, RestrictionStrategyFactory, TaskNodeKey,
};
use crate::error::{GraphError, OperationCanceled, TaskError};
use crate::executor::submit;
use crate::graph::DependencyDag;
use crate::utils::{catch_panic, get_style_graph};

pub use diagnostics::Diagnostics;

/// Called with every node failure. Cancellation is not a failure.
pub type ErrorHandler = Arc<dyn Fn(&TaskNodeKey, &anyhow::Error) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct NodeExecution {
    pub start: Instant,
    pub duration: Duration,
}

#[derive(Clone)]
pub struct TaskGraphExecutorProperties {
    /// Cancel the remaining nodes once a node fails.
    pub stop_on_failure: bool,
    /// Return the result even if a node failed or was canceled.
    pub deliver_result_on_failure: bool,
    /// The nodes whose outputs are kept for the result.
    pub result_node_keys: HashSet<TaskNodeKey>,
    pub error_handler: ErrorHandler,
}

impl Default for TaskGraphExecutorProperties {
    fn default() -> Self {
        Self {
            stop_on_failure: false,
            deliver_result_on_failure: false,
            result_node_keys: HashSet::new(),
            error_handler: Arc::new(|key: &TaskNodeKey, e: &anyhow::Error| {
                tracing::error!("Failure while computing node {key}:\n{e:?}");
            }),
        }
    }
}

impl TaskGraphExecutorProperties {
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&TaskNodeKey, &anyhow::Error) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
    }
}

impl Debug for TaskGraphExecutorProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraphExecutorProperties")
            .field("stop_on_failure", &self.stop_on_failure)
            .field("deliver_result_on_failure", &self.deliver_result_on_failure)
            .field("result_node_keys", &self.result_node_keys)
            .finish_non_exhaustive()
    }
}

enum Event {
    Released(TaskNodeKey),
    Finished {
        key: TaskNodeKey,
        outcome: Result<Dynamic, TaskError>,
        execution: Option<NodeExecution>,
    },
}

/// Sends the outcome of a node exactly once. A job dropped by its executor
/// without running reports the node as canceled.
struct Completion {
    key: TaskNodeKey,
    events: Sender<Event>,
    sent: bool,
}

impl Completion {
    fn send(mut self, outcome: Result<Dynamic, TaskError>, execution: Option<NodeExecution>) {
        self.sent = true;
        let _ = self.events.send(Event::Finished {
            key: self.key.clone(),
            outcome,
            execution,
        });
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.events.send(Event::Finished {
                key: self.key.clone(),
                outcome: Err(TaskError::Canceled),
                execution: None,
            });
        }
    }
}

/// A built task graph, ready to be executed once.
pub struct TaskGraphExecutor {
    graph: DependencyDag<TaskNodeKey>,
    nodes: HashMap<TaskNodeKey, NodeTaskRef>,
    strategy: Box<dyn RestrictionStrategyFactory>,
    properties: TaskGraphExecutorProperties,
}

impl TaskGraphExecutor {
    pub fn new(
        graph: DependencyDag<TaskNodeKey>,
        nodes: HashMap<TaskNodeKey, NodeTaskRef>,
        strategy: Box<dyn RestrictionStrategyFactory>,
    ) -> Self {
        Self {
            graph,
            nodes,
            strategy,
            properties: TaskGraphExecutorProperties::default(),
        }
    }

    pub fn graph(&self) -> &DependencyDag<TaskNodeKey> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn properties(&self) -> &TaskGraphExecutorProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut TaskGraphExecutorProperties {
        &mut self.properties
    }

    /// Executes every node, blocking until all of them finished.
    ///
    /// A node starts once its inputs are computed and the restriction
    /// strategy released it. Nodes depending on a failed or canceled node
    /// are not executed and finish with the same outcome. Outputs are
    /// dropped as soon as every consumer started, unless they are results.
    pub fn execute(self, cancel: &CancellationToken) -> Result<TaskGraphExecutionResult, GraphError> {
        let TaskGraphExecutor {
            graph,
            nodes,
            strategy,
            properties,
        } = self;

        let total = nodes.len();
        let source = CancellationSource::child_of(cancel);
        let token = source.token();
        let (events, receiver) = channel::<Event>();

        let span = tracing::span!(Level::INFO, "task_graph");
        span.pb_set_length(total as u64);
        if let Ok(style) = get_style_graph() {
            span.pb_set_style(&style);
        }
        span.pb_set_message("Computing nodes...");
        let _enter = span.enter();

        let mut node_keys: Vec<TaskNodeKey> = nodes.keys().cloned().collect();
        node_keys.sort();
        let mut scheduler = Scheduler::new(&graph, nodes, &properties);

        let restrictable: Vec<RestrictableNode> = {
            let mut keys: Vec<&TaskNodeKey> = scheduler.nodes.keys().collect();
            keys.sort();
            keys.into_iter()
                .map(|key| {
                    let events = events.clone();
                    let key = key.clone();
                    RestrictableNode::new(key.clone(), move || {
                        let _ = events.send(Event::Released(key.clone()));
                    })
                })
                .collect()
        };
        let mut strategy = strategy.build_strategy(&graph, &restrictable);

        let mut completed = 0;
        while completed < total {
            let Ok(event) = receiver.recv() else {
                break;
            };

            let mut finished = match event {
                Event::Released(key) => {
                    scheduler.released.insert(key.clone());
                    scheduler.try_spawn(&key, &token, &events);
                    continue;
                }
                Event::Finished {
                    key,
                    outcome,
                    execution,
                } => {
                    if let Some(execution) = execution {
                        scheduler.execution_times.insert(key.clone(), execution);
                    }
                    if let Err(error) = &outcome {
                        match error {
                            TaskError::Canceled => {
                                tracing::debug!(node = %key, "Node canceled");
                                scheduler.canceled = true;
                            }
                            TaskError::Failed(e) => {
                                scheduler.errored = true;
                                (properties.error_handler)(&key, e);
                                if properties.stop_on_failure {
                                    source.cancel();
                                }
                            }
                        }
                    }
                    vec![(key, outcome)]
                }
            };

            while let Some((key, outcome)) = finished.pop() {
                completed += 1;
                span.pb_inc(1);
                finished.extend(scheduler.complete(&key, outcome, &token, &events));
                strategy.set_node_computed(&key);
            }
        }

        if completed < total {
            tracing::warn!(completed, total, "Task graph stopped before every node finished");
        }

        let Scheduler {
            results,
            execution_times,
            errored,
            canceled,
            ..
        } = scheduler;

        tracing::info!(nodes = total, errored, canceled, "Task graph finished");

        let result = TaskGraphExecutionResult {
            results,
            diagnostics: Diagnostics {
                node_keys,
                execution_times,
            },
            errored,
            canceled,
        };

        if properties.deliver_result_on_failure {
            Ok(result)
        } else if errored {
            Err(GraphError::ExecutionFailed)
        } else if canceled {
            Err(GraphError::Canceled(OperationCanceled))
        } else {
            Ok(result)
        }
    }
}

impl Debug for TaskGraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraphExecutor")
            .field("nodes", &self.nodes.len())
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Bookkeeping of a running graph. Only touched by the thread executing the
/// graph; jobs talk back through the event channel.
struct Scheduler<'a> {
    graph: &'a DependencyDag<TaskNodeKey>,
    result_keys: &'a HashSet<TaskNodeKey>,
    /// Nodes not started yet.
    nodes: HashMap<TaskNodeKey, NodeTaskRef>,
    released: HashSet<TaskNodeKey>,
    pending_inputs: HashMap<TaskNodeKey, usize>,
    /// Consumers of an output which have not started yet.
    pending_consumers: HashMap<TaskNodeKey, usize>,
    outputs: HashMap<TaskNodeKey, Dynamic>,
    results: HashMap<TaskNodeKey, Result<Dynamic, TaskError>>,
    execution_times: HashMap<TaskNodeKey, NodeExecution>,
    errored: bool,
    canceled: bool,
}

impl<'a> Scheduler<'a> {
    fn new(
        graph: &'a DependencyDag<TaskNodeKey>,
        nodes: HashMap<TaskNodeKey, NodeTaskRef>,
        properties: &'a TaskGraphExecutorProperties,
    ) -> Self {
        let pending_inputs = nodes
            .keys()
            .map(|key| {
                let count = graph
                    .dependency_graph()
                    .children(key)
                    .filter(|dep| nodes.contains_key(*dep))
                    .count();
                (key.clone(), count)
            })
            .collect();

        let pending_consumers = nodes
            .keys()
            .map(|key| (key.clone(), graph.forward_graph().children(key).count()))
            .collect();

        Self {
            graph,
            result_keys: &properties.result_node_keys,
            nodes,
            released: HashSet::new(),
            pending_inputs,
            pending_consumers,
            outputs: HashMap::new(),
            results: HashMap::new(),
            execution_times: HashMap::new(),
            errored: false,
            canceled: false,
        }
    }

    /// Starts the node if it is released and its inputs are available.
    fn try_spawn(&mut self, key: &TaskNodeKey, token: &CancellationToken, events: &Sender<Event>) {
        if !self.released.contains(key) || self.pending_inputs.get(key).copied().unwrap_or(0) > 0 {
            return;
        }
        let Some(node) = self.nodes.remove(key) else {
            return;
        };

        let mut inputs = HashMap::new();
        for dep in self.graph.dependency_graph().children(key) {
            if let Some(output) = self.outputs.get(dep) {
                inputs.insert(dep.clone(), output.clone());
            }
            self.consume(dep);
        }

        let completion = Completion {
            key: key.clone(),
            events: events.clone(),
            sent: false,
        };

        if token.is_canceled() {
            completion.send(Err(TaskError::Canceled), None);
            return;
        }

        let (properties, compute) = node.into_parts();
        let token = token.clone();
        let inputs = NodeInputs::new(inputs);

        submit(properties.executor(), move || {
            let span = tracing::span!(Level::INFO, "node", key = %completion.key);
            let _enter = span.enter();

            if token.is_canceled() {
                completion.send(Err(TaskError::Canceled), None);
                return;
            }

            let start = Instant::now();
            let outcome = catch_panic(|| compute(&token, &inputs)).map_err(TaskError::classify);
            let execution = NodeExecution {
                start,
                duration: start.elapsed(),
            };
            completion.send(outcome, Some(execution));
        });
    }

    /// One consumer of `key` started; drops the output once nobody needs it.
    fn consume(&mut self, key: &TaskNodeKey) {
        if let Some(count) = self.pending_consumers.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 && !self.result_keys.contains(key) {
                self.outputs.remove(key);
            }
        }
    }

    /// Records the outcome of a node. Returns the dependents which can no
    /// longer run, finished with the same failure.
    fn complete(
        &mut self,
        key: &TaskNodeKey,
        outcome: Result<Dynamic, TaskError>,
        token: &CancellationToken,
        events: &Sender<Event>,
    ) -> Vec<(TaskNodeKey, Result<Dynamic, TaskError>)> {
        if self.result_keys.contains(key) {
            self.results.insert(key.clone(), outcome.clone());
        }

        let dependents: Vec<TaskNodeKey> = self.graph.forward_graph().children(key).cloned().collect();
        match outcome {
            Ok(output) => {
                let consumers = self.pending_consumers.get(key).copied().unwrap_or(0);
                if consumers > 0 {
                    self.outputs.insert(key.clone(), output);
                }
                for dependent in &dependents {
                    if let Some(count) = self.pending_inputs.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                    self.try_spawn(dependent, token, events);
                }
                Vec::new()
            }
            Err(error) => dependents
                .into_iter()
                .filter_map(|dependent| {
                    self.nodes.remove(&dependent)?;
                    for dep in self.graph.dependency_graph().children(&dependent) {
                        self.consume(dep);
                    }
                    tracing::debug!(node = %dependent, cause = %key, "Node skipped");
                    Some((dependent, Err(error.clone())))
                })
                .collect(),
        }
    }
}

/// Outcome of a task graph execution.
#[derive(Debug)]
pub struct TaskGraphExecutionResult {
    results: HashMap<TaskNodeKey, Result<Dynamic, TaskError>>,
    diagnostics: Diagnostics,
    errored: bool,
    canceled: bool,
}

impl TaskGraphExecutionResult {
    /// The output of a result node.
    pub fn get<R: Send + Sync + 'static>(&self, key: &TaskNodeKey) -> Result<Arc<R>, GraphError> {
        let outcome = self
            .results
            .get(key)
            .ok_or_else(|| GraphError::ResultNotRequested(key.to_string()))?;

        match outcome {
            Ok(value) => value
                .clone()
                .downcast::<R>()
                .map_err(|_| GraphError::ResultTypeMismatch(key.to_string())),
            Err(e) => Err(GraphError::ResultUnavailable(key.to_string(), e.clone())),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskNodeKey> {
        self.results.keys()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Every node completed normally.
    pub fn is_complete(&self) -> bool {
        !self.errored && !self.canceled
    }
}
