use std::sync::Arc;

use thiserror::Error;

/// Marker error signalling that an operation stopped because it was asked to.
///
/// Callbacks return it (wrapped in `anyhow::Error`) to report cancellation
/// instead of failure. Executors detect it with [`is_canceled_error`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Default)]
#[error("operation canceled")]
pub struct OperationCanceled;

/// Returns `true` if the error is (or wraps) an [`OperationCanceled`].
pub fn is_canceled_error(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<OperationCanceled>())
}

/// The terminal failure of a future-like handle.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("task canceled")]
    Canceled,

    #[error(transparent)]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Failed(Arc::new(err.into()))
    }

    /// Classifies a callback error: cancellation stays cancellation, anything
    /// else is a failure.
    pub fn classify(err: anyhow::Error) -> Self {
        if is_canceled_error(&err) {
            TaskError::Canceled
        } else {
            TaskError::Failed(Arc::new(err))
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }
}

/// Error attached to an [`AsyncReport`](crate::query::AsyncReport) when data
/// production or transfer failed.
#[derive(Debug, Error, Clone)]
#[error("data transfer failed: {0}")]
pub struct DataTransferError(pub(crate) Arc<anyhow::Error>);

impl DataTransferError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for DataTransferError {
    fn from(e: anyhow::Error) -> Self {
        DataTransferError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("The graph is cyclic: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("No task factory is registered for '{0}'")]
    MissingFactory(String),

    #[error("Node '{0}' was added twice")]
    DuplicateNode(String),

    #[error("Failed to create task node '{0}':\n{1}")]
    NodeCreation(String, anyhow::Error),

    #[error("Node '{0}' was not requested as a result")]
    ResultNotRequested(String),

    #[error("Node '{0}' produced a value of a different type")]
    ResultTypeMismatch(String),

    #[error("Node '{0}' has no result:\n{1}")]
    ResultUnavailable(String, TaskError),

    #[error("Task graph execution failed")]
    ExecutionFailed,

    #[error(transparent)]
    Canceled(#[from] OperationCanceled),
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("Cannot wait for an access token from its own execution context")]
    WaitFromOwnContext,

    #[error(transparent)]
    Canceled(#[from] OperationCanceled),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't build thread pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_canceled() {
        let err = anyhow::Error::new(OperationCanceled).context("while evaluating");
        assert!(TaskError::classify(err).is_canceled());
    }

    #[test]
    fn test_classify_failure() {
        let err = anyhow::anyhow!("boom");
        match TaskError::classify(err) {
            TaskError::Failed(e) => assert_eq!(e.to_string(), "boom"),
            TaskError::Canceled => panic!("expected a failure"),
        }
    }

    #[test]
    fn test_cycle_message() {
        let err = GraphError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "The graph is cyclic: a -> b -> a");
    }
}
