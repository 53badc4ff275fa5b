use tokio::runtime::Handle;

use crate::executor::{Job, TaskExecutor};
use crate::utils::run_logged;

/// Runs jobs on the blocking pool of a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime the caller is running in. Fails outside of a runtime.
    pub fn current() -> Result<Self, tokio::runtime::TryCurrentError> {
        Ok(Self::new(Handle::try_current()?))
    }
}

impl TaskExecutor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn_blocking(move || run_logged(job));
    }
}
