use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::{CancellationToken, ListenerRef};
use crate::error::AccessError;
use crate::executor::{InOrderExecutor, Job, SyncTaskExecutor, TaskExecutor};

struct TokenInner<Id> {
    id: Id,
    context: InOrderExecutor,
}

/// A granted right, together with the execution context in which the
/// guarded resources may be touched.
///
/// Jobs submitted to a token run one at a time in submission order. Once
/// shut down a token never accepts work again: pending and future jobs are
/// skipped, their cleanups still run.
pub struct AccessToken<Id> {
    inner: Arc<TokenInner<Id>>,
}

impl<Id> Clone for AccessToken<Id> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Id> AccessToken<Id> {
    pub(crate) fn with_context(id: Id, context: InOrderExecutor) -> Self {
        Self {
            inner: Arc::new(TokenInner { id, context }),
        }
    }

    /// A token running its jobs on `executor`.
    pub fn new(id: Id, executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_context(id, InOrderExecutor::new(executor))
    }

    /// A token running its jobs on the submitting thread, unless another job
    /// of the token is running at the time.
    pub fn sync(id: Id) -> Self {
        Self::new(id, Arc::new(SyncTaskExecutor))
    }

    pub fn id(&self) -> &Id {
        &self.inner.id
    }

    pub(crate) fn context(&self) -> &InOrderExecutor {
        &self.inner.context
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.context.execute(job);
    }

    /// `cleanup` is told whether `job` was skipped.
    pub fn execute_with_cleanup<F, C>(&self, job: F, cleanup: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        self.inner.context.execute_with_cleanup(job, cleanup);
    }

    /// Runs `job` on the calling thread if the token is idle.
    pub fn execute_now<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.context.try_execute_now(job);
    }

    pub fn execute_now_with_cleanup<F, C>(&self, job: F, cleanup: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        self.inner.context.try_execute_now_with_cleanup(job, cleanup);
    }

    /// Runs `job`, then releases the token.
    pub fn execute_and_shutdown<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.inner.context.clone();
        self.inner
            .context
            .execute_with_cleanup(job, move |_| context.shutdown());
    }

    pub fn execute_now_and_shutdown<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.inner.context.clone();
        self.inner
            .context
            .try_execute_now_with_cleanup(job, move |_| context.shutdown());
    }

    /// Releases the token. Queued jobs are skipped.
    pub fn shutdown(&self) {
        self.inner.context.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.context.is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.context.is_terminated()
    }

    pub fn is_executing_in_this(&self) -> bool {
        self.inner.context.is_executing_in_this()
    }

    /// Runs `listener` once the token terminated. Unregister it through the
    /// returned handle when it is no longer needed.
    pub fn add_termination_listener<F>(&self, listener: F) -> ListenerRef
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.context.add_termination_listener(listener)
    }

    #[cfg(test)]
    pub(crate) fn termination_listener_count(&self) -> usize {
        self.inner.context.termination_listener_count()
    }

    /// Blocks until the token terminated.
    ///
    /// Waiting from a job of the token itself would never return, so it is
    /// rejected.
    pub fn await_termination(&self, cancel: &CancellationToken) -> Result<(), AccessError> {
        if self.is_executing_in_this() {
            return Err(AccessError::WaitFromOwnContext);
        }
        Ok(self.inner.context.await_termination(cancel)?)
    }

    pub fn try_await_termination(&self, timeout: Duration) -> Result<bool, AccessError> {
        if self.is_executing_in_this() {
            return Err(AccessError::WaitFromOwnContext);
        }
        Ok(self.inner.context.try_await_termination(timeout))
    }

    /// Returns `true` if both handles refer to the same grant.
    pub fn same_token(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<Id: Send + Sync> TaskExecutor for AccessToken<Id> {
    fn execute(&self, job: Job) {
        self.inner.context.execute(job);
    }
}

impl<Id: Debug> Debug for AccessToken<Id> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("id", &self.inner.id)
            .field("shutdown", &self.is_shutdown())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
