//! Executors: things that run jobs somewhere.
//!
//! Everything in the crate schedules work through [`TaskExecutor`], so the
//! caller decides whether jobs land on a rayon pool, on a tokio blocking pool
//! or on the calling thread.

mod future;
mod in_order;
mod ticker;
#[cfg(feature = "tokio")]
mod tokio_pool;
mod update;

use std::sync::Arc;

use crate::config::ExecutorConfig;
use crate::error::ConfigError;

pub use future::{TaskCompleter, TaskFuture, pending, pending_with_finalizer};
pub use in_order::InOrderExecutor;
pub use ticker::{TickHandle, TickScheduler};
#[cfg(feature = "tokio")]
pub use tokio_pool::TokioExecutor;
pub use update::UpdateTaskExecutor;

/// A unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs. Implementations may run them on any thread, in any order,
/// unless they document otherwise.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, job: Job);
}

impl<E: TaskExecutor + ?Sized> TaskExecutor for Arc<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job)
    }
}

/// Submits a closure without boxing at the call site.
pub(crate) fn submit<E, F>(executor: &E, job: F)
where
    E: TaskExecutor + ?Sized,
    F: FnOnce() + Send + 'static,
{
    executor.execute(Box::new(job))
}

/// Runs every job on the calling thread before returning.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncTaskExecutor;

impl TaskExecutor for SyncTaskExecutor {
    fn execute(&self, job: Job) {
        crate::utils::run_logged(job)
    }
}

/// Runs jobs on a rayon thread pool.
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
}

impl ThreadPoolExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self, ConfigError> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .panic_handler(|panic| {
                tracing::error!("{}", crate::utils::panic_message(panic.as_ref()));
            })
            .thread_name({
                let name = config.thread_name.clone();
                move |i| format!("{name}-{i}")
            });

        if let Some(threads) = config.threads {
            if threads == 0 {
                return Err(ConfigError::Invalid(
                    "executor.threads must be positive".into(),
                ));
            }
            builder = builder.num_threads(threads);
        }

        Ok(Self {
            pool: builder.build()?,
        })
    }

    pub fn from_pool(pool: rayon::ThreadPool) -> Self {
        Self { pool }
    }

    pub fn current_num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskExecutor for ThreadPoolExecutor {
    fn execute(&self, job: Job) {
        self.pool.spawn(job);
    }
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("threads", &self.current_num_threads())
            .finish()
    }
}

/// Runs every job on a fresh thread. Mostly useful in tests, where a
/// blocking job must not starve the others.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPerJobExecutor;

impl TaskExecutor for ThreadPerJobExecutor {
    fn execute(&self, job: Job) {
        std::thread::spawn(move || crate::utils::run_logged(job));
    }
}
