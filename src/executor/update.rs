use std::sync::{Arc, Mutex};

use crate::executor::{Job, TaskExecutor};
use crate::utils::run_logged;

/// Coalesces bursts of jobs: a job submitted while an earlier one is still
/// waiting replaces it, so only the latest pending job runs.
///
/// Useful for state and progress updates, where only the newest value
/// matters. Ordering between consecutive runs is the ordering of the wrapped
/// executor, so wrap an [`InOrderExecutor`](super::InOrderExecutor) when the
/// updates must not overlap.
#[derive(Clone)]
pub struct UpdateTaskExecutor {
    executor: Arc<dyn TaskExecutor>,
    pending: Arc<Mutex<Option<Job>>>,
}

impl UpdateTaskExecutor {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(job));
    }

    fn submit(&self, job: Job) {
        let was_idle = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(job)
            .is_none();

        if was_idle {
            let pending = self.pending.clone();
            self.executor.execute(Box::new(move || {
                let job = pending.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(job) = job {
                    run_logged(job);
                }
            }));
        }
    }
}

impl TaskExecutor for UpdateTaskExecutor {
    fn execute(&self, job: Job) {
        self.submit(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{InOrderExecutor, SyncTaskExecutor};

    #[test]
    fn test_only_latest_pending_runs() {
        let context = InOrderExecutor::new_paused(Arc::new(SyncTaskExecutor));
        let updates = UpdateTaskExecutor::new(Arc::new(context.clone()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            updates.execute(move || seen.lock().unwrap().push(i));
        }
        context.resume();

        assert_eq!(*seen.lock().unwrap(), vec![4]);
    }

    #[test]
    fn test_runs_again_after_drain() {
        let updates = UpdateTaskExecutor::new(Arc::new(SyncTaskExecutor));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            updates.execute(move || seen.lock().unwrap().push(i));
        }

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
