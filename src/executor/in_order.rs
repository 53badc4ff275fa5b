use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::cancel::{CancellationSource, CancellationToken, ListenerRef};
use crate::error::OperationCanceled;
use crate::executor::{Job, TaskExecutor};
use crate::utils::run_logged;

/// Called after a job ran, or instead of it. The flag is `true` when the job
/// was skipped because the executor was shut down first.
pub type Cleanup = Box<dyn FnOnce(bool) + Send + 'static>;

struct QueuedJob {
    task: Job,
    cleanup: Option<Cleanup>,
}

impl QueuedJob {
    fn skip(self) {
        if let Some(cleanup) = self.cleanup {
            run_logged(|| cleanup(true));
        }
    }
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<QueuedJob>,
    running: bool,
    paused: bool,
    shutdown: bool,
    terminated: bool,
    worker: Option<ThreadId>,
}

struct Inner {
    executor: Arc<dyn TaskExecutor>,
    state: Mutex<QueueState>,
    idle: Condvar,
    /// Canceled once the executor terminated.
    terminated: CancellationSource,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks the executor terminated if nothing can run anymore. Returns
    /// `true` if the listeners have to be notified.
    fn try_terminate(&self, state: &mut QueueState) -> bool {
        if state.shutdown && !state.running && !state.terminated {
            state.terminated = true;
            self.idle.notify_all();
            true
        } else {
            false
        }
    }

    /// Must be called without holding the state lock.
    fn notify_terminated(&self, terminated: bool) {
        if terminated {
            self.terminated.cancel();
        }
    }
}

fn schedule_drain(inner: Arc<Inner>) {
    let executor = inner.executor.clone();
    executor.execute(Box::new(move || drain(inner)));
}

fn drain(inner: Arc<Inner>) {
    let current = thread::current().id();

    loop {
        let job = {
            let mut state = inner.lock();
            match state.jobs.pop_front() {
                Some(job) if !state.paused => {
                    state.worker = Some(current);
                    job
                }
                other => {
                    if let Some(job) = other {
                        state.jobs.push_front(job);
                    }
                    state.running = false;
                    state.worker = None;
                    let terminated = inner.try_terminate(&mut state);
                    drop(state);
                    inner.notify_terminated(terminated);
                    return;
                }
            }
        };

        let QueuedJob { task, cleanup } = job;
        run_logged(task);
        if let Some(cleanup) = cleanup {
            run_logged(|| cleanup(false));
        }
    }
}

/// Runs submitted jobs one at a time, in submission order, on top of another
/// executor.
///
/// Once shut down, queued jobs are dropped (their cleanups are told so) and
/// the executor terminates when the job that is currently running returns.
#[derive(Clone)]
pub struct InOrderExecutor {
    inner: Arc<Inner>,
}

impl InOrderExecutor {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_state(executor, QueueState::default())
    }

    /// Creates an executor which accepts jobs but doesn't run them until
    /// [`resume`](Self::resume) is called.
    pub fn new_paused(executor: Arc<dyn TaskExecutor>) -> Self {
        Self::with_state(
            executor,
            QueueState {
                paused: true,
                ..Default::default()
            },
        )
    }

    fn with_state(executor: Arc<dyn TaskExecutor>, state: QueueState) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                state: Mutex::new(state),
                idle: Condvar::new(),
                terminated: CancellationSource::new(),
            }),
        }
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(QueuedJob {
            task: Box::new(job),
            cleanup: None,
        });
    }

    /// Submits a job with a cleanup that always runs: after the job, or in
    /// place of it if the job gets skipped.
    pub fn execute_with_cleanup<F, C>(&self, job: F, cleanup: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        self.enqueue(QueuedJob {
            task: Box::new(job),
            cleanup: Some(Box::new(cleanup)),
        });
    }

    fn enqueue(&self, job: QueuedJob) {
        let start = {
            let mut state = self.inner.lock();
            if state.shutdown {
                drop(state);
                job.skip();
                return;
            }

            state.jobs.push_back(job);
            let start = !state.running && !state.paused;
            if start {
                state.running = true;
            }
            start
        };

        if start {
            schedule_drain(self.inner.clone());
        }
    }

    /// Runs the job on the calling thread if the executor is idle, otherwise
    /// queues it like [`execute`](Self::execute).
    pub fn try_execute_now<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_run_now(QueuedJob {
            task: Box::new(job),
            cleanup: None,
        });
    }

    pub fn try_execute_now_with_cleanup<F, C>(&self, job: F, cleanup: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        self.try_run_now(QueuedJob {
            task: Box::new(job),
            cleanup: Some(Box::new(cleanup)),
        });
    }

    fn try_run_now(&self, job: QueuedJob) {
        {
            let mut state = self.inner.lock();
            if state.shutdown {
                drop(state);
                job.skip();
                return;
            }
            if state.running || state.paused || !state.jobs.is_empty() {
                drop(state);
                self.enqueue(job);
                return;
            }
            state.running = true;
            state.worker = Some(thread::current().id());
        }

        let QueuedJob { task, cleanup } = job;
        run_logged(task);
        if let Some(cleanup) = cleanup {
            run_logged(|| cleanup(false));
        }

        // Whatever arrived in the meantime goes to the backing executor.
        let mut state = self.inner.lock();
        state.worker = None;
        if !state.jobs.is_empty() && !state.paused {
            drop(state);
            schedule_drain(self.inner.clone());
        } else {
            state.running = false;
            let terminated = self.inner.try_terminate(&mut state);
            drop(state);
            self.inner.notify_terminated(terminated);
        }
    }

    /// Starts running the jobs of a paused executor.
    pub fn resume(&self) {
        let start = {
            let mut state = self.inner.lock();
            if !state.paused {
                return;
            }
            state.paused = false;
            let start = !state.running && !state.jobs.is_empty();
            if start {
                state.running = true;
            }
            start
        };

        if start {
            schedule_drain(self.inner.clone());
        }
    }

    /// Stops accepting jobs and skips the queued ones. Returns immediately;
    /// the executor terminates once the running job (if any) returns.
    pub fn shutdown(&self) {
        let (skipped, terminated) = {
            let mut state = self.inner.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let skipped = std::mem::take(&mut state.jobs);
            let terminated = self.inner.try_terminate(&mut state);
            (skipped, terminated)
        };

        for job in skipped {
            job.skip();
        }
        self.inner.notify_terminated(terminated);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminated
    }

    /// Returns `true` if called from a job run by this executor.
    pub fn is_executing_in_this(&self) -> bool {
        self.inner.lock().worker == Some(thread::current().id())
    }

    /// Runs `listener` once the executor terminated; immediately if it
    /// already did. The returned handle unregisters the listener.
    pub fn add_termination_listener<F>(&self, listener: F) -> ListenerRef
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .terminated
            .token()
            .add_cancellation_listener(move || run_logged(listener))
    }

    #[cfg(test)]
    pub(crate) fn termination_listener_count(&self) -> usize {
        self.inner.terminated.token().listener_count()
    }

    /// Blocks until the executor terminated or `cancel` is signalled.
    pub fn await_termination(&self, cancel: &CancellationToken) -> Result<(), OperationCanceled> {
        let inner = self.inner.clone();
        let wakeup = cancel.add_cancellation_listener(move || {
            let _state = inner.lock();
            inner.idle.notify_all();
        });

        let mut state = self.inner.lock();
        let result = loop {
            if state.terminated {
                break Ok(());
            }
            if cancel.is_canceled() {
                break Err(OperationCanceled);
            }
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        };
        drop(state);

        wakeup.unregister();
        result
    }

    /// Waits at most `timeout`. Returns `true` if the executor terminated.
    pub fn try_await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while !state.terminated {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}

impl TaskExecutor for InOrderExecutor {
    fn execute(&self, job: Job) {
        self.enqueue(QueuedJob {
            task: job,
            cleanup: None,
        });
    }
}

impl std::fmt::Debug for InOrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("InOrderExecutor")
            .field("queued", &state.jobs.len())
            .field("running", &state.running)
            .field("shutdown", &state.shutdown)
            .field("terminated", &state.terminated)
            .finish()
    }
}
