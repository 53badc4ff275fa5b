//! Read-evaluate-write tasks.
//!
//! A REW task reads its input in the context of a read token, evaluates it
//! somewhere else and writes the result in the context of a write token.
//! Progress and intermediate data produced while evaluating are written in
//! the context of the write token as well, so they are ordered relative to
//! each other and to the final output.
//!
//! Tasks are moved into the executor, so a task object can only ever be
//! submitted once.

mod base;
mod generic;
mod query;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::Dynamic;
use crate::access::AccessToken;
use crate::cancel::CancellationToken;
use crate::error::TaskError;
use crate::executor::TaskFuture;

pub use generic::GenericRewTaskExecutor;
pub use query::{AutoReportRewQueryExecutor, RewQuery};

/// The lifecycle of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RewPhase {
    Created,
    Reading,
    Evaluating,
    Writing,
    Completed,
    Errored,
    Canceled,
}

impl RewPhase {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Canceled)
    }
}

/// Progress reported by an evaluating task.
#[derive(Clone)]
pub struct TaskProgress {
    pub progress: f64,
    pub data: Option<Dynamic>,
}

impl TaskProgress {
    pub fn new(progress: f64) -> Self {
        Self {
            progress: progress.clamp(0.0, 1.0),
            data: None,
        }
    }

    pub fn with_data(progress: f64, data: Dynamic) -> Self {
        Self {
            data: Some(data),
            ..Self::new(progress)
        }
    }
}

impl std::fmt::Debug for TaskProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProgress")
            .field("progress", &self.progress)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

/// A task evaluated by [`GenericRewTaskExecutor`].
///
/// Every method may be called from a different thread, but never two of
/// `read_input`, `evaluate` and `write_output` at the same time.
/// `write_progress` and `write_data` run in the write context while
/// `evaluate` is still running.
pub trait RewTask: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn read_input(&self, cancel: &CancellationToken) -> anyhow::Result<Self::Input>;

    fn evaluate(
        &self,
        input: Self::Input,
        cancel: &CancellationToken,
        reporter: &RewTaskReporter,
    ) -> anyhow::Result<Self::Output>;

    fn write_output(&self, output: Self::Output) -> anyhow::Result<()>;

    fn write_progress(&self, _progress: TaskProgress) {}

    fn write_data(&self, _data: Dynamic) {}

    /// Called when the task gets canceled. May be called any number of times,
    /// from any thread, even before the task started; must not block.
    fn cancel(&self) {}
}

type ProgressSink = Box<dyn Fn(TaskProgress) + Send + Sync>;
type DataSink = Box<dyn Fn(Dynamic) + Send + Sync>;

/// Forwards what an evaluating task reports to its write context.
pub struct RewTaskReporter {
    progress: ProgressSink,
    data: DataSink,
}

impl RewTaskReporter {
    pub fn new<P, D>(progress: P, data: D) -> Self
    where
        P: Fn(TaskProgress) + Send + Sync + 'static,
        D: Fn(Dynamic) + Send + Sync + 'static,
    {
        Self {
            progress: Box::new(progress),
            data: Box::new(data),
        }
    }

    /// Progress updates are coalesced: when updates arrive faster than they
    /// are written, only the latest one is.
    pub fn report_progress(&self, progress: TaskProgress) {
        (self.progress)(progress)
    }

    /// Every data value is written, in the order reported.
    pub fn report_data(&self, data: Dynamic) {
        (self.data)(data)
    }
}

/// Handle of a submitted task.
///
/// Cancelling races with completion: `cancel` returning `true` means the
/// outcome is cancellation, but the task may have already written some or
/// all of its output.
#[derive(Clone)]
pub struct RewFuture {
    future: TaskFuture<()>,
    phase: Arc<Mutex<RewPhase>>,
}

impl RewFuture {
    pub fn cancel(&self) -> bool {
        self.future.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    pub fn is_canceled(&self) -> bool {
        self.future.is_canceled()
    }

    pub fn phase(&self) -> RewPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait(&self) -> Result<(), TaskError> {
        self.future.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.future.wait_timeout(timeout)
    }

    pub fn on_done<F>(&self, listener: F)
    where
        F: FnOnce(&Result<(), TaskError>) + Send + 'static,
    {
        self.future.on_done(listener)
    }
}

impl std::fmt::Debug for RewFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewFuture")
            .field("phase", &self.phase())
            .finish()
    }
}

/// How a task is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewOptions {
    /// Read the input on the caller's stack when the read token is idle.
    pub read_now: bool,
    /// Shut down both tokens once the task is done, whatever the outcome.
    pub release: bool,
}

/// Executes tasks of type `T`.
pub trait RewExecutor<T> {
    fn submit<Id>(
        &self,
        task: T,
        read_token: &AccessToken<Id>,
        write_token: &AccessToken<Id>,
        options: RewOptions,
    ) -> RewFuture
    where
        Id: Send + Sync + 'static;

    fn execute<Id>(&self, task: T, read_token: &AccessToken<Id>, write_token: &AccessToken<Id>) -> RewFuture
    where
        Id: Send + Sync + 'static,
    {
        self.submit(task, read_token, write_token, RewOptions::default())
    }

    /// Like [`execute`](Self::execute), but reads the input on the caller's
    /// stack if possible.
    fn execute_now<Id>(&self, task: T, read_token: &AccessToken<Id>, write_token: &AccessToken<Id>) -> RewFuture
    where
        Id: Send + Sync + 'static,
    {
        let options = RewOptions {
            read_now: true,
            release: false,
        };
        self.submit(task, read_token, write_token, options)
    }

    /// Like [`execute`](Self::execute), then shuts down both tokens.
    fn execute_and_release<Id>(
        &self,
        task: T,
        read_token: &AccessToken<Id>,
        write_token: &AccessToken<Id>,
    ) -> RewFuture
    where
        Id: Send + Sync + 'static,
    {
        let options = RewOptions {
            read_now: false,
            release: true,
        };
        self.submit(task, read_token, write_token, options)
    }

    fn execute_now_and_release<Id>(
        &self,
        task: T,
        read_token: &AccessToken<Id>,
        write_token: &AccessToken<Id>,
    ) -> RewFuture
    where
        Id: Send + Sync + 'static,
    {
        let options = RewOptions {
            read_now: true,
            release: true,
        };
        self.submit(task, read_token, write_token, options)
    }
}
