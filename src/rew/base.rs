use std::sync::{Arc, Mutex};

use crate::access::AccessToken;
use crate::cancel::{CancellationSource, CancellationToken, ListenerRef};
use crate::error::TaskError;
use crate::executor::{TaskCompleter, pending_with_finalizer};
use crate::rew::{RewFuture, RewOptions, RewPhase};
use crate::utils::catch_panic;

/// The shared state of one submitted task, handed from phase to phase.
#[derive(Clone)]
pub(crate) struct RewRun {
    completer: TaskCompleter<()>,
    phase: Arc<Mutex<RewPhase>>,
    cancel: CancellationToken,
}

impl RewRun {
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_done(&self) -> bool {
        self.completer.is_done()
    }

    /// Moves to `phase` unless the task is done already.
    pub(crate) fn enter(&self, phase: RewPhase) -> bool {
        let mut current = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_done() || self.completer.is_done() {
            return false;
        }
        *current = phase;
        true
    }

    pub(crate) fn finish(&self, result: anyhow::Result<()>) {
        self.completer.complete(result.map_err(TaskError::classify));
    }

    pub(crate) fn fail(&self, error: TaskError) {
        self.completer.complete(Err(error));
    }

    pub(crate) fn cancel(&self) {
        self.completer.complete(Err(TaskError::Canceled));
    }

    /// Cleanup for jobs submitted to a token: a skipped job means the token
    /// was shut down under the task.
    pub(crate) fn cancel_if_skipped(&self) -> impl FnOnce(bool) + Send + 'static {
        let run = self.clone();
        move |skipped| {
            if skipped {
                run.cancel();
            }
        }
    }
}

/// Guards a run handed to an executor: if the job is dropped without
/// running, the run is canceled.
pub(crate) struct PendingRun {
    run: Option<RewRun>,
}

impl PendingRun {
    pub(crate) fn new(run: RewRun) -> Self {
        Self { run: Some(run) }
    }

    pub(crate) fn into_run(mut self) -> Option<RewRun> {
        self.run.take()
    }
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            tracing::debug!("REW job dropped by its executor");
            run.cancel();
        }
    }
}

fn unregister_all(listeners: &Mutex<Vec<ListenerRef>>) {
    for listener in listeners.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
        listener.unregister();
    }
}

/// Submits the read phase of a task and wires up cancellation and release.
///
/// `evaluate` receives the input once it was read, unless the task got
/// canceled in the meantime, and is responsible for finishing the run.
///
/// Once the outcome is decided the phase turns terminal, a task that did not
/// complete is canceled and the tokens are released. All of that happens
/// before the outcome can be observed through the returned future.
pub(crate) fn start<Id, I, R, E, C>(
    read_token: &AccessToken<Id>,
    write_token: &AccessToken<Id>,
    options: RewOptions,
    on_cancel: C,
    read: R,
    evaluate: E,
) -> RewFuture
where
    Id: Send + Sync + 'static,
    I: Send + 'static,
    R: FnOnce(&CancellationToken) -> anyhow::Result<I> + Send + 'static,
    E: FnOnce(RewRun, I) + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    let phase = Arc::new(Mutex::new(RewPhase::Created));
    let source = CancellationSource::new();
    let cancel = source.token();
    let termination_listeners: Arc<Mutex<Vec<ListenerRef>>> = Arc::default();

    let (future, completer) = pending_with_finalizer({
        let phase = phase.clone();
        let termination_listeners = termination_listeners.clone();
        let release = options
            .release
            .then(|| (read_token.clone(), write_token.clone()));

        move |outcome: &Result<(), TaskError>| {
            unregister_all(&termination_listeners);

            let terminal = match outcome {
                Ok(()) => RewPhase::Completed,
                Err(TaskError::Canceled) => RewPhase::Canceled,
                Err(TaskError::Failed(e)) => {
                    tracing::error!("REW task failed:\n{e:?}");
                    RewPhase::Errored
                }
            };
            *phase.lock().unwrap_or_else(|e| e.into_inner()) = terminal;

            if terminal == RewPhase::Canceled {
                tracing::debug!("REW task canceled");
                on_cancel();
            }
            if terminal != RewPhase::Completed {
                source.cancel();
            }

            if let Some((read_token, write_token)) = release {
                read_token.shutdown();
                write_token.shutdown();
            }
        }
    });

    let run = RewRun {
        completer,
        phase: phase.clone(),
        cancel,
    };

    let on_read_terminated = read_token.add_termination_listener({
        let run = run.clone();
        move || {
            let reading = *run.phase.lock().unwrap_or_else(|e| e.into_inner()) <= RewPhase::Reading;
            if reading {
                run.cancel();
            }
        }
    });

    let on_write_terminated = write_token.add_termination_listener({
        let run = run.clone();
        move || run.cancel()
    });

    {
        let mut listeners = termination_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push(on_read_terminated);
        listeners.push(on_write_terminated);
    }
    if run.is_done() {
        // Decided while registering; the finalizer may have missed these.
        unregister_all(&termination_listeners);
    }

    let cleanup = run.cancel_if_skipped();
    let read_job = move || {
        if !run.enter(RewPhase::Reading) {
            return;
        }

        match catch_panic(|| read(&run.cancel)) {
            Err(e) => run.finish(Err(e)),
            Ok(input) => {
                if run.enter(RewPhase::Evaluating) {
                    evaluate(run, input);
                }
            }
        }
    };

    if options.read_now {
        read_token.execute_now_with_cleanup(read_job, cleanup);
    } else {
        read_token.execute_with_cleanup(read_job, cleanup);
    }

    RewFuture { future, phase }
}
