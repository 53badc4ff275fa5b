use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::TaskError;
use crate::utils::run_logged;

type DoneListener<T> = Box<dyn FnOnce(&Result<T, TaskError>) + Send>;

struct Slot<T> {
    /// Set by the completion that won, before its outcome is published.
    decided: bool,
    outcome: Option<Arc<Result<T, TaskError>>>,
    finalizer: Option<DoneListener<T>>,
    listeners: Vec<DoneListener<T>>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, outcome: Result<T, TaskError>) -> bool {
        let finalizer = {
            let mut slot = self.lock();
            if slot.decided {
                return false;
            }
            slot.decided = true;
            slot.finalizer.take()
        };

        if let Some(finalizer) = finalizer {
            run_logged(|| finalizer(&outcome));
        }

        let outcome = Arc::new(outcome);
        let listeners = {
            let mut slot = self.lock();
            slot.outcome = Some(outcome.clone());
            self.done.notify_all();
            std::mem::take(&mut slot.listeners)
        };

        for listener in listeners {
            listener(&outcome);
        }
        true
    }
}

/// Future-like handle of a task running somewhere else.
///
/// The first completion wins: [`cancel`](Self::cancel) competes with the
/// task's own completion, and whichever comes first decides the outcome.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

/// The completing side of a [`TaskFuture`].
pub struct TaskCompleter<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a pending future together with its completer.
pub fn pending<T>() -> (TaskFuture<T>, TaskCompleter<T>) {
    with_finalizer(None)
}

/// Like [`pending`], but `finalizer` runs with the outcome before anyone can
/// observe it: waiters return and listeners run only after it returned.
pub fn pending_with_finalizer<T, F>(finalizer: F) -> (TaskFuture<T>, TaskCompleter<T>)
where
    F: FnOnce(&Result<T, TaskError>) + Send + 'static,
{
    with_finalizer(Some(Box::new(finalizer)))
}

fn with_finalizer<T>(finalizer: Option<DoneListener<T>>) -> (TaskFuture<T>, TaskCompleter<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            decided: false,
            outcome: None,
            finalizer,
            listeners: Vec::new(),
        }),
        done: Condvar::new(),
    });

    (
        TaskFuture {
            shared: shared.clone(),
        },
        TaskCompleter { shared },
    )
}

impl<T> TaskCompleter<T> {
    /// Sets the outcome unless one was already set. Returns `true` if this
    /// call decided the outcome.
    pub fn complete(&self, outcome: Result<T, TaskError>) -> bool {
        self.shared.complete(outcome)
    }

    /// Returns `true` once some completion won, even if its outcome is not
    /// published yet.
    pub fn is_done(&self) -> bool {
        self.shared.lock().decided
    }

    pub fn future(&self) -> TaskFuture<T> {
        TaskFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Clone for TaskCompleter<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> TaskFuture<T> {
    /// A future which is already completed.
    pub fn ready(outcome: Result<T, TaskError>) -> Self {
        let (future, completer) = pending();
        completer.complete(outcome);
        future
    }

    /// Requests cancellation. Returns `true` if the future was still pending
    /// and is now canceled; the task may nevertheless have performed some of
    /// its effects already.
    pub fn cancel(&self) -> bool {
        self.shared.complete(Err(TaskError::Canceled))
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self.shared.lock().outcome.as_deref(),
            Some(Err(TaskError::Canceled))
        )
    }

    /// Registers a listener notified with the outcome. Runs immediately when
    /// the future is already done.
    pub fn on_done<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, TaskError>) + Send + 'static,
    {
        let mut slot = self.shared.lock();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                listener(&outcome);
            }
            None => slot.listeners.push(Box::new(listener)),
        }
    }

    /// Blocks until the outcome is known and inspects it.
    pub fn wait_with<R>(&self, f: impl FnOnce(&Result<T, TaskError>) -> R) -> R {
        let mut slot = self.shared.lock();
        loop {
            if let Some(outcome) = slot.outcome.clone() {
                drop(slot);
                return f(&outcome);
            }
            slot = self
                .shared
                .done
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Waits at most `timeout`. Returns `false` if the future is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.lock();
        while slot.outcome.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            slot = self
                .shared
                .done
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }
}

impl<T: Clone> TaskFuture<T> {
    /// Blocks until the outcome is known.
    pub fn wait(&self) -> Result<T, TaskError> {
        self.wait_with(Clone::clone)
    }

    /// Returns the outcome if the future is done.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        self.shared.lock().outcome.as_deref().cloned()
    }
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.shared.lock();
        let state = match slot.outcome.as_deref() {
            None => "pending",
            Some(Ok(_)) => "completed",
            Some(Err(TaskError::Canceled)) => "canceled",
            Some(Err(TaskError::Failed(_))) => "failed",
        };
        f.debug_struct("TaskFuture").field("state", &state).finish()
    }
}
