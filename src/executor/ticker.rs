use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::utils::run_logged;

type Tick = Box<dyn FnMut() -> bool + Send>;

struct Entry {
    period: Duration,
    tick: Tick,
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    entries: HashMap<u64, Entry>,
    /// Due times. Entries missing from `entries` are skipped when polled.
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    /// The callback currently running and whether it was stopped meanwhile.
    running: Option<(u64, bool)>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    changed: Condvar,
    thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_timer_thread(&self) -> bool {
        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) == Some(thread::current().id())
    }

    fn run(&self) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }

            let Some(&Reverse((due, id))) = state.queue.peek() else {
                state = self.changed.wait(state).unwrap_or_else(|e| e.into_inner());
                continue;
            };

            let now = Instant::now();
            if due > now {
                state = self
                    .changed
                    .wait_timeout(state, due - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
                continue;
            }

            state.queue.pop();
            let Some(mut entry) = state.entries.remove(&id) else {
                continue;
            };
            state.running = Some((id, false));
            drop(state);

            let mut again = false;
            run_logged(|| again = (entry.tick)());

            state = self.lock();
            let stopped = matches!(state.running, Some((_, true)));
            state.running = None;
            self.changed.notify_all();

            if again && !stopped {
                let next = (due + entry.period).max(Instant::now());
                state.queue.push(Reverse((next, id)));
                state.entries.insert(id, entry);
            } else {
                // Dropping a callback may stop other callbacks.
                drop(state);
                drop(entry);
                state = self.lock();
            }
        }
    }

    fn cancel(&self, id: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.remove(&id) {
            drop(state);
            drop(entry);
            return;
        }

        match &mut state.running {
            Some((running, stopped)) if *running == id => *stopped = true,
            _ => return,
        }

        // A callback stopping itself must not wait for itself.
        if self.on_timer_thread() {
            return;
        }
        while matches!(state.running, Some((running, _)) if running == id) {
            state = self.changed.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Runs periodic callbacks on a single background thread.
///
/// Callbacks should return quickly: they share the thread with every other
/// callback of the scheduler. A callback returns `false` to stop itself.
pub struct TickScheduler {
    shared: Arc<Shared>,
}

impl TickScheduler {
    pub fn start(name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            changed: Condvar::new(),
            thread: Mutex::new(None),
        });

        let handle = thread::Builder::new().name(name.to_string()).spawn({
            let shared = shared.clone();
            move || shared.run()
        })?;
        *shared.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.thread().id());

        Ok(Self { shared })
    }

    /// The scheduler shared by the whole process, started on first use.
    pub fn shared() -> std::io::Result<Arc<Self>> {
        static SHARED: Mutex<Option<Arc<TickScheduler>>> = Mutex::new(None);

        let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(scheduler) = shared.as_ref() {
            return Ok(scheduler.clone());
        }
        let scheduler = Arc::new(Self::start("jtrim-ticker")?);
        *shared = Some(scheduler.clone());
        Ok(scheduler)
    }

    /// Calls `tick` every `period`, the first time one period from now.
    pub fn schedule<F>(&self, period: Duration, tick: F) -> TickHandle
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            Entry {
                period,
                tick: Box::new(tick),
            },
        );
        state.queue.push(Reverse((Instant::now() + period, id)));
        self.shared.changed.notify_all();

        TickHandle {
            shared: self.shared.clone(),
            id,
        }
    }

    pub fn scheduled_count(&self) -> usize {
        let state = self.shared.lock();
        state.entries.len() + usize::from(matches!(state.running, Some((_, false))))
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        let entries = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
            std::mem::take(&mut state.entries)
        };
        drop(entries);
    }
}

/// A callback scheduled on a [`TickScheduler`].
pub struct TickHandle {
    shared: Arc<Shared>,
    id: u64,
}

impl TickHandle {
    /// Stops the callback. It is not invoked after this returns, unless
    /// called from the callback itself.
    pub fn stop(&self) {
        self.shared.cancel(self.id);
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
