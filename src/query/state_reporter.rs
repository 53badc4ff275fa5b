use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::executor::{
    InOrderExecutor, SyncTaskExecutor, TaskExecutor, TickHandle, TickScheduler, UpdateTaskExecutor,
};
use crate::query::{
    AsyncDataController, AsyncDataLink, AsyncDataListener, AsyncDataState, AsyncReport,
    advance_state,
};

type Reporter = dyn Fn(&AsyncDataState) + Send + Sync;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Decorates a link by polling the state of every retrieval periodically and
/// passing it to a reporter.
///
/// Reports of one retrieval run one at a time in the order they were taken,
/// and their progress never decreases. Polling stops when the retrieval
/// reports done. Every retrieval is polled from the process-wide
/// [`TickScheduler`].
pub struct PeriodicStateReporterLink<T> {
    inner: Arc<dyn AsyncDataLink<T>>,
    reporter: Arc<Reporter>,
    period: Duration,
    report_executor: Arc<dyn TaskExecutor>,
}

impl<T> PeriodicStateReporterLink<T> {
    /// Reports are run on the polling thread, so the reporter should return
    /// quickly. A zero period polls once per millisecond.
    pub fn new<F>(inner: Arc<dyn AsyncDataLink<T>>, period: Duration, reporter: F) -> Self
    where
        F: Fn(&AsyncDataState) + Send + Sync + 'static,
    {
        Self::with_executor(inner, period, Arc::new(SyncTaskExecutor), reporter)
    }

    pub fn with_executor<F>(
        inner: Arc<dyn AsyncDataLink<T>>,
        period: Duration,
        report_executor: Arc<dyn TaskExecutor>,
        reporter: F,
    ) -> Self
    where
        F: Fn(&AsyncDataState) + Send + Sync + 'static,
    {
        Self {
            inner,
            reporter: Arc::new(reporter),
            period: period.max(MIN_PERIOD),
            report_executor,
        }
    }
}

struct Polling {
    last: Mutex<Option<AsyncDataState>>,
    done: AtomicBool,
    ticker: Mutex<Option<TickHandle>>,
}

impl Polling {
    fn stop(&self) {
        self.done.store(true, Ordering::Release);
        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(ticker) = ticker {
            ticker.stop();
        }
    }

    /// Folds the current state of the retrieval into the last published one.
    fn advance(&self, state: Option<AsyncDataState>) -> Option<AsyncDataState> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = state {
            advance_state(&mut last, state);
        }
        last.clone()
    }
}

struct StopPollingListener<T> {
    inner: Arc<dyn AsyncDataListener<T>>,
    polling: Arc<Polling>,
}

impl<T> AsyncDataListener<T> for StopPollingListener<T> {
    fn require_data(&self) -> bool {
        self.inner.require_data()
    }

    fn on_data_arrive(&self, data: T) {
        self.inner.on_data_arrive(data);
    }

    fn on_done_receive(&self, report: AsyncReport) {
        self.polling.stop();
        self.inner.on_done_receive(report);
    }
}

struct ReportingController {
    inner: Arc<dyn AsyncDataController>,
    polling: Arc<Polling>,
}

impl AsyncDataController for ReportingController {
    fn cancel(&self) {
        self.inner.cancel();
    }

    fn data_state(&self) -> Option<AsyncDataState> {
        self.polling.advance(self.inner.data_state())
    }
}

impl<T: 'static> AsyncDataLink<T> for PeriodicStateReporterLink<T> {
    fn get_data(
        &self,
        cancel: &CancellationToken,
        listener: Arc<dyn AsyncDataListener<T>>,
    ) -> Arc<dyn AsyncDataController> {
        let polling = Arc::new(Polling {
            last: Mutex::new(None),
            done: AtomicBool::new(false),
            ticker: Mutex::new(None),
        });

        let listener = Arc::new(StopPollingListener {
            inner: listener,
            polling: polling.clone(),
        });
        let controller = self.inner.get_data(cancel, listener);

        let updates = UpdateTaskExecutor::new(Arc::new(InOrderExecutor::new(
            self.report_executor.clone(),
        )));

        let poll = {
            let polling = polling.clone();
            let controller = controller.clone();
            let reporter = self.reporter.clone();
            move || {
                if polling.done.load(Ordering::Acquire) {
                    return false;
                }

                let mut last = polling.last.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(state) = controller.data_state()
                    && advance_state(&mut last, state.clone())
                {
                    drop(last);
                    let reporter = reporter.clone();
                    updates.execute(move || reporter(&state));
                }
                true
            }
        };

        match TickScheduler::shared().map(|scheduler| scheduler.schedule(self.period, poll)) {
            Ok(ticker) => {
                *polling.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(ticker);
                // The retrieval may have finished before the ticker was stored.
                if polling.done.load(Ordering::Acquire) {
                    polling.stop();
                }
            }
            Err(e) => tracing::error!("Couldn't start the state reporting thread.\n{e}"),
        }

        Arc::new(ReportingController {
            inner: controller,
            polling,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPerJobExecutor;
    use crate::query::TaskDataLink;
    use crate::query::testing::{RecordingListener, collect};
    use std::sync::mpsc::channel;

    #[test]
    fn test_reports_are_monotonic() {
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let inner: Arc<dyn AsyncDataLink<u32>> =
            Arc::new(TaskDataLink::<u32>::new(Arc::new(ThreadPerJobExecutor), move |_, sink| {
                for step in [0.1, 0.4, 0.2, 0.6, 0.5, 0.9] {
                    sink.set_state(AsyncDataState::new("step", step));
                    std::thread::sleep(Duration::from_millis(5));
                }
                release_rx.lock().unwrap().recv().ok();
                Ok(())
            }));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let link = PeriodicStateReporterLink::new(inner, Duration::from_millis(1), move |state| {
            s.lock().unwrap().push(state.progress());
        });

        let (listener, rx) = RecordingListener::<u32>::new();
        let controller = link.get_data(&CancellationToken::uncancelable(), listener);

        std::thread::sleep(Duration::from_millis(60));
        release_tx.send(()).unwrap();
        let (_, report) = collect(&rx);
        assert!(report.is_success());

        let seen = seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(controller.data_state().unwrap().progress(), 0.9);
    }

    #[test]
    fn test_polling_stops_after_done() {
        let inner: Arc<dyn AsyncDataLink<u32>> =
            Arc::new(TaskDataLink::<u32>::new(Arc::new(SyncTaskExecutor), |_, sink| {
                sink.set_state(AsyncDataState::new("done", 1.0));
                Ok(())
            }));

        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let link = PeriodicStateReporterLink::new(inner, Duration::from_millis(1), move |_| {
            *c.lock().unwrap() += 1;
        });

        let (listener, rx) = RecordingListener::<u32>::new();
        link.get_data(&CancellationToken::uncancelable(), listener);
        let (_, report) = collect(&rx);
        assert!(report.is_success());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn test_data_is_forwarded() {
        let inner: Arc<dyn AsyncDataLink<u32>> =
            Arc::new(TaskDataLink::<u32>::new(Arc::new(ThreadPerJobExecutor), |_, sink| {
                sink.emit(7);
                Ok(())
            }));
        let link = PeriodicStateReporterLink::new(inner, Duration::from_secs(3600), |_| {});

        let (listener, rx) = RecordingListener::<u32>::new();
        link.get_data(&CancellationToken::uncancelable(), listener);
        let (data, report) = collect(&rx);
        assert_eq!(data, vec![7]);
        assert!(report.is_success());
    }

    #[test]
    fn test_retrievals_share_one_polling_thread() {
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let inner: Arc<dyn AsyncDataLink<u32>> =
            Arc::new(TaskDataLink::<u32>::new(Arc::new(ThreadPerJobExecutor), move |_, sink| {
                sink.set_state(AsyncDataState::new("waiting", 0.5));
                release_rx.lock().unwrap().recv().ok();
                Ok(())
            }));

        let threads = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let t = threads.clone();
        let link = PeriodicStateReporterLink::new(inner, Duration::from_millis(1), move |_| {
            let name = std::thread::current().name().map(str::to_string);
            t.lock().unwrap().insert(name);
        });

        let receivers: Vec<_> = (0..8)
            .map(|_| {
                let (listener, rx) = RecordingListener::<u32>::new();
                link.get_data(&CancellationToken::uncancelable(), listener);
                rx
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        for _ in &receivers {
            release_tx.send(()).unwrap();
        }
        for rx in &receivers {
            assert!(collect(rx).1.is_success());
        }

        let threads = threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 1, "{threads:?}");
        assert!(threads.contains(&Some("jtrim-ticker".to_string())));
    }
}
