use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::query::{AsyncDataListener, AsyncReport};

/// Guards a listener against misbehaving producers.
///
/// Values and the report are delivered one at a time, values arriving after
/// the report are dropped and only the first report is forwarded. The inner
/// listener may call back into this one; only a nested delivery would block.
pub struct SafeDataListener<T> {
    inner: Arc<dyn AsyncDataListener<T>>,
    /// Serializes deliveries to `inner`.
    delivery: Mutex<()>,
    done: AtomicBool,
}

impl<T> SafeDataListener<T> {
    pub fn new(inner: Arc<dyn AsyncDataListener<T>>) -> Self {
        Self {
            inner,
            delivery: Mutex::new(()),
            done: AtomicBool::new(false),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

impl<T> AsyncDataListener<T> for SafeDataListener<T> {
    fn require_data(&self) -> bool {
        !self.is_done() && self.inner.require_data()
    }

    fn on_data_arrive(&self, data: T) {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_done() {
            self.inner.on_data_arrive(data);
        }
    }

    fn on_done_receive(&self, report: AsyncReport) {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        if self.done.swap(true, Ordering::AcqRel) {
            tracing::debug!("dropping duplicate report: {report}");
            return;
        }
        self.inner.on_done_receive(report);
    }
}

type DataFn<T> = Box<dyn Fn(T) + Send + Sync>;
type DoneFn = Box<dyn Fn(AsyncReport) + Send + Sync>;

/// A listener assembled from closures.
pub struct FnDataListener<T> {
    on_data: DataFn<T>,
    on_done: DoneFn,
}

impl<T> FnDataListener<T> {
    pub fn new<D, F>(on_data: D, on_done: F) -> Self
    where
        D: Fn(T) + Send + Sync + 'static,
        F: Fn(AsyncReport) + Send + Sync + 'static,
    {
        Self {
            on_data: Box::new(on_data),
            on_done: Box::new(on_done),
        }
    }

    /// Ignores the values, only listens for the report.
    pub fn on_done<F>(on_done: F) -> Self
    where
        F: Fn(AsyncReport) + Send + Sync + 'static,
    {
        Self::new(|_| {}, on_done)
    }
}

impl<T> AsyncDataListener<T> for FnDataListener<T> {
    fn on_data_arrive(&self, data: T) {
        (self.on_data)(data)
    }

    fn on_done_receive(&self, report: AsyncReport) {
        (self.on_done)(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::testing::{Event, RecordingListener};

    #[test]
    fn test_single_report_and_no_late_data() {
        let (recording, rx) = RecordingListener::<u32>::new();
        let safe = SafeDataListener::new(recording);

        safe.on_data_arrive(1);
        safe.on_done_receive(AsyncReport::success());
        safe.on_data_arrive(2);
        safe.on_done_receive(AsyncReport::canceled());

        assert!(matches!(rx.try_recv(), Ok(Event::Data(1))));
        assert!(matches!(rx.try_recv(), Ok(Event::Done(r)) if r.is_success()));
        assert!(rx.try_recv().is_err());
        assert!(!safe.require_data());
    }

    #[test]
    fn test_fn_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let listener = FnDataListener::new(
            move |v: u32| s.lock().unwrap().push(v),
            |report| assert!(report.is_success()),
        );

        listener.on_data_arrive(3);
        listener.on_done_receive(AsyncReport::success());
        assert!(listener.require_data());
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    /// Asks the wrapping listener whether it still wants data from inside
    /// its own callbacks.
    struct ReentrantListener {
        outer: std::sync::OnceLock<std::sync::Weak<SafeDataListener<u32>>>,
        answers: Mutex<Vec<bool>>,
    }

    impl ReentrantListener {
        fn ask(&self) {
            if let Some(outer) = self.outer.get().and_then(|o| o.upgrade()) {
                self.answers.lock().unwrap().push(outer.require_data());
            }
        }
    }

    impl AsyncDataListener<u32> for ReentrantListener {
        fn on_data_arrive(&self, _: u32) {
            self.ask();
        }

        fn on_done_receive(&self, _: AsyncReport) {
            self.ask();
        }
    }

    #[test]
    fn test_reentrant_require_data() {
        let inner = Arc::new(ReentrantListener {
            outer: std::sync::OnceLock::new(),
            answers: Mutex::new(Vec::new()),
        });
        let safe = Arc::new(SafeDataListener::new(inner.clone() as Arc<dyn AsyncDataListener<u32>>));
        inner.outer.set(Arc::downgrade(&safe)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let s = safe.clone();
        std::thread::spawn(move || {
            s.on_data_arrive(1);
            s.on_done_receive(AsyncReport::success());
            tx.send(()).unwrap();
        });

        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(*inner.answers.lock().unwrap(), vec![true, false]);
    }
}
