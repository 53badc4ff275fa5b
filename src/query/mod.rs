//! Asynchronous data links.
//!
//! An [`AsyncDataLink`] is a reusable recipe: every call to
//! [`get_data`](AsyncDataLink::get_data) starts a new, independent retrieval
//! that pushes zero or more partial values to its listener and then exactly
//! one [`AsyncReport`]. `get_data` itself never blocks; the data is produced
//! on whatever executor the link chooses.

mod controller;
mod links;
mod listener;
mod state_reporter;

use std::fmt::Display;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::error::DataTransferError;

pub use controller::{InitLaterDataController, StaticDataController};
pub use links::{
    DataSink, FnDataQuery, PreparedDataLink, TaskDataLink, convert_query, convert_result,
    intercept_data,
};
pub use listener::{FnDataListener, SafeDataListener};
pub use state_reporter::PeriodicStateReporterLink;

/// Receives the values of a single retrieval.
///
/// [`on_done_receive`](Self::on_done_receive) is called exactly once per
/// retrieval, after every [`on_data_arrive`](Self::on_data_arrive) returned.
pub trait AsyncDataListener<T>: Send + Sync {
    /// Producers may skip a value when this returns `false`.
    fn require_data(&self) -> bool {
        true
    }

    fn on_data_arrive(&self, data: T);

    fn on_done_receive(&self, report: AsyncReport);
}

/// Handle of a single retrieval.
pub trait AsyncDataController: Send + Sync {
    /// Requests the retrieval to stop. Best effort; the listener still gets
    /// its report.
    fn cancel(&self);

    fn data_state(&self) -> Option<AsyncDataState>;
}

pub trait AsyncDataLink<T>: Send + Sync {
    fn get_data(
        &self,
        cancel: &CancellationToken,
        listener: Arc<dyn AsyncDataListener<T>>,
    ) -> Arc<dyn AsyncDataController>;
}

/// Creates links from input arguments.
pub trait AsyncDataQuery<A, T>: Send + Sync {
    fn create_data_link(&self, arg: A) -> Arc<dyn AsyncDataLink<T>>;
}

/// Snapshot of the progress of a retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncDataState {
    description: Arc<str>,
    progress: f64,
}

impl AsyncDataState {
    /// The progress is clamped into `[0, 1]`; NaN counts as no progress.
    pub fn new(description: impl Into<Arc<str>>, progress: f64) -> Self {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };

        Self {
            description: description.into(),
            progress,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }
}

impl Display for AsyncDataState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:.0}%)", self.description, self.progress * 100.0)
    }
}

/// Replaces `last` with `state` unless that would move progress backwards.
/// Returns `true` if `state` was accepted.
pub(crate) fn advance_state(last: &mut Option<AsyncDataState>, state: AsyncDataState) -> bool {
    match last {
        Some(prev) if prev.progress > state.progress => false,
        _ => {
            *last = Some(state);
            true
        }
    }
}

/// The terminal outcome of a retrieval.
///
/// Cancellation and an error may both be present when cancelling caused a
/// secondary failure.
#[derive(Debug, Clone, Default)]
pub struct AsyncReport {
    canceled: bool,
    error: Option<DataTransferError>,
}

impl AsyncReport {
    pub fn new(canceled: bool, error: Option<DataTransferError>) -> Self {
        Self { canceled, error }
    }

    pub fn success() -> Self {
        Self::default()
    }

    pub fn canceled() -> Self {
        Self::new(true, None)
    }

    pub fn failed(error: impl Into<DataTransferError>) -> Self {
        Self::new(false, Some(error.into()))
    }

    pub fn is_success(&self) -> bool {
        !self.canceled && self.error.is_none()
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn error(&self) -> Option<&DataTransferError> {
        self.error.as_ref()
    }
}

impl Display for AsyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.canceled, &self.error) {
            (false, None) => write!(f, "success"),
            (true, None) => write!(f, "canceled"),
            (false, Some(e)) => write!(f, "failed: {}", e.inner()),
            (true, Some(e)) => write!(f, "canceled with error: {}", e.inner()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::mpsc::{Receiver, Sender, channel};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{AsyncDataListener, AsyncReport};

    pub(crate) enum Event<T> {
        Data(T),
        Done(AsyncReport),
    }

    /// Listener recording every callback into a channel.
    pub(crate) struct RecordingListener<T> {
        tx: Mutex<Sender<Event<T>>>,
    }

    impl<T: Send> RecordingListener<T> {
        pub(crate) fn new() -> (Arc<Self>, Receiver<Event<T>>) {
            let (tx, rx) = channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }
    }

    impl<T: Send> AsyncDataListener<T> for RecordingListener<T> {
        fn on_data_arrive(&self, data: T) {
            let _ = self.tx.lock().unwrap().send(Event::Data(data));
        }

        fn on_done_receive(&self, report: AsyncReport) {
            let _ = self.tx.lock().unwrap().send(Event::Done(report));
        }
    }

    /// Collects the values until the report arrives.
    pub(crate) fn collect<T>(rx: &Receiver<Event<T>>) -> (Vec<T>, AsyncReport) {
        let mut data = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                Event::Data(value) => data.push(value),
                Event::Done(report) => {
                    assert!(
                        rx.recv_timeout(Duration::from_millis(20)).is_err(),
                        "callbacks after the report"
                    );
                    return (data, report);
                }
            }
        }
    }
}
