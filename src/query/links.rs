use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::cancel::{CancellationSource, CancellationToken};
use crate::error::{DataTransferError, TaskError};
use crate::executor::TaskExecutor;
use crate::query::{
    AsyncDataController, AsyncDataLink, AsyncDataListener, AsyncDataQuery, AsyncDataState,
    AsyncReport, SafeDataListener, StaticDataController, advance_state,
};
use crate::utils::catch_panic;

/// A link whose value is already available.
pub struct PreparedDataLink<T> {
    data: T,
    state: Option<AsyncDataState>,
}

impl<T> PreparedDataLink<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            state: Some(AsyncDataState::new("data is available", 1.0)),
        }
    }
}

impl<T: Clone + Send + Sync> AsyncDataLink<T> for PreparedDataLink<T> {
    fn get_data(
        &self,
        cancel: &CancellationToken,
        listener: Arc<dyn AsyncDataListener<T>>,
    ) -> Arc<dyn AsyncDataController> {
        if cancel.is_canceled() {
            listener.on_done_receive(AsyncReport::canceled());
        } else {
            if listener.require_data() {
                listener.on_data_arrive(self.data.clone());
            }
            listener.on_done_receive(AsyncReport::success());
        }
        Arc::new(StaticDataController::new(self.state.clone()))
    }
}

/// Hands the values of a producer to its listener.
pub struct DataSink<T> {
    listener: Arc<SafeDataListener<T>>,
    state: Arc<Mutex<Option<AsyncDataState>>>,
}

impl<T> DataSink<T> {
    pub fn require_data(&self) -> bool {
        self.listener.require_data()
    }

    /// Delivers a value unless the listener declared it has no use for it.
    /// Returns whether the value was delivered.
    pub fn emit(&self, data: T) -> bool {
        if !self.listener.require_data() {
            return false;
        }
        self.listener.on_data_arrive(data);
        true
    }

    /// Publishes the progress of the retrieval. A state with less progress
    /// than the current one is ignored.
    pub fn set_state(&self, state: AsyncDataState) {
        advance_state(
            &mut self.state.lock().unwrap_or_else(|e| e.into_inner()),
            state,
        );
    }
}

type Producer<T> = dyn Fn(&CancellationToken, &DataSink<T>) -> anyhow::Result<()> + Send + Sync;

/// A link running a producer function on an executor.
///
/// The producer reports cancellation by returning
/// [`OperationCanceled`](crate::error::OperationCanceled); panics and other
/// errors end up in the report.
pub struct TaskDataLink<T> {
    executor: Arc<dyn TaskExecutor>,
    producer: Arc<Producer<T>>,
}

impl<T> TaskDataLink<T> {
    pub fn new<F>(executor: Arc<dyn TaskExecutor>, producer: F) -> Self
    where
        F: Fn(&CancellationToken, &DataSink<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            executor,
            producer: Arc::new(producer),
        }
    }
}

/// Reports cancellation to the listener unless a report was delivered, so
/// a job its executor dropped without running still ends the retrieval.
struct ReportGuard<T> {
    listener: Arc<SafeDataListener<T>>,
}

impl<T> ReportGuard<T> {
    fn report(self, report: AsyncReport) {
        self.listener.on_done_receive(report);
    }
}

impl<T> Drop for ReportGuard<T> {
    fn drop(&mut self) {
        if !self.listener.is_done() {
            tracing::debug!("retrieval dropped by its executor");
            self.listener.on_done_receive(AsyncReport::canceled());
        }
    }
}

struct TaskDataController {
    source: Arc<CancellationSource>,
    state: Arc<Mutex<Option<AsyncDataState>>>,
}

impl AsyncDataController for TaskDataController {
    fn cancel(&self) {
        self.source.cancel();
    }

    fn data_state(&self) -> Option<AsyncDataState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl<T: Send + 'static> AsyncDataLink<T> for TaskDataLink<T> {
    fn get_data(
        &self,
        cancel: &CancellationToken,
        listener: Arc<dyn AsyncDataListener<T>>,
    ) -> Arc<dyn AsyncDataController> {
        let source = Arc::new(CancellationSource::child_of(cancel));
        let token = source.token();
        let state = Arc::new(Mutex::new(None));

        let listener = Arc::new(SafeDataListener::new(listener));
        let guard = ReportGuard {
            listener: listener.clone(),
        };
        let sink = DataSink {
            listener,
            state: state.clone(),
        };

        let producer = self.producer.clone();
        let job_source = source.clone();
        self.executor.execute(Box::new(move || {
            let result = if token.is_canceled() {
                Ok(())
            } else {
                catch_panic(|| producer(&token, &sink))
            };

            let report = match result {
                Ok(()) => AsyncReport::new(token.is_canceled(), None),
                Err(e) => match TaskError::classify(e) {
                    TaskError::Canceled => AsyncReport::canceled(),
                    TaskError::Failed(e) => {
                        AsyncReport::new(token.is_canceled(), Some(DataTransferError(e)))
                    }
                },
            };
            guard.report(report);
            job_source.detach_from_parent();
        }));

        Arc::new(TaskDataController { source, state })
    }
}

struct ConvertingListener<T, U> {
    inner: Arc<dyn AsyncDataListener<U>>,
    convert: Arc<dyn Fn(T) -> U + Send + Sync>,
}

impl<T, U> AsyncDataListener<T> for ConvertingListener<T, U> {
    fn require_data(&self) -> bool {
        self.inner.require_data()
    }

    fn on_data_arrive(&self, data: T) {
        self.inner.on_data_arrive((self.convert)(data));
    }

    fn on_done_receive(&self, report: AsyncReport) {
        self.inner.on_done_receive(report);
    }
}

struct ConvertedDataLink<T, U> {
    inner: Arc<dyn AsyncDataLink<T>>,
    convert: Arc<dyn Fn(T) -> U + Send + Sync>,
}

impl<T: 'static, U: 'static> AsyncDataLink<U> for ConvertedDataLink<T, U> {
    fn get_data(
        &self,
        cancel: &CancellationToken,
        listener: Arc<dyn AsyncDataListener<U>>,
    ) -> Arc<dyn AsyncDataController> {
        let listener = Arc::new(ConvertingListener {
            inner: listener,
            convert: self.convert.clone(),
        });
        self.inner.get_data(cancel, listener)
    }
}

/// Applies `convert` to every value of `link`.
pub fn convert_result<T, U, F>(link: Arc<dyn AsyncDataLink<T>>, convert: F) -> Arc<dyn AsyncDataLink<U>>
where
    T: 'static,
    U: 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    Arc::new(ConvertedDataLink {
        inner: link,
        convert: Arc::new(convert),
    })
}

struct InterceptingListener<T> {
    inner: Arc<dyn AsyncDataListener<T>>,
    intercept: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> AsyncDataListener<T> for InterceptingListener<T> {
    fn require_data(&self) -> bool {
        self.inner.require_data()
    }

    fn on_data_arrive(&self, data: T) {
        if (self.intercept)(&data) {
            self.inner.on_data_arrive(data);
        }
    }

    fn on_done_receive(&self, report: AsyncReport) {
        self.inner.on_done_receive(report);
    }
}

struct InterceptedDataLink<T> {
    inner: Arc<dyn AsyncDataLink<T>>,
    intercept: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T: 'static> AsyncDataLink<T> for InterceptedDataLink<T> {
    fn get_data(
        &self,
        cancel: &CancellationToken,
        listener: Arc<dyn AsyncDataListener<T>>,
    ) -> Arc<dyn AsyncDataController> {
        let listener = Arc::new(InterceptingListener {
            inner: listener,
            intercept: self.intercept.clone(),
        });
        self.inner.get_data(cancel, listener)
    }
}

/// Shows every value of `link` to `intercept` first; values for which it
/// returns `false` are not forwarded.
pub fn intercept_data<T, F>(link: Arc<dyn AsyncDataLink<T>>, intercept: F) -> Arc<dyn AsyncDataLink<T>>
where
    T: 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(InterceptedDataLink {
        inner: link,
        intercept: Arc::new(intercept),
    })
}

/// A query built from a closure.
pub struct FnDataQuery<A, T, F> {
    create: F,
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T, F> FnDataQuery<A, T, F>
where
    F: Fn(A) -> Arc<dyn AsyncDataLink<T>> + Send + Sync,
{
    pub fn new(create: F) -> Self {
        Self {
            create,
            _marker: PhantomData,
        }
    }
}

impl<A, T, F> AsyncDataQuery<A, T> for FnDataQuery<A, T, F>
where
    F: Fn(A) -> Arc<dyn AsyncDataLink<T>> + Send + Sync,
{
    fn create_data_link(&self, arg: A) -> Arc<dyn AsyncDataLink<T>> {
        (self.create)(arg)
    }
}

/// Applies `convert` to every value of every link created by `query`.
pub fn convert_query<A, T, U, F>(
    query: Arc<dyn AsyncDataQuery<A, T>>,
    convert: F,
) -> Arc<dyn AsyncDataQuery<A, U>>
where
    A: 'static,
    T: 'static,
    U: 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    let convert: Arc<dyn Fn(T) -> U + Send + Sync> = Arc::new(convert);
    Arc::new(FnDataQuery::new(move |arg: A| -> Arc<dyn AsyncDataLink<U>> {
        Arc::new(ConvertedDataLink {
            inner: query.create_data_link(arg),
            convert: convert.clone(),
        })
    }))
}
