use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessToken;
use crate::cancel::CancellationToken;
use crate::error::TaskError;
use crate::executor::UpdateTaskExecutor;
use crate::query::{
    AsyncDataLink, AsyncDataListener, AsyncDataQuery, AsyncDataState, AsyncReport,
    PeriodicStateReporterLink,
};
use crate::rew::base::{self, RewRun};
use crate::rew::{RewExecutor, RewFuture, RewOptions, RewPhase};
use crate::utils::catch_panic;

/// A task whose evaluation is an asynchronous data query.
///
/// Every value the query produces is an output; only the latest value is
/// guaranteed to be written, earlier ones may be skipped when they arrive
/// faster than they can be written.
pub trait RewQuery: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn read_input(&self, cancel: &CancellationToken) -> anyhow::Result<Self::Input>;

    fn output_query(&self) -> Arc<dyn AsyncDataQuery<Self::Input, Self::Output>>;

    fn write_output(&self, output: Self::Output) -> anyhow::Result<()>;

    /// Called in the write context with the polled state of the retrieval.
    fn write_state(&self, _state: &AsyncDataState) {}

    fn cancel(&self) {}
}

/// Executes [`RewQuery`]s, reporting the state of the running retrieval to
/// [`RewQuery::write_state`] periodically.
#[derive(Debug, Clone)]
pub struct AutoReportRewQueryExecutor {
    report_period: Duration,
}

impl AutoReportRewQueryExecutor {
    pub fn new(report_period: Duration) -> Self {
        Self { report_period }
    }

    pub fn report_period(&self) -> Duration {
        self.report_period
    }
}

struct QueryListener<Q, Id> {
    query: Arc<Q>,
    run: RewRun,
    write_token: AccessToken<Id>,
    outputs: UpdateTaskExecutor,
}

impl<Q, Id> AsyncDataListener<Q::Output> for QueryListener<Q, Id>
where
    Q: RewQuery,
    Id: Send + Sync + 'static,
{
    fn require_data(&self) -> bool {
        !self.run.is_done()
    }

    fn on_data_arrive(&self, data: Q::Output) {
        if self.run.is_done() {
            return;
        }

        let query = self.query.clone();
        let run = self.run.clone();
        self.outputs.execute(move || {
            if run.is_done() {
                return;
            }
            if let Err(e) = catch_panic(|| query.write_output(data)) {
                run.finish(Err(e));
            }
        });
    }

    fn on_done_receive(&self, report: AsyncReport) {
        if !self.run.enter(RewPhase::Writing) {
            return;
        }

        let run = self.run.clone();
        let cleanup = run.cancel_if_skipped();
        self.write_token.execute_with_cleanup(
            move || {
                if let Some(error) = report.error() {
                    run.fail(TaskError::Failed(error.0.clone()));
                } else if report.is_canceled() {
                    run.cancel();
                } else {
                    run.finish(Ok(()));
                }
            },
            cleanup,
        );
    }
}

impl<Q: RewQuery> RewExecutor<Q> for AutoReportRewQueryExecutor {
    fn submit<Id>(
        &self,
        task: Q,
        read_token: &AccessToken<Id>,
        write_token: &AccessToken<Id>,
        options: RewOptions,
    ) -> RewFuture
    where
        Id: Send + Sync + 'static,
    {
        let query = Arc::new(task);
        let period = self.report_period;
        let write_token_ = write_token.clone();

        let on_cancel = {
            let query = query.clone();
            move || query.cancel()
        };
        let read = {
            let query = query.clone();
            move |cancel: &CancellationToken| query.read_input(cancel)
        };

        let evaluate = move |run: RewRun, input: Q::Input| {
            let write_token = write_token_;
            let started = catch_panic({
                let run = run.clone();
                move || {
                    let link = query.output_query().create_data_link(input);
                    let link = PeriodicStateReporterLink::with_executor(
                        link,
                        period,
                        Arc::new(write_token.clone()),
                        {
                            let query = query.clone();
                            let run = run.clone();
                            move |state: &AsyncDataState| {
                                if !run.is_done() {
                                    query.write_state(state);
                                }
                            }
                        },
                    );

                    let listener = Arc::new(QueryListener {
                        query,
                        run: run.clone(),
                        outputs: UpdateTaskExecutor::new(Arc::new(write_token.clone())),
                        write_token,
                    });

                    link.get_data(run.cancel_token(), listener);
                    Ok(())
                }
            });

            if let Err(e) = started {
                run.finish(Err(e));
            }
        };

        base::start(read_token, write_token, options, on_cancel, read, evaluate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{SyncTaskExecutor, ThreadPerJobExecutor};
    use crate::query::{FnDataQuery, TaskDataLink};
    use crate::rew::testing::{Recorder, expected_result};
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc::channel;

    struct CountingQuery {
        arg: String,
        count: usize,
        fail: bool,
        recorder: Arc<Recorder>,
    }

    impl RewQuery for CountingQuery {
        type Input = String;
        type Output = String;

        fn read_input(&self, _: &CancellationToken) -> anyhow::Result<String> {
            Ok(self.arg.clone())
        }

        fn output_query(&self) -> Arc<dyn AsyncDataQuery<String, String>> {
            let count = self.count;
            let fail = self.fail;
            Arc::new(FnDataQuery::new(move |arg: String| {
                Arc::new(TaskDataLink::<String>::new(
                    Arc::new(ThreadPerJobExecutor),
                    move |cancel, sink| {
                        for index in 0..count {
                            cancel.check_canceled()?;
                            sink.set_state(AsyncDataState::new("counting", (index + 1) as f64 / count as f64));
                            sink.emit(expected_result(&arg, index));
                        }
                        if fail {
                            anyhow::bail!("query failed");
                        }
                        Ok(())
                    },
                )) as Arc<dyn AsyncDataLink<String>>
            }))
        }

        fn write_output(&self, output: String) -> anyhow::Result<()> {
            self.recorder.outputs.lock().unwrap().push(output);
            Ok(())
        }

        fn write_state(&self, state: &AsyncDataState) {
            self.recorder.states.lock().unwrap().push(state.progress());
        }

        fn cancel(&self) {
            self.recorder.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting(arg: &str, count: usize, recorder: &Arc<Recorder>) -> CountingQuery {
        CountingQuery {
            arg: arg.to_string(),
            count,
            fail: false,
            recorder: recorder.clone(),
        }
    }

    #[test]
    fn test_last_output_always_written() {
        let recorder = Recorder::new();
        let executor = AutoReportRewQueryExecutor::new(Duration::from_millis(1));
        let read = AccessToken::new("read", Arc::new(ThreadPerJobExecutor));
        let write = AccessToken::new("write", Arc::new(ThreadPerJobExecutor));

        let future = executor.execute_and_release(counting("arg", 20, &recorder), &read, &write);
        future.wait().unwrap();
        assert_eq!(future.phase(), RewPhase::Completed);

        let outputs = recorder.outputs();
        assert_eq!(outputs.last(), Some(&expected_result("arg", 19)));

        let indices: Vec<usize> = outputs
            .iter()
            .map(|o| o.rsplit('.').next().unwrap().parse().unwrap())
            .collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]));

        let states = recorder.states.lock().unwrap().clone();
        assert!(states.windows(2).all(|w| w[0] <= w[1]));

        let cancel = CancellationToken::uncancelable();
        read.await_termination(&cancel).unwrap();
        write.await_termination(&cancel).unwrap();
    }

    #[test]
    fn test_query_failure_fails_task() {
        let recorder = Recorder::new();
        let executor = AutoReportRewQueryExecutor::new(Duration::from_millis(50));
        let read = AccessToken::sync("read");
        let write = AccessToken::new("write", Arc::new(SyncTaskExecutor));

        let mut query = counting("arg", 2, &recorder);
        query.fail = true;

        let future = executor.execute(query, &read, &write);
        match future.wait() {
            Err(TaskError::Failed(e)) => assert_eq!(e.to_string(), "query failed"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(future.phase(), RewPhase::Errored);
        assert_eq!(recorder.cancel_count(), 0);
    }

    #[test]
    fn test_cancel_before_read() {
        let recorder = Recorder::new();
        let executor = AutoReportRewQueryExecutor::new(Duration::from_millis(50));
        let read = AccessToken::sync("read");
        let write = AccessToken::sync("write");

        read.shutdown();
        let future = executor.execute(counting("arg", 2, &recorder), &read, &write);
        assert!(future.wait().unwrap_err().is_canceled());
        assert_eq!(recorder.cancel_count(), 1);
        assert!(recorder.outputs().is_empty());
    }

    struct PanickingQuery;

    impl RewQuery for PanickingQuery {
        type Input = ();
        type Output = ();

        fn read_input(&self, _: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }

        fn output_query(&self) -> Arc<dyn AsyncDataQuery<(), ()>> {
            panic!("no query today")
        }

        fn write_output(&self, _: ()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_panicking_query_fails_task() {
        let executor = AutoReportRewQueryExecutor::new(Duration::from_millis(50));
        let read = AccessToken::new("read", Arc::new(ThreadPerJobExecutor));
        let write = AccessToken::new("write", Arc::new(ThreadPerJobExecutor));

        let future = executor.execute_and_release(PanickingQuery, &read, &write);
        assert!(future.wait_timeout(Duration::from_secs(5)));
        match future.wait() {
            Err(TaskError::Failed(e)) => assert!(e.to_string().contains("no query today")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(future.phase(), RewPhase::Errored);
        assert!(read.is_shutdown());
        assert!(write.is_shutdown());
    }

    /// Produces values until canceled and rejects every one of them.
    struct RejectingQuery {
        stopped: std::sync::mpsc::Sender<bool>,
    }

    impl RewQuery for RejectingQuery {
        type Input = ();
        type Output = u32;

        fn read_input(&self, _: &CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }

        fn output_query(&self) -> Arc<dyn AsyncDataQuery<(), u32>> {
            let stopped = Arc::new(Mutex::new(self.stopped.clone()));
            Arc::new(FnDataQuery::new(move |_: ()| {
                let stopped = stopped.clone();
                Arc::new(TaskDataLink::<u32>::new(
                    Arc::new(ThreadPerJobExecutor),
                    move |cancel, sink| {
                        let deadline = std::time::Instant::now() + Duration::from_secs(5);
                        while !cancel.is_canceled() && std::time::Instant::now() < deadline {
                            sink.emit(1);
                            std::thread::sleep(Duration::from_millis(1));
                        }
                        let _ = stopped.lock().unwrap().send(cancel.is_canceled());
                        Ok(())
                    },
                )) as Arc<dyn AsyncDataLink<u32>>
            }))
        }

        fn write_output(&self, _: u32) -> anyhow::Result<()> {
            anyhow::bail!("read-only sink")
        }
    }

    #[test]
    fn test_write_failure_cancels_query() {
        let (tx, rx) = channel();
        let executor = AutoReportRewQueryExecutor::new(Duration::from_millis(50));
        let read = AccessToken::new("read", Arc::new(ThreadPerJobExecutor));
        let write = AccessToken::new("write", Arc::new(ThreadPerJobExecutor));

        let future = executor.execute(RejectingQuery { stopped: tx }, &read, &write);
        match future.wait() {
            Err(TaskError::Failed(e)) => assert_eq!(e.to_string(), "read-only sink"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn test_terminal_state_visible_after_wait() {
        let executor = AutoReportRewQueryExecutor::new(Duration::from_millis(1));

        for _ in 0..100 {
            let recorder = Recorder::new();
            let read = AccessToken::new("read", Arc::new(ThreadPerJobExecutor));
            let write = AccessToken::new("write", Arc::new(ThreadPerJobExecutor));

            let future = executor.execute_and_release(counting("arg", 2, &recorder), &read, &write);
            let outcome = future.wait();
            assert!(outcome.is_ok());
            assert_eq!(future.phase(), RewPhase::Completed);
            assert!(read.is_shutdown());
            assert!(write.is_shutdown());
        }
    }

    #[test]
    fn test_finished_queries_leave_no_termination_listeners() {
        let executor = AutoReportRewQueryExecutor::new(Duration::from_millis(50));
        let read = AccessToken::sync("read");
        let write = AccessToken::new("write", Arc::new(SyncTaskExecutor));

        for _ in 0..20 {
            let recorder = Recorder::new();
            executor.execute_now(counting("arg", 1, &recorder), &read, &write).wait().unwrap();
            assert_eq!(recorder.cancel_count(), 0);
        }

        assert_eq!(read.termination_listener_count(), 0);
        assert_eq!(write.termination_listener_count(), 0);
    }
}
