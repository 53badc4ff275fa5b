use std::sync::Arc;

use crate::access::AccessToken;
use crate::cancel::CancellationToken;
use crate::executor::{TaskExecutor, UpdateTaskExecutor};
use crate::rew::base::{self, PendingRun, RewRun};
use crate::rew::{RewExecutor, RewFuture, RewOptions, RewPhase, RewTask, RewTaskReporter};
use crate::utils::catch_panic;

/// Evaluates [`RewTask`]s on a configurable executor.
#[derive(Clone)]
pub struct GenericRewTaskExecutor {
    evaluate_executor: Arc<dyn TaskExecutor>,
}

impl GenericRewTaskExecutor {
    pub fn new(evaluate_executor: Arc<dyn TaskExecutor>) -> Self {
        Self { evaluate_executor }
    }
}

fn make_reporter<T, Id>(task: &Arc<T>, run: &RewRun, write_token: &AccessToken<Id>) -> RewTaskReporter
where
    T: RewTask,
    Id: Send + Sync + 'static,
{
    let updates = UpdateTaskExecutor::new(Arc::new(write_token.clone()));
    let progress = {
        let task = task.clone();
        let run = run.clone();
        move |progress| {
            if run.is_done() {
                return;
            }
            let task = task.clone();
            updates.execute(move || task.write_progress(progress));
        }
    };

    let data = {
        let task = task.clone();
        let run = run.clone();
        let write_token = write_token.clone();
        move |data| {
            if run.is_done() {
                return;
            }
            let task = task.clone();
            write_token.execute(move || task.write_data(data));
        }
    };

    RewTaskReporter::new(progress, data)
}

impl<T: RewTask> RewExecutor<T> for GenericRewTaskExecutor {
    fn submit<Id>(
        &self,
        task: T,
        read_token: &AccessToken<Id>,
        write_token: &AccessToken<Id>,
        options: RewOptions,
    ) -> RewFuture
    where
        Id: Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let evaluate_executor = self.evaluate_executor.clone();
        let write_token_ = write_token.clone();

        let on_cancel = {
            let task = task.clone();
            move || task.cancel()
        };
        let read = {
            let task = task.clone();
            move |cancel: &CancellationToken| task.read_input(cancel)
        };

        let evaluate = move |run: RewRun, input: T::Input| {
            let write_token = write_token_;
            let pending = PendingRun::new(run);
            evaluate_executor.execute(Box::new(move || {
                let Some(run) = pending.into_run() else {
                    return;
                };
                if run.is_done() {
                    return;
                }

                let reporter = make_reporter(&task, &run, &write_token);
                let output = match catch_panic(|| task.evaluate(input, run.cancel_token(), &reporter)) {
                    Ok(output) => output,
                    Err(e) => return run.finish(Err(e)),
                };

                if !run.enter(RewPhase::Writing) {
                    return;
                }

                let cleanup = run.cancel_if_skipped();
                write_token.execute_with_cleanup(
                    move || {
                        if run.is_done() {
                            return;
                        }
                        run.finish(catch_panic(|| task.write_output(output)));
                    },
                    cleanup,
                );
            }));
        };

        base::start(read_token, write_token, options, on_cancel, read, evaluate)
    }
}
