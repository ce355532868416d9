// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::{EvaluatableProfile, MaxFail, RetryPolicy, TestThreads},
    errors::{TestRunnerBuildError, TestRunnerExecuteErrors},
    list::TestList,
    reporter::{
        events::{RunId, RunStats, TestEvent},
        RunAggregator, RunReport,
    },
    runner::{DispatcherContext, ExecutorContext, ExecutorEvent},
    signal::{SignalHandler, SignalHandlerKind},
};
use async_scoped::TokioScope;
use future_queue::StreamExt;
use futures::prelude::*;
use std::{
    convert::Infallible,
    fmt,
    sync::atomic::AtomicBool,
};
use tokio::{
    runtime::Runtime,
    sync::{broadcast, mpsc::unbounded_channel, oneshot},
    task::JoinError,
};
use tracing::debug;

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    retries: Option<RetryPolicy>,
    max_fail: Option<MaxFail>,
    test_threads: Option<TestThreads>,
}

impl TestRunnerBuilder {
    /// Sets the retry policy for this test runner, overriding any retries
    /// specified in the profile or its overrides.
    pub fn set_retries(&mut self, retries: RetryPolicy) -> &mut Self {
        self.retries = Some(retries);
        self
    }

    /// Sets the max-fail value for this test runner, overriding the profile.
    pub fn set_max_fail(&mut self, max_fail: MaxFail) -> &mut Self {
        self.max_fail = Some(max_fail);
        self
    }

    /// Sets the total concurrency budget, overriding the profile.
    pub fn set_test_threads(&mut self, test_threads: TestThreads) -> &mut Self {
        self.test_threads = Some(test_threads);
        self
    }

    /// Creates a new test runner.
    pub fn build<'a>(
        self,
        test_list: &'a TestList,
        profile: &'a EvaluatableProfile<'a>,
        signal_handler: SignalHandlerKind,
    ) -> Result<TestRunner<'a>, TestRunnerBuildError> {
        let total_slots = self
            .test_threads
            .unwrap_or_else(|| profile.test_threads())
            .compute();
        let max_fail = self.max_fail.unwrap_or_else(|| profile.max_fail());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("drover-runner-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        Ok(TestRunner {
            inner: TestRunnerInner {
                run_id: RunId::new_v4(),
                profile,
                test_list,
                total_slots,
                force_retries: self.retries,
                max_fail,
                runtime,
            },
            signal_handler,
        })
    }
}

/// Context for running tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner<'a> {
    inner: TestRunnerInner<'a>,
    signal_handler: SignalHandler,
}

impl<'a> TestRunner<'a> {
    /// Executes the listed tests, each one in its own process.
    ///
    /// The callback is called with the results of each test.
    ///
    /// Returns an error if any of the tasks panicked.
    pub fn execute<F>(
        self,
        mut callback: F,
    ) -> Result<RunStats, TestRunnerExecuteErrors<Infallible>>
    where
        F: FnMut(TestEvent<'a>) + Send,
    {
        self.try_execute::<Infallible, _>(|test_event| {
            callback(test_event);
            Ok(())
        })
    }

    /// Executes the listed tests and aggregates the outcomes into a
    /// [`RunReport`].
    pub fn run_to_report(self) -> Result<RunReport, TestRunnerExecuteErrors<Infallible>> {
        let mut aggregator = RunAggregator::new();
        self.execute(|event| aggregator.handle_event(&event))?;
        Ok(aggregator.finalize())
    }

    /// Executes the listed tests, each one in its own process.
    ///
    /// Accepts a callback that is called with the results of each test. If
    /// the callback returns an error, the test run terminates and the
    /// callback is no longer called.
    ///
    /// Returns an error if any of the tasks panicked.
    pub fn try_execute<E, F>(
        mut self,
        mut callback: F,
    ) -> Result<RunStats, TestRunnerExecuteErrors<E>>
    where
        F: FnMut(TestEvent<'a>) -> Result<(), E> + Send,
        E: fmt::Debug + Send,
    {
        let (report_cancel_tx, report_cancel_rx) = oneshot::channel();

        // If report_cancel_tx is None, at least one error has occurred and
        // the runner has been instructed to shut down. first_error is also
        // set to Some in that case.
        let mut report_cancel_tx = Some(report_cancel_tx);
        let mut first_error = None;

        let res = self.inner.execute(
            &mut self.signal_handler,
            report_cancel_rx,
            |event| {
                match callback(event) {
                    Ok(()) => {}
                    Err(error) => {
                        // If the callback fails, the runner needs to start
                        // shutting down, but results keep being reported in
                        // case the callback starts working again.
                        if let Some(report_cancel_tx) = report_cancel_tx.take() {
                            let _ = report_cancel_tx.send(());
                            first_error = Some(error);
                        }
                    }
                }
            },
        );

        // Shut down the runtime aggressively: any stray blocked tasks would
        // otherwise delay the drop.
        self.inner.runtime.shutdown_background();

        match (res, first_error) {
            (Ok(run_stats), None) => Ok(run_stats),
            (Ok(_), Some(report_error)) => Err(TestRunnerExecuteErrors {
                report_error: Some(report_error),
                join_errors: Vec::new(),
            }),
            (Err(join_errors), report_error) => Err(TestRunnerExecuteErrors {
                report_error,
                join_errors,
            }),
        }
    }
}

#[derive(Debug)]
struct TestRunnerInner<'a> {
    run_id: RunId,
    profile: &'a EvaluatableProfile<'a>,
    test_list: &'a TestList,
    total_slots: usize,
    // This is Some if the user specifies a retry policy over the command-line.
    force_retries: Option<RetryPolicy>,
    max_fail: MaxFail,
    runtime: Runtime,
}

impl<'a> TestRunnerInner<'a> {
    fn execute<F>(
        &self,
        signal_handler: &mut SignalHandler,
        report_cancel_rx: oneshot::Receiver<()>,
        callback: F,
    ) -> Result<RunStats, Vec<JoinError>>
    where
        F: FnMut(TestEvent<'a>) + Send,
    {
        let cancelled = AtomicBool::new(false);
        let cancelled_ref = &cancelled;

        let mut dispatcher_cx = DispatcherContext::new(
            callback,
            self.run_id,
            self.profile.name(),
            self.total_slots,
            self.test_list.run_count(),
            self.max_fail,
        );

        // Send the initial event.
        dispatcher_cx.run_started(self.test_list);

        let dispatcher_cx_mut = &mut dispatcher_cx;

        let executor_cx = ExecutorContext::new(
            self.run_id,
            self.profile,
            self.force_retries,
            self.total_slots,
        );
        let executor_cx_ref = &executor_cx;

        let _guard = self.runtime.enter();

        let ((), results) = TokioScope::scope_and_block(move |scope| {
            let (resp_tx, resp_rx) = unbounded_channel::<ExecutorEvent<'a>>();

            // 4 is greater than the number of shutdown messages that will
            // ever be sent over this channel.
            let (forward_tx, _forward_rx) = broadcast::channel(4);
            let (cancellation_tx, _cancellation_rx) = broadcast::channel(1);

            // Run the dispatcher to completion in a task.
            let dispatcher_fut = dispatcher_cx_mut.run(
                resp_rx,
                signal_handler,
                report_cancel_rx,
                cancelled_ref,
                forward_tx.clone(),
                cancellation_tx.clone(),
            );
            scope.spawn_cancellable(dispatcher_fut, || ());

            debug!(
                total_slots = self.total_slots,
                run_count = self.test_list.run_count(),
                "dispatching tests"
            );

            let run_fut = futures::stream::iter(self.test_list.iter_tests())
                .map(move |test_instance| {
                    let resp_tx = resp_tx.clone();
                    let forward_rx = forward_tx.subscribe();
                    let cancel_rx = cancellation_tx.subscribe();

                    // Policy resolution is pure, so it happens exactly once
                    // per test, right here.
                    let query = test_instance.to_test_query();
                    let settings = self.profile.settings_for(&query);
                    let threads_required =
                        settings.threads_required().compute(self.total_slots);

                    // A test that can never fit is reported by the executor
                    // without being started; it doesn't occupy any slots.
                    let weight = if threads_required > self.total_slots {
                        0
                    } else {
                        threads_required
                    };

                    let fut = executor_cx_ref.run_test_instance(
                        test_instance,
                        settings,
                        threads_required,
                        cancelled_ref,
                        resp_tx,
                        forward_rx,
                        cancel_rx,
                    );

                    (weight, fut)
                })
                // future_queue admits tests in order (among those whose
                // weight currently fits) and completes them in any order; the
                // total weight of running futures never exceeds total_slots.
                .future_queue(self.total_slots)
                .collect::<()>();

            // Run the stream to completion.
            scope.spawn_cancellable(run_fut, || ());
        });

        dispatcher_cx.run_finished();

        // Were there any join errors?
        let join_errors = results
            .into_iter()
            .filter_map(|r| r.err())
            .collect::<Vec<_>>();
        if !join_errors.is_empty() {
            return Err(join_errors);
        }
        Ok(dispatcher_cx.run_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DroverConfig;

    #[test]
    fn builder_total_slots_from_profile_and_override() {
        let config = DroverConfig::from_sources("/fake/dir", None).unwrap();
        let profile = config.profile(DroverConfig::DEFAULT_PROFILE).unwrap();
        let test_list = TestList::default();

        let mut builder = TestRunnerBuilder::default();
        builder.set_test_threads(TestThreads::Count(20));
        let runner = builder
            .build(&test_list, &profile, SignalHandlerKind::Noop)
            .unwrap();
        assert_eq!(runner.inner.total_slots, 20);

        let runner = TestRunnerBuilder::default()
            .build(&test_list, &profile, SignalHandlerKind::Noop)
            .unwrap();
        assert_eq!(
            runner.inner.total_slots,
            crate::config::get_num_cpus(),
            "defaults to the profile's num-cpus budget"
        );
    }
}
