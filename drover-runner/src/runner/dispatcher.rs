// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the test runner.
//!
//! This module interfaces with the external world and the test executor. It
//! receives events from the executor and from other inputs (e.g. signal
//! handling), and sends events to the reporter. It is the only component
//! that mutates run-wide state: executors share nothing with each other.

use crate::{
    config::MaxFail,
    list::TestList,
    reporter::events::{CancelReason, RunId, RunStats, TestEvent, TestEventKind},
    runner::{ExecutorEvent, ShutdownForwardEvent},
    signal::{ShutdownEvent, SignalEvent, SignalHandler},
    time::StopwatchStart,
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, warn};

/// Context for the dispatcher.
///
/// This struct is responsible for coordinating events from the outside world
/// and communicating with the executor.
#[derive_where::derive_where(Debug)]
pub(super) struct DispatcherContext<'a, F> {
    callback: DebugIgnore<F>,
    run_id: RunId,
    profile_name: String,
    total_slots: usize,
    stopwatch: StopwatchStart,
    run_stats: RunStats,
    max_fail: MaxFail,
    running: usize,
    cancel_state: Option<CancelReason>,
    signal_count: Option<SignalCount>,
    _marker: PhantomData<fn(TestEvent<'a>)>,
}

impl<'a, F> DispatcherContext<'a, F>
where
    F: FnMut(TestEvent<'a>) + Send,
{
    pub(super) fn new(
        callback: F,
        run_id: RunId,
        profile_name: &str,
        total_slots: usize,
        initial_run_count: usize,
        max_fail: MaxFail,
    ) -> Self {
        Self {
            callback: DebugIgnore(callback),
            run_id,
            profile_name: profile_name.to_owned(),
            total_slots,
            stopwatch: crate::time::stopwatch(),
            run_stats: RunStats {
                initial_run_count,
                ..RunStats::default()
            },
            max_fail,
            running: 0,
            cancel_state: None,
            signal_count: None,
            _marker: PhantomData,
        }
    }

    pub(super) fn run_stats(&self) -> RunStats {
        self.run_stats
    }

    /// Runs the dispatcher to completion, until `executor_rx` is closed.
    ///
    /// `executor_rx` is the main communication channel between the dispatcher
    /// and the executors. The dispatcher is the sole consumer: it serializes
    /// all run-state mutation, so executors never contend on shared state.
    pub(super) async fn run(
        &mut self,
        mut executor_rx: UnboundedReceiver<ExecutorEvent<'a>>,
        signal_handler: &mut SignalHandler,
        report_cancel_rx: oneshot::Receiver<()>,
        cancelled_ref: &AtomicBool,
        forward_tx: broadcast::Sender<ShutdownForwardEvent>,
        cancellation_tx: broadcast::Sender<()>,
    ) {
        let mut report_cancel_rx = std::pin::pin!(report_cancel_rx);

        let mut signals_done = false;
        let mut report_cancel_rx_done = false;

        loop {
            let internal_event = tokio::select! {
                internal_event = executor_rx.recv() => {
                    match internal_event {
                        Some(event) => InternalEvent::Executor(event),
                        None => {
                            // All tests have finished running.
                            break;
                        }
                    }
                },
                internal_event = signal_handler.recv(), if !signals_done => {
                    match internal_event {
                        Some(event) => InternalEvent::Signal(event),
                        None => {
                            signals_done = true;
                            continue;
                        }
                    }
                },
                res = &mut report_cancel_rx, if !report_cancel_rx_done => {
                    report_cancel_rx_done = true;
                    match res {
                        Ok(()) => InternalEvent::ReportCancel,
                        Err(_) => {
                            // In normal operation the sender is kept alive
                            // until the end of the run, but there are shutdown
                            // orderings in which it's dropped early.
                            debug!("report_cancel_rx was dropped early");
                            continue;
                        }
                    }
                }
            };

            match self.handle_event(internal_event) {
                HandleEventResponse::None => {}
                HandleEventResponse::Cancel { forward } => {
                    // Note the ordering here: cancelled_ref is set *before*
                    // any notification is sent, so executors that observe a
                    // notification also observe the flag.
                    cancelled_ref.store(true, Ordering::Release);
                    // Wake up executors waiting out retry delays. Ignore
                    // errors: if there are no receivers to cancel, so be it.
                    let _ = cancellation_tx.send(());

                    // Fail-fast cancellation (`forward` is None) lets running
                    // children drain on their own.
                    if let Some(forward_event) = forward {
                        // Let all the child processes know about the signal.
                        let _ = forward_tx.send(forward_event);
                    }
                }
            }
        }
    }

    pub(super) fn run_started(&mut self, test_list: &'a TestList) {
        self.basic_callback(TestEventKind::RunStarted {
            test_list,
            run_id: self.run_id,
            profile_name: self.profile_name.clone(),
            total_slots: self.total_slots,
        })
    }

    pub(super) fn run_finished(&mut self) {
        let snapshot = self.stopwatch.snapshot();
        self.basic_callback(TestEventKind::RunFinished {
            run_id: self.run_id,
            start_time: snapshot.start_time.fixed_offset(),
            elapsed: snapshot.duration,
            run_stats: self.run_stats,
        })
    }

    #[inline]
    fn basic_callback(&mut self, kind: TestEventKind<'a>) {
        let snapshot = self.stopwatch.snapshot();
        let event = TestEvent {
            // Use `Local::now()` time (which isn't necessarily monotonic)
            // along with the monotonic `snapshot.duration`.
            timestamp: Local::now().fixed_offset(),
            elapsed: snapshot.duration,
            kind,
        };
        (self.callback)(event)
    }

    #[inline]
    fn callback_none_response(&mut self, kind: TestEventKind<'a>) -> HandleEventResponse {
        self.basic_callback(kind);
        HandleEventResponse::None
    }

    fn handle_event(&mut self, event: InternalEvent<'a>) -> HandleEventResponse {
        match event {
            InternalEvent::Executor(ExecutorEvent::Started { test_instance }) => {
                self.running += 1;
                self.callback_none_response(TestEventKind::TestStarted {
                    test_instance,
                    current_stats: self.run_stats,
                    running: self.running,
                    cancel_state: self.cancel_state,
                })
            }
            InternalEvent::Executor(ExecutorEvent::Slow {
                test_instance,
                retry_data,
                elapsed,
                will_terminate,
            }) => self.callback_none_response(TestEventKind::TestSlow {
                test_instance,
                retry_data,
                elapsed,
                will_terminate,
            }),
            InternalEvent::Executor(ExecutorEvent::AttemptFailedWillRetry {
                test_instance,
                failure_output,
                run_status,
                delay_before_next_attempt,
            }) => self.callback_none_response(TestEventKind::TestAttemptFailedWillRetry {
                test_instance,
                run_status,
                delay_before_next_attempt,
                failure_output,
            }),
            InternalEvent::Executor(ExecutorEvent::RetryStarted {
                test_instance,
                retry_data,
            }) => self.callback_none_response(TestEventKind::TestRetryStarted {
                test_instance,
                retry_data,
            }),
            InternalEvent::Executor(ExecutorEvent::Finished {
                test_instance,
                failure_output,
                run_statuses,
            }) => {
                self.running -= 1;
                self.run_stats.on_test_finished(&run_statuses);

                // Should this run be cancelled because of a failure?
                let fail_cancel = self
                    .max_fail
                    .is_exceeded(self.run_stats.failed_count());

                self.basic_callback(TestEventKind::TestFinished {
                    test_instance,
                    run_statuses,
                    current_stats: self.run_stats,
                    running: self.running,
                    cancel_state: self.cancel_state,
                    failure_output,
                });

                if fail_cancel {
                    // A test failure has hit the max-fail limit: stop
                    // admitting new tests, but let running tests drain.
                    self.begin_cancel(CancelReason::TestFailure, None)
                } else {
                    HandleEventResponse::None
                }
            }
            InternalEvent::Executor(ExecutorEvent::Unschedulable {
                test_instance,
                threads_required,
                total_slots,
            }) => {
                self.run_stats.on_test_unschedulable();
                warn!(
                    test_name = test_instance.name,
                    threads_required,
                    total_slots,
                    "test requires more slots than the run has; reporting as an infrastructure failure",
                );

                let fail_cancel = self
                    .max_fail
                    .is_exceeded(self.run_stats.failed_count());

                self.basic_callback(TestEventKind::TestUnschedulable {
                    test_instance,
                    threads_required,
                    total_slots,
                    current_stats: self.run_stats,
                });

                if fail_cancel {
                    self.begin_cancel(CancelReason::TestFailure, None)
                } else {
                    HandleEventResponse::None
                }
            }
            InternalEvent::Executor(ExecutorEvent::LostChild { test_instance, pid }) => {
                // The one run-fatal condition: a subprocess survived SIGKILL,
                // so the runner can no longer guarantee resource cleanup.
                warn!(
                    test_name = test_instance.name,
                    pid, "child process could not be killed; aborting the run",
                );
                self.begin_cancel(
                    CancelReason::KillFailure,
                    Some(ShutdownForwardEvent::Twice),
                )
            }
            InternalEvent::Signal(SignalEvent::Shutdown(event)) => {
                let signal_count = self.increment_signal_count();
                let forward_event = signal_count.to_forward_event(event);

                let cancel_reason = match event {
                    ShutdownEvent::Hangup | ShutdownEvent::Term => CancelReason::Signal,
                    ShutdownEvent::Interrupt => CancelReason::Interrupt,
                };

                self.begin_cancel(cancel_reason, Some(forward_event))
            }
            InternalEvent::ReportCancel => self.begin_cancel(CancelReason::ReportError, None),
        }
    }

    fn increment_signal_count(&mut self) -> SignalCount {
        let new_count = match self.signal_count {
            None => SignalCount::Once,
            Some(SignalCount::Once) => SignalCount::Twice,
            Some(SignalCount::Twice) => {
                // The process was signaled 3 times. Time to panic.
                panic!("Signaled 3 times, exiting immediately");
            }
        };
        self.signal_count = Some(new_count);
        new_count
    }

    /// Begins cancellation of the test run. Reported if the current cancel
    /// state is lower than the given reason.
    fn begin_cancel(
        &mut self,
        reason: CancelReason,
        forward: Option<ShutdownForwardEvent>,
    ) -> HandleEventResponse {
        if self.cancel_state < Some(reason) {
            self.cancel_state = Some(reason);
            debug!(?reason, "beginning cancellation");
            self.basic_callback(TestEventKind::RunBeginCancel {
                running: self.running,
                reason,
            });
            HandleEventResponse::Cancel { forward }
        } else if forward.is_some() {
            // Even if cancellation was already underway, new signals are
            // still forwarded to children (e.g. a second Ctrl-C).
            HandleEventResponse::Cancel { forward }
        } else {
            HandleEventResponse::None
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum SignalCount {
    Once,
    Twice,
}

impl SignalCount {
    fn to_forward_event(self, event: ShutdownEvent) -> ShutdownForwardEvent {
        match self {
            Self::Once => ShutdownForwardEvent::Once(event),
            Self::Twice => ShutdownForwardEvent::Twice,
        }
    }
}

#[derive(Debug)]
enum InternalEvent<'a> {
    Executor(ExecutorEvent<'a>),
    Signal(SignalEvent),
    ReportCancel,
}

enum HandleEventResponse {
    None,
    Cancel {
        forward: Option<ShutdownForwardEvent>,
    },
}
