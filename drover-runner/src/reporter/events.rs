// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted by the test runner.
//!
//! These events are produced by the runner while executing tests, and
//! consumed by reporting components such as
//! [`RunAggregator`](crate::reporter::RunAggregator).

use crate::list::{TestInstance, TestList};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use serde::Deserialize;
use std::{fmt, time::Duration};

/// The kind for [`RunId`] typed UUIDs.
#[derive(Debug)]
pub enum RunIdKind {}

impl TypedUuidKind for RunIdKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("drover-run");
        TAG
    }
}

/// A unique identifier for a test run.
pub type RunId = TypedUuid<RunIdKind>;

/// When to display captured test output.
///
/// This controls reporting granularity only: it never affects retry or
/// pass/fail decisions.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum TestOutputDisplay {
    /// Output is displayed as attempts fail.
    Immediate,

    /// Output is displayed once, at the end of the run.
    Final,

    /// Output is never displayed.
    Never,
}

impl TestOutputDisplay {
    /// Returns true if output should be shown as attempts fail.
    pub fn is_immediate(self) -> bool {
        matches!(self, Self::Immediate)
    }

    /// Returns true if output should be shown at the end of the run.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Final)
    }
}

impl fmt::Display for TestOutputDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Final => write!(f, "final"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// Data related to retries for a test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryData {
    /// The current attempt. In the range `[1, total_attempts]`.
    pub attempt: usize,

    /// The total number of times this test can be run. Equal to `1 + retry count`.
    pub total_attempts: usize,
}

impl RetryData {
    /// Returns true if this is the last attempt for the test.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.total_attempts
    }
}

/// Whether a test passed, failed or an error occurred while executing the test.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionResult {
    /// The test passed.
    Pass,

    /// The test failed.
    Fail {
        /// The abort status of the test, if any (for example, the signal on Unix).
        abort_status: Option<AbortStatus>,
    },

    /// An error occurred while executing the test (for example, the process
    /// failed to spawn).
    ExecFail,

    /// The test was terminated because it exceeded its slow-timeout
    /// escalation budget.
    Timeout,

    /// The test was terminated because the run was cancelled.
    Terminated,
}

impl ExecutionResult {
    /// Returns true if the test was successful.
    pub fn is_success(self) -> bool {
        match self {
            ExecutionResult::Pass => true,
            ExecutionResult::Fail { .. }
            | ExecutionResult::ExecFail
            | ExecutionResult::Timeout
            | ExecutionResult::Terminated => false,
        }
    }
}

/// A regular exit code or signal abort status for a test.
///
/// Returned as part of the [`ExecutionResult::Fail`] variant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AbortStatus {
    /// The test was aborted due to a signal on Unix.
    #[cfg(unix)]
    UnixSignal(i32),

    /// The test was determined to have aborted on Windows.
    #[cfg(windows)]
    WindowsNtStatus(i32),
}

/// Information about a single execution (attempt) of a test.
#[derive(Clone, Debug)]
pub struct ExecuteStatus {
    /// Retry-related data.
    pub retry_data: RetryData,

    /// Standard output for this test.
    pub stdout: Bytes,

    /// Standard error for this test.
    pub stderr: Bytes,

    /// The result of executing this test.
    pub result: ExecutionResult,

    /// The time at which the test started.
    pub start_time: DateTime<FixedOffset>,

    /// The time it took for the test to run.
    pub time_taken: Duration,

    /// Whether this test counts as slow.
    pub is_slow: bool,

    /// The delay that was applied before this attempt started (non-zero for
    /// retries with backoff).
    pub delay_before_start: Duration,
}

/// Information about all executions of a test, including retries.
#[derive(Clone, Debug)]
pub struct ExecutionStatuses {
    /// This is guaranteed to be non-empty.
    statuses: Vec<ExecuteStatus>,
}

#[expect(clippy::len_without_is_empty)] // ExecutionStatuses is never empty
impl ExecutionStatuses {
    pub(crate) fn new(statuses: Vec<ExecuteStatus>) -> Self {
        debug_assert!(!statuses.is_empty(), "execution statuses is non-empty");
        Self { statuses }
    }

    /// Returns the last execution status.
    ///
    /// This status is used as the final result of the test.
    pub fn last_status(&self) -> &ExecuteStatus {
        self.statuses
            .last()
            .expect("execution statuses is non-empty")
    }

    /// Iterates over all the statuses.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &'_ ExecuteStatus> + '_ {
        self.statuses.iter()
    }

    /// Returns the number of times the test was executed.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Returns a description of self.
    pub fn describe(&self) -> ExecutionDescription<'_> {
        let last_status = self.last_status();
        if last_status.result.is_success() {
            if self.statuses.len() > 1 {
                ExecutionDescription::Flaky {
                    last_status,
                    prior_statuses: &self.statuses[..self.statuses.len() - 1],
                }
            } else {
                ExecutionDescription::Success {
                    single_status: last_status,
                }
            }
        } else {
            let first_status = self
                .statuses
                .first()
                .expect("execution statuses is non-empty");
            let retries = &self.statuses[1..];
            ExecutionDescription::Failure {
                first_status,
                last_status,
                retries,
            }
        }
    }
}

/// A description of test executions obtained from [`ExecutionStatuses`].
///
/// This can be used to quickly determine whether a test passed, failed or was flaky.
#[derive(Copy, Clone, Debug)]
pub enum ExecutionDescription<'a> {
    /// The test was run once and was successful.
    Success {
        /// The status of the test.
        single_status: &'a ExecuteStatus,
    },

    /// The test was run more than once. The final result was successful.
    Flaky {
        /// The last, successful status.
        last_status: &'a ExecuteStatus,

        /// Previous statuses, none of which are successes.
        prior_statuses: &'a [ExecuteStatus],
    },

    /// The test was run once, or possibly multiple times. All runs failed.
    Failure {
        /// The first, failing status.
        first_status: &'a ExecuteStatus,

        /// The last, failing status. Same as the first status if no retries were performed.
        last_status: &'a ExecuteStatus,

        /// Any retries that were performed. All of these runs failed.
        ///
        /// May be empty.
        retries: &'a [ExecuteStatus],
    },
}

impl<'a> ExecutionDescription<'a> {
    /// Returns the last run status.
    pub fn last_status(&self) -> &'a ExecuteStatus {
        match self {
            ExecutionDescription::Success {
                single_status: last_status,
            }
            | ExecutionDescription::Flaky { last_status, .. }
            | ExecutionDescription::Failure { last_status, .. } => last_status,
        }
    }
}

/// Statistics for a test run.
#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct RunStats {
    /// The total number of tests that were expected to be run at the beginning.
    ///
    /// If the test run is cancelled, this will be more than `finished_count` at the end.
    pub initial_run_count: usize,

    /// The total number of tests that finished running.
    pub finished_count: usize,

    /// The number of tests that passed. Includes `passed_slow` and `flaky`.
    pub passed: usize,

    /// The number of slow tests that passed.
    pub passed_slow: usize,

    /// The number of tests that passed on retry.
    pub flaky: usize,

    /// The number of tests that failed.
    pub failed: usize,

    /// The number of failed tests that were slow.
    pub failed_slow: usize,

    /// The number of tests that timed out.
    pub timed_out: usize,

    /// The number of tests that were terminated due to run cancellation.
    pub terminated: usize,

    /// The number of tests that encountered an execution failure.
    pub exec_failed: usize,

    /// The number of tests whose slot requirement could not be satisfied by
    /// the run's concurrency budget. These are infrastructure failures: the
    /// tests were never started.
    pub unschedulable: usize,
}

impl RunStats {
    /// Returns true if this run is considered a success.
    ///
    /// A run is marked as failed if any of the following are true:
    /// * the run was cancelled: the initial run count is greater than the final run count
    /// * any tests failed, timed out, were terminated, or couldn't be run
    pub fn is_success(&self) -> bool {
        if self.initial_run_count > self.finished_count {
            return false;
        }
        if self.any_failed() {
            return false;
        }
        true
    }

    /// Returns true if any tests failed, timed out, were terminated, or
    /// couldn't be scheduled.
    #[inline]
    pub fn any_failed(&self) -> bool {
        self.failed_count() > 0
    }

    /// Returns the number of tests with a non-pass final status.
    #[inline]
    pub fn failed_count(&self) -> usize {
        self.failed + self.exec_failed + self.timed_out + self.terminated + self.unschedulable
    }

    pub(crate) fn on_test_finished(&mut self, run_statuses: &ExecutionStatuses) {
        self.finished_count += 1;
        // run_statuses is guaranteed to have at least one element. The final
        // status of the test is the status of the last attempt.
        let last_status = run_statuses.last_status();
        match last_status.result {
            ExecutionResult::Pass => {
                self.passed += 1;
                if last_status.is_slow {
                    self.passed_slow += 1;
                }
                if run_statuses.len() > 1 {
                    self.flaky += 1;
                }
            }
            ExecutionResult::Fail { .. } => {
                self.failed += 1;
                if last_status.is_slow {
                    self.failed_slow += 1;
                }
            }
            ExecutionResult::Timeout => self.timed_out += 1,
            ExecutionResult::Terminated => self.terminated += 1,
            ExecutionResult::ExecFail => self.exec_failed += 1,
        }
    }

    pub(crate) fn on_test_unschedulable(&mut self) {
        self.finished_count += 1;
        self.unschedulable += 1;
    }
}

/// The reason a test run was cancelled early.
///
/// The ordering is significant: cancellation can only escalate to a
/// higher-priority reason.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// A test failure caused the run to be cancelled (fail-fast).
    TestFailure,

    /// An error was reported by the event callback.
    ReportError,

    /// A shutdown signal was received.
    Signal,

    /// An interrupt (Ctrl-C) was received.
    Interrupt,

    /// A test subprocess could not be killed; the runner has lost control of
    /// it and must abort the run.
    KillFailure,
}

/// An event produced during a test run.
#[derive(Clone, Debug)]
pub struct TestEvent<'a> {
    /// The wall-clock time at which the event was produced.
    pub timestamp: DateTime<FixedOffset>,

    /// The time elapsed since the start of the run.
    pub elapsed: Duration,

    /// The kind of event.
    pub kind: TestEventKind<'a>,
}

/// The kind of an event produced during a test run.
#[derive(Clone, Debug)]
pub enum TestEventKind<'a> {
    /// The test run started.
    RunStarted {
        /// The list of tests that will be run.
        test_list: &'a TestList,

        /// The UUID for this run.
        run_id: RunId,

        /// The profile the run was started with.
        profile_name: String,

        /// The total concurrency budget for the run.
        total_slots: usize,
    },

    /// A test started running.
    TestStarted {
        /// The test instance that was started.
        test_instance: TestInstance<'a>,

        /// Current run statistics.
        current_stats: RunStats,

        /// The number of tests currently running, including this one.
        running: usize,

        /// The cancel status of the run, if any.
        cancel_state: Option<CancelReason>,
    },

    /// A test was slower than its slow-timeout period.
    TestSlow {
        /// The test instance that was slow.
        test_instance: TestInstance<'a>,

        /// Retry data for the current attempt.
        retry_data: RetryData,

        /// The elapsed time the test has been running for.
        elapsed: Duration,

        /// If the test is about to be terminated, the grace period before a
        /// forceful kill.
        will_terminate: Option<Duration>,
    },

    /// A test attempt failed and will be retried in the future.
    TestAttemptFailedWillRetry {
        /// The test instance that is being retried.
        test_instance: TestInstance<'a>,

        /// The status of the failed attempt.
        run_status: ExecuteStatus,

        /// The delay before the next attempt.
        delay_before_next_attempt: Duration,

        /// Whether failure output should be displayed for this attempt.
        failure_output: TestOutputDisplay,
    },

    /// A retry attempt started.
    TestRetryStarted {
        /// The test instance that is being retried.
        test_instance: TestInstance<'a>,

        /// Retry data for the new attempt.
        retry_data: RetryData,
    },

    /// A test finished running, including all attempts.
    TestFinished {
        /// The test instance that finished running.
        test_instance: TestInstance<'a>,

        /// Information about all the runs for this test.
        run_statuses: ExecutionStatuses,

        /// Current run statistics.
        current_stats: RunStats,

        /// The number of tests still running after this one finished.
        running: usize,

        /// The cancel status of the run, if any.
        cancel_state: Option<CancelReason>,

        /// Whether failure output should be displayed for this test.
        failure_output: TestOutputDisplay,
    },

    /// A test's slot requirement exceeded the run's total budget: it was
    /// reported as an infrastructure failure without being started.
    TestUnschedulable {
        /// The test instance that couldn't be scheduled.
        test_instance: TestInstance<'a>,

        /// The slots the test required.
        threads_required: usize,

        /// The total concurrency budget for the run.
        total_slots: usize,

        /// Current run statistics.
        current_stats: RunStats,
    },

    /// The run is being cancelled: no new tests will start, and tests
    /// currently running are allowed to drain.
    RunBeginCancel {
        /// The number of tests still running.
        running: usize,

        /// The reason the run is being cancelled.
        reason: CancelReason,
    },

    /// The test run finished.
    RunFinished {
        /// The UUID for this run.
        run_id: RunId,

        /// The time at which the run started.
        start_time: DateTime<FixedOffset>,

        /// The total time the run took.
        elapsed: Duration,

        /// Statistics for the run.
        run_stats: RunStats,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn status(result: ExecutionResult, attempt: usize, total_attempts: usize) -> ExecuteStatus {
        ExecuteStatus {
            retry_data: RetryData {
                attempt,
                total_attempts,
            },
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            result,
            start_time: Local::now().fixed_offset(),
            time_taken: Duration::from_millis(1),
            is_slow: false,
            delay_before_start: Duration::ZERO,
        }
    }

    #[test]
    fn describe_single_success() {
        let statuses = ExecutionStatuses::new(vec![status(ExecutionResult::Pass, 1, 1)]);
        assert!(matches!(
            statuses.describe(),
            ExecutionDescription::Success { .. }
        ));
    }

    #[test]
    fn describe_flaky() {
        let statuses = ExecutionStatuses::new(vec![
            status(ExecutionResult::Fail { abort_status: None }, 1, 3),
            status(ExecutionResult::Pass, 2, 3),
        ]);
        match statuses.describe() {
            ExecutionDescription::Flaky { prior_statuses, .. } => {
                assert_eq!(prior_statuses.len(), 1);
            }
            other => panic!("expected flaky, got {other:?}"),
        }
    }

    #[test]
    fn describe_failure_uses_last_status() {
        let statuses = ExecutionStatuses::new(vec![
            status(ExecutionResult::Fail { abort_status: None }, 1, 2),
            status(ExecutionResult::Timeout, 2, 2),
        ]);
        match statuses.describe() {
            ExecutionDescription::Failure { last_status, .. } => {
                assert_eq!(last_status.result, ExecutionResult::Timeout);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn run_stats_accounting() {
        let mut stats = RunStats {
            initial_run_count: 3,
            ..RunStats::default()
        };

        stats.on_test_finished(&ExecutionStatuses::new(vec![status(
            ExecutionResult::Pass,
            1,
            1,
        )]));
        stats.on_test_finished(&ExecutionStatuses::new(vec![
            status(ExecutionResult::Fail { abort_status: None }, 1, 2),
            status(ExecutionResult::Pass, 2, 2),
        ]));
        stats.on_test_finished(&ExecutionStatuses::new(vec![status(
            ExecutionResult::Timeout,
            1,
            1,
        )]));

        assert_eq!(stats.finished_count, 3);
        assert_eq!(stats.passed, 2);
        assert_eq!(stats.flaky, 1);
        assert_eq!(stats.timed_out, 1);
        assert!(stats.any_failed());
        assert!(!stats.is_success());
    }

    #[test]
    fn run_stats_incomplete_run_is_failure() {
        let stats = RunStats {
            initial_run_count: 2,
            finished_count: 1,
            passed: 1,
            ..RunStats::default()
        };
        assert!(!stats.is_success());
    }

    #[test]
    fn cancel_reason_ordering_escalates() {
        assert!(CancelReason::TestFailure < CancelReason::Signal);
        assert!(CancelReason::Signal < CancelReason::Interrupt);
        assert!(CancelReason::Interrupt < CancelReason::KillFailure);
    }
}
