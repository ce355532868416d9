// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregation of test events into a final run report.

use crate::reporter::events::{
    CancelReason, ExecutionResult, ExecutionStatuses, RunId, RunStats, TestEvent, TestEventKind,
    TestOutputDisplay,
};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use smol_str::SmolStr;
use std::time::Duration;

/// Accumulates [`TestEvent`]s into a [`RunReport`].
///
/// The aggregator tolerates partial runs: if the run is cancelled (fail-fast,
/// a signal, or loss of control over a subprocess), the finalized report
/// still covers every test that completed.
#[derive(Debug, Default)]
pub struct RunAggregator {
    run_id: Option<RunId>,
    profile_name: Option<String>,
    start_time: Option<DateTime<FixedOffset>>,
    elapsed: Option<Duration>,
    stats: RunStats,
    cancel_reason: Option<CancelReason>,
    tests: Vec<TestReport>,
}

impl RunAggregator {
    /// Creates a new aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes a single event.
    pub fn handle_event(&mut self, event: &TestEvent<'_>) {
        match &event.kind {
            TestEventKind::RunStarted {
                run_id,
                profile_name,
                ..
            } => {
                self.run_id = Some(*run_id);
                self.profile_name = Some(profile_name.clone());
            }
            TestEventKind::TestFinished {
                test_instance,
                run_statuses,
                current_stats,
                failure_output,
                ..
            } => {
                self.stats = *current_stats;
                let id = test_instance.id();
                self.tests.push(TestReport {
                    package_name: SmolStr::new(id.package_name),
                    test_name: SmolStr::new(id.test_name),
                    status: FinalStatus::executed(run_statuses, *failure_output),
                });
            }
            TestEventKind::TestUnschedulable {
                test_instance,
                threads_required,
                total_slots,
                current_stats,
            } => {
                self.stats = *current_stats;
                let id = test_instance.id();
                self.tests.push(TestReport {
                    package_name: SmolStr::new(id.package_name),
                    test_name: SmolStr::new(id.test_name),
                    status: FinalStatus::Unschedulable {
                        threads_required: *threads_required,
                        total_slots: *total_slots,
                    },
                });
            }
            TestEventKind::RunBeginCancel { reason, .. } => {
                self.cancel_reason = Some(*reason);
            }
            TestEventKind::RunFinished {
                start_time,
                elapsed,
                run_stats,
                ..
            } => {
                self.start_time = Some(*start_time);
                self.elapsed = Some(*elapsed);
                self.stats = *run_stats;
            }
            TestEventKind::TestStarted { .. }
            | TestEventKind::TestSlow { .. }
            | TestEventKind::TestAttemptFailedWillRetry { .. }
            | TestEventKind::TestRetryStarted { .. } => {}
        }
    }

    /// Finalizes the aggregator into a report.
    pub fn finalize(self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            profile_name: self.profile_name,
            start_time: self.start_time,
            elapsed: self.elapsed,
            stats: self.stats,
            cancel_reason: self.cancel_reason,
            tests: self.tests,
        }
    }
}

/// The final report for a test run.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RunReport {
    /// The UUID for the run, if the run started.
    pub run_id: Option<RunId>,

    /// The profile the run was started with.
    pub profile_name: Option<String>,

    /// The time at which the run started.
    pub start_time: Option<DateTime<FixedOffset>>,

    /// The total time the run took.
    pub elapsed: Option<Duration>,

    /// Statistics for the run.
    pub stats: RunStats,

    /// Why the run was cancelled early, if it was.
    pub cancel_reason: Option<CancelReason>,

    /// Per-test reports, in completion order.
    pub tests: Vec<TestReport>,
}

impl RunReport {
    /// Returns true if the run completed and every test passed.
    pub fn is_success(&self) -> bool {
        self.cancel_reason.is_none() && self.stats.is_success()
    }

    /// Returns the reports for tests whose final status was not a pass.
    pub fn failing_tests(&self) -> impl Iterator<Item = &TestReport> + '_ {
        self.tests.iter().filter(|test| !test.is_success())
    }
}

/// The final report for a single test.
#[derive(Clone, Debug)]
pub struct TestReport {
    /// The name of the package the test belongs to.
    pub package_name: SmolStr,

    /// The name of the test.
    pub test_name: SmolStr,

    /// The final status of the test.
    pub status: FinalStatus,
}

impl TestReport {
    /// Returns true if the test's final status is a pass.
    pub fn is_success(&self) -> bool {
        match &self.status {
            FinalStatus::Executed { result, .. } => result.is_success(),
            FinalStatus::Unschedulable { .. } => false,
        }
    }
}

/// The final status of a single test.
#[derive(Clone, Debug)]
pub enum FinalStatus {
    /// The test was executed.
    Executed {
        /// The result of the last attempt.
        result: ExecutionResult,

        /// Whether the test passed after at least one failed attempt.
        is_flaky: bool,

        /// Per-attempt records, in attempt order.
        attempts: Vec<AttemptReport>,
    },

    /// The test couldn't be scheduled because its slot requirement exceeded
    /// the run's concurrency budget.
    Unschedulable {
        /// The slots the test required.
        threads_required: usize,

        /// The total concurrency budget for the run.
        total_slots: usize,
    },
}

impl FinalStatus {
    fn executed(run_statuses: &ExecutionStatuses, failure_output: TestOutputDisplay) -> Self {
        let last_result = run_statuses.last_status().result;
        let attempts = run_statuses
            .iter()
            .map(|status| {
                // failure-output controls whether captured output is carried
                // into the report: `never` drops it entirely, `final` keeps it
                // for the last attempt only, `immediate` keeps it for every
                // failed attempt.
                let is_last = status.retry_data.attempt == run_statuses.len();
                let keep_output = !status.result.is_success()
                    && match failure_output {
                        TestOutputDisplay::Never => false,
                        TestOutputDisplay::Final => is_last,
                        TestOutputDisplay::Immediate => true,
                    };
                AttemptReport {
                    attempt: status.retry_data.attempt,
                    result: status.result,
                    start_time: status.start_time,
                    duration: status.time_taken,
                    is_slow: status.is_slow,
                    stdout: keep_output.then(|| status.stdout.clone()),
                    stderr: keep_output.then(|| status.stderr.clone()),
                }
            })
            .collect();
        Self::Executed {
            result: last_result,
            is_flaky: last_result.is_success() && run_statuses.len() > 1,
            attempts,
        }
    }
}

/// A record of a single attempt of a test.
#[derive(Clone, Debug)]
pub struct AttemptReport {
    /// The attempt number, starting at 1.
    pub attempt: usize,

    /// The result of the attempt.
    pub result: ExecutionResult,

    /// The time at which the attempt started.
    pub start_time: DateTime<FixedOffset>,

    /// The time the attempt took.
    pub duration: Duration,

    /// Whether the attempt exceeded the slow-timeout period.
    pub is_slow: bool,

    /// Captured standard output, if retained by the failure-output policy.
    pub stdout: Option<Bytes>,

    /// Captured standard error, if retained by the failure-output policy.
    pub stderr: Option<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::events::{ExecuteStatus, RetryData};
    use chrono::Local;

    fn status_with_output(
        result: ExecutionResult,
        attempt: usize,
        total_attempts: usize,
    ) -> ExecuteStatus {
        ExecuteStatus {
            retry_data: RetryData {
                attempt,
                total_attempts,
            },
            stdout: Bytes::from_static(b"out"),
            stderr: Bytes::from_static(b"err"),
            result,
            start_time: Local::now().fixed_offset(),
            time_taken: Duration::from_millis(5),
            is_slow: false,
            delay_before_start: Duration::ZERO,
        }
    }

    #[test]
    fn failure_output_never_drops_output() {
        let statuses = ExecutionStatuses::new(vec![status_with_output(
            ExecutionResult::Fail { abort_status: None },
            1,
            1,
        )]);
        let status = FinalStatus::executed(&statuses, TestOutputDisplay::Never);
        match status {
            FinalStatus::Executed { attempts, .. } => {
                assert!(attempts[0].stdout.is_none());
                assert!(attempts[0].stderr.is_none());
            }
            other => panic!("expected executed, got {other:?}"),
        }
    }

    #[test]
    fn failure_output_final_keeps_last_attempt_only() {
        let statuses = ExecutionStatuses::new(vec![
            status_with_output(ExecutionResult::Fail { abort_status: None }, 1, 2),
            status_with_output(ExecutionResult::Fail { abort_status: None }, 2, 2),
        ]);
        let status = FinalStatus::executed(&statuses, TestOutputDisplay::Final);
        match status {
            FinalStatus::Executed { attempts, .. } => {
                assert!(attempts[0].stdout.is_none());
                assert!(attempts[1].stdout.is_some());
            }
            other => panic!("expected executed, got {other:?}"),
        }
    }

    #[test]
    fn failure_output_immediate_keeps_every_failed_attempt() {
        let statuses = ExecutionStatuses::new(vec![
            status_with_output(ExecutionResult::Fail { abort_status: None }, 1, 2),
            status_with_output(ExecutionResult::Pass, 2, 2),
        ]);
        let status = FinalStatus::executed(&statuses, TestOutputDisplay::Immediate);
        match status {
            FinalStatus::Executed {
                attempts, is_flaky, ..
            } => {
                assert!(is_flaky);
                assert!(attempts[0].stdout.is_some());
                // Passing attempts don't carry failure output.
                assert!(attempts[1].stdout.is_none());
            }
            other => panic!("expected executed, got {other:?}"),
        }
    }
}
