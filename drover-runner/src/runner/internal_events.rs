// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Internal events used between the runner components.
//!
//! These events often mirror those in [`crate::reporter::events`], but are
//! used within the runner. They can carry additional information that the
//! reporter doesn't need to know about.

use crate::{
    list::TestInstance,
    reporter::events::{ExecuteStatus, ExecutionResult, ExecutionStatuses, RetryData},
    reporter::TestOutputDisplay,
    signal::ShutdownEvent,
    time::StopwatchSnapshot,
};
use bytes::Bytes;
use std::time::Duration;

/// An internal event.
///
/// These events are sent by the executor (the part that actually runs
/// executables) to the dispatcher (the part of the runner that coordinates
/// with the external world).
#[derive(Debug)]
pub(super) enum ExecutorEvent<'a> {
    Started {
        test_instance: TestInstance<'a>,
    },
    Slow {
        test_instance: TestInstance<'a>,
        retry_data: RetryData,
        elapsed: Duration,
        will_terminate: Option<Duration>,
    },
    AttemptFailedWillRetry {
        test_instance: TestInstance<'a>,
        failure_output: TestOutputDisplay,
        run_status: ExecuteStatus,
        delay_before_next_attempt: Duration,
    },
    RetryStarted {
        test_instance: TestInstance<'a>,
        retry_data: RetryData,
    },
    Finished {
        test_instance: TestInstance<'a>,
        failure_output: TestOutputDisplay,
        run_statuses: ExecutionStatuses,
    },
    /// The test requires more slots than the run has: it is reported as an
    /// infrastructure failure without being started.
    Unschedulable {
        test_instance: TestInstance<'a>,
        threads_required: usize,
        total_slots: usize,
    },
    /// A child process survived a forceful kill: the runner has lost control
    /// of it, and the run must be aborted.
    LostChild {
        test_instance: TestInstance<'a>,
        pid: u32,
    },
}

/// The state of a single attempt, before conversion to the external
/// [`ExecuteStatus`].
pub(super) struct InternalExecuteStatus {
    pub(super) stdout: Bytes,
    pub(super) stderr: Bytes,
    pub(super) result: ExecutionResult,
    pub(super) stopwatch_end: StopwatchSnapshot,
    pub(super) is_slow: bool,
    pub(super) delay_before_start: Duration,
}

impl InternalExecuteStatus {
    pub(super) fn into_external(self, retry_data: RetryData) -> ExecuteStatus {
        ExecuteStatus {
            retry_data,
            stdout: self.stdout,
            stderr: self.stderr,
            result: self.result,
            start_time: self.stopwatch_end.start_time.fixed_offset(),
            time_taken: self.stopwatch_end.duration,
            is_slow: self.is_slow,
            delay_before_start: self.delay_before_start,
        }
    }
}

/// A shutdown signal forwarded from the dispatcher to running tests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum ShutdownForwardEvent {
    /// The first shutdown signal: terminate children gracefully.
    Once(ShutdownEvent),

    /// A second shutdown signal: kill children immediately.
    Twice,
}
