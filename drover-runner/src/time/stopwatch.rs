// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stopwatch for tracking how long it takes to run tests.
//!
//! Tests need to track a start time and a duration. For that we use a combination of a realtime
//! clock (for the start time) and a monotonic clock (for the duration). Once the stopwatch is
//! snapshotted, the elapsed time comes from the monotonic clock so it isn't affected by wall-clock
//! changes.

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

pub(crate) fn stopwatch() -> StopwatchStart {
    StopwatchStart::new()
}

/// The start state of a stopwatch.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchStart {
    start_time: DateTime<Local>,
    instant: Instant,
}

impl StopwatchStart {
    fn new() -> Self {
        Self {
            // These two syscalls will happen imperceptibly close to each other, which is good
            // enough for our purposes.
            start_time: Local::now(),
            instant: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self) -> StopwatchSnapshot {
        StopwatchSnapshot {
            start_time: self.start_time,
            duration: self.instant.elapsed(),
        }
    }
}

/// A snapshot of a stopwatch: the wall-clock start time plus the monotonic elapsed duration.
#[derive(Clone, Debug)]
pub(crate) struct StopwatchSnapshot {
    pub(crate) start_time: DateTime<Local>,
    pub(crate) duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_duration_is_monotonic() {
        let start = stopwatch();
        let first = start.snapshot();
        std::thread::sleep(Duration::from_millis(10));
        let second = start.snapshot();

        assert_eq!(first.start_time, second.start_time);
        assert!(second.duration >= first.duration + Duration::from_millis(10));
    }
}
