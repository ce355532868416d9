// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The executor for tests.
//!
//! This component is responsible for running tests and reporting results to
//! the dispatcher. It supervises one test at a time: the retry loop, the
//! per-attempt subprocess, slow-timeout escalation and output capture.
//!
//! Note that the executor itself does not communicate directly with the
//! outside world. All communication is mediated by the dispatcher.

use crate::{
    config::{EvaluatableProfile, RetryPolicy, TestSettings},
    list::TestInstance,
    reporter::events::{AbortStatus, ExecutionResult, ExecutionStatuses, RetryData, RunId},
    runner::{
        os, ExecutorEvent, InternalExecuteStatus, ShutdownForwardEvent, TerminateChildResult,
        TerminateMode,
    },
    time::StopwatchStart,
};
use rand::{distr::OpenClosed01, RngExt};
use std::{process::Stdio, sync::atomic::{AtomicBool, Ordering}, time::Duration};
use tokio::{
    io::{AsyncReadExt, BufReader},
    sync::{broadcast, mpsc::UnboundedSender},
};
use tracing::debug;

/// How long to wait for stdout/stderr to reach EOF once the child has exited.
/// Grandchildren that inherited the pipes can keep them open indefinitely;
/// after this wait the captured output is taken as-is.
const OUTPUT_DRAIN_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct BackoffIter {
    policy: RetryPolicy,
    current_factor: f64,
    remaining_attempts: u32,
}

impl BackoffIter {
    const BACKOFF_EXPONENT: f64 = 2.;

    fn new(policy: RetryPolicy) -> Self {
        let remaining_attempts = policy.count();
        Self {
            policy,
            current_factor: 1.,
            remaining_attempts,
        }
    }

    fn next_delay_and_jitter(&mut self) -> (Duration, bool) {
        match self.policy {
            RetryPolicy::Fixed { delay, jitter, .. } => (delay, jitter),
            RetryPolicy::Exponential {
                delay,
                jitter,
                max_delay,
                ..
            } => {
                let factor = self.current_factor;
                let exp_delay = delay.mul_f64(factor);

                // Stop multiplying the exponential factor if delay is greater than max_delay.
                if let Some(max_delay) = max_delay {
                    if exp_delay > max_delay {
                        return (max_delay, jitter);
                    }
                }

                let next_factor = self.current_factor * Self::BACKOFF_EXPONENT;
                self.current_factor = next_factor;

                (exp_delay, jitter)
            }
        }
    }

    fn apply_jitter(duration: Duration) -> Duration {
        let jitter: f64 = rand::rng().sample(OpenClosed01);
        // Apply jitter in the range (0.5, 1].
        duration.mul_f64(0.5 + jitter / 2.)
    }
}

impl Iterator for BackoffIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_attempts > 0 {
            let (mut delay, jitter) = self.next_delay_and_jitter();
            if jitter {
                delay = Self::apply_jitter(delay);
            }
            self.remaining_attempts -= 1;
            Some(delay)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub(super) struct ExecutorContext<'a> {
    run_id: RunId,
    profile: &'a EvaluatableProfile<'a>,
    // This is Some if the user specifies a retry policy over the command-line.
    force_retries: Option<RetryPolicy>,
    total_slots: usize,
}

impl<'a> ExecutorContext<'a> {
    pub(super) fn new(
        run_id: RunId,
        profile: &'a EvaluatableProfile<'a>,
        force_retries: Option<RetryPolicy>,
        total_slots: usize,
    ) -> Self {
        Self {
            run_id,
            profile,
            force_retries,
            total_slots,
        }
    }

    /// Runs all attempts of a single test instance, reporting progress and
    /// the final result to the dispatcher.
    #[expect(clippy::too_many_arguments)]
    pub(super) async fn run_test_instance(
        &self,
        test_instance: TestInstance<'a>,
        settings: TestSettings,
        threads_required: usize,
        cancelled_ref: &AtomicBool,
        resp_tx: UnboundedSender<ExecutorEvent<'a>>,
        mut forward_rx: broadcast::Receiver<ShutdownForwardEvent>,
        mut cancel_rx: broadcast::Receiver<()>,
    ) {
        if threads_required > self.total_slots {
            // The test can never be admitted: report it as an infrastructure
            // failure rather than hanging or silently skipping it.
            let _ = resp_tx.send(ExecutorEvent::Unschedulable {
                test_instance,
                threads_required,
                total_slots: self.total_slots,
            });
            return;
        }

        if cancelled_ref.load(Ordering::Acquire) {
            // The run was cancelled before this test was admitted.
            return;
        }

        debug!(test_name = test_instance.name, "running test");

        let retry_policy = self.force_retries.unwrap_or_else(|| settings.retries());
        let total_attempts = retry_policy.count() as usize + 1;
        let mut backoff_iter = BackoffIter::new(retry_policy);

        // Failure to send means the receiver was dropped.
        let _ = resp_tx.send(ExecutorEvent::Started { test_instance });

        let mut run_statuses = Vec::with_capacity(1);
        let mut delay = Duration::ZERO;

        loop {
            let attempt = run_statuses.len() + 1;
            let retry_data = RetryData {
                attempt,
                total_attempts,
            };

            if retry_data.attempt > 1 {
                let _ = resp_tx.send(ExecutorEvent::RetryStarted {
                    test_instance,
                    retry_data,
                });
            }

            let run_status = self
                .run_test(
                    test_instance,
                    retry_data,
                    &settings,
                    delay,
                    &resp_tx,
                    &mut forward_rx,
                )
                .await
                .into_external(retry_data);

            if run_status.result.is_success() {
                // The test succeeded.
                run_statuses.push(run_status);
                break;
            } else if cancelled_ref.load(Ordering::Acquire) {
                // The run was cancelled: don't retry.
                run_statuses.push(run_status);
                break;
            } else if retry_data.attempt < retry_data.total_attempts {
                // Retry this test: send a retry event, then wait out the
                // backoff delay.
                delay = backoff_iter
                    .next()
                    .expect("backoff delay must be non-empty");

                let _ = resp_tx.send(ExecutorEvent::AttemptFailedWillRetry {
                    test_instance,
                    failure_output: settings.failure_output(),
                    run_status: run_status.clone(),
                    delay_before_next_attempt: delay,
                });
                run_statuses.push(run_status);

                // The wait must be cancellable: if the run is aborted while
                // this test is between attempts, give up on the remaining
                // retries rather than sleeping through the shutdown.
                let mut sleep = std::pin::pin!(tokio::time::sleep(delay));
                tokio::select! {
                    _ = &mut sleep => {}
                    _ = cancel_rx.recv() => break,
                }
            } else {
                // This test failed and is out of retries.
                run_statuses.push(run_status);
                break;
            }
        }

        // At this point, either:
        // * the test has succeeded, or
        // * the test has failed and we've run out of retries, or
        // * the run was cancelled.
        // In all cases, the test is finished.
        let _ = resp_tx.send(ExecutorEvent::Finished {
            test_instance,
            failure_output: settings.failure_output(),
            run_statuses: ExecutionStatuses::new(run_statuses),
        });
    }

    // ---
    // Helper methods
    // ---

    /// Runs an individual test attempt in its own process.
    async fn run_test(
        &self,
        test: TestInstance<'a>,
        retry_data: RetryData,
        settings: &TestSettings,
        delay_before_start: Duration,
        resp_tx: &UnboundedSender<ExecutorEvent<'a>>,
        forward_rx: &mut broadcast::Receiver<ShutdownForwardEvent>,
    ) -> InternalExecuteStatus {
        let stopwatch = crate::time::stopwatch();

        match self
            .run_test_inner(
                test,
                retry_data,
                settings,
                delay_before_start,
                &stopwatch,
                resp_tx,
                forward_rx,
            )
            .await
        {
            Ok(run_status) => run_status,
            Err(error) => {
                // A spawn (or I/O) failure is an ExecFail attempt: it consumes
                // a retry and never crashes the run.
                debug!(test_name = test.name, %error, "error executing test");
                InternalExecuteStatus {
                    stdout: bytes::Bytes::new(),
                    stderr: bytes::Bytes::new(),
                    result: ExecutionResult::ExecFail,
                    stopwatch_end: stopwatch.snapshot(),
                    is_slow: false,
                    delay_before_start,
                }
            }
        }
    }

    #[expect(clippy::too_many_arguments)]
    async fn run_test_inner(
        &self,
        test: TestInstance<'a>,
        retry_data: RetryData,
        settings: &TestSettings,
        delay_before_start: Duration,
        stopwatch: &StopwatchStart,
        resp_tx: &UnboundedSender<ExecutorEvent<'a>>,
        forward_rx: &mut broadcast::Receiver<ShutdownForwardEvent>,
    ) -> std::io::Result<InternalExecuteStatus> {
        let mut cmd = test.make_command();
        cmd.env("DROVER_RUN_ID", format!("{}", self.run_id));
        cmd.env("DROVER_PROFILE", self.profile.name());
        cmd.env("DROVER_ATTEMPT", format!("{}", retry_data.attempt));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        os::set_process_group(&mut cmd);

        let mut cmd = tokio::process::Command::from(cmd);
        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or_default();

        let mut status: Option<ExecutionResult> = None;
        let mut wedged = false;
        let slow_timeout = settings.slow_timeout();
        let mut is_slow = false;

        let mut interval = tokio::time::interval(slow_timeout.period);
        // The first tick is immediate.
        interval.tick().await;

        let mut timeout_hit = 0u32;

        let child_stdout = child.stdout.take().map(BufReader::new);
        let child_stderr = child.stderr.take().map(BufReader::new);
        let mut stdout = bytes::BytesMut::with_capacity(4096);
        let mut stderr = bytes::BytesMut::with_capacity(4096);

        let exit_status = {
            // Set up futures for reading from stdout and stderr.
            let stdout_fut = async {
                if let Some(mut child_stdout) = child_stdout {
                    loop {
                        stdout.reserve(4096);
                        let bytes_read = child_stdout.read_buf(&mut stdout).await?;
                        if bytes_read == 0 {
                            break;
                        }
                    }
                }
                Ok::<_, std::io::Error>(())
            };
            tokio::pin!(stdout_fut);
            let mut stdout_done = false;

            let stderr_fut = async {
                if let Some(mut child_stderr) = child_stderr {
                    loop {
                        stderr.reserve(4096);
                        let bytes_read = child_stderr.read_buf(&mut stderr).await?;
                        if bytes_read == 0 {
                            break;
                        }
                    }
                }
                Ok::<_, std::io::Error>(())
            };
            tokio::pin!(stderr_fut);
            let mut stderr_done = false;

            let mut forward_done = false;

            let exit_status = loop {
                tokio::select! {
                    res = &mut stdout_fut, if !stdout_done => {
                        stdout_done = true;
                        res?;
                    }
                    res = &mut stderr_fut, if !stderr_done => {
                        stderr_done = true;
                        res?;
                    }
                    res = child.wait() => {
                        // The test finished executing.
                        break Some(res?);
                    }
                    _ = interval.tick(), if status.is_none() => {
                        is_slow = true;
                        timeout_hit += 1;

                        let will_terminate = slow_timeout
                            .terminate_after
                            .is_some_and(|terminate_after| {
                                timeout_hit as usize >= terminate_after.get()
                            });

                        let _ = resp_tx.send(ExecutorEvent::Slow {
                            test_instance: test,
                            retry_data,
                            // Pass in the period times timeout_hit, since the
                            // stopwatch elapsed tends to be slightly longer.
                            elapsed: slow_timeout.period * timeout_hit,
                            will_terminate: will_terminate.then_some(slow_timeout.grace_period),
                        });

                        if will_terminate {
                            // Attempt to terminate the slow test. As there is
                            // a race between shutting down a slow test and its
                            // own completion, errors are ignored inside.
                            let result = os::terminate_child(
                                &mut child,
                                TerminateMode::Timeout,
                                slow_timeout.grace_period,
                            )
                            .await;
                            status = Some(ExecutionResult::Timeout);
                            if result == TerminateChildResult::Wedged {
                                let _ = resp_tx.send(ExecutorEvent::LostChild {
                                    test_instance: test,
                                    pid,
                                });
                                wedged = true;
                            }
                        }
                    }
                    recv = forward_rx.recv(), if !forward_done => {
                        match recv {
                            Ok(event) => {
                                let result = os::terminate_child(
                                    &mut child,
                                    TerminateMode::Signal(event),
                                    slow_timeout.grace_period,
                                )
                                .await;
                                status = Some(ExecutionResult::Terminated);
                                if result == TerminateChildResult::Wedged {
                                    let _ = resp_tx.send(ExecutorEvent::LostChild {
                                        test_instance: test,
                                        pid,
                                    });
                                    wedged = true;
                                }
                            }
                            Err(_) => {
                                // The dispatcher has shut down the forward
                                // channel.
                                forward_done = true;
                            }
                        }
                    }
                };

                if wedged {
                    // The child survived SIGKILL: its exit status will never
                    // arrive. Give up on it instead of hanging the run.
                    break None;
                }
            };

            // Once the process is done, wait a bounded amount of time for the
            // pipes to shut down. Grandchildren that inherited stdout/stderr
            // can keep them open past the child's exit.
            if !(stdout_done && stderr_done) {
                let mut sleep = std::pin::pin!(tokio::time::sleep(OUTPUT_DRAIN_WAIT));
                loop {
                    tokio::select! {
                        res = &mut stdout_fut, if !stdout_done => {
                            stdout_done = true;
                            res?;
                        }
                        res = &mut stderr_fut, if !stderr_done => {
                            stderr_done = true;
                            res?;
                        }
                        _ = &mut sleep => break,
                        else => break,
                    }
                }
            }

            exit_status
        };

        let result = match exit_status {
            Some(exit_status) => status.unwrap_or_else(|| {
                if exit_status.success() {
                    ExecutionResult::Pass
                } else {
                    cfg_if::cfg_if! {
                        if #[cfg(unix)] {
                            // On Unix, extract the signal if it's found.
                            use std::os::unix::process::ExitStatusExt;
                            let abort_status = exit_status.signal().map(AbortStatus::UnixSignal);
                        } else if #[cfg(windows)] {
                            let abort_status = exit_status.code().and_then(|code| {
                                (code < 0).then_some(AbortStatus::WindowsNtStatus(code))
                            });
                        } else {
                            let abort_status = None;
                        }
                    }
                    ExecutionResult::Fail { abort_status }
                }
            }),
            // The child could not be waited on (it survived SIGKILL); the
            // status was set when termination was attempted.
            None => status.unwrap_or(ExecutionResult::Terminated),
        };

        Ok(InternalExecuteStatus {
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
            result,
            stopwatch_end: stopwatch.snapshot(),
            is_slow,
            delay_before_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_iter_fixed() {
        let policy = RetryPolicy::Fixed {
            count: 3,
            delay: Duration::from_secs(1),
            jitter: false,
        };
        let delays: Vec<_> = BackoffIter::new(policy).collect();
        assert_eq!(delays, vec![Duration::from_secs(1); 3]);
    }

    #[test]
    fn backoff_iter_exponential_with_max_delay() {
        let policy = RetryPolicy::Exponential {
            count: 5,
            delay: Duration::from_secs(1),
            jitter: false,
            max_delay: Some(Duration::from_secs(4)),
        };
        let delays: Vec<_> = BackoffIter::new(policy).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn backoff_iter_yields_count_delays() {
        let policy = RetryPolicy::new_without_delay(4);
        assert_eq!(BackoffIter::new(policy).count(), 4);
    }

    #[test]
    fn backoff_jitter_stays_in_range() {
        let duration = Duration::from_secs(10);
        for _ in 0..64 {
            let jittered = BackoffIter::apply_jitter(duration);
            assert!(jittered > duration.mul_f64(0.5));
            assert!(jittered <= duration);
        }
    }
}
