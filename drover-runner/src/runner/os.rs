// Copyright (c) The drover Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Platform-specific child process handling.

use crate::runner::ShutdownForwardEvent;
use std::time::Duration;
use tokio::process::Child;

/// The reason a child process is being terminated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum TerminateMode {
    /// The child exceeded its slow-timeout escalation budget.
    Timeout,

    /// A shutdown signal is being forwarded to the child.
    Signal(ShutdownForwardEvent),
}

/// The result of terminating a child process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub(super) enum TerminateChildResult {
    /// The child process exited without being forcibly killed.
    Exited,

    /// The child process was forcibly killed.
    Killed,

    /// The child process survived a forceful kill: the runner has lost
    /// control of it.
    Wedged,
}

/// How long to wait for a killed process to be reaped before declaring that
/// the runner has lost control of it.
const KILL_WAIT: Duration = Duration::from_secs(10);

#[cfg(unix)]
pub(super) use unix_impl::*;

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use crate::signal::ShutdownEvent;
    use libc::{SIGHUP, SIGINT, SIGKILL, SIGTERM};

    /// Pre-execution configuration on Unix.
    ///
    /// This sets up just the process group ID, so that signals are delivered
    /// to the whole tree spawned by a test.
    pub(in crate::runner) fn set_process_group(cmd: &mut std::process::Command) {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    /// Terminates the child, escalating to SIGKILL after `grace_period`.
    ///
    /// Signals are sent to the child's process group.
    pub(in crate::runner) async fn terminate_child(
        child: &mut Child,
        mode: TerminateMode,
        grace_period: Duration,
    ) -> TerminateChildResult {
        let Some(pid) = child.id() else {
            return TerminateChildResult::Exited;
        };
        // The child was spawned as its own process group leader: negating the
        // pid addresses the whole group.
        let group_pid = -(pid as i32);

        let term_signal = match mode {
            TerminateMode::Timeout => SIGTERM,
            TerminateMode::Signal(ShutdownForwardEvent::Once(ShutdownEvent::Hangup)) => SIGHUP,
            TerminateMode::Signal(ShutdownForwardEvent::Once(ShutdownEvent::Term)) => SIGTERM,
            TerminateMode::Signal(ShutdownForwardEvent::Once(ShutdownEvent::Interrupt)) => SIGINT,
            TerminateMode::Signal(ShutdownForwardEvent::Twice) => SIGKILL,
        };

        // There is a race between a process exiting and a signal being
        // delivered, so errors are ignored.
        unsafe {
            libc::kill(group_pid, term_signal);
        }

        if term_signal != SIGKILL && !grace_period.is_zero() {
            let mut sleep = std::pin::pin!(tokio::time::sleep(grace_period));
            tokio::select! {
                _ = child.wait() => {
                    return TerminateChildResult::Exited;
                }
                _ = &mut sleep => {
                    // The process didn't exit within the grace period -- do a
                    // hard shutdown.
                }
            }
        }

        unsafe {
            libc::kill(group_pid, SIGKILL);
        }

        let mut sleep = std::pin::pin!(tokio::time::sleep(KILL_WAIT));
        tokio::select! {
            _ = child.wait() => TerminateChildResult::Killed,
            _ = &mut sleep => TerminateChildResult::Wedged,
        }
    }
}

#[cfg(not(unix))]
pub(super) use windows_impl::*;

#[cfg(not(unix))]
mod windows_impl {
    use super::*;

    pub(in crate::runner) fn set_process_group(_cmd: &mut std::process::Command) {
        // Process groups are not used on Windows.
    }

    /// Terminates the child. Windows has no graceful termination signal, so
    /// this kills the process directly.
    pub(in crate::runner) async fn terminate_child(
        child: &mut Child,
        _mode: TerminateMode,
        _grace_period: Duration,
    ) -> TerminateChildResult {
        if child.id().is_none() {
            return TerminateChildResult::Exited;
        }
        // Ignore the error -- it's likely due to the process exiting.
        let _ = child.start_kill();

        let mut sleep = std::pin::pin!(tokio::time::sleep(KILL_WAIT));
        tokio::select! {
            _ = child.wait() => TerminateChildResult::Killed,
            _ = &mut sleep => TerminateChildResult::Wedged,
        }
    }
}
