// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! Waiting on the delegate process while the mirror serves requests
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./monitor_test.rs"]
mod monitor_test;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Terminal state of the delegate process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateStatus {
    /// The delegate exited on its own with the given code
    Exited(i32),
    /// The delegate was terminated by the given signal
    Signaled(Signal),
}

impl DelegateStatus {
    /// The exit code this status maps to for the calling process.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            // the shell convention for signal deaths
            Self::Signaled(sig) => 128 + *sig as i32,
        }
    }
}

/// Poll the delegate until it exits or is terminated by a signal.
///
/// The wait never blocks, so the filesystem-serving threads are free
/// to answer requests made by the delegate for as long as it runs.
/// Stop events are observed and ignored. `ECHILD` means the delegate
/// was reaped elsewhere and ends the loop rather than spinning forever.
pub fn wait_for_delegate(pid: Pid) -> Result<DelegateStatus> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(POLL_INTERVAL),
            Ok(WaitStatus::Exited(_, code)) => {
                tracing::debug!(code, "delegate exited");
                return Ok(DelegateStatus::Exited(code));
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                tracing::debug!(?sig, "delegate terminated by signal");
                return Ok(DelegateStatus::Signaled(sig));
            }
            // the delegate was stopped or continued, not terminated
            Ok(_) => std::thread::sleep(POLL_INTERVAL),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                return Err(Error::new_errno(
                    libc::ECHILD,
                    format!("Lost track of delegate process {pid}"),
                ));
            }
            Err(err) => return Err(Error::wrap_nix(err, "Failed to wait on delegate")),
        }
    }
}
