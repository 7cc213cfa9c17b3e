// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult};
use rstest::rstest;

use super::{wait_for_delegate, DelegateStatus};

#[rstest]
fn test_wait_observes_exit() {
    match unsafe { fork() }.expect("failed to fork test child") {
        ForkResult::Child => std::process::exit(7),
        ForkResult::Parent { child } => {
            let status = wait_for_delegate(child).expect("wait should observe the exit");
            assert_eq!(status, DelegateStatus::Exited(7));
            assert_eq!(status.exit_code(), 7);
        }
    }
}

#[rstest]
fn test_wait_observes_signal() {
    match unsafe { fork() }.expect("failed to fork test child") {
        ForkResult::Child => loop {
            std::thread::sleep(std::time::Duration::from_secs(1));
        },
        ForkResult::Parent { child } => {
            kill(child, Signal::SIGKILL).expect("failed to signal test child");
            let status = wait_for_delegate(child).expect("wait should observe the signal");
            assert_eq!(status, DelegateStatus::Signaled(Signal::SIGKILL));
            assert_eq!(status.exit_code(), 137);
        }
    }
}
