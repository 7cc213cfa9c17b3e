// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! The delegate side of the fork: wait for the mount, then exec
use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::mirrored_path;
use crate::{Error, Result};

/// Signal used by the parent to release the delegate once the mirror
/// is serving requests.
pub const WAKE_SIGNAL: Signal = Signal::SIGUSR2;

extern "C" fn on_wake(_: libc::c_int) {}

/// Run the delegate command inside the mirror.
///
/// Blocks until the parent delivers [`WAKE_SIGNAL`], which it sends
/// from the mount's init hook. This ordering matters: until the mount
/// is live the mirrored copy of the working directory does not exist
/// and the delegate would start building inside a missing tree. Once
/// woken, the process changes into the mirrored working directory and
/// replaces itself with the delegate command.
///
/// Only returns on error.
pub fn run_delegate(mountpoint: &Path, command: &OsStr, args: &[OsString]) -> Result<Infallible> {
    let action = SigAction::new(SigHandler::Handler(on_wake), SaFlags::empty(), SigSet::empty());
    // Safety: the handler is a no-op and touches no process state
    unsafe { signal::sigaction(WAKE_SIGNAL, &action) }
        .map_err(|err| Error::wrap_nix(err, "Failed to install wake-up handler"))?;

    nix::unistd::pause();

    let cwd =
        nix::unistd::getcwd().map_err(|err| Error::wrap_nix(err, "Failed to read working dir"))?;
    let mirrored = mirrored_path(mountpoint, &cwd);
    tracing::debug!(?mirrored, "entering the mirror");
    nix::unistd::chdir(&mirrored)
        .map_err(|err| Error::wrap_nix(err, format!("Failed to enter mirror {mirrored:?}")))?;

    let exe = CString::new(command.as_bytes())
        .map_err(|_| Error::new("Delegate command contains an interior nul byte"))?;
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(exe.clone());
    for arg in args {
        argv.push(
            CString::new(arg.as_bytes())
                .map_err(|_| Error::new("Delegate argument contains an interior nul byte"))?,
        );
    }

    nix::unistd::execvp(&exe, &argv)
        .map_err(|err| Error::wrap_nix(err, format!("Failed to exec delegate {command:?}")))
}
