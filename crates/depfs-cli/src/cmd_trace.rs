// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use depfs::trace::TraceState;
use depfs_vfs as vfs;
use fuser::MountOption;
use nix::unistd::{ForkResult, Pid};
use tokio::signal::unix::{signal, SignalKind};

mod args;

#[cfg(test)]
#[path = "./cmd_trace_test.rs"]
mod cmd_trace_test;

fn main() {
    // because this function exits right away it does not
    // properly handle destruction of data, so we put the actual
    // logic into a separate function/scope
    std::process::exit(main2())
}
fn main2() -> i32 {
    let opt = CmdTrace::parse();
    args::configure_logging(opt.verbose);

    let config = match depfs::get_config() {
        Err(err) => {
            tracing::error!(err = ?err, "failed to load config");
            return 1;
        }
        Ok(config) => config,
    };

    match opt.run(&config) {
        Err(err) => {
            tracing::error!("{err:?}");
            1
        }
        Ok(code) => code,
    }
}

/// Run a command under a mirror of the host filesystem, recording
/// every file it and its descendants read and write
#[derive(Debug, Parser)]
#[clap(name = "depfs", version)]
pub struct CmdTrace {
    /// Log verbosity, may be specified multiple times
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Override the directory where the mirror is mounted
    #[clap(long)]
    mountpoint: Option<PathBuf>,

    /// Override the destination of the trace log
    #[clap(long)]
    logfile: Option<PathBuf>,

    /// The command to run and trace, typically a build driver
    #[clap(name = "CMD")]
    command: OsString,

    /// Arguments to the traced command
    #[clap(name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    command_args: Vec<OsString>,
}

impl CmdTrace {
    fn run(&self, config: &depfs::Config) -> Result<i32> {
        let mountpoint = self
            .mountpoint
            .clone()
            .unwrap_or_else(|| config.filesystem.mountpoint.clone());
        let logfile = self
            .logfile
            .clone()
            .unwrap_or_else(|| config.filesystem.logfile.clone());

        // modes passed through the mirror are applied exactly as the
        // delegate requested them
        nix::sys::stat::umask(nix::sys::stat::Mode::empty());

        depfs::env::ensure_mount_point(&mountpoint)
            .with_context(|| format!("Failed to create mount point {mountpoint:?}"))?;

        // the fork must happen while this process is still single
        // threaded; the async runtime and the filesystem threads only
        // come up on the parent side
        match unsafe { nix::unistd::fork() }.context("Failed to fork delegate process")? {
            ForkResult::Child => {
                let err = depfs::run_delegate(&mountpoint, &self.command, &self.command_args)
                    .unwrap_err();
                // fatal in the child only; the parent observes the
                // failure through its wait loop
                tracing::error!("{err}");
                std::process::exit(1);
            }
            ForkResult::Parent { child } => self.run_parent(child, mountpoint, logfile),
        }
    }

    fn run_parent(&self, child: Pid, mountpoint: PathBuf, logfile: PathBuf) -> Result<i32> {
        // opening the log eagerly surfaces filesystem errors before
        // the mount goes live and the delegate is woken
        let trace = Arc::new(
            TraceState::new(child, mountpoint.clone(), &logfile)
                .context("Failed to open trace log")?,
        );

        let opts = vfs::Config {
            mount_options: [MountOption::FSName("depfs".into()), MountOption::NoSuid]
                .into_iter()
                .collect(),
            ..Default::default()
        };

        tracing::debug!("establishing mirror session...");
        let mount_opts = opts.mount_options.iter().cloned().collect::<Vec<_>>();
        let session = fuser::Session::new(
            vfs::Session::new(Arc::clone(&trace), &opts),
            &mountpoint,
            &mount_opts,
        )
        .context("Failed to create the mirror session")?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to establish runtime")?;

        let status = rt.block_on(async move {
            let mut interrupt =
                signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut terminate =
                signal(SignalKind::terminate()).context("terminate signal handler")?;

            tracing::info!("starting mirror filesystem");
            // the filesystem loop blocks until unmounted, so it runs on
            // a blocking thread while this task watches the delegate.
            // Serving the first request wakes the paused delegate from
            // the init hook.
            let fs_loop = tokio::task::spawn_blocking(move || {
                let mut session = session;
                session.run()
            });
            let delegate = tokio::task::spawn_blocking(move || depfs::wait_for_delegate(child));

            let status = tokio::select! {
                res = delegate => Some(res.context("delegate wait task failed")??),
                _ = interrupt.recv() => None,
                _ = terminate.recv() => None,
            };
            if status.is_none() {
                tracing::warn!("interrupted, tearing down the mirror");
            }

            // lazy unmount: descendants of the delegate may still hold
            // descriptors through the mirror and stay functional until
            // the last one closes
            if let Err(err) = depfs::env::lazy_unmount(&mountpoint) {
                tracing::error!("{err}");
            }

            // wait for the filesystem loop so the trace has been
            // written before this process exits
            match fs_loop.await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => tracing::error!(?err, "mirror session failed"),
                Err(err) => tracing::error!(?err, "mirror task panicked"),
            }

            Ok::<_, anyhow::Error>(status)
        });

        // nothing else should be executing at this point, but don't
        // block forever on stray tasks when the runtime is dropped
        rt.shutdown_timeout(std::time::Duration::from_millis(250));

        match status? {
            Some(status) => {
                tracing::debug!(?status, "delegate finished");
                Ok(status.exit_code())
            }
            None => Ok(1),
        }
    }
}
