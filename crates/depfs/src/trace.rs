// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! In-memory aggregation and serialization of observed file accesses
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashSet;
use nix::unistd::Pid;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./trace_test.rs"]
mod trace_test;

/// Record of every classified access served by a single mount.
///
/// One instance exists per invocation. The log sink is opened eagerly at
/// construction so that a filesystem error surfaces before the mount goes
/// live; the observed path sets are drained into it exactly once when the
/// mount is torn down.
///
/// The three sets are concurrently insertable and idempotent, and the
/// note operations never fail, so a tracing problem can never perturb
/// the outcome of the filesystem operation that was being observed.
#[derive(Debug)]
pub struct TraceState {
    delegate_pid: Pid,
    mount_point: PathBuf,
    sink: Mutex<Option<BufWriter<File>>>,
    reads: DashSet<PathBuf>,
    writes: DashSet<PathBuf>,
    symlinks: DashSet<PathBuf>,
}

impl TraceState {
    pub fn new<P, L>(delegate_pid: Pid, mount_point: P, logfile: L) -> Result<Self>
    where
        P: Into<PathBuf>,
        L: AsRef<Path>,
    {
        let logfile = logfile.as_ref();
        let file = File::create(logfile)
            .map_err(|err| Error::wrap_io(err, format!("Cannot open log file {logfile:?}")))?;
        Ok(Self {
            delegate_pid,
            mount_point: mount_point.into(),
            sink: Mutex::new(Some(BufWriter::new(file))),
            reads: DashSet::new(),
            writes: DashSet::new(),
            symlinks: DashSet::new(),
        })
    }

    /// The process that was forked to run the traced command.
    pub fn delegate_pid(&self) -> Pid {
        self.delegate_pid
    }

    /// The directory under which the mirror is exposed.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Note a path that was opened for reading.
    pub fn note_read<P: Into<PathBuf>>(&self, path: P) {
        self.reads.insert(path.into());
    }

    /// Note a path that was opened for writing or created.
    pub fn note_write<P: Into<PathBuf>>(&self, path: P) {
        self.writes.insert(path.into());
    }

    /// Note a symbolic link that was traversed.
    pub fn note_symlink<P: Into<PathBuf>>(&self, path: P) {
        self.symlinks.insert(path.into());
    }

    /// Take ownership of everything observed so far.
    ///
    /// Returns the symlink, read and write sets in that order. Further
    /// calls yield empty sets.
    pub fn drain(&self) -> (Vec<PathBuf>, Vec<PathBuf>, Vec<PathBuf>) {
        fn take(set: &DashSet<PathBuf>) -> Vec<PathBuf> {
            let paths = set.iter().map(|p| p.key().clone()).collect();
            set.clear();
            paths
        }
        (take(&self.symlinks), take(&self.reads), take(&self.writes))
    }

    /// Drain all observations into the log sink and flush it.
    ///
    /// Called once as the mount is destroyed; a second call is a no-op.
    pub fn finalize(&self) -> Result<()> {
        let mut lock = self
            .sink
            .lock()
            .map_err(|err| Error::String(format!("Trace sink lock has been poisoned: {err:?}")))?;
        let Some(mut sink) = lock.take() else {
            return Ok(());
        };
        let (symlinks, reads, writes) = self.drain();
        write_trace(&mut sink, &symlinks, &reads, &writes)?;
        sink.flush()?;
        Ok(())
    }
}

/// Serialize observed accesses as one record per line.
///
/// Symlink traversals are written first as `L\t<path>`, then reads as
/// `R\t<path>`, then writes as `W\t<path>`. Paths are written as raw
/// bytes with no escaping.
pub fn write_trace<W: Write>(
    out: &mut W,
    symlinks: &[PathBuf],
    reads: &[PathBuf],
    writes: &[PathBuf],
) -> std::io::Result<()> {
    for (tag, paths) in [(b"L", symlinks), (b"R", reads), (b"W", writes)] {
        for path in paths {
            out.write_all(tag)?;
            out.write_all(b"\t")?;
            out.write_all(path.as_os_str().as_bytes())?;
            out.write_all(b"\n")?;
        }
    }
    Ok(())
}
