// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! Mount point setup and teardown for the mirror filesystem
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./env_test.rs"]
mod env_test;

/// Ensure the mirror's mount point directory exists.
///
/// Missing components are created world-accessible so the delegate can
/// traverse into the mirror no matter which user the build runs as;
/// components that already exist are left untouched.
pub fn ensure_mount_point<P: AsRef<Path>>(mountpoint: P) -> Result<()> {
    let mountpoint = mountpoint.as_ref();
    let perms = std::fs::Permissions::from_mode(0o777);

    // collect the missing tail of the path, then create it parent-first
    let mut missing = Vec::new();
    let mut cursor = Some(mountpoint);
    while let Some(dir) = cursor {
        // an empty component means a relative path ran out of parents
        if dir.as_os_str().is_empty() || dir.symlink_metadata().is_ok() {
            break;
        }
        missing.push(dir);
        cursor = dir.parent();
    }

    for dir in missing.into_iter().rev() {
        match std::fs::create_dir(dir) {
            Ok(()) => (),
            // racing another process into existence is tolerated
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(Error::wrap_io(err, format!("Invalid mount point {dir:?}"))),
        }
        // mkdir is subject to the caller's umask, the mirror is not
        std::fs::set_permissions(dir, perms.clone())
            .map_err(|err| Error::wrap_io(err, format!("Failed to set permissions on {dir:?}")))?;
    }
    Ok(())
}

/// Lazily unmount the mirror.
///
/// The mount disappears from the namespace immediately while handles
/// still held by the delegate's descendants stay valid until closed.
pub fn lazy_unmount<P: AsRef<Path>>(mountpoint: P) -> Result<()> {
    let mountpoint = mountpoint.as_ref();
    tracing::debug!(?mountpoint, "unmounting mirror...");
    let mut cmd = std::process::Command::new("fusermount");
    cmd.arg("-uz");
    cmd.arg(mountpoint);
    match cmd.status() {
        Err(err) => Err(Error::ProcessSpawn("fusermount".to_owned(), err)),
        Ok(status) => match status.code() {
            Some(0) => Ok(()),
            _ => Err(format!("fusermount failed to unmount {mountpoint:?}").into()),
        },
    }
}
