// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirEntryExt, FileExt, FileTypeExt, MetadataExt};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use depfs::trace::TraceState;
use fuser::{
    FileAttr,
    FileType,
    KernelConfig,
    MountOption,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyLock,
    ReplyOpen,
    ReplyStatfs,
    ReplyWrite,
    ReplyXattr,
    Request,
    TimeOrNow,
};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{FchmodatFlags, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{AccessFlags, FchownatFlags, Gid, LinkatFlags, Uid, UnlinkatFlags};

use crate::inode::InodeTable;

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

/// Options to configure the mirror filesystem and
/// its behavior at runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// How long the kernel may cache entry and attribute replies
    pub attr_ttl: Duration,
    /// Mount options to be used when setting up
    pub mount_options: HashSet<MountOption>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // the framework default the original passthrough ran with
            attr_ttl: Duration::from_secs(1),
            mount_options: HashSet::new(),
        }
    }
}

type OpResult<T> = std::result::Result<T, Errno>;

/// Serves every request by forwarding it to the host filesystem,
/// noting classified accesses in the shared trace state.
struct Mirror {
    trace: Arc<TraceState>,
    ttl: Duration,
    next_handle: AtomicU64,
    inodes: InodeTable,
    handles: DashMap<u64, Handle>,
}

impl Mirror {
    fn new(trace: Arc<TraceState>, opts: &Config) -> Self {
        Self {
            trace,
            ttl: opts.attr_ttl,
            // we do not allocate handle 0, so skip it for now
            next_handle: AtomicU64::new(1),
            inodes: InodeTable::new(),
            handles: DashMap::new(),
        }
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // the zero handle value is never allocated so that the
                // explicit lack of a handle remains detectable
                continue;
            }
            match self.handles.entry(id) {
                // continue until we find a vacant entry for this handle
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(data);
                    break id;
                }
            }
        }
    }

    fn path_of(&self, ino: u64) -> OpResult<PathBuf> {
        self.inodes.host_path(ino).ok_or(Errno::ENOENT)
    }

    fn entry_path(&self, parent: u64, name: &OsStr) -> OpResult<PathBuf> {
        self.inodes.entry_path(parent, name).ok_or(Errno::ENOENT)
    }

    fn attr_at(&self, path: &Path, ino: u64) -> OpResult<FileAttr> {
        let meta = std::fs::symlink_metadata(path).map_err(errno_of)?;
        Ok(attr_of(&meta, ino))
    }
}

/// Extract the ok value from a result, or reply with an error
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let errno: Errno = $err;
        tracing::trace!(?errno, "host operation failed");
        $reply.error(errno as i32);
        return;
    }};
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl Mirror {
    fn lookup(&self, parent: u64, name: &OsStr) -> OpResult<FileAttr> {
        let path = self.entry_path(parent, name)?;
        let meta = std::fs::symlink_metadata(&path).map_err(errno_of)?;
        let ino = self.inodes.get_or_insert(parent, name);
        Ok(attr_of(&meta, ino))
    }

    fn getattr(&self, ino: u64) -> OpResult<FileAttr> {
        let path = self.path_of(ino)?;
        self.attr_at(&path, ino)
    }

    fn setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> OpResult<FileAttr> {
        let path = self.path_of(ino)?;
        if let Some(mode) = mode {
            nix::sys::stat::fchmodat(
                None,
                &path,
                Mode::from_bits_truncate(mode),
                FchmodatFlags::FollowSymlink,
            )?;
        }
        if uid.is_some() || gid.is_some() {
            nix::unistd::fchownat(
                None,
                &path,
                uid.map(Uid::from_raw),
                gid.map(Gid::from_raw),
                FchownatFlags::NoFollowSymlink,
            )?;
        }
        if let Some(size) = size {
            // prefer the open descriptor when the kernel provided one
            match fh.and_then(|fh| self.handles.get(&fh)) {
                Some(handle) => match handle.value() {
                    Handle::File(file) => file.set_len(size).map_err(errno_of)?,
                    Handle::Dir(_) => return Err(Errno::EISDIR),
                },
                None => nix::unistd::truncate(&path, size as libc::off_t)?,
            }
        }
        if atime.is_some() || mtime.is_some() {
            nix::sys::stat::utimensat(
                None,
                &path,
                &timespec_of(atime),
                &timespec_of(mtime),
                UtimensatFlags::FollowSymlink,
            )?;
        }
        self.attr_at(&path, ino)
    }

    fn readlink(&self, ino: u64) -> OpResult<PathBuf> {
        let path = self.path_of(ino)?;
        // the traversal is recorded even when the host call or the
        // redirection below fails
        self.trace.note_symlink(path.clone());
        let target = nix::fcntl::readlink(&path)?;
        redirect_link_target(self.trace.mount_point(), &path, &target)
    }

    fn mknod(&self, parent: u64, name: &OsStr, mode: u32, umask: u32, rdev: u32) -> OpResult<FileAttr> {
        let path = self.entry_path(parent, name)?;
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & !umask);
        if kind == SFlag::S_IFIFO {
            nix::unistd::mkfifo(&path, perm)?;
        } else {
            nix::sys::stat::mknod(&path, kind, perm, rdev as libc::dev_t)?;
        }
        let ino = self.inodes.get_or_insert(parent, name);
        self.attr_at(&path, ino)
    }

    fn mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> OpResult<FileAttr> {
        let path = self.entry_path(parent, name)?;
        nix::unistd::mkdir(&path, Mode::from_bits_truncate(mode & !umask))?;
        let ino = self.inodes.get_or_insert(parent, name);
        self.attr_at(&path, ino)
    }

    fn unlink(&self, parent: u64, name: &OsStr) -> OpResult<()> {
        let path = self.entry_path(parent, name)?;
        nix::unistd::unlink(&path)?;
        self.inodes.remove_child(parent, name);
        Ok(())
    }

    fn rmdir(&self, parent: u64, name: &OsStr) -> OpResult<()> {
        let path = self.entry_path(parent, name)?;
        nix::unistd::unlinkat(None, &path, UnlinkatFlags::RemoveDir)?;
        self.inodes.remove_child(parent, name);
        Ok(())
    }

    fn symlink(&self, parent: u64, name: &OsStr, target: &Path) -> OpResult<FileAttr> {
        let path = self.entry_path(parent, name)?;
        nix::unistd::symlinkat(target, None, &path)?;
        let ino = self.inodes.get_or_insert(parent, name);
        self.attr_at(&path, ino)
    }

    fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> OpResult<()> {
        if flags != 0 {
            // exchange/noreplace modes are not part of this surface
            return Err(Errno::EINVAL);
        }
        let from = self.entry_path(parent, name)?;
        let to = self.entry_path(newparent, newname)?;
        nix::fcntl::renameat(None, &from, None, &to)?;
        self.inodes.rename(parent, name, newparent, newname);
        Ok(())
    }

    fn link(&self, ino: u64, newparent: u64, newname: &OsStr) -> OpResult<FileAttr> {
        let from = self.path_of(ino)?;
        let to = self.entry_path(newparent, newname)?;
        nix::unistd::linkat(None, &from, None, &to, LinkatFlags::NoSymlinkFollow)?;
        // the new name gets its own entry in the shadow tree
        let new_ino = self.inodes.get_or_insert(newparent, newname);
        self.attr_at(&to, new_ino)
    }

    fn open(&self, ino: u64, flags: i32) -> OpResult<u64> {
        let path = self.path_of(ino)?;
        let fd = nix::fcntl::open(&path, OFlag::from_bits_truncate(flags), Mode::empty())?;
        // Safety: the descriptor was just returned by open and is owned here
        let file = unsafe { File::from_raw_fd(fd) };
        if flags_classify_write(flags) {
            self.trace.note_write(path);
        } else {
            self.trace.note_read(path);
        }
        Ok(self.allocate_handle(Handle::File(file)))
    }

    fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> OpResult<(FileAttr, u64)> {
        let path = self.entry_path(parent, name)?;
        let fd = nix::fcntl::open(
            &path,
            OFlag::from_bits_truncate(flags) | OFlag::O_CREAT,
            Mode::from_bits_truncate(mode & !umask),
        )?;
        // Safety: the descriptor was just returned by open and is owned here
        let file = unsafe { File::from_raw_fd(fd) };
        self.trace.note_write(path);
        let ino = self.inodes.get_or_insert(parent, name);
        let meta = file.metadata().map_err(errno_of)?;
        let attr = attr_of(&meta, ino);
        Ok((attr, self.allocate_handle(Handle::File(file))))
    }

    fn read(&self, fh: u64, offset: i64, size: u32) -> OpResult<Vec<u8>> {
        let handle = self.handles.get(&fh).ok_or(Errno::EBADF)?;
        let Handle::File(file) = handle.value() else {
            return Err(Errno::EISDIR);
        };
        let mut buf = vec![0; size as usize];
        let mut consumed = 0;
        while consumed < size as usize {
            let count = file
                .read_at(&mut buf[consumed..], offset as u64 + consumed as u64)
                .map_err(errno_of)?;
            if count == 0 {
                // the end of the file has been reached
                break;
            }
            consumed += count;
        }
        buf.truncate(consumed);
        Ok(buf)
    }

    fn write(&self, fh: u64, offset: i64, data: &[u8]) -> OpResult<u32> {
        let handle = self.handles.get(&fh).ok_or(Errno::EBADF)?;
        let Handle::File(file) = handle.value() else {
            return Err(Errno::EISDIR);
        };
        let mut written = 0;
        while written < data.len() {
            let count = file
                .write_at(&data[written..], offset as u64 + written as u64)
                .map_err(errno_of)?;
            if count == 0 {
                return Err(Errno::EIO);
            }
            written += count;
        }
        Ok(written as u32)
    }

    fn flush(&self, fh: u64) -> OpResult<()> {
        let handle = self.handles.get(&fh).ok_or(Errno::EBADF)?;
        let Handle::File(file) = handle.value() else {
            return Err(Errno::EBADF);
        };
        // called for every close of the open file, so flush per-close
        // state by closing a fresh duplicate; the real descriptor
        // stays open until release. This matters on network
        // filesystems that flush data and metadata on close.
        let dup = nix::unistd::dup(file.as_raw_fd())?;
        nix::unistd::close(dup)?;
        Ok(())
    }

    fn release(&self, fh: u64) -> OpResult<()> {
        // dropping the handle closes the underlying host resource
        self.handles.remove(&fh).map(|_| ()).ok_or(Errno::EBADF)
    }

    fn fsync(&self, fh: u64, datasync: bool) -> OpResult<()> {
        let handle = self.handles.get(&fh).ok_or(Errno::EBADF)?;
        let Handle::File(file) = handle.value() else {
            return Err(Errno::EBADF);
        };
        if datasync {
            nix::unistd::fdatasync(file.as_raw_fd())?;
        } else {
            nix::unistd::fsync(file.as_raw_fd())?;
        }
        Ok(())
    }

    fn opendir(&self, ino: u64) -> OpResult<u64> {
        let path = self.path_of(ino)?;
        let meta = std::fs::symlink_metadata(&path).map_err(errno_of)?;
        // snapshot the host listing once; readdir serves kernel
        // offsets out of this snapshot
        let mut entries = vec![
            DirEntry {
                ino: meta.ino(),
                kind: FileType::Directory,
                name: OsString::from("."),
            },
            DirEntry {
                ino: meta.ino(),
                kind: FileType::Directory,
                name: OsString::from(".."),
            },
        ];
        for entry in std::fs::read_dir(&path).map_err(errno_of)? {
            let entry = entry.map_err(errno_of)?;
            let kind = entry
                .file_type()
                .map(file_type_of)
                .unwrap_or(FileType::RegularFile);
            entries.push(DirEntry {
                ino: entry.ino(),
                kind,
                name: entry.file_name(),
            });
        }
        Ok(self.allocate_handle(Handle::Dir(entries)))
    }

    fn releasedir(&self, fh: u64) -> OpResult<()> {
        self.handles.remove(&fh).map(|_| ()).ok_or(Errno::EBADF)
    }

    fn statfs(&self, ino: u64) -> OpResult<nix::sys::statvfs::Statvfs> {
        let path = self.path_of(ino)?;
        Ok(nix::sys::statvfs::statvfs(&path)?)
    }

    fn access(&self, ino: u64, mask: i32) -> OpResult<()> {
        let path = self.path_of(ino)?;
        nix::unistd::access(&path, AccessFlags::from_bits_truncate(mask))?;
        Ok(())
    }

    fn setxattr(&self, ino: u64, name: &OsStr, value: &[u8], flags: i32) -> OpResult<()> {
        let path = cstring_of(&self.path_of(ino)?)?;
        let name = cstring_of_os(name)?;
        // Safety: both strings are nul-terminated and the value buffer is live
        let res = unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        if res == -1 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn getxattr(&self, ino: u64, name: &OsStr, size: u32) -> OpResult<XattrReply> {
        let path = cstring_of(&self.path_of(ino)?)?;
        let name = cstring_of_os(name)?;
        if size == 0 {
            // Safety: a null buffer of length zero queries the value size
            let len = unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
            if len == -1 {
                return Err(Errno::last());
            }
            Ok(XattrReply::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            // Safety: the buffer is live and its length is passed alongside
            let len = unsafe {
                libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
            };
            if len == -1 {
                return Err(Errno::last());
            }
            buf.truncate(len as usize);
            Ok(XattrReply::Data(buf))
        }
    }

    fn listxattr(&self, ino: u64, size: u32) -> OpResult<XattrReply> {
        let path = cstring_of(&self.path_of(ino)?)?;
        if size == 0 {
            // Safety: a null buffer of length zero queries the list size
            let len = unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
            if len == -1 {
                return Err(Errno::last());
            }
            Ok(XattrReply::Size(len as u32))
        } else {
            let mut buf = vec![0u8; size as usize];
            // Safety: the buffer is live and its length is passed alongside
            let len = unsafe { libc::llistxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
            if len == -1 {
                return Err(Errno::last());
            }
            buf.truncate(len as usize);
            Ok(XattrReply::Data(buf))
        }
    }

    fn removexattr(&self, ino: u64, name: &OsStr) -> OpResult<()> {
        let path = cstring_of(&self.path_of(ino)?)?;
        let name = cstring_of_os(name)?;
        // Safety: both strings are nul-terminated
        let res = unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) };
        if res == -1 {
            return Err(Errno::last());
        }
        Ok(())
    }

    fn getlk(
        &self,
        fh: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
    ) -> OpResult<(u64, u64, i32, u32)> {
        let handle = self.handles.get(&fh).ok_or(Errno::EBADF)?;
        let Handle::File(file) = handle.value() else {
            return Err(Errno::EBADF);
        };
        let mut lk = flock_of(start, end, typ, pid);
        nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_GETLK(&mut lk))?;
        if i32::from(lk.l_type) == libc::F_UNLCK {
            return Ok((0, 0, libc::F_UNLCK, 0));
        }
        let (start, end) = byte_range_of(&lk);
        Ok((start, end, i32::from(lk.l_type), lk.l_pid as u32))
    }

    fn setlk(&self, fh: u64, start: u64, end: u64, typ: i32, pid: u32, sleep: bool) -> OpResult<()> {
        let handle = self.handles.get(&fh).ok_or(Errno::EBADF)?;
        let Handle::File(file) = handle.value() else {
            return Err(Errno::EBADF);
        };
        let lk = flock_of(start, end, typ, pid);
        let arg = if sleep {
            nix::fcntl::FcntlArg::F_SETLKW(&lk)
        } else {
            nix::fcntl::FcntlArg::F_SETLK(&lk)
        };
        nix::fcntl::fcntl(file.as_raw_fd(), arg)?;
        Ok(())
    }
}

/// A mountable mirror session.
///
/// Implements [`fuser::Filesystem`], forwarding every request to the
/// host filesystem and recording classified accesses into the shared
/// trace state. The state is handed in at construction and flows
/// through every callback; there is no process-wide singleton.
pub struct Session {
    fs: Mirror,
}

impl Session {
    /// Create a session that records into the given trace state.
    pub fn new(trace: Arc<TraceState>, opts: &Config) -> Self {
        Self {
            fs: Mirror::new(trace, opts),
        }
    }
}

impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        // the mount is serviceable once this hook runs, so the paused
        // delegate can now be released into the mirror
        let pid = self.fs.trace.delegate_pid();
        tracing::info!(%pid, "mirror initialized, waking delegate");
        if let Err(err) = nix::sys::signal::kill(pid, depfs::WAKE_SIGNAL) {
            // nothing to wake; the parent's wait loop will report it
            tracing::warn!(?err, "failed to deliver wake-up signal");
        }
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("mirror shutting down, writing trace");
        if let Err(err) = self.fs.trace.finalize() {
            // teardown must not abort; an unwritable sink only loses the trace
            tracing::error!(?err, "failed to write trace log");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let attr = unwrap!(reply, self.fs.lookup(parent, name));
        reply.entry(&self.fs.ttl, &attr, 0);
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {
        // nothing to do, the shadow tree is kept for the lifetime of
        // the mount
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let attr = unwrap!(reply, self.fs.getattr(ino));
        reply.attr(&self.fs.ttl, &attr);
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = unwrap!(
            reply,
            self.fs.setattr(ino, mode, uid, gid, size, atime, mtime, fh)
        );
        reply.attr(&self.fs.ttl, &attr);
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let target = unwrap!(reply, self.fs.readlink(ino));
        reply.data(target.as_os_str().as_bytes());
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let attr = unwrap!(reply, self.fs.mknod(parent, name, mode, umask, rdev));
        reply.entry(&self.fs.ttl, &attr, 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let attr = unwrap!(reply, self.fs.mkdir(parent, name, mode, umask));
        reply.entry(&self.fs.ttl, &attr, 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        unwrap!(reply, self.fs.unlink(parent, name));
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        unwrap!(reply, self.fs.rmdir(parent, name));
        reply.ok();
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let attr = unwrap!(reply, self.fs.symlink(parent, name, link));
        reply.entry(&self.fs.ttl, &attr, 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        unwrap!(reply, self.fs.rename(parent, name, newparent, newname, flags));
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let attr = unwrap!(reply, self.fs.link(ino, newparent, newname));
        reply.entry(&self.fs.ttl, &attr, 0);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fh = unwrap!(reply, self.fs.open(ino, flags));
        tracing::trace!("open {ino} = {fh}");
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let buf = unwrap!(reply, self.fs.read(fh, offset, size));
        reply.data(&buf);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let written = unwrap!(reply, self.fs.write(fh, offset, data));
        reply.written(written);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        unwrap!(reply, self.fs.flush(fh));
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        unwrap!(reply, self.fs.release(fh));
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        unwrap!(reply, self.fs.fsync(fh, datasync));
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fh = unwrap!(reply, self.fs.opendir(ino));
        tracing::trace!("opendir {ino} = {fh}");
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(handle) = self.fs.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let Handle::Dir(entries) = handle.value() else {
            reply.error(libc::ENOTDIR);
            return;
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            // the reported offset is the index of the next entry
            let buffer_full = reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        unwrap!(reply, self.fs.releasedir(fh));
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let st = unwrap!(reply, self.fs.statfs(ino));
        reply.statfs(
            st.blocks(),
            st.blocks_free(),
            st.blocks_available(),
            st.files(),
            st.files_free(),
            st.block_size() as u32,
            st.name_max() as u32,
            st.fragment_size() as u32,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        unwrap!(reply, self.fs.setxattr(ino, name, value, flags));
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match unwrap!(reply, self.fs.getxattr(ino, name, size)) {
            XattrReply::Size(len) => reply.size(len),
            XattrReply::Data(buf) => reply.data(&buf),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match unwrap!(reply, self.fs.listxattr(ino, size)) {
            XattrReply::Size(len) => reply.size(len),
            XattrReply::Data(buf) => reply.data(&buf),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        unwrap!(reply, self.fs.removexattr(ino, name));
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        unwrap!(reply, self.fs.access(ino, mask));
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let (attr, fh) = unwrap!(reply, self.fs.create(parent, name, mode, umask, flags));
        reply.created(&self.fs.ttl, &attr, 0, fh, 0);
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let (start, end, typ, pid) = unwrap!(reply, self.fs.getlk(fh, start, end, typ, pid));
        reply.locked(start, end, typ, pid);
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        unwrap!(reply, self.fs.setlk(fh, start, end, typ, pid, sleep));
        reply.ok();
    }
}

enum Handle {
    /// An open host file backing `open`/`create`
    File(File),
    /// A snapshot of host directory entries backing `opendir`
    Dir(Vec<DirEntry>),
}

struct DirEntry {
    ino: u64,
    kind: FileType,
    name: OsString,
}

enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

/// True when the given open flags will produce or modify the file,
/// classifying the path as an output rather than an input.
fn flags_classify_write(flags: i32) -> bool {
    flags & (libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC) != 0
}

/// Redirect a raw symlink target so that following it keeps the caller
/// inside the mirror: absolute targets are re-rooted under the mount
/// point, relative targets resolve against the mirrored copy of the
/// link's own directory.
fn redirect_link_target(mount_point: &Path, link_path: &Path, target: &OsStr) -> OpResult<PathBuf> {
    let target = Path::new(target);
    let mut redirected = mount_point.to_path_buf();
    if target.is_absolute() {
        push_relative(&mut redirected, target);
    } else {
        let dir = link_path.parent().unwrap_or_else(|| Path::new("/"));
        push_relative(&mut redirected, dir);
        redirected.push(target);
    }
    if redirected.as_os_str().len() >= libc::PATH_MAX as usize {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(redirected)
}

fn push_relative(base: &mut PathBuf, path: &Path) {
    let rel = path.strip_prefix("/").unwrap_or(path);
    if !rel.as_os_str().is_empty() {
        base.push(rel);
    }
}

fn errno_of(err: std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO)
}

fn cstring_of(path: &Path) -> OpResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn cstring_of_os(name: &OsStr) -> OpResult<CString> {
    CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)
}

fn timespec_of(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        Some(TimeOrNow::SpecificTime(at)) => {
            let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
            TimeSpec::new(since_epoch.as_secs() as libc::time_t, since_epoch.subsec_nanos() as i64)
        }
        Some(TimeOrNow::Now) => TimeSpec::new(0, libc::UTIME_NOW),
        None => TimeSpec::new(0, libc::UTIME_OMIT),
    }
}

fn file_type_of(t: std::fs::FileType) -> FileType {
    if t.is_dir() {
        FileType::Directory
    } else if t.is_symlink() {
        FileType::Symlink
    } else if t.is_fifo() {
        FileType::NamedPipe
    } else if t.is_char_device() {
        FileType::CharDevice
    } else if t.is_block_device() {
        FileType::BlockDevice
    } else if t.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn attr_of(meta: &std::fs::Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: timestamp_of(meta.atime(), meta.atime_nsec()),
        mtime: timestamp_of(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp_of(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: file_type_of(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn timestamp_of(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

fn flock_of(start: u64, end: u64, typ: i32, pid: u32) -> libc::flock {
    // Safety: flock is plain data and all-zero is a valid initial state
    let mut lk: libc::flock = unsafe { std::mem::zeroed() };
    lk.l_type = typ as libc::c_short;
    lk.l_whence = libc::SEEK_SET as libc::c_short;
    lk.l_start = start as libc::off_t;
    // the kernel's range is inclusive with i64::MAX meaning "to end of
    // file", which flock expresses as a zero length
    lk.l_len = if end >= i64::MAX as u64 {
        0
    } else {
        (end - start + 1) as libc::off_t
    };
    lk.l_pid = pid as libc::pid_t;
    lk
}

fn byte_range_of(lk: &libc::flock) -> (u64, u64) {
    let start = lk.l_start as u64;
    let end = if lk.l_len == 0 {
        i64::MAX as u64
    } else {
        start + lk.l_len as u64 - 1
    };
    (start, end)
}
