// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;

use fuser::FileType;
use nix::errno::Errno;
use rstest::rstest;

use super::{attr_of, flags_classify_write, redirect_link_target};

#[rstest]
#[case(libc::O_RDONLY, false)]
#[case(libc::O_WRONLY, true)]
#[case(libc::O_RDWR, true)]
#[case(libc::O_RDONLY | libc::O_CREAT, true)]
#[case(libc::O_RDONLY | libc::O_TRUNC, true)]
#[case(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, true)]
#[case(libc::O_RDONLY | libc::O_NONBLOCK, false)]
fn test_open_flag_classification(#[case] flags: i32, #[case] is_write: bool) {
    assert_eq!(flags_classify_write(flags), is_write);
}

#[rstest]
fn test_redirect_absolute_target() {
    let redirected = redirect_link_target(
        Path::new("/tmp/depfs"),
        Path::new("/usr/lib/link"),
        OsStr::new("/etc/alternatives/editor"),
    )
    .unwrap();
    assert_eq!(redirected, Path::new("/tmp/depfs/etc/alternatives/editor"));
}

#[rstest]
fn test_redirect_relative_target() {
    let redirected = redirect_link_target(
        Path::new("/tmp/depfs"),
        Path::new("/usr/lib/link"),
        OsStr::new("../share/target"),
    )
    .unwrap();
    assert_eq!(redirected, Path::new("/tmp/depfs/usr/lib/../share/target"));
}

#[rstest]
fn test_redirect_relative_target_at_root() {
    let redirected =
        redirect_link_target(Path::new("/tmp/depfs"), Path::new("/link"), OsStr::new("etc"))
            .unwrap();
    assert_eq!(redirected, Path::new("/tmp/depfs/etc"));
}

#[rstest]
fn test_redirect_overflow_is_name_too_long() {
    let long = "x".repeat(libc::PATH_MAX as usize);
    let err = redirect_link_target(
        Path::new("/tmp/depfs"),
        Path::new("/link"),
        OsStr::new(&long),
    )
    .unwrap_err();
    assert_eq!(err, Errno::ENAMETOOLONG);
}

#[rstest]
fn test_attr_conversion_regular_file() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("file.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"hello").unwrap();
    drop(file);

    let meta = std::fs::symlink_metadata(&path).unwrap();
    let attr = attr_of(&meta, 42);

    assert_eq!(attr.ino, 42);
    assert_eq!(attr.size, 5);
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.uid, nix::unistd::getuid().as_raw());
    assert_eq!(attr.nlink, 1);
}

#[rstest]
fn test_attr_conversion_symlink() {
    let tmpdir = tempfile::tempdir().unwrap();
    let path = tmpdir.path().join("link");
    std::os::unix::fs::symlink("/etc", &path).unwrap();

    let meta = std::fs::symlink_metadata(&path).unwrap();
    let attr = attr_of(&meta, 7);

    assert_eq!(attr.kind, FileType::Symlink);
}
