// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::OsStr;
use std::path::Path;

use fuser::FUSE_ROOT_ID;
use rstest::rstest;

use super::InodeTable;

#[rstest]
fn test_root_is_host_root() {
    let table = InodeTable::new();
    assert_eq!(table.host_path(FUSE_ROOT_ID).unwrap(), Path::new("/"));
}

#[rstest]
fn test_unknown_inode_does_not_resolve() {
    let table = InodeTable::new();
    assert!(table.host_path(42).is_none());
}

#[rstest]
fn test_lookup_is_idempotent() {
    let table = InodeTable::new();
    let first = table.get_or_insert(FUSE_ROOT_ID, OsStr::new("usr"));
    let second = table.get_or_insert(FUSE_ROOT_ID, OsStr::new("usr"));
    assert_eq!(first, second);
}

#[rstest]
fn test_nested_path_reconstruction() {
    let table = InodeTable::new();
    let usr = table.get_or_insert(FUSE_ROOT_ID, OsStr::new("usr"));
    let lib = table.get_or_insert(usr, OsStr::new("lib"));
    assert_eq!(table.host_path(lib).unwrap(), Path::new("/usr/lib"));
    assert_eq!(
        table.entry_path(lib, OsStr::new("libc.so")).unwrap(),
        Path::new("/usr/lib/libc.so")
    );
}

#[rstest]
fn test_rename_moves_descendants() {
    let table = InodeTable::new();
    let src = table.get_or_insert(FUSE_ROOT_ID, OsStr::new("src"));
    let file = table.get_or_insert(src, OsStr::new("main.c"));

    table.rename(FUSE_ROOT_ID, OsStr::new("src"), FUSE_ROOT_ID, OsStr::new("build"));

    assert_eq!(table.host_path(src).unwrap(), Path::new("/build"));
    assert_eq!(table.host_path(file).unwrap(), Path::new("/build/main.c"));
    // the new name resolves to the same inode, the old one is gone
    assert_eq!(table.get_or_insert(FUSE_ROOT_ID, OsStr::new("build")), src);
    assert_ne!(table.get_or_insert(FUSE_ROOT_ID, OsStr::new("src")), src);
}

#[rstest]
fn test_unlink_keeps_open_inodes_resolving() {
    let table = InodeTable::new();
    let file = table.get_or_insert(FUSE_ROOT_ID, OsStr::new("scratch"));

    table.remove_child(FUSE_ROOT_ID, OsStr::new("scratch"));

    // handles opened before the unlink still resolve their path
    assert_eq!(table.host_path(file).unwrap(), Path::new("/scratch"));
    // but a new entry under the same name is a new inode
    assert_ne!(table.get_or_insert(FUSE_ROOT_ID, OsStr::new("scratch")), file);
}
