// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::fs::PermissionsExt;

use rstest::rstest;

use super::ensure_mount_point;

#[rstest]
fn test_ensure_mount_point_is_idempotent() {
    let tmpdir = tempfile::tempdir().unwrap();
    let mountpoint = tmpdir.path().join("mirror");

    ensure_mount_point(&mountpoint).expect("should create a missing mount point");
    assert!(mountpoint.is_dir());

    ensure_mount_point(&mountpoint).expect("should tolerate an existing mount point");
}

#[rstest]
fn test_ensure_mount_point_creates_nested_dirs_with_perms() {
    let tmpdir = tempfile::tempdir().unwrap();
    let deep = tmpdir.path().join("a").join("b").join("mirror");

    ensure_mount_point(&deep).expect("should create intermediate directories");

    assert!(deep.is_dir());
    for dir in [&deep, &tmpdir.path().join("a").join("b"), &tmpdir.path().join("a")] {
        let mode = dir.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777, "created component {dir:?} should be world-accessible");
    }
}

#[rstest]
fn test_ensure_mount_point_leaves_existing_dirs_alone() {
    let tmpdir = tempfile::tempdir().unwrap();
    let existing = tmpdir.path().join("kept");
    std::fs::create_dir(&existing).unwrap();
    std::fs::set_permissions(&existing, std::fs::Permissions::from_mode(0o700)).unwrap();

    ensure_mount_point(existing.join("mirror")).expect("should create below an existing dir");

    let mode = existing.metadata().unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o700, "pre-existing components keep their permissions");
}
