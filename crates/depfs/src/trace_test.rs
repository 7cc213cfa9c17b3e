// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use nix::unistd::Pid;
use rstest::rstest;

use super::{write_trace, TraceState};

fn make_state(tmpdir: &tempfile::TempDir) -> TraceState {
    TraceState::new(Pid::this(), "/tmp/depfs", tmpdir.path().join("trace.log"))
        .expect("failed to create trace state for test")
}

#[rstest]
fn test_log_open_is_eager() {
    let tmpdir = tempfile::tempdir().unwrap();
    let missing = tmpdir.path().join("no-such-dir").join("trace.log");
    TraceState::new(Pid::this(), "/tmp/depfs", missing)
        .expect_err("an unwritable log location should fail at construction");
}

#[rstest]
fn test_note_is_idempotent() {
    let tmpdir = tempfile::tempdir().unwrap();
    let state = make_state(&tmpdir);
    state.note_read("/etc/hostname");
    state.note_read("/etc/hostname");
    state.note_read("/etc/hostname");
    let (symlinks, reads, writes) = state.drain();
    assert_eq!(reads, vec![PathBuf::from("/etc/hostname")]);
    assert!(symlinks.is_empty());
    assert!(writes.is_empty());
}

#[rstest]
fn test_same_path_may_be_read_and_written() {
    let tmpdir = tempfile::tempdir().unwrap();
    let state = make_state(&tmpdir);
    state.note_write("/build/out.o");
    state.note_read("/build/out.o");
    let (_, reads, writes) = state.drain();
    assert_eq!(reads, vec![PathBuf::from("/build/out.o")]);
    assert_eq!(writes, vec![PathBuf::from("/build/out.o")]);
}

#[rstest]
fn test_drain_is_single_shot() {
    let tmpdir = tempfile::tempdir().unwrap();
    let state = make_state(&tmpdir);
    state.note_symlink("/lib64");
    state.note_read("/etc/hosts");
    state.note_write("/tmp/out");
    let (symlinks, reads, writes) = state.drain();
    assert_eq!(symlinks.len() + reads.len() + writes.len(), 3);
    let (symlinks, reads, writes) = state.drain();
    assert!(symlinks.is_empty() && reads.is_empty() && writes.is_empty());
}

#[rstest]
fn test_write_trace_record_format() {
    let mut out = Vec::new();
    write_trace(
        &mut out,
        &[PathBuf::from("/lib64")],
        &[PathBuf::from("/a.c")],
        &[PathBuf::from("/a.o")],
    )
    .unwrap();
    assert_eq!(out, b"L\t/lib64\nR\t/a.c\nW\t/a.o\n");
}

#[rstest]
fn test_finalize_groups_records() {
    let tmpdir = tempfile::tempdir().unwrap();
    let logfile = tmpdir.path().join("trace.log");
    let state = TraceState::new(Pid::this(), "/tmp/depfs", &logfile).unwrap();
    state.note_write("/proj/main");
    state.note_read("/proj/a.c");
    state.note_read("/proj/a.h");
    state.note_symlink("/proj/link");

    state.finalize().expect("finalize should succeed");

    let contents = std::fs::read_to_string(&logfile).unwrap();
    let kinds: Vec<char> = contents
        .lines()
        .map(|line| {
            assert_eq!(line.chars().nth(1), Some('\t'));
            line.chars().next().unwrap()
        })
        .collect();
    // one record per observation, grouped as links, reads, writes
    assert_eq!(kinds.len(), 4);
    assert_eq!(kinds[0], 'L');
    assert!(kinds[1..3].iter().all(|k| *k == 'R'));
    assert_eq!(kinds[3], 'W');
    assert!(contents.contains("L\t/proj/link\n"));
    assert!(contents.contains("R\t/proj/a.c\n"));
    assert!(contents.contains("R\t/proj/a.h\n"));
    assert!(contents.contains("W\t/proj/main\n"));
}

#[rstest]
fn test_finalize_twice_is_noop() {
    let tmpdir = tempfile::tempdir().unwrap();
    let logfile = tmpdir.path().join("trace.log");
    let state = TraceState::new(Pid::this(), "/tmp/depfs", &logfile).unwrap();
    state.note_read("/etc/hosts");
    state.finalize().unwrap();
    let first = std::fs::read(&logfile).unwrap();

    // a second finalize has nothing left to write and no sink to write to
    state.note_read("/etc/passwd");
    state.finalize().unwrap();
    let second = std::fs::read(&logfile).unwrap();
    assert_eq!(first, second);
}
