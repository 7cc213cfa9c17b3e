// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

use super::CmdTrace;

#[test]
fn test_missing_command_is_usage_error() {
    CmdTrace::try_parse_from(["depfs"]).expect_err("a missing delegate command must be rejected");
}

#[test]
fn test_delegate_args_pass_through_untouched() {
    let opt = CmdTrace::try_parse_from(["depfs", "make", "-j4", "--keep-going", "all"])
        .expect("a delegate with flag-like arguments should parse");
    assert_eq!(opt.command, "make");
    assert_eq!(opt.command_args, vec!["-j4", "--keep-going", "all"]);
}

#[test]
fn test_overrides_apply_before_the_delegate() {
    let opt = CmdTrace::try_parse_from([
        "depfs",
        "--mountpoint",
        "/mnt/mirror",
        "--logfile",
        "/tmp/t.log",
        "true",
    ])
    .expect("overrides and a delegate should parse");
    assert_eq!(opt.mountpoint.as_deref(), Some(std::path::Path::new("/mnt/mirror")));
    assert_eq!(opt.logfile.as_deref(), Some(std::path::Path::new("/tmp/t.log")));
    assert_eq!(opt.command, "true");
    assert!(opt.command_args.is_empty());
}
