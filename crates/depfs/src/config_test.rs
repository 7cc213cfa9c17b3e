// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use rstest::rstest;

use super::{mirrored_path, Config};

#[rstest]
fn test_config_defaults() {
    let config = Config::default();
    assert_eq!(config.filesystem.mountpoint, Path::new("/tmp/depfs"));
    assert_eq!(config.filesystem.logfile, Path::new("/tmp/depfs.log"));
}

#[rstest]
fn test_config_roundtrip() {
    let expected: Config = serde_json::from_str(
        r#"{"filesystem": {"mountpoint": "/mnt/mirror", "logfile": "/var/log/depfs.log"}}"#,
    )
    .expect("failed to load config from json");
    let data = serde_json::to_string_pretty(&expected).expect("failed to serialize config");
    let actual: Config = serde_json::from_str(&data).expect("failed to deserialize config data");

    assert_eq!(actual, expected);
}

#[rstest]
fn test_config_partial_source() {
    let config: Config = serde_json::from_str(r#"{"filesystem": {"logfile": "/tmp/other.log"}}"#)
        .expect("failed to load config from json");
    assert_eq!(config.filesystem.mountpoint, Path::new("/tmp/depfs"));
    assert_eq!(config.filesystem.logfile, Path::new("/tmp/other.log"));
}

#[rstest]
#[case("/home/user/src", "/tmp/depfs/home/user/src")]
#[case("/etc", "/tmp/depfs/etc")]
#[case("relative/dir", "/tmp/depfs/relative/dir")]
fn test_mirrored_path(#[case] host: &str, #[case] expected: &str) {
    let config = Config::default();
    assert_eq!(config.mirrored_path(host), Path::new(expected));
    assert_eq!(
        mirrored_path(&config.filesystem.mountpoint, host),
        Path::new(expected)
    );
}
