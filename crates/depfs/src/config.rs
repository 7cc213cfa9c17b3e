// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! Configuration loading for the depfs tool
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

const DEFAULT_MOUNT_POINT: &str = "/tmp/depfs";
const DEFAULT_LOG_FILE: &str = "/tmp/depfs.log";

lazy_static! {
    static ref CONFIG: RwLock<Option<Arc<Config>>> = RwLock::new(None);
}

/// Settings for the mirror filesystem and its trace output
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Filesystem {
    /// Directory under which the mirror of the host filesystem appears
    pub mountpoint: PathBuf,
    /// Destination of the trace log written at unmount
    pub logfile: PathBuf,
}

impl Default for Filesystem {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from(DEFAULT_MOUNT_POINT),
            logfile: PathBuf::from(DEFAULT_LOG_FILE),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub filesystem: Filesystem,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        let mut lock = CONFIG.write().map_err(|err| {
            crate::Error::String(format!("Cannot load config, lock has been poisoned: {err:?}"))
        })?;
        Ok(lock.insert(Arc::new(self)).clone())
    }

    /// The location in the mirror that shadows the given host path
    pub fn mirrored_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        mirrored_path(&self.filesystem.mountpoint, path)
    }
}

/// Map a host path to its location under the given mount point.
pub fn mirrored_path<P: AsRef<Path>>(mountpoint: &Path, path: P) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("/") {
        Ok(rel) => mountpoint.join(rel),
        Err(_) => mountpoint.join(path),
    }
}

/// Get the current depfs config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let lock = CONFIG.read().map_err(|err| {
        crate::Error::String(format!("Cannot load config, lock has been poisoned: {err:?}"))
    })?;
    if let Some(config) = &*lock {
        return Ok(config.clone());
    }
    drop(lock);

    // there is still a possible race condition here
    // where someone loads the config between the first check and
    // acquiring this lock, but the redundant work is still
    // less than not having a cache at all
    let config = load_config()?;
    config.make_current()
}

/// Load the depfs configuration from disk, even if it's already been loaded.
///
/// This includes the default, user and system configurations, if they exist.
pub fn load_config() -> Result<Config> {
    use config::{Config as RawConfig, Environment, File};

    let user_config_dir = "~/.config/depfs/depfs";
    let user_config = expanduser::expanduser(user_config_dir).map_err(|err| {
        crate::Error::wrap_io(err, format!("Invalid config path {user_config_dir}"))
    })?;

    let config = RawConfig::builder()
        // the system config can be in any supported format: toml, yaml, json, ini, etc
        .add_source(File::with_name("/etc/depfs").required(false))
        // as can the per-user config
        .add_source(File::with_name(&format!("{}", user_config.display())).required(false))
        .add_source(Environment::with_prefix("DEPFS").separator("_"))
        .build()?;

    Ok(Config::deserialize(config)?)
}
