// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! Filesystem-level build introspection.
//!
//! depfs runs a delegate command under a mirror of the host filesystem
//! and records which files the delegate and its descendants open for
//! reading and for writing. The resulting trace log is the substrate
//! for automatic dependency extraction: if an output was produced while
//! a set of inputs was open for read, the output is assumed to depend
//! on those inputs.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
mod delegate;
pub mod env;
mod error;
mod monitor;
pub mod trace;

pub use config::{get_config, load_config, Config};
pub use delegate::{run_delegate, WAKE_SIGNAL};
pub use error::{Error, Result};
pub use monitor::{wait_for_delegate, DelegateStatus};
