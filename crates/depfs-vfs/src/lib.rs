// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

//! The mirror filesystem served while a delegate command runs.
//!
//! Provides a FUSE personality that forwards every operation to the
//! host filesystem, classifying each `open` and `create` as an input
//! or an output and recording every symlink traversal. The mirror adds
//! observability but no storage semantics of its own.

#![deny(missing_docs)]

mod fuse;
mod inode;

pub use fuse::{Config, Session};
