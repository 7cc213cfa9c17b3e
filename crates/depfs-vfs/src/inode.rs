// Copyright (c) Contributors to the depfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use fuser::FUSE_ROOT_ID;

#[cfg(test)]
#[path = "./inode_test.rs"]
mod inode_test;

struct Node {
    parent: u64,
    name: OsString,
}

/// Maps the inode numbers handed to the kernel onto host paths.
///
/// Every inode except the root records its parent and name; the host
/// path of an inode is reconstructed by walking parent links up to the
/// root (inode 1, the host `/`). Inode numbers are never reused and
/// nodes live for the mount's lifetime, so inodes the kernel still
/// references after an unlink keep resolving.
pub(crate) struct InodeTable {
    next: AtomicU64,
    nodes: DashMap<u64, Node>,
    children: DashMap<(u64, OsString), u64>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            // the root inode is implicitly allocated as the host root
            next: AtomicU64::new(FUSE_ROOT_ID + 1),
            nodes: DashMap::new(),
            children: DashMap::new(),
        }
    }

    /// Reconstruct the host path for an inode.
    pub fn host_path(&self, ino: u64) -> Option<PathBuf> {
        if ino == FUSE_ROOT_ID {
            return Some(PathBuf::from("/"));
        }
        let mut names = Vec::new();
        let mut current = ino;
        while current != FUSE_ROOT_ID {
            let node = self.nodes.get(&current)?;
            names.push(node.name.clone());
            current = node.parent;
        }
        let mut path = PathBuf::from("/");
        for name in names.iter().rev() {
            path.push(name);
        }
        Some(path)
    }

    /// Host path of a directory entry, without allocating an inode for it.
    pub fn entry_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let mut path = self.host_path(parent)?;
        path.push(name);
        Some(path)
    }

    /// The inode for the named child, allocated on first sight.
    pub fn get_or_insert(&self, parent: u64, name: &OsStr) -> u64 {
        use dashmap::mapref::entry::Entry;
        match self.children.entry((parent, name.to_owned())) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let ino = self.next.fetch_add(1, Ordering::Relaxed);
                self.nodes.insert(
                    ino,
                    Node {
                        parent,
                        name: name.to_owned(),
                    },
                );
                entry.insert(ino);
                ino
            }
        }
    }

    /// Drop the child index entry for a removed directory entry.
    ///
    /// The node itself stays so that inodes the kernel still references
    /// through open handles keep resolving; a subsequent lookup of the
    /// same name allocates a fresh inode.
    pub fn remove_child(&self, parent: u64, name: &OsStr) {
        self.children.remove(&(parent, name.to_owned()));
    }

    /// Re-key a renamed entry.
    ///
    /// Descendants follow automatically since they reach the renamed
    /// node through their parent links.
    pub fn rename(&self, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr) {
        if let Some((_, ino)) = self.children.remove(&(parent, name.to_owned())) {
            if let Some(mut node) = self.nodes.get_mut(&ino) {
                node.parent = newparent;
                node.name = newname.to_owned();
            }
            // an existing entry at the target is replaced, as on the host
            self.children.insert((newparent, newname.to_owned()), ino);
        }
    }
}
