// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use super::node::{Node, NodeStatus};
use super::skeleton::clone_skeleton;
use crate::env::{rootless, Mounter};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./magic_test.rs"]
mod magic_test;

/// Path bases and the mount seam shared by the overlay components.
///
/// Everything the engine touches hangs off one of these roots, so the whole
/// overlay can be driven against a scratch layout in tests.
pub struct Context<'a> {
    /// Mount point of the active image; each top-level entry is a module
    pub module_root: &'a Path,
    /// Read-only mirror of the live base partitions
    pub mirror: &'a Path,
    /// Writable shadow tree backing skeleton clones
    pub shadow: &'a Path,
    /// Root the overlay is applied to; `/` outside of tests
    pub live_root: &'a Path,
    pub mounter: &'a dyn Mounter,
}

impl Context<'_> {
    /// The live path a full overlay path ultimately targets.
    pub fn live(&self, full_path: &Path) -> PathBuf {
        self.live_root.join(rootless(full_path))
    }

    /// The content a module supplies for a full overlay path.
    pub fn module_path(&self, module: &str, full_path: &Path) -> PathBuf {
        self.module_root.join(module).join(rootless(full_path))
    }

    /// The mirrored copy of a full overlay path.
    pub fn mirror_path(&self, full_path: &Path) -> PathBuf {
        self.mirror.join(rootless(full_path))
    }

    /// The shadow entry backing a full overlay path.
    pub fn shadow_path(&self, full_path: &Path) -> PathBuf {
        self.shadow.join(rootless(full_path))
    }
}

/// Realize the overlay tree rooted at `node` as bind mounts.
///
/// Module nodes seal their whole subtree with a single bind; skeleton
/// directories are cloned entry by entry; intermediates only recurse.
/// Dummy nodes and the vendor placeholder never reach a mount here.
pub fn magic_mount(cx: &Context, node: &mut Node, full_path: &Path) -> Result<()> {
    if node.status.contains(NodeStatus::MODULE) {
        let module = match &node.module {
            Some(module) => module,
            None => {
                return Err(Error::String(format!(
                    "module node without a contributor: {}",
                    full_path.display()
                )))
            }
        };
        let source = cx.module_path(module, full_path);
        cx.mounter.bind(&source, &cx.live(full_path))?;
        tracing::info!(module = %module, path = %full_path.display(), "mounted module content");
    } else if node.status.contains(NodeStatus::SKEL) {
        clone_skeleton(cx, node, full_path)?;
    } else if node.status.contains(NodeStatus::INTER) {
        for index in 0..node.children.len() {
            let child_path = full_path.join(&node.children[index].name);
            magic_mount(cx, &mut node.children[index], &child_path)?;
        }
    }
    // nothing to do for the vendor placeholder; dummies never appear at
    // this level in a correctly constructed tree
    Ok(())
}
