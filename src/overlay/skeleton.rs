// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use super::magic::Context;
use super::node::{Node, NodeStatus, NodeType};
use crate::{filesystem, Result};

#[cfg(test)]
#[path = "./skeleton_test.rs"]
mod skeleton_test;

/// Materialize the writable shadow for `node` and bind every child over it.
///
/// Bind mounts are per-inode: to add or replace one entry of an otherwise
/// untouched directory, the directory itself must be swapped for a writable
/// clone that aliases every unchanged entry back to the mirror. The shadow
/// is one rooted tree keyed by full path, so a nested intermediate's
/// entries land inside its parent's shadow and resolve through the parent's
/// bind without a mount of their own.
pub fn clone_skeleton(cx: &Context, node: &mut Node, full_path: &Path) -> Result<()> {
    // extend the children with a dummy for every mirrored entry; existing
    // module contributions win by precedence
    let mirror_dir = cx.mirror_path(full_path);
    let dir = match std::fs::read_dir(&mirror_dir) {
        Ok(dir) => dir,
        Err(err) => {
            tracing::debug!(?mirror_dir, ?err, "no mirror to clone from");
            return Ok(());
        }
    };
    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(?mirror_dir, ?err, "unreadable mirror entry");
                continue;
            }
        };
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                tracing::warn!(?name, "skipping non-utf8 mirror entry");
                continue;
            }
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                tracing::warn!(%name, ?err, "cannot type mirror entry");
                continue;
            }
        };
        let kind = match NodeType::from_file_type(file_type) {
            Some(kind) => kind,
            None => {
                tracing::debug!(%name, "mirror entry has no overlay meaning");
                continue;
            }
        };
        node.insert(Node::new(name, kind, NodeStatus::DUMMY));
    }

    let shadow_dir = cx.shadow_path(full_path);
    filesystem::makedirs_with_perms(&shadow_dir, 0o755)?;
    if let Err(err) = filesystem::clone_attributes(&cx.live(full_path), &shadow_dir) {
        tracing::warn!(?shadow_dir, ?err, "failed to clone directory attributes");
    }
    // swap the live directory for the shadow; a plain intermediate reached
    // by recursion already resolves through its parent's bind
    if node.status.contains(NodeStatus::SKEL) {
        cx.mounter.bind(&shadow_dir, &cx.live(full_path))?;
    }

    for index in 0..node.children.len() {
        let (name, kind, status, module) = {
            let child = &node.children[index];
            (
                child.name.clone(),
                child.kind,
                child.status,
                child.module.clone(),
            )
        };
        let child_path = full_path.join(&name);
        let shadow_entry = shadow_dir.join(&name);

        // the shadow entry comes first; symlinks are copied whole below
        match kind {
            NodeType::Dir => {
                if let Err(err) = std::fs::create_dir(&shadow_entry) {
                    if err.kind() != std::io::ErrorKind::AlreadyExists {
                        tracing::warn!(?shadow_entry, ?err, "failed to create shadow directory");
                        continue;
                    }
                }
            }
            NodeType::Reg => filesystem::touch(&shadow_entry)?,
            NodeType::Lnk => (),
        }

        if status.contains(NodeStatus::VENDOR) {
            if kind == NodeType::Lnk {
                // restore the stock /system/vendor link inside the shadow
                let stock = cx.mirror_path(&child_path);
                if let Err(err) = filesystem::copy_symlink(&stock, &cx.live(&child_path)) {
                    tracing::warn!(?stock, ?err, "failed to restore vendor link");
                }
            }
            continue;
        }

        let source = if status.contains(NodeStatus::MODULE) {
            match module {
                Some(module) => cx.module_path(&module, &child_path),
                None => {
                    tracing::warn!(path = %child_path.display(), "module child without a contributor");
                    continue;
                }
            }
        } else if status.intersects(NodeStatus::SKEL | NodeStatus::INTER) {
            clone_skeleton(cx, &mut node.children[index], &child_path)?;
            continue;
        } else {
            // dummy: alias the unchanged entry back to the mirror
            cx.mirror_path(&child_path)
        };

        if kind == NodeType::Lnk {
            // symlinks live inside the shadow itself; no mount needed
            if let Err(err) = filesystem::copy_symlink(&source, &shadow_entry) {
                tracing::warn!(?source, ?err, "failed to copy symlink into shadow");
            }
        } else {
            cx.mounter.bind(&source, &cx.live(&child_path))?;
        }
    }
    Ok(())
}
