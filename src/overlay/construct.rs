// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use super::magic::Context;
use super::node::{Node, NodeStatus, NodeType};

#[cfg(test)]
#[path = "./construct_test.rs"]
mod construct_test;

/// Walk one module's payload under `parent_path` and merge it into the tree.
///
/// Construction never surfaces failure: an unopenable module directory
/// simply contributes no nodes, and per-entry problems are logged and
/// skipped so one bad module cannot take down the stage.
pub fn construct_tree(cx: &Context, module: &str, parent: &mut Node, parent_path: &Path) {
    let source = cx.module_path(module, parent_path);
    let dir = match std::fs::read_dir(&source) {
        Ok(dir) => dir,
        Err(err) => {
            tracing::debug!(?source, ?err, "module contributes nothing here");
            return;
        }
    };

    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(?source, ?err, "unreadable module entry");
                continue;
            }
        };
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                tracing::warn!(?name, "skipping non-utf8 module entry");
                continue;
            }
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                tracing::warn!(%name, ?err, "cannot type module entry");
                continue;
            }
        };
        let kind = match NodeType::from_file_type(file_type) {
            Some(kind) => kind,
            None => {
                tracing::debug!(%name, "module entry has no overlay meaning");
                continue;
            }
        };

        let target = parent_path.join(&name);
        let live = cx.live(&target);

        // The parent must be cloned as a skeleton when this entry cannot
        // simply be mounted over its live counterpart: the module ships a
        // symlink, the live target is missing, or the live target is itself
        // a symlink. /system/vendor is exempt from the symlink rule; the
        // vendor splinter handles it after construction.
        let mut clone = kind == NodeType::Lnk || !live.exists();
        if !clone && !(parent_path == Path::new("/system") && name == "vendor") {
            match std::fs::symlink_metadata(&live) {
                Ok(meta) => clone = meta.file_type().is_symlink(),
                Err(err) => {
                    tracing::warn!(?live, ?err, "cannot stat live target");
                    continue;
                }
            }
        }

        let node = if clone {
            // does not downgrade a parent that is already module content
            parent.status |= NodeStatus::SKEL;
            Node::new_module(name, kind, NodeStatus::MODULE, module)
        } else if kind == NodeType::Dir {
            if cx.module_path(module, &target).join(".replace").exists() {
                // replace the live directory wholesale
                Node::new_module(name, kind, NodeStatus::MODULE, module)
            } else {
                Node::new_module(name, kind, NodeStatus::INTER, module)
            }
        } else {
            Node::new_module(name, kind, NodeStatus::MODULE, module)
        };

        let index = parent.insert(node);
        if parent.children[index]
            .status
            .intersects(NodeStatus::SKEL | NodeStatus::INTER)
        {
            construct_tree(cx, module, &mut parent.children[index], &target);
        }
    }
}
