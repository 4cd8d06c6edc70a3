// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Simple mount: an unconditional overlay of cache-staged files, used at
//! post-fs while the data partition is still sealed.
use std::path::Path;

use crate::env::{rootless, Mounter};
use crate::{filesystem, Result};

#[cfg(test)]
#[path = "./simple_test.rs"]
mod simple_test;

/// Bind every file staged under `cache_root/<path>` over its live twin.
///
/// Directories recurse; files clone the live attributes onto the staged
/// copy before the bind so the replacement is indistinguishable. A staged
/// entry without a live counterpart is skipped, since there is nothing to
/// bind onto.
pub fn simple_mount(
    mounter: &dyn Mounter,
    cache_root: &Path,
    live_root: &Path,
    path: &Path,
) -> Result<()> {
    let staged = cache_root.join(rootless(path));
    let dir = match std::fs::read_dir(&staged) {
        Ok(dir) => dir,
        Err(_) => return Ok(()),
    };
    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(?staged, ?err, "unreadable staged entry");
                continue;
            }
        };
        let name = entry.file_name();
        let target = path.join(&name);
        let live = live_root.join(rootless(&target));
        if !live.exists() {
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                tracing::warn!(?name, ?err, "cannot type staged entry");
                continue;
            }
        };
        if file_type.is_dir() {
            simple_mount(mounter, cache_root, live_root, &target)?;
        } else if file_type.is_file() {
            let source = staged.join(&name);
            if let Err(err) = filesystem::clone_attributes(&live, &source) {
                tracing::warn!(?source, ?err, "failed to clone attributes onto staged file");
            }
            mounter.bind(&source, &live)?;
        }
    }
    Ok(())
}
