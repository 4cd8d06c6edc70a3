// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Module enumeration and per-module conventions.
use std::path::{Path, PathBuf};

use crate::{filesystem, Error, Result};

#[cfg(test)]
#[path = "./modules_test.rs"]
mod modules_test;

/// Directory names under the image root that are never modules.
pub const RESERVED_DIRS: &[&str] = &[".core", "lost+found"];

/// A user-supplied module directory under the active image.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    root: PathBuf,
}

impl Module {
    pub fn new(image_root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            root: image_root.join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn flag(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    /// The user asked for this module to be deleted on the next boot.
    pub fn marked_removed(&self) -> bool {
        self.flag("remove")
    }

    pub fn disabled(&self) -> bool {
        self.flag("disable")
    }

    /// Whether the module participates in the overlay at all.
    pub fn auto_mount(&self) -> bool {
        self.flag("auto_mount")
    }

    /// The overlay payload.
    pub fn system_dir(&self) -> PathBuf {
        self.root.join("system")
    }

    pub fn prop_file(&self) -> PathBuf {
        self.root.join("system.prop")
    }

    pub fn script(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}.sh"))
    }

    /// Mirror `system/vendor` at the module root.
    ///
    /// After the vendor splinter the `/vendor` tree resolves its sources as
    /// `<module>/vendor/...`, so modules shipping vendor content need this
    /// link to stay reachable on both spellings.
    pub fn ensure_vendor_link(&self) -> Result<()> {
        let link = self.root.join("vendor");
        if let Err(err) = std::fs::remove_file(&link) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::wrap_io(
                    err,
                    format!("Failed to clear stale vendor entry for {}", self.name),
                ));
            }
        }
        std::os::unix::fs::symlink(self.system_dir().join("vendor"), &link).map_err(|err| {
            Error::wrap_io(err, format!("Failed to link vendor for {}", self.name))
        })
    }
}

/// Enumerate module directories, dropping removed and disabled ones.
///
/// Removal happens here: a `remove` sentinel deletes the whole module
/// directory before it can contribute anything. Order is the filesystem's
/// enumeration order, which also decides later collision ties.
pub fn scan(image_root: &Path) -> Result<Vec<Module>> {
    let mut modules = Vec::new();
    for entry in std::fs::read_dir(image_root)
        .map_err(|err| Error::wrap_io(err, format!("Failed to list modules in {image_root:?}")))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                tracing::warn!(?name, "skipping module with non-utf8 name");
                continue;
            }
        };
        if RESERVED_DIRS.contains(&name.as_str()) {
            continue;
        }
        let module = Module::new(image_root, &name);
        if module.marked_removed() {
            tracing::info!(module = %name, "removing module");
            if let Err(err) = filesystem::remove_all(module.path()) {
                tracing::warn!(module = %name, ?err, "failed to remove module");
            }
            continue;
        }
        if module.disabled() {
            tracing::debug!(module = %name, "module disabled");
            continue;
        }
        modules.push(module);
    }
    Ok(modules)
}
