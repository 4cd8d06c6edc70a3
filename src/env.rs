// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Mount plumbing: the mount seam used by every overlay component, kernel
//! mount-table parsing, and the read-only mirrors of the base partitions.
use std::io::BufRead;
use std::path::Path;

use crate::{filesystem, Error, Result};

#[cfg(test)]
#[path = "./env_test.rs"]
mod env_test;

const NONE: Option<&str> = None;

/// Issues mount calls on behalf of the engine.
///
/// Mount state is kernel-global and cannot be unwound piecemeal, so every
/// component takes this seam and tests substitute a recording fake.
pub trait Mounter {
    /// Make `source` appear at `target` without duplicating data.
    fn bind(&self, source: &Path, target: &Path) -> Result<()>;

    /// Mount a block device read-only at `target`.
    fn mount_ro(&self, device: &Path, target: &Path, fstype: &str) -> Result<()>;

    /// Detach whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// The real thing, issuing mount(2) and umount2(2) through nix.
pub struct SysMounter;

impl Mounter for SysMounter {
    fn bind(&self, source: &Path, target: &Path) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        tracing::debug!(?source, ?target, "bind mount");
        if let Err(err) = mount(Some(source), target, NONE, MsFlags::MS_BIND, NONE) {
            return Err(Error::wrap_nix(
                err,
                format!("Failed to bind {source:?} over {target:?}"),
            ));
        }
        Ok(())
    }

    fn mount_ro(&self, device: &Path, target: &Path, fstype: &str) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        tracing::debug!(?device, ?target, fstype, "read-only mount");
        if let Err(err) = mount(Some(device), target, Some(fstype), MsFlags::MS_RDONLY, NONE) {
            return Err(Error::wrap_nix(
                err,
                format!("Failed to mount {device:?} at {target:?}"),
            ));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        // Perform a lazy unmount in case there are still open handles to files.
        // This way we can mount over the old one without worrying about business
        let result = nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH);
        if let Err(err) = result {
            return Err(Error::wrap_nix(err, format!("Failed to unmount {target:?}")));
        }
        Ok(())
    }
}

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub target: String,
    pub fstype: String,
}

/// Parse mount-table text of the /proc/mounts form.
///
/// Lines with fewer than three fields are skipped rather than rejected; the
/// kernel is the producer and extra validation buys nothing.
pub fn parse_mount_table<R: BufRead>(reader: R) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let device = match fields.next() {
            Some(device) => device,
            None => continue,
        };
        let target = match fields.next() {
            Some(target) => target,
            None => continue,
        };
        let fstype = match fields.next() {
            Some(fstype) => fstype,
            None => continue,
        };
        entries.push(MountEntry {
            device: device.to_string(),
            target: target.to_string(),
            fstype: fstype.to_string(),
        });
    }
    Ok(entries)
}

/// Read the kernel mount table for this namespace.
pub fn read_mount_table() -> Result<Vec<MountEntry>> {
    let file = std::fs::File::open("/proc/mounts")
        .map_err(|err| Error::wrap_io(err, "Failed to open /proc/mounts"))?;
    parse_mount_table(std::io::BufReader::new(file))
}

/// True once the data partition is mounted with a real filesystem.
///
/// Early in boot /data may be covered by a tmpfs placeholder until the
/// encryption layer releases the real mount.
pub fn data_ready(table: &[MountEntry]) -> bool {
    table
        .iter()
        .any(|entry| entry.target == "/data" && entry.fstype != "tmpfs")
}

/// Outcome of mirror mounting.
pub struct Mirrors {
    /// True when /vendor is its own mount rather than part of /system
    pub separate_vendor: bool,
}

/// Mount read-only mirrors of the live /system and /vendor under `mirror`.
///
/// The mirrors are the source for every skeleton child that no module
/// replaces. When vendor is not a separate partition the vendor mirror is a
/// symlink into the system mirror so both spellings resolve.
pub fn mount_mirrors(
    mirror: &Path,
    mounter: &dyn Mounter,
    table: &[MountEntry],
) -> Result<Mirrors> {
    let mut separate_vendor = false;
    for entry in table {
        let target = match entry.target.as_str() {
            "/system" => mirror.join("system"),
            "/vendor" => {
                separate_vendor = true;
                mirror.join("vendor")
            }
            _ => continue,
        };
        filesystem::makedirs_with_perms(&target, 0o755)?;
        mounter.mount_ro(Path::new(&entry.device), &target, &entry.fstype)?;
        tracing::info!(device = %entry.device, ?target, "mounted mirror");
    }
    if !separate_vendor {
        let link = mirror.join("vendor");
        let target = mirror.join("system/vendor");
        if let Err(err) = std::os::unix::fs::symlink(&target, &link) {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(Error::wrap_io(
                    err,
                    format!("Failed to link vendor mirror at {link:?}"),
                ));
            }
        }
        tracing::info!(?target, ?link, "linked vendor mirror into system");
    }
    Ok(Mirrors { separate_vendor })
}

/// Compute the path of `path` relative to the filesystem root.
pub fn rootless(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}
