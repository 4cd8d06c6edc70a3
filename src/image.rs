// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Module-image handling: merging staged images into the active image and
//! trimming it back to its used size.
use std::path::Path;
use std::process::Command;

use crate::{filesystem, Error, Result};

#[cfg(test)]
#[path = "./image_test.rs"]
mod image_test;

/// Directory names that are never treated as modules during a merge.
pub const RESERVED_ENTRIES: &[&str] = &[".core", "lost+found"];

/// Images grow in 32 MB units with two units of slack.
pub fn round_size(mb: u64) -> u64 {
    ((mb / 32) + 2) * 32
}

/// Occupancy of an image, in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub used: u64,
    pub total: u64,
}

/// The loopback-image primitives the engine drives but does not implement.
///
/// Image creation, resizing and loop mounting belong to the platform; the
/// engine only decides when to call them, so they sit behind this seam and
/// tests substitute a fake.
pub trait ImageOps {
    fn create(&self, image: &Path, size_mb: u64) -> Result<()>;

    fn resize(&self, image: &Path, size_mb: u64) -> Result<()>;

    fn size(&self, image: &Path) -> Result<ImageSize>;

    /// Attach and mount the image, returning the loop device claimed for it.
    fn mount(&self, image: &Path, target: &Path) -> Result<String>;

    fn unmount(&self, target: &Path, loop_device: &str) -> Result<()>;
}

/// ext4 image handling through the platform utilities.
///
/// The device ships the e2fsprogs suite for exactly this purpose; driving
/// the tools keeps the engine free of loop ioctls and superblock parsing.
pub struct Ext4Images;

impl Ext4Images {
    fn run(mut command: Command, what: &str) -> Result<std::process::Output> {
        let output = command
            .output()
            .map_err(|err| Error::process_spawn_error(what, err))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::String(format!(
                "{what} failed with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }

    fn fsck(image: &Path) {
        // exit codes 1 and 2 only report corrected problems, so the status
        // is not worth checking; resize2fs will complain if it matters
        let mut command = Command::new("e2fsck");
        command.arg("-yf").arg(image);
        if let Err(err) = command.output() {
            tracing::warn!(?image, ?err, "failed to run e2fsck");
        }
    }
}

impl ImageOps for Ext4Images {
    fn create(&self, image: &Path, size_mb: u64) -> Result<()> {
        tracing::info!(?image, size_mb, "creating image");
        let mut command = Command::new("make_ext4fs");
        command.arg("-l").arg(format!("{size_mb}M")).arg(image);
        Self::run(command, "make_ext4fs")?;
        Ok(())
    }

    fn resize(&self, image: &Path, size_mb: u64) -> Result<()> {
        tracing::info!(?image, size_mb, "resizing image");
        Self::fsck(image);
        let mut command = Command::new("resize2fs");
        command.arg(image).arg(format!("{size_mb}M"));
        Self::run(command, "resize2fs")?;
        Ok(())
    }

    fn size(&self, image: &Path) -> Result<ImageSize> {
        let mut command = Command::new("dumpe2fs");
        command.arg("-h").arg(image);
        let output = Self::run(command, "dumpe2fs")?;
        parse_dumpe2fs(&String::from_utf8_lossy(&output.stdout))
    }

    fn mount(&self, image: &Path, target: &Path) -> Result<String> {
        filesystem::makedirs_with_perms(target, 0o755)?;
        let mut attach = Command::new("losetup");
        attach.arg("-f").arg("--show").arg(image);
        let output = Self::run(attach, "losetup")?;
        let loop_device = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if loop_device.is_empty() {
            return Err(Error::String(format!(
                "losetup claimed no device for {image:?}"
            )));
        }
        let mut mount = Command::new("mount");
        mount.args(["-t", "ext4"]).arg(&loop_device).arg(target);
        if let Err(err) = Self::run(mount, "mount") {
            // do not leak the loop device on a failed mount
            let mut detach = Command::new("losetup");
            detach.arg("-d").arg(&loop_device);
            let _ = detach.output();
            return Err(err);
        }
        tracing::info!(?image, ?target, %loop_device, "mounted image");
        Ok(loop_device)
    }

    fn unmount(&self, target: &Path, loop_device: &str) -> Result<()> {
        let mut unmount = Command::new("umount");
        unmount.arg(target);
        Self::run(unmount, "umount")?;
        let mut detach = Command::new("losetup");
        detach.arg("-d").arg(loop_device);
        Self::run(detach, "losetup -d")?;
        Ok(())
    }
}

fn parse_dumpe2fs(text: &str) -> Result<ImageSize> {
    let mut block_count = None;
    let mut free_blocks = None;
    let mut block_size = None;
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("Block count:") {
            block_count = value.trim().parse::<u64>().ok();
        } else if let Some(value) = line.strip_prefix("Free blocks:") {
            free_blocks = value.trim().parse::<u64>().ok();
        } else if let Some(value) = line.strip_prefix("Block size:") {
            block_size = value.trim().parse::<u64>().ok();
        }
    }
    match (block_count, free_blocks, block_size) {
        (Some(blocks), Some(free), Some(size)) => {
            let to_mb = |count: u64| (count * size + (1 << 20) - 1) >> 20;
            Ok(ImageSize {
                used: to_mb(blocks.saturating_sub(free)),
                total: to_mb(blocks),
            })
        }
        _ => Err(Error::String(
            "dumpe2fs output is missing block counts".to_string(),
        )),
    }
}

/// Merge a staged image into the active image.
///
/// A missing source is nothing to do; a missing target simply adopts the
/// source. Otherwise the target is grown to hold both, every module present
/// in the source replaces its copy in the target, and the source image is
/// consumed.
pub fn merge_images(
    ops: &dyn ImageOps,
    source: &Path,
    target: &Path,
    source_stage: &Path,
    target_stage: &Path,
) -> Result<()> {
    if !source.exists() {
        return Ok(());
    }
    if !target.exists() {
        tracing::info!(?source, ?target, "adopting staged image");
        std::fs::rename(source, target)
            .map_err(|err| Error::wrap_io(err, format!("Failed to adopt {source:?}")))?;
        return Ok(());
    }

    // grow the target to the worst case before mounting anything
    let source_size = ops.size(source)?;
    let target_size = ops.size(target)?;
    let wanted = round_size(source_size.used + target_size.used);
    if wanted != target_size.total {
        ops.resize(target, wanted)?;
    }

    filesystem::makedirs_with_perms(source_stage, 0o755)?;
    filesystem::makedirs_with_perms(target_stage, 0o755)?;
    let source_loop = ops.mount(source, source_stage)?;
    let target_loop = match ops.mount(target, target_stage) {
        Ok(loop_device) => loop_device,
        Err(err) => {
            let _ = ops.unmount(source_stage, &source_loop);
            return Err(err);
        }
    };

    let merged = merge_mounted(source_stage, target_stage);

    if let Err(err) = ops.unmount(source_stage, &source_loop) {
        tracing::warn!(?err, "failed to unmount merge source");
    }
    if let Err(err) = ops.unmount(target_stage, &target_loop) {
        tracing::warn!(?err, "failed to unmount merge target");
    }
    let _ = std::fs::remove_dir(source_stage);
    let _ = std::fs::remove_dir(target_stage);
    merged?;

    std::fs::remove_file(source)
        .map_err(|err| Error::wrap_io(err, format!("Failed to consume {source:?}")))?;
    Ok(())
}

fn merge_mounted(source_stage: &Path, target_stage: &Path) -> Result<()> {
    for entry in std::fs::read_dir(source_stage)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if RESERVED_ENTRIES.contains(&name.as_str()) {
            continue;
        }
        let existing = target_stage.join(&name);
        if existing.exists() {
            tracing::info!(module = %name, "Upgrade module");
            filesystem::remove_all(&existing)?;
        } else {
            tracing::info!(module = %name, "New module");
        }
    }
    filesystem::clone_dir(source_stage, target_stage)
}

/// Shrink the image back to its used size plus slack.
pub fn trim_image(ops: &dyn ImageOps, image: &Path) -> Result<()> {
    let size = ops.size(image)?;
    let wanted = round_size(size.used);
    if wanted != size.total {
        tracing::info!(?image, from = size.total, to = wanted, "trimming image");
        ops.resize(image, wanted)?;
    }
    Ok(())
}
