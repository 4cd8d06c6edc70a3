// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Low-level filesystem helpers shared by the overlay components.
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./filesystem_test.rs"]
mod filesystem_test;

const SELINUX_XATTR: &str = "security.selinux";

/// Create every missing level of `dirname` with the given mode.
///
/// Levels that already exist keep their mode untouched: the shadow and
/// mirror roots are rebuilt on every boot over whatever an earlier stage
/// left behind, and those survivors already carry cloned attributes.
pub fn makedirs_with_perms<P: AsRef<Path>>(dirname: P, perms: u32) -> Result<()> {
    let perms = std::fs::Permissions::from_mode(perms);
    let mut path = PathBuf::from("/");
    for component in dirname.as_ref().components() {
        path = match component {
            std::path::Component::Normal(part) => path.join(part),
            std::path::Component::ParentDir => match path.parent() {
                Some(parent) => parent.to_path_buf(),
                None => {
                    return Err(Error::String(
                        "cannot traverse below root, too many '..' references".to_string(),
                    ))
                }
            },
            _ => continue,
        };
        match std::fs::create_dir(&path) {
            Ok(()) => {
                // the mode is advisory on a fresh level; anything that has
                // to be exact gets a full attribute clone afterwards
                let _ = std::fs::set_permissions(&path, perms.clone());
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => (),
            Err(err) => {
                return Err(Error::wrap_io(err, format!("Failed to create {path:?}")))
            }
        }
    }
    Ok(())
}

/// Create an empty file, leaving an existing one untouched.
pub fn touch<P: AsRef<Path>>(path: P) -> Result<()> {
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path.as_ref())
        .map_err(|err| Error::wrap_io(err, format!("Failed to create {:?}", path.as_ref())))?;
    Ok(())
}

/// Remove a file or directory tree, tolerating one that is already gone.
pub fn remove_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(Error::wrap_io(err, format!("Failed to stat {path:?}"))),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|err| Error::wrap_io(err, format!("Failed to remove {path:?}")))
}

/// Recreate the symlink at `from` over at `to`, carrying its attributes.
pub fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = std::fs::read_link(from)
        .map_err(|err| Error::wrap_io(err, format!("Failed to read link {from:?}")))?;
    if let Err(err) = std::fs::remove_file(to) {
        if err.kind() != std::io::ErrorKind::NotFound {
            return Err(Error::wrap_io(err, format!("Failed to replace {to:?}")));
        }
    }
    std::os::unix::fs::symlink(&target, to)
        .map_err(|err| Error::wrap_io(err, format!("Failed to link {to:?}")))?;
    clone_attributes(from, to)
}

/// Clone owner, mode, SELinux context and timestamps from `from` onto `to`.
///
/// The overlay must be indistinguishable from the base system it shadows;
/// a skeleton directory or staged file with wrong attributes would break
/// platform services that check them.
pub fn clone_attributes(from: &Path, to: &Path) -> Result<()> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;
    use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

    let meta = std::fs::symlink_metadata(from)
        .map_err(|err| Error::wrap_io(err, format!("Failed to stat {from:?}")))?;

    if let Err(err) = fchownat(
        None,
        to,
        Some(Uid::from_raw(meta.uid())),
        Some(Gid::from_raw(meta.gid())),
        FchownatFlags::NoFollowSymlink,
    ) {
        return Err(Error::wrap_nix(err, format!("Failed to chown {to:?}")));
    }

    if !meta.file_type().is_symlink() {
        std::fs::set_permissions(to, std::fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|err| Error::wrap_io(err, format!("Failed to chmod {to:?}")))?;
    }

    let atime = TimeSpec::new(meta.atime(), meta.atime_nsec());
    let mtime = TimeSpec::new(meta.mtime(), meta.mtime_nsec());
    if let Err(err) = utimensat(None, to, &atime, &mtime, UtimensatFlags::NoFollowSymlink) {
        return Err(Error::wrap_nix(err, format!("Failed to set times on {to:?}")));
    }

    if let Some(context) = get_context(from)? {
        set_context(to, &context)?;
    }
    Ok(())
}

/// Recursively copy `from` into `to`, preserving attributes.
///
/// `to` must already exist; entries that are neither directories, files nor
/// symlinks have no business in a module image and are skipped.
pub fn clone_dir(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(from) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let dest = to.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            if let Err(err) = std::fs::create_dir(&dest) {
                if err.kind() != std::io::ErrorKind::AlreadyExists {
                    return Err(Error::wrap_io(err, format!("Failed to create {dest:?}")));
                }
            }
            clone_attributes(entry.path(), &dest)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &dest)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)
                .map_err(|err| Error::wrap_io(err, format!("Failed to copy to {dest:?}")))?;
            clone_attributes(entry.path(), &dest)?;
        } else {
            tracing::debug!(path = ?entry.path(), "skipping special file during clone");
        }
    }
    Ok(())
}

fn xattr_name() -> Result<CString> {
    CString::new(SELINUX_XATTR).map_err(|_| Error::new("invalid xattr name"))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(format!("path contains a nul byte: {path:?}")))
}

/// Read the SELinux context of a path, without following symlinks.
///
/// None when the filesystem carries no label (no policy loaded, or a
/// filesystem without xattr support).
fn get_context(path: &Path) -> Result<Option<Vec<u8>>> {
    let path = c_path(path)?;
    let name = xattr_name()?;
    let mut buf = vec![0u8; 1024];
    let size = unsafe {
        libc::lgetxattr(
            path.as_ptr(),
            name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if size < 0 {
        return match nix::errno::Errno::last() {
            nix::errno::Errno::ENODATA | nix::errno::Errno::ENOTSUP => Ok(None),
            errno => Err(Error::new_errno(
                errno as i32,
                "Failed to read security context",
            )),
        };
    }
    buf.truncate(size as usize);
    Ok(Some(buf))
}

/// Label a path with the given SELinux context, without following symlinks.
fn set_context(path: &Path, context: &[u8]) -> Result<()> {
    let cpath = c_path(path)?;
    let name = xattr_name()?;
    let result = unsafe {
        libc::lsetxattr(
            cpath.as_ptr(),
            name.as_ptr(),
            context.as_ptr() as *const libc::c_void,
            context.len(),
            0,
        )
    };
    if result < 0 {
        match nix::errno::Errno::last() {
            // the shadow may live on a filesystem that cannot be labeled
            nix::errno::Errno::ENOTSUP | nix::errno::Errno::EPERM => {
                tracing::trace!(?path, "filesystem does not accept security labels");
            }
            errno => {
                return Err(Error::new_errno(
                    errno as i32,
                    format!("Failed to label {path:?}"),
                ))
            }
        }
    }
    Ok(())
}
