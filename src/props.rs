// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Interface to the platform property service.
use std::path::Path;
use std::process::Command;

use crate::{Error, Result};

#[cfg(test)]
#[path = "./props_test.rs"]
mod props_test;

/// The property service belongs to the platform; the engine only reads a
/// few switches and applies module-supplied values through this seam.
pub trait PropertyStore {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Property access through the platform's getprop/setprop tools.
pub struct SystemProperties;

impl PropertyStore for SystemProperties {
    fn get(&self, key: &str) -> Option<String> {
        let output = Command::new("getprop").arg(key).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let status = Command::new("setprop")
            .arg(key)
            .arg(value)
            .status()
            .map_err(|err| Error::process_spawn_error("setprop", err))?;
        if !status.success() {
            return Err(Error::String(format!("setprop {key} failed with {status}")));
        }
        Ok(())
    }
}

/// Split a `key=value` line, dropping blanks and comments.
pub fn parse_prop_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// Apply a module's property file to the store.
///
/// A malformed line is somebody's typo, not a reason to drop the module;
/// it is skipped and the rest of the file still applies.
pub fn load_prop_file(store: &dyn PropertyStore, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| Error::wrap_io(err, format!("Failed to read {path:?}")))?;
    for line in content.lines() {
        if let Some((key, value)) = parse_prop_line(line) {
            if let Err(err) = store.set(key, value) {
                tracing::warn!(%key, ?err, "failed to apply property");
            }
        }
    }
    Ok(())
}
