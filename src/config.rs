// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! On-device layout and engine settings.
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::Result;

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

lazy_static! {
    static ref CONFIG: RwLock<Option<Arc<Config>>> = RwLock::new(None);
}

/// Filesystem layout consumed and produced by the engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Filesystem {
    /// Mount point of the active image; each top-level entry is a module
    pub module_root: PathBuf,
    /// Read-only mirrors of the live base partitions
    pub mirror: PathBuf,
    /// Writable shadow tree backing skeleton clones
    pub shadow: PathBuf,
    /// Common scripts and engine state inside the active image
    pub core: PathBuf,
    /// Cache-resident tree overlaid before the data partition is writable
    pub cache_stage: PathBuf,
    /// The active image storing all enabled modules between boots
    pub main_image: PathBuf,
    /// Image staged on the cache partition, merged at every boot
    pub cache_image: PathBuf,
    /// Image staged on the data partition, merged at every boot
    pub merge_image: PathBuf,
    /// Temporary mount points used while merging images
    pub source_stage: PathBuf,
    pub target_stage: PathBuf,
    /// Engine binaries directory on the data partition
    pub data_bin: PathBuf,
}

impl Default for Filesystem {
    fn default() -> Self {
        Self {
            module_root: PathBuf::from("/modules"),
            mirror: PathBuf::from("/dev/mm/mirror"),
            shadow: PathBuf::from("/dev/mm/shadow"),
            core: PathBuf::from("/modules/.core"),
            cache_stage: PathBuf::from("/cache/modules_mount"),
            main_image: PathBuf::from("/data/modules.img"),
            cache_image: PathBuf::from("/cache/modules.img"),
            merge_image: PathBuf::from("/data/modules_merge.img"),
            source_stage: PathBuf::from("/dev/source_stage"),
            target_stage: PathBuf::from("/dev/target_stage"),
            data_bin: PathBuf::from("/data/mm"),
        }
    }
}

/// Marker files that steer the boot stages.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentinels {
    /// Created exactly once per boot to let init continue
    pub unblock: PathBuf,
    /// Present when the user asked for core-only mode
    pub disable: PathBuf,
    /// Uninstaller script staged for the next boot
    pub uninstaller: PathBuf,
    /// Systemless hosts file mounted over /system/etc/hosts
    pub hosts: PathBuf,
    /// Manager package staged for installation at late-start
    pub manager_apk: PathBuf,
    /// Requests the log monitor at post-fs-data
    pub late_logmon: PathBuf,
    /// Staged replacement for the binaries directory
    pub data_bin_stage: PathBuf,
    /// Manual injector staging location
    pub inject_stage: PathBuf,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self {
            unblock: PathBuf::from("/dev/.mm.unblock"),
            disable: PathBuf::from("/cache/.disable_mm"),
            uninstaller: PathBuf::from("/cache/mm_uninstaller.sh"),
            hosts: PathBuf::from("/modules/.core/hosts"),
            manager_apk: PathBuf::from("/data/mm_manager.apk"),
            late_logmon: PathBuf::from("/cache/.mm_log_monitor"),
            data_bin_stage: PathBuf::from("/cache/data_bin"),
            inject_stage: PathBuf::from("/data/local/tmp/mm_inject"),
        }
    }
}

/// Property names the engine reads or writes.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Props {
    /// Disables the hide subsystem when set to "0"
    pub hide: String,
    /// Set when late-start runs with modules disabled
    pub disable_marker: String,
}

impl Default for Props {
    fn default() -> Self {
        Self {
            hide: "persist.mm.hide".to_string(),
            disable_marker: "ro.mm.disabled".to_string(),
        }
    }
}

/// Child-process settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Exec {
    /// Shell used for all script execution
    pub shell: PathBuf,
    /// Seconds between manager install attempts
    pub install_retry_secs: u64,
    /// Capture a verbose logcat for the whole boot into this file
    pub debug_log: Option<PathBuf>,
}

impl Default for Exec {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/system/bin/sh"),
            install_retry_secs: 5,
            debug_log: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub filesystem: Filesystem,
    pub sentinels: Sentinels,
    pub props: Props,
    pub exec: Exec,
}

impl Config {
    /// Get the current loaded config, loading it if needed
    pub fn current() -> Result<Arc<Self>> {
        get_config()
    }

    /// Load the config from disk, even if it's already been loaded before
    pub fn load() -> Result<Self> {
        load_config()
    }

    /// Make this config the current global one
    pub fn make_current(self) -> Result<Arc<Self>> {
        let mut lock = CONFIG.write().map_err(|err| {
            crate::Error::String(format!(
                "Cannot load config, lock has been poisoned: {:?}",
                err
            ))
        })?;
        Ok(lock.insert(Arc::new(self)).clone())
    }
}

/// Get the current config, fetching it from disk if needed.
pub fn get_config() -> Result<Arc<Config>> {
    let lock = CONFIG.read().map_err(|err| {
        crate::Error::String(format!(
            "Cannot load config, lock has been poisoned: {:?}",
            err
        ))
    })?;
    if let Some(config) = &*lock {
        return Ok(config.clone());
    }
    drop(lock);

    // there is still a possible race condition here
    // where someone loads the config between the first check and
    // acquiring this lock, but the redundant work is still
    // less than not having a cache at all
    let config = load_config()?;
    config.make_current()
}

/// Load the engine configuration from disk, even if it's already been loaded.
///
/// This includes the system configuration and environment overrides, if they
/// exist; every value falls back to the built-in device layout.
pub fn load_config() -> Result<Config> {
    use config::{Config as RawConfig, Environment, File};

    let config = RawConfig::builder()
        .add_source(File::with_name("/etc/magicmount").required(false))
        .add_source(Environment::with_prefix("MM").separator("_"))
        .build()?;

    Ok(config.try_deserialize()?)
}
