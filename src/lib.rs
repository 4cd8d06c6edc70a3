// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-stage module overlay engine.
//!
//! Stitches user-supplied module trees over an unmodified read-only base
//! system so that the merged view appears as the native filesystem. The
//! illusion is built entirely out of bind mounts; no file on the base
//! partitions is ever altered.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
#[macro_use]
mod fixtures;

pub mod config;
pub mod env;
mod error;
pub mod filesystem;
pub mod image;
pub mod modules;
pub mod overlay;
pub mod props;
pub mod script;
pub mod simple;
pub mod stages;

pub use config::{get_config, load_config, Config};
pub use error::{Error, Result};
pub use stages::{BootStages, Hooks};
