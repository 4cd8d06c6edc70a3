// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use rstest::rstest;

use super::Config;

#[rstest]
fn test_config_defaults() {
    let config = Config::default();
    assert_eq!(
        config.filesystem.core,
        config.filesystem.module_root.join(".core"),
        "the core directory lives inside the active image"
    );
    assert!(config.sentinels.unblock.starts_with("/dev"));
    assert_eq!(config.exec.install_retry_secs, 5);
    assert!(config.exec.debug_log.is_none());
}

#[rstest]
fn test_config_roundtrip() {
    let config = Config::default();
    let serialized = serde_json::to_value(&config);
    // the config crate feeds deserialization from arbitrary sources, so
    // every field must also serialize cleanly
    assert!(serialized.is_ok());
}
