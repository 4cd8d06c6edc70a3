// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use rstest::rstest;

use super::{scan, Module};

fixtures!();

#[rstest]
fn test_scan_filters_modules(tmpdir: TempDir) {
    let root = tmpdir.path();
    ensure(root.join("alpha/module.prop"), "");
    ensure(root.join("beta/disable"), "");
    ensure(root.join("gamma/remove"), "");
    ensure(root.join(".core/post-fs-data.d/x.sh"), "");
    ensure(root.join("lost+found/junk"), "");
    ensure(root.join("stray_file"), "not a module");

    let mut modules = scan(root).unwrap();
    modules.sort_by(|a, b| a.name.cmp(&b.name));

    let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["alpha"]);
    // the removed module is gone from disk entirely
    assert!(!root.join("gamma").exists());
    // reserved directories are untouched
    assert!(root.join(".core").exists());
}

#[rstest]
fn test_module_flags(tmpdir: TempDir) {
    let root = tmpdir.path();
    ensure(root.join("alpha/auto_mount"), "");
    ensure(root.join("alpha/system/etc/hosts"), "");
    ensure(root.join("alpha/system.prop"), "a=b");
    ensure(root.join("alpha/post-fs-data.sh"), "#!/bin/sh");

    let module = Module::new(root, "alpha");
    assert!(module.auto_mount());
    assert!(!module.disabled());
    assert!(module.system_dir().is_dir());
    assert!(module.prop_file().is_file());
    assert!(module.script("post-fs-data").is_file());
    assert!(!module.script("service").exists());
}

#[rstest]
fn test_ensure_vendor_link(tmpdir: TempDir) {
    let root = tmpdir.path();
    ensure(root.join("delta/system/vendor/lib/x.so"), "lib");

    let module = Module::new(root, "delta");
    module.ensure_vendor_link().unwrap();

    let link = std::fs::read_link(root.join("delta/vendor")).unwrap();
    assert_eq!(link, root.join("delta/system/vendor"));
    // vendor sources resolve through the link
    assert!(root.join("delta/vendor/lib/x.so").exists());

    // a stale entry is replaced
    module.ensure_vendor_link().unwrap();
}
