// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rstest::rstest;

use super::{exec_common_script, exec_module_script};
use crate::modules::Module;

fixtures!();

fn make_executable(path: &Path) {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[rstest]
fn test_exec_common_script_runs_executables(tmpdir: TempDir) {
    let core = tmpdir.path().join("core");
    let marker = tmpdir.path().join("ran");
    ensure(
        core.join("post-fs-data.d/touch.sh"),
        &format!("#!/bin/sh\ntouch {}\n", marker.display()),
    );
    make_executable(&core.join("post-fs-data.d/touch.sh"));
    // a non-executable file is skipped
    let skipped = tmpdir.path().join("skipped");
    ensure(
        core.join("post-fs-data.d/silent.sh"),
        &format!("#!/bin/sh\ntouch {}\n", skipped.display()),
    );

    exec_common_script(Path::new("/bin/sh"), &core, "post-fs-data");

    assert!(marker.exists());
    assert!(!skipped.exists());
}

#[rstest]
fn test_exec_common_script_missing_stage_dir(tmpdir: TempDir) {
    // nothing staged: nothing to run, nothing to fail
    exec_common_script(Path::new("/bin/sh"), tmpdir.path(), "service");
}

#[rstest]
fn test_exec_module_script(tmpdir: TempDir) {
    let root = tmpdir.path();
    let marker = root.join("alpha_ran");
    ensure(
        root.join("alpha/service.sh"),
        &format!("#!/bin/sh\ntouch {}\n", marker.display()),
    );
    ensure(root.join("beta/module.prop"), "");

    let modules = vec![Module::new(root, "alpha"), Module::new(root, "beta")];
    exec_module_script(Path::new("/bin/sh"), &modules, "service");

    assert!(marker.exists());
}
