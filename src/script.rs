// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! Script execution for the boot stages.
use std::path::Path;
use std::process::Command;

use crate::modules::Module;

#[cfg(test)]
#[path = "./script_test.rs"]
mod script_test;

/// Run every executable script staged for `stage` under the core directory.
///
/// Scripts run one at a time through the configured shell and are waited
/// on; order is the filesystem's enumeration order. A missing stage
/// directory means nothing to run.
pub fn exec_common_script(shell: &Path, core_dir: &Path, stage: &str) {
    use faccess::PathExt;

    let stage_dir = core_dir.join(format!("{stage}.d"));
    let dir = match std::fs::read_dir(&stage_dir) {
        Ok(dir) => dir,
        Err(_) => return,
    };
    for entry in dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(?stage_dir, ?err, "unreadable script entry");
                continue;
            }
        };
        match entry.file_type() {
            Ok(file_type) if file_type.is_file() => (),
            _ => continue,
        }
        let script = entry.path();
        if !script.executable() {
            continue;
        }
        tracing::info!(stage = %stage, script = ?entry.file_name(), "exec common script");
        run_script(shell, &script);
    }
}

/// Run each enabled module's script for `stage`, if it ships one.
pub fn exec_module_script(shell: &Path, modules: &[Module], stage: &str) {
    for module in modules {
        let script = module.script(stage);
        if !script.exists() {
            continue;
        }
        tracing::info!(module = %module.name, stage = %stage, "exec module script");
        run_script(shell, &script);
    }
}

fn run_script(shell: &Path, script: &Path) {
    match Command::new(shell).arg(script).status() {
        Ok(status) if !status.success() => {
            tracing::warn!(?script, %status, "script exited nonzero")
        }
        Ok(_) => (),
        Err(err) => tracing::warn!(?script, ?err, "failed to run script"),
    }
}
