// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! The boot-stage driver: sequences post-fs, post-fs-data and late-start,
//! and owns the state that crosses them.
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::env::{self, Mounter, SysMounter};
use crate::image::{self, Ext4Images, ImageOps};
use crate::modules::{self, Module};
use crate::overlay::{construct_tree, magic_mount, split_vendor, Context, Node};
use crate::props::{self, PropertyStore, SystemProperties};
use crate::{filesystem, script, simple, Result};

#[cfg(test)]
#[path = "./stages_test.rs"]
mod stages_test;

/// Collaborators owned by the embedding daemon.
///
/// The engine decides when these run but not what they do: log monitoring,
/// the hide subsystem and SELinux policy patching are separate subsystems.
#[derive(Default)]
pub struct Hooks {
    /// Starts the log monitor
    pub log_monitor: Option<Box<dyn Fn() + Send + Sync>>,
    /// Launches the hide subsystem; spawned detached at post-fs-data
    pub start_hide: Option<Box<dyn FnOnce() + Send + 'static>>,
    /// Completion handle for SELinux policy patching, joined at late-start
    pub sepolicy_patch: Option<thread::JoinHandle<()>>,
}

/// Sequences the boot stages.
///
/// Every entry point acknowledges its client first, runs to completion or
/// to the first stage-fatal error, and leaves the boot unblocked either
/// way. Partial overlays are never rolled back; the platform reboots on
/// anything worse.
pub struct BootStages {
    config: Arc<Config>,
    mounter: Box<dyn Mounter>,
    images: Box<dyn ImageOps>,
    props: Box<dyn PropertyStore>,
    hooks: Hooks,
    /// Enabled modules, loaded at post-fs-data and used through late-start
    modules: Vec<Module>,
    /// Root the overlay is applied to; only tests relocate it
    live_root: PathBuf,
    assume_data_ready: bool,
    debug_log: Option<std::process::Child>,
}

impl BootStages {
    pub fn new(config: Arc<Config>, hooks: Hooks) -> Self {
        Self::with_collaborators(
            config,
            Box::new(SysMounter),
            Box::new(Ext4Images),
            Box::new(SystemProperties),
            hooks,
        )
    }

    /// Build a driver with explicit collaborators (tests, other platforms).
    pub fn with_collaborators(
        config: Arc<Config>,
        mounter: Box<dyn Mounter>,
        images: Box<dyn ImageOps>,
        props: Box<dyn PropertyStore>,
        hooks: Hooks,
    ) -> Self {
        Self {
            config,
            mounter,
            images,
            props,
            hooks,
            modules: Vec::new(),
            live_root: PathBuf::from("/"),
            assume_data_ready: false,
            debug_log: None,
        }
    }

    /// Apply the overlay somewhere other than `/`.
    pub fn with_live_root(mut self, live_root: PathBuf) -> Self {
        self.live_root = live_root;
        self
    }

    /// Skip the data-partition readiness probe.
    pub fn assume_data_ready(mut self) -> Self {
        self.assume_data_ready = true;
        self
    }

    /// The enabled-module list as of the last post-fs-data run.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    // A single integer acknowledgement; nothing else crosses the boundary.
    fn ack(client: &mut impl Write) {
        if let Err(err) = client.write_all(&0_i32.to_ne_bytes()) {
            tracing::warn!(?err, "failed to acknowledge client");
        }
    }

    /// Create the boot-continuation sentinel, once per boot.
    fn unblock(&self) {
        let unblock = &self.config.sentinels.unblock;
        if unblock.exists() {
            return;
        }
        tracing::info!(?unblock, "unblocking boot");
        if let Err(err) = filesystem::touch(unblock) {
            tracing::error!(?err, "failed to unblock boot");
        }
    }

    pub fn post_fs(&mut self, mut client: impl Write) {
        if let Some(monitor) = &self.hooks.log_monitor {
            monitor();
        }
        tracing::info!("** post-fs mode running");
        Self::ack(&mut client);
        drop(client);

        if let Err(err) = self.post_fs_inner() {
            tracing::error!(?err, "post-fs failed");
        }
        self.unblock();
    }

    fn post_fs_inner(&mut self) -> Result<()> {
        let sentinels = &self.config.sentinels;
        if sentinels.uninstaller.exists() || sentinels.disable.exists() {
            return Ok(());
        }
        let cache = self.config.filesystem.cache_stage.clone();
        simple::simple_mount(
            self.mounter.as_ref(),
            &cache,
            &self.live_root,
            Path::new("/system"),
        )?;
        simple::simple_mount(
            self.mounter.as_ref(),
            &cache,
            &self.live_root,
            Path::new("/vendor"),
        )?;
        Ok(())
    }

    pub fn post_fs_data(&mut self, mut client: impl Write) {
        if self.config.sentinels.late_logmon.exists() {
            if let Some(monitor) = &self.hooks.log_monitor {
                monitor();
            }
        }
        Self::ack(&mut client);
        drop(client);

        if !self.data_ready() {
            tracing::warn!("data is not ready, nothing to do");
            self.unblock();
            return;
        }
        self.start_debug_log();
        tracing::info!("** post-fs-data mode running");

        if self.config.sentinels.uninstaller.exists() {
            self.unblock();
            self.launch_uninstaller();
            return;
        }

        if let Err(err) = self.post_fs_data_inner() {
            tracing::error!(?err, "post-fs-data failed");
        }
        self.unblock();
    }

    fn data_ready(&self) -> bool {
        if self.assume_data_ready {
            return true;
        }
        match env::read_mount_table() {
            Ok(table) => env::data_ready(&table),
            Err(err) => {
                tracing::warn!(?err, "cannot read the mount table");
                false
            }
        }
    }

    fn post_fs_data_inner(&mut self) -> Result<()> {
        let config = self.config.clone();
        let fs = &config.filesystem;

        self.relocate_staged_binaries();
        self.relocate_stock_boot();

        // merge staged images; either failing is stage-fatal
        for staged in [&fs.cache_image, &fs.merge_image] {
            image::merge_images(
                self.images.as_ref(),
                staged,
                &fs.main_image,
                &fs.source_stage,
                &fs.target_stage,
            )
            .map_err(|err| {
                err.wrap(format!(
                    "Image merge {:?} -> {:?} failed",
                    staged, fs.main_image
                ))
            })?;
        }

        let mut new_image = false;
        if !fs.main_image.exists() {
            self.images.create(&fs.main_image, 64)?;
            new_image = true;
        }

        tracing::info!(image = ?fs.main_image, "mounting the active image");
        let image_loop = self.images.mount(&fs.main_image, &fs.module_root)?;

        if new_image {
            for dir in [
                fs.core.clone(),
                fs.core.join("post-fs-data.d"),
                fs.core.join("service.d"),
                fs.core.join("props"),
            ] {
                filesystem::makedirs_with_perms(&dir, 0o755)?;
            }
        }

        tracing::info!("running post-fs-data.d scripts");
        script::exec_common_script(&config.exec.shell, &fs.core, "post-fs-data");

        if config.sentinels.disable.exists() {
            return self.core_only();
        }

        tracing::info!("loading modules");
        self.modules = modules::scan(&fs.module_root)?;
        let cx = Context {
            module_root: &fs.module_root,
            mirror: &fs.mirror,
            shadow: &fs.shadow,
            live_root: &self.live_root,
            mounter: self.mounter.as_ref(),
        };
        let mut sys_root = Node::new_root("/system");
        let mut has_modules = false;
        for module in &self.modules {
            let prop_file = module.prop_file();
            if prop_file.exists() {
                tracing::info!(module = %module.name, "loading system.prop");
                if let Err(err) = props::load_prop_file(self.props.as_ref(), &prop_file) {
                    tracing::warn!(module = %module.name, ?err, "failed to load properties");
                }
            }
            if !module.auto_mount() || !module.system_dir().exists() {
                continue;
            }
            tracing::info!(module = %module.name, "constructing overlay tree");
            has_modules = true;
            if module.system_dir().join("vendor").exists() {
                if let Err(err) = module.ensure_vendor_link() {
                    tracing::warn!(module = %module.name, ?err, "failed to link vendor");
                }
            }
            construct_tree(&cx, &module.name, &mut sys_root, Path::new("/system"));
        }

        // trim the image down to the modules that actually remain enabled,
        // then bring it back for script and mount sources
        self.images.unmount(&fs.module_root, &image_loop)?;
        image::trim_image(self.images.as_ref(), &fs.main_image)?;
        self.images.mount(&fs.main_image, &fs.module_root)?;

        if has_modules {
            tracing::info!("mounting system and vendor mirrors");
            let table = env::read_mount_table()?;
            let mirrors = env::mount_mirrors(&fs.mirror, self.mounter.as_ref(), &table)?;

            let ven_root = split_vendor(&mut sys_root, mirrors.separate_vendor);
            magic_mount(&cx, &mut sys_root, Path::new("/system"))?;
            if let Some(mut ven_root) = ven_root {
                magic_mount(&cx, &mut ven_root, Path::new("/vendor"))?;
            }
        }

        tracing::info!("running module post-fs-data scripts");
        script::exec_module_script(&config.exec.shell, &self.modules, "post-fs-data");

        self.core_only()
    }

    /// The tail every post-fs-data run shares: systemless hosts and the
    /// hide subsystem run even when modules are disabled.
    fn core_only(&mut self) -> Result<()> {
        let sentinels = &self.config.sentinels;
        if sentinels.hosts.exists() {
            tracing::info!("enabling systemless hosts support");
            let target = self.live_root.join("system/etc/hosts");
            self.mounter.bind(&sentinels.hosts, &target)?;
        }

        // hide stays on unless the property is explicitly "0"
        let disabled = matches!(
            self.props.get(&self.config.props.hide),
            Some(value) if value == "0"
        );
        if !disabled {
            if let Some(start_hide) = self.hooks.start_hide.take() {
                let spawned = thread::Builder::new()
                    .name("hide".to_string())
                    .spawn(move || start_hide());
                match spawned {
                    Ok(_) => tracing::info!("hide subsystem launched"),
                    Err(err) => tracing::warn!(?err, "failed to launch hide subsystem"),
                }
            }
        }
        Ok(())
    }

    pub fn late_start(&mut self, mut client: impl Write) {
        tracing::info!("** late-start service mode running");
        Self::ack(&mut client);
        drop(client);

        // scripts are only reliable once the policy patch has landed
        if let Some(patch) = self.hooks.sepolicy_patch.take() {
            if patch.join().is_err() {
                tracing::warn!("policy patch thread panicked");
            }
        }

        tracing::info!("running service.d scripts");
        script::exec_common_script(
            &self.config.exec.shell,
            &self.config.filesystem.core,
            "service",
        );

        if self.config.sentinels.disable.exists() {
            if let Err(err) = self.props.set(&self.config.props.disable_marker, "1") {
                tracing::warn!(?err, "failed to mark modules disabled");
            }
            return;
        }

        tracing::info!("running module service scripts");
        script::exec_module_script(&self.config.exec.shell, &self.modules, "service");

        if self.config.sentinels.manager_apk.exists() {
            self.install_manager();
        }

        // the boot is done with us, drop everything that crossed the stages
        self.modules = Vec::new();
        if let Some(mut child) = self.debug_log.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Keep trying to install the staged manager package until the package
    /// manager daemon is up; pm reports readiness by not failing.
    fn install_manager(&self) {
        let apk = &self.config.sentinels.manager_apk;
        let command = format!(
            "CLASSPATH=/system/framework/pm.jar \
             /system/bin/app_process /system/bin \
             com.android.commands.pm.Pm install -r {}",
            apk.display()
        );
        loop {
            thread::sleep(std::time::Duration::from_secs(
                self.config.exec.install_retry_secs,
            ));
            let output = match Command::new(&self.config.exec.shell)
                .arg("-c")
                .arg(&command)
                .output()
            {
                Ok(output) => output,
                Err(err) => {
                    tracing::warn!(?err, "failed to invoke the package manager");
                    continue;
                }
            };
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.contains("Error:") {
                tracing::info!("manager package installed");
                break;
            }
        }
        if let Err(err) = std::fs::remove_file(apk) {
            tracing::warn!(?err, "failed to drop the staged manager package");
        }
    }

    /// Hand the rest of the boot to the uninstaller, detached.
    fn launch_uninstaller(&self) {
        let script = &self.config.sentinels.uninstaller;
        let result = Command::new(&self.config.exec.shell)
            .arg(script)
            .env("BOOTMODE", "true")
            .spawn();
        match result {
            Ok(child) => tracing::info!(?script, pid = child.id(), "uninstaller launched"),
            Err(err) => tracing::error!(?script, ?err, "failed to launch uninstaller"),
        }
    }

    /// Adopt binaries staged by the installer while data was sealed.
    fn relocate_staged_binaries(&self) {
        let stages = [
            &self.config.sentinels.data_bin_stage,
            &self.config.sentinels.inject_stage,
        ];
        for stage in stages {
            if !stage.exists() {
                continue;
            }
            tracing::info!(?stage, "adopting staged binaries");
            if let Err(err) = filesystem::remove_all(&self.config.filesystem.data_bin) {
                tracing::warn!(?err, "failed to clear the binaries directory");
                continue;
            }
            if let Err(err) = std::fs::rename(stage, &self.config.filesystem.data_bin) {
                tracing::warn!(?stage, ?err, "failed to adopt staged binaries");
            }
        }
    }

    /// Stock boot images saved by the installer move up next to the data
    /// root where recovery tooling expects them.
    fn relocate_stock_boot(&self) {
        let data_bin = &self.config.filesystem.data_bin;
        let parent = match data_bin.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return,
        };
        let dir = match std::fs::read_dir(data_bin) {
            Ok(dir) => dir,
            Err(_) => return,
        };
        for entry in dir.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("stock_boot") {
                continue;
            }
            let dest = parent.join(&name);
            if let Err(err) = std::fs::rename(entry.path(), &dest) {
                tracing::warn!(?name, ?err, "failed to relocate stock boot image");
            }
        }
    }

    fn start_debug_log(&mut self) {
        let path = match &self.config.exec.debug_log {
            Some(path) => path.clone(),
            None => return,
        };
        if self.debug_log.is_some() {
            return;
        }
        let file = match std::fs::File::create(&path) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(?path, ?err, "cannot open the debug log");
                return;
            }
        };
        let child = Command::new("logcat")
            .args(["-v", "brief"])
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .spawn();
        match child {
            Ok(child) => self.debug_log = Some(child),
            Err(err) => tracing::warn!(?err, "failed to start the debug logcat"),
        }
    }
}
