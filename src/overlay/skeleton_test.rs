// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use rstest::rstest;

use super::super::{Node, NodeStatus, NodeType};
use super::clone_skeleton;

fixtures!();

#[rstest]
fn test_skeleton_aliases_unchanged_entries(tmpdir: TempDir) {
    let root = tmpdir.path();
    ensure(root.join("mirror/system/etc/bar.conf"), "stock");
    ensure(root.join("live/system/etc/bar.conf"), "stock");
    ensure(root.join("modules/a/system/etc/foo.conf"), "module");

    let layout = Layout::new(root);
    let mounter = RecordingMounter::default();
    let cx = layout.context(&mounter);

    let mut etc = Node::new("etc", NodeType::Dir, NodeStatus::INTER | NodeStatus::SKEL);
    etc.insert(Node::new_module(
        "foo.conf",
        NodeType::Reg,
        NodeStatus::MODULE,
        "a",
    ));

    clone_skeleton(&cx, &mut etc, Path::new("/system/etc")).unwrap();

    // the mirror entry arrived as a dummy child alongside the module file
    assert_eq!(etc.child("bar.conf").unwrap().status, NodeStatus::DUMMY);
    assert_eq!(etc.child("foo.conf").unwrap().status, NodeStatus::MODULE);

    let expected: std::collections::HashSet<_> = vec![
        (root.join("shadow/system/etc"), root.join("live/system/etc")),
        (
            root.join("mirror/system/etc/bar.conf"),
            root.join("live/system/etc/bar.conf"),
        ),
        (
            root.join("modules/a/system/etc/foo.conf"),
            root.join("live/system/etc/foo.conf"),
        ),
    ]
    .into_iter()
    .collect();
    assert_eq!(mounter.bind_set(), expected);

    // both children were materialized in the shadow as plain files
    assert!(root.join("shadow/system/etc/bar.conf").is_file());
    assert!(root.join("shadow/system/etc/foo.conf").is_file());
}

#[rstest]
fn test_module_dummy_collision_prefers_module(tmpdir: TempDir) {
    let root = tmpdir.path();
    ensure(root.join("mirror/system/etc/hosts"), "stock");
    ensure(root.join("live/system/etc/hosts"), "stock");
    ensure(root.join("modules/a/system/etc/hosts"), "module");

    let layout = Layout::new(root);
    let mounter = RecordingMounter::default();
    let cx = layout.context(&mounter);

    let mut etc = Node::new("etc", NodeType::Dir, NodeStatus::SKEL);
    etc.insert(Node::new_module(
        "hosts",
        NodeType::Reg,
        NodeStatus::MODULE,
        "a",
    ));

    clone_skeleton(&cx, &mut etc, Path::new("/system/etc")).unwrap();

    // the mirror's hosts dummy lost to the module contribution
    assert_eq!(etc.children.len(), 1);
    assert!(mounter.bind_set().contains(&(
        root.join("modules/a/system/etc/hosts"),
        root.join("live/system/etc/hosts"),
    )));
    assert_eq!(mounter.bind_count(), 2);
}

#[rstest]
fn test_symlinks_are_copied_not_mounted(tmpdir: TempDir) {
    let root = tmpdir.path();
    ensure(root.join("mirror/system/bin/tool"), "stock tool");
    ensure(root.join("live/system/bin/tool"), "stock tool");
    std::fs::create_dir_all(root.join("modules/c/system/bin")).unwrap();
    std::os::unix::fs::symlink("tool", root.join("modules/c/system/bin/link")).unwrap();

    let layout = Layout::new(root);
    let mounter = RecordingMounter::default();
    let cx = layout.context(&mounter);

    let mut bin = Node::new("bin", NodeType::Dir, NodeStatus::INTER | NodeStatus::SKEL);
    bin.insert(Node::new_module(
        "link",
        NodeType::Lnk,
        NodeStatus::MODULE,
        "c",
    ));

    clone_skeleton(&cx, &mut bin, Path::new("/system/bin")).unwrap();

    // the link was materialized inside the shadow, not bind-mounted
    let copied = std::fs::read_link(root.join("shadow/system/bin/link")).unwrap();
    assert_eq!(copied, std::path::PathBuf::from("tool"));
    let expected: std::collections::HashSet<_> = vec![
        (root.join("shadow/system/bin"), root.join("live/system/bin")),
        (
            root.join("mirror/system/bin/tool"),
            root.join("live/system/bin/tool"),
        ),
    ]
    .into_iter()
    .collect();
    assert_eq!(mounter.bind_set(), expected);
}

#[rstest]
fn test_vendor_placeholder_link_is_restored(tmpdir: TempDir) {
    let root = tmpdir.path();
    // a separate-vendor device: the stock /system/vendor is a symlink, and
    // the splinter left a LNK placeholder in the system root
    ensure(root.join("mirror/system/build.prop"), "stock");
    std::os::unix::fs::symlink("/vendor", root.join("mirror/system/vendor")).unwrap();
    ensure(root.join("live/system/build.prop"), "stock");
    std::os::unix::fs::symlink("/vendor", root.join("live/system/vendor")).unwrap();
    ensure(root.join("modules/a/system/newfile"), "module");

    let layout = Layout::new(root);
    let mounter = RecordingMounter::default();
    let cx = layout.context(&mounter);

    let mut sys_root = Node::new(
        "/system",
        NodeType::Dir,
        NodeStatus::INTER | NodeStatus::SKEL,
    );
    sys_root.insert(Node::new_module(
        "newfile",
        NodeType::Reg,
        NodeStatus::MODULE,
        "a",
    ));
    sys_root.insert(Node::new("vendor", NodeType::Lnk, NodeStatus::VENDOR));

    clone_skeleton(&cx, &mut sys_root, Path::new("/system")).unwrap();

    // the mirror's vendor entry did not displace the placeholder
    assert_eq!(
        sys_root.child("vendor").unwrap().status,
        NodeStatus::VENDOR
    );
    // the stock link was copied onto the overlay, not bind-mounted
    let restored = std::fs::read_link(root.join("live/system/vendor")).unwrap();
    assert_eq!(restored, PathBuf::from("/vendor"));
    let expected: std::collections::HashSet<_> = vec![
        (root.join("shadow/system"), root.join("live/system")),
        (
            root.join("mirror/system/build.prop"),
            root.join("live/system/build.prop"),
        ),
        (
            root.join("modules/a/system/newfile"),
            root.join("live/system/newfile"),
        ),
    ]
    .into_iter()
    .collect();
    assert_eq!(mounter.bind_set(), expected);
}

#[rstest]
fn test_vendor_placeholder_dir_needs_no_mount(tmpdir: TempDir) {
    let root = tmpdir.path();
    // unified vendor: the stock /system/vendor is a real directory and the
    // placeholder is a DIR, so the cloner only leaves a shadow entry
    ensure(root.join("mirror/system/vendor/lib/y.so"), "stock");
    ensure(root.join("live/system/vendor/lib/y.so"), "stock");
    ensure(root.join("modules/a/system/newfile"), "module");

    let layout = Layout::new(root);
    let mounter = RecordingMounter::default();
    let cx = layout.context(&mounter);

    let mut sys_root = Node::new(
        "/system",
        NodeType::Dir,
        NodeStatus::INTER | NodeStatus::SKEL,
    );
    sys_root.insert(Node::new_module(
        "newfile",
        NodeType::Reg,
        NodeStatus::MODULE,
        "a",
    ));
    sys_root.insert(Node::new("vendor", NodeType::Dir, NodeStatus::VENDOR));

    clone_skeleton(&cx, &mut sys_root, Path::new("/system")).unwrap();

    // the placeholder got its shadow directory but no mount of its own;
    // the split /vendor root owns everything underneath
    assert!(root.join("shadow/system/vendor").is_dir());
    let expected: std::collections::HashSet<_> = vec![
        (root.join("shadow/system"), root.join("live/system")),
        (
            root.join("modules/a/system/newfile"),
            root.join("live/system/newfile"),
        ),
    ]
    .into_iter()
    .collect();
    assert_eq!(mounter.bind_set(), expected);
    // the stock directory on the live path was left alone
    assert!(root.join("live/system/vendor/lib/y.so").is_file());
}

#[rstest]
fn test_missing_mirror_skips_the_clone(tmpdir: TempDir) {
    let root = tmpdir.path();
    let layout = Layout::new(root);
    let mounter = RecordingMounter::default();
    let cx = layout.context(&mounter);

    let mut node = Node::new("etc", NodeType::Dir, NodeStatus::SKEL);
    clone_skeleton(&cx, &mut node, Path::new("/system/etc")).unwrap();

    assert_eq!(mounter.bind_count(), 0);
    assert!(!root.join("shadow/system/etc").exists());
}
