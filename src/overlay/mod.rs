// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

//! The overlay tree and the magic-mount engine that realizes it as a
//! minimal set of bind mounts.
mod construct;
mod magic;
mod node;
mod skeleton;

pub use construct::construct_tree;
pub use magic::{magic_mount, Context};
pub use node::{split_vendor, Node, NodeStatus, NodeType};
pub use skeleton::clone_skeleton;
