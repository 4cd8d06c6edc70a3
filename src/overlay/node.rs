// Copyright (c) the magicmount contributors
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;

#[cfg(test)]
#[path = "./node_test.rs"]
mod node_test;

bitflags! {
    /// Status bits of an overlay node.
    ///
    /// Exactly one of DUMMY/INTER/SKEL/MODULE is a node's kind; VENDOR marks
    /// the placeholder left in the system tree after the vendor splinter.
    /// When two nodes collide on a path the higher bit wins, so module
    /// contributions rank MODULE > SKEL > INTER > DUMMY, and the placeholder
    /// sits above them all: the mirror always lists a vendor entry, and its
    /// dummy must never displace the placeholder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeStatus: u8 {
        /// Filler for an unchanged entry, mounted back from the mirror
        const DUMMY  = 0b00001;
        /// Directory that only contains descendants needing replacement
        const INTER  = 0b00010;
        /// Directory that must be rebuilt as a writable shadow
        const SKEL   = 0b00100;
        /// Content mounted straight from a module
        const MODULE = 0b01000;
        /// Vendor placeholder inside the system tree
        const VENDOR = 0b10000;
    }
}

impl NodeStatus {
    /// The node's precedence rank: its highest set bit.
    pub fn precedence(&self) -> u8 {
        let bits = self.bits();
        if bits == 0 {
            0
        } else {
            1 << (7 - bits.leading_zeros())
        }
    }
}

/// File type of an overlay node, as found in the module tree on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Dir,
    Reg,
    Lnk,
}

impl NodeType {
    /// Map a directory entry's type; other kinds have no overlay meaning.
    pub fn from_file_type(file_type: std::fs::FileType) -> Option<Self> {
        if file_type.is_symlink() {
            Some(Self::Lnk)
        } else if file_type.is_dir() {
            Some(Self::Dir)
        } else if file_type.is_file() {
            Some(Self::Reg)
        } else {
            None
        }
    }
}

/// A single entry in the overlay tree.
///
/// Nodes own their children; full paths are carried down each traversal
/// instead of being stored, except for roots whose name is their
/// slash-prefixed path (`/system`, `/vendor`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub kind: NodeType,
    pub status: NodeStatus,
    /// Module that contributed this node; meaningful only with MODULE set
    pub module: Option<String>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new<S: Into<String>>(name: S, kind: NodeType, status: NodeStatus) -> Self {
        Self {
            name: name.into(),
            kind,
            status,
            module: None,
            children: Vec::new(),
        }
    }

    pub fn new_module<S: Into<String>>(
        name: S,
        kind: NodeType,
        status: NodeStatus,
        module: &str,
    ) -> Self {
        Self {
            module: Some(module.to_string()),
            ..Self::new(name, kind, status)
        }
    }

    /// A fresh tree root; roots start out as plain intermediates.
    pub fn new_root(name: &str) -> Self {
        Self::new(name, NodeType::Dir, NodeStatus::INTER)
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Insert `child` under this node, honoring status precedence.
    ///
    /// A colliding sibling of strictly lower precedence is replaced in its
    /// slot (its whole subtree dropped); otherwise the incoming node is
    /// dropped and the sibling survives, so ties keep the first insertion.
    /// Returns the index of the effective child either way.
    pub fn insert(&mut self, child: Node) -> usize {
        match self
            .children
            .iter()
            .position(|existing| existing.name == child.name)
        {
            Some(index) => {
                if child.status.precedence() > self.children[index].status.precedence() {
                    self.children[index] = child;
                }
                index
            }
            None => {
                self.children.push(child);
                self.children.len() - 1
            }
        }
    }
}

/// Extract the vendor subtree out of the system root.
///
/// The original `vendor` child is replaced in place by a placeholder
/// carrying VENDOR status and the live type of `/system/vendor` (a symlink
/// on devices with a separate vendor partition, a directory otherwise).
/// The extracted subtree is re-rooted as `/vendor` and returned so it can
/// be magic-mounted on its own.
pub fn split_vendor(sys_root: &mut Node, separate_vendor: bool) -> Option<Node> {
    let index = sys_root
        .children
        .iter()
        .position(|child| child.name == "vendor")?;
    let kind = if separate_vendor {
        NodeType::Lnk
    } else {
        NodeType::Dir
    };
    let placeholder = Node::new("vendor", kind, NodeStatus::VENDOR);
    let mut vendor = std::mem::replace(&mut sys_root.children[index], placeholder);
    vendor.name = "/vendor".to_string();
    Some(vendor)
}
