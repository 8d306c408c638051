//! # Materialized Nodes
//!
//! A [`Node`] is the mutable, in-memory form of a branch or leaf page. It is
//! created by the owning bucket on first write (never during pure read
//! traversal) and shadows its page until the transaction resolves: commit
//! rewrites the node to a freshly allocated page, rollback simply drops it.
//!
//! Inodes hold owned copies of keys and values. The copy happens once, at
//! materialization, which is the price of letting a node outlive any
//! particular view of the map while staying mutable.

use eyre::{ensure, Result};

use crate::storage::{
    cast_prefix_mut, BranchPageElement, LeafPageElement, Page, PageMut, Pgid,
    BRANCH_ELEMENT_SIZE, BRANCH_PAGE_FLAG, LEAF_ELEMENT_SIZE, LEAF_PAGE_FLAG, PAGE_HEADER_SIZE,
};

/// One element of a materialized node: a key/value pair on a leaf, or a
/// separator key and child page id on a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub flags: u32,
    pub pgid: Pgid,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) pgid: Pgid,
    pub(crate) is_leaf: bool,
    pub(crate) parent: Option<Pgid>,
    pub(crate) inodes: Vec<Inode>,
}

impl Node {
    /// Materializes a page into a node. `parent` is the page id of the
    /// branch this node was reached through, or `None` for the root.
    pub fn read(page: Page<'_>, parent: Option<Pgid>) -> Node {
        let is_leaf = page.is_leaf();
        let inodes = if is_leaf {
            page.leaf_elements()
                .map(|elem| Inode {
                    flags: elem.flags,
                    pgid: 0,
                    key: elem.key.to_vec(),
                    value: elem.value.to_vec(),
                })
                .collect()
        } else {
            page.branch_elements()
                .map(|elem| Inode {
                    flags: 0,
                    pgid: elem.pgid,
                    key: elem.key.to_vec(),
                    value: Vec::new(),
                })
                .collect()
        };

        Node {
            pgid: page.id(),
            is_leaf,
            parent,
            inodes,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn pgid(&self) -> Pgid {
        self.pgid
    }

    pub fn parent(&self) -> Option<Pgid> {
        self.parent
    }

    pub fn inodes(&self) -> &[Inode] {
        &self.inodes
    }

    /// Serialized size in bytes, including the page header.
    pub fn size(&self) -> usize {
        let elem_size = if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        };
        self.inodes.iter().fold(PAGE_HEADER_SIZE, |acc, inode| {
            acc + elem_size + inode.key.len() + inode.value.len()
        })
    }

    /// Removes the inode with exactly `key`. Missing keys are a no-op.
    pub fn del(&mut self, key: &[u8]) {
        if let Ok(index) = self
            .inodes
            .binary_search_by(|inode| inode.key.as_slice().cmp(key))
        {
            self.inodes.remove(index);
        }
    }

    /// Serializes this node onto a page buffer. The caller sizes the buffer
    /// from [`Node::size`] and stamps id/overflow on the header.
    pub fn write(&self, page: &mut PageMut<'_>) -> Result<()> {
        ensure!(
            self.inodes.len() < 0xFFFF,
            "node with {} inodes exceeds the page element limit",
            self.inodes.len()
        );

        page.set_flags(if self.is_leaf {
            LEAF_PAGE_FLAG
        } else {
            BRANCH_PAGE_FLAG
        });
        page.set_count(self.inodes.len() as u16);
        if self.inodes.is_empty() {
            return Ok(());
        }

        let elem_size = if self.is_leaf {
            LEAF_ELEMENT_SIZE
        } else {
            BRANCH_ELEMENT_SIZE
        };
        let body = page.body_mut();
        ensure!(
            self.size() - PAGE_HEADER_SIZE <= body.len(),
            "node of {} bytes does not fit in {}-byte page body",
            self.size(),
            body.len()
        );

        // Element records first, then the packed key/value region.
        let mut koff = self.inodes.len() * elem_size;
        for (i, inode) in self.inodes.iter().enumerate() {
            let off = i * elem_size;
            if self.is_leaf {
                let elem: &mut LeafPageElement = cast_prefix_mut(&mut body[off..], "leaf element");
                elem.flags.set(inode.flags);
                elem.pos.set((koff - off) as u32);
                elem.ksize.set(inode.key.len() as u32);
                elem.vsize.set(inode.value.len() as u32);
            } else {
                let elem: &mut BranchPageElement =
                    cast_prefix_mut(&mut body[off..], "branch element");
                elem.pos.set((koff - off) as u32);
                elem.ksize.set(inode.key.len() as u32);
                elem.pgid.set(inode.pgid);
            }
            body[koff..koff + inode.key.len()].copy_from_slice(&inode.key);
            koff += inode.key.len();
            body[koff..koff + inode.value.len()].copy_from_slice(&inode.value);
            koff += inode.value.len();
        }

        Ok(())
    }
}
