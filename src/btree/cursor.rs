//! # Cursor Traversal
//!
//! A [`Cursor`] is a positioned iterator over one B+tree. It keeps a
//! root-to-leaf stack of [`ElemRef`] frames; the top frame is the current
//! position and every frame below records which child was descended into,
//! which is what lets `next` and `prev` move sideways without restarting
//! from the root.
//!
//! ## Page/Node Duality
//!
//! Each frame points at either a mapped page or a materialized node
//! ([`PageNode`]), resolved through the bucket at descent time. The node, if
//! one exists, always wins: a transaction that deleted through one cursor
//! sees the deletion through another the moment it repositions.
//!
//! ## Search Policy
//!
//! Branch keys are separators: each holds the smallest key of its subtree,
//! so branch descent picks the *rightmost* element whose key is less than
//! or equal to the search key. Leaves hold the keys themselves, so the leaf
//! search lands on the *leftmost* element greater than or equal to the
//! search key (possibly one past the end, which `seek` resolves by stepping
//! to the next leaf).
//!
//! ## Failure Semantics
//!
//! Misuse (closed or read-only transaction, deleting a nested-tree element)
//! comes back as a typed [`Error`]. Structural impossibilities, like a page
//! that is neither branch nor leaf on the descent path or a branch where a
//! leaf has to be, panic.

use std::cell::RefCell;
use std::rc::Rc;

use eyre::Result;
use smallvec::SmallVec;

use super::node::Node;
use crate::bucket::Bucket;
use crate::error::Error;
use crate::storage::{Page, Pgid, BRANCH_PAGE_FLAG, BUCKET_LEAF_FLAG, LEAF_PAGE_FLAG};

/// A key paired with its value, or with `None` when the element is a
/// nested-tree reference.
pub type Entry = (Vec<u8>, Option<Vec<u8>>);

type RawEntry = (Vec<u8>, Vec<u8>, u32);

/// The authoritative backing of one cursor frame: a materialized node when
/// the transaction has dirtied the page, the mapped page otherwise.
#[derive(Clone)]
pub enum PageNode<'tx> {
    Page(Page<'tx>),
    Node(Rc<RefCell<Node>>),
}

/// One cursor stack frame: a page-or-node plus the element index the cursor
/// is at (or descended through).
pub struct ElemRef<'tx> {
    pub(crate) upper: PageNode<'tx>,
    pub(crate) index: usize,
}

impl<'tx> ElemRef<'tx> {
    pub fn is_leaf(&self) -> bool {
        match &self.upper {
            PageNode::Node(n) => n.borrow().is_leaf,
            PageNode::Page(p) => p.is_leaf(),
        }
    }

    pub fn count(&self) -> usize {
        match &self.upper {
            PageNode::Node(n) => n.borrow().inodes.len(),
            PageNode::Page(p) => p.count(),
        }
    }

    /// Child page id at the current index. Branch frames only.
    fn child_pgid(&self) -> Pgid {
        match &self.upper {
            PageNode::Node(n) => n.borrow().inodes[self.index].pgid,
            PageNode::Page(p) => p.branch_element(self.index).pgid,
        }
    }
}

pub struct Cursor<'tx> {
    bucket: &'tx Bucket,
    stack: SmallVec<[ElemRef<'tx>; 8]>,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(bucket: &'tx Bucket) -> Cursor<'tx> {
        Cursor {
            bucket,
            stack: SmallVec::new(),
        }
    }

    /// Positions the cursor at the first element of the tree.
    /// Returns `None` for an empty tree.
    pub fn first(&mut self) -> Result<Option<Entry>> {
        self.check_open()?;
        self.stack.clear();
        let pn = self.bucket.page_node(self.bucket.root())?;
        self.stack.push(ElemRef {
            upper: pn,
            index: 0,
        });
        self.descend_first()?;

        // Deletions can leave an empty leaf on the left edge.
        if self.top().count() == 0 {
            self.next_leaf()?;
        }

        Ok(emit(self.key_value()))
    }

    /// Positions the cursor at the last element of the tree.
    pub fn last(&mut self) -> Result<Option<Entry>> {
        self.check_open()?;
        self.stack.clear();
        let pn = self.bucket.page_node(self.bucket.root())?;
        let mut elem = ElemRef {
            upper: pn,
            index: 0,
        };
        elem.index = elem.count().saturating_sub(1);
        self.stack.push(elem);
        self.descend_last()?;
        Ok(emit(self.key_value()))
    }

    /// Moves to the next element. Once the cursor is exhausted it stays on
    /// the last element and keeps returning `None`.
    pub fn next(&mut self) -> Result<Option<Entry>> {
        self.check_open()?;
        let kv = self.next_leaf()?;
        Ok(emit(kv))
    }

    /// Moves to the previous element, or returns `None` at the beginning.
    pub fn prev(&mut self) -> Result<Option<Entry>> {
        self.check_open()?;

        // Pop exhausted frames, then step the first frame that can move.
        while !self.stack.is_empty() {
            let last = self.stack.len() - 1;
            if self.stack[last].index > 0 {
                self.stack[last].index -= 1;
                break;
            }
            self.stack.pop();
        }
        if self.stack.is_empty() {
            return Ok(None);
        }

        self.descend_last()?;
        Ok(emit(self.key_value()))
    }

    /// Positions the cursor at `key`, or at the smallest key greater than it
    /// when `key` is absent. Returns `None` when no key remains.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry>> {
        self.check_open()?;
        let mut kv = self.seek_to(key)?;

        // The landing leaf may hold only keys smaller than the target.
        let past_end = self
            .stack
            .last()
            .is_some_and(|elem| elem.index >= elem.count());
        if past_end {
            kv = self.next_leaf()?;
        }

        Ok(emit(kv))
    }

    /// Removes the element under the cursor from the tree.
    pub fn delete(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.bucket.writable() {
            return Err(Error::TxNotWritable.into());
        }

        let Some((key, _, flags)) = self.key_value() else {
            return Ok(());
        };
        if flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue.into());
        }

        let node = self.leaf_node()?;
        node.borrow_mut().del(&key);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.bucket.is_open() {
            return Err(Error::TxClosed.into());
        }
        Ok(())
    }

    fn top(&self) -> &ElemRef<'tx> {
        self.stack.last().expect("cursor stack is empty")
    }

    fn top_mut(&mut self) -> &mut ElemRef<'tx> {
        self.stack.last_mut().expect("cursor stack is empty")
    }

    /// Descends to the leftmost leaf under the top frame.
    fn descend_first(&mut self) -> Result<()> {
        loop {
            let elem = self.top();
            if elem.is_leaf() {
                return Ok(());
            }
            let pgid = elem.child_pgid();
            let pn = self.bucket.page_node(pgid)?;
            self.stack.push(ElemRef {
                upper: pn,
                index: 0,
            });
        }
    }

    /// Descends to the rightmost leaf under the top frame.
    fn descend_last(&mut self) -> Result<()> {
        loop {
            let elem = self.top();
            if elem.is_leaf() {
                return Ok(());
            }
            let pgid = elem.child_pgid();
            let pn = self.bucket.page_node(pgid)?;
            let mut child = ElemRef {
                upper: pn,
                index: 0,
            };
            child.index = child.count().saturating_sub(1);
            self.stack.push(child);
        }
    }

    /// Advances to the next leaf element, skipping empty leaves. Returns
    /// `None` when exhausted, leaving the stack on the last element.
    fn next_leaf(&mut self) -> Result<Option<RawEntry>> {
        loop {
            // Walk up to the first frame that has elements to its right.
            let mut i = self.stack.len();
            while i > 0 {
                let elem = &mut self.stack[i - 1];
                if elem.count() > 0 && elem.index < elem.count() - 1 {
                    elem.index += 1;
                    break;
                }
                i -= 1;
            }
            if i == 0 {
                return Ok(None);
            }

            // Discard the stale descent and walk down the new branch.
            self.stack.truncate(i);
            self.descend_first()?;

            if self.top().count() == 0 {
                continue;
            }
            return Ok(self.key_value());
        }
    }

    /// Descends from the root to the leaf position for `key`.
    fn seek_to(&mut self, key: &[u8]) -> Result<Option<RawEntry>> {
        self.stack.clear();
        self.search(key, self.bucket.root())?;
        Ok(self.key_value())
    }

    /// Recursive binary-search descent through a page or node.
    fn search(&mut self, key: &[u8], pgid: Pgid) -> Result<()> {
        let pn = self.bucket.page_node(pgid)?;
        if let PageNode::Page(p) = &pn {
            assert!(
                p.flags() & (BRANCH_PAGE_FLAG | LEAF_PAGE_FLAG) != 0,
                "invalid page type during descent: {}: {:#x}",
                p.id(),
                p.flags()
            );
        }
        self.stack.push(ElemRef {
            upper: pn,
            index: 0,
        });

        if self.top().is_leaf() {
            self.search_leaf(key);
            return Ok(());
        }
        match self.top().upper.clone() {
            PageNode::Node(n) => self.search_branch_node(key, &n),
            PageNode::Page(p) => self.search_branch_page(key, p),
        }
    }

    fn search_branch_node(&mut self, key: &[u8], node: &Rc<RefCell<Node>>) -> Result<()> {
        let (index, child) = {
            let n = node.borrow();
            // Rightmost separator <= key: land on the exact match, otherwise
            // one left of the insertion point.
            let index = match n
                .inodes
                .binary_search_by(|inode| inode.key.as_slice().cmp(key))
            {
                Ok(exact) => exact,
                Err(insert) => insert.saturating_sub(1),
            };
            (index, n.inodes[index].pgid)
        };
        self.top_mut().index = index;
        self.search(key, child)
    }

    fn search_branch_page(&mut self, key: &[u8], page: Page<'tx>) -> Result<()> {
        let count = page.count();
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if page.branch_element(mid).key < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let index = if lo < count && page.branch_element(lo).key == key {
            lo
        } else {
            lo.saturating_sub(1)
        };
        self.top_mut().index = index;
        self.search(key, page.branch_element(index).pgid)
    }

    /// Leftmost element >= key in the top (leaf) frame. The resulting index
    /// may equal `count`, meaning every key here is smaller.
    fn search_leaf(&mut self, key: &[u8]) {
        let index = {
            let elem = self.top();
            match &elem.upper {
                PageNode::Node(n) => n
                    .borrow()
                    .inodes
                    .partition_point(|inode| inode.key.as_slice() < key),
                PageNode::Page(p) => {
                    let count = p.count();
                    let mut lo = 0;
                    let mut hi = count;
                    while lo < hi {
                        let mid = lo + (hi - lo) / 2;
                        if p.leaf_element(mid).key < key {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    lo
                }
            }
        };
        self.top_mut().index = index;
    }

    /// Key, value and flags at the current position, or `None` when the
    /// position is past the end (or the leaf is empty).
    fn key_value(&self) -> Option<RawEntry> {
        let elem = self.stack.last().expect("cursor stack is empty");
        if elem.count() == 0 || elem.index >= elem.count() {
            return None;
        }
        match &elem.upper {
            PageNode::Node(n) => {
                let node = n.borrow();
                let inode = &node.inodes[elem.index];
                Some((inode.key.clone(), inode.value.clone(), inode.flags))
            }
            PageNode::Page(p) => {
                let e = p.leaf_element(elem.index);
                Some((e.key.to_vec(), e.value.to_vec(), e.flags))
            }
        }
    }

    /// Materializes the leaf the cursor is on, and every branch above it,
    /// as mutable nodes.
    fn leaf_node(&mut self) -> Result<Rc<RefCell<Node>>> {
        assert!(
            !self.stack.is_empty(),
            "accessing a node with a zero-length cursor stack"
        );

        if let PageNode::Node(n) = &self.top().upper {
            if n.borrow().is_leaf {
                return Ok(n.clone());
            }
        }

        let mut node = match &self.stack[0].upper {
            PageNode::Node(n) => n.clone(),
            PageNode::Page(p) => self.bucket.node(p.id(), None)?,
        };
        for elem in &self.stack[..self.stack.len() - 1] {
            let (child, parent) = {
                let n = node.borrow();
                assert!(!n.is_leaf, "expected branch node");
                (n.inodes[elem.index].pgid, n.pgid)
            };
            node = self.bucket.node(child, Some(parent))?;
        }
        assert!(node.borrow().is_leaf, "expected leaf node");
        Ok(node)
    }
}

fn emit(kv: Option<RawEntry>) -> Option<Entry> {
    kv.map(|(key, value, flags)| {
        if flags & BUCKET_LEAF_FLAG != 0 {
            (key, None)
        } else {
            (key, Some(value))
        }
    })
}
