//! # Bucket: Page/Node Resolution
//!
//! A [`Bucket`] is a handle on one B+tree within a transaction. It owns the
//! transaction's node cache (the table of pages that have been materialized
//! into mutable [`Node`]s) and answers the resolution question at the heart
//! of the engine: given a page id, is the authoritative version the mapped
//! page on disk or a node this transaction has already dirtied?
//!
//! Nodes are keyed by the page id they were materialized from, and parent
//! links are recorded as page ids rather than references, so the cache is a
//! flat arena with no ownership cycles. Materialization is lazy: a pure read
//! traversal never creates a node, which keeps read transactions
//! allocation-free along the descent path.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use memmap2::Mmap;

use crate::btree::{Cursor, Node, PageNode};
use crate::storage::{Page, Pgid};

pub struct Bucket {
    root: Pgid,
    writable: bool,
    page_size: usize,
    mmap: Arc<Mmap>,
    open: Rc<Cell<bool>>,
    nodes: RefCell<HashMap<Pgid, Rc<RefCell<Node>>>>,
}

impl Bucket {
    pub(crate) fn new(
        mmap: Arc<Mmap>,
        page_size: usize,
        root: Pgid,
        writable: bool,
        open: Rc<Cell<bool>>,
    ) -> Bucket {
        Bucket {
            root,
            writable,
            page_size,
            mmap,
            open,
            nodes: RefCell::new(HashMap::new()),
        }
    }

    /// Root page id of this bucket's tree.
    pub fn root(&self) -> Pgid {
        self.root
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.get()
    }

    /// Returns a cursor positioned nowhere in particular; call one of its
    /// positioning operations before reading.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Zero-copy view of the page `pgid`, spanning its overflow run.
    pub fn page(&self, pgid: Pgid) -> Result<Page<'_>> {
        Page::at(&self.mmap, self.page_size, pgid)
    }

    /// Resolves `pgid` to the authoritative representation: the cached
    /// mutable node when this transaction has one, the mapped page
    /// otherwise.
    pub fn page_node(&self, pgid: Pgid) -> Result<PageNode<'_>> {
        if let Some(node) = self.nodes.borrow().get(&pgid) {
            return Ok(PageNode::Node(node.clone()));
        }
        Ok(PageNode::Page(self.page(pgid)?))
    }

    /// Materializes `pgid` as a mutable node, cloning it from its page on
    /// first access. `parent` is the branch it was reached through.
    pub fn node(&self, pgid: Pgid, parent: Option<Pgid>) -> Result<Rc<RefCell<Node>>> {
        if let Some(node) = self.nodes.borrow().get(&pgid) {
            return Ok(node.clone());
        }

        let node = Rc::new(RefCell::new(Node::read(self.page(pgid)?, parent)));
        self.nodes.borrow_mut().insert(pgid, node.clone());
        Ok(node)
    }

    /// Number of materialized nodes.
    pub fn dirty_count(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Drains the node cache for the commit path.
    pub(crate) fn take_nodes(&self) -> HashMap<Pgid, Rc<RefCell<Node>>> {
        self.nodes.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::Inode;
    use crate::storage::{MmapStorage, PageMut, LEAF_PAGE_FLAG};

    const PAGE_SIZE: usize = 4096;

    fn bucket_with_one_leaf() -> (tempfile::TempDir, Bucket) {
        let node = Node {
            pgid: 0,
            is_leaf: true,
            parent: None,
            inodes: vec![Inode {
                flags: 0,
                pgid: 0,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
        };

        let mut buf = vec![0u8; 4 * PAGE_SIZE];
        let mut page = PageMut::new(&mut buf[3 * PAGE_SIZE..]).unwrap();
        page.set_id(3);
        node.write(&mut page).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket.db");
        std::fs::write(&path, &buf).unwrap();
        let storage = MmapStorage::open(&path, PAGE_SIZE).unwrap();
        let bucket = Bucket::new(
            storage.snapshot(),
            PAGE_SIZE,
            3,
            true,
            Rc::new(Cell::new(true)),
        );
        (dir, bucket)
    }

    #[test]
    fn page_resolves_header_and_body() {
        let (_dir, bucket) = bucket_with_one_leaf();

        let page = bucket.page(3).unwrap();
        assert_eq!(page.id(), 3);
        assert_eq!(page.flags(), LEAF_PAGE_FLAG);
        assert_eq!(page.count(), 1);
        assert_eq!(page.leaf_element(0).key, b"k");
    }

    #[test]
    fn page_rejects_out_of_bounds_id() {
        let (_dir, bucket) = bucket_with_one_leaf();

        let err = bucket.page(40).unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn page_rejects_mismatched_header_id() {
        let (_dir, bucket) = bucket_with_one_leaf();

        // Page 2 was left zeroed, so its header claims id 0.
        let err = bucket.page(2).unwrap_err();
        assert!(err.to_string().contains("mismatched id"));
    }

    #[test]
    fn page_node_prefers_cached_nodes() {
        let (_dir, bucket) = bucket_with_one_leaf();

        assert!(matches!(
            bucket.page_node(3).unwrap(),
            PageNode::Page(_)
        ));

        bucket.node(3, None).unwrap();

        assert!(matches!(
            bucket.page_node(3).unwrap(),
            PageNode::Node(_)
        ));
    }

    #[test]
    fn node_materializes_once_and_shares() {
        let (_dir, bucket) = bucket_with_one_leaf();

        let first = bucket.node(3, None).unwrap();
        first.borrow_mut().inodes[0].value = b"changed".to_vec();

        let second = bucket.node(3, None).unwrap();
        assert_eq!(second.borrow().inodes[0].value, b"changed");
        assert_eq!(bucket.dirty_count(), 1);
    }

    #[test]
    fn node_records_parent_link() {
        let (_dir, bucket) = bucket_with_one_leaf();

        let node = bucket.node(3, Some(7)).unwrap();
        assert_eq!(node.borrow().parent(), Some(7));
    }
}
