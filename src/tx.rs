//! # Transactions
//!
//! A [`Tx`] is a consistent view of the database. Read transactions pin a
//! map snapshot and a meta copy for their whole life; the write transaction
//! additionally holds the single-writer lock and the right to mutate the
//! freelist.
//!
//! ## Commit Protocol (write transactions)
//!
//! 1. **Spill.** Every node the transaction materialized is rewritten
//!    copy-on-write: the old page is freed into the freelist (pending under
//!    this txid), a fresh contiguous run is allocated (growing the file
//!    from the high-water mark when the freelist has no fit), and the
//!    parent's child link is patched. Children are written before their
//!    parents, so a parent page always carries its children's final ids.
//! 2. **Freelist.** The old freelist page is freed and the new free+pending
//!    set is serialized to a freshly allocated page.
//! 3. **Sync, then meta.** Data pages are made durable first; only then is
//!    the meta (new root, new freelist page, bumped txid, checksum) written
//!    to the rotated slot and synced. A crash between the two syncs leaves
//!    the previous meta intact and the file consistent.
//! 4. **Publish.** The map is refreshed so later transactions see any file
//!    growth.
//!
//! Rolling back (explicitly or by dropping the transaction) discards the
//! pending frees and every materialized node; nothing was written, so
//! nothing needs undoing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::MutexGuard;

use crate::btree::{Cursor, Node};
use crate::bucket::Bucket;
use crate::db::Db;
use crate::error::Error;
use crate::storage::{Meta, Page, PageMut, Pgid, Txid};

pub struct Tx<'db> {
    db: Cell<Option<&'db Db>>,
    id: Txid,
    writable: bool,
    meta: Meta,
    root: Bucket,
    open: Rc<Cell<bool>>,
    guard: Option<MutexGuard<'db, ()>>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(
        db: &'db Db,
        meta: Meta,
        writable: bool,
        guard: Option<MutexGuard<'db, ()>>,
    ) -> Tx<'db> {
        let id = if writable { meta.txid() + 1 } else { meta.txid() };
        let open = Rc::new(Cell::new(true));
        let root = Bucket::new(
            db.storage().snapshot(),
            db.page_size(),
            meta.root(),
            writable,
            open.clone(),
        );
        Tx {
            db: Cell::new(Some(db)),
            id,
            writable,
            meta,
            root,
            open,
            guard,
        }
    }

    pub fn id(&self) -> Txid {
        self.id
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The root bucket of this transaction's tree.
    pub fn bucket(&self) -> Result<&Bucket> {
        if self.db.get().is_none() {
            return Err(Error::TxClosed.into());
        }
        Ok(&self.root)
    }

    /// Shorthand for a cursor over the root bucket.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        Ok(self.bucket()?.cursor())
    }

    /// Zero-copy view of a page through this transaction's snapshot.
    pub fn page(&self, pgid: Pgid) -> Result<Page<'_>> {
        self.bucket()?.page(pgid)
    }

    /// Writes every change out and makes it durable.
    pub fn commit(mut self) -> Result<()> {
        let db = self.db.get().ok_or(Error::TxClosed)?;
        if !self.writable {
            return Err(Error::TxNotWritable.into());
        }

        let mut high_water = self.meta.pgid();

        if let Some(new_root) = self.spill(db, &mut high_water)? {
            self.meta.set_root(new_root);
        }

        // Retire the old freelist page and serialize the new state. The
        // size is taken before the allocation below shrinks the list.
        {
            let old = self.root.page(self.meta.freelist())?;
            db.freelist().lock().free(self.id, &old);
        }
        let npages = db.freelist().lock().size().div_ceil(db.page_size());
        let freelist_pgid = self.allocate(db, npages, &mut high_water)?;
        let mut buf = vec![0u8; npages * db.page_size()];
        {
            let mut page = PageMut::new(&mut buf)?;
            page.set_id(freelist_pgid);
            page.set_overflow(npages as u32 - 1);
            db.freelist().lock().write(&mut page);
        }
        db.storage().write_page(freelist_pgid, &buf)?;

        // Data pages become durable before the meta that references them.
        db.storage().sync()?;

        self.meta.set_freelist(freelist_pgid);
        self.meta.set_pgid(high_water);
        self.meta.set_txid(self.id);
        self.meta.update_checksum();

        let mut buf = vec![0u8; db.page_size()];
        {
            let mut page = PageMut::new(&mut buf)?;
            self.meta.write_to(&mut page, self.id % 2);
        }
        db.storage().write_page(self.id % 2, &buf)?;
        db.storage().sync()?;
        db.storage().remap()?;

        tracing::debug!(
            txid = self.id,
            root = self.meta.root(),
            freelist = freelist_pgid,
            "committed transaction"
        );

        self.finish(db);
        Ok(())
    }

    /// Abandons the transaction, undoing its pending frees.
    pub fn rollback(mut self) -> Result<()> {
        let db = self.db.get().ok_or(Error::TxClosed)?;
        self.rollback_inner(db);
        Ok(())
    }

    /// Copy-on-write rewrite of every materialized node, children before
    /// parents. Returns the new root page id if the root moved.
    fn spill(&self, db: &Db, high_water: &mut Pgid) -> Result<Option<Pgid>> {
        let nodes = self.root.take_nodes();
        if nodes.is_empty() {
            return Ok(None);
        }

        // Deepest first, so a parent is patched with every child's final id
        // before its own page is written.
        let mut order: Vec<Pgid> = nodes.keys().copied().collect();
        order.sort_by_key(|&pgid| std::cmp::Reverse(depth_of(&nodes, pgid)));

        let mut new_root = None;
        for old_pgid in order {
            let node = &nodes[&old_pgid];
            let (size, parent) = {
                let n = node.borrow();
                (n.size(), n.parent())
            };

            {
                let old_page = self.root.page(old_pgid)?;
                db.freelist().lock().free(self.id, &old_page);
            }

            let npages = size.div_ceil(db.page_size());
            let new_pgid = self.allocate(db, npages, high_water)?;
            let mut buf = vec![0u8; npages * db.page_size()];
            {
                let mut page = PageMut::new(&mut buf)?;
                page.set_id(new_pgid);
                page.set_overflow(npages as u32 - 1);
                node.borrow().write(&mut page)?;
            }
            db.storage().write_page(new_pgid, &buf)?;

            match parent {
                Some(parent_pgid) => {
                    let parent_node = nodes.get(&parent_pgid).unwrap_or_else(|| {
                        panic!(
                            "dirty node {} has no materialized parent {}",
                            old_pgid, parent_pgid
                        )
                    });
                    let mut parent_node = parent_node.borrow_mut();
                    let link = parent_node
                        .inodes
                        .iter_mut()
                        .find(|inode| inode.pgid == old_pgid)
                        .unwrap_or_else(|| {
                            panic!("parent {} has no link to child {}", parent_pgid, old_pgid)
                        });
                    link.pgid = new_pgid;
                }
                None => {
                    assert!(
                        old_pgid == self.meta.root(),
                        "parentless dirty node {} is not the root {}",
                        old_pgid,
                        self.meta.root()
                    );
                    new_root = Some(new_pgid);
                }
            }
        }

        Ok(new_root)
    }

    /// First-fit allocation from the freelist, growing the file from the
    /// high-water mark when no run fits.
    fn allocate(&self, db: &Db, npages: usize, high_water: &mut Pgid) -> Result<Pgid> {
        let pgid = db.freelist().lock().allocate(npages);
        if pgid != 0 {
            return Ok(pgid);
        }

        let pgid = *high_water;
        *high_water += npages as Pgid;
        db.storage().grow(*high_water)?;
        tracing::debug!(
            pages = npages,
            high_water = *high_water,
            "grew database file"
        );
        Ok(pgid)
    }

    fn rollback_inner(&mut self, db: &Db) {
        if self.writable {
            db.freelist().lock().rollback(self.id);
            let _ = self.root.take_nodes();
            tracing::debug!(txid = self.id, "rolled back transaction");
        }
        self.finish(db);
    }

    fn finish(&mut self, db: &Db) {
        if !self.writable {
            db.release_reader(self.id);
        }
        self.open.set(false);
        self.db.set(None);
        self.guard = None;
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if let Some(db) = self.db.get() {
            self.rollback_inner(db);
        }
    }
}

/// Distance from a node to the farthest materialized ancestor, following
/// parent page ids through the cache.
fn depth_of(nodes: &HashMap<Pgid, Rc<RefCell<Node>>>, pgid: Pgid) -> usize {
    let mut depth = 0;
    let mut current = pgid;
    while let Some(node) = nodes.get(&current) {
        match node.borrow().parent() {
            Some(parent) => {
                depth += 1;
                current = parent;
            }
            None => break,
        }
    }
    depth
}
