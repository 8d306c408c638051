//! # Database Handle
//!
//! [`Db`] owns the file, the map, the freelist, and the transaction
//! bookkeeping. It enforces the engine's concurrency contract at the type
//! boundary: the freelist is only reachable through the write path, and the
//! write path is serialized by a lock held for the whole write transaction,
//! so the freelist needs no internal synchronization story beyond the
//! mutex that guards the single writer's own re-entrancy.
//!
//! ## File Layout
//!
//! ```text
//! Page 0   meta (written by even transactions)
//! Page 1   meta (written by odd transactions)
//! Page 2+  freelist / branch / leaf pages, allocated freely
//! ```
//!
//! A fresh database is four pages: the meta pair, an empty freelist at page
//! 2, and an empty leaf root at page 3, with the high-water mark at 4.
//!
//! ## Readers and Release
//!
//! Every read transaction registers the txid of the meta it opened against.
//! When a write transaction begins, pages freed by transactions older than
//! every live reader are promoted from pending to allocatable; pages a
//! reader might still resolve stay pending. This is the whole of the MVCC
//! reclamation story.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{eyre, Result, WrapErr};
use parking_lot::Mutex;

use crate::storage::{
    os_page_size, Freelist, Meta, MmapStorage, Page, PageMut, Pgid, Txid, LEAF_PAGE_FLAG,
};
use crate::tx::Tx;

#[derive(Debug)]
pub struct Db {
    storage: MmapStorage,
    freelist: Mutex<Freelist>,
    writer: Mutex<()>,
    readers: Mutex<Vec<Txid>>,
    page_size: usize,
    path: PathBuf,
}

impl Db {
    /// Opens the database at `path`, creating a fresh one if the file does
    /// not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Db> {
        let path = path.as_ref();
        let page_size = os_page_size();

        if !path.exists() {
            Self::init(path, page_size)?;
        }

        let storage = MmapStorage::open(path, page_size)?;
        let meta = Self::current_meta(&storage.snapshot(), page_size)?;

        storage.prefetch(meta.freelist(), 1);
        let mut freelist = Freelist::new();
        {
            let map = storage.snapshot();
            let page = Page::at(&map, page_size, meta.freelist())?;
            freelist.read(&page);
        }

        tracing::debug!(
            path = %path.display(),
            txid = meta.txid(),
            pages = storage.page_count(),
            free = freelist.free_count(),
            "opened database"
        );

        Ok(Db {
            storage,
            freelist: Mutex::new(freelist),
            writer: Mutex::new(()),
            readers: Mutex::new(Vec::new()),
            page_size,
            path: path.to_path_buf(),
        })
    }

    /// Writes the four initial pages of a fresh database.
    fn init(path: &Path, page_size: usize) -> Result<()> {
        let mut buf = vec![0u8; 4 * page_size];

        for slot in 0..2u64 {
            let meta = Meta::new(page_size as u32, 3, 2, 4, slot);
            let start = slot as usize * page_size;
            let mut page = PageMut::new(&mut buf[start..start + page_size])?;
            meta.write_to(&mut page, slot);
        }
        {
            let mut page = PageMut::new(&mut buf[2 * page_size..3 * page_size])?;
            page.set_id(2);
            Freelist::new().write(&mut page);
        }
        {
            let mut page = PageMut::new(&mut buf[3 * page_size..])?;
            page.set_id(3);
            page.set_flags(LEAF_PAGE_FLAG);
        }

        let mut file = File::create(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;
        file.write_all(&buf)
            .wrap_err("failed to write initial pages")?;
        file.sync_all().wrap_err("failed to sync new database")?;

        tracing::debug!(path = %path.display(), page_size, "created database");
        Ok(())
    }

    /// The valid meta with the highest txid. Falls back across the pair, so
    /// a commit torn mid-meta-write loses that commit only.
    fn current_meta(map: &memmap2::Mmap, page_size: usize) -> Result<Meta> {
        let mut best: Option<Meta> = None;
        let mut first_err = None;

        for pgid in 0..2u64 {
            let meta = Page::at(map, page_size, pgid)
                .and_then(|page| page.meta())
                .and_then(|meta| meta.validate(page_size as u32).map(|_| meta));
            match meta {
                Ok(meta) => {
                    if best.is_none() || meta.txid() > best.unwrap().txid() {
                        best = Some(meta);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        best.ok_or_else(|| {
            first_err.unwrap_or_else(|| eyre!("invalid database: no readable meta page"))
        })
    }

    /// Begins a read-only transaction pinned to the current snapshot.
    pub fn begin(&self) -> Result<Tx<'_>> {
        // Registration happens under the same lock as the meta read so a
        // concurrent writer cannot release pages between the two.
        let mut readers = self.readers.lock();
        let meta = Self::current_meta(&self.storage.snapshot(), self.page_size)?;
        readers.push(meta.txid());
        Ok(Tx::new(self, meta, false, None))
    }

    /// Begins the write transaction, blocking until it is the only one.
    pub fn begin_rw(&self) -> Result<Tx<'_>> {
        let guard = self.writer.lock();
        let meta = Self::current_meta(&self.storage.snapshot(), self.page_size)?;
        let tx = Tx::new(self, meta, true, Some(guard));

        // Pending frees that no live reader can still observe become
        // allocatable for this transaction.
        let floor = {
            let readers = self.readers.lock();
            readers.iter().min().copied().unwrap_or_else(|| tx.id())
        };
        if floor > 0 {
            self.freelist.lock().release(floor - 1);
        }
        tracing::trace!(txid = tx.id(), "began write transaction");

        Ok(tx)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `pgid` is currently free or pending in the freelist.
    pub fn freed(&self, pgid: Pgid) -> bool {
        self.freelist.lock().freed(pgid)
    }

    pub(crate) fn storage(&self) -> &MmapStorage {
        &self.storage
    }

    pub(crate) fn freelist(&self) -> &Mutex<Freelist> {
        &self.freelist
    }

    pub(crate) fn release_reader(&self, txid: Txid) {
        let mut readers = self.readers.lock();
        if let Some(pos) = readers.iter().position(|&t| t == txid) {
            readers.swap_remove(pos);
        }
    }
}
