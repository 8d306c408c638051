//! # Freelist Management
//!
//! This module tracks every page that can be reused instead of growing the
//! file, together with the pages freed by in-flight transactions that are
//! not reusable yet.
//!
//! ## State
//!
//! ```text
//! Freelist {
//!     ids:     [Pgid]                ascending, allocatable now
//!     pending: txid -> [Pgid]        freed by that tx, still visible to
//!                                    readers at earlier txids
//!     cache:   {Pgid}                union of both, for O(1) membership
//! }
//! ```
//!
//! `cache` always equals `ids` plus every pending list; each mutation
//! maintains that equality so the double-free check in [`Freelist::free`]
//! and the [`Freelist::freed`] query never scan.
//!
//! ## Lifecycle
//!
//! Pages freed by a write transaction land in `pending[txid]`. Once no open
//! reader can still observe that transaction's snapshot, `release` promotes
//! the ids into `ids`; if the transaction aborts instead, `rollback` drops
//! them as if the frees never happened.
//!
//! ## Allocation Strategy
//!
//! `allocate(n)` performs a first-fit scan for `n` consecutive ids. First-fit
//! keeps allocation order stable across implementations, which matters
//! because the resulting file layout is visible on disk. Returns 0 when no
//! run fits, which callers interpret as "grow the file".
//!
//! ## Serialized Form
//!
//! A freelist page stores the sorted union of `ids` and all pending lists.
//! Flattening pending into the on-disk list is what makes crash recovery
//! trivial: a crashed writer's pending frees are simply free after reopen.
//! Counts that do not fit the 16-bit header field use the 0xFFFF escape
//! described in `page`.
//!
//! ## Thread Safety
//!
//! None internally. The freelist is reachable only through the owning
//! database's writer path, and the single-writer lock provides exclusion.

use hashbrown::{HashMap, HashSet};
use zerocopy::byteorder::little_endian::U64;
use zerocopy::FromBytes;

use super::page::{merge, merge_pgids, Page, PageMut, Pgid, Txid};
use super::{FREELIST_PAGE_FLAG, PAGE_HEADER_SIZE};

#[derive(Debug, Default)]
pub struct Freelist {
    ids: Vec<Pgid>,
    pending: HashMap<Txid, Vec<Pgid>>,
    cache: HashSet<Pgid>,
}

impl Freelist {
    pub fn new() -> Freelist {
        Freelist::default()
    }

    /// Serialized size in bytes, including the page header and the
    /// large-count escape slot when it applies.
    pub fn size(&self) -> usize {
        let mut n = self.count();
        if n >= 0xFFFF {
            // Slot 0 stores the real count. See write().
            n += 1;
        }
        PAGE_HEADER_SIZE + size_of::<Pgid>() * n
    }

    /// Total number of free and pending pages.
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Copies the sorted union of all free and pending ids into `dst`.
    /// `count()` is the minimum destination length.
    pub fn copyall(&self, dst: &mut [Pgid]) {
        let mut pending: Vec<Pgid> = Vec::with_capacity(self.pending_count());
        for list in self.pending.values() {
            pending.extend_from_slice(list);
        }
        pending.sort_unstable();
        merge_pgids(dst, &self.ids, &pending);
    }

    /// Returns the starting id of a contiguous run of `n` free pages and
    /// removes the run from the freelist, or 0 if no such run exists.
    pub fn allocate(&mut self, n: usize) -> Pgid {
        if self.ids.is_empty() {
            return 0;
        }

        let mut initial: Pgid = 0;
        let mut previd: Pgid = 0;
        for i in 0..self.ids.len() {
            let id = self.ids[i];
            assert!(id > 1, "invalid page allocation: {}", id);

            // Reset the candidate run on any gap.
            if previd == 0 || id - previd != 1 {
                initial = id;
            }

            if (id - initial) + 1 == n as Pgid {
                self.ids.drain(i + 1 - n..=i);
                for offset in 0..n as Pgid {
                    self.cache.remove(&(initial + offset));
                }
                return initial;
            }

            previd = id;
        }
        0
    }

    /// Registers `page` and its overflow pages as freed by `txid`.
    ///
    /// Panics on an attempt to free a meta page or a page that is already
    /// free or pending: both mean the tree and the freelist disagree about
    /// who owns the page, and the file is no longer trustworthy.
    pub fn free(&mut self, txid: Txid, page: &Page<'_>) {
        let start = page.id();
        assert!(start > 1, "cannot free page 0 or 1: {}", start);

        let ids = self.pending.entry(txid).or_default();
        for id in start..=start + page.overflow() as Pgid {
            assert!(self.cache.insert(id), "page {} already freed", id);
            ids.push(id);
        }
    }

    /// Promotes the pending pages of every transaction with id <= `txid`
    /// into the allocatable set. The pages stay in `cache` throughout: they
    /// were free before, they are free after.
    pub fn release(&mut self, txid: Txid) {
        let mut promoted: Vec<Pgid> = Vec::new();
        self.pending.retain(|&tid, ids| {
            if tid <= txid {
                promoted.append(ids);
                false
            } else {
                true
            }
        });
        promoted.sort_unstable();
        self.ids = merge(&self.ids, &promoted);
    }

    /// Discards the pending frees of `txid`, restoring the freelist to its
    /// state before that transaction freed anything.
    pub fn rollback(&mut self, txid: Txid) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// Whether `pgid` is free or pending. O(1).
    pub fn freed(&self, pgid: Pgid) -> bool {
        self.cache.contains(&pgid)
    }

    /// Initializes the allocatable set from a freelist page.
    ///
    /// Pending lists are left untouched: on a plain open they are empty, and
    /// [`Freelist::reload`] handles the reopen-with-live-writers case.
    pub fn read(&mut self, page: &Page<'_>) {
        self.ids = page.freelist_ids().iter().map(|id| id.get()).collect();
        // Allocation assumes ascending order.
        self.ids.sort_unstable();
        self.reindex();
    }

    /// Serializes all free and pending ids onto `page`, sorted ascending.
    ///
    /// Pending ids are written as if already free: should the process die
    /// before the owning transactions resolve, reopening the file promotes
    /// them automatically.
    pub fn write(&self, page: &mut PageMut<'_>) {
        page.set_flags(page.flags() | FREELIST_PAGE_FLAG);

        let lenids = self.count();
        let (escape, slots) = if lenids == 0 {
            page.set_count(0);
            return;
        } else if lenids < 0xFFFF {
            page.set_count(lenids as u16);
            (0, lenids)
        } else {
            page.set_count(0xFFFF);
            (1, lenids + 1)
        };

        let body = page.body_mut();
        let bytes = slots * size_of::<Pgid>();
        assert!(
            bytes <= body.len(),
            "freelist of {} ids does not fit in {}-byte page body",
            lenids,
            body.len()
        );

        let mut all = vec![0; lenids];
        self.copyall(&mut all);

        let out = <[U64]>::mut_from_bytes(&mut body[..bytes]).expect("unaligned id slice");
        if escape == 1 {
            out[0].set(lenids as Pgid);
        }
        for (slot, id) in out[escape..].iter_mut().zip(&all) {
            slot.set(*id);
        }
    }

    /// Re-reads the freelist from a page while transactions are in flight,
    /// filtering out ids that some pending list still owns.
    pub fn reload(&mut self, page: &Page<'_>) {
        self.read(page);

        let pcache: HashSet<Pgid> = self.pending.values().flatten().copied().collect();
        self.ids.retain(|id| !pcache.contains(id));
        self.reindex();
    }

    /// Rebuilds `cache` from `ids` and the pending lists.
    fn reindex(&mut self) {
        self.cache = HashSet::with_capacity(self.ids.len());
        self.cache.extend(self.ids.iter().copied());
        self.cache
            .extend(self.pending.values().flatten().copied());
    }
}
