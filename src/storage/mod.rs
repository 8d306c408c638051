//! # Storage Module
//!
//! This module provides the on-disk foundation for burrowdb: the fixed-size
//! page abstraction, the free-page allocator, the meta pages, and the
//! memory-mapped file they all live in.
//!
//! ## Architecture Overview
//!
//! A burrowdb database is a single file of fixed-size pages. Pages 0 and 1
//! hold the two meta pages (double-buffered for atomic commits), and every
//! other page is either a B+tree branch, a B+tree leaf, or the freelist.
//! The file is memory-mapped read-only; reads are zero-copy slices into the
//! map, and all writes go through positioned file writes so a half-finished
//! commit can never tear a page a reader is looking at.
//!
//! ## Copy-on-Write
//!
//! Pages are never modified in place. A write transaction materializes the
//! pages it touches as in-memory nodes, and at commit each dirtied node is
//! written to a freshly allocated page while the old page is handed to the
//! freelist. Readers opened before the commit keep resolving the old pages
//! through their own map snapshot, which is what makes MVCC work without any
//! reader-side locking.
//!
//! ## Page Size
//!
//! The page size is taken from the OS at database creation time (typically
//! 4096 bytes) and recorded in the meta pages. Opening a file whose recorded
//! page size does not match the runtime's is rejected: offsets on disk are
//! multiples of the page size and a mismatch would misalign every page.
//!
//! ## Module Organization
//!
//! - `page`: page header layout, typed element views, sorted pgid merge
//! - `freelist`: free-page tracking, pending frees, first-fit allocation
//! - `meta`: meta page layout, checksums, and rotation
//! - `mmap`: read-only mapping with snapshot/remap for MVCC readers

mod freelist;
mod meta;
mod mmap;
mod page;

pub use freelist::Freelist;
pub use meta::{Meta, META_MAGIC, META_VERSION};
pub use mmap::MmapStorage;
pub use page::{
    merge, merge_pgids, BranchElement, BranchPageElement, LeafElement, LeafPageElement, Page,
    PageHeader, PageMut, PageType, Pgid, Txid, BRANCH_ELEMENT_SIZE, BRANCH_PAGE_FLAG,
    BUCKET_LEAF_FLAG, FREELIST_PAGE_FLAG, LEAF_ELEMENT_SIZE, LEAF_PAGE_FLAG, META_PAGE_FLAG,
    PAGE_HEADER_SIZE,
};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Zero-copy view of a packed on-disk struct at the start of `bytes`.
///
/// All on-disk structs in this crate are `Unaligned`, so the only way this
/// can fail is a buffer too short to hold the struct it claims to contain,
/// which means the page is corrupt.
#[inline]
pub(crate) fn cast_prefix<'a, T: FromBytes + KnownLayout + Immutable + Unaligned>(
    bytes: &'a [u8],
    what: &str,
) -> &'a T {
    let size = size_of::<T>();
    assert!(
        bytes.len() >= size,
        "corrupt page: {} bytes left for {} ({} needed)",
        bytes.len(),
        what,
        size
    );
    T::ref_from_bytes(&bytes[..size]).expect("unaligned prefix cast")
}

/// Mutable counterpart of [`cast_prefix`].
#[inline]
pub(crate) fn cast_prefix_mut<'a, T: FromBytes + IntoBytes + KnownLayout + Unaligned>(
    bytes: &'a mut [u8],
    what: &str,
) -> &'a mut T {
    let size = size_of::<T>();
    assert!(
        bytes.len() >= size,
        "corrupt page: {} bytes left for {} ({} needed)",
        bytes.len(),
        what,
        size
    );
    T::mut_from_bytes(&mut bytes[..size]).expect("unaligned prefix cast")
}

/// Page size reported by the OS, used when creating a new database file.
#[cfg(unix)]
pub(crate) fn os_page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions and touches no
    // caller-owned memory.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
