//! # Page Layout and Id Arithmetic
//!
//! Every page in a burrowdb file begins with a 16-byte header followed by a
//! body whose interpretation depends on the header flags.
//!
//! ## Page Header Layout (16 bytes, little-endian)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       8     id        The page's own id
//! 8       2     flags     Page kind: branch, leaf, meta or freelist
//! 10      2     count     Element count (0xFFFF = freelist escape)
//! 12      4     overflow  Extra contiguous pages spanned by this page
//! ```
//!
//! A logical page occupies `overflow + 1` physical pages; bodies larger than
//! one page (big freelists, oversized leaf values) simply spill into the
//! following pages of the same contiguous run.
//!
//! ## Branch Page Body
//!
//! `count` fixed-size element records followed by packed key bytes:
//!
//! ```text
//! [ elem 0 | elem 1 | ... | elem n-1 | key 0 | key 1 | ... ]
//!   pos:u32 ksize:u32 pgid:u64
//! ```
//!
//! Each element's `pos` is the distance from the element record's own offset
//! to its key, so records can be relocated together with their keys.
//!
//! ## Leaf Page Body
//!
//! Same shape with `{flags, pos, ksize, vsize}` records and packed key/value
//! pairs. Element flag bit 0 marks the value as a nested-tree reference.
//!
//! ## Freelist Page Body
//!
//! `count` u64 page ids, ascending. When the real count does not fit in the
//! 16-bit header field, `count` is 0xFFFF and body slot 0 holds the real
//! count (see `freelist`).
//!
//! ## Zero-Copy Access
//!
//! All views returned here ([`Page`], [`BranchElement`], [`LeafElement`])
//! borrow directly from the underlying buffer; nothing is copied. On-disk
//! integers use explicit little-endian `zerocopy` types, so the format is
//! identical on every host and none of the views carry alignment
//! requirements.
//!
//! ## Corruption Policy
//!
//! An element index past `count`, a key or value extent escaping the buffer,
//! or a merge destination too small all panic: they mean the file (or the
//! caller's accounting of it) can no longer be trusted.

use eyre::{ensure, Result};
use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{cast_prefix, cast_prefix_mut};

/// Page id. Ids 0 and 1 are the meta pages and are never allocated.
pub type Pgid = u64;

/// Transaction id, monotonically increasing over the life of a database.
pub type Txid = u64;

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x10;

/// Leaf element flag marking a nested-tree reference instead of a value.
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

pub const PAGE_HEADER_SIZE: usize = size_of::<PageHeader>();
pub const BRANCH_ELEMENT_SIZE: usize = size_of::<BranchPageElement>();
pub const LEAF_ELEMENT_SIZE: usize = size_of::<LeafPageElement>();

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U64,
    flags: U16,
    count: U16,
    overflow: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BranchPageElement {
    pub pos: U32,
    pub ksize: U32,
    pub pgid: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafPageElement {
    pub flags: U32,
    pub pos: U32,
    pub ksize: U32,
    pub vsize: U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Branch,
    Leaf,
    Meta,
    Freelist,
    Unknown,
}

impl PageType {
    pub fn from_flags(flags: u16) -> Self {
        if flags & BRANCH_PAGE_FLAG != 0 {
            PageType::Branch
        } else if flags & LEAF_PAGE_FLAG != 0 {
            PageType::Leaf
        } else if flags & META_PAGE_FLAG != 0 {
            PageType::Meta
        } else if flags & FREELIST_PAGE_FLAG != 0 {
            PageType::Freelist
        } else {
            PageType::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PageType::Branch => "branch",
            PageType::Leaf => "leaf",
            PageType::Meta => "meta",
            PageType::Freelist => "freelist",
            PageType::Unknown => "unknown",
        }
    }
}

/// Resolved view of one branch page element: the child page id and the
/// separator key, borrowed from the page buffer.
#[derive(Debug, Clone, Copy)]
pub struct BranchElement<'a> {
    pub pgid: Pgid,
    pub key: &'a [u8],
}

/// Resolved view of one leaf page element.
#[derive(Debug, Clone, Copy)]
pub struct LeafElement<'a> {
    pub flags: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Immutable zero-copy view of a page, spanning `overflow + 1` physical
/// pages. Copyable; all accessors borrow from the original buffer.
#[derive(Clone, Copy)]
pub struct Page<'a> {
    header: &'a PageHeader,
    data: &'a [u8],
}

impl<'a> Page<'a> {
    pub fn from_bytes(data: &'a [u8]) -> Result<Page<'a>> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for a page: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        let header = PageHeader::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read page header: {:?}", e))?;
        Ok(Page { header, data })
    }

    /// Resolves page `pgid` inside a mapped file buffer, spanning its whole
    /// overflow run and cross-checking the id recorded in the header.
    pub fn at(data: &'a [u8], page_size: usize, pgid: Pgid) -> Result<Page<'a>> {
        let offset = pgid as usize * page_size;
        ensure!(
            offset + page_size <= data.len(),
            "page {} out of bounds (mapped pages: {})",
            pgid,
            data.len() / page_size
        );

        let head = Page::from_bytes(&data[offset..offset + page_size])?;
        ensure!(
            head.id() == pgid,
            "page {} has mismatched id {} in its header",
            pgid,
            head.id()
        );

        let span = (1 + head.overflow() as usize) * page_size;
        ensure!(
            offset + span <= data.len(),
            "page {} overflows the mapped file ({} pages spanned)",
            pgid,
            1 + head.overflow()
        );
        Page::from_bytes(&data[offset..offset + span])
    }

    pub fn id(&self) -> Pgid {
        self.header.id.get()
    }

    pub fn flags(&self) -> u16 {
        self.header.flags.get()
    }

    pub fn count(&self) -> usize {
        self.header.count.get() as usize
    }

    pub fn overflow(&self) -> u32 {
        self.header.overflow.get()
    }

    pub fn typ(&self) -> PageType {
        PageType::from_flags(self.flags())
    }

    pub fn is_leaf(&self) -> bool {
        self.flags() & LEAF_PAGE_FLAG != 0
    }

    pub fn is_branch(&self) -> bool {
        self.flags() & BRANCH_PAGE_FLAG != 0
    }

    pub fn body(&self) -> &'a [u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn branch_element(&self, index: usize) -> BranchElement<'a> {
        assert!(
            index < self.count(),
            "branch element {} out of range on page {} (count={})",
            index,
            self.id(),
            self.count()
        );
        let body = self.body();
        let off = index * BRANCH_ELEMENT_SIZE;
        let elem: &BranchPageElement = cast_prefix(&body[off..], "branch element");
        let key = self.extent(off + elem.pos.get() as usize, elem.ksize.get() as usize);
        BranchElement {
            pgid: elem.pgid.get(),
            key,
        }
    }

    /// All branch elements in order.
    pub fn branch_elements(&self) -> impl Iterator<Item = BranchElement<'a>> + 'a {
        let page = *self;
        (0..page.count()).map(move |i| page.branch_element(i))
    }

    pub fn leaf_element(&self, index: usize) -> LeafElement<'a> {
        assert!(
            index < self.count(),
            "leaf element {} out of range on page {} (count={})",
            index,
            self.id(),
            self.count()
        );
        let body = self.body();
        let off = index * LEAF_ELEMENT_SIZE;
        let elem: &LeafPageElement = cast_prefix(&body[off..], "leaf element");
        let kstart = off + elem.pos.get() as usize;
        let key = self.extent(kstart, elem.ksize.get() as usize);
        let value = self.extent(kstart + elem.ksize.get() as usize, elem.vsize.get() as usize);
        LeafElement {
            flags: elem.flags.get(),
            key,
            value,
        }
    }

    /// All leaf elements in order.
    pub fn leaf_elements(&self) -> impl Iterator<Item = LeafElement<'a>> + 'a {
        let page = *self;
        (0..page.count()).map(move |i| page.leaf_element(i))
    }

    /// Page ids stored on a freelist page, with the 0xFFFF large-count
    /// escape already applied.
    pub(crate) fn freelist_ids(&self) -> &'a [U64] {
        let body = self.body();
        let (start, count) = if self.count() == 0xFFFF {
            let real: &U64 = cast_prefix(body, "freelist count");
            (1, real.get() as usize)
        } else {
            (0, self.count())
        };
        if count == 0 {
            return &[];
        }
        let bytes = (start + count) * size_of::<U64>();
        assert!(
            bytes <= body.len(),
            "corrupt freelist page {}: {} ids do not fit in {} body bytes",
            self.id(),
            count,
            body.len()
        );
        let ids = <[U64]>::ref_from_bytes(&body[..bytes]).expect("unaligned id slice");
        &ids[start..]
    }

    fn extent(&self, body_off: usize, len: usize) -> &'a [u8] {
        let body = self.body();
        assert!(
            body_off + len <= body.len(),
            "corrupt page {}: element extent {}..{} escapes {}-byte body",
            self.id(),
            body_off,
            body_off + len,
            body.len()
        );
        &body[body_off..body_off + len]
    }
}

impl std::fmt::Debug for Page<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id())
            .field("type", &self.typ().name())
            .field("count", &self.count())
            .field("overflow", &self.overflow())
            .finish()
    }
}

/// Mutable view of a page buffer being assembled for a write.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<PageMut<'a>> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for a page: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Ok(PageMut { data })
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        cast_prefix_mut(self.data, "page header")
    }

    pub fn id(&self) -> Pgid {
        self.as_page().id()
    }

    pub fn flags(&self) -> u16 {
        self.as_page().flags()
    }

    pub fn count(&self) -> usize {
        self.as_page().count()
    }

    pub fn set_id(&mut self, id: Pgid) {
        self.header_mut().id.set(id);
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.header_mut().flags.set(flags);
    }

    pub fn set_count(&mut self, count: u16) {
        self.header_mut().count.set(count);
    }

    pub fn set_overflow(&mut self, overflow: u32) {
        self.header_mut().overflow.set(overflow);
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Read-only view of the buffer in its current state.
    pub fn as_page(&self) -> Page<'_> {
        Page::from_bytes(self.data).expect("sized at construction")
    }
}

/// Returns the sorted multiset union of two ascending pgid sequences.
pub fn merge(a: &[Pgid], b: &[Pgid]) -> Vec<Pgid> {
    if a.is_empty() {
        return b.to_vec();
    }
    if b.is_empty() {
        return a.to_vec();
    }
    let mut dst = vec![0; a.len() + b.len()];
    merge_pgids(&mut dst, a, b);
    dst
}

/// Copies the sorted multiset union of `a` and `b` into `dst`.
///
/// Rather than merging one element at a time, each round binary-searches the
/// lead sequence for the longest prefix not exceeding the head of the other
/// sequence and copies it wholesale, which degrades gracefully to a pair of
/// `copy_from_slice` calls when the inputs do not interleave.
///
/// Panics if `dst` is shorter than `a.len() + b.len()`.
pub fn merge_pgids(dst: &mut [Pgid], a: &[Pgid], b: &[Pgid]) {
    assert!(
        dst.len() >= a.len() + b.len(),
        "merge_pgids: destination length {} < {} + {}",
        dst.len(),
        a.len(),
        b.len()
    );
    if a.is_empty() {
        dst[..b.len()].copy_from_slice(b);
        return;
    }
    if b.is_empty() {
        dst[..a.len()].copy_from_slice(a);
        return;
    }

    // lead always starts at or below follow's head.
    let (mut lead, mut follow) = if b[0] < a[0] { (b, a) } else { (a, b) };
    let mut out = 0;

    while !lead.is_empty() {
        let n = lead.partition_point(|&id| id <= follow[0]);
        dst[out..out + n].copy_from_slice(&lead[..n]);
        out += n;
        if n >= lead.len() {
            lead = &[];
            break;
        }
        let rest = &lead[n..];
        lead = follow;
        follow = rest;
    }

    dst[out..out + follow.len()].copy_from_slice(follow);
}
