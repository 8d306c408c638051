//! # Meta Pages
//!
//! Pages 0 and 1 each hold a copy of the database metadata. Commits
//! alternate between the two slots (`txid % 2`), so a crash mid-write
//! destroys at most the copy being written and open always falls back to
//! the other one. The copy with the higher txid that passes validation wins.
//!
//! ## Meta Layout (56 bytes, little-endian, at the page body)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 0       4     magic      File identification
//! 4       4     version    Format version
//! 8       4     page_size  Page size the file was created with
//! 12      4     flags      Reserved
//! 16      8     root       Root page of the key/value tree
//! 24      8     freelist   Page holding the serialized freelist
//! 32      8     pgid       High-water mark: first id past the file end
//! 40      8     txid       Transaction that wrote this meta
//! 48      8     checksum   CRC-64 over the 48 bytes above
//! ```

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::page::{Page, PageMut, Pgid, Txid, META_PAGE_FLAG};

pub const META_MAGIC: u32 = 0x6275_7277;
pub const META_VERSION: u32 = 1;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    root: U64,
    freelist: U64,
    pgid: U64,
    txid: U64,
    checksum: U64,
}

impl Meta {
    pub fn new(page_size: u32, root: Pgid, freelist: Pgid, pgid: Pgid, txid: Txid) -> Meta {
        let mut meta = Meta {
            magic: U32::new(META_MAGIC),
            version: U32::new(META_VERSION),
            page_size: U32::new(page_size),
            flags: U32::new(0),
            root: U64::new(root),
            freelist: U64::new(freelist),
            pgid: U64::new(pgid),
            txid: U64::new(txid),
            checksum: U64::new(0),
        };
        meta.update_checksum();
        meta
    }

    /// Reads the meta stored at the body of a meta page.
    pub fn from_page(page: &Page<'_>) -> Result<Meta> {
        let body = page.body();
        ensure!(
            body.len() >= size_of::<Meta>(),
            "page {} too small for meta: {} < {}",
            page.id(),
            body.len(),
            size_of::<Meta>()
        );
        Meta::read_from_bytes(&body[..size_of::<Meta>()])
            .map_err(|e| eyre::eyre!("failed to read meta: {:?}", e))
    }

    /// Writes this meta onto a page buffer, stamping the page header.
    pub fn write_to(&self, page: &mut PageMut<'_>, id: Pgid) {
        page.set_id(id);
        page.set_flags(META_PAGE_FLAG);
        page.body_mut()[..size_of::<Meta>()].copy_from_slice(self.as_bytes());
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn root(&self) -> Pgid {
        self.root.get()
    }

    pub fn set_root(&mut self, root: Pgid) {
        self.root.set(root);
    }

    pub fn freelist(&self) -> Pgid {
        self.freelist.get()
    }

    pub fn set_freelist(&mut self, freelist: Pgid) {
        self.freelist.set(freelist);
    }

    /// High-water mark: the id the file grows from when the freelist has no
    /// fitting run.
    pub fn pgid(&self) -> Pgid {
        self.pgid.get()
    }

    pub fn set_pgid(&mut self, pgid: Pgid) {
        self.pgid.set(pgid);
    }

    pub fn txid(&self) -> Txid {
        self.txid.get()
    }

    pub fn set_txid(&mut self, txid: Txid) {
        self.txid.set(txid);
    }

    /// Recomputes the checksum over every preceding field. Must be called
    /// after any mutation, before the meta is written out.
    pub fn update_checksum(&mut self) {
        self.checksum.set(self.sum64());
    }

    fn sum64(&self) -> u64 {
        let bytes = self.as_bytes();
        CRC64.checksum(&bytes[..bytes.len() - size_of::<U64>()])
    }

    /// Rejects a meta that was torn by a crash, belongs to a different file
    /// format, or was created with a different page size than this runtime
    /// uses.
    pub fn validate(&self, page_size: u32) -> Result<()> {
        ensure!(
            self.magic.get() == META_MAGIC,
            "invalid database: bad magic {:#x}",
            self.magic.get()
        );
        ensure!(
            self.version.get() == META_VERSION,
            "invalid database: version {} (expected {})",
            self.version.get(),
            META_VERSION
        );
        ensure!(
            self.checksum.get() == self.sum64(),
            "invalid database: meta checksum mismatch"
        );
        ensure!(
            self.page_size.get() == page_size,
            "page size mismatch: file uses {}, runtime uses {}",
            self.page_size.get(),
            page_size
        );
        Ok(())
    }
}

impl Page<'_> {
    /// The metadata stored at this page's body.
    pub fn meta(&self) -> Result<Meta> {
        Meta::from_page(self)
    }
}
