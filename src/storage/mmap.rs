//! # Memory-Mapped File Storage
//!
//! `MmapStorage` owns the database file and a read-only memory map over it.
//! Reads are zero-copy slices into the map; writes never touch the map and
//! go through positioned file writes instead.
//!
//! ## Snapshot Model
//!
//! The current map lives behind a mutex as an `Arc<Mmap>`. Every transaction
//! takes its own `Arc` clone at begin time and resolves pages against that
//! snapshot for its entire life. When a commit grows the file, it installs a
//! fresh map with [`MmapStorage::remap`]; readers opened earlier keep their
//! old (shorter) map, which still covers every page their snapshot can
//! reach, and the old mapping is unmapped when the last such reader drops
//! its `Arc`. No reader is ever invalidated mid-transaction.
//!
//! ## Why Writes Bypass the Map
//!
//! Copy-on-write means a committed page is only ever written to an id no
//! open reader resolves, so positioned writes plus `fdatasync` give the
//! crash guarantee without a writable mapping. It also keeps the safety
//! argument for the `unsafe` map construction short: the map is read-only
//! and this process is the only writer.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::Mutex;

use super::page::Pgid;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    map: Mutex<Arc<Mmap>>,
    page_size: usize,
}

impl MmapStorage {
    /// Opens an existing database file. The caller supplies the page size
    /// (recorded in the meta pages) so the file length can be validated.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty database file '{}'",
            path.display()
        );
        ensure!(
            file_size % page_size as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        let map = Self::map_file(&file, path)?;

        Ok(Self {
            file,
            map: Mutex::new(Arc::new(map)),
            page_size,
        })
    }

    fn map_file(file: &File, path: &Path) -> Result<Mmap> {
        // SAFETY: Mmap::map is unsafe because the mapping becomes
        // unsynchronized with the file if another process truncates or
        // rewrites it. This is safe because:
        // 1. Database files are owned exclusively by this process; the
        //    single-writer lock in Db serializes all writes.
        // 2. The map is read-only; this process never writes through it.
        // 3. The file is only ever extended, never truncated, so mapped
        //    offsets stay valid for the life of the map.
        unsafe {
            Mmap::map(file).wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))
        }
    }

    /// The current map. Transactions hold the returned `Arc` for their whole
    /// lifetime so a later remap cannot pull pages out from under them.
    pub fn snapshot(&self) -> Arc<Mmap> {
        self.map.lock().clone()
    }

    /// Writes one logical page (`data` may span multiple physical pages) at
    /// its file position, bypassing the map.
    pub fn write_page(&self, pgid: Pgid, data: &[u8]) -> Result<()> {
        let offset = pgid
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| eyre::eyre!("page id {} overflows file offset", pgid))?;
        self.file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to write page {}", pgid))
    }

    /// Extends the file to hold `page_count` pages. Never shrinks.
    pub fn grow(&self, page_count: u64) -> Result<()> {
        let new_size = page_count * self.page_size as u64;
        let current = self
            .file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();
        if new_size <= current {
            return Ok(());
        }
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))
    }

    /// Maps the file at its current length and publishes the new map.
    /// Existing snapshots are unaffected.
    pub fn remap(&self) -> Result<()> {
        let map = Self::map_file(&self.file, Path::new(""))
            .wrap_err("failed to remap database file")?;
        *self.map.lock() = Arc::new(map);
        Ok(())
    }

    /// Durability point: flushes file data to stable storage (fdatasync).
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err("failed to sync database file")
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages currently mapped.
    pub fn page_count(&self) -> u64 {
        self.map.lock().len() as u64 / self.page_size as u64
    }

    /// Hints the OS to fault in a page run ahead of use.
    pub fn prefetch(&self, pgid: Pgid, count: u64) {
        let map = self.snapshot();
        let start = pgid as usize * self.page_size;
        if start >= map.len() {
            return;
        }
        let len = (count as usize * self.page_size).min(map.len() - start);

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is advisory. The range is
        // clamped to the mapped region above, and the snapshot keeps the
        // mapping alive for the duration of the call.
        unsafe {
            libc::madvise(
                map.as_ptr().add(start) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
    }
}
