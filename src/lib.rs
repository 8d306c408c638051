//! # BurrowDB - Embedded Memory-Mapped Key/Value Store
//!
//! BurrowDB is an embedded, single-file key/value store organized as a
//! copy-on-write B+tree with multi-version concurrency control: one writer,
//! any number of readers, and no locks on the read path.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::Db;
//!
//! let db = Db::open("./my.db")?;
//!
//! let tx = db.begin()?;
//! let mut cursor = tx.cursor()?;
//! let mut entry = cursor.first()?;
//! while let Some((key, value)) = entry {
//!     println!("{:?} = {:?}", key, value);
//!     entry = cursor.next()?;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Db / Tx (public API)          │
//! ├─────────────────────────────────────┤
//! │  Bucket (page/node resolution)       │
//! ├──────────────────┬──────────────────┤
//! │  Cursor (btree)  │  Node (btree)    │
//! ├──────────────────┴──────────────────┤
//! │  Freelist │ Meta │ Page layout      │
//! ├─────────────────────────────────────┤
//! │  Memory-mapped single file           │
//! └─────────────────────────────────────┘
//! ```
//!
//! Readers pin a map snapshot and a meta copy at begin time and never
//! coordinate with the writer. The writer materializes the pages it touches
//! as in-memory nodes, and commit rewrites them copy-on-write to freshly
//! allocated pages: old pages are never modified, only eventually recycled
//! through the freelist once no reader can still observe them.
//!
//! ## Module Overview
//!
//! - [`storage`]: page layout, freelist allocator, meta pages, mapping
//! - [`btree`]: materialized nodes and cursor traversal
//! - [`Db`] / [`Tx`] / [`Bucket`]: transaction lifecycle and resolution

pub mod btree;
pub mod storage;

mod bucket;
mod db;
mod error;
mod tx;

pub use btree::{Cursor, Entry};
pub use bucket::Bucket;
pub use db::Db;
pub use error::Error;
pub use storage::{Pgid, Txid};
pub use tx::Tx;
