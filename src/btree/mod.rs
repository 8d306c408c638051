//! # B+Tree Traversal and Node Materialization
//!
//! This module implements the in-memory side of the copy-on-write B+tree:
//! materialized nodes and the positioned cursor that traverses a tree whose
//! parts may live on disk (as mapped pages) or in memory (as nodes dirtied
//! by the current write transaction).
//!
//! ## Page/Node Duality
//!
//! A page becomes a [`Node`] the first time a write transaction touches it;
//! from then on the node shadows the page for the rest of the transaction.
//! Both shapes answer the same questions (am I a leaf, how many elements do
//! I hold, what is element `i`), so the cursor can binary-search either
//! without caring which one it got. The resolver that makes the
//! choice is `Bucket::page_node`; at every cursor stack frame the node, if
//! one exists, takes precedence over the page, which is what makes a
//! transaction's own writes visible to its cursors without a flush.
//!
//! ## Structure
//!
//! - `node`: mutable materialized pages (`Node`, `Inode`), serialization
//! - `cursor`: root-to-leaf stack traversal (first/last/next/prev/seek)

mod cursor;
mod node;

pub use cursor::{Cursor, ElemRef, Entry, PageNode};
pub use node::{Inode, Node};
