//! # User-Facing Error Kinds
//!
//! Misuse of the public API surfaces as one of the typed variants below,
//! carried inside an `eyre::Report` so call sites keep the crate-wide
//! `Result` alias while still being able to match on the kind:
//!
//! ```ignore
//! match cursor.delete() {
//!     Err(e) if e.downcast_ref() == Some(&Error::TxNotWritable) => { ... }
//!     other => other?,
//! }
//! ```
//!
//! Structural corruption is deliberately NOT represented here. A page whose
//! flags are invalid, a freelist containing a reserved id, or a double-free
//! all mean the on-disk structure can no longer be trusted, and the engine
//! panics rather than let a caller continue against a suspect file.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The transaction backing this handle has already been committed or
    /// rolled back.
    #[error("transaction has already been committed or rolled back")]
    TxClosed,

    /// A mutation was attempted through a read-only transaction.
    #[error("transaction is not writable")]
    TxNotWritable,

    /// The element under the cursor is a nested tree reference and cannot be
    /// deleted as if it were a plain value.
    #[error("incompatible value: element is a nested tree")]
    IncompatibleValue,
}
