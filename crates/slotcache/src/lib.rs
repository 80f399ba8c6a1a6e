//! `slotcache`: a single-file, memory-mapped, crash-safe key/value cache.
//!
//! See the crate-level modules for the on-disk format ([`format`],
//! [`header`], [`layout`]), the concurrency protocol ([`seqlock`]), the
//! process-wide coordination primitives ([`registry`]), and the public
//! surface ([`cache`], [`writer`]).

pub mod cache;
pub mod entry;
pub mod error;
pub mod format;
pub mod header;
pub mod layout;
pub mod options;
mod probe;
pub mod registry;
pub mod seqlock;
pub mod writer;

pub use cache::Cache;
pub use entry::{Entry, PrefixSpec, ScanFilter, ScanOptions};
pub use error::{ErrorKind, Result, SlotCacheError};
pub use options::{OpenOptions, WritebackMode};
pub use writer::Writer;
