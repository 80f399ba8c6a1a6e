//! The closed error taxonomy from spec.md §7.

use std::fmt;

/// Every error `slotcache` can return. Matches spec.md §7 exactly: nine
/// named kinds plus `Writeback`.
#[derive(Debug, thiserror::Error)]
pub enum SlotCacheError {
    /// Caller-supplied length mismatch (key/index/prefix), negative scan
    /// offset/limit, or an empty prefix. Recoverable by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation attempted on a closed cache or writer.
    #[error("operation on a closed handle")]
    Closed,

    /// Transient: another writer holds the in-process mutex or advisory
    /// lock, a seqlock snapshot could not be taken within the retry bound,
    /// or `Open` observed an odd generation with the advisory lock held.
    #[error("cache busy: {0}")]
    Busy(&'static str),

    /// The writer's buffered-operation cap was exceeded.
    #[error("writer buffer full (cap = {cap})")]
    BufferFull { cap: usize },

    /// Commit-time capacity would be exceeded; no state change occurred.
    #[error("commit would exceed slot_capacity")]
    Full,

    /// `ordered_keys` rejected the insert set; no state change occurred.
    #[error("insert violates ordered-key monotonicity")]
    OutOfOrderInsert,

    /// File geometry/flags/user_version/reserved bytes do not match the
    /// requested options. Deterministic: delete and recreate the file.
    #[error("incompatible file: {0}")]
    Incompatible(String),

    /// Header CRC mismatch, an invariant violation discovered at runtime,
    /// or an odd generation with no writer holding the lock (crashed
    /// writer). Terminal for this file.
    #[error("corrupt file: {0}")]
    Corrupt(String),

    /// The cache's `state` byte is set to invalidated. Terminal until the
    /// file is recreated.
    #[error("cache has been invalidated")]
    Invalidated,

    /// One or more `msync` calls failed during commit. The commit is
    /// visible in memory (and likely on disk), but durability is not
    /// guaranteed.
    #[error("writeback failed: {source}")]
    Writeback {
        #[source]
        source: std::io::Error,
    },
}

impl SlotCacheError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::Incompatible(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

/// Marker kind, useful for callers that want to `match` on error class
/// without destructuring the full enum (e.g. deciding "retry" vs
/// "recreate the file").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Closed,
    Busy,
    BufferFull,
    Full,
    OutOfOrderInsert,
    Incompatible,
    Corrupt,
    Invalidated,
    Writeback,
}

impl SlotCacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Closed => ErrorKind::Closed,
            Self::Busy(_) => ErrorKind::Busy,
            Self::BufferFull { .. } => ErrorKind::BufferFull,
            Self::Full => ErrorKind::Full,
            Self::OutOfOrderInsert => ErrorKind::OutOfOrderInsert,
            Self::Incompatible(_) => ErrorKind::Incompatible,
            Self::Corrupt(_) => ErrorKind::Corrupt,
            Self::Invalidated => ErrorKind::Invalidated,
            Self::Writeback { .. } => ErrorKind::Writeback,
        }
    }

    /// `true` for kinds that invite a retry (`Busy`, `Writeback`); `false`
    /// for terminal/rebuild-class kinds.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Busy | ErrorKind::Writeback)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Closed => "closed",
            ErrorKind::Busy => "busy",
            ErrorKind::BufferFull => "buffer_full",
            ErrorKind::Full => "full",
            ErrorKind::OutOfOrderInsert => "out_of_order_insert",
            ErrorKind::Incompatible => "incompatible",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Invalidated => "invalidated",
            ErrorKind::Writeback => "writeback",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, SlotCacheError>;
