//! Error types for the allele storage engine.
//!
//! A single [`Error`] enum covers every domain-level failure kind the
//! engine can surface to a caller. [`thiserror`] derives `Display` and
//! `std::error::Error`; an [`Error::IoError`](Error) variant absorbs
//! `std::io::Error` via `#[from]` so `?` works across positional-I/O call
//! sites in the storage layer.

use std::io;
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Domain-level error kinds, matching the engine's error handling design.
#[derive(Debug, Error)]
pub enum Error {
    /// CRC mismatch, a record-size/byte-cursor mismatch, both index shadow
    /// slots unreadable, or a decoded record count disagreeing with its bin.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// The underlying file's read/write/flush/allocate failed.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] io::Error),

    /// File allocation could not be satisfied and no pages are reclaimable.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// The page cache has no evictable pages. Recovered internally by the
    /// I/O task manager; callers of the public API should never observe
    /// this variant directly (see [`Error::is_recoverable`]).
    #[error("page cache saturated")]
    CacheSaturated,

    /// Another process holds the storage file's advisory exclusive lock.
    #[error("storage file busy: {0}")]
    Busy(String),

    /// A caller-supplied argument was out of range or otherwise invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An update was requested on an engine opened read-only.
    #[error("engine is read-only")]
    ReadOnly,

    /// A prior `IoFailure` left the committed state possibly inconsistent;
    /// the engine refuses all further operations until reopened.
    #[error("engine is poisoned and must be reopened")]
    Poisoned,
}

impl Error {
    /// `true` for errors the engine resolves internally without surfacing
    /// to the caller of the originating public operation (`CacheSaturated`
    /// is retried after nudging the scheduler to reorganize).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::CacheSaturated)
    }

    /// `true` for errors that leave the engine's committed state
    /// self-consistent and safe to keep using.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::CacheSaturated | Error::ReadOnly)
    }

    /// Shorthand for constructing [`Error::Corrupt`] from a `Display`able reason.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt(reason.into())
    }

    /// Shorthand for constructing [`Error::InvalidArgument`].
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument(reason.into())
    }
}
