//! Error types shared across the runtime-verification crate.

use thiserror::Error;

/// Everything that can go wrong inside the RV layer.
///
/// Internal operations return `Result<T, RvError>`. The four top-level
/// interposition entry points (`read`, `write`, `tx_start`, `tx_commit`)
/// never let an `RvError` escape to the caller: on `Err` they disable the
/// RV and return `()`.
#[derive(Debug, Error)]
pub enum RvError {
    /// Two intervals in the interval map overlap.
    #[error("interval [{start}, {end}) overlaps an existing interval")]
    Overlap {
        /// Start of the interval that was rejected.
        start: u32,
        /// End of the interval that was rejected.
        end: u32,
    },
    /// A block number has no known type.
    #[error("block {0} has no registered type")]
    UnknownBlock(u32),
    /// The device could not satisfy a read or write.
    #[error("device I/O error: {0}")]
    Device(#[from] std::io::Error),
    /// A block's on-disk layout failed to parse.
    #[error("malformed block {block}: {reason}")]
    Malformed {
        /// Block that failed to parse.
        block: u32,
        /// Human-readable reason.
        reason: &'static str,
    },
    /// A transaction operation was requested while the core was in the
    /// wrong state (e.g. `tx_commit` with no transaction in progress).
    #[error("transaction protocol violation: {0}")]
    Protocol(&'static str),
    /// A block was predeclared (or otherwise expected to be fresh) but
    /// already has a cache entry (two on-disk structures claiming the same
    /// block, which is corruption, not a bookkeeping bug).
    #[error("block {0} already has a cache entry")]
    Exists(u32),
    /// A block that should already be present in a cache (typically the
    /// write cache, for a block the filesystem must have just written) is
    /// missing.
    #[error("block {0} not found in the expected cache")]
    NotFound(u32),
    /// An inode expected to be a directory is not one.
    #[error("inode {0} is not a directory")]
    NotDir(u32),
    /// A file grew past what a single indirect block can address.
    #[error("file exceeds the maximum size addressable by one indirect block")]
    FileTooBig,
    /// The change sink (or an optional fact base layered on top of it)
    /// failed to record a change.
    #[error("change sink error: {0}")]
    Sink(String),
    /// Raised only by a caller-supplied `FactSink`; the core itself never
    /// allocates in a way that can fail short of aborting the process.
    #[error("out of memory")]
    NoMem,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RvError>;
