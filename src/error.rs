//! Crate-wide error type and result alias.

use std::io;
use thiserror::Error;

/// Convenience alias used by every fallible operation in the crate.
pub type Result<T> = std::result::Result<T, GrafitoError>;

/// Errors surfaced by the storage engine and query layers.
#[derive(Debug, Error)]
pub enum GrafitoError {
    /// Underlying read/write/fsync failure. Not retried by the engine.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Bad magic, CRC mismatch, out-of-bounds section reference, or any
    /// other sign the container bytes cannot be trusted.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Caller passed something the engine cannot act on (unknown id,
    /// dimension mismatch at the API boundary, key already taken, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// First-committer-wins abort at MVCC commit validation.
    #[error("write conflict: {0}")]
    Conflict(String),
    /// Lookup of an entity the caller required to exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Operation applied to a transaction in the wrong state.
    #[error("transaction misuse: {0}")]
    TransactionMisuse(&'static str),
    /// Write attempted against a read-only database or transaction.
    #[error("database is read-only")]
    ReadOnly,
    /// WAL append would overflow the active region with auto-checkpoint off.
    #[error("write-ahead log region full ({needed} bytes needed, {available} free)")]
    WalFull {
        /// Bytes the rejected append required.
        needed: u64,
        /// Bytes left in the active region.
        available: u64,
    },
    /// Vector written under a property key whose dimension is already fixed.
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    VectorDimensionMismatch {
        /// Dimension registered for the property key.
        expected: usize,
        /// Dimension of the offered vector.
        got: usize,
    },
}

impl GrafitoError {
    /// Shorthand used by decoders rejecting untrusted bytes.
    pub(crate) fn corrupt(context: impl Into<String>) -> Self {
        GrafitoError::Corruption(context.into())
    }
}
