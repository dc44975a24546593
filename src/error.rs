//! Crate-wide error kinds.
//!
//! Each subsystem defines its own `thiserror`-derived error enum
//! (`BloomError`, `BlockError`, `SstableError`, `WalError`,
//! `MemtableError`, `ManifestError`, `CompactionError`). [`EngineError`]
//! wraps all of them via `#[from]` so callers interacting with [`crate::engine::Engine`]
//! only ever see one error type.

use std::io;
use thiserror::Error;

use crate::{
    compaction::CompactionError, manifest::ManifestError, memtable::MemtableError,
    sstable::SstableError, wal::WalError,
};

/// Coarse-grained error classification, matching the seven kinds every
/// subsystem error ultimately maps onto: `Io`, `Corruption`,
/// `UnsupportedVersion`, `InvalidArgument`, `Closed`, and `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Underlying filesystem failure.
    Io,
    /// Magic/CRC/structural mismatch.
    Corruption,
    /// A file's format version is newer than this build understands.
    UnsupportedVersion,
    /// Caller-supplied argument violates a documented constraint.
    InvalidArgument,
    /// Operation issued after the engine was closed.
    Closed,
    /// Invariant violation; should not happen outside of a bug.
    Internal,
}

/// Top-level error type returned by [`crate::engine::Engine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// WAL subsystem failure.
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// Memtable subsystem failure.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// SSTable subsystem failure.
    #[error("sstable error: {0}")]
    Sstable(#[from] SstableError),

    /// Manifest subsystem failure.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Compaction subsystem failure.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying I/O failure not attributable to a specific subsystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Caller-supplied key or value violates a documented constraint.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A file's format version exceeds what this build supports.
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// Operation attempted after the engine was closed.
    #[error("engine is closed")]
    Closed,

    /// Invariant violation. Indicates a bug rather than environmental
    /// failure.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    /// Classifies this error into one of the seven coarse kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EngineError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            EngineError::Closed => ErrorKind::Closed,
            EngineError::Internal(_) => ErrorKind::Internal,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Wal(e) => e.kind(),
            EngineError::Memtable(e) => e.kind(),
            EngineError::Sstable(e) => e.kind(),
            EngineError::Manifest(e) => e.kind(),
            EngineError::Compaction(e) => e.kind(),
        }
    }
}

/// Maximum key length in bytes, per the key/value data model.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Maximum value length in bytes, per the key/value data model.
pub const MAX_VALUE_LEN: u64 = u32::MAX as u64;

/// Validates a key against the documented constraints, returning
/// [`EngineError::InvalidArgument`] on violation.
pub fn validate_key(key: &[u8]) -> Result<(), EngineError> {
    if key.is_empty() {
        return Err(EngineError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "key length {} exceeds maximum {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Validates a value against the documented constraints.
///
/// An empty value is legal and distinct from a tombstone.
pub fn validate_value(value: &[u8]) -> Result<(), EngineError> {
    if value.len() as u64 > MAX_VALUE_LEN {
        return Err(EngineError::InvalidArgument(format!(
            "value length {} exceeds maximum {}",
            value.len(),
            MAX_VALUE_LEN
        )));
    }
    Ok(())
}
