use std::io;
use std::path::PathBuf;

use strata_types::{ChunkKind, ContentHash};

/// Errors from block operations.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// No live entry for the hash in this namespace.
    #[error("{kind} chunk not found: {hash}")]
    NotFound { hash: ContentHash, kind: ChunkKind },

    /// A live entry for the hash already exists in this namespace.
    #[error("{kind} chunk already exists: {hash}")]
    AlreadyExists { hash: ContentHash, kind: ChunkKind },

    /// Appending would exceed the block's size or slot limit.
    #[error("block {prefix} is full")]
    CapacityExceeded { prefix: String },

    /// The header entry is intact but its payload lies beyond end of file.
    #[error("payload of {hash} truncated: entry ends at {end}, file is {file_len} bytes")]
    Truncated {
        hash: ContentHash,
        end: u64,
        file_len: u64,
    },

    /// The block file or one of its payloads failed validation.
    #[error("corrupt block {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A storage directory path cannot be used.
    #[error("directory unavailable {path}: {reason}")]
    DirectoryUnavailable { path: PathBuf, reason: String },

    /// A rewrite was interrupted before all entries were written.
    #[error("merge failure: {0}")]
    MergeFailure(String),

    /// The block was split or removed; the caller must re-route.
    #[error("block {0} has been retired")]
    Retired(String),

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for block operations.
pub type BlockResult<T> = Result<T, BlockError>;
