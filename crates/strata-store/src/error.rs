use std::io;
use std::path::PathBuf;

use strata_block::BlockError;
use strata_types::{ChunkKind, ContentHash};

/// Errors from chunk store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No retrievable chunk with this hash in this namespace.
    #[error("{kind} chunk not found: {hash}")]
    NotFound { hash: ContentHash, kind: ChunkKind },

    /// The chunk is already stored in this namespace.
    #[error("{kind} chunk already exists: {hash}")]
    AlreadyExists { hash: ContentHash, kind: ChunkKind },

    /// Data chunk bytes do not hash to the claimed hash.
    #[error("hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch {
        claimed: ContentHash,
        computed: ContentHash,
    },

    /// Chunk is larger than the configured maximum for its kind.
    #[error("{kind} chunk of {len} bytes exceeds maximum of {max}")]
    SizeExceeded { kind: ChunkKind, len: u64, max: u64 },

    /// A block that can no longer split is full.
    #[error("block {0} is full")]
    CapacityExceeded(String),

    /// No registered directory has room for the chunk.
    #[error("no storage directory has room for {needed} more bytes")]
    NoCapacity { needed: u64 },

    /// A storage directory path cannot be used.
    #[error("directory unavailable {path}: {reason}")]
    DirectoryUnavailable { path: PathBuf, reason: String },

    /// The chunk's header is intact but its payload lies beyond end of file.
    #[error("payload of {hash} truncated at {end} (file is {file_len} bytes)")]
    Truncated {
        hash: ContentHash,
        end: u64,
        file_len: u64,
    },

    /// A block file or payload failed validation.
    #[error("corrupt block {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// An interrupted rewrite could not be reconciled.
    #[error("merge failure: {0}")]
    MergeFailure(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error from the underlying filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<BlockError> for StoreError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::NotFound { hash, kind } => Self::NotFound { hash, kind },
            BlockError::AlreadyExists { hash, kind } => Self::AlreadyExists { hash, kind },
            BlockError::CapacityExceeded { prefix } => Self::CapacityExceeded(prefix),
            BlockError::Truncated {
                hash,
                end,
                file_len,
            } => Self::Truncated {
                hash,
                end,
                file_len,
            },
            BlockError::Corrupt { path, reason } => Self::Corrupt { path, reason },
            BlockError::DirectoryUnavailable { path, reason } => {
                Self::DirectoryUnavailable { path, reason }
            }
            BlockError::MergeFailure(msg) => Self::MergeFailure(msg),
            BlockError::Retired(prefix) => {
                Self::MergeFailure(format!("block {prefix} retired mid-operation"))
            }
            BlockError::Io(e) => Self::Io(e),
        }
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result alias for chunk store operations.
pub type StoreResult<T> = Result<T, StoreError>;
