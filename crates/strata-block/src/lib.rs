//! On-disk block storage for the strata chunk store.
//!
//! A block is one file holding a bounded table of chunk headers followed by
//! the chunk payloads. Blocks are addressed by hash prefix: a block with
//! prefix `ab 0c` lives at `blocks/ab/0c.blk` under its storage directory,
//! and holds every chunk whose hash starts with those bytes.
//!
//! # Architecture
//!
//! - **StorageDirectory**: a capacity-bounded filesystem root with byte accounting
//! - **Block**: one block file, guarded by a reader/writer lock
//! - **Split**: a full block is rewritten as children one prefix byte longer
//! - **Compaction**: a block is rewritten without its deleted entries
//! - **Relocation**: a whole block is copied to another directory
//! - **Artifacts**: `.blk.backup` and `.blk.moving` files left by interrupted
//!   rewrites, claimed as `.blk.merging` and re-inserted with
//!   [`Block::merge_pending`]. Unreadable files are set aside as `.corrupt`.
//!
//! # Features
//!
//! - `fault-injection`: exports `FailAfter` for
//!   interrupting rewrites from outside this crate
//!
//! # Design Rules
//!
//! 1. A header entry, once written, is never moved; deletion only flips a flag.
//! 2. Payload bytes are durable before the header entry that points at them.
//! 3. Every mutation adjusts its directory's accounting by the exact change in
//!    [`BlockReader::accounted_bytes`].
//! 4. A failed rewrite leaves either the old file or a backup artifact pair.

pub mod artifact;
pub mod block;
pub mod compact;
pub mod config;
pub mod deletion_log;
pub mod directory;
pub mod error;
pub mod fault;
pub mod format;
pub mod path;
pub mod relocate;
pub mod split;

pub use artifact::{read_deleted, read_pending, set_aside, PendingEntry};
pub use block::{AddOutcome, Block, BlockReader, BlockState, BlockWriter, EntrySummary};
pub use compact::{CompactOutcome, MergeOutcome, COMPACT_MIN_SAVINGS};
pub use config::BlockConfig;
pub use deletion_log::DeletionLog;
pub use directory::{StorageDirectory, UNBOUNDED};
pub use error::{BlockError, BlockResult};
#[cfg(any(test, feature = "fault-injection"))]
pub use fault::FailAfter;
pub use fault::{FaultInjector, NoFaults};
pub use format::{ENTRY_SIZE, FILE_HEADER_SIZE};
pub use path::{
    artifact_path, classify, is_set_aside, ArtifactKind, BlockFileName, BlockPrefix, BLOCKS_DIR, BLOCK_EXT,
    CORRUPT_SUFFIX,
};
