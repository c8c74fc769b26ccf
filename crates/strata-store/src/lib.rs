//! Content-addressed chunk store over a pool of storage directories.
//!
//! A [`ChunkStore`] keeps two namespaces of chunks: *data* chunks, whose
//! hash must match their content, and *meta-data* chunks, stored under a
//! hash the caller chooses. Chunks live in strata blocks spread across one
//! or more capacity-bounded directories; a prefix routing table maps every
//! hash to the one block responsible for it.
//!
//! # Architecture
//!
//! - [`RoutingTable`] -- prefix-free map from block prefix to block
//! - [`HashIndex`] -- bounded in-memory set of stored hashes per namespace
//! - Registration -- scans a directory, loads its blocks and reconciles
//!   interrupted rewrites and copies
//! - Balancing -- moves whole blocks from the fullest directory to the emptiest
//!
//! # Design Rules
//!
//! 1. A chunk is stored at most once per namespace; re-adding fails with
//!    [`StoreError::AlreadyExists`].
//! 2. A data chunk whose hash does not match its bytes is never written.
//! 3. Directory accounting always equals the sum of its blocks' accounted bytes.
//! 4. Reopening a store over the same directories, in any order, yields the
//!    same set of chunks.

pub mod balance;
pub mod config;
pub mod error;
pub mod index;
pub mod routes;
pub mod scan;
pub mod store;

pub use config::{BalanceConfig, DirectoryConfig, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use index::HashIndex;
pub use routes::RoutingTable;
pub use scan::{scan_directory, PendingArtifact, ScanResult};
pub use store::{ChunkStore, DirectoryStats, StoreStats};
