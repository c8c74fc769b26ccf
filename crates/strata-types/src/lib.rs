//! Foundation types for the strata chunk store.
//!
//! Every other strata crate depends on `strata-types`.
//!
//! # Key Types
//!
//! - [`ContentHash`] -- fixed-width, ordered chunk identifier
//! - [`ChunkKind`] -- namespace of a chunk (data or meta-data)

pub mod error;
pub mod hash;
pub mod kind;

pub use error::TypeError;
pub use hash::ContentHash;
pub use kind::ChunkKind;
