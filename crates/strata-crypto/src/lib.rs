//! Content hashing for the strata chunk store.
//!
//! Data chunks are identified by a domain-separated BLAKE3 hash of their
//! bytes. Meta-data chunk hashes are caller-supplied and never computed here.

pub mod hasher;

pub use hasher::ContentHasher;
