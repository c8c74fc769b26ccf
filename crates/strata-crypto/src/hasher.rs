use std::io::{self, Read};

use strata_types::ContentHash;

/// Derives data chunk hashes.
///
/// Hashes are computed in BLAKE3's key derivation mode with a fixed context
/// string, so a chunk hash never equals a plain BLAKE3 digest of the same
/// bytes, nor a hash derived under another context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentHasher {
    context: &'static str,
}

impl ContentHasher {
    /// Hasher for data chunks.
    pub const DATA: Self = Self::new("strata chunk store 2024 data chunk v1");

    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    pub fn hash(&self, bytes: &[u8]) -> ContentHash {
        ContentHash::from_bytes(blake3::derive_key(self.context, bytes))
    }

    /// Hash everything `reader` yields without buffering it whole.
    pub fn hash_reader(&self, mut reader: impl Read) -> io::Result<ContentHash> {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        io::copy(&mut reader, &mut hasher)?;
        Ok(ContentHash::from_bytes(*hasher.finalize().as_bytes()))
    }

    /// Returns `true` if `bytes` hash to `expected`.
    pub fn verify(&self, bytes: &[u8], expected: &ContentHash) -> bool {
        self.hash(bytes) == *expected
    }

    pub fn context(&self) -> &'static str {
        self.context
    }
}
