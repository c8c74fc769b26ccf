use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The namespace a chunk lives in.
///
/// The same hash may exist once in each namespace with unrelated payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Opaque payload whose hash is derived from its bytes.
    Data,
    /// Descriptor payload keyed by a caller-supplied hash.
    Meta,
}

impl ChunkKind {
    /// Both kinds, in tag order.
    pub const ALL: [ChunkKind; 2] = [ChunkKind::Data, ChunkKind::Meta];

    /// One-byte tag used in the on-disk block format.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Data => 1,
            Self::Meta => 2,
        }
    }

    /// Parse a tag written by [`ChunkKind::tag`].
    pub fn from_tag(tag: u8) -> Result<Self, TypeError> {
        match tag {
            1 => Ok(Self::Data),
            2 => Ok(Self::Meta),
            other => Err(TypeError::UnknownKindTag(other)),
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Meta => write!(f, "meta"),
        }
    }
}
