//! Hash-prefix routing paths.
//!
//! A block with prefix bytes `p0 p1 .. pk` lives at
//! `blocks/<p0>/<p1>/../<pk>.blk` (each byte as two hex digits). When it
//! splits, its children live in the directory `blocks/<p0>/../<pk>/`.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use strata_types::ContentHash;

use crate::directory::StorageDirectory;

/// Directory under each storage root that holds the block tree.
pub const BLOCKS_DIR: &str = "blocks";

/// Extension of a live block file.
pub const BLOCK_EXT: &str = "blk";

/// Suffix of a file set aside because it could not be read.
pub const CORRUPT_SUFFIX: &str = "corrupt";

/// A pending artifact left behind by an interrupted rewrite or copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Pre-split or pre-compaction copy of a block.
    Backup,
    /// Partial copy written while relocating a block.
    Moving,
    /// Artifact claimed for re-insertion; removed once every entry is back.
    Merging,
}

impl ArtifactKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Moving => "moving",
            Self::Merging => "merging",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "backup" => Some(Self::Backup),
            "moving" => Some(Self::Moving),
            "merging" => Some(Self::Merging),
            _ => None,
        }
    }
}

/// The hash prefix a block is responsible for.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPrefix(Vec<u8>);

impl BlockPrefix {
    /// Prefix made of the first `len` bytes of `hash`.
    pub fn of(hash: &ContentHash, len: usize) -> Self {
        let len = len.clamp(1, ContentHash::LEN);
        Self(hash.as_bytes()[..len].to_vec())
    }

    /// Build a prefix from raw bytes. Returns `None` for an empty or over-long prefix.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > ContentHash::LEN {
            return None;
        }
        Some(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; a prefix holds at least one byte.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A prefix spanning the whole hash can never split.
    pub fn is_full(&self) -> bool {
        self.0.len() == ContentHash::LEN
    }

    /// Returns `true` if `hash` routes to this prefix.
    pub fn covers(&self, hash: &ContentHash) -> bool {
        hash.starts_with(&self.0)
    }

    /// Returns `true` if this prefix is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &BlockPrefix) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.0)
    }

    /// The prefix extended by one byte.
    pub fn child(&self, next: u8) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(next);
        Self(bytes)
    }

    /// The byte of `hash` that follows this prefix.
    pub fn next_byte(&self, hash: &ContentHash) -> Option<u8> {
        hash.as_bytes().get(self.0.len()).copied()
    }

    /// The shortest prefix of `hash`, at least `min_len` bytes long, for which
    /// `occupied` is false.
    ///
    /// `occupied(p)` should report whether some existing block prefix equals
    /// or extends `p`. Used to place a new block so the prefix set stays
    /// prefix-free.
    pub fn vacant(hash: &ContentHash, min_len: usize, occupied: impl Fn(&BlockPrefix) -> bool) -> Self {
        for len in min_len.max(1)..ContentHash::LEN {
            let candidate = Self::of(hash, len);
            if !occupied(&candidate) {
                return candidate;
            }
        }
        Self::of(hash, ContentHash::LEN)
    }

    /// Path of the block file relative to the blocks root.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = self.parent_dir();
        let last = self.0[self.0.len() - 1];
        path.push(format!("{last:02x}.{BLOCK_EXT}"));
        path
    }

    /// Directory, relative to the blocks root, that holds this prefix's children.
    pub fn children_dir(&self) -> PathBuf {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Absolute path of the block file inside `dir`.
    pub fn block_path(&self, dir: &StorageDirectory) -> PathBuf {
        dir.blocks_root().join(self.relative_path())
    }

    fn parent_dir(&self) -> PathBuf {
        self.0[..self.0.len() - 1]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Display for BlockPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPrefix({self})")
    }
}

/// Path of an artifact next to the block file at `block_path`.
pub fn artifact_path(block_path: &Path, kind: ArtifactKind) -> PathBuf {
    let mut name = block_path.as_os_str().to_owned();
    name.push(".");
    name.push(kind.suffix());
    PathBuf::from(name)
}

/// Returns `true` for a file set aside by [`crate::artifact::set_aside`].
pub fn is_set_aside(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.split('.').any(|piece| piece.starts_with(CORRUPT_SUFFIX)))
}

/// A file found under a blocks root, classified by its name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockFileName {
    pub prefix: BlockPrefix,
    pub artifact: Option<ArtifactKind>,
}

/// Classify a path relative to the blocks root.
///
/// Returns `None` for anything that is not a block file or artifact.
pub fn classify(relative: &Path) -> Option<BlockFileName> {
    let mut bytes = Vec::new();
    let mut components = relative.components().peekable();
    let mut file_name = None;
    while let Some(component) = components.next() {
        let Component::Normal(part) = component else {
            return None;
        };
        let part = part.to_str()?;
        if components.peek().is_some() {
            bytes.push(parse_hex_byte(part)?);
        } else {
            file_name = Some(part);
        }
    }

    let mut pieces = file_name?.split('.');
    bytes.push(parse_hex_byte(pieces.next()?)?);
    if pieces.next()? != BLOCK_EXT {
        return None;
    }
    let artifact = match pieces.next() {
        None => None,
        Some(suffix) => Some(ArtifactKind::from_suffix(suffix)?),
    };
    if pieces.next().is_some() {
        return None;
    }

    Some(BlockFileName {
        prefix: BlockPrefix::from_bytes(&bytes)?,
        artifact,
    })
}

fn parse_hex_byte(s: &str) -> Option<u8> {
    if s.len() != 2 || !s.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)) {
        return None;
    }
    u8::from_str_radix(s, 16).ok()
}
