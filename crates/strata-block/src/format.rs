//! Canonical block file layout.
//!
//! ```text
//! [4 bytes: magic "STBK"]
//! [4 bytes: format version (u32 BE)]
//! [4 bytes: header slot count (u32 BE)]
//! [4 bytes: reserved]
//! [slots * 52 bytes: header table]
//! [payload region: chunk bytes in write order]
//! ```
//!
//! Each header entry is 52 bytes:
//!
//! ```text
//! [32 bytes: hash]
//! [1 byte:  kind tag]
//! [1 byte:  flags (bit0 = in use, bit1 = deleted)]
//! [2 bytes: reserved]
//! [8 bytes: payload offset (u64 BE, absolute)]
//! [4 bytes: payload length (u32 BE)]
//! [4 bytes: CRC32 of payload (u32 BE)]
//! ```
//!
//! Used slots are contiguous from slot 0; the first slot without the in-use
//! flag ends the table.

use std::io::Read;
use std::path::Path;

use strata_types::{ChunkKind, ContentHash};

use crate::error::{BlockError, BlockResult};

pub const MAGIC: &[u8; 4] = b"STBK";
pub const FORMAT_VERSION: u32 = 1;

/// Size of the fixed file header preceding the header table.
pub const FILE_HEADER_SIZE: u64 = 16;

/// Size of one header table entry. Also the per-entry accounting overhead.
pub const ENTRY_SIZE: u64 = 52;

const FLAG_USED: u8 = 0b01;
const FLAG_DELETED: u8 = 0b10;

/// Byte position of the flags field within an entry.
pub const FLAGS_OFFSET: u64 = 33;

/// Largest offset a block file can have.
pub const MAX_FILE_OFFSET: u64 = i64::MAX as u64;

/// The fixed header at the start of every block file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Number of header slots in the table.
    pub slots: u32,
}

impl FileHeader {
    pub fn new(slots: u32) -> Self {
        Self { slots }
    }

    /// Offset of the first payload byte.
    pub fn data_start(&self) -> u64 {
        FILE_HEADER_SIZE + self.slots as u64 * ENTRY_SIZE
    }

    /// Offset of the header entry in `slot`.
    pub fn slot_offset(&self, slot: usize) -> u64 {
        FILE_HEADER_SIZE + slot as u64 * ENTRY_SIZE
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.slots.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8], path: &Path) -> BlockResult<Self> {
        if buf.len() < FILE_HEADER_SIZE as usize {
            return Err(corrupt(path, "file header truncated"));
        }
        if &buf[0..4] != MAGIC {
            return Err(corrupt(
                path,
                format!("bad magic {:?}", String::from_utf8_lossy(&buf[0..4])),
            ));
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != FORMAT_VERSION {
            return Err(corrupt(path, format!("unsupported version {version}")));
        }
        let slots = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if slots == 0 {
            return Err(corrupt(path, "zero header slots"));
        }
        Ok(Self { slots })
    }
}

/// One chunk's header table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderEntry {
    pub hash: ContentHash,
    pub kind: ChunkKind,
    pub offset: u64,
    pub length: u32,
    pub crc32: u32,
    pub deleted: bool,
}

impl HeaderEntry {
    /// Offset one past the last payload byte.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length as u64)
    }

    /// Reject an entry whose payload cannot lie in the payload region of a
    /// file with `header`.
    fn check_bounds(&self, header: &FileHeader, path: &Path) -> BlockResult<()> {
        let in_region = self.offset >= header.data_start()
            && self
                .offset
                .checked_add(self.length as u64)
                .is_some_and(|end| end <= MAX_FILE_OFFSET);
        if !in_region {
            return Err(corrupt(
                path,
                format!(
                    "entry for {} has payload at {}+{} outside the payload region",
                    self.hash, self.offset, self.length
                ),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; ENTRY_SIZE as usize] {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        buf[0..32].copy_from_slice(self.hash.as_bytes());
        buf[32] = self.kind.tag();
        buf[33] = flags(self.deleted);
        buf[36..44].copy_from_slice(&self.offset.to_be_bytes());
        buf[44..48].copy_from_slice(&self.length.to_be_bytes());
        buf[48..52].copy_from_slice(&self.crc32.to_be_bytes());
        buf
    }

    /// Decode one slot. Returns `Ok(None)` for a free slot.
    pub fn decode(buf: &[u8], path: &Path) -> BlockResult<Option<Self>> {
        if buf.len() < ENTRY_SIZE as usize {
            return Err(corrupt(path, "header entry truncated"));
        }
        let flags = buf[33];
        if flags & FLAG_USED == 0 {
            return Ok(None);
        }
        let hash = ContentHash::from_slice(&buf[0..32]).map_err(|e| corrupt(path, e.to_string()))?;
        let kind = ChunkKind::from_tag(buf[32]).map_err(|e| corrupt(path, e.to_string()))?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[36..44]);
        let offset = u64::from_be_bytes(word);
        let length = u32::from_be_bytes([buf[44], buf[45], buf[46], buf[47]]);
        let crc32 = u32::from_be_bytes([buf[48], buf[49], buf[50], buf[51]]);
        Ok(Some(Self {
            hash,
            kind,
            offset,
            length,
            crc32,
            deleted: flags & FLAG_DELETED != 0,
        }))
    }
}

/// Flags byte for a used slot.
pub fn flags(deleted: bool) -> u8 {
    if deleted {
        FLAG_USED | FLAG_DELETED
    } else {
        FLAG_USED
    }
}

/// Read the file header and every used header entry of a file that is
/// `file_len` bytes long.
///
/// Entries whose payload lies past `file_len` are returned as they are; reads
/// of those payloads fail with [`BlockError::Truncated`]. Entries that could
/// never have been written, and header tables longer than the file, make the
/// whole file corrupt.
pub fn read_table<R: Read>(
    reader: &mut R,
    file_len: u64,
    path: &Path,
) -> BlockResult<(FileHeader, Vec<HeaderEntry>)> {
    let mut head = [0u8; FILE_HEADER_SIZE as usize];
    reader
        .read_exact(&mut head)
        .map_err(|e| corrupt(path, format!("reading file header: {e}")))?;
    let header = FileHeader::decode(&head, path)?;
    if header.data_start() > file_len {
        return Err(corrupt(
            path,
            format!("{} header slots do not fit in {file_len} bytes", header.slots),
        ));
    }

    let mut table = vec![0u8; header.slots as usize * ENTRY_SIZE as usize];
    reader
        .read_exact(&mut table)
        .map_err(|e| corrupt(path, format!("reading header table: {e}")))?;

    let mut entries = Vec::new();
    for slot in table.chunks_exact(ENTRY_SIZE as usize) {
        match HeaderEntry::decode(slot, path)? {
            Some(entry) => {
                entry.check_bounds(&header, path)?;
                entries.push(entry);
            }
            None => break,
        }
    }
    Ok((header, entries))
}

fn corrupt(path: &Path, reason: impl Into<String>) -> BlockError {
    BlockError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
