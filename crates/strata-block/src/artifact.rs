//! Reading entries back out of block files and pending artifacts.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use strata_types::{ChunkKind, ContentHash};
use tracing::warn;

use crate::error::{BlockError, BlockResult};
use crate::format::{read_table, HeaderEntry};
use crate::path::CORRUPT_SUFFIX;

/// A chunk recovered from a file, ready to be re-inserted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub hash: ContentHash,
    pub kind: ChunkKind,
    pub bytes: Vec<u8>,
}

/// Read every live, intact entry from a block file or artifact.
///
/// Deleted entries are skipped. Entries whose payload runs past end of file
/// or fails its checksum are logged and skipped; they do not prevent the
/// rest of the file from being recovered. An unreadable file header is an
/// error.
pub fn read_pending(path: &Path) -> BlockResult<Vec<PendingEntry>> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let (_, entries) = read_table(&mut file, file_len, path)?;

    let mut pending = Vec::with_capacity(entries.len());
    for entry in entries.iter().filter(|e| !e.deleted) {
        match read_payload(file.get_mut(), file_len, entry, path) {
            Ok(bytes) => pending.push(PendingEntry {
                hash: entry.hash,
                kind: entry.kind,
                bytes,
            }),
            Err(BlockError::Truncated { .. } | BlockError::Corrupt { .. }) => {
                warn!(
                    path = %path.display(),
                    hash = %entry.hash,
                    kind = %entry.kind,
                    "skipping unreadable entry in pending artifact"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(pending)
}

/// Every (hash, kind) a block file or artifact records as deleted and does
/// not also hold live.
pub fn read_deleted(path: &Path) -> BlockResult<Vec<(ContentHash, ChunkKind)>> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let (_, entries) = read_table(&mut BufReader::new(file), file_len, path)?;
    let live: HashSet<_> = entries.iter().filter(|e| !e.deleted).map(|e| (e.hash, e.kind)).collect();
    let mut deleted = Vec::new();
    for entry in entries.iter().filter(|e| e.deleted) {
        let key = (entry.hash, entry.kind);
        if !live.contains(&key) && !deleted.contains(&key) {
            deleted.push(key);
        }
    }
    Ok(deleted)
}

/// Rename an unreadable file to `<name>.corrupt` so its name can be reused.
/// An earlier file set aside under that name is kept by adding a counter.
pub fn set_aside(path: &Path) -> BlockResult<PathBuf> {
    let mut n = 0u32;
    let target = loop {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(CORRUPT_SUFFIX);
        if n > 0 {
            name.push(format!("-{n}"));
        }
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };
    fs::rename(path, &target)?;
    warn!(path = %path.display(), aside = %target.display(), "unreadable file set aside");
    Ok(target)
}

/// Read and verify one entry's payload.
pub(crate) fn read_payload(
    file: &mut File,
    file_len: u64,
    entry: &HeaderEntry,
    path: &Path,
) -> BlockResult<Vec<u8>> {
    if entry.end() > file_len {
        return Err(BlockError::Truncated {
            hash: entry.hash,
            end: entry.end(),
            file_len,
        });
    }
    let mut bytes = vec![0u8; entry.length as usize];
    file.seek(SeekFrom::Start(entry.offset))?;
    file.read_exact(&mut bytes)?;

    let actual = crc32fast::hash(&bytes);
    if actual != entry.crc32 {
        return Err(BlockError::Corrupt {
            path: path.to_path_buf(),
            reason: format!(
                "checksum mismatch for {}: expected {:#010x}, got {actual:#010x}",
                entry.hash, entry.crc32
            ),
        });
    }
    Ok(bytes)
}
