use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_types::{ChunkKind, ContentHash};
use tracing::{debug, instrument, warn};

use crate::artifact::{read_payload, PendingEntry};
use crate::config::BlockConfig;
use crate::deletion_log::DeletionLog;
use crate::directory::StorageDirectory;
use crate::error::{BlockError, BlockResult};
use crate::fault::{FaultInjector, NoFaults};
use crate::format::{flags, read_table, FileHeader, HeaderEntry, ENTRY_SIZE, FLAGS_OFFSET};
use crate::path::BlockPrefix;

/// Lifecycle of a block.
///
/// Splitting, compacting and moving happen entirely under the block's write
/// lock, so readers only ever observe these three states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    /// Routed to, but no file has been written yet.
    Empty,
    /// Backed by a block file.
    Active,
    /// Split into children or dropped; callers must re-route.
    Retired,
}

/// Result of a successful [`BlockWriter::add`].
#[derive(Debug)]
pub enum AddOutcome {
    /// The chunk was appended to this block.
    Stored,
    /// The block was full and has been split. The chunk now lives in one of
    /// the returned children, and this block is retired.
    Split(Vec<Arc<Block>>),
}

/// A live chunk summary, as enumerated during directory scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntrySummary {
    pub hash: ContentHash,
    pub kind: ChunkKind,
    pub length: u32,
}

/// One block file: a bounded header table followed by a payload region.
///
/// All access goes through [`Block::read`] or [`Block::write`], which hand
/// out guards over the block's in-memory copy of its header table. The
/// convenience methods on `Block` take the appropriate guard for a single
/// operation.
pub struct Block {
    prefix: BlockPrefix,
    config: BlockConfig,
    inner: RwLock<BlockInner>,
}

pub(crate) struct BlockInner {
    pub(crate) directory: Arc<StorageDirectory>,
    pub(crate) path: PathBuf,
    pub(crate) state: BlockState,
    pub(crate) header: FileHeader,
    pub(crate) entries: Vec<HeaderEntry>,
    live: HashMap<(ContentHash, ChunkKind), usize>,
}

impl Block {
    /// A new block with no file on disk. The file is created on first add.
    pub fn create(prefix: BlockPrefix, directory: Arc<StorageDirectory>, config: BlockConfig) -> Self {
        let path = prefix.block_path(&directory);
        let header = FileHeader::new(config.headers_per_file.max(1));
        Self {
            prefix,
            config,
            inner: RwLock::new(BlockInner {
                directory,
                path,
                state: BlockState::Empty,
                header,
                entries: Vec::new(),
                live: HashMap::new(),
            }),
        }
    }

    /// Load an existing block file from `directory`.
    pub fn open(prefix: BlockPrefix, directory: Arc<StorageDirectory>, config: BlockConfig) -> BlockResult<Self> {
        let path = prefix.block_path(&directory);
        let (header, entries) = load_table(&path)?;
        let mut inner = BlockInner {
            directory,
            path,
            state: BlockState::Active,
            header,
            entries: Vec::new(),
            live: HashMap::new(),
        };
        inner.reset(header, entries);
        Ok(Self {
            prefix,
            config,
            inner: RwLock::new(inner),
        })
    }

    pub fn prefix(&self) -> &BlockPrefix {
        &self.prefix
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    /// The directory currently holding this block.
    pub fn directory(&self) -> Arc<StorageDirectory> {
        self.inner.read().expect("block lock poisoned").directory.clone()
    }

    pub fn state(&self) -> BlockState {
        self.inner.read().expect("block lock poisoned").state
    }

    /// Take a shared guard. Fails with [`BlockError::Retired`] on a retired block.
    pub fn read(&self) -> BlockResult<BlockReader<'_>> {
        let inner = self.inner.read().expect("block lock poisoned");
        if inner.state == BlockState::Retired {
            return Err(BlockError::Retired(self.prefix.to_string()));
        }
        Ok(BlockReader { block: self, inner })
    }

    /// Take an exclusive guard. Fails with [`BlockError::Retired`] on a retired block.
    pub fn write(&self) -> BlockResult<BlockWriter<'_>> {
        let inner = self.inner.write().expect("block lock poisoned");
        if inner.state == BlockState::Retired {
            return Err(BlockError::Retired(self.prefix.to_string()));
        }
        Ok(BlockWriter { block: self, inner })
    }

    pub fn has(&self, hash: &ContentHash, kind: ChunkKind) -> BlockResult<bool> {
        Ok(self.read()?.has(hash, kind))
    }

    pub fn get(&self, hash: &ContentHash, kind: ChunkKind) -> BlockResult<Vec<u8>> {
        self.read()?.get(hash, kind)
    }

    pub fn add(&self, hash: ContentHash, kind: ChunkKind, bytes: &[u8]) -> BlockResult<AddOutcome> {
        self.write()?.add(hash, kind, bytes)
    }

    pub fn delete(
        &self,
        hash: &ContentHash,
        kind: ChunkKind,
        reason: &str,
        log: Option<&DeletionLog>,
    ) -> BlockResult<()> {
        self.write()?.delete(hash, kind, reason, log)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("prefix", &self.prefix)
            .field("state", &self.state())
            .finish()
    }
}

/// Shared access to a block.
pub struct BlockReader<'a> {
    block: &'a Block,
    inner: RwLockReadGuard<'a, BlockInner>,
}

impl BlockReader<'_> {
    pub fn has(&self, hash: &ContentHash, kind: ChunkKind) -> bool {
        self.inner.find(hash, kind).is_some()
    }

    /// Returns `true` if some entry for the chunk is flagged deleted, whether
    /// or not a later entry added it back.
    pub fn has_deleted_entry(&self, hash: &ContentHash, kind: ChunkKind) -> bool {
        self.inner
            .entries
            .iter()
            .any(|e| e.deleted && e.hash == *hash && e.kind == kind)
    }

    #[instrument(skip(self), fields(prefix = %self.block.prefix), level = "debug")]
    pub fn get(&self, hash: &ContentHash, kind: ChunkKind) -> BlockResult<Vec<u8>> {
        self.inner.get(hash, kind)
    }

    pub fn entries(&self) -> Vec<EntrySummary> {
        self.inner.summaries()
    }

    pub fn len(&self) -> usize {
        self.inner.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.live.is_empty()
    }

    pub fn accounted_bytes(&self) -> u64 {
        self.inner.accounted()
    }

    pub fn directory(&self) -> &Arc<StorageDirectory> {
        &self.inner.directory
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn state(&self) -> BlockState {
        self.inner.state
    }
}

/// Exclusive access to a block.
pub struct BlockWriter<'a> {
    pub(crate) block: &'a Block,
    pub(crate) inner: RwLockWriteGuard<'a, BlockInner>,
}

impl BlockWriter<'_> {
    pub fn has(&self, hash: &ContentHash, kind: ChunkKind) -> bool {
        self.inner.find(hash, kind).is_some()
    }

    pub fn get(&self, hash: &ContentHash, kind: ChunkKind) -> BlockResult<Vec<u8>> {
        self.inner.get(hash, kind)
    }

    pub fn entries(&self) -> Vec<EntrySummary> {
        self.inner.summaries()
    }

    pub fn len(&self) -> usize {
        self.inner.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.live.is_empty()
    }

    pub fn accounted_bytes(&self) -> u64 {
        self.inner.accounted()
    }

    pub fn directory(&self) -> &Arc<StorageDirectory> {
        &self.inner.directory
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn state(&self) -> BlockState {
        self.inner.state
    }

    /// Append a chunk, splitting the block if it is full.
    pub fn add(&mut self, hash: ContentHash, kind: ChunkKind, bytes: &[u8]) -> BlockResult<AddOutcome> {
        self.add_with(hash, kind, bytes, &NoFaults)
    }

    /// [`BlockWriter::add`] with an explicit fault injector for the split path.
    #[instrument(skip(self, bytes, faults), fields(prefix = %self.block.prefix, len = bytes.len()), level = "debug")]
    pub fn add_with(
        &mut self,
        hash: ContentHash,
        kind: ChunkKind,
        bytes: &[u8],
        faults: &dyn FaultInjector,
    ) -> BlockResult<AddOutcome> {
        if !self.block.prefix.covers(&hash) {
            return Err(BlockError::Corrupt {
                path: self.inner.path.clone(),
                reason: format!("{hash} does not route to block {}", self.block.prefix),
            });
        }
        if self.inner.state == BlockState::Empty {
            self.initialize()?;
        }
        if self.inner.find(&hash, kind).is_some() {
            return Err(BlockError::AlreadyExists { hash, kind });
        }

        if let Err(BlockError::CapacityExceeded { .. }) = self.check_fits(bytes.len()) {
            if self.inner.has_deleted() {
                if let Err(e) = self.compact(true) {
                    warn!(prefix = %self.block.prefix, error = %e, "compaction before split failed");
                }
                if self.inner.state == BlockState::Empty {
                    self.initialize()?;
                }
            }
            match self.check_fits(bytes.len()) {
                Ok(()) => {}
                Err(e) if self.block.prefix.is_full() => return Err(e),
                Err(_) => {
                    let incoming = PendingEntry {
                        hash,
                        kind,
                        bytes: bytes.to_vec(),
                    };
                    let children = self.split_with(incoming, faults)?;
                    return Ok(AddOutcome::Split(children));
                }
            }
        }

        let before = self.inner.accounted();
        self.inner.append(hash, kind, bytes)?;
        self.settle(before);
        debug!(%hash, %kind, prefix = %self.block.prefix, "chunk stored");
        Ok(AddOutcome::Stored)
    }

    /// Mark a chunk deleted and, if `log` is given, record the deletion.
    ///
    /// The payload bytes stay in the file until the block is compacted. The
    /// flag is committed before the log line is written: if logging fails the
    /// chunk is still deleted and the log error is returned.
    #[instrument(skip(self, log), fields(prefix = %self.block.prefix), level = "debug")]
    pub fn delete(
        &mut self,
        hash: &ContentHash,
        kind: ChunkKind,
        reason: &str,
        log: Option<&DeletionLog>,
    ) -> BlockResult<()> {
        let slot = *self
            .inner
            .live
            .get(&(*hash, kind))
            .ok_or(BlockError::NotFound { hash: *hash, kind })?;
        let before = self.inner.accounted();

        let mut file = OpenOptions::new().write(true).open(&self.inner.path)?;
        file.seek(SeekFrom::Start(self.inner.header.slot_offset(slot) + FLAGS_OFFSET))?;
        file.write_all(&[flags(true)])?;
        file.sync_data()?;

        self.inner.entries[slot].deleted = true;
        self.inner.live.remove(&(*hash, kind));
        self.settle(before);

        if let Some(log) = log {
            log.append(kind, hash, reason)?;
        }
        Ok(())
    }

    /// Retire a block that holds no file, so it can be dropped from routing.
    pub fn retire_if_empty(&mut self) -> bool {
        if self.inner.state == BlockState::Empty {
            self.inner.state = BlockState::Retired;
            return true;
        }
        false
    }

    /// Create the block file. An existing file at the block's path is loaded
    /// instead, and its entries are charged to the directory.
    fn initialize(&mut self) -> BlockResult<()> {
        let before = self.inner.accounted();
        let slots = self.block.config.headers_per_file.max(1);
        self.inner.initialize(slots)?;
        self.settle(before);
        Ok(())
    }

    /// Check whether a payload of `len` bytes can be appended without splitting.
    pub(crate) fn check_fits(&self, len: usize) -> BlockResult<()> {
        let inner = &self.inner;
        let full = || BlockError::CapacityExceeded {
            prefix: self.block.prefix.to_string(),
        };
        if u32::try_from(len).is_err() || inner.entries.len() >= inner.header.slots as usize {
            return Err(full());
        }
        if inner.entries.is_empty() || self.block.prefix.is_full() {
            return Ok(());
        }
        if inner.next_offset() + len as u64 > self.block.config.max_block_size {
            return Err(full());
        }
        Ok(())
    }

    /// Apply the change in accounted bytes since `before` to the owning directory.
    pub(crate) fn settle(&self, before: u64) {
        let after = self.inner.accounted();
        if after != before {
            self.inner
                .directory
                .adjust_used(after as i64 - before as i64);
        }
    }
}

impl BlockInner {
    pub(crate) fn find(&self, hash: &ContentHash, kind: ChunkKind) -> Option<&HeaderEntry> {
        self.live.get(&(*hash, kind)).map(|&slot| &self.entries[slot])
    }

    fn get(&self, hash: &ContentHash, kind: ChunkKind) -> BlockResult<Vec<u8>> {
        let entry = self
            .find(hash, kind)
            .ok_or(BlockError::NotFound { hash: *hash, kind })?;
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        read_payload(&mut file, file_len, entry, &self.path)
    }

    fn summaries(&self) -> Vec<EntrySummary> {
        self.entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| EntrySummary {
                hash: e.hash,
                kind: e.kind,
                length: e.length,
            })
            .collect()
    }

    /// Offset at which the next payload is appended.
    pub(crate) fn next_offset(&self) -> u64 {
        self.entries
            .iter()
            .map(HeaderEntry::end)
            .max()
            .unwrap_or(0)
            .max(self.header.data_start())
    }

    /// Used slots times entry size, plus live payload bytes.
    pub(crate) fn accounted(&self) -> u64 {
        let live: u64 = self
            .entries
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.length as u64)
            .sum();
        self.entries.len() as u64 * ENTRY_SIZE + live
    }

    pub(crate) fn has_deleted(&self) -> bool {
        self.entries.iter().any(|e| e.deleted)
    }

    /// (deleted slots, deleted payload bytes)
    pub(crate) fn deleted_stats(&self) -> (usize, u64) {
        self.entries
            .iter()
            .filter(|e| e.deleted)
            .fold((0, 0), |(n, bytes), e| (n + 1, bytes + e.length as u64))
    }

    pub(crate) fn reset(&mut self, header: FileHeader, entries: Vec<HeaderEntry>) {
        self.header = header;
        self.live = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .map(|(slot, e)| ((e.hash, e.kind), slot))
            .collect();
        self.entries = entries;
    }

    /// Forget all entries. The file, if any, is the caller's concern.
    pub(crate) fn clear(&mut self, state: BlockState) {
        let header = self.header;
        self.reset(header, Vec::new());
        self.state = state;
    }

    /// Reload the header table from disk.
    pub(crate) fn reload(&mut self) -> BlockResult<()> {
        let (header, entries) = load_table(&self.path)?;
        self.reset(header, entries);
        self.state = BlockState::Active;
        Ok(())
    }

    /// Create the block file with an empty header table.
    pub(crate) fn initialize(&mut self, slots: u32) -> BlockResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(path = %self.path.display(), "block file already present; loading it");
                return self.reload();
            }
            Err(e) => return Err(e.into()),
        };
        let header = FileHeader::new(slots);
        file.write_all(&header.encode())?;
        file.set_len(header.data_start())?;
        file.sync_all()?;

        self.reset(header, Vec::new());
        self.state = BlockState::Active;
        Ok(())
    }

    /// Write payload then header entry. The header is only written once the
    /// payload is durable, so a crash never leaves an entry pointing at
    /// unwritten bytes.
    pub(crate) fn append(&mut self, hash: ContentHash, kind: ChunkKind, bytes: &[u8]) -> BlockResult<()> {
        let slot = self.entries.len();
        let entry = HeaderEntry {
            hash,
            kind,
            offset: self.next_offset(),
            length: bytes.len() as u32,
            crc32: crc32fast::hash(bytes),
            deleted: false,
        };

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        file.seek(SeekFrom::Start(self.header.slot_offset(slot)))?;
        file.write_all(&entry.encode())?;
        file.sync_data()?;

        self.entries.push(entry);
        self.live.insert((hash, kind), slot);
        Ok(())
    }

    /// Read every live payload, skipping entries whose bytes are lost.
    pub(crate) fn live_payloads(&self) -> BlockResult<Vec<PendingEntry>> {
        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut out = Vec::with_capacity(self.live.len());
        for entry in self.entries.iter().filter(|e| !e.deleted) {
            match read_payload(&mut file, file_len, entry, &self.path) {
                Ok(bytes) => out.push(PendingEntry {
                    hash: entry.hash,
                    kind: entry.kind,
                    bytes,
                }),
                Err(e @ (BlockError::Truncated { .. } | BlockError::Corrupt { .. })) => {
                    warn!(path = %self.path.display(), error = %e, "dropping unreadable entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn load_table(path: &Path) -> BlockResult<(FileHeader, Vec<HeaderEntry>)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    read_table(&mut BufReader::new(file), file_len, path)
}
