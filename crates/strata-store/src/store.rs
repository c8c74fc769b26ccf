//! The chunk store: routing, validation and indexing over a pool of
//! storage directories.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_block::{
    artifact_path, read_deleted, read_pending, set_aside, AddOutcome, ArtifactKind, Block, BlockConfig,
    BlockError, BlockReader, BlockWriter, CompactOutcome, DeletionLog, MergeOutcome, PendingEntry,
    StorageDirectory, BLOCK_EXT, ENTRY_SIZE,
};
use strata_crypto::ContentHasher;
use strata_types::{ChunkKind, ContentHash};
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::index::HashIndex;
use crate::routes::RoutingTable;
use crate::scan::scan_directory;

/// Usage of one registered directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryStats {
    pub path: PathBuf,
    pub used_bytes: u64,
    pub size_limit: u64,
    pub blocks: usize,
}

/// Snapshot of store-wide usage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub directories: Vec<DirectoryStats>,
    pub data_count: usize,
    pub meta_count: usize,
}

/// A content-addressed chunk store spread over one or more directories.
///
/// `ChunkStore` is `Send + Sync`; share it behind an `Arc`. Operations on
/// chunks that route to different blocks never wait on each other.
/// Operations on the same block are serialized by that block's lock.
///
/// Lock order: a block lock is always taken before the routing table or
/// index locks, and the routing table is never held while waiting for a
/// block.
pub struct ChunkStore {
    config: StoreConfig,
    hasher: ContentHasher,
    directories: RwLock<Vec<Arc<StorageDirectory>>>,
    routes: RwLock<RoutingTable>,
    data_index: RwLock<HashIndex>,
    meta_index: RwLock<HashIndex>,
    data_log: Option<DeletionLog>,
    meta_log: Option<DeletionLog>,
    /// Serializes registration and balancing.
    pub(crate) maintenance: Mutex<()>,
}

impl ChunkStore {
    /// Open a store and register every configured directory, in order.
    ///
    /// A directory that cannot be used is logged and left out; the store
    /// opens over the others.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let data_log = config
            .data_log_path()
            .map(|path| DeletionLog::open(&path))
            .transpose()?;
        let meta_log = config
            .meta_log_path()
            .map(|path| DeletionLog::open(&path))
            .transpose()?;

        let store = Self {
            hasher: ContentHasher::DATA,
            directories: RwLock::new(Vec::new()),
            routes: RwLock::new(RoutingTable::new()),
            data_index: RwLock::new(HashIndex::new(config.index_capacity)),
            meta_index: RwLock::new(HashIndex::new(config.index_capacity)),
            data_log,
            meta_log,
            maintenance: Mutex::new(()),
            config,
        };
        for dir in store.config.directories.clone() {
            match store.register_directory(dir.to_directory()) {
                Ok(()) => {}
                Err(StoreError::DirectoryUnavailable { path, reason }) => {
                    warn!(path = %path.display(), %reason, "directory unavailable; opening without it");
                }
                Err(e) => return Err(e),
            }
        }
        store.rehydrate();
        info!(
            directories = store.directories.read().expect("directories lock poisoned").len(),
            data = store.data_count(),
            meta = store.meta_count(),
            "chunk store opened"
        );
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn block_config(&self) -> &BlockConfig {
        &self.config.block
    }

    /// Registered directories, in registration order.
    pub fn directories(&self) -> Vec<Arc<StorageDirectory>> {
        self.directories.read().expect("directories lock poisoned").clone()
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    /// Add a directory to the pool and load the blocks already in it.
    ///
    /// Registering a path that is already registered (with or without a
    /// trailing separator) is a no-op. Its accounting is rebuilt from the
    /// blocks found, whatever `dir` carried. Block files that overlap an
    /// already routed block, and backup or partial-copy artifacts, are merged
    /// into the store through the normal add path and then removed. Block
    /// files that fail validation are renamed to `.corrupt` so their prefix
    /// can take new chunks.
    #[instrument(skip(self, dir), fields(path = %dir.path().display()))]
    pub fn register_directory(&self, dir: StorageDirectory) -> StoreResult<()> {
        let _maintenance = self.maintenance.lock().expect("maintenance lock poisoned");
        if self.directories().iter().any(|d| **d == dir) {
            debug!("directory already registered");
            return Ok(());
        }
        dir.create_if_missing()?;
        let dir = Arc::new(StorageDirectory::new(dir.path(), dir.size_limit()));
        let scan = scan_directory(&dir);

        let mut stray = Vec::new();
        let mut found = Vec::new();
        let mut loaded = 0usize;
        for prefix in scan.blocks {
            let path = prefix.block_path(&dir);
            let block = match Block::open(prefix, dir.clone(), self.config.block.clone()) {
                Ok(block) => block,
                Err(e @ BlockError::Corrupt { .. }) => {
                    warn!(path = %path.display(), error = %e, "block unreadable; setting it aside");
                    if let Err(e) = set_aside(&path) {
                        warn!(path = %path.display(), error = %e, "could not set unreadable block aside");
                    }
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable block");
                    continue;
                }
            };
            let mut routes = self.write_routes();
            if routes.conflicts(block.prefix()) {
                stray.push(path);
                continue;
            }
            {
                let reader = block.read()?;
                dir.adjust_used(reader.accounted_bytes() as i64);
                found.extend(reader.entries());
            }
            routes.insert(Arc::new(block));
            loaded += 1;
        }
        self.directories
            .write()
            .expect("directories lock poisoned")
            .push(dir.clone());
        for entry in found {
            self.index(entry.kind).insert(entry.hash);
        }

        for path in stray {
            warn!(path = %path.display(), "block overlaps an existing block; merging it");
            self.merge_artifact(&path)?;
        }
        for artifact in &scan.artifacts {
            if !artifact.path.exists() {
                continue;
            }
            warn!(path = %artifact.path.display(), kind = artifact.kind.suffix(), "reconciling pending artifact");
            self.merge_artifact(&artifact.path)?;
        }

        info!(
            blocks = loaded,
            artifacts = scan.artifacts.len(),
            used_bytes = dir.used_bytes(),
            "directory registered"
        );
        Ok(())
    }

    /// Re-insert every entry of a file that is not a routed block, then delete it.
    ///
    /// The file is first renamed to its `.merging` name so that blocks
    /// created or split by the re-inserts cannot collide with it.
    ///
    /// Deletions win over stale copies: an entry the routed block has
    /// deleted (and not added back) is not re-inserted, and a chunk the file
    /// has deleted is deleted from the store unless the routed block already
    /// recorded a deletion of it.
    fn merge_artifact(&self, path: &Path) -> StoreResult<()> {
        let claimed = merging_path(path);
        if claimed != path {
            if claimed.exists() {
                self.merge_artifact(&claimed)?;
            }
            fs::rename(path, &claimed)?;
        }
        let path = claimed.as_path();
        let (entries, deleted) = match read_pending(path).and_then(|live| read_deleted(path).map(|deleted| (live, deleted))) {
            Ok(read) => read,
            Err(BlockError::Corrupt { reason, .. }) => {
                warn!(path = %path.display(), %reason, "artifact unreadable; setting it aside");
                set_aside(path)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let (mut merged, mut skipped, mut superseded) = (0usize, 0usize, 0usize);
        for entry in entries {
            let deleted_here = self.with_reader(&entry.hash, |reader| {
                Ok(reader.has_deleted_entry(&entry.hash, entry.kind) && !reader.has(&entry.hash, entry.kind))
            })?;
            if deleted_here == Some(true) {
                superseded += 1;
                continue;
            }
            match self.add_chunk(entry.kind, entry.hash, &entry.bytes) {
                Ok(()) => merged += 1,
                Err(StoreError::AlreadyExists { .. }) => skipped += 1,
                Err(e) => return Err(e),
            }
        }

        let mut carried = 0usize;
        for (hash, kind) in deleted {
            let live_here = self.with_reader(&hash, |reader| {
                Ok(reader.has(&hash, kind) && !reader.has_deleted_entry(&hash, kind))
            })?;
            if live_here != Some(true) {
                continue;
            }
            match self.delete(kind, &hash, "deleted in a stale copy") {
                Ok(()) | Err(StoreError::NotFound { .. }) => carried += 1,
                Err(e) => return Err(e),
            }
        }

        fs::remove_file(path)?;
        info!(path = %path.display(), merged, skipped, superseded, carried, "artifact merged");
        Ok(())
    }

    /// Rebuild both hash indexes from the routed blocks.
    ///
    /// Restores a partial index to complete when the stored hashes fit its
    /// capacity again. Adds and deletes that race with the rebuild may be
    /// missed, so call this while the store is quiet.
    pub fn rehydrate(&self) {
        let (data, meta) = self.scan_hashes();
        self.index(ChunkKind::Data).rebuild(data);
        self.index(ChunkKind::Meta).rebuild(meta);
    }

    fn scan_hashes(&self) -> (BTreeSet<ContentHash>, BTreeSet<ContentHash>) {
        let mut data = BTreeSet::new();
        let mut meta = BTreeSet::new();
        let blocks = self.read_routes().blocks();
        for block in blocks {
            let Ok(reader) = block.read() else { continue };
            for entry in reader.entries() {
                match entry.kind {
                    ChunkKind::Data => data.insert(entry.hash),
                    ChunkKind::Meta => meta.insert(entry.hash),
                };
            }
        }
        (data, meta)
    }

    // ---------------------------------------------------------------
    // Adding
    // ---------------------------------------------------------------

    /// Store a data chunk. `hash` must be the content hash of `bytes`.
    pub fn add_data(&self, hash: &ContentHash, bytes: &[u8]) -> StoreResult<()> {
        self.check_size(ChunkKind::Data, bytes)?;
        let computed = self.hasher.hash(bytes);
        if computed != *hash {
            return Err(StoreError::HashMismatch {
                claimed: *hash,
                computed,
            });
        }
        self.add_chunk(ChunkKind::Data, *hash, bytes)
    }

    /// Store a meta-data chunk under a caller-chosen hash.
    pub fn add_meta(&self, hash: &ContentHash, bytes: &[u8]) -> StoreResult<()> {
        self.check_size(ChunkKind::Meta, bytes)?;
        self.add_chunk(ChunkKind::Meta, *hash, bytes)
    }

    /// Store several data chunks. Each succeeds or fails on its own.
    pub fn add_data_batch(&self, chunks: &[(ContentHash, Vec<u8>)]) -> Vec<StoreResult<()>> {
        chunks
            .iter()
            .map(|(hash, bytes)| self.add_data(hash, bytes))
            .collect()
    }

    fn check_size(&self, kind: ChunkKind, bytes: &[u8]) -> StoreResult<()> {
        let max = match kind {
            ChunkKind::Data => self.config.max_data_chunk_size,
            ChunkKind::Meta => self.config.max_meta_chunk_size,
        };
        let len = bytes.len() as u64;
        if len > max {
            return Err(StoreError::SizeExceeded { kind, len, max });
        }
        Ok(())
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()), level = "debug")]
    fn add_chunk(&self, kind: ChunkKind, hash: ContentHash, bytes: &[u8]) -> StoreResult<()> {
        let needed = ENTRY_SIZE + bytes.len() as u64;
        loop {
            let block = self.route_for_add(&hash, needed)?;
            let mut writer = match block.write() {
                Ok(writer) => writer,
                Err(BlockError::Retired(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let outcome = match self.add_locked(&mut writer, kind, hash, bytes, needed) {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A block created for this chunk must not stay routed.
                    if writer.retire_if_empty() {
                        self.write_routes().remove(block.prefix());
                        debug!(prefix = %block.prefix(), "unused block dropped");
                    }
                    return Err(e);
                }
            };
            if let AddOutcome::Split(children) = outcome {
                self.write_routes().replace(block.prefix(), &children);
            }
            self.index(kind).insert(hash);
            debug!(%hash, %kind, "chunk added");
            return Ok(());
        }
    }

    fn add_locked(
        &self,
        writer: &mut BlockWriter<'_>,
        kind: ChunkKind,
        hash: ContentHash,
        bytes: &[u8],
        needed: u64,
    ) -> StoreResult<AddOutcome> {
        if !writer.directory().has_room(needed) {
            self.relocate_for(writer, needed)?;
        }
        Ok(writer.add(hash, kind, bytes)?)
    }

    /// The block a new chunk should go to, creating an empty one if no
    /// routed block covers the hash.
    fn route_for_add(&self, hash: &ContentHash, needed: u64) -> StoreResult<Arc<Block>> {
        if let Some(block) = self.read_routes().covering(hash) {
            return Ok(block);
        }
        let mut routes = self.write_routes();
        if let Some(block) = routes.covering(hash) {
            return Ok(block);
        }
        let dir = self.pick_directory(needed, None).ok_or(StoreError::NoCapacity { needed })?;
        let prefix = routes.vacant(hash);
        debug!(%prefix, dir = %dir.path().display(), "new block");
        let block = Arc::new(Block::create(prefix, dir, self.config.block.clone()));
        routes.insert(block.clone());
        Ok(block)
    }

    /// The least-filled directory with room for `needed` bytes.
    fn pick_directory(&self, needed: u64, exclude: Option<&StorageDirectory>) -> Option<Arc<StorageDirectory>> {
        self.directories()
            .into_iter()
            .filter(|d| exclude.map_or(true, |e| **d != *e))
            .filter(|d| d.has_room(needed))
            .min_by(|a, b| a.fill_fraction().total_cmp(&b.fill_fraction()))
    }

    /// Move a block whose directory is full to one with room for it plus `needed`.
    fn relocate_for(&self, writer: &mut BlockWriter<'_>, needed: u64) -> StoreResult<()> {
        let total = writer.accounted_bytes() + needed;
        let current = writer.directory().clone();
        let dest = self
            .pick_directory(total, Some(&current))
            .ok_or(StoreError::NoCapacity { needed })?;
        if !writer.move_to(&dest)? {
            return Err(StoreError::NoCapacity { needed });
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Reading
    // ---------------------------------------------------------------

    pub fn get_data(&self, hash: &ContentHash) -> StoreResult<Vec<u8>> {
        self.get(ChunkKind::Data, hash)
    }

    pub fn get_meta(&self, hash: &ContentHash) -> StoreResult<Vec<u8>> {
        self.get(ChunkKind::Meta, hash)
    }

    pub fn has_data(&self, hash: &ContentHash) -> bool {
        self.has(ChunkKind::Data, hash)
    }

    pub fn has_meta(&self, hash: &ContentHash) -> bool {
        self.has(ChunkKind::Meta, hash)
    }

    fn get(&self, kind: ChunkKind, hash: &ContentHash) -> StoreResult<Vec<u8>> {
        self.with_reader(hash, |reader| reader.get(hash, kind))?
            .ok_or(StoreError::NotFound { hash: *hash, kind })
    }

    fn has(&self, kind: ChunkKind, hash: &ContentHash) -> bool {
        if let Some(known) = self.index_read(kind).contains(hash) {
            return known;
        }
        match self.with_reader(hash, |reader| Ok(reader.has(hash, kind))) {
            Ok(found) => found.unwrap_or(false),
            Err(e) => {
                warn!(%hash, %kind, error = %e, "block lookup failed");
                false
            }
        }
    }

    /// Run `f` against the block covering `hash`. `None` if no block covers it.
    fn with_reader<T>(
        &self,
        hash: &ContentHash,
        f: impl Fn(&BlockReader<'_>) -> Result<T, BlockError>,
    ) -> StoreResult<Option<T>> {
        loop {
            let Some(block) = self.read_routes().covering(hash) else {
                return Ok(None);
            };
            let reader = match block.read() {
                Ok(reader) => reader,
                Err(BlockError::Retired(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            return Ok(Some(f(&reader)?));
        }
    }

    // ---------------------------------------------------------------
    // Deleting
    // ---------------------------------------------------------------

    pub fn delete_data(&self, hash: &ContentHash, reason: &str) -> StoreResult<()> {
        self.delete(ChunkKind::Data, hash, reason)
    }

    pub fn delete_meta(&self, hash: &ContentHash, reason: &str) -> StoreResult<()> {
        self.delete(ChunkKind::Meta, hash, reason)
    }

    /// Once the deleted flag is on disk the chunk is gone from the index too,
    /// even if writing the deletion log then fails.
    fn delete(&self, kind: ChunkKind, hash: &ContentHash, reason: &str) -> StoreResult<()> {
        let log = match kind {
            ChunkKind::Data => self.data_log.as_ref(),
            ChunkKind::Meta => self.meta_log.as_ref(),
        };
        loop {
            let block = self
                .read_routes()
                .covering(hash)
                .ok_or(StoreError::NotFound { hash: *hash, kind })?;
            let mut writer = match block.write() {
                Ok(writer) => writer,
                Err(BlockError::Retired(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let deleted = writer.delete(hash, kind, reason, log);
            if !writer.has(hash, kind) {
                self.index(kind).remove(hash);
            }
            deleted?;
            debug!(%hash, %kind, reason, "chunk deleted");
            return Ok(());
        }
    }

    // ---------------------------------------------------------------
    // Enumeration
    // ---------------------------------------------------------------

    /// A page of data hashes in ascending order.
    pub fn list_data_hashes(&self, offset: usize, limit: usize) -> Vec<ContentHash> {
        self.list(ChunkKind::Data, offset, limit)
    }

    /// A page of meta-data hashes in ascending order.
    pub fn list_meta_hashes(&self, offset: usize, limit: usize) -> Vec<ContentHash> {
        self.list(ChunkKind::Meta, offset, limit)
    }

    fn list(&self, kind: ChunkKind, offset: usize, limit: usize) -> Vec<ContentHash> {
        if let Some(page) = self.index_read(kind).page(offset, limit) {
            return page;
        }
        let (data, meta) = self.scan_hashes();
        let hashes = match kind {
            ChunkKind::Data => data,
            ChunkKind::Meta => meta,
        };
        hashes.into_iter().skip(offset).take(limit).collect()
    }

    pub fn data_count(&self) -> usize {
        self.index_read(ChunkKind::Data).len()
    }

    pub fn meta_count(&self) -> usize {
        self.index_read(ChunkKind::Meta).len()
    }

    pub fn stats(&self) -> StoreStats {
        let blocks = self.read_routes().blocks();
        let directories = self
            .directories()
            .iter()
            .map(|dir| DirectoryStats {
                path: dir.path().to_path_buf(),
                used_bytes: dir.used_bytes(),
                size_limit: dir.size_limit(),
                blocks: blocks.iter().filter(|b| *b.directory() == **dir).count(),
            })
            .collect();
        StoreStats {
            directories,
            data_count: self.data_count(),
            meta_count: self.meta_count(),
        }
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    /// Compact every block. Returns how many blocks were rewritten or emptied.
    ///
    /// A block whose compaction cannot be recovered in place keeps its backup
    /// artifact, which is merged back here; if that fails too the backup is
    /// left for the next registration.
    pub fn compact_all(&self, force: bool) -> usize {
        let mut compacted = 0;
        let blocks = self.read_routes().blocks();
        for block in blocks {
            let Ok(mut writer) = block.write() else { continue };
            match writer.compact(force) {
                Ok(CompactOutcome::Skipped) => {}
                Ok(CompactOutcome::Compacted { .. }) => compacted += 1,
                Ok(CompactOutcome::Emptied) => {
                    compacted += 1;
                    if writer.retire_if_empty() {
                        self.write_routes().remove(block.prefix());
                    }
                }
                Err(e) => {
                    warn!(prefix = %block.prefix(), error = %e, "compaction failed; merging backup");
                    if let Err(e) = self.merge_backup(&block, &mut writer) {
                        warn!(prefix = %block.prefix(), error = %e, "backup left for next registration");
                    }
                }
            }
        }
        if compacted > 0 {
            info!(compacted, "compaction pass finished");
        }
        compacted
    }

    /// Merge a block's backup artifact back into it under its write lock,
    /// routing to the children if the merge splits the block.
    fn merge_backup(&self, block: &Block, writer: &mut BlockWriter<'_>) -> StoreResult<MergeOutcome> {
        let backup = artifact_path(writer.path(), ArtifactKind::Backup);
        let pending: Vec<PendingEntry> = read_pending(&backup)?
            .into_iter()
            .filter(|entry| block.prefix().covers(&entry.hash))
            .collect();
        let outcome = writer.merge_pending(&backup)?;
        if let Some(children) = &outcome.children {
            self.write_routes().replace(block.prefix(), children);
        }
        for entry in pending {
            self.index(entry.kind).insert(entry.hash);
        }
        Ok(outcome)
    }

    /// Flush deletion logs and release the store.
    pub fn close(self) -> StoreResult<()> {
        for log in self.data_log.iter().chain(self.meta_log.iter()) {
            log.flush()?;
        }
        info!(data = self.data_count(), meta = self.meta_count(), "chunk store closed");
        Ok(())
    }

    // ---------------------------------------------------------------
    // Lock helpers
    // ---------------------------------------------------------------

    pub(crate) fn read_routes(&self) -> RwLockReadGuard<'_, RoutingTable> {
        self.routes.read().expect("routing lock poisoned")
    }

    pub(crate) fn write_routes(&self) -> RwLockWriteGuard<'_, RoutingTable> {
        self.routes.write().expect("routing lock poisoned")
    }

    fn index(&self, kind: ChunkKind) -> RwLockWriteGuard<'_, HashIndex> {
        match kind {
            ChunkKind::Data => self.data_index.write(),
            ChunkKind::Meta => self.meta_index.write(),
        }
        .expect("index lock poisoned")
    }

    fn index_read(&self, kind: ChunkKind) -> RwLockReadGuard<'_, HashIndex> {
        match kind {
            ChunkKind::Data => self.data_index.read(),
            ChunkKind::Meta => self.meta_index.read(),
        }
        .expect("index lock poisoned")
    }
}

/// The `.merging` name of a block file or artifact.
fn merging_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(BLOCK_EXT) => artifact_path(path, ArtifactKind::Merging),
        Some(ext) if ext == ArtifactKind::Merging.suffix() => path.to_path_buf(),
        _ => path.with_extension(ArtifactKind::Merging.suffix()),
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("directories", &self.directories().len())
            .field("blocks", &self.read_routes().len())
            .field("data", &self.data_count())
            .field("meta", &self.meta_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use rand::{Rng, RngCore};
    use strata_block::{BlockPrefix, BLOCKS_DIR, FILE_HEADER_SIZE};

    use super::*;
    use crate::config::{DirectoryConfig, DATA_LOG_NAME, DEFAULT_MAX_DATA_CHUNK_SIZE, META_LOG_NAME};

    fn config(dirs: Vec<DirectoryConfig>) -> StoreConfig {
        StoreConfig {
            directories: dirs,
            ..StoreConfig::default()
        }
    }

    fn open_in(root: &Path) -> ChunkStore {
        ChunkStore::open(config(vec![DirectoryConfig::unbounded(root.join("d0"))])).unwrap()
    }

    fn data(bytes: &[u8]) -> (ContentHash, Vec<u8>) {
        (ContentHasher::DATA.hash(bytes), bytes.to_vec())
    }

    fn random_data(rng: &mut impl Rng, max_len: usize) -> (ContentHash, Vec<u8>) {
        let mut bytes = vec![0u8; rng.gen_range(1..=max_len)];
        rng.fill_bytes(&mut bytes);
        data(&bytes)
    }

    fn meta_hash(a: u8, b: u8) -> ContentHash {
        let mut bytes = [0x33u8; 32];
        bytes[0] = a;
        bytes[1] = b;
        ContentHash::from_bytes(bytes)
    }

    fn total_used(store: &ChunkStore) -> u64 {
        store.directories().iter().map(|d| d.used_bytes()).sum()
    }

    fn files_with_suffix(root: &Path, suffix: &str) -> Vec<PathBuf> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .filter(|p| p.to_string_lossy().ends_with(suffix))
            .collect()
    }

    #[test]
    fn round_trip_both_kinds() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let mut rng = rand::thread_rng();

        let chunks: Vec<_> = (0..50).map(|_| random_data(&mut rng, 4096)).collect();
        for (hash, bytes) in &chunks {
            store.add_data(hash, bytes).unwrap();
        }
        let meta: Vec<(ContentHash, Vec<u8>)> = (0..20)
            .map(|_| {
                let mut payload = vec![0u8; rng.gen_range(0..2048)];
                rng.fill_bytes(&mut payload);
                (ContentHash::from_bytes(rng.gen()), payload)
            })
            .collect();
        for (hash, bytes) in &meta {
            store.add_meta(hash, bytes).unwrap();
        }

        for (hash, bytes) in &chunks {
            assert!(store.has_data(hash));
            assert_eq!(&store.get_data(hash).unwrap(), bytes);
        }
        for (hash, bytes) in &meta {
            assert!(store.has_meta(hash));
            assert_eq!(&store.get_meta(hash).unwrap(), bytes);
        }
        assert_eq!(store.data_count(), 50);
        assert_eq!(store.meta_count(), 20);
    }

    #[test]
    fn zero_length_chunk_is_present() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let (hash, empty) = data(b"");
        assert!(!store.has_data(&hash));
        store.add_data(&hash, &empty).unwrap();
        assert!(store.has_data(&hash));
        assert_eq!(store.get_data(&hash).unwrap(), Vec::<u8>::new());
        assert_eq!(total_used(&store), ENTRY_SIZE);
    }

    #[test]
    fn mismatched_data_is_rejected_without_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let (real, bytes) = data(b"payload");
        let (claimed, _) = data(b"something else");

        let err = store.add_data(&claimed, &bytes).unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { claimed: c, computed } if c == claimed && computed == real));
        assert!(!store.has_data(&claimed));
        assert!(!store.has_data(&real));
        assert_eq!(store.data_count(), 0);
        assert_eq!(total_used(&store), 0);
        assert!(files_with_suffix(tmp.path(), ".blk").is_empty());
    }

    #[test]
    fn oversized_data_is_rejected_but_meta_may_be_large() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let big = vec![9u8; DEFAULT_MAX_DATA_CHUNK_SIZE as usize + 1];
        let (hash, _) = data(&big);

        let err = store.add_data(&hash, &big).unwrap_err();
        assert!(matches!(err, StoreError::SizeExceeded { kind: ChunkKind::Data, .. }));
        assert!(!store.has_data(&hash));

        store.add_meta(&hash, &big).unwrap();
        assert_eq!(store.get_meta(&hash).unwrap().len(), big.len());
    }

    #[test]
    fn absent_chunks_report_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let (hash, bytes) = data(b"once");

        assert!(matches!(store.get_data(&hash), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.delete_data(&hash, "gone"), Err(StoreError::NotFound { .. })));

        store.add_data(&hash, &bytes).unwrap();
        store.delete_data(&hash, "gone").unwrap();
        assert!(!store.has_data(&hash));
        assert!(matches!(store.get_data(&hash), Err(StoreError::NotFound { .. })));
        assert!(matches!(store.delete_data(&hash, "gone"), Err(StoreError::NotFound { .. })));
        assert_eq!(store.data_count(), 0);

        store.add_data(&hash, &bytes).unwrap();
        assert_eq!(store.get_data(&hash).unwrap(), bytes);
    }

    #[test]
    fn duplicate_add_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let (hash, bytes) = data(b"dup");
        store.add_data(&hash, &bytes).unwrap();
        let used = total_used(&store);
        assert!(matches!(store.add_data(&hash, &bytes), Err(StoreError::AlreadyExists { .. })));
        assert_eq!(total_used(&store), used);
        assert_eq!(store.data_count(), 1);
    }

    #[test]
    fn batch_failures_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let good = data(b"good");
        let (other, _) = data(b"other");
        let big = vec![1u8; DEFAULT_MAX_DATA_CHUNK_SIZE as usize + 1];
        let also_good = data(b"also good");
        let batch = vec![
            good.clone(),
            (other, b"not other".to_vec()),
            (ContentHasher::DATA.hash(&big), big),
            also_good.clone(),
        ];

        let results = store.add_data_batch(&batch);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StoreError::HashMismatch { .. })));
        assert!(matches!(results[2], Err(StoreError::SizeExceeded { .. })));
        assert!(results[3].is_ok());
        assert_eq!(store.get_data(&good.0).unwrap(), good.1);
        assert_eq!(store.get_data(&also_good.0).unwrap(), also_good.1);
        assert_eq!(store.data_count(), 2);
    }

    #[test]
    fn namespaces_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let (hash, bytes) = data(b"content");
        store.add_data(&hash, &bytes).unwrap();
        store.add_meta(&hash, b"description").unwrap();

        assert_eq!(store.get_data(&hash).unwrap(), bytes);
        assert_eq!(store.get_meta(&hash).unwrap(), b"description");

        store.delete_data(&hash, "drop data").unwrap();
        assert!(!store.has_data(&hash));
        assert!(store.has_meta(&hash));
        assert_eq!(store.get_meta(&hash).unwrap(), b"description");
    }

    #[test]
    fn accounting_tracks_live_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let chunks: Vec<_> = (0..20u32).map(|i| data(&vec![i as u8; 100 + i as usize])).collect();
        for (hash, bytes) in &chunks {
            store.add_data(hash, bytes).unwrap();
        }
        let deleted: Vec<usize> = (0..20).step_by(3).collect();
        for &i in &deleted {
            store.delete_data(&chunks[i].0, "t").unwrap();
        }

        let live: Vec<_> = (0..20).filter(|i| !deleted.contains(i)).map(|i| &chunks[i]).collect();
        let live_bytes: u64 = live.iter().map(|(_, b)| b.len() as u64).sum();
        assert_eq!(total_used(&store), 20 * ENTRY_SIZE + live_bytes);

        assert!(store.compact_all(true) > 0);
        assert_eq!(total_used(&store), live.len() as u64 * ENTRY_SIZE + live_bytes);
        for (hash, bytes) in live {
            assert_eq!(&store.get_data(hash).unwrap(), bytes);
        }
    }

    #[test]
    fn compaction_drops_emptied_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let hash = meta_hash(0x70, 1);
        store.add_meta(&hash, b"short lived").unwrap();
        store.delete_meta(&hash, "t").unwrap();

        assert_eq!(store.compact_all(false), 1);
        assert_eq!(total_used(&store), 0);
        assert!(store.read_routes().is_empty());
        assert!(files_with_suffix(tmp.path(), ".blk").is_empty());

        store.add_meta(&hash, b"back again").unwrap();
        assert_eq!(store.get_meta(&hash).unwrap(), b"back again");
    }

    #[test]
    fn full_block_splits_into_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        cfg.block = BlockConfig {
            max_block_size: 4096,
            headers_per_file: 16,
        };
        let store = ChunkStore::open(cfg).unwrap();

        let hashes: Vec<ContentHash> = (0..12u8)
            .map(|i| {
                let mut bytes = [0x00u8; 32];
                bytes[..3].copy_from_slice(&[0xab, 0xcd, i]);
                ContentHash::from_bytes(bytes)
            })
            .collect();
        for (i, hash) in hashes.iter().enumerate() {
            store.add_meta(hash, &vec![i as u8; 1000]).unwrap();
        }

        for (i, hash) in hashes.iter().enumerate() {
            assert_eq!(store.get_meta(hash).unwrap(), vec![i as u8; 1000]);
        }
        let blocks_root = tmp.path().join("d0").join(BLOCKS_DIR);
        let block_files = files_with_suffix(&blocks_root, ".blk");
        assert!(block_files.len() > 1);
        assert!(block_files.iter().any(|p| p.parent() != Some(blocks_root.as_path())));
        assert!(store.read_routes().len() > 1);
        assert_eq!(total_used(&store), 12 * (ENTRY_SIZE + 1000));
        assert!(files_with_suffix(&blocks_root, ".backup").is_empty());
    }

    #[test]
    fn reopen_in_reverse_order_restores_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = vec![
            DirectoryConfig::bounded(tmp.path().join("a"), 400_000),
            DirectoryConfig::unbounded(tmp.path().join("b")),
        ];
        let mut cfg = config(dirs.clone());
        cfg.block = BlockConfig {
            max_block_size: 64 * 1024,
            headers_per_file: 64,
        };
        let mut rng = rand::thread_rng();

        let store = ChunkStore::open(cfg.clone()).unwrap();
        let chunks: Vec<_> = (0..100).map(|_| random_data(&mut rng, 2000)).collect();
        let meta: Vec<(ContentHash, Vec<u8>)> = (0..100)
            .map(|i| (ContentHash::from_bytes(rng.gen()), vec![i as u8; i]))
            .collect();
        for (hash, bytes) in &chunks {
            store.add_data(hash, bytes).unwrap();
        }
        for (hash, bytes) in &meta {
            store.add_meta(hash, bytes).unwrap();
        }
        let used: HashMap<PathBuf, u64> = store
            .stats()
            .directories
            .into_iter()
            .map(|d| (d.path, d.used_bytes))
            .collect();
        store.close().unwrap();

        cfg.directories = dirs.into_iter().rev().collect();
        let store = ChunkStore::open(cfg).unwrap();
        assert_eq!(store.data_count(), 100);
        assert_eq!(store.meta_count(), 100);
        for (hash, bytes) in &chunks {
            assert_eq!(&store.get_data(hash).unwrap(), bytes);
        }
        for (hash, bytes) in &meta {
            assert_eq!(&store.get_meta(hash).unwrap(), bytes);
        }
        let mut expected: Vec<ContentHash> = chunks.iter().map(|(h, _)| *h).collect();
        expected.sort();
        assert_eq!(store.list_data_hashes(0, 1000), expected);
        for dir in store.stats().directories {
            assert_eq!(used[&dir.path], dir.used_bytes);
        }
    }

    #[test]
    fn deletions_are_logged_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("logs");
        let mut cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        cfg.log_deleted_data = true;
        cfg.log_dir = Some(log_dir.clone());
        let store = ChunkStore::open(cfg).unwrap();

        let chunks: Vec<_> = (0..10u8).map(|i| data(&[i; 16])).collect();
        for (hash, bytes) in &chunks {
            store.add_data(hash, bytes).unwrap();
        }
        let mut deleted = Vec::new();
        for (hash, _) in chunks.iter().skip(1).step_by(2) {
            store.delete_data(hash, "test").unwrap();
            deleted.push(*hash);
        }
        store.add_meta(&meta_hash(1, 1), b"m").unwrap();
        store.delete_meta(&meta_hash(1, 1), "test").unwrap();
        store.close().unwrap();

        let logged = DeletionLog::read_hashes(&log_dir.join(DATA_LOG_NAME)).unwrap();
        assert_eq!(logged, deleted);
        assert!(!log_dir.join(META_LOG_NAME).exists());
    }

    #[test]
    fn disabled_logging_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("logs");
        let mut cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        cfg.log_dir = Some(log_dir.clone());
        let store = ChunkStore::open(cfg).unwrap();

        let (hash, bytes) = data(b"x");
        store.add_data(&hash, &bytes).unwrap();
        store.delete_data(&hash, "test").unwrap();
        store.close().unwrap();

        assert!(!log_dir.join(DATA_LOG_NAME).exists());
        assert!(!log_dir.join(META_LOG_NAME).exists());
    }

    #[test]
    fn logging_without_log_dir_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        cfg.log_deleted_meta = true;
        assert!(matches!(ChunkStore::open(cfg), Err(StoreError::Config(_))));
    }

    #[test]
    fn trailing_separator_names_the_same_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("d0");
        let trailing = PathBuf::from(format!("{}/", plain.display()));
        let store = ChunkStore::open(config(vec![
            DirectoryConfig::unbounded(&plain),
            DirectoryConfig::unbounded(&trailing),
        ]))
        .unwrap();
        assert_eq!(store.directories().len(), 1);

        let (hash, bytes) = data(b"counted once");
        store.add_data(&hash, &bytes).unwrap();
        let used = total_used(&store);
        store.register_directory(StorageDirectory::unbounded(&trailing)).unwrap();
        assert_eq!(store.directories().len(), 1);
        assert_eq!(total_used(&store), used);
        assert_eq!(used, ENTRY_SIZE + bytes.len() as u64);
    }

    #[test]
    fn stray_copies_are_reconciled_without_double_counting() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        let cfg = config(vec![DirectoryConfig::unbounded(&a)]);

        let store = ChunkStore::open(cfg.clone()).unwrap();
        let hashes: Vec<ContentHash> = (0..5u8).map(|i| meta_hash(0x10, i)).collect();
        for (i, hash) in hashes.iter().enumerate() {
            store.add_meta(hash, &vec![i as u8; 300]).unwrap();
        }
        let used = total_used(&store);
        store.close().unwrap();

        // Leftovers of a copy to `b` that was interrupted before the
        // source was removed.
        let source = a.join(BLOCKS_DIR).join("10.blk");
        fs::create_dir_all(b.join(BLOCKS_DIR)).unwrap();
        fs::copy(&source, b.join(BLOCKS_DIR).join("10.blk")).unwrap();
        fs::copy(&source, b.join(BLOCKS_DIR).join("10.blk.moving")).unwrap();

        let mut cfg = cfg;
        cfg.directories.push(DirectoryConfig::unbounded(&b));
        let store = ChunkStore::open(cfg).unwrap();
        assert_eq!(store.meta_count(), 5);
        for (i, hash) in hashes.iter().enumerate() {
            assert_eq!(store.get_meta(hash).unwrap(), vec![i as u8; 300]);
        }
        assert_eq!(total_used(&store), used);
        assert!(files_with_suffix(&b, ".blk").is_empty());
        assert!(files_with_suffix(&b, ".moving").is_empty());
        assert!(files_with_suffix(&b, ".merging").is_empty());
    }

    #[test]
    fn backup_artifact_is_merged_on_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        let store = ChunkStore::open(cfg.clone()).unwrap();
        let hashes: Vec<ContentHash> = (0..6u8).map(|i| meta_hash(0x20, i)).collect();
        for hash in &hashes {
            store.add_meta(hash, hash.as_bytes()).unwrap();
        }
        let used = total_used(&store);
        store.close().unwrap();

        // A rewrite that stopped after renaming the block aside.
        let blocks_root = tmp.path().join("d0").join(BLOCKS_DIR);
        fs::rename(blocks_root.join("20.blk"), blocks_root.join("20.blk.backup")).unwrap();

        let store = ChunkStore::open(cfg).unwrap();
        assert_eq!(store.meta_count(), 6);
        for hash in &hashes {
            assert_eq!(store.get_meta(hash).unwrap(), hash.as_bytes());
        }
        assert_eq!(total_used(&store), used);
        assert!(blocks_root.join("20.blk").is_file());
        assert!(files_with_suffix(&blocks_root, ".backup").is_empty());
        assert!(files_with_suffix(&blocks_root, ".merging").is_empty());
    }

    #[test]
    fn unreadable_block_is_set_aside_and_its_prefix_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        let store = ChunkStore::open(cfg.clone()).unwrap();
        store.add_meta(&meta_hash(0x30, 0), b"fine").unwrap();
        store.close().unwrap();

        let blocks_root = tmp.path().join("d0").join(BLOCKS_DIR);
        fs::write(blocks_root.join("31.blk"), b"not a block").unwrap();

        let store = ChunkStore::open(cfg.clone()).unwrap();
        assert_eq!(store.get_meta(&meta_hash(0x30, 0)).unwrap(), b"fine");
        assert!(!store.has_meta(&meta_hash(0x31, 0)));
        assert!(blocks_root.join("31.blk.corrupt").is_file());

        store.add_meta(&meta_hash(0x31, 0), b"new").unwrap();
        assert_eq!(store.get_meta(&meta_hash(0x31, 0)).unwrap(), b"new");
        store.close().unwrap();

        let store = ChunkStore::open(cfg).unwrap();
        assert_eq!(store.meta_count(), 2);
        assert_eq!(fs::read(blocks_root.join("31.blk.corrupt")).unwrap(), b"not a block");
    }

    #[test]
    fn impossible_entry_offset_only_loses_its_block() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        let store = ChunkStore::open(cfg.clone()).unwrap();
        store.add_meta(&meta_hash(0x30, 0), b"kept").unwrap();
        store.add_meta(&meta_hash(0x40, 0), b"lost").unwrap();
        store.close().unwrap();

        let damaged = tmp.path().join("d0").join(BLOCKS_DIR).join("40.blk");
        let mut file = OpenOptions::new().write(true).open(&damaged).unwrap();
        file.seek(SeekFrom::Start(FILE_HEADER_SIZE + 36)).unwrap();
        file.write_all(&u64::MAX.to_be_bytes()).unwrap();
        drop(file);

        let store = ChunkStore::open(cfg).unwrap();
        assert_eq!(store.get_meta(&meta_hash(0x30, 0)).unwrap(), b"kept");
        assert!(!store.has_meta(&meta_hash(0x40, 0)));
        assert!(matches!(store.get_meta(&meta_hash(0x40, 0)), Err(StoreError::NotFound { .. })));
        assert_eq!(total_used(&store), ENTRY_SIZE + 4);
        store.add_meta(&meta_hash(0x40, 0), b"again").unwrap();
        assert_eq!(store.get_meta(&meta_hash(0x40, 0)).unwrap(), b"again");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_log_write_still_forgets_the_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("logs");
        fs::create_dir_all(&log_dir).unwrap();
        std::os::unix::fs::symlink("/dev/full", log_dir.join(DATA_LOG_NAME)).unwrap();
        let mut cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        cfg.log_deleted_data = true;
        cfg.log_dir = Some(log_dir);
        let store = ChunkStore::open(cfg).unwrap();

        let (hash, bytes) = data(b"doomed");
        store.add_data(&hash, &bytes).unwrap();
        assert!(matches!(store.delete_data(&hash, "t"), Err(StoreError::Io(_))));

        assert!(!store.has_data(&hash));
        assert!(matches!(store.get_data(&hash), Err(StoreError::NotFound { .. })));
        assert_eq!(store.data_count(), 0);
        assert!(store.list_data_hashes(0, 10).is_empty());
        assert_eq!(total_used(&store), ENTRY_SIZE);
    }

    #[test]
    fn unavailable_directory_is_left_out() {
        let tmp = tempfile::tempdir().unwrap();
        let bad = tmp.path().join("bad");
        fs::write(&bad, b"a file, not a directory").unwrap();
        let good = tmp.path().join("good");

        let store = ChunkStore::open(config(vec![
            DirectoryConfig::unbounded(&bad),
            DirectoryConfig::unbounded(&good),
        ]))
        .unwrap();
        assert_eq!(store.directories().len(), 1);
        assert_eq!(store.directories()[0].path(), good.as_path());

        let (hash, bytes) = data(b"still works");
        store.add_data(&hash, &bytes).unwrap();
        assert_eq!(store.get_data(&hash).unwrap(), bytes);
        assert!(matches!(
            store.register_directory(StorageDirectory::unbounded(&bad)),
            Err(StoreError::DirectoryUnavailable { .. })
        ));
    }

    #[test]
    fn failed_add_leaves_no_block_routed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        // A directory squatting on the block file's name.
        let squatter = tmp.path().join("d0").join(BLOCKS_DIR).join("ab.blk");
        fs::create_dir_all(&squatter).unwrap();

        let hash = meta_hash(0xab, 0);
        assert!(store.add_meta(&hash, b"x").is_err());
        assert!(store.read_routes().is_empty());
        assert_eq!(store.stats().directories[0].blocks, 0);
        assert_eq!(total_used(&store), 0);
        assert!(!store.has_meta(&hash));

        fs::remove_dir(&squatter).unwrap();
        store.add_meta(&hash, b"x").unwrap();
        assert_eq!(store.get_meta(&hash).unwrap(), b"x");
        assert_eq!(store.stats().directories[0].blocks, 1);
    }

    #[test]
    fn backup_merge_that_splits_routes_to_children() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        cfg.block = BlockConfig {
            max_block_size: 4096,
            headers_per_file: 16,
        };
        let store = ChunkStore::open(cfg).unwrap();
        store.add_meta(&meta_hash(0x50, 0), &[0u8; 1000]).unwrap();

        // A backup holding more than the block can take without splitting.
        let scratch = Arc::new(StorageDirectory::unbounded(tmp.path().join("scratch")));
        let source = Block::create(
            BlockPrefix::from_bytes(&[0x50]).unwrap(),
            scratch,
            BlockConfig {
                max_block_size: 1 << 20,
                headers_per_file: 16,
            },
        );
        for i in 1..=6u8 {
            source.add(meta_hash(0x50, i), ChunkKind::Meta, &[i; 1000]).unwrap();
        }
        let blocks_root = tmp.path().join("d0").join(BLOCKS_DIR);
        fs::copy(
            source.read().unwrap().path(),
            blocks_root.join("50.blk.backup"),
        )
        .unwrap();

        let block = store.read_routes().covering(&meta_hash(0x50, 0)).unwrap();
        let mut writer = block.write().unwrap();
        let outcome = store.merge_backup(&block, &mut writer).unwrap();
        drop(writer);

        assert!(outcome.children.is_some());
        assert!(store.read_routes().len() > 1);
        for i in 0..=6u8 {
            assert!(store.has_meta(&meta_hash(0x50, i)));
            assert_eq!(store.get_meta(&meta_hash(0x50, i)).unwrap(), vec![i; 1000]);
        }
        assert_eq!(store.meta_count(), 7);
        assert_eq!(total_used(&store), 7 * (ENTRY_SIZE + 1000));
        assert!(files_with_suffix(&blocks_root, ".backup").is_empty());
        assert!(files_with_suffix(&blocks_root, ".merging").is_empty());
    }

    /// Store X and Y in `a`, copy the block to `b`, then delete X in `a`
    /// only. Reopens over both directories in the given order.
    fn reopen_with_stale_copy(root: &Path, stale_first: bool) -> ChunkStore {
        let a = root.join("a");
        let b = root.join("b");
        let store = ChunkStore::open(config(vec![DirectoryConfig::unbounded(&a)])).unwrap();
        store.add_meta(&meta_hash(0x10, 0), b"x").unwrap();
        store.add_meta(&meta_hash(0x10, 1), b"y").unwrap();
        store.close().unwrap();

        fs::create_dir_all(b.join(BLOCKS_DIR)).unwrap();
        fs::copy(a.join(BLOCKS_DIR).join("10.blk"), b.join(BLOCKS_DIR).join("10.blk")).unwrap();

        let store = ChunkStore::open(config(vec![DirectoryConfig::unbounded(&a)])).unwrap();
        store.delete_meta(&meta_hash(0x10, 0), "t").unwrap();
        store.close().unwrap();

        let mut dirs = vec![DirectoryConfig::unbounded(&a), DirectoryConfig::unbounded(&b)];
        if stale_first {
            dirs.reverse();
        }
        ChunkStore::open(config(dirs)).unwrap()
    }

    #[test]
    fn stale_copy_does_not_resurrect_deleted_chunks() {
        for stale_first in [false, true] {
            let tmp = tempfile::tempdir().unwrap();
            let store = reopen_with_stale_copy(tmp.path(), stale_first);

            assert!(!store.has_meta(&meta_hash(0x10, 0)), "stale_first = {stale_first}");
            assert!(matches!(
                store.get_meta(&meta_hash(0x10, 0)),
                Err(StoreError::NotFound { .. })
            ));
            assert_eq!(store.get_meta(&meta_hash(0x10, 1)).unwrap(), b"y");
            assert_eq!(store.meta_count(), 1);
            assert_eq!(total_used(&store), 2 * ENTRY_SIZE + 1);
            assert_eq!(files_with_suffix(tmp.path(), ".blk").len(), 1);
        }
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(vec![
            DirectoryConfig::unbounded(tmp.path().join("a")),
            DirectoryConfig::unbounded(tmp.path().join("b")),
        ]);
        cfg.block = BlockConfig {
            max_block_size: 16 * 1024,
            headers_per_file: 32,
        };
        let store = ChunkStore::open(cfg).unwrap();

        let per_thread: Vec<Vec<(ContentHash, Vec<u8>)>> = (0..8u32)
            .map(|t| {
                (0..60u32)
                    .map(|i| data(format!("thread {t} chunk {i} {}", "x".repeat(i as usize * 3)).as_bytes()))
                    .collect()
            })
            .collect();

        std::thread::scope(|scope| {
            for chunks in &per_thread {
                let store = &store;
                scope.spawn(move || {
                    for (hash, bytes) in chunks {
                        store.add_data(hash, bytes).unwrap();
                        assert_eq!(&store.get_data(hash).unwrap(), bytes);
                    }
                    for (hash, _) in chunks.iter().step_by(4) {
                        store.delete_data(hash, "concurrent").unwrap();
                    }
                });
            }
        });

        let mut live = 0;
        for chunks in &per_thread {
            for (i, (hash, bytes)) in chunks.iter().enumerate() {
                if i % 4 == 0 {
                    assert!(!store.has_data(hash));
                } else {
                    live += 1;
                    assert_eq!(&store.get_data(hash).unwrap(), bytes);
                }
            }
        }
        assert_eq!(store.data_count(), live);
        assert_eq!(store.list_data_hashes(0, usize::MAX).len(), live);
    }

    #[test]
    fn partial_index_never_reports_false_negatives() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(vec![DirectoryConfig::unbounded(tmp.path().join("d0"))]);
        cfg.index_capacity = 5;
        let store = ChunkStore::open(cfg.clone()).unwrap();

        let chunks: Vec<_> = (0..20u8).map(|i| data(&[i; 8])).collect();
        for (hash, bytes) in &chunks {
            store.add_data(hash, bytes).unwrap();
        }
        assert!(!store.index_read(ChunkKind::Data).is_complete());
        for (hash, _) in &chunks {
            assert!(store.has_data(hash));
        }
        assert!(!store.has_data(&data(b"absent").0));
        assert_eq!(store.data_count(), 20);

        let mut expected: Vec<ContentHash> = chunks.iter().map(|(h, _)| *h).collect();
        expected.sort();
        assert_eq!(store.list_data_hashes(0, 100), expected);

        for (hash, _) in &chunks[..3] {
            store.delete_data(hash, "t").unwrap();
            assert!(!store.has_data(hash));
        }
        assert_eq!(store.data_count(), 17);
        assert_eq!(store.list_data_hashes(0, 100).len(), 17);
        store.close().unwrap();

        let store = ChunkStore::open(cfg).unwrap();
        assert_eq!(store.data_count(), 17);
        assert!(store.has_data(&chunks[19].0));
    }

    #[test]
    fn no_directory_with_room() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(config(vec![DirectoryConfig::bounded(tmp.path().join("d0"), 1000)])).unwrap();

        let (first, bytes) = data(&[1u8; 500]);
        store.add_data(&first, &bytes).unwrap();
        let (second, bytes) = data(&[2u8; 500]);
        assert!(matches!(store.add_data(&second, &bytes), Err(StoreError::NoCapacity { .. })));
        assert!(!store.has_data(&second));
        assert_eq!(total_used(&store), ENTRY_SIZE + 500);
    }

    #[test]
    fn chunks_land_in_a_second_directory_when_the_first_is_full() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(config(vec![
            DirectoryConfig::bounded(tmp.path().join("a"), 1000),
            DirectoryConfig::bounded(tmp.path().join("b"), 10_000),
        ]))
        .unwrap();
        let chunks: Vec<_> = (0..6u8).map(|i| data(&[i; 600])).collect();
        for (hash, bytes) in &chunks {
            store.add_data(hash, bytes).unwrap();
        }
        for (hash, bytes) in &chunks {
            assert_eq!(&store.get_data(hash).unwrap(), bytes);
        }
        for dir in store.directories() {
            assert!(dir.used_bytes() <= dir.size_limit());
        }
        assert_eq!(total_used(&store), 6 * (ENTRY_SIZE + 600));
    }

    #[test]
    fn pagination_is_stable_and_ordered() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let mut rng = rand::thread_rng();
        let mut hashes: Vec<ContentHash> = (0..30).map(|_| ContentHash::from_bytes(rng.gen())).collect();
        for hash in &hashes {
            store.add_meta(hash, b"m").unwrap();
        }
        hashes.sort();

        let mut paged = Vec::new();
        let mut offset = 0;
        loop {
            let page = store.list_meta_hashes(offset, 7);
            if page.is_empty() {
                break;
            }
            offset += page.len();
            paged.extend(page);
        }
        assert_eq!(paged, hashes);
        assert_eq!(store.list_meta_hashes(0, 100), hashes);
        assert!(store.list_meta_hashes(30, 10).is_empty());
        assert!(store.list_data_hashes(0, 10).is_empty());
    }

    #[test]
    fn directories_can_be_added_while_open() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_in(tmp.path());
        let (hash, bytes) = data(b"before");
        store.add_data(&hash, &bytes).unwrap();

        store
            .register_directory(StorageDirectory::new(tmp.path().join("d1"), 1 << 20))
            .unwrap();
        let stats = store.stats();
        assert_eq!(stats.directories.len(), 2);
        assert_eq!(stats.directories[0].blocks, 1);
        assert_eq!(stats.directories[1].blocks, 0);
        assert_eq!(stats.data_count, 1);
        assert_eq!(store.get_data(&hash).unwrap(), bytes);
    }
}
