//! Compaction and pending-artifact merging.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::artifact::{read_pending, PendingEntry};
use crate::block::{AddOutcome, Block, BlockState, BlockWriter};
use crate::config::BlockConfig;
use crate::directory::StorageDirectory;
use crate::error::{BlockError, BlockResult};
use crate::fault::{FaultInjector, NoFaults};
use crate::path::{artifact_path, ArtifactKind, BlockPrefix};

/// Minimum share of written payload bytes that must be deleted before an
/// unforced compaction runs.
pub const COMPACT_MIN_SAVINGS: f64 = 0.25;

/// What a compaction did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactOutcome {
    /// Nothing to reclaim, or not enough to be worth a rewrite.
    Skipped,
    /// The file was rewritten without its deleted entries.
    Compacted {
        reclaimed_slots: usize,
        reclaimed_bytes: u64,
    },
    /// Every entry was deleted; the file was removed and the block is empty.
    Emptied,
}

/// What [`BlockWriter::merge_pending`] did with an artifact's entries.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Entries re-inserted.
    pub merged: usize,
    /// Entries already present.
    pub skipped: usize,
    /// Entries that do not route to this block. When non-zero the artifact
    /// is left on disk, renamed to this block's `.blk.merging` path, for the
    /// caller to reconcile.
    pub foreign: usize,
    /// Set if re-inserting caused this block to split.
    pub children: Option<Vec<Arc<Block>>>,
}

impl BlockWriter<'_> {
    /// Rewrite the block without its deleted entries.
    ///
    /// If the rewrite fails, the surviving entries are restored from the
    /// backup artifact and the failure is logged. An error is returned only
    /// when that recovery also fails, in which case the backup is left for
    /// directory registration to merge.
    pub fn compact(&mut self, force: bool) -> BlockResult<CompactOutcome> {
        match self.compact_with(force, &NoFaults) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(prefix = %self.block.prefix(), error = %e, "compaction failed; restoring from backup");
                self.restore_backup()?;
                Ok(CompactOutcome::Skipped)
            }
        }
    }

    /// [`BlockWriter::compact`] with an explicit fault injector and no
    /// automatic recovery.
    ///
    /// On failure the block is left as a backup artifact plus a partially
    /// rewritten file, which [`BlockWriter::merge_pending`] reconciles.
    #[instrument(skip(self, faults), fields(prefix = %self.block.prefix()), level = "debug")]
    pub fn compact_with(&mut self, force: bool, faults: &dyn FaultInjector) -> BlockResult<CompactOutcome> {
        if self.inner.state != BlockState::Active {
            return Ok(CompactOutcome::Skipped);
        }
        let (deleted_slots, deleted_bytes) = self.inner.deleted_stats();
        if deleted_slots == 0 || (!force && !self.worth_compacting(deleted_slots, deleted_bytes)) {
            return Ok(CompactOutcome::Skipped);
        }

        let survivors = self.inner.live_payloads()?;
        let before = self.inner.accounted();

        if survivors.is_empty() {
            fs::remove_file(&self.inner.path)?;
            self.inner.clear(BlockState::Empty);
            self.settle(before);
            info!(prefix = %self.block.prefix(), "block emptied by compaction");
            return Ok(CompactOutcome::Emptied);
        }

        let backup = artifact_path(&self.inner.path, ArtifactKind::Backup);
        fs::rename(&self.inner.path, &backup)?;
        let slots = self.inner.header.slots;
        self.inner.clear(BlockState::Empty);

        let result = self.rewrite(slots, &survivors, faults);
        self.settle(before);
        result?;

        if let Err(e) = fs::remove_file(&backup) {
            warn!(path = %backup.display(), error = %e, "could not remove compaction backup");
        }
        info!(
            prefix = %self.block.prefix(),
            reclaimed_slots = deleted_slots,
            reclaimed_bytes = deleted_bytes,
            "block compacted"
        );
        Ok(CompactOutcome::Compacted {
            reclaimed_slots: deleted_slots,
            reclaimed_bytes: deleted_bytes,
        })
    }

    fn worth_compacting(&self, deleted_slots: usize, deleted_bytes: u64) -> bool {
        let written: u64 = self.inner.entries.iter().map(|e| e.length as u64).sum();
        if written > 0 && deleted_bytes as f64 >= written as f64 * COMPACT_MIN_SAVINGS {
            return true;
        }
        deleted_slots * 4 >= self.inner.entries.len()
    }

    fn rewrite(&mut self, slots: u32, survivors: &[PendingEntry], faults: &dyn FaultInjector) -> BlockResult<()> {
        self.inner.initialize(slots)?;
        for (written, entry) in survivors.iter().enumerate() {
            faults.before_header_write(written)?;
            self.inner.append(entry.hash, entry.kind, &entry.bytes)?;
        }
        Ok(())
    }

    /// Re-append entries from this block's backup artifact that are missing
    /// from the live file, then remove the backup.
    pub(crate) fn restore_backup(&mut self) -> BlockResult<()> {
        let backup = artifact_path(&self.inner.path, ArtifactKind::Backup);
        if !backup.exists() {
            return Ok(());
        }
        let pending = read_pending(&backup)?;
        let before = self.inner.accounted();
        if self.inner.state == BlockState::Empty && !pending.is_empty() {
            let slots = self.inner.header.slots;
            self.inner.initialize(slots)?;
        }
        let mut restored = 0usize;
        for entry in &pending {
            if self.inner.find(&entry.hash, entry.kind).is_none() {
                self.inner.append(entry.hash, entry.kind, &entry.bytes)?;
                restored += 1;
            }
        }
        self.settle(before);
        fs::remove_file(&backup)?;
        info!(prefix = %self.block.prefix(), restored, "block restored from backup");
        Ok(())
    }

    /// Re-insert the entries of a pending artifact through the normal add path.
    ///
    /// The artifact is first renamed to this block's `.blk.merging` path.
    /// Entries already present are skipped. If an insert splits this block,
    /// the remaining entries go to the children, and the children are
    /// returned in the outcome. The artifact is removed once every entry
    /// routed to this block has been merged.
    #[instrument(skip(self), fields(prefix = %self.block.prefix()), level = "debug")]
    pub fn merge_pending(&mut self, artifact: &Path) -> BlockResult<MergeOutcome> {
        let merging = artifact_path(&self.inner.path, ArtifactKind::Merging);
        if artifact != merging {
            if merging.exists() {
                return Err(BlockError::MergeFailure(format!(
                    "earlier merge still pending at {}",
                    merging.display()
                )));
            }
            // A split during the merge would reuse the backup name.
            if let Some(parent) = merging.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(artifact, &merging)?;
        }
        let artifact = merging.as_path();
        let pending = read_pending(artifact)?;
        let prefix = self.block.prefix().clone();
        let config = self.block.config().clone();
        let directory = self.inner.directory.clone();
        let mut outcome = MergeOutcome::default();

        for entry in pending {
            if !prefix.covers(&entry.hash) {
                outcome.foreign += 1;
                continue;
            }
            let split = match outcome.children.as_mut() {
                Some(leaves) => add_to_leaves(&prefix, &directory, &config, leaves, &entry).map(|()| None),
                None => self.add(entry.hash, entry.kind, &entry.bytes).map(|added| match added {
                    AddOutcome::Split(children) => Some(children),
                    AddOutcome::Stored => None,
                }),
            };
            match split {
                Ok(Some(children)) => {
                    outcome.children = Some(children);
                    outcome.merged += 1;
                }
                Ok(None) => outcome.merged += 1,
                Err(BlockError::AlreadyExists { .. }) => outcome.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        if outcome.foreign > 0 {
            warn!(
                path = %artifact.display(),
                foreign = outcome.foreign,
                "artifact holds entries for other blocks; leaving it in place"
            );
        } else {
            fs::remove_file(artifact)?;
        }
        info!(
            %prefix,
            merged = outcome.merged,
            skipped = outcome.skipped,
            split = outcome.children.is_some(),
            "pending artifact merged"
        );
        Ok(outcome)
    }
}

/// Add an entry to whichever of `leaves` covers it, creating a new leaf
/// below `parent` when none does. Leaves that split are replaced by their
/// children.
pub(crate) fn add_to_leaves(
    parent: &BlockPrefix,
    directory: &Arc<StorageDirectory>,
    config: &BlockConfig,
    leaves: &mut Vec<Arc<Block>>,
    entry: &PendingEntry,
) -> BlockResult<()> {
    let position = match leaves.iter().position(|leaf| leaf.prefix().covers(&entry.hash)) {
        Some(position) => position,
        None => {
            let prefix = BlockPrefix::vacant(&entry.hash, parent.len() + 1, |candidate| {
                leaves
                    .iter()
                    .any(|leaf| leaf.prefix() == candidate || candidate.is_ancestor_of(leaf.prefix()))
            });
            debug!(%prefix, "creating leaf for merged entry");
            leaves.push(Arc::new(Block::create(prefix, directory.clone(), config.clone())));
            leaves.len() - 1
        }
    };

    let leaf = leaves[position].clone();
    let added = leaf.write()?.add(entry.hash, entry.kind, &entry.bytes)?;
    if let AddOutcome::Split(children) = added {
        leaves.splice(position..=position, children);
    }
    Ok(())
}

impl Block {
    /// Take the write lock and compact. See [`BlockWriter::compact`].
    pub fn compact(&self, force: bool) -> BlockResult<CompactOutcome> {
        self.write()?.compact(force)
    }

    /// Take the write lock and merge an artifact. See [`BlockWriter::merge_pending`].
    pub fn merge_pending(&self, artifact: &Path) -> BlockResult<MergeOutcome> {
        self.write()?.merge_pending(artifact)
    }
}
