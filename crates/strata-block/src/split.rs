//! Splitting a full block into children under longer prefixes.
//!
//! Protocol: the parent file is renamed to `<name>.blk.backup`, every child is
//! written under `<name>/`, then the backup is removed. If writing a child
//! fails, the written children are removed and the backup is renamed back, so
//! the parent is left exactly as it was. A crash mid-split leaves the backup
//! and some children on disk; directory registration merges the backup.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use tracing::{info, warn};

use crate::artifact::PendingEntry;
use crate::block::{Block, BlockState, BlockWriter};
use crate::config::BlockConfig;
use crate::error::BlockResult;
use crate::fault::FaultInjector;
use crate::format::FileHeader;
use crate::path::{artifact_path, ArtifactKind, BlockPrefix};

impl BlockWriter<'_> {
    /// Split this block, placing its live entries plus `incoming` into children.
    ///
    /// On success the block is retired and the children are returned. The
    /// caller must install them in its routing table before releasing this
    /// guard.
    pub(crate) fn split_with(
        &mut self,
        incoming: PendingEntry,
        faults: &dyn FaultInjector,
    ) -> BlockResult<Vec<Arc<Block>>> {
        let prefix = self.block.prefix().clone();
        let config = self.block.config().clone();
        let had_file = self.inner.state == BlockState::Active;

        let mut entries = if had_file {
            self.inner.live_payloads()?
        } else {
            Vec::new()
        };
        entries.push(incoming);
        let groups = partition(&prefix, entries, &config);

        let before = self.inner.accounted();
        let backup = artifact_path(&self.inner.path, ArtifactKind::Backup);
        if had_file {
            fs::rename(&self.inner.path, &backup)?;
        }

        let directory = self.inner.directory.clone();
        let mut children: Vec<Arc<Block>> = Vec::with_capacity(groups.len());
        let mut written = 0usize;
        let mut failure = None;
        for (child_prefix, group) in groups {
            let child = Arc::new(Block::create(child_prefix, directory.clone(), config.clone()));
            children.push(child.clone());
            if let Err(e) = write_child(&child, &group, &mut written, faults) {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            warn!(%prefix, error = %e, "split failed; restoring parent");
            for child in &children {
                let path = child.prefix().block_path(&directory);
                if let Err(remove) = fs::remove_file(&path) {
                    if remove.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %remove, "could not remove partial child");
                    }
                }
            }
            if had_file {
                fs::rename(&backup, &self.inner.path)?;
            }
            return Err(e);
        }

        if had_file {
            if let Err(e) = fs::remove_file(&backup) {
                warn!(path = %backup.display(), error = %e, "could not remove split backup");
            }
        }

        let after: u64 = children
            .iter()
            .map(|c| c.read().map(|r| r.accounted_bytes()).unwrap_or(0))
            .sum();
        directory.adjust_used(after as i64 - before as i64);
        self.inner.clear(BlockState::Retired);

        info!(%prefix, children = children.len(), "block split");
        Ok(children)
    }
}

fn write_child(
    child: &Block,
    group: &[PendingEntry],
    written: &mut usize,
    faults: &dyn FaultInjector,
) -> BlockResult<()> {
    let mut writer = child.write()?;
    let slots = child.config().headers_per_file.max(1).max(group.len() as u32);
    writer.inner.initialize(slots)?;
    for entry in group {
        if writer.inner.find(&entry.hash, entry.kind).is_some() {
            continue;
        }
        faults.before_header_write(*written)?;
        writer.inner.append(entry.hash, entry.kind, &entry.bytes)?;
        *written += 1;
    }
    Ok(())
}

/// Group entries by the byte after `prefix`, recursing into groups that
/// would still overflow a single block.
///
/// A group becomes a leaf when its prefix spans the whole hash, when it holds
/// a single entry, or when it fits within `config`.
pub(crate) fn partition(
    prefix: &BlockPrefix,
    entries: Vec<PendingEntry>,
    config: &BlockConfig,
) -> Vec<(BlockPrefix, Vec<PendingEntry>)> {
    if prefix.is_full() {
        return vec![(prefix.clone(), entries)];
    }
    let mut groups: BTreeMap<u8, Vec<PendingEntry>> = BTreeMap::new();
    for entry in entries {
        let next = entry.hash.as_bytes()[prefix.len()];
        groups.entry(next).or_default().push(entry);
    }

    let mut leaves = Vec::with_capacity(groups.len());
    for (next, group) in groups {
        let child = prefix.child(next);
        if child.is_full() || group.len() == 1 || fits(&group, config) {
            leaves.push((child, group));
        } else {
            leaves.extend(partition(&child, group, config));
        }
    }
    leaves
}

fn fits(group: &[PendingEntry], config: &BlockConfig) -> bool {
    let slots = config.headers_per_file.max(1);
    if group.len() > slots as usize {
        return false;
    }
    let payload: u64 = group.iter().map(|e| e.bytes.len() as u64).sum();
    FileHeader::new(slots).data_start() + payload <= config.max_block_size
}
