//! Moving blocks from the fullest directory to the emptiest one.

use std::sync::Arc;

use strata_block::{Block, BlockError, StorageDirectory};
use tracing::{debug, info};

use crate::config::BalanceConfig;
use crate::error::StoreResult;
use crate::store::ChunkStore;

impl ChunkStore {
    /// Move whole blocks out of the fullest directory while it is above
    /// `thresholds.fill_threshold` and at least `thresholds.min_gap` fuller
    /// than the emptiest directory.
    ///
    /// Returns `true` if any block moved. Chunks stay readable throughout;
    /// a reader waits on the moving block's lock and then reads from its
    /// new location. A picked block that splits before it can be moved is
    /// passed over and another is picked.
    pub fn balance(&self, thresholds: &BalanceConfig) -> StoreResult<bool> {
        let _maintenance = self.maintenance.lock().expect("maintenance lock poisoned");
        let directories = self.directories();
        if directories.len() < 2 {
            return Ok(false);
        }

        let mut moved = 0usize;
        while moved < thresholds.batch_size {
            let Some((fullest, emptiest)) = extremes(&directories) else {
                break;
            };
            let gap = fullest.fill_fraction() - emptiest.fill_fraction();
            if fullest.fill_fraction() <= thresholds.fill_threshold || gap <= thresholds.min_gap {
                break;
            }

            let Some(block) = self.pick_block(&fullest, &emptiest, thresholds.min_block_bytes) else {
                debug!(dir = %fullest.path().display(), "no movable block");
                break;
            };
            match block.move_to(&emptiest) {
                Ok(true) => moved += 1,
                Ok(false) => break,
                Err(BlockError::Retired(prefix)) => {
                    debug!(%prefix, "picked block retired before the move");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if moved > 0 {
            info!(moved, "directories balanced");
        }
        Ok(moved > 0)
    }

    /// The largest block in `from` that fits in `to` without leaving `to`
    /// fuller than `from`.
    fn pick_block(&self, from: &StorageDirectory, to: &StorageDirectory, min_bytes: u64) -> Option<Arc<Block>> {
        let blocks = self.read_routes().blocks();
        let mut candidates: Vec<(u64, Arc<Block>)> = blocks
            .into_iter()
            .filter(|block| *block.directory() == *from)
            .filter_map(|block| {
                let size = block.read().ok()?.accounted_bytes();
                (size >= min_bytes.max(1)).then_some((size, block))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        candidates
            .into_iter()
            .find(|(size, _)| to.has_room(*size) && fill_after(from, -(*size as f64)) >= fill_after(to, *size as f64))
            .map(|(_, block)| block)
    }
}

fn extremes(directories: &[Arc<StorageDirectory>]) -> Option<(Arc<StorageDirectory>, Arc<StorageDirectory>)> {
    let fullest = directories
        .iter()
        .max_by(|a, b| a.fill_fraction().total_cmp(&b.fill_fraction()))?;
    let emptiest = directories
        .iter()
        .min_by(|a, b| a.fill_fraction().total_cmp(&b.fill_fraction()))?;
    Some((fullest.clone(), emptiest.clone()))
}

fn fill_after(dir: &StorageDirectory, delta: f64) -> f64 {
    if dir.is_unbounded() {
        return 0.0;
    }
    (dir.used_bytes() as f64 + delta) / dir.size_limit().max(1) as f64
}
