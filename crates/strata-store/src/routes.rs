//! Prefix routing table.
//!
//! Maps every live block prefix, across all directories, to its block. The
//! key set is kept prefix-free, which makes the covering block of a hash the
//! greatest key not above the full hash.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_block::{Block, BlockPrefix};
use strata_types::ContentHash;

#[derive(Default)]
pub struct RoutingTable {
    blocks: BTreeMap<BlockPrefix, Arc<Block>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The block responsible for `hash`, if any.
    pub fn covering(&self, hash: &ContentHash) -> Option<Arc<Block>> {
        let full = BlockPrefix::of(hash, ContentHash::LEN);
        self.blocks
            .range(..=full)
            .next_back()
            .filter(|(prefix, _)| prefix.covers(hash))
            .map(|(_, block)| block.clone())
    }

    /// Whether some routed prefix equals or extends `prefix`.
    pub fn occupied(&self, prefix: &BlockPrefix) -> bool {
        self.blocks
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.as_bytes().starts_with(prefix.as_bytes()))
    }

    /// Whether `prefix` can be added without breaking the prefix-free property.
    pub fn conflicts(&self, prefix: &BlockPrefix) -> bool {
        if self.occupied(prefix) {
            return true;
        }
        (1..prefix.len()).any(|len| {
            BlockPrefix::from_bytes(&prefix.as_bytes()[..len])
                .is_some_and(|ancestor| self.blocks.contains_key(&ancestor))
        })
    }

    /// Shortest unoccupied prefix of `hash`, for a hash with no covering block.
    pub fn vacant(&self, hash: &ContentHash) -> BlockPrefix {
        BlockPrefix::vacant(hash, 1, |candidate| self.occupied(candidate))
    }

    pub fn get(&self, prefix: &BlockPrefix) -> Option<Arc<Block>> {
        self.blocks.get(prefix).cloned()
    }

    pub fn insert(&mut self, block: Arc<Block>) {
        self.blocks.insert(block.prefix().clone(), block);
    }

    pub fn remove(&mut self, prefix: &BlockPrefix) -> Option<Arc<Block>> {
        self.blocks.remove(prefix)
    }

    /// Swap a split block for its children.
    pub fn replace(&mut self, parent: &BlockPrefix, children: &[Arc<Block>]) {
        self.blocks.remove(parent);
        for child in children {
            self.insert(child.clone());
        }
    }

    /// Snapshot of every routed block, in prefix order.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.blocks.values().cloned().collect()
    }
}
