//! Bounded in-memory hash index.
//!
//! Each chunk kind has one [`HashIndex`]. While the number of stored hashes
//! fits within the capacity, the index is *complete* and answers every
//! membership query and listing on its own. Once an insert would exceed the
//! capacity, the index turns *partial*: new hashes are no longer cached, a
//! cache miss means "unknown" and the store consults the blocks, and listings
//! fall back to a block scan. The count is exact in both modes, so callers
//! never see a false negative.

use std::collections::BTreeSet;

use strata_types::ContentHash;

pub struct HashIndex {
    capacity: usize,
    cached: BTreeSet<ContentHash>,
    complete: bool,
    count: usize,
}

impl HashIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cached: BTreeSet::new(),
            complete: true,
            count: 0,
        }
    }

    /// Exact number of stored hashes.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether every stored hash is cached.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Record a newly stored hash.
    pub fn insert(&mut self, hash: ContentHash) {
        self.count += 1;
        if !self.complete {
            return;
        }
        if self.cached.len() < self.capacity {
            self.cached.insert(hash);
        } else {
            self.complete = false;
            tracing::info!(capacity = self.capacity, "hash index exceeded capacity; falling back to block lookups");
        }
    }

    /// Record a deleted hash.
    pub fn remove(&mut self, hash: &ContentHash) {
        self.count = self.count.saturating_sub(1);
        self.cached.remove(hash);
    }

    /// `Some(answer)` if the index knows, `None` if the blocks must be asked.
    pub fn contains(&self, hash: &ContentHash) -> Option<bool> {
        if self.cached.contains(hash) {
            Some(true)
        } else if self.complete {
            Some(false)
        } else {
            None
        }
    }

    /// A page of hashes in ascending order, or `None` if the index is partial.
    pub fn page(&self, offset: usize, limit: usize) -> Option<Vec<ContentHash>> {
        if !self.complete {
            return None;
        }
        Some(self.cached.iter().skip(offset).take(limit).copied().collect())
    }

    /// Replace the contents with a full scan result.
    pub fn rebuild(&mut self, hashes: impl IntoIterator<Item = ContentHash>) {
        self.cached.clear();
        self.count = 0;
        self.complete = true;
        for hash in hashes {
            self.count += 1;
            if self.cached.len() < self.capacity {
                self.cached.insert(hash);
            } else {
                self.complete = false;
            }
        }
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("capacity", &self.capacity)
            .field("cached", &self.cached.len())
            .field("complete", &self.complete)
            .field("count", &self.count)
            .finish()
    }
}
