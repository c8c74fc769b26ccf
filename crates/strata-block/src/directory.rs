//! Storage directories and their byte accounting.
//!
//! A directory's used bytes are the sum of its blocks' accounted bytes. The
//! counter is rebuilt from the blocks at registration, never from file sizes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::{BlockError, BlockResult};
use crate::path::BLOCKS_DIR;

/// Size limit meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

/// One capacity-bounded filesystem root.
///
/// `used_bytes` only changes through [`StorageDirectory::adjust_used`] and
/// [`StorageDirectory::transfer`]; it is never re-derived from disk. Two
/// directories are equal when their normalized paths are equal, regardless
/// of limits or usage.
pub struct StorageDirectory {
    path: PathBuf,
    size_limit: u64,
    used: Mutex<u64>,
}

impl StorageDirectory {
    /// Create a directory handle. Trailing separators are stripped from `path`.
    pub fn new(path: impl AsRef<Path>, size_limit: u64) -> Self {
        Self {
            path: normalize(path.as_ref()),
            size_limit,
            used: Mutex::new(0),
        }
    }

    /// Create a directory handle with no size limit.
    pub fn unbounded(path: impl AsRef<Path>) -> Self {
        Self::new(path, UNBOUNDED)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root of the block tree inside this directory.
    pub fn blocks_root(&self) -> PathBuf {
        self.path.join(BLOCKS_DIR)
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    pub fn is_unbounded(&self) -> bool {
        self.size_limit == UNBOUNDED
    }

    pub fn used_bytes(&self) -> u64 {
        *self.lock_used()
    }

    /// Apply a signed change to the used-byte counter. Performs no I/O.
    pub fn adjust_used(&self, delta: i64) {
        let mut used = self.lock_used();
        *used = apply(*used, delta);
    }

    /// Returns `true` if `additional` bytes fit under the size limit.
    pub fn has_room(&self, additional: u64) -> bool {
        if self.is_unbounded() {
            return true;
        }
        self.used_bytes()
            .checked_add(additional)
            .is_some_and(|total| total <= self.size_limit)
    }

    /// Used bytes as a fraction of the limit. Unbounded directories report 0.
    pub fn fill_fraction(&self) -> f64 {
        if self.is_unbounded() {
            return 0.0;
        }
        if self.size_limit == 0 {
            return 1.0;
        }
        self.used_bytes() as f64 / self.size_limit as f64
    }

    /// Create the directory on disk if it does not exist yet.
    pub fn create_if_missing(&self) -> BlockResult<()> {
        if self.path.exists() && !self.path.is_dir() {
            return Err(BlockError::DirectoryUnavailable {
                path: self.path.clone(),
                reason: "exists and is not a directory".into(),
            });
        }
        std::fs::create_dir_all(self.blocks_root()).map_err(|e| {
            BlockError::DirectoryUnavailable {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    /// Move `bytes` of accounting from `from` to `to` in one step.
    ///
    /// Both counters are locked (in path order) for the duration of the
    /// update, so no observer sees the bytes counted twice or not at all.
    pub fn transfer(from: &StorageDirectory, to: &StorageDirectory, bytes: u64) {
        if from == to {
            return;
        }
        let delta = i64::try_from(bytes).unwrap_or(i64::MAX);
        let (mut from_used, mut to_used) = if from.path < to.path {
            let a = from.lock_used();
            let b = to.lock_used();
            (a, b)
        } else {
            let b = to.lock_used();
            let a = from.lock_used();
            (a, b)
        };
        *from_used = apply(*from_used, -delta);
        *to_used = apply(*to_used, delta);
        debug!(
            from = %from.path.display(),
            to = %to.path.display(),
            bytes,
            "accounting transferred"
        );
    }

    fn lock_used(&self) -> MutexGuard<'_, u64> {
        self.used.lock().expect("accounting lock poisoned")
    }
}

impl Clone for StorageDirectory {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            size_limit: self.size_limit,
            used: Mutex::new(self.used_bytes()),
        }
    }
}

impl PartialEq for StorageDirectory {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for StorageDirectory {}

impl Hash for StorageDirectory {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl fmt::Debug for StorageDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDirectory")
            .field("path", &self.path)
            .field("size_limit", &self.size_limit)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

fn apply(used: u64, delta: i64) -> u64 {
    if delta >= 0 {
        used.saturating_add(delta as u64)
    } else {
        used.saturating_sub(delta.unsigned_abs())
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}
