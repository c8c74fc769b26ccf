//! Moving a whole block to another storage directory.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::block::{Block, BlockState, BlockWriter};
use crate::directory::StorageDirectory;
use crate::error::{BlockError, BlockResult};
use crate::path::{artifact_path, ArtifactKind};

impl BlockWriter<'_> {
    /// Move this block's file into `dest`.
    ///
    /// Returns `Ok(false)` without changing anything if `dest` is the current
    /// directory, lacks room for the block, or cannot be created. Returns an
    /// error if a path component under `dest` exists as a regular file, if
    /// `dest` already holds a file for this block, or if copying fails.
    ///
    /// The copy is written to `<name>.blk.moving` and renamed into place, and
    /// the accounting transfer and directory switch happen under this
    /// block's write lock, so readers see the block in exactly one directory.
    pub fn move_to(&mut self, dest: &Arc<StorageDirectory>) -> BlockResult<bool> {
        let prefix = self.block.prefix().clone();
        if **dest == *self.inner.directory {
            return Ok(false);
        }
        let bytes = self.inner.accounted();
        if !dest.has_room(bytes) {
            debug!(%prefix, dest = %dest.path().display(), bytes, "destination lacks room");
            return Ok(false);
        }

        let target = prefix.block_path(dest);
        check_no_file_in_path(dest.path(), &target)?;
        if target.exists() {
            return Err(BlockError::DirectoryUnavailable {
                path: target,
                reason: "block file already exists at destination".into(),
            });
        }
        if let Err(e) = dest.create_if_missing() {
            warn!(%prefix, dest = %dest.path().display(), error = %e, "cannot create destination");
            return Ok(false);
        }

        if self.inner.state == BlockState::Active {
            let moving = artifact_path(&target, ArtifactKind::Moving);
            if let Err(e) = copy_durably(&self.inner.path, &moving, &target) {
                if let Err(cleanup) = fs::remove_file(&moving) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(path = %moving.display(), error = %cleanup, "could not remove partial copy");
                    }
                }
                return Err(e.into());
            }
        }

        let source = self.inner.directory.clone();
        StorageDirectory::transfer(&source, dest, bytes);
        let old_path = std::mem::replace(&mut self.inner.path, target);
        self.inner.directory = dest.clone();

        if self.inner.state == BlockState::Active {
            if let Err(e) = fs::remove_file(&old_path) {
                warn!(path = %old_path.display(), error = %e, "could not remove moved block's old file");
            }
        }
        info!(
            %prefix,
            from = %source.path().display(),
            to = %dest.path().display(),
            bytes,
            "block moved"
        );
        Ok(true)
    }
}

impl Block {
    /// Take the write lock and move. See [`BlockWriter::move_to`].
    pub fn move_to(&self, dest: &Arc<StorageDirectory>) -> BlockResult<bool> {
        self.write()?.move_to(dest)
    }
}

fn copy_durably(from: &Path, moving: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, moving)?;
    File::open(moving)?.sync_all()?;
    fs::rename(moving, target)
}

/// Fail if `root` or any directory between it and `target` is a regular file.
fn check_no_file_in_path(root: &Path, target: &Path) -> BlockResult<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    for dir in parent.ancestors() {
        if dir.exists() && !dir.is_dir() {
            return Err(BlockError::DirectoryUnavailable {
                path: dir.to_path_buf(),
                reason: "exists and is not a directory".into(),
            });
        }
        if dir == root {
            break;
        }
    }
    Ok(())
}
