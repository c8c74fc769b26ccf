//! Discovering block files and pending artifacts under a storage directory.

use std::path::PathBuf;

use strata_block::{classify, is_set_aside, ArtifactKind, BlockPrefix, StorageDirectory};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Everything found under one directory's blocks root.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Live block files, shortest prefix first.
    pub blocks: Vec<BlockPrefix>,
    /// Backup and partial-copy files awaiting reconciliation.
    pub artifacts: Vec<PendingArtifact>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingArtifact {
    pub path: PathBuf,
    pub prefix: BlockPrefix,
    pub kind: ArtifactKind,
}

/// Walk the blocks root of `dir`. Files that are not blocks or artifacts are
/// logged and ignored.
pub fn scan_directory(dir: &StorageDirectory) -> ScanResult {
    let root = dir.blocks_root();
    let mut result = ScanResult::default();
    if !root.is_dir() {
        return result;
    }

    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, root = %root.display(), "failed to walk block tree");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&root) else {
            continue;
        };
        if is_set_aside(relative) {
            debug!(path = %entry.path().display(), "skipping file set aside as unreadable");
            continue;
        }
        match classify(relative) {
            Some(name) => match name.artifact {
                None => result.blocks.push(name.prefix),
                Some(kind) => result.artifacts.push(PendingArtifact {
                    path: entry.path().to_path_buf(),
                    prefix: name.prefix,
                    kind,
                }),
            },
            None => warn!(path = %entry.path().display(), "ignoring unrecognised file in block tree"),
        }
    }

    result.blocks.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    result.artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(
        dir = %dir.path().display(),
        blocks = result.blocks.len(),
        artifacts = result.artifacts.len(),
        "directory scanned"
    );
    result
}
