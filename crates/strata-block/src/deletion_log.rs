//! Append-only log of deleted chunks, one file per chunk kind.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use strata_types::{ChunkKind, ContentHash};
use tracing::debug;

use crate::error::BlockResult;

/// Append-only record of deleted chunks.
///
/// One line per deletion:
///
/// ```text
/// <RFC 3339 timestamp>,<kind>,<reason>,<hash hex>
/// ```
///
/// The hash is always the final comma-separated field so replay tooling can
/// extract it without parsing the rest of the line.
pub struct DeletionLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl DeletionLog {
    /// Open (or create) the log file at `path` for appending.
    pub fn open(path: &Path) -> BlockResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Record one deletion and flush it to the file.
    pub fn append(&self, kind: ChunkKind, hash: &ContentHash, reason: &str) -> BlockResult<()> {
        let line = format!(
            "{},{},{},{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind,
            sanitize(reason),
            hash.to_hex()
        );
        let mut w = self.writer.lock().expect("deletion log lock poisoned");
        w.write_all(line.as_bytes())?;
        w.flush()?;
        debug!(%hash, %kind, "deletion logged");
        Ok(())
    }

    /// Flush buffered lines and sync the file.
    pub fn flush(&self) -> BlockResult<()> {
        let mut w = self.writer.lock().expect("deletion log lock poisoned");
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extract the trailing hash field of every line in a log file.
    ///
    /// Lines whose last field does not parse as a hash are skipped.
    pub fn read_hashes(path: &Path) -> BlockResult<Vec<ContentHash>> {
        let reader = BufReader::new(File::open(path)?);
        let mut hashes = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(hash) = line.rsplit(',').next().and_then(|f| f.parse().ok()) {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }
}

fn sanitize(reason: &str) -> String {
    reason
        .chars()
        .map(|c| if c == ',' || c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}
