use serde::{Deserialize, Serialize};

/// Default upper bound on a block file's occupied size (64 MiB).
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of header slots in a new block file.
pub const DEFAULT_HEADERS_PER_FILE: u32 = 1000;

/// Limits that decide when a block must split.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Maximum occupied size (header region plus written payload) of a block file.
    pub max_block_size: u64,
    /// Header slots allocated in each newly created block file.
    pub headers_per_file: u32,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            headers_per_file: DEFAULT_HEADERS_PER_FILE,
        }
    }
}
