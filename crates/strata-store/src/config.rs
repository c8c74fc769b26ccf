use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_block::{BlockConfig, StorageDirectory};

use crate::error::{StoreError, StoreResult};

/// Default maximum size of a data chunk (1 MiB).
pub const DEFAULT_MAX_DATA_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default maximum size of a meta-data chunk (64 MiB).
pub const DEFAULT_MAX_META_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of hashes per kind held in memory.
pub const DEFAULT_INDEX_CAPACITY: usize = 1_000_000;

/// File names of the deletion logs inside `log_dir`.
pub const DATA_LOG_NAME: &str = "deleted-data.log";
pub const META_LOG_NAME: &str = "deleted-meta.log";

/// Chunk store configuration.
///
/// ```toml
/// log_deleted_data = true
/// log_dir = "/var/lib/strata/logs"
///
/// [[directories]]
/// path = "/mnt/disk1/strata"
/// size_limit = 500000000000
///
/// [block]
/// max_block_size = 67108864
///
/// [balance]
/// fill_threshold = 0.85
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub directories: Vec<DirectoryConfig>,
    pub block: BlockConfig,
    pub max_data_chunk_size: u64,
    pub max_meta_chunk_size: u64,
    pub log_deleted_data: bool,
    pub log_deleted_meta: bool,
    pub log_dir: Option<PathBuf>,
    pub index_capacity: usize,
    pub balance: BalanceConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            block: BlockConfig::default(),
            max_data_chunk_size: DEFAULT_MAX_DATA_CHUNK_SIZE,
            max_meta_chunk_size: DEFAULT_MAX_META_CHUNK_SIZE,
            log_deleted_data: false,
            log_deleted_meta: false,
            log_dir: None,
            index_capacity: DEFAULT_INDEX_CAPACITY,
            balance: BalanceConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_toml_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Check settings that serde cannot express.
    pub fn validate(&self) -> StoreResult<()> {
        if (self.log_deleted_data || self.log_deleted_meta) && self.log_dir.is_none() {
            return Err(StoreError::Config(
                "deletion logging is enabled but log_dir is not set".into(),
            ));
        }
        if self.block.headers_per_file == 0 {
            return Err(StoreError::Config("block.headers_per_file must be positive".into()));
        }
        if self.block.max_block_size == 0 {
            return Err(StoreError::Config("block.max_block_size must be positive".into()));
        }
        self.balance.validate()
    }

    /// Path of the deletion log for data chunks, if enabled.
    pub fn data_log_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .filter(|_| self.log_deleted_data)
            .map(|dir| dir.join(DATA_LOG_NAME))
    }

    /// Path of the deletion log for meta-data chunks, if enabled.
    pub fn meta_log_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .filter(|_| self.log_deleted_meta)
            .map(|dir| dir.join(META_LOG_NAME))
    }
}

/// One configured storage directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    /// Byte limit; absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<u64>,
}

impl DirectoryConfig {
    pub fn unbounded(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size_limit: None,
        }
    }

    pub fn bounded(path: impl Into<PathBuf>, size_limit: u64) -> Self {
        Self {
            path: path.into(),
            size_limit: Some(size_limit),
        }
    }

    pub fn to_directory(&self) -> StorageDirectory {
        match self.size_limit {
            Some(limit) => StorageDirectory::new(&self.path, limit),
            None => StorageDirectory::unbounded(&self.path),
        }
    }
}

/// Thresholds for moving blocks between directories.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    /// Fill fraction the fullest directory must exceed.
    pub fill_threshold: f64,
    /// Minimum fill-fraction gap between fullest and emptiest directory.
    pub min_gap: f64,
    /// Maximum blocks moved per call.
    pub batch_size: usize,
    /// Blocks smaller than this are not worth moving.
    pub min_block_bytes: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            fill_threshold: 0.9,
            min_gap: 0.1,
            batch_size: 32,
            min_block_bytes: 1024 * 1024,
        }
    }
}

impl BalanceConfig {
    fn validate(&self) -> StoreResult<()> {
        if !(0.0..=1.0).contains(&self.fill_threshold) {
            return Err(StoreError::Config(format!(
                "balance.fill_threshold {} is outside 0..=1",
                self.fill_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_gap) {
            return Err(StoreError::Config(format!(
                "balance.min_gap {} is outside 0..=1",
                self.min_gap
            )));
        }
        Ok(())
    }
}
