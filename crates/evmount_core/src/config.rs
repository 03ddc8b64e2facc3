//! Tunables for the EWF cache tiers and the write-back store.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

pub const DEFAULT_MAX_TABLE_CACHE: u64 = 10 * MIB;
pub const DEFAULT_MAX_OPEN_SEGMENTS: usize = 10;
pub const DEFAULT_STATS_REFRESH_SECS: u64 = 10;
pub const DEFAULT_BLOCK_SIZE: u64 = MIB;
pub const DEFAULT_HASH_SIZE: u64 = MIB;

/// Budgets for the read path of an EWF container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// RAM allowed for decoded offset tables, in bytes.
    pub max_table_cache: u64,
    /// Upper bound on simultaneously open segment files.
    pub max_open_segments: usize,
    /// Base path of the statistics report; the process id is appended.
    pub stats_path: Option<PathBuf>,
    /// Minimum seconds between two statistics reports.
    pub stats_refresh: u64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_table_cache: DEFAULT_MAX_TABLE_CACHE,
            max_open_segments: DEFAULT_MAX_OPEN_SEGMENTS,
            stats_path: None,
            stats_refresh: DEFAULT_STATS_REFRESH_SECS,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_table_cache_mib(mut self, mib: u64) -> Self {
        self.max_table_cache = mib.saturating_mul(MIB);
        self
    }

    pub fn with_max_table_cache(mut self, bytes: u64) -> Self {
        self.max_table_cache = bytes;
        self
    }

    pub fn with_max_open_segments(mut self, count: usize) -> Self {
        self.max_open_segments = count;
        self
    }

    pub fn with_stats(mut self, path: impl Into<PathBuf>, refresh_secs: u64) -> Self {
        self.stats_path = Some(path.into());
        self.stats_refresh = refresh_secs;
        self
    }

    #[inline]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_refresh)
    }

    /// Parses a comma separated `key=value` list on top of the defaults.
    ///
    /// Recognised keys are `maxmem` (MiB), `maxfiles`, `stats` and `refresh`.
    pub fn parse_list(list: &str) -> Result<Self> {
        Self::default().merge_list(list)
    }

    /// Applies a comma separated `key=value` list to these options.
    pub fn merge_list(mut self, list: &str) -> Result<Self> {
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| CoreError::InvalidOption(format!("'{item}' is not key=value")))?;
            let value = value.trim();
            match key.trim() {
                "maxmem" => self.max_table_cache = parse_number(key, value)?.saturating_mul(MIB),
                "maxfiles" => self.max_open_segments = parse_number(key, value)? as usize,
                "stats" => self.stats_path = Some(PathBuf::from(value)),
                "refresh" => self.stats_refresh = parse_number(key, value)?,
                other => {
                    return Err(CoreError::InvalidOption(format!("unknown option '{other}'")));
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open_segments == 0 {
            return Err(CoreError::InvalidOption(
                "at least one segment must be allowed open".to_string(),
            ));
        }
        if self.max_table_cache == 0 {
            return Err(CoreError::InvalidOption(
                "table cache budget must be non-zero".to_string(),
            ));
        }
        if self.stats_path.is_some() && self.stats_refresh == 0 {
            return Err(CoreError::InvalidOption(
                "stats refresh interval must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| CoreError::InvalidOption(format!("{key}: '{value}' is not a number")))
}

/// Where and how the copy-on-write store is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCacheOptions {
    pub path: PathBuf,
    pub block_size: u64,
    /// Discard an existing store instead of resuming it.
    pub overwrite: bool,
    /// Number of leading image bytes hashed into the store identity.
    pub hash_size: u64,
}

impl WriteCacheOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_size: DEFAULT_BLOCK_SIZE,
            overwrite: false,
            hash_size: DEFAULT_HASH_SIZE,
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_hash_size(mut self, hash_size: u64) -> Self {
        self.hash_size = hash_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(CoreError::InvalidOption(
                "block size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
