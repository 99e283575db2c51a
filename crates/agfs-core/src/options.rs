//! Mount options and format parameters.
//!
//! Both load from JSON (or any serde format); missing fields take their
//! defaults.

use agfs_inode::{DEFAULT_SEARCH_DISTANCE, IallocPolicy};
use agfs_trans::TransConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Keep inode chunks whose inodes are all free.
    pub keep_empty_inode_chunks: bool,
    /// Neighbouring chunk records examined around a locality hint.
    pub inode_search_distance: u32,
    /// Capacity of the log grant head.
    pub log_size_bytes: u64,
    /// Keep encoded log records in memory for inspection.
    pub retain_log_records: bool,
    /// How long a reservation waits for log space before failing.
    pub log_wait_timeout_ms: u64,
    pub counter_shards: usize,
    pub counter_batch: i64,
    pub quota_enforcement: bool,
    pub buffer_cache_blocks: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            keep_empty_inode_chunks: false,
            inode_search_distance: DEFAULT_SEARCH_DISTANCE,
            log_size_bytes: 64 << 20,
            retain_log_records: false,
            log_wait_timeout_ms: 5_000,
            counter_shards: 8,
            counter_batch: 32,
            quota_enforcement: true,
            buffer_cache_blocks: 16_384,
        }
    }
}

impl MountOptions {
    #[must_use]
    pub fn trans_config(&self) -> TransConfig {
        TransConfig {
            log_wait: Duration::from_millis(self.log_wait_timeout_ms),
            counter_shards: self.counter_shards.max(1),
            counter_batch: self.counter_batch.max(1),
            quota_enforcement: self.quota_enforcement,
        }
    }

    #[must_use]
    pub fn ialloc_policy(&self) -> IallocPolicy {
        IallocPolicy {
            keep_empty_chunks: self.keep_empty_inode_chunks,
            search_distance: self.inode_search_distance,
        }
    }
}

/// Geometry of a volume about to be formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatParams {
    /// Must equal the device block size.
    pub block_size: u32,
    pub ag_blocks: u32,
    /// AG count; by default as many AGs as the device holds. A trailing AG
    /// too small to format is dropped.
    pub ag_count: Option<u32>,
    pub inode_size: u16,
    pub inode_cluster_size: u32,
    /// Align inode chunks to their own size, so inode numbers map to
    /// blocks without an inode tree lookup.
    pub align_inodes: bool,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            block_size: 4096,
            ag_blocks: 16_384,
            ag_count: None,
            inode_size: 512,
            inode_cluster_size: 8192,
            align_inodes: true,
        }
    }
}
