#![forbid(unsafe_code)]
//! A mounted agfs volume.
//!
//! [`format`] lays down a fresh volume on a block device; [`Filesystem::mount`]
//! opens it and [`Filesystem::unmount`] writes the summary counters back to
//! the primary superblock.
//!
//! Every operation runs in its own transaction: it takes the AG locks it
//! needs in ascending order, reserves log space, blocks and quota up front,
//! and either commits or cancels as a whole. Corruption found while
//! modifying metadata, or a failed log write, shuts the filesystem down;
//! after that every operation fails with [`AgfsError::Shutdown`].
//!
//! | Operation | Reservation |
//! |-----------|-------------|
//! | [`Filesystem::alloc_extent`] | write, `max_len` blocks |
//! | [`Filesystem::free_extent`] | write |
//! | [`Filesystem::free_extents`] | truncate, rolled every few extents |
//! | [`Filesystem::create_inode`] | create, one chunk plus inode tree splits |
//! | [`Filesystem::remove_inode`] | remove |
//! | [`Filesystem::chown`] | chown |
//! | [`Filesystem::unmount`] | superblock |

pub mod format;
pub mod inode;
pub mod options;
pub mod scrub;
pub mod space;

pub use agfs_alloc::{AllocArgs, AllocTarget};
pub use agfs_error::{AgfsError, Result};
pub use agfs_inode::{Freed, InodeLocation};
pub use agfs_ondisk::{DinodeCore, Superblock};
pub use agfs_trans::quota::Dquot;
pub use agfs_trans::{DquotId, Owner, QuotaLimits, QuotaResource, SbField, TransStats};
pub use agfs_types::{AgNumber, BlockNumber, InodeNumber};
pub use format::format;
pub use options::{FormatParams, MountOptions};
pub use scrub::{AgReport, VerifyReport};
pub use space::BlockExtent;

use agfs_alloc::{AgLockSet, PeragTable};
use agfs_block::{BlockDevice, BufCache, corrupt_at};
use agfs_inode::IallocPolicy;
use agfs_ondisk::Geometry;
use agfs_trans::{Log, MemLog, SbCounterSnapshot, TransManager, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Point-in-time space and inode usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    /// Free blocks ordinary allocations may still reserve.
    pub available_blocks: u64,
    pub inodes: u64,
    pub free_inodes: u64,
    pub ag_count: u32,
}

pub struct Filesystem {
    sb: Superblock,
    options: MountOptions,
    policy: IallocPolicy,
    mgr: Arc<TransManager>,
    log: Arc<MemLog>,
    perag: PeragTable,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("ag_count", &self.sb.ag_count)
            .field("data_blocks", &self.sb.data_blocks)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    // ── Mount lifecycle ─────────────────────────────────────────────────

    /// Open the volume on `dev`. The primary superblock must parse,
    /// validate and describe a volume that fits on the device.
    pub fn mount(dev: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        let block0 = dev.read_block(BlockNumber(0))?;
        let sb = Superblock::parse_from_bytes(block0.as_slice())
            .map_err(|err| AgfsError::Format(format!("primary superblock: {err}")))?;
        let geo = Geometry::from_superblock(&sb)
            .map_err(|err| AgfsError::Format(format!("primary superblock: {err}")))?;
        if dev.block_size() != sb.block_size {
            return Err(AgfsError::InvalidGeometry(format!(
                "device block size {} but volume block size {}",
                dev.block_size(),
                sb.block_size
            )));
        }
        if dev.block_count() < sb.data_blocks {
            return Err(AgfsError::InvalidGeometry(format!(
                "device holds {} blocks but volume needs {}",
                dev.block_count(),
                sb.data_blocks
            )));
        }

        let log = if options.retain_log_records {
            MemLog::new(options.log_size_bytes)
        } else {
            MemLog::new(options.log_size_bytes).without_retention()
        };
        let log = Arc::new(log);
        let bufs = Arc::new(BufCache::new(dev, options.buffer_cache_blocks.max(64)));
        let mgr = Arc::new(TransManager::new(
            geo,
            SbCounterSnapshot {
                dblocks: sb.data_blocks,
                icount: sb.icount,
                ifree: sb.ifree,
                fdblocks: sb.fdblocks,
                frextents: sb.frextents,
            },
            Arc::clone(&log) as Arc<dyn Log>,
            bufs,
            options.trans_config(),
        ));
        info!(
            ag_count = sb.ag_count,
            ag_blocks = sb.ag_blocks,
            data_blocks = sb.data_blocks,
            fdblocks = sb.fdblocks,
            icount = sb.icount,
            ifree = sb.ifree,
            "fs_mounted"
        );
        Ok(Self {
            perag: PeragTable::new(sb.ag_count),
            policy: options.ialloc_policy(),
            sb,
            options,
            mgr,
            log,
        })
    }

    /// Write the counters back to the primary superblock and flush. A
    /// filesystem that was shut down is left as it is on disk.
    pub fn unmount(self) -> Result<()> {
        if let Some(reason) = self.mgr.shutdown_reason() {
            warn!(reason = %reason, "fs_unmount_after_shutdown");
            return Err(AgfsError::Shutdown);
        }
        let counters = self.mgr.counters().snapshot();
        let mut tp = self.mgr.alloc()?;
        tp.reserve(&self.mgr.resv().sb, 0, 0)?;
        let result = write_counters(&mut tp, &counters);
        finish(tp, result)?;
        self.mgr.bufs().sync()?;
        info!(
            fdblocks = counters.fdblocks,
            icount = counters.icount,
            ifree = counters.ifree,
            "fs_unmounted"
        );
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Superblock as read at mount; counters are those of mount time.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        self.mgr.geometry()
    }

    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    #[must_use]
    pub fn stats(&self) -> TransStats {
        self.mgr.stats()
    }

    /// The in-memory log, e.g. to inspect records or inject write failures.
    #[must_use]
    pub fn log(&self) -> &Arc<MemLog> {
        &self.log
    }

    #[must_use]
    pub fn counter(&self, field: SbField) -> u64 {
        self.mgr.counters().get(field)
    }

    #[must_use]
    pub fn statfs(&self) -> StatFs {
        let counters = self.mgr.counters().snapshot();
        StatFs {
            block_size: self.sb.block_size,
            total_blocks: counters.dblocks,
            free_blocks: counters.fdblocks,
            available_blocks: self.mgr.blocks_available(),
            inodes: counters.icount,
            free_inodes: counters.ifree,
            ag_count: self.sb.ag_count,
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.mgr.is_shutdown()
    }

    #[must_use]
    pub fn shutdown_reason(&self) -> Option<String> {
        self.mgr.shutdown_reason()
    }

    pub fn force_shutdown(&self, reason: &str) {
        self.mgr.force_shutdown(reason);
    }

    // ── Quota ───────────────────────────────────────────────────────────

    pub fn set_quota_limits(&self, id: DquotId, limits: QuotaLimits) {
        self.mgr.quota().set_limits(id, limits);
    }

    #[must_use]
    pub fn quota(&self, id: DquotId) -> Dquot {
        self.mgr.quota().get(id)
    }

    #[must_use]
    pub fn quotas(&self) -> Vec<Dquot> {
        self.mgr.quota().list()
    }

    // ── Shared helpers ──────────────────────────────────────────────────

    /// A fresh AG lock set and transaction. The transaction is bound
    /// second so it is finished before the locks are released.
    pub(crate) fn begin(&self) -> Result<(AgLockSet<'_>, Transaction)> {
        let locks = self.perag.lock_set();
        let tp = self.mgr.alloc()?;
        Ok((locks, tp))
    }

    pub(crate) fn manager(&self) -> &Arc<TransManager> {
        &self.mgr
    }

    pub(crate) fn policy(&self) -> &IallocPolicy {
        &self.policy
    }
}

/// Commit on success, cancel on failure. Corruption shuts the filesystem
/// down on the way out.
pub(crate) fn finish<T>(tp: Transaction, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tp.commit()?;
            Ok(value)
        }
        Err(err) => {
            if err.is_corruption() {
                error!(error = %err, "fs_corruption_detected");
            }
            Err(tp.cancel_with(err))
        }
    }
}

fn write_counters(tp: &mut Transaction, counters: &SbCounterSnapshot) -> Result<()> {
    let block = BlockNumber(0);
    let mut sb = Superblock::parse_from_bytes(tp.read_buf(block)?).map_err(corrupt_at(block))?;
    sb.icount = counters.icount;
    sb.ifree = counters.ifree;
    sb.fdblocks = counters.fdblocks;
    sb.frextents = counters.frextents;
    sb.encode(tp.buf_mut(block)?);
    Ok(())
}
