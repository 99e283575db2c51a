//! Block extents on behalf of an inode (or of nobody).
//!
//! Blocks charged to an inode are counted in its `nblocks` and against the
//! block quota of its owner; both move in the same transaction as the free
//! space trees.

use crate::{Filesystem, finish};
use agfs_alloc::{AgLockSet, AllocArgs, alloc_vextent, free_extent};
use agfs_error::{AgfsError, Result};
use agfs_inode::{InodeLocation, imap_untrusted, read_dinode, write_dinode};
use agfs_ondisk::{DinodeCore, PREALLOC_BLOCKS};
use agfs_trans::resv::{FREE_EXTENTS_PER_ROLL, write_block_res};
use agfs_trans::{Owner, QuotaResource, Transaction};
use agfs_types::{AgNumber, BlockNumber, InodeNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockExtent {
    pub start: BlockNumber,
    pub len: u32,
}

impl BlockExtent {
    #[must_use]
    pub fn new(start: BlockNumber, len: u32) -> Self {
        Self { start, len }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.0 + u64::from(self.len)
    }
}

/// Inode whose block count moves with an extent.
struct Charged {
    loc: InodeLocation,
    core: DinodeCore,
}

impl Charged {
    fn owner(&self) -> Owner {
        Owner {
            uid: self.core.uid,
            gid: self.core.gid,
            projid: self.core.projid,
        }
    }
}

impl Filesystem {
    /// Lock the AG of `ino`, the first AG lock of the transaction.
    pub(crate) fn lock_ino(&self, locks: &mut AgLockSet<'_>, ino: InodeNumber) -> Result<()> {
        let (agno, _) = self.geometry().ino_to_ag(ino).ok_or_else(|| {
            AgfsError::InvalidArgument(format!("inode {} outside the volume", ino.0))
        })?;
        if !locks.lock(agno)? {
            return Err(AgfsError::Busy(format!("allocation group {} is locked", agno.0)));
        }
        Ok(())
    }

    /// Lock the AG of `ino` and read its slot, in use or not.
    pub(crate) fn locate_slot(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        ino: InodeNumber,
    ) -> Result<(InodeLocation, DinodeCore)> {
        self.lock_ino(locks, ino)?;
        let loc = imap_untrusted(tp, ino)?;
        let core = read_dinode(tp, &loc)?;
        Ok((loc, core))
    }

    /// As [`Self::locate_slot`], for an inode that must be in use.
    pub(crate) fn locate(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        ino: InodeNumber,
    ) -> Result<(InodeLocation, DinodeCore)> {
        let (loc, core) = self.locate_slot(tp, locks, ino)?;
        if core.is_unused() {
            return Err(AgfsError::NotFound(format!("inode {} is not in use", ino.0)));
        }
        Ok((loc, core))
    }

    fn charged(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        ino: Option<InodeNumber>,
    ) -> Result<Option<Charged>> {
        let Some(ino) = ino else {
            return Ok(None);
        };
        let (loc, core) = self.locate(tp, locks, ino)?;
        Ok(Some(Charged { loc, core }))
    }

    /// Check that `ext` lies in one AG and clear of the AG headers.
    fn check_extent(&self, ext: &BlockExtent) -> Result<AgNumber> {
        let geo = self.geometry();
        if ext.len == 0 {
            return Err(AgfsError::InvalidArgument("zero-length extent".to_owned()));
        }
        let (agno, agbno) = geo.fsb_to_ag(ext.start).ok_or_else(|| {
            AgfsError::InvalidArgument(format!("block {} outside the volume", ext.start.0))
        })?;
        if agbno.0 < PREALLOC_BLOCKS {
            return Err(AgfsError::InvalidArgument(format!(
                "extent {}+{} overlaps the headers of AG {}",
                ext.start.0, ext.len, agno.0
            )));
        }
        if u64::from(agbno.0) + u64::from(ext.len) > u64::from(geo.ag_blocks_of(agno)) {
            return Err(AgfsError::InvalidArgument(format!(
                "extent {}+{} crosses the end of AG {}",
                ext.start.0, ext.len, agno.0
            )));
        }
        Ok(agno)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate between `args.min_len` and `args.max_len` blocks, charged
    /// to `ino` when given. Fails with `NoSpace` when no AG the target
    /// allows has a fitting extent.
    pub fn alloc_extent(&self, args: &AllocArgs, ino: Option<InodeNumber>) -> Result<BlockExtent> {
        if args.min_len == 0 || args.min_len > args.max_len {
            return Err(AgfsError::InvalidArgument(format!(
                "allocation of {}..={} blocks",
                args.min_len, args.max_len
            )));
        }
        let (mut locks, mut tp) = self.begin()?;
        tp.reserve(&self.manager().resv().write, write_block_res(args.max_len), 0)?;
        let result = self.alloc_in(&mut tp, &mut locks, args, ino);
        finish(tp, result)
    }

    fn alloc_in(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        args: &AllocArgs,
        ino: Option<InodeNumber>,
    ) -> Result<BlockExtent> {
        let mut charged = self.charged(tp, locks, ino)?;
        if let Some(c) = &charged {
            tp.reserve_quota(&c.owner(), u64::from(args.max_len), 0)?;
        }
        let geo = *tp.geometry();
        let Some(ext) = alloc_vextent(tp, locks, args)? else {
            return Err(AgfsError::NoSpace);
        };
        let extent = BlockExtent::new(ext.fsb(&geo), ext.len);
        if let Some(c) = charged.as_mut() {
            c.core.nblocks += u64::from(ext.len);
            write_dinode(tp, &c.loc, &c.core)?;
            tp.mod_owner_quota(&c.owner(), QuotaResource::Blocks, i64::from(ext.len))?;
        }
        debug!(start = extent.start.0, len = extent.len, ino = ?ino, "fs_extent_allocated");
        Ok(extent)
    }

    // ── Freeing ─────────────────────────────────────────────────────────

    /// Return `ext` to free space, uncharging `ino` when given.
    pub fn free_extent(&self, ext: BlockExtent, ino: Option<InodeNumber>) -> Result<()> {
        let agno = self.check_extent(&ext)?;
        let (mut locks, mut tp) = self.begin()?;
        tp.reserve(&self.manager().resv().write, 0, 0)?;
        let result = self.free_batch(&mut tp, &mut locks, &[ext], &[agno], ino);
        finish(tp, result)
    }

    /// Free many extents in block order, rolling the transaction every
    /// few extents so the log reservation stays bounded. Each roll commits
    /// the extents freed so far: a failure part way leaves the earlier
    /// batches freed.
    pub fn free_extents(&self, extents: &[BlockExtent], ino: Option<InodeNumber>) -> Result<()> {
        let mut sorted = extents.to_vec();
        sorted.sort_unstable();
        let agnos = sorted
            .iter()
            .map(|ext| self.check_extent(ext))
            .collect::<Result<Vec<_>>>()?;
        for pair in sorted.windows(2) {
            if pair[0].end() > pair[1].start.0 {
                return Err(AgfsError::InvalidArgument(format!(
                    "extents at {} and {} overlap",
                    pair[0].start.0, pair[1].start.0
                )));
            }
        }
        if sorted.is_empty() {
            return Ok(());
        }

        let mut tp = self.manager().alloc()?;
        tp.reserve(&self.manager().resv().truncate, 0, 0)?;
        let batches = sorted
            .chunks(FREE_EXTENTS_PER_ROLL)
            .zip(agnos.chunks(FREE_EXTENTS_PER_ROLL));
        let count = sorted.len().div_ceil(FREE_EXTENTS_PER_ROLL);
        for (i, (batch, batch_agnos)) in batches.enumerate() {
            let mut locks = self.perag.lock_set();
            if let Err(err) = self.free_batch(&mut tp, &mut locks, batch, batch_agnos, ino) {
                return Err(tp.cancel_with(err));
            }
            if i + 1 == count {
                tp.commit()?;
                break;
            }
            if let Err(err) = tp.roll() {
                return Err(tp.cancel_with(err));
            }
        }
        info!(extents = sorted.len(), rolls = count - 1, ino = ?ino, "fs_extents_freed");
        Ok(())
    }

    /// Free `batch` under one set of AG locks, taken in ascending order
    /// together with the inode's AG.
    fn free_batch(
        &self,
        tp: &mut Transaction,
        locks: &mut AgLockSet<'_>,
        batch: &[BlockExtent],
        agnos: &[AgNumber],
        ino: Option<InodeNumber>,
    ) -> Result<()> {
        let geo = *tp.geometry();
        let mut wanted: Vec<AgNumber> = agnos.to_vec();
        if let Some((agno, _)) = ino.and_then(|ino| geo.ino_to_ag(ino)) {
            wanted.push(agno);
        }
        locks.lock_all(&wanted)?;

        let mut charged = self.charged(tp, locks, ino)?;
        let total: u64 = batch.iter().map(|ext| u64::from(ext.len)).sum();
        if let Some(c) = &charged {
            if c.core.nblocks < total {
                return Err(AgfsError::InvalidArgument(format!(
                    "inode {} owns {} blocks, cannot free {total}",
                    c.loc.ino.0, c.core.nblocks
                )));
            }
        }
        for ext in batch {
            free_extent(tp, locks, ext.start, ext.len)?;
            debug!(start = ext.start.0, len = ext.len, "fs_extent_freed");
        }
        if let Some(c) = charged.as_mut() {
            c.core.nblocks -= total;
            write_dinode(tp, &c.loc, &c.core)?;
            let delta = i64::try_from(total).unwrap_or(i64::MAX);
            tp.mod_owner_quota(&c.owner(), QuotaResource::Blocks, -delta)?;
        }
        Ok(())
    }

    /// Longest free extent in `agno`, from its AGF.
    pub fn longest_free_extent(&self, agno: AgNumber) -> Result<u32> {
        if agno.0 >= self.superblock().ag_count {
            return Err(AgfsError::InvalidArgument(format!(
                "allocation group {} out of range",
                agno.0
            )));
        }
        let (mut locks, mut tp) = self.begin()?;
        locks.lock_all(&[agno])?;
        let result = agfs_alloc::longest_free_extent(&mut tp, agno);
        tp.cancel();
        result
    }
}
