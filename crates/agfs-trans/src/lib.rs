#![forbid(unsafe_code)]
//! Transaction and reservation engine.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──reserve──▶ Reserved ──modify──▶ Dirty ──commit──▶ Committing ──▶ Committed
//!    │                    │                   │
//!    └────────────────────┴───────cancel──────┴──────────────────────────────▶ Cancelled
//! ```
//!
//! | Phase | Effect on shared state |
//! |-------|------------------------|
//! | reserve | blocks and rt extents debited from the sharded counters, log ticket granted, dquot reservations taken; all or nothing |
//! | modify | buffers locked and staged privately; counter and dquot changes accumulate as deltas |
//! | commit | one log record written; then buffers written back, deltas folded, dquots updated, locks dropped |
//! | cancel | reservations returned, staged buffers discarded, locks dropped |
//! | roll | commit, keep the permanent ticket and the unused reservations, continue under a new id |
//!
//! A log write failure shuts the filesystem down: nothing the transaction
//! staged is applied. A dropped, unfinished transaction cancels itself.

pub mod counters;
pub mod lock;
pub mod log;
pub mod quota;
pub mod resv;

pub use counters::{PercpuCounter, SbCounterSnapshot, SbCounters, SbField};
pub use log::{Log, LogRecord, LogRegion, LogTicket, MemLog};
pub use quota::{DquotId, Owner, QuotaLimits, QuotaManager, QuotaResource, QuotaType};
pub use resv::{ResvTable, TransRes};

use agfs_block::BufCache;
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{Geometry, LOG_CHUNK_SIZE};
use agfs_types::{BlockNumber, Lsn, TxnId};
use crate::log::DquotLogItem;
use parking_lot::Mutex;
use crate::quota::QuotaTrans;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

// ── Manager ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TransConfig {
    pub log_wait: Duration,
    pub counter_shards: usize,
    pub counter_batch: i64,
    pub quota_enforcement: bool,
}

impl Default for TransConfig {
    fn default() -> Self {
        Self {
            log_wait: Duration::from_secs(5),
            counter_shards: 8,
            counter_batch: 32,
            quota_enforcement: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransStats {
    pub committed: u64,
    pub cancelled: u64,
    pub rolled: u64,
    pub active: u64,
}

/// Shared transaction state for one mounted filesystem.
pub struct TransManager {
    geo: Geometry,
    resv: ResvTable,
    counters: SbCounters,
    log: Arc<dyn Log>,
    bufs: Arc<BufCache>,
    quota: QuotaManager,
    log_wait: Duration,
    shutdown: AtomicBool,
    shutdown_reason: Mutex<Option<String>>,
    next_tid: AtomicU64,
    active: AtomicU64,
    committed: AtomicU64,
    cancelled: AtomicU64,
    rolled: AtomicU64,
}

impl std::fmt::Debug for TransManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransManager")
            .field("shutdown", &self.is_shutdown())
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TransManager {
    #[must_use]
    pub fn new(
        geo: Geometry,
        initial: SbCounterSnapshot,
        log: Arc<dyn Log>,
        bufs: Arc<BufCache>,
        config: TransConfig,
    ) -> Self {
        Self {
            geo,
            resv: ResvTable::new(&geo),
            counters: SbCounters::new(initial, config.counter_shards, config.counter_batch),
            log,
            bufs,
            quota: QuotaManager::new(config.quota_enforcement),
            log_wait: config.log_wait,
            shutdown: AtomicBool::new(false),
            shutdown_reason: Mutex::new(None),
            next_tid: AtomicU64::new(1),
            active: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            rolled: AtomicU64::new(0),
        }
    }

    /// Open a transaction in the `Created` state.
    pub fn alloc(self: &Arc<Self>) -> Result<Transaction> {
        if self.is_shutdown() {
            return Err(AgfsError::Shutdown);
        }
        let tid = TxnId(self.next_tid.fetch_add(1, Ordering::Relaxed));
        self.active.fetch_add(1, Ordering::AcqRel);
        trace!(txn = tid.0, "trans_alloc");
        Ok(Transaction {
            mgr: Arc::clone(self),
            tid,
            state: TransState::Created,
            ticket: None,
            blk_res: 0,
            blk_used: 0,
            rtx_res: 0,
            rtx_used: 0,
            deltas: [0; 5],
            bufs: BTreeMap::new(),
            quota: QuotaTrans::default(),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[must_use]
    pub fn resv(&self) -> &ResvTable {
        &self.resv
    }

    #[must_use]
    pub fn counters(&self) -> &SbCounters {
        &self.counters
    }

    #[must_use]
    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    #[must_use]
    pub fn log(&self) -> &Arc<dyn Log> {
        &self.log
    }

    #[must_use]
    pub fn bufs(&self) -> &Arc<BufCache> {
        &self.bufs
    }

    /// Stop accepting transactions. Idempotent; the first reason sticks.
    pub fn force_shutdown(&self, reason: &str) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            error!(reason, "filesystem_shutdown");
            *self.shutdown_reason.lock() = Some(reason.to_owned());
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn shutdown_reason(&self) -> Option<String> {
        self.shutdown_reason.lock().clone()
    }

    /// Free blocks an ordinary reservation may still take.
    #[must_use]
    pub fn blocks_available(&self) -> u64 {
        self.counters
            .get(SbField::Fdblocks)
            .saturating_sub(self.geo.set_aside)
    }

    #[must_use]
    pub fn stats(&self) -> TransStats {
        TransStats {
            committed: self.committed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rolled: self.rolled.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }

    fn floor(&self) -> i64 {
        i64::try_from(self.geo.set_aside).unwrap_or(i64::MAX)
    }
}

// ── Dirty range tracking ────────────────────────────────────────────────────

/// Byte ranges of `data` to log, at `LOG_CHUNK_SIZE` granularity: chunks
/// that differ from `orig` plus chunks explicitly marked. Adjacent chunks
/// merge into one range.
#[must_use]
pub fn dirty_regions(orig: Option<&[u8]>, data: &[u8], marked: &[bool]) -> Vec<Range<usize>> {
    let mut out: Vec<Range<usize>> = Vec::new();
    for (index, chunk) in data.chunks(LOG_CHUNK_SIZE).enumerate() {
        let start = index * LOG_CHUNK_SIZE;
        let end = start + chunk.len();
        let changed = match orig {
            None => true,
            Some(orig) => orig.get(start..end) != Some(chunk),
        };
        if !(changed || marked.get(index).copied().unwrap_or(false)) {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => out.push(start..end),
        }
    }
    out
}

#[derive(Debug)]
struct TxBuf {
    /// Committed image at join time; `None` for buffers initialised here.
    orig: Option<Arc<Vec<u8>>>,
    data: Vec<u8>,
    marked: Vec<bool>,
    modified: bool,
}

// ── Transaction ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    Created,
    Reserved,
    Dirty,
    Committing,
    Committed,
    Cancelled,
}

impl TransState {
    fn is_open(self) -> bool {
        matches!(self, Self::Created | Self::Reserved | Self::Dirty)
    }
}

pub struct Transaction {
    mgr: Arc<TransManager>,
    tid: TxnId,
    state: TransState,
    ticket: Option<LogTicket>,
    blk_res: u64,
    blk_used: u64,
    rtx_res: u64,
    rtx_used: u64,
    deltas: [i64; 5],
    bufs: BTreeMap<BlockNumber, TxBuf>,
    quota: QuotaTrans,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("state", &self.state)
            .field("blk_res", &self.blk_res)
            .field("blk_used", &self.blk_used)
            .field("bufs", &self.bufs.len())
            .finish_non_exhaustive()
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl Transaction {
    #[must_use]
    pub fn tid(&self) -> TxnId {
        self.tid
    }

    #[must_use]
    pub fn state(&self) -> TransState {
        self.state
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<TransManager> {
        &self.mgr
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.mgr.geo
    }

    #[must_use]
    pub fn blk_res(&self) -> u64 {
        self.blk_res
    }

    #[must_use]
    pub fn blk_used(&self) -> u64 {
        self.blk_used
    }

    /// Reserved blocks not yet consumed.
    #[must_use]
    pub fn blocks_left(&self) -> u64 {
        self.blk_res - self.blk_used
    }

    #[must_use]
    pub fn delta(&self, field: SbField) -> i64 {
        self.deltas[field.index()]
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(AgfsError::InvalidArgument(format!(
                "{op} on transaction {} in state {:?}",
                self.tid.0, self.state
            )))
        }
    }

    // ── Reservation ─────────────────────────────────────────────────────

    /// Debit `blocks` and `rtextents` and take a log ticket, atomically.
    pub fn reserve(&mut self, res: &TransRes, blocks: u64, rtextents: u64) -> Result<()> {
        if self.state != TransState::Created {
            return Err(AgfsError::InvalidArgument(format!(
                "reserve on transaction {} in state {:?}",
                self.tid.0, self.state
            )));
        }
        if self.mgr.is_shutdown() {
            return Err(AgfsError::Shutdown);
        }
        let counters = &self.mgr.counters;
        if blocks > 0
            && !counters
                .counter(SbField::Fdblocks)
                .try_sub(to_i64(blocks), self.mgr.floor())
        {
            warn!(txn = self.tid.0, blocks, "trans_reserve_blocks_failed");
            return Err(AgfsError::NoSpace);
        }
        if rtextents > 0
            && !counters
                .counter(SbField::Frextents)
                .try_sub(to_i64(rtextents), 0)
        {
            counters.apply(SbField::Fdblocks, to_i64(blocks));
            warn!(txn = self.tid.0, rtextents, "trans_reserve_rtextents_failed");
            return Err(AgfsError::NoSpace);
        }
        match self.mgr.log.reserve(self.tid, res, self.mgr.log_wait) {
            Ok(ticket) => self.ticket = Some(ticket),
            Err(err) => {
                counters.apply(SbField::Fdblocks, to_i64(blocks));
                counters.apply(SbField::Frextents, to_i64(rtextents));
                warn!(txn = self.tid.0, error = %err, "trans_reserve_log_failed");
                return Err(err);
            }
        }
        self.blk_res = blocks;
        self.rtx_res = rtextents;
        self.state = TransState::Reserved;
        debug!(txn = self.tid.0, blocks, rtextents, log = res.log_res, "trans_reserved");
        Ok(())
    }

    /// Undo `reserve` and return to `Created`.
    fn unreserve(&mut self) {
        let counters = &self.mgr.counters;
        counters.apply(SbField::Fdblocks, to_i64(self.blk_res));
        counters.apply(SbField::Frextents, to_i64(self.rtx_res));
        self.blk_res = 0;
        self.rtx_res = 0;
        if let Some(ticket) = self.ticket.take() {
            self.mgr.log.ungrant(ticket);
        }
        self.state = TransState::Created;
    }

    /// Reserve against the dquots of `owner`. Failure also rolls back the
    /// main reservation, so the two succeed or fail together.
    pub fn reserve_quota(&mut self, owner: &Owner, blocks: u64, inodes: u64) -> Result<()> {
        self.ensure_open("reserve_quota")?;
        let ids = owner.dquot_ids();
        let amounts = [blocks, inodes, 0];
        if let Err(err) = self.mgr.quota.reserve(&ids, amounts) {
            if self.state == TransState::Reserved {
                self.unreserve();
            }
            return Err(err);
        }
        self.quota.note_reserved(&ids, amounts);
        Ok(())
    }

    /// Move `blocks`/`inodes` of usage from `old` to `new` in one ordered
    /// step over both sets of dquots.
    pub fn reserve_quota_chown(
        &mut self,
        old: &Owner,
        new: &Owner,
        blocks: u64,
        inodes: u64,
    ) -> Result<()> {
        self.ensure_open("reserve_quota_chown")?;
        let (old_ids, new_ids) = (old.dquot_ids(), new.dquot_ids());
        let mut moving_from = Vec::new();
        let mut moving_to = Vec::new();
        for (from, to) in old_ids.iter().zip(new_ids.iter()) {
            if from != to {
                moving_from.push(*from);
                moving_to.push(*to);
            }
        }
        if moving_to.is_empty() {
            return Ok(());
        }
        let amounts = [blocks, inodes, 0];
        if let Err(err) = self.mgr.quota.reserve_moving(&moving_from, &moving_to, amounts) {
            if self.state == TransState::Reserved {
                self.unreserve();
            }
            return Err(err);
        }
        self.quota.note_reserved(&moving_to, amounts);
        for id in &moving_to {
            self.mod_dquot(*id, QuotaResource::Blocks, to_i64(blocks))?;
            self.mod_dquot(*id, QuotaResource::Inodes, to_i64(inodes))?;
        }
        for id in &moving_from {
            self.mod_dquot(*id, QuotaResource::Blocks, -to_i64(blocks))?;
            self.mod_dquot(*id, QuotaResource::Inodes, -to_i64(inodes))?;
        }
        debug!(txn = self.tid.0, blocks, inodes, moved = moving_to.len(), "trans_chown_reserved");
        Ok(())
    }

    // ── Deltas ──────────────────────────────────────────────────────────

    /// Accumulate a superblock counter delta. Consuming free blocks or rt
    /// extents must stay within the reservation.
    pub fn mod_sb(&mut self, field: SbField, delta: i64) -> Result<()> {
        self.ensure_open("mod_sb")?;
        if delta < 0 {
            let need = delta.unsigned_abs();
            let (res, used) = match field {
                SbField::Fdblocks => (self.blk_res, &mut self.blk_used),
                SbField::Frextents => (self.rtx_res, &mut self.rtx_used),
                _ => {
                    self.deltas[field.index()] += delta;
                    self.state = TransState::Dirty;
                    return Ok(());
                }
            };
            if *used + need > res {
                error!(
                    txn = self.tid.0,
                    field = field.name(),
                    reserved = res,
                    requested = *used + need,
                    invariant = "reservation_covers_usage",
                    "trans_reservation_invariant_violation"
                );
                return Err(AgfsError::ReservationOverrun {
                    resource: field.name(),
                    reserved: res,
                    requested: *used + need,
                });
            }
            *used += need;
        }
        self.deltas[field.index()] += delta;
        self.state = TransState::Dirty;
        Ok(())
    }

    /// Record dquot usage (positive usage must be reserved).
    pub fn mod_dquot(&mut self, id: DquotId, resource: QuotaResource, delta: i64) -> Result<()> {
        self.ensure_open("mod_dquot")?;
        self.quota.note_used(id, resource, delta, true)?;
        self.state = TransState::Dirty;
        Ok(())
    }

    /// Charge usage to all three dquots of `owner`.
    pub fn mod_owner_quota(
        &mut self,
        owner: &Owner,
        resource: QuotaResource,
        delta: i64,
    ) -> Result<()> {
        for id in owner.dquot_ids() {
            self.mod_dquot(id, resource, delta)?;
        }
        Ok(())
    }

    // ── Buffers ─────────────────────────────────────────────────────────

    fn join(&mut self, block: BlockNumber) -> Result<()> {
        if self.bufs.contains_key(&block) {
            return Ok(());
        }
        self.ensure_open("join")?;
        let cache = Arc::clone(&self.mgr.bufs);
        cache.lock(block, self.tid);
        cache.hold(block);
        let image = match cache.read(block) {
            Ok(image) => image,
            Err(err) => {
                cache.release(block);
                cache.unlock(block, self.tid);
                return Err(err);
            }
        };
        let chunks = image.len().div_ceil(LOG_CHUNK_SIZE);
        self.bufs.insert(
            block,
            TxBuf {
                data: image.to_vec(),
                orig: Some(image),
                marked: vec![false; chunks],
                modified: false,
            },
        );
        trace!(txn = self.tid.0, block = block.0, "trans_buf_joined");
        Ok(())
    }

    /// Read a block under this transaction's lock.
    pub fn read_buf(&mut self, block: BlockNumber) -> Result<&[u8]> {
        self.join(block)?;
        self.bufs
            .get(&block)
            .map(|b| b.data.as_slice())
            .ok_or_else(|| AgfsError::NotFound(format!("buffer {}", block.0)))
    }

    /// Mutable access to a joined (or newly joined) block.
    pub fn buf_mut(&mut self, block: BlockNumber) -> Result<&mut [u8]> {
        self.join(block)?;
        self.state = TransState::Dirty;
        let buf = self
            .bufs
            .get_mut(&block)
            .ok_or_else(|| AgfsError::NotFound(format!("buffer {}", block.0)))?;
        buf.modified = true;
        Ok(buf.data.as_mut_slice())
    }

    /// Zeroed buffer for a block being initialised; logged in full.
    pub fn get_buf(&mut self, block: BlockNumber) -> Result<&mut [u8]> {
        self.ensure_open("get_buf")?;
        if !self.bufs.contains_key(&block) {
            let cache = Arc::clone(&self.mgr.bufs);
            cache.lock(block, self.tid);
            cache.hold(block);
            let data = cache.get_uncached(block);
            let chunks = data.len().div_ceil(LOG_CHUNK_SIZE);
            self.bufs.insert(
                block,
                TxBuf {
                    orig: None,
                    data,
                    marked: vec![false; chunks],
                    modified: false,
                },
            );
        }
        self.state = TransState::Dirty;
        let buf = self
            .bufs
            .get_mut(&block)
            .ok_or_else(|| AgfsError::NotFound(format!("buffer {}", block.0)))?;
        buf.orig = None;
        buf.data.fill(0);
        buf.modified = true;
        Ok(buf.data.as_mut_slice())
    }

    /// Force `range` of a joined buffer into the log record.
    pub fn log_buf(&mut self, block: BlockNumber, range: Range<usize>) -> Result<()> {
        let buf = self
            .bufs
            .get_mut(&block)
            .ok_or_else(|| AgfsError::InvalidArgument(format!("block {} not joined", block.0)))?;
        if range.is_empty() {
            return Ok(());
        }
        let first = range.start / LOG_CHUNK_SIZE;
        let last = (range.end - 1) / LOG_CHUNK_SIZE;
        for slot in buf.marked.iter_mut().take(last + 1).skip(first) {
            *slot = true;
        }
        buf.modified = true;
        self.state = TransState::Dirty;
        Ok(())
    }

    #[must_use]
    pub fn is_joined(&self, block: BlockNumber) -> bool {
        self.bufs.contains_key(&block)
    }

    fn release_bufs(&mut self) {
        let cache = Arc::clone(&self.mgr.bufs);
        for block in std::mem::take(&mut self.bufs).into_keys() {
            cache.release(block);
            cache.unlock(block, self.tid);
        }
    }

    // ── Commit ──────────────────────────────────────────────────────────

    fn build_record(&self) -> (LogRecord, Vec<BlockNumber>) {
        let mut record = LogRecord {
            tid: self.tid,
            ..LogRecord::default()
        };
        let mut dirty = Vec::new();
        for (block, buf) in &self.bufs {
            if !buf.modified {
                continue;
            }
            let ranges = dirty_regions(buf.orig.as_deref().map(Vec::as_slice), &buf.data, &buf.marked);
            if ranges.is_empty() {
                continue;
            }
            dirty.push(*block);
            for range in ranges {
                record.regions.push(LogRegion {
                    block: *block,
                    // Block sizes are at most 64 KiB.
                    offset: u32::try_from(range.start).unwrap_or(u32::MAX),
                    bytes: buf.data[range].to_vec(),
                });
            }
        }
        for field in SbField::ALL {
            let delta = self.deltas[field.index()];
            if delta != 0 {
                record.deltas.push((field, delta));
            }
        }
        for (id, delta) in &self.quota.items {
            if delta.used != [0; 3] {
                record.dquots.push(DquotLogItem {
                    id: *id,
                    blocks: delta.used[0],
                    inodes: delta.used[1],
                    rtblocks: delta.used[2],
                });
            }
        }
        (record, dirty)
    }

    fn commit_inner(&mut self, rolling: bool) -> Result<Lsn> {
        self.ensure_open("commit")?;
        if self.mgr.is_shutdown() {
            self.cancel_inner();
            return Err(AgfsError::Shutdown);
        }
        let (record, dirty) = self.build_record();
        self.state = TransState::Committing;

        let lsn = if record.is_empty() {
            self.mgr.log.last_lsn()
        } else {
            let Some(ticket) = self.ticket.as_mut() else {
                self.state = TransState::Dirty;
                self.cancel_inner();
                return Err(AgfsError::InvalidArgument(
                    "modifying transaction committed without a log reservation".to_owned(),
                ));
            };
            match self.mgr.log.write(ticket, record) {
                Ok(lsn) => lsn,
                Err(err @ AgfsError::ReservationOverrun { .. }) => {
                    // Refused before anything was issued to the log.
                    error!(
                        txn = self.tid.0,
                        error = %err,
                        invariant = "log_reservation_covers_record",
                        "trans_log_reservation_invariant_violation"
                    );
                    self.state = TransState::Dirty;
                    self.cancel_inner();
                    return Err(err);
                }
                Err(err) => {
                    self.mgr.force_shutdown(&format!("log write failed: {err}"));
                    self.abandon();
                    return Err(err);
                }
            }
        };

        // The record is durable; from here on failures shut down instead
        // of unwinding.
        let cache = Arc::clone(&self.mgr.bufs);
        let mut writeback_err = None;
        for block in dirty {
            let Some(buf) = self.bufs.get_mut(&block) else {
                continue;
            };
            let data = std::mem::take(&mut buf.data);
            if let Err(err) = cache.write_back(block, data, lsn) {
                self.mgr
                    .force_shutdown(&format!("metadata write-back of block {} failed: {err}", block.0));
                writeback_err = Some(err);
                break;
            }
        }

        self.fold_counters(rolling);
        self.fold_quota(rolling);
        self.release_bufs();
        if !rolling {
            if let Some(ticket) = self.ticket.take() {
                self.mgr.log.ungrant(ticket);
            }
        }
        self.mgr.committed.fetch_add(1, Ordering::Relaxed);
        debug!(txn = self.tid.0, lsn = lsn.0, rolling, "trans_committed");
        match writeback_err {
            Some(err) => Err(err),
            None => Ok(lsn),
        }
    }

    fn fold_counters(&mut self, rolling: bool) {
        let counters = &self.mgr.counters;
        for field in SbField::ALL {
            let mut delta = self.deltas[field.index()];
            // Consumed blocks were debited at reserve time.
            match field {
                SbField::Fdblocks => {
                    delta += to_i64(if rolling { self.blk_used } else { self.blk_res });
                }
                SbField::Frextents => {
                    delta += to_i64(if rolling { self.rtx_used } else { self.rtx_res });
                }
                _ => {}
            }
            counters.apply(field, delta);
        }
        self.deltas = [0; 5];
        if rolling {
            self.blk_res -= self.blk_used;
            self.rtx_res -= self.rtx_used;
        } else {
            self.blk_res = 0;
            self.rtx_res = 0;
        }
        self.blk_used = 0;
        self.rtx_used = 0;
    }

    fn fold_quota(&mut self, rolling: bool) {
        let (apply, keep) = if rolling {
            (self.quota.consumed_part(), self.quota.carry_over())
        } else {
            (std::mem::take(&mut self.quota), QuotaTrans::default())
        };
        for (id, delta) in &apply.items {
            self.mgr.quota.apply(*id, delta);
        }
        self.quota = keep;
    }

    /// Commit and finish. Returns the record's LSN (the current LSN when
    /// nothing was dirty).
    pub fn commit(mut self) -> Result<Lsn> {
        let result = self.commit_inner(false);
        if result.is_ok() || self.state == TransState::Committing {
            self.finish(TransState::Committed);
        }
        result
    }

    /// Commit the work so far and continue under a new transaction id with
    /// the same permanent ticket and the unconsumed reservations.
    pub fn roll(&mut self) -> Result<()> {
        if !self.ticket.as_ref().is_some_and(|t| t.permanent) {
            return Err(AgfsError::InvalidArgument(
                "roll requires a permanent log reservation".to_owned(),
            ));
        }
        let old = self.tid;
        if let Err(err) = self.commit_inner(true) {
            if self.state == TransState::Committing {
                self.finish(TransState::Committed);
                self.cancel_leftovers();
            }
            return Err(err);
        }
        self.mgr.rolled.fetch_add(1, Ordering::Relaxed);
        self.tid = TxnId(self.mgr.next_tid.fetch_add(1, Ordering::Relaxed));
        self.state = TransState::Reserved;
        if let Some(ticket) = self.ticket.as_mut() {
            ticket.tid = self.tid;
            if let Err(err) = self.mgr.log.regrant(ticket, self.mgr.log_wait) {
                warn!(txn = self.tid.0, error = %err, "trans_roll_regrant_failed");
                self.cancel_inner();
                return Err(err);
            }
        }
        debug!(old = old.0, new = self.tid.0, blocks_left = self.blk_res, "trans_rolled");
        Ok(())
    }

    /// Return everything the transaction still holds after a failed
    /// rolling commit (the committed part is already applied).
    fn cancel_leftovers(&mut self) {
        let counters = &self.mgr.counters;
        counters.apply(SbField::Fdblocks, to_i64(self.blk_res));
        counters.apply(SbField::Frextents, to_i64(self.rtx_res));
        self.blk_res = 0;
        self.rtx_res = 0;
        for (id, delta) in &std::mem::take(&mut self.quota).items {
            self.mgr.quota.cancel(*id, delta);
        }
        if let Some(ticket) = self.ticket.take() {
            self.mgr.log.ungrant(ticket);
        }
    }

    // ── Cancel ──────────────────────────────────────────────────────────

    fn cancel_inner(&mut self) {
        if !self.state.is_open() {
            return;
        }
        let dirty = self.state == TransState::Dirty;
        self.blk_used = 0;
        self.rtx_used = 0;
        self.deltas = [0; 5];
        self.cancel_leftovers();
        self.release_bufs();
        self.mgr.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(txn = self.tid.0, dirty, "trans_cancelled");
        self.finish(TransState::Cancelled);
    }

    /// Log write failed after the filesystem was shut down: drop staged
    /// state without applying it.
    fn abandon(&mut self) {
        self.state = TransState::Dirty;
        self.cancel_inner();
    }

    fn finish(&mut self, state: TransState) {
        if matches!(self.state, TransState::Committed | TransState::Cancelled) {
            return;
        }
        self.state = state;
        self.mgr.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Give everything back.
    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    /// Cancel because of `err` and return it. Corruption found while
    /// modifying metadata shuts the filesystem down.
    #[must_use]
    pub fn cancel_with(mut self, err: AgfsError) -> AgfsError {
        if err.is_corruption() {
            self.mgr.force_shutdown(&err.to_string());
        }
        self.cancel_inner();
        err
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.is_open() {
            trace!(txn = self.tid.0, "trans_dropped_uncommitted");
            self.cancel_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agfs_block::MemBlockDevice;
    use agfs_ondisk::Superblock;

    const FREE: u64 = 200;

    fn setup() -> (Arc<TransManager>, Arc<MemLog>) {
        let geo = Geometry::from_superblock(&Superblock::for_volume(4096, 256, 64, 4, 256)).unwrap();
        let dev = MemBlockDevice::zeroed(4096, 256).unwrap();
        let bufs = Arc::new(BufCache::new(Arc::new(dev), 64));
        let log = Arc::new(MemLog::new(64 << 20));
        let initial = SbCounterSnapshot {
            dblocks: 256,
            fdblocks: FREE,
            ..SbCounterSnapshot::default()
        };
        let mgr = Arc::new(TransManager::new(
            geo,
            initial,
            Arc::clone(&log) as Arc<dyn Log>,
            bufs,
            TransConfig::default(),
        ));
        (mgr, log)
    }

    fn fdblocks(mgr: &TransManager) -> u64 {
        mgr.counters().get(SbField::Fdblocks)
    }

    #[test]
    fn commit_folds_unused_reservation_back() {
        let (mgr, log) = setup();
        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 10, 0).unwrap();
        assert_eq!(fdblocks(&mgr), FREE - 10);
        tp.mod_sb(SbField::Fdblocks, -3).unwrap();
        assert_eq!(tp.blocks_left(), 7);
        tp.commit().unwrap();
        assert_eq!(fdblocks(&mgr), FREE - 3);
        assert_eq!(log.free_bytes(), log.capacity());
        assert_eq!(mgr.stats().active, 0);
        let records = log.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].deltas, vec![(SbField::Fdblocks, -3)]);
    }

    #[test]
    fn usage_beyond_reservation_is_refused() {
        let (mgr, _log) = setup();
        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 2, 0).unwrap();
        let err = tp.mod_sb(SbField::Fdblocks, -3).unwrap_err();
        assert!(matches!(err, AgfsError::ReservationOverrun { reserved: 2, requested: 3, .. }));
        tp.cancel();
        assert_eq!(fdblocks(&mgr), FREE);
    }

    #[test]
    fn reservation_respects_set_aside() {
        let (mgr, log) = setup();
        let set_aside = mgr.geometry().set_aside;
        let mut tp = mgr.alloc().unwrap();
        let err = tp.reserve(&mgr.resv().write, FREE - set_aside + 1, 0).unwrap_err();
        assert!(matches!(err, AgfsError::NoSpace));
        assert_eq!(tp.state(), TransState::Created);
        assert_eq!(fdblocks(&mgr), FREE);
        assert_eq!(log.free_bytes(), log.capacity());
        tp.reserve(&mgr.resv().write, FREE - set_aside, 0).unwrap();
        assert_eq!(mgr.blocks_available(), 0);
    }

    #[test]
    fn committed_buffers_reach_the_device_and_cancelled_do_not() {
        let (mgr, log) = setup();
        let blk = BlockNumber(9);

        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 0, 0).unwrap();
        tp.buf_mut(blk).unwrap()[300] = 0xAA;
        tp.cancel();
        assert_eq!(mgr.bufs().read(blk).unwrap()[300], 0);
        assert_eq!(mgr.bufs().lock_owner(blk), None);

        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 0, 0).unwrap();
        tp.buf_mut(blk).unwrap()[300] = 0xAA;
        let lsn = tp.commit().unwrap();
        assert_eq!(mgr.bufs().read(blk).unwrap()[300], 0xAA);
        assert_eq!(mgr.bufs().lsn(blk), Some(lsn));

        let records = log.records().unwrap();
        let region = &records.last().unwrap().regions[0];
        assert_eq!(region.block, blk);
        assert_eq!(region.offset, 256);
        assert_eq!(region.bytes.len(), LOG_CHUNK_SIZE);
    }

    #[test]
    fn log_failure_shuts_down_without_applying() {
        let (mgr, log) = setup();
        log.set_fail_writes(true);
        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 5, 0).unwrap();
        tp.mod_sb(SbField::Fdblocks, -5).unwrap();
        tp.buf_mut(BlockNumber(12)).unwrap()[0] = 1;
        assert!(matches!(tp.commit(), Err(AgfsError::Io(_))));
        assert!(mgr.is_shutdown());
        assert!(mgr.shutdown_reason().unwrap().contains("log write"));
        assert_eq!(mgr.bufs().read(BlockNumber(12)).unwrap()[0], 0);
        assert_eq!(fdblocks(&mgr), FREE);
        assert!(matches!(mgr.alloc(), Err(AgfsError::Shutdown)));
    }

    #[test]
    fn quota_failure_undoes_block_reservation() {
        let (mgr, log) = setup();
        let owner = Owner { uid: 7, gid: 7, projid: 0 };
        mgr.quota().set_limits(
            DquotId::user(7),
            QuotaLimits {
                blk_hard: 4,
                ..QuotaLimits::default()
            },
        );
        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 5, 0).unwrap();
        let err = tp.reserve_quota(&owner, 5, 0).unwrap_err();
        assert!(matches!(err, AgfsError::QuotaExceeded { kind: "user", id: 7 }));
        assert_eq!(tp.state(), TransState::Created);
        assert_eq!(fdblocks(&mgr), FREE);
        assert_eq!(log.free_bytes(), log.capacity());
        assert_eq!(mgr.quota().get(DquotId::group(7)).usage(QuotaResource::Blocks).reserved, 0);
    }

    #[test]
    fn quota_usage_lands_on_commit() {
        let (mgr, _log) = setup();
        let owner = Owner { uid: 3, gid: 4, projid: 5 };
        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 6, 0).unwrap();
        tp.reserve_quota(&owner, 6, 0).unwrap();
        tp.mod_sb(SbField::Fdblocks, -2).unwrap();
        tp.mod_owner_quota(&owner, QuotaResource::Blocks, 2).unwrap();
        tp.commit().unwrap();
        for id in owner.dquot_ids() {
            let usage = mgr.quota().get(id).usage(QuotaResource::Blocks);
            assert_eq!((usage.count, usage.reserved), (2, 2), "{id:?}");
        }
    }

    #[test]
    fn roll_carries_remaining_reservation() {
        let (mgr, log) = setup();
        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().truncate, 10, 0).unwrap();
        let first = tp.tid();
        for _ in 0..3 {
            tp.mod_sb(SbField::Fdblocks, -2).unwrap();
            tp.roll().unwrap();
        }
        assert_ne!(tp.tid(), first);
        assert_eq!(tp.blk_res(), 4);
        assert_eq!(fdblocks(&mgr), FREE - 10);
        tp.mod_sb(SbField::Fdblocks, -1).unwrap();
        tp.commit().unwrap();
        assert_eq!(fdblocks(&mgr), FREE - 7);
        assert_eq!(log.free_bytes(), log.capacity());
        assert_eq!(mgr.stats().rolled, 3);
    }

    #[test]
    fn roll_needs_a_permanent_ticket() {
        let (mgr, _log) = setup();
        let mut tp = mgr.alloc().unwrap();
        tp.reserve(&mgr.resv().write, 1, 0).unwrap();
        assert!(matches!(tp.roll(), Err(AgfsError::InvalidArgument(_))));
    }

    #[test]
    fn dropped_transaction_cancels_and_unlocks() {
        let (mgr, _log) = setup();
        {
            let mut tp = mgr.alloc().unwrap();
            tp.reserve(&mgr.resv().write, 4, 0).unwrap();
            tp.read_buf(BlockNumber(20)).unwrap();
            assert_eq!(mgr.bufs().lock_owner(BlockNumber(20)), Some(tp.tid()));
        }
        assert_eq!(mgr.bufs().lock_owner(BlockNumber(20)), None);
        assert_eq!(fdblocks(&mgr), FREE);
        assert_eq!(mgr.stats().cancelled, 1);
    }

    #[test]
    fn clean_commit_writes_no_record() {
        let (mgr, log) = setup();
        let mut tp = mgr.alloc().unwrap();
        tp.read_buf(BlockNumber(1)).unwrap();
        tp.commit().unwrap();
        assert!(log.records().unwrap().is_empty());
    }

    #[test]
    fn corruption_cancel_shuts_down() {
        let (mgr, _log) = setup();
        let tp = mgr.alloc().unwrap();
        let err = tp.cancel_with(AgfsError::corruption(3, "bad magic"));
        assert!(err.is_corruption());
        assert!(mgr.is_shutdown());
    }

    #[test]
    fn dirty_regions_merge_adjacent_chunks() {
        let orig = vec![0_u8; 1024];
        let mut data = orig.clone();
        data[10] = 1;
        data[130] = 1;
        data[700] = 1;
        let mut marked = vec![false; 8];
        marked[7] = true;
        assert_eq!(
            dirty_regions(Some(&orig), &data, &marked),
            vec![0..256, 640..768, 896..1024]
        );
        assert_eq!(dirty_regions(None, &data, &marked), vec![0..1024]);
    }
}
