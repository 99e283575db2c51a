#![forbid(unsafe_code)]
//! Allocation-group space manager.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **AGF / AGFL** ([`agf`]): the AG free-space header and its spare
//!    block ring, decoded per call and written back into the transaction.
//! 2. **Trees** ([`tree`]): by-bno and by-size free-space btrees bound to
//!    the generic engine, growing only from the free list.
//! 3. **Extents** ([`extent`]): exact, near and best-fit allocation inside
//!    one AG, and coalescing free.
//! 4. **Free list upkeep** ([`freelist`]): precheck, refill and drain.
//! 5. **Volume** (this module): AG selection with ordered AG locking.
//!
//! ## Space accounting
//!
//! An AG contributes `freeblks + flcount + btreeblks` to the global free
//! block count. Moving blocks between free space, the free list and the
//! free-space trees leaves the global count alone; only blocks handed to
//! callers (and returned by them) are charged to the transaction.

pub mod agf;
pub mod extent;
pub mod freelist;
pub mod perag;
pub mod tree;
pub mod verify;

pub use agf::{AgfState, FIRST_DATA_AGBLOCK};
pub use extent::{AgAllocRequest, AgAllocType, AgExtent, longest_free};
pub use freelist::{fix_freelist, space_available};
pub use perag::{AgLockSet, PeragTable};
pub use verify::{FreeSpaceReport, verify_ag};

use agfs_btree::node::Node;
use agfs_btree::{BtreeOps, Cursor, Entry};
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{
    AGF_AGBLOCK, AGFL_AGBLOCK, Agf, AgflBlock, AllocRec, BNO_ROOT_AGBLOCK, BtreeKind,
    CNT_ROOT_AGBLOCK, Geometry, Record,
};
use agfs_trans::{SbField, Transaction};
use agfs_types::{AgBlock, AgNumber, BlockNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

// ── AG initialisation ───────────────────────────────────────────────────────

/// Write a fresh AGF, free list and single-leaf free-space trees for
/// `agno`. `free` must be sorted, disjoint and fit in one leaf.
pub fn init_free_space(
    tp: &mut Transaction,
    agno: AgNumber,
    free: &[AllocRec],
    freelist: &[AgBlock],
) -> Result<Agf> {
    let geo = *tp.geometry();
    let length = geo.ag_blocks_of(agno);
    let leaf_max = BtreeKind::Bno.leaf_max(geo.block_size);
    if free.len() > leaf_max || freelist.len() > geo.agfl_size as usize {
        return Err(AgfsError::InvalidArgument(format!(
            "AG {} seed does not fit: {} extents, {} free list blocks",
            agno.0,
            free.len(),
            freelist.len()
        )));
    }
    for pair in free.windows(2) {
        if pair[0].end() >= pair[1].start {
            return Err(AgfsError::InvalidArgument(format!(
                "seed extents {} and {} overlap or touch",
                pair[0], pair[1]
            )));
        }
    }

    let flcount = u32::try_from(freelist.len()).unwrap_or(u32::MAX);
    let agf = Agf {
        seqno: agno.0,
        length,
        bno_root: BNO_ROOT_AGBLOCK,
        cnt_root: CNT_ROOT_AGBLOCK,
        bno_level: 1,
        cnt_level: 1,
        flfirst: 0,
        fllast: if flcount == 0 { geo.agfl_size - 1 } else { flcount - 1 },
        flcount,
        freeblks: free.iter().map(|r| r.len).sum(),
        longest: free.iter().map(|r| r.len).max().unwrap_or(0),
        btreeblks: 0,
    };
    let mut agfl = AgflBlock::empty(agno.0, geo.block_size);
    for (slot, block) in agfl.slots.iter_mut().zip(freelist) {
        *slot = block.0;
    }
    agf.encode(tp.get_buf(geo.agb_to_fsb(agno, AgBlock(AGF_AGBLOCK)))?);
    agfl.encode(tp.get_buf(geo.agb_to_fsb(agno, AgBlock(AGFL_AGBLOCK)))?);

    let mut st = AgfState::detached(agno, agf);
    for (kind, root) in [(BtreeKind::Bno, BNO_ROOT_AGBLOCK), (BtreeKind::Cnt, CNT_ROOT_AGBLOCK)] {
        let ops = st.tree(kind);
        let loc = Cursor::new(&ops, tp).loc();
        let mut leaf = Node::empty(&loc, AgBlock(root), 0);
        let mut records: Vec<Record> = free
            .iter()
            .filter_map(|r| kind.alloc_record(*r))
            .collect();
        records.sort_by_key(|r| ops.key_of(r));
        for (i, rec) in records.into_iter().enumerate() {
            if leaf.entries.insert(i, Entry::Rec(rec)).is_err() {
                return Err(AgfsError::InvalidArgument("seed leaf overflow".to_owned()));
            }
        }
        leaf.store_new(tp, &loc)?;
    }
    info!(
        agno = agno.0,
        length,
        freeblks = agf.freeblks,
        flcount,
        "alloc_ag_initialised"
    );
    Ok(agf)
}

/// Free list seeded by format: enough blocks for one operation on
/// single-level trees, starting right after the fixed headers and roots.
#[must_use]
pub fn initial_freelist(geo: &Geometry, first: u32) -> Vec<AgBlock> {
    (0..geo.min_freelist(1, 1)).map(|i| AgBlock(first + i)).collect()
}

// ── Single-AG entry points ──────────────────────────────────────────────────

/// Allocate inside `agno`, whose lock the caller holds. The blocks are
/// charged to the transaction's block reservation; `max_len` is cut to
/// what the reservation has left.
pub fn alloc_in_ag(
    tp: &mut Transaction,
    agno: AgNumber,
    req: &AgAllocRequest,
) -> Result<Option<AgExtent>> {
    let left = u32::try_from(tp.blocks_left()).unwrap_or(u32::MAX);
    if left < req.min_len {
        return Err(AgfsError::ReservationOverrun {
            resource: SbField::Fdblocks.name(),
            reserved: tp.blk_res(),
            requested: tp.blk_used() + u64::from(req.min_len),
        });
    }
    let ag_len = tp.geometry().ag_blocks_of(agno);
    if req.min_len > ag_len {
        return Ok(None);
    }
    let req = AgAllocRequest {
        max_len: req.max_len.min(left).min(ag_len),
        ..*req
    };
    req.check(ag_len)?;

    let peek = AgfState::peek(tp, agno)?;
    if !space_available(tp, &peek, req.min_len) {
        trace!(agno = agno.0, min_len = req.min_len, "alloc_ag_skipped");
        return Ok(None);
    }
    let mut st = AgfState::read(tp, agno)?;
    if !fix_freelist(tp, &mut st, Some(req.min_len))? {
        return Ok(None);
    }
    let Some(ext) = extent::alloc_extent(tp, &mut st, &req)? else {
        return Ok(None);
    };
    tp.mod_sb(SbField::Fdblocks, -i64::from(ext.len))?;
    Ok(Some(ext))
}

/// Return `{start, len}` of `agno` to free space; the caller holds the
/// AG lock.
pub fn free_in_ag(tp: &mut Transaction, agno: AgNumber, start: AgBlock, len: u32) -> Result<()> {
    let mut st = AgfState::read(tp, agno)?;
    fix_freelist(tp, &mut st, None)?;
    extent::free_extent(tp, &mut st, start, len)?;
    tp.mod_sb(SbField::Fdblocks, i64::from(len))
}

/// Cached longest free extent of `agno`.
pub fn longest_free_extent(tp: &mut Transaction, agno: AgNumber) -> Result<u32> {
    Ok(AgfState::peek(tp, agno)?.longest)
}

// ── Volume-wide allocation ──────────────────────────────────────────────────

/// Where a volume-wide allocation should look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocTarget {
    /// Best fit in this AG only.
    ThisAg(AgNumber),
    /// Best fit, trying every AG from this one upward and wrapping.
    StartAg(AgNumber),
    /// As close to this block as possible, then anywhere else.
    NearBlock(BlockNumber),
    /// Exactly at this block.
    ExactBlock(BlockNumber),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocArgs {
    pub target: AllocTarget,
    pub min_len: u32,
    pub max_len: u32,
    pub alignment: u32,
    pub prod: u32,
    pub modulo: u32,
}

impl AllocArgs {
    #[must_use]
    pub fn new(target: AllocTarget, min_len: u32, max_len: u32) -> Self {
        Self {
            target,
            min_len,
            max_len,
            alignment: 1,
            prod: 1,
            modulo: 0,
        }
    }

    fn request(&self, kind: AgAllocType) -> AgAllocRequest {
        AgAllocRequest {
            kind,
            min_len: self.min_len,
            max_len: self.max_len,
            alignment: self.alignment,
            prod: self.prod,
            modulo: self.modulo,
        }
    }
}

impl AgExtent {
    #[must_use]
    pub fn fsb(&self, geo: &Geometry) -> BlockNumber {
        geo.agb_to_fsb(self.agno, self.start)
    }
}

fn split_fsb(geo: &Geometry, fsb: BlockNumber) -> Result<(AgNumber, AgBlock)> {
    geo.fsb_to_ag(fsb)
        .ok_or_else(|| AgfsError::InvalidArgument(format!("block {} outside the volume", fsb.0)))
}

fn check_agno(geo: &Geometry, agno: AgNumber) -> Result<()> {
    if agno.0 < geo.ag_count {
        Ok(())
    } else {
        Err(AgfsError::InvalidArgument(format!(
            "allocation group {} out of range",
            agno.0
        )))
    }
}

/// AGs to try, in order, with the request type for each.
fn plan(geo: &Geometry, target: AllocTarget) -> Result<Vec<(AgNumber, AgAllocType)>> {
    let count = geo.ag_count;
    let anywhere = AgAllocType::Anywhere { near: None };
    let rotate = |first: AgNumber| (1..count).map(move |i| AgNumber((first.0 + i) % count));
    Ok(match target {
        AllocTarget::ThisAg(agno) => {
            check_agno(geo, agno)?;
            vec![(agno, anywhere)]
        }
        AllocTarget::StartAg(agno) => {
            check_agno(geo, agno)?;
            std::iter::once(agno)
                .chain(rotate(agno))
                .map(|ag| (ag, anywhere))
                .collect()
        }
        AllocTarget::NearBlock(fsb) => {
            let (agno, agbno) = split_fsb(geo, fsb)?;
            std::iter::once((agno, AgAllocType::Near(agbno)))
                .chain(rotate(agno).map(|ag| (ag, anywhere)))
                .collect()
        }
        AllocTarget::ExactBlock(fsb) => {
            let (agno, agbno) = split_fsb(geo, fsb)?;
            vec![(agno, AgAllocType::Exact(agbno))]
        }
    })
}

/// Allocate an extent somewhere on the volume. `Ok(None)` when no AG the
/// target allows could satisfy `min_len`.
pub fn alloc_vextent(
    tp: &mut Transaction,
    locks: &mut AgLockSet<'_>,
    args: &AllocArgs,
) -> Result<Option<AgExtent>> {
    let geo = *tp.geometry();
    for (agno, kind) in plan(&geo, args.target)? {
        if !locks.lock(agno)? {
            continue;
        }
        if let Some(ext) = alloc_in_ag(tp, agno, &args.request(kind))? {
            debug!(
                agno = agno.0,
                agbno = ext.start.0,
                len = ext.len,
                fsb = ext.fsb(&geo).0,
                target = ?args.target,
                "alloc_vextent_done"
            );
            return Ok(Some(ext));
        }
        if !tp.is_joined(agf::agf_fsb(tp, agno)) {
            locks.unlock(agno);
        }
    }
    debug!(target = ?args.target, min_len = args.min_len, "alloc_vextent_no_space");
    Ok(None)
}

/// Free `len` blocks at `fsb`. The extent must lie inside one AG.
pub fn free_extent(
    tp: &mut Transaction,
    locks: &mut AgLockSet<'_>,
    fsb: BlockNumber,
    len: u32,
) -> Result<()> {
    let geo = *tp.geometry();
    let (agno, agbno) = split_fsb(&geo, fsb)?;
    if u64::from(agbno.0) + u64::from(len) > u64::from(geo.ag_blocks_of(agno)) {
        return Err(AgfsError::InvalidArgument(format!(
            "extent {}+{len} crosses the end of AG {}",
            fsb.0, agno.0
        )));
    }
    if !locks.lock(agno)? {
        return Err(AgfsError::Busy(format!("allocation group {} is locked", agno.0)));
    }
    free_in_ag(tp, agno, agbno, len)
}
