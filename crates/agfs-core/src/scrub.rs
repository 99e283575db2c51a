//! Whole-volume scrub.
//!
//! Each AG's free-space trees and inode tree are checked on their own by
//! the allocator crates. On top of that the scrub checks that no block is
//! claimed twice across the AG's metadata (headers, free extents, free
//! list, tree blocks and inode chunks), and, when no other transaction is
//! running, that the summary counters equal the sums over all AGs.
//!
//! The scrub only reads: a failure is reported, it does not shut the
//! filesystem down.

use crate::Filesystem;
use agfs_alloc::{AgLockSet, FIRST_DATA_AGBLOCK, FreeSpaceReport, verify_ag};
use agfs_error::{AgfsError, Result};
use agfs_inode::{InodeTreeReport, verify_inobt};
use agfs_ondisk::{AllocRec, Geometry};
use agfs_trans::{SbField, Transaction};
use agfs_types::{AgBlock, AgNumber};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgReport {
    pub free: FreeSpaceReport,
    pub inodes: InodeTreeReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub ags: Vec<AgReport>,
    /// Sums over all AGs.
    pub fdblocks: u64,
    pub icount: u64,
    pub ifree: u64,
    /// Whether the summary counters were compared (only when idle).
    pub counters_checked: bool,
}

/// Who claims each block of one AG.
struct Claims {
    agno: AgNumber,
    owner: Vec<Option<&'static str>>,
}

impl Claims {
    fn new(agno: AgNumber, len: u32) -> Self {
        Self {
            agno,
            owner: vec![None; len as usize],
        }
    }

    fn claim(&mut self, geo: &Geometry, what: &'static str, start: u32, len: u32) -> Result<()> {
        for agbno in start..start.saturating_add(len) {
            let fsb = geo.agb_to_fsb(self.agno, AgBlock(agbno)).0;
            let Some(slot) = self.owner.get_mut(agbno as usize) else {
                return Err(AgfsError::corruption(
                    fsb,
                    format!("{what} block {agbno} past the end of the AG"),
                ));
            };
            if let Some(prev) = slot.replace(what) {
                error!(
                    agno = self.agno.0,
                    agbno,
                    first = prev,
                    second = what,
                    invariant = "ag_blocks_disjoint",
                    "scrub_invariant_violation"
                );
                return Err(AgfsError::corruption(
                    fsb,
                    format!("AG {} block {agbno} claimed as {prev} and as {what}", self.agno.0),
                ));
            }
        }
        Ok(())
    }

    fn claim_blocks(
        &mut self,
        geo: &Geometry,
        what: &'static str,
        blocks: &[AgBlock],
    ) -> Result<()> {
        blocks.iter().try_for_each(|b| self.claim(geo, what, b.0, 1))
    }

    fn claim_extents(
        &mut self,
        geo: &Geometry,
        what: &'static str,
        extents: &[AllocRec],
    ) -> Result<()> {
        extents.iter().try_for_each(|r| self.claim(geo, what, r.start, r.len))
    }
}

fn check_ag(tp: &mut Transaction, agno: AgNumber) -> Result<AgReport> {
    let geo = *tp.geometry();
    let free = verify_ag(tp, agno)?;
    let inodes = verify_inobt(tp, agno)?;

    let mut claims = Claims::new(agno, geo.ag_blocks_of(agno));
    claims.claim(&geo, "header", 0, FIRST_DATA_AGBLOCK)?;
    claims.claim_extents(&geo, "free extent", &free.extents)?;
    claims.claim_blocks(&geo, "free list", &free.freelist)?;
    claims.claim_blocks(&geo, "free-space tree", &free.btree_blocks)?;
    claims.claim_blocks(&geo, "inode tree", &inodes.tree_blocks)?;
    claims.claim_extents(&geo, "inode chunk", &inodes.chunk_extents(&geo))?;
    Ok(AgReport { free, inodes })
}

fn check_counter(tp: &Transaction, field: SbField, summed: u64) -> Result<()> {
    let counted = tp.manager().counters().get(field);
    if counted == summed {
        return Ok(());
    }
    error!(
        field = field.name(),
        counted,
        summed,
        invariant = "summary_counters_match_ags",
        "scrub_invariant_violation"
    );
    Err(AgfsError::corruption(
        0,
        format!("{} is {counted} but the AGs add up to {summed}", field.name()),
    ))
}

impl Filesystem {
    /// Scrub every AG and cross-check the summary counters.
    pub fn verify(&self) -> Result<VerifyReport> {
        let (mut locks, mut tp) = self.begin()?;
        let result = self.verify_in(&mut tp, &mut locks);
        tp.cancel();
        result
    }

    fn verify_in(&self, tp: &mut Transaction, locks: &mut AgLockSet<'_>) -> Result<VerifyReport> {
        let ag_count = tp.geometry().ag_count;
        let mut ags = Vec::with_capacity(ag_count as usize);
        let agnos: Vec<AgNumber> = (0..ag_count).map(AgNumber).collect();
        locks.lock_all(&agnos)?;
        for &agno in &agnos {
            ags.push(check_ag(tp, agno)?);
        }
        let fdblocks: u64 = ags.iter().map(|ag| ag.free.counted_free()).sum();
        let icount: u64 = ags.iter().map(|ag| u64::from(ag.inodes.count)).sum();
        let ifree: u64 = ags.iter().map(|ag| u64::from(ag.inodes.freecount)).sum();

        // With every AG locked, only transactions that do not touch AG
        // metadata can be running; their reservations still skew fdblocks.
        let counters_checked = self.stats().active == 1;
        if counters_checked {
            check_counter(tp, SbField::Fdblocks, fdblocks)?;
            check_counter(tp, SbField::Icount, icount)?;
            check_counter(tp, SbField::Ifree, ifree)?;
        }
        info!(ags = ag_count, fdblocks, icount, ifree, counters_checked, "scrub_done");
        Ok(VerifyReport {
            ags,
            fdblocks,
            icount,
            ifree,
            counters_checked,
        })
    }
}
