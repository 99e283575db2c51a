//! Free-space scrub for one allocation group.

use crate::agf::{AgfState, FIRST_DATA_AGBLOCK};
use agfs_btree::verify_tree;
use agfs_error::Result;
use agfs_ondisk::{AllocRec, BtreeKind};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceReport {
    pub agno: AgNumber,
    /// Free extents in block order.
    pub extents: Vec<AllocRec>,
    pub freeblks: u32,
    pub longest: u32,
    pub freelist: Vec<AgBlock>,
    /// Blocks of both free-space trees.
    pub btree_blocks: Vec<AgBlock>,
}

impl FreeSpaceReport {
    /// Blocks this AG contributes to the global free block count.
    #[must_use]
    pub fn counted_free(&self) -> u64 {
        let tree_extra = self.btree_blocks.len().saturating_sub(2);
        u64::from(self.freeblks) + self.freelist.len() as u64 + tree_extra as u64
    }
}

/// Check both free-space trees of `agno` against each other and against
/// the AGF: identical extent sets, no overlapping or touching extents,
/// cached `freeblks`, `longest` and `btreeblks`, and a free list that holds
/// no free or btree block twice.
pub fn verify_ag(tp: &mut Transaction, agno: AgNumber) -> Result<FreeSpaceReport> {
    let mut st = AgfState::read(tp, agno)?;
    let bno = verify_tree(tp, &st.tree(BtreeKind::Bno))?;
    let cnt = verify_tree(tp, &st.tree(BtreeKind::Cnt))?;

    let by_bno: Vec<AllocRec> = bno.records.iter().filter_map(|r| r.alloc()).collect();
    let mut by_cnt: Vec<AllocRec> = cnt.records.iter().filter_map(|r| r.alloc()).collect();
    by_cnt.sort_unstable_by_key(|r| r.start);
    if by_bno != by_cnt {
        return Err(st.corrupt(
            tp,
            format!(
                "by-bno tree holds {} extents, by-size tree {} and they differ",
                by_bno.len(),
                by_cnt.len()
            ),
        ));
    }

    let length = st.agf.length;
    let mut total = 0_u64;
    let mut longest = 0;
    for (i, rec) in by_bno.iter().enumerate() {
        if rec.start < FIRST_DATA_AGBLOCK || u64::from(rec.start) + u64::from(rec.len) > u64::from(length) {
            return Err(st.corrupt(tp, format!("free extent {rec} outside the AG")));
        }
        if let Some(next) = by_bno.get(i + 1) {
            if rec.end() >= next.start {
                return Err(st.corrupt(
                    tp,
                    format!("free extents {rec} and {next} overlap or touch"),
                ));
            }
        }
        total += u64::from(rec.len);
        longest = longest.max(rec.len);
    }
    if total != u64::from(st.agf.freeblks) {
        return Err(st.corrupt(
            tp,
            format!("freeblks {} but trees hold {total}", st.agf.freeblks),
        ));
    }
    if longest != st.agf.longest {
        return Err(st.corrupt(
            tp,
            format!("longest {} but largest extent is {longest}", st.agf.longest),
        ));
    }

    let mut btree_blocks = bno.blocks.clone();
    btree_blocks.extend(cnt.blocks.iter().copied());
    let tree_extra = btree_blocks.len() - 2;
    if tree_extra != st.agf.btreeblks as usize {
        return Err(st.corrupt(
            tp,
            format!("btreeblks {} but trees use {tree_extra} extra", st.agf.btreeblks),
        ));
    }

    let freelist = st.freelist_blocks(tp)?;
    let mut owned: BTreeSet<AgBlock> = BTreeSet::new();
    for block in btree_blocks.iter().chain(freelist.iter()) {
        if !owned.insert(*block) {
            return Err(st.corrupt(tp, format!("block {} owned twice", block.0)));
        }
        let inside = by_bno
            .iter()
            .any(|r| block.0 >= r.start && block.0 < r.end());
        if inside {
            return Err(st.corrupt(tp, format!("block {} is in use and free", block.0)));
        }
    }

    debug!(
        agno = agno.0,
        extents = by_bno.len(),
        freeblks = st.agf.freeblks,
        longest,
        flcount = freelist.len(),
        "alloc_ag_verified"
    );
    Ok(FreeSpaceReport {
        agno,
        extents: by_bno,
        freeblks: st.agf.freeblks,
        longest,
        freelist,
        btree_blocks,
    })
}
