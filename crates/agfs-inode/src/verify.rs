//! Inode tree scrub for one allocation group.

use crate::agi::AgiState;
use agfs_alloc::FIRST_DATA_AGBLOCK;
use agfs_btree::verify_tree;
use agfs_error::Result;
use agfs_ondisk::{AllocRec, Geometry, InobtRec};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgInode, AgNumber, INODES_PER_CHUNK};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeTreeReport {
    pub agno: AgNumber,
    /// Chunk records in inode order.
    pub chunks: Vec<InobtRec>,
    pub count: u32,
    pub freecount: u32,
    pub tree_blocks: Vec<AgBlock>,
}

impl InodeTreeReport {
    /// Blocks backing the chunks, in block order.
    #[must_use]
    pub fn chunk_extents(&self, geo: &Geometry) -> Vec<AllocRec> {
        self.chunks
            .iter()
            .map(|rec| AllocRec::new(geo.agino_to_agbno(AgInode(rec.start_ino)).0, geo.chunk_blocks))
            .collect()
    }
}

/// Check the inode tree of `agno`: well-formed blocks, free masks that
/// match their counts, aligned non-overlapping chunks inside the AG, and
/// AGI totals equal to the sums over all chunks.
pub fn verify_inobt(tp: &mut Transaction, agno: AgNumber) -> Result<InodeTreeReport> {
    let geo = *tp.geometry();
    let mut st = AgiState::read(tp, agno)?;
    let tree = verify_tree(tp, &st.tree())?;
    let chunks: Vec<InobtRec> = tree.records.iter().filter_map(|r| r.inode()).collect();
    let ag_len = geo.ag_blocks_of(agno);

    let mut free_total = 0_u64;
    let mut prev_end: Option<u32> = None;
    for rec in &chunks {
        if !rec.mask_consistent() {
            return Err(st.corrupt(
                tp,
                format!(
                    "chunk {} free_count {} but mask {:#018x}",
                    rec.start_ino, rec.free_count, rec.free_mask
                ),
            ));
        }
        let start = AgInode(rec.start_ino);
        let agbno = geo.agino_to_agbno(start);
        if geo.agino_to_slot(start) != 0 || agbno.0 % geo.inode_align != 0 {
            return Err(st.corrupt(tp, format!("chunk {} is misaligned", rec.start_ino)));
        }
        if agbno.0 < FIRST_DATA_AGBLOCK || u64::from(agbno.0) + u64::from(geo.chunk_blocks) > u64::from(ag_len) {
            return Err(st.corrupt(tp, format!("chunk {} outside the AG", rec.start_ino)));
        }
        if let Some(end) = prev_end {
            if agbno.0 < end {
                return Err(st.corrupt(
                    tp,
                    format!("chunk {} overlaps its predecessor", rec.start_ino),
                ));
            }
        }
        prev_end = Some(agbno.0 + geo.chunk_blocks);
        free_total += u64::from(rec.free_mask.count_ones());
    }

    let count = chunks.len() as u64 * u64::from(INODES_PER_CHUNK);
    if count != u64::from(st.agi.count) || free_total != u64::from(st.agi.freecount) {
        return Err(st.corrupt(
            tp,
            format!(
                "AGI counts {} inodes ({} free) but chunks hold {count} ({free_total} free)",
                st.agi.count, st.agi.freecount
            ),
        ));
    }

    debug!(
        agno = agno.0,
        chunks = chunks.len(),
        count,
        free = free_total,
        levels = tree.levels,
        "inobt_verified"
    );
    Ok(InodeTreeReport {
        agno,
        chunks,
        count: st.agi.count,
        freecount: st.agi.freecount,
        tree_blocks: tree.blocks,
    })
}
