//! Keeping the AG free list at the size the next operation needs.
//!
//! A btree insert may split one block per level in each free-space tree, and
//! those blocks come only from the free list. Before any allocation or free
//! the list is topped up to [`Geometry::min_freelist`] for the current tree
//! heights, and anything beyond that is handed back to free space.
//!
//! [`Geometry::min_freelist`]: agfs_ondisk::Geometry::min_freelist

use crate::agf::AgfState;
use crate::extent::{self, AgAllocRequest, AgAllocType, longest_free};
use agfs_error::Result;
use agfs_ondisk::Agf;
use agfs_trans::Transaction;
use agfs_types::AgBlock;
use tracing::{debug, trace};

/// Free list size the next operation on `agf` needs.
#[must_use]
pub fn freelist_need(tp: &Transaction, agf: &Agf) -> u32 {
    tp.geometry().min_freelist(agf.bno_level, agf.cnt_level)
}

/// Whether an allocation of at least `min_len` blocks can succeed in this
/// AG once the free list has been topped up. Reads only the AGF.
#[must_use]
pub fn space_available(tp: &Transaction, agf: &Agf, min_len: u32) -> bool {
    let need = freelist_need(tp, agf);
    let usable = u64::from(agf.freeblks) + u64::from(agf.flcount);
    longest_free(agf, need) >= min_len && usable >= u64::from(need) + u64::from(min_len)
}

/// Top up or drain the free list. With `min_len` set the AG is first
/// checked for room. `false` means the AG cannot serve the request; when
/// the precheck fails nothing has been touched.
pub fn fix_freelist(tp: &mut Transaction, st: &mut AgfState, min_len: Option<u32>) -> Result<bool> {
    if let Some(min_len) = min_len {
        if !space_available(tp, &st.agf, min_len) {
            trace!(
                agno = st.agno.0,
                min_len,
                freeblks = st.agf.freeblks,
                longest = st.agf.longest,
                flcount = st.agf.flcount,
                "alloc_ag_precheck_failed"
            );
            return Ok(false);
        }
    }

    let mut drained = 0_u32;
    while st.agf.flcount > freelist_need(tp, &st.agf) {
        let Some(block) = st.get_freelist(tp)? else {
            break;
        };
        extent::free_extent(tp, st, block, 1)?;
        drained += 1;
    }

    let mut filled = 0_u32;
    loop {
        let need = freelist_need(tp, &st.agf);
        if st.agf.flcount >= need {
            break;
        }
        let want = need - st.agf.flcount;
        let req = AgAllocRequest::new(AgAllocType::Anywhere { near: None }, 1, want);
        let Some(got) = extent::alloc_extent(tp, st, &req)? else {
            debug!(
                agno = st.agno.0,
                need,
                flcount = st.agf.flcount,
                "alloc_freelist_refill_short"
            );
            return Ok(false);
        };
        for offset in 0..got.len {
            st.put_freelist(tp, AgBlock(got.start.0 + offset))?;
        }
        filled += got.len;
    }

    if drained > 0 || filled > 0 {
        debug!(
            agno = st.agno.0,
            drained,
            filled,
            flcount = st.agf.flcount,
            "alloc_freelist_fixed"
        );
    }
    Ok(true)
}
