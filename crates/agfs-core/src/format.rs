//! Laying down a fresh volume.
//!
//! Every AG gets the same layout:
//!
//! | AG block | Contents |
//! |----------|----------|
//! | 0 | superblock copy |
//! | 1 | AGF |
//! | 2 | AGI |
//! | 3 | AGFL |
//! | 4 | by-block free-space tree root |
//! | 5 | by-size free-space tree root |
//! | 6 | inode tree root |
//! | 7.. | initial free list, then one free extent to the end of the AG |

use crate::options::FormatParams;
use agfs_alloc::{init_free_space, initial_freelist};
use agfs_block::{BlockDevice, BufCache};
use agfs_error::{AgfsError, Result};
use agfs_inode::init_inodes;
use agfs_ondisk::sb::MIN_AG_BLOCKS;
use agfs_ondisk::{Agf, AllocRec, Geometry, PREALLOC_BLOCKS, SB_AGBLOCK, Superblock};
use agfs_trans::{
    Log, MemLog, SbCounterSnapshot, TransConfig, TransManager, TransRes, Transaction,
};
use agfs_types::{AgBlock, AgNumber};
use std::sync::Arc;
use tracing::{debug, info};

const FORMAT_CACHE_BLOCKS: usize = 1024;
const FORMAT_LOG_BYTES: u64 = 16 << 20;
/// Buffers one AG initialisation dirties: AGF, AGFL, AGI and three roots.
const AG_INIT_BUFS: u64 = 8;

/// Superblock for `params` on a device of `block_count` blocks.
pub fn plan_superblock(
    block_size: u32,
    block_count: u64,
    params: &FormatParams,
) -> Result<Superblock> {
    if block_size != params.block_size {
        return Err(AgfsError::InvalidGeometry(format!(
            "device block size {block_size} differs from requested {}",
            params.block_size
        )));
    }
    let ag_blocks = params.ag_blocks;
    if ag_blocks < MIN_AG_BLOCKS {
        return Err(AgfsError::InvalidGeometry(format!(
            "ag_blocks {ag_blocks} below the minimum of {MIN_AG_BLOCKS}"
        )));
    }
    let per_ag = u64::from(ag_blocks);
    let ag_count = match params.ag_count {
        Some(count) => u64::from(count),
        None if block_count % per_ag >= u64::from(MIN_AG_BLOCKS) => block_count / per_ag + 1,
        None => block_count / per_ag,
    };
    let ag_count = u32::try_from(ag_count)
        .map_err(|_| AgfsError::InvalidGeometry(format!("{ag_count} allocation groups")))?;
    if ag_count == 0 {
        return Err(AgfsError::InvalidGeometry(format!(
            "{block_count} blocks hold no allocation group of {ag_blocks} blocks"
        )));
    }
    let data_blocks = block_count.min(u64::from(ag_count) * per_ag);

    let mut sb = Superblock::for_volume(
        params.block_size,
        params.inode_size,
        ag_blocks,
        ag_count,
        data_blocks,
    );
    sb.inode_cluster_size = params.inode_cluster_size;
    if !params.align_inodes {
        sb.inode_align = 0;
    }
    // Geometry runs the superblock checks plus the derived ones.
    Geometry::from_superblock(&sb).map_err(|err| AgfsError::InvalidGeometry(err.to_string()))?;
    Ok(sb)
}

fn init_ag(tp: &mut Transaction, agno: AgNumber) -> Result<Agf> {
    let geo = *tp.geometry();
    let freelist = initial_freelist(&geo, PREALLOC_BLOCKS);
    let first_free = PREALLOC_BLOCKS + u32::try_from(freelist.len()).unwrap_or(u32::MAX);
    let ag_len = geo.ag_blocks_of(agno);
    let free = if first_free < ag_len {
        vec![AllocRec::new(first_free, ag_len - first_free)]
    } else {
        Vec::new()
    };
    let agf = init_free_space(tp, agno, &free, &freelist)?;
    init_inodes(tp, agno)?;
    Ok(agf)
}

fn run(
    mgr: &Arc<TransManager>,
    res: &TransRes,
    f: impl FnOnce(&mut Transaction) -> Result<()>,
) -> Result<()> {
    let mut tp = mgr.alloc()?;
    tp.reserve(res, 0, 0)?;
    match f(&mut tp) {
        Ok(()) => tp.commit().map(|_| ()),
        Err(err) => Err(tp.cancel_with(err)),
    }
}

/// Format `dev` and return the superblock written to it.
pub fn format(dev: Arc<dyn BlockDevice>, params: &FormatParams) -> Result<Superblock> {
    let mut sb = plan_superblock(dev.block_size(), dev.block_count(), params)?;
    let geo = Geometry::from_superblock(&sb)
        .map_err(|err| AgfsError::InvalidGeometry(err.to_string()))?;
    let bufs = Arc::new(BufCache::new(dev, FORMAT_CACHE_BLOCKS));
    let log: Arc<dyn Log> = Arc::new(MemLog::new(FORMAT_LOG_BYTES).without_retention());
    let mgr = Arc::new(TransManager::new(
        geo,
        SbCounterSnapshot {
            dblocks: sb.data_blocks,
            ..SbCounterSnapshot::default()
        },
        log,
        Arc::clone(&bufs),
        TransConfig::default(),
    ));
    let sb_res = mgr.resv().sb;
    let ag_res = TransRes {
        log_res: sb_res.log_res * AG_INIT_BUFS,
        ..sb_res
    };

    let mut fdblocks = 0_u64;
    for agno in (0..geo.ag_count).map(AgNumber) {
        run(&mgr, &ag_res, |tp| {
            let agf = init_ag(tp, agno)?;
            fdblocks += u64::from(agf.freeblks) + u64::from(agf.flcount);
            debug!(
                agno = agno.0,
                freeblks = agf.freeblks,
                flcount = agf.flcount,
                "format_ag_done"
            );
            Ok(())
        })?;
    }

    sb.fdblocks = fdblocks;
    for agno in (0..geo.ag_count).map(AgNumber) {
        run(&mgr, &sb_res, |tp| {
            sb.encode(tp.get_buf(geo.agb_to_fsb(agno, AgBlock(SB_AGBLOCK)))?);
            Ok(())
        })?;
    }
    bufs.sync()?;
    info!(
        block_size = sb.block_size,
        ag_blocks = sb.ag_blocks,
        ag_count = sb.ag_count,
        data_blocks = sb.data_blocks,
        fdblocks,
        chunk_blocks = geo.chunk_blocks,
        "format_done"
    );
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ag_blocks: u32) -> FormatParams {
        FormatParams {
            block_size: 512,
            inode_size: 256,
            ag_blocks,
            ..FormatParams::default()
        }
    }

    #[test]
    fn short_tail_ag_is_dropped() {
        let sb = plan_superblock(512, 2 * 1024 + 63, &params(1024)).unwrap();
        assert_eq!(sb.ag_count, 2);
        assert_eq!(sb.data_blocks, 2048);
    }

    #[test]
    fn usable_tail_ag_is_kept() {
        let sb = plan_superblock(512, 2 * 1024 + 64, &params(1024)).unwrap();
        assert_eq!(sb.ag_count, 3);
        assert_eq!(sb.data_blocks, 2112);
    }

    #[test]
    fn explicit_ag_count_caps_the_volume() {
        let p = FormatParams {
            ag_count: Some(2),
            ..params(1024)
        };
        let sb = plan_superblock(512, 8192, &p).unwrap();
        assert_eq!((sb.ag_count, sb.data_blocks), (2, 2048));
    }

    #[test]
    fn bad_geometry_is_rejected() {
        assert!(matches!(
            plan_superblock(4096, 8192, &params(1024)),
            Err(AgfsError::InvalidGeometry(_))
        ));
        assert!(matches!(
            plan_superblock(512, 8192, &params(32)),
            Err(AgfsError::InvalidGeometry(_))
        ));
        assert!(matches!(
            plan_superblock(512, 63, &params(1024)),
            Err(AgfsError::InvalidGeometry(_))
        ));
        let odd_inode = FormatParams {
            inode_size: 300,
            ..params(1024)
        };
        assert!(matches!(
            plan_superblock(512, 8192, &odd_inode),
            Err(AgfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn unaligned_inodes_clear_the_alignment() {
        let p = FormatParams {
            align_inodes: false,
            ..params(1024)
        };
        let sb = plan_superblock(512, 4096, &p).unwrap();
        assert_eq!(sb.inode_align, 0);
    }
}
