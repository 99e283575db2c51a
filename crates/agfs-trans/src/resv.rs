//! Worst-case log space and block reservations per operation type.
//!
//! Log reservations are counted in whole buffers: every buffer an
//! operation may dirty is charged its full size plus the per-region
//! headers a fully dirty buffer would produce.

use crate::log::{DELTA_SIZE, DQUOT_ITEM_SIZE, RECORD_FIXED_SIZE, REGION_HEADER_SIZE};
use agfs_ondisk::{Geometry, LOG_CHUNK_SIZE};
use serde::{Deserialize, Serialize};

/// Log reservation for one transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransRes {
    /// Bytes per commit.
    pub log_res: u64,
    /// Commits granted up front.
    pub log_count: u32,
    /// Permanent reservations survive `roll`.
    pub permanent: bool,
}

/// Reservations for every operation the engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResvTable {
    pub create: TransRes,
    pub remove: TransRes,
    pub write: TransRes,
    pub truncate: TransRes,
    pub chown: TransRes,
    pub sb: TransRes,
}

/// Rolls a truncate-style operation is granted before regranting.
pub const TRUNCATE_LOG_COUNT: u32 = 2;
/// Extents one step of a rolling free processes.
pub const FREE_EXTENTS_PER_ROLL: usize = 4;

fn header_bytes() -> u64 {
    (4 + RECORD_FIXED_SIZE + 5 * DELTA_SIZE + 3 * DQUOT_ITEM_SIZE) as u64
}

fn buf_bytes(geo: &Geometry, nbufs: u64) -> u64 {
    let bs = u64::from(geo.block_size);
    let regions = bs / LOG_CHUNK_SIZE as u64;
    nbufs * (bs + regions * REGION_HEADER_SIZE as u64)
}

/// Buffers one extent allocation or free can dirty: AGF, AGFL and every
/// level of both free-space trees, twice over for splits and merges.
fn allocfree_bufs(geo: &Geometry, ops: u64) -> u64 {
    ops * (2 + 2 * (2 * u64::from(geo.alloc_maxlevels) - 1))
}

fn inobt_bufs(geo: &Geometry) -> u64 {
    2 * u64::from(geo.inobt_maxlevels) - 1
}

impl ResvTable {
    #[must_use]
    pub fn new(geo: &Geometry) -> Self {
        let chunk = u64::from(geo.chunk_blocks);
        let inobt_allocs = u64::from(geo.inobt_maxlevels);
        // AGI + inobt + new chunk + the block holding the owner's inode.
        let create_bufs = 1 + inobt_bufs(geo) + chunk + 1 + allocfree_bufs(geo, 1 + inobt_allocs);
        let remove_bufs = 1 + inobt_bufs(geo) + 1 + allocfree_bufs(geo, 1 + inobt_allocs);
        let write_bufs = 1 + allocfree_bufs(geo, 2);
        let truncate_bufs = 1 + allocfree_bufs(geo, FREE_EXTENTS_PER_ROLL as u64);
        let res = |nbufs: u64, log_count: u32, permanent: bool| TransRes {
            log_res: header_bytes() + buf_bytes(geo, nbufs),
            log_count,
            permanent,
        };
        Self {
            create: res(create_bufs, 1, false),
            remove: res(remove_bufs, 1, false),
            write: res(write_bufs, 1, false),
            truncate: res(truncate_bufs, TRUNCATE_LOG_COUNT, true),
            chown: res(1, 1, false),
            sb: res(1, 1, false),
        }
    }
}

/// Blocks a create must reserve: a new chunk plus inode btree splits.
#[must_use]
pub fn create_block_res(geo: &Geometry) -> u64 {
    u64::from(geo.chunk_blocks) + u64::from(geo.inobt_maxlevels)
}

/// Blocks a data allocation of up to `len` blocks must reserve.
#[must_use]
pub fn write_block_res(len: u32) -> u64 {
    u64::from(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agfs_ondisk::{SB_VERSION, Superblock};

    fn geo() -> Geometry {
        Geometry::from_superblock(&Superblock {
            block_size: 4096,
            data_blocks: 4 * 2048,
            rt_extents: 0,
            uuid: [0; 16],
            ag_blocks: 2048,
            ag_count: 4,
            version: SB_VERSION,
            sector_size: 512,
            inode_size: 256,
            inodes_per_block: 16,
            block_log: 12,
            inode_log: 8,
            inopb_log: 4,
            ag_block_log: 11,
            inode_align: 4,
            inode_cluster_size: 8192,
            features: 0,
            icount: 0,
            ifree: 0,
            fdblocks: 0,
            frextents: 0,
        })
        .unwrap()
    }

    #[test]
    fn create_covers_a_fully_logged_chunk() {
        let geo = geo();
        let table = ResvTable::new(&geo);
        let chunk_bytes = u64::from(geo.chunk_blocks) * u64::from(geo.block_size);
        assert!(table.create.log_res > chunk_bytes);
        assert!(!table.create.permanent);
        assert_eq!(create_block_res(&geo), 4 + u64::from(geo.inobt_maxlevels));
    }

    #[test]
    fn truncate_is_permanent_and_rolls() {
        let table = ResvTable::new(&geo());
        assert!(table.truncate.permanent);
        assert_eq!(table.truncate.log_count, TRUNCATE_LOG_COUNT);
        assert!(table.truncate.log_res > table.write.log_res);
    }
}
