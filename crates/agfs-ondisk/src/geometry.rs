//! Geometry derived once from a validated superblock.
//!
//! Address spaces:
//!
//! | Value | Encoding |
//! |-------|----------|
//! | absolute block | `agno * ag_blocks + agbno` (device address) |
//! | AG inode | `agbno << inopb_log \| slot` |
//! | inode number | `agno << (ag_block_log + inopb_log) \| agino` |

use crate::btree::{BtreeKind, RecBounds};
use crate::{AgflBlock, Superblock};
use agfs_types::{
    AgBlock, AgInode, AgNumber, BlockNumber, INODES_PER_CHUNK, InodeNumber, ParseError,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: u32,
    pub block_log: u8,
    pub ag_blocks: u32,
    pub ag_block_log: u8,
    pub ag_count: u32,
    pub data_blocks: u64,
    pub inode_size: u32,
    pub inode_log: u8,
    pub inodes_per_block: u32,
    pub inopb_log: u8,
    /// Blocks backing one 64-inode chunk.
    pub chunk_blocks: u32,
    /// Blocks read or written together when touching one inode.
    pub blocks_per_cluster: u32,
    pub inodes_per_cluster: u32,
    /// Chunk start alignment in blocks (1 when unaligned).
    pub inode_align: u32,
    pub agfl_size: u32,
    pub alloc_maxlevels: u32,
    pub inobt_maxlevels: u32,
    /// Blocks kept out of reach of ordinary reservations.
    pub set_aside: u64,
}

impl Geometry {
    pub fn from_superblock(sb: &Superblock) -> Result<Self, ParseError> {
        sb.validate()?;
        let inodes_per_block = u32::from(sb.inodes_per_block);
        let chunk_blocks = (INODES_PER_CHUNK / inodes_per_block).max(1);
        let cluster_blocks = (sb.inode_cluster_size / sb.block_size).max(1);
        let blocks_per_cluster = chunk_blocks.min(cluster_blocks);
        let inode_align = sb.inode_align.max(1);
        if inode_align > 1 && inode_align < chunk_blocks {
            return Err(ParseError::InvalidField {
                field: "inoalignmt",
                reason: "alignment smaller than one inode chunk",
            });
        }
        if u32::from(sb.ag_block_log) + u32::from(sb.inopb_log) > 32 {
            return Err(ParseError::InvalidField {
                field: "agblklog",
                reason: "AG inode numbers do not fit in 32 bits",
            });
        }
        let ag_inodes = u64::from(sb.ag_blocks) * u64::from(inodes_per_block);
        Ok(Self {
            block_size: sb.block_size,
            block_log: sb.block_log,
            ag_blocks: sb.ag_blocks,
            ag_block_log: sb.ag_block_log,
            ag_count: sb.ag_count,
            data_blocks: sb.data_blocks,
            inode_size: u32::from(sb.inode_size),
            inode_log: sb.inode_log,
            inodes_per_block,
            inopb_log: sb.inopb_log,
            chunk_blocks,
            blocks_per_cluster,
            inodes_per_cluster: blocks_per_cluster * inodes_per_block,
            inode_align,
            agfl_size: AgflBlock::capacity(sb.block_size),
            alloc_maxlevels: BtreeKind::Bno
                .max_levels(sb.block_size, u64::from(sb.ag_blocks).div_ceil(2)),
            inobt_maxlevels: BtreeKind::Ino
                .max_levels(sb.block_size, ag_inodes / u64::from(INODES_PER_CHUNK)),
            set_aside: 4 + 4 * u64::from(sb.ag_count),
        })
    }

    /// Length of `agno`; the last AG may be shorter than `ag_blocks`.
    #[must_use]
    pub fn ag_blocks_of(&self, agno: AgNumber) -> u32 {
        if agno.0 + 1 < self.ag_count {
            return self.ag_blocks;
        }
        let before = u64::from(self.ag_count - 1) * u64::from(self.ag_blocks);
        let tail = self.data_blocks.saturating_sub(before);
        // validate() bounds data_blocks by ag_count * ag_blocks.
        #[expect(clippy::cast_possible_truncation)]
        let tail = tail.min(u64::from(self.ag_blocks)) as u32;
        tail
    }

    // ── Block addresses ─────────────────────────────────────────────────────

    #[must_use]
    pub fn agb_to_fsb(&self, agno: AgNumber, agbno: AgBlock) -> BlockNumber {
        BlockNumber(u64::from(agno.0) * u64::from(self.ag_blocks) + u64::from(agbno.0))
    }

    /// Split an absolute block address; `None` past the end of the volume.
    #[must_use]
    pub fn fsb_to_ag(&self, fsb: BlockNumber) -> Option<(AgNumber, AgBlock)> {
        if fsb.0 >= self.data_blocks {
            return None;
        }
        let agno = u32::try_from(fsb.0 / u64::from(self.ag_blocks)).ok()?;
        let agbno = u32::try_from(fsb.0 % u64::from(self.ag_blocks)).ok()?;
        Some((AgNumber(agno), AgBlock(agbno)))
    }

    // ── Inode numbers ───────────────────────────────────────────────────────

    #[must_use]
    pub fn agino_bits(&self) -> u32 {
        u32::from(self.ag_block_log) + u32::from(self.inopb_log)
    }

    #[must_use]
    pub fn agbno_to_agino(&self, agbno: AgBlock, slot: u32) -> AgInode {
        AgInode((agbno.0 << self.inopb_log) | slot)
    }

    #[must_use]
    pub fn agino_to_agbno(&self, agino: AgInode) -> AgBlock {
        AgBlock(agino.0 >> self.inopb_log)
    }

    /// Slot of the inode within its block.
    #[must_use]
    pub fn agino_to_slot(&self, agino: AgInode) -> u32 {
        agino.0 & (self.inodes_per_block - 1)
    }

    #[must_use]
    pub fn ino_of(&self, agno: AgNumber, agino: AgInode) -> InodeNumber {
        InodeNumber((u64::from(agno.0) << self.agino_bits()) | u64::from(agino.0))
    }

    /// Split an inode number; `None` when it names no inode of this volume.
    #[must_use]
    pub fn ino_to_ag(&self, ino: InodeNumber) -> Option<(AgNumber, AgInode)> {
        let bits = self.agino_bits();
        let agno = u32::try_from(ino.0 >> bits).ok()?;
        if agno >= self.ag_count {
            return None;
        }
        let mask = if bits >= 64 { u64::MAX } else { (1_u64 << bits) - 1 };
        let agino = u32::try_from(ino.0 & mask).ok()?;
        let agbno = agino >> self.inopb_log;
        if agbno >= self.ag_blocks_of(AgNumber(agno)) {
            return None;
        }
        Some((AgNumber(agno), AgInode(agino)))
    }

    // ── Inode chunk and cluster layout ─────────────────────────────────────

    /// Start of the cluster containing `agbno`, relative to its chunk.
    #[must_use]
    pub fn cluster_start(&self, chunk_agbno: AgBlock, agbno: AgBlock) -> AgBlock {
        let offset = agbno.0 - chunk_agbno.0;
        AgBlock(chunk_agbno.0 + offset / self.blocks_per_cluster * self.blocks_per_cluster)
    }

    /// Alignment-derived chunk start for `agino` when chunks are aligned to
    /// at least one chunk; `None` when a btree lookup is required.
    #[must_use]
    pub fn aligned_chunk_start(&self, agino: AgInode) -> Option<AgBlock> {
        if self.inode_align < self.chunk_blocks {
            return None;
        }
        let agbno = self.agino_to_agbno(agino).0;
        Some(AgBlock(agbno - agbno % self.chunk_blocks))
    }

    /// Limits for records decoded from the trees of `agno`.
    #[must_use]
    pub fn rec_bounds(&self, agno: AgNumber) -> RecBounds {
        let ag_blocks = self.ag_blocks_of(agno);
        RecBounds {
            ag_blocks,
            ag_inodes: u64::from(ag_blocks) << self.inopb_log,
            chunk_ino_align: u64::from(self.inode_align) << self.inopb_log,
        }
    }

    /// Blocks the free list must hold before one operation on an AG whose
    /// trees have the given heights.
    #[must_use]
    pub fn min_freelist(&self, bno_level: u32, cnt_level: u32) -> u32 {
        let max = self.alloc_maxlevels;
        (bno_level + 1).min(max) + (cnt_level + 1).min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SB_VERSION;

    fn sb() -> Superblock {
        Superblock {
            block_size: 4096,
            data_blocks: 3 * 1024 + 600,
            rt_extents: 0,
            uuid: [1; 16],
            ag_blocks: 1024,
            ag_count: 4,
            version: SB_VERSION,
            sector_size: 512,
            inode_size: 512,
            inodes_per_block: 8,
            block_log: 12,
            inode_log: 9,
            inopb_log: 3,
            ag_block_log: 10,
            inode_align: 8,
            inode_cluster_size: 16384,
            features: 0,
            icount: 0,
            ifree: 0,
            fdblocks: 0,
            frextents: 0,
        }
    }

    #[test]
    fn derived_inode_layout() {
        let geo = Geometry::from_superblock(&sb()).unwrap();
        assert_eq!(geo.chunk_blocks, 8);
        assert_eq!(geo.blocks_per_cluster, 4);
        assert_eq!(geo.inodes_per_cluster, 32);
        assert_eq!(geo.agfl_size, 1020);
        assert_eq!(geo.set_aside, 20);
        assert_eq!(geo.agino_bits(), 13);
    }

    #[test]
    fn last_ag_is_short() {
        let geo = Geometry::from_superblock(&sb()).unwrap();
        assert_eq!(geo.ag_blocks_of(AgNumber(0)), 1024);
        assert_eq!(geo.ag_blocks_of(AgNumber(3)), 600);
    }

    #[test]
    fn inode_numbers_decompose() {
        let geo = Geometry::from_superblock(&sb()).unwrap();
        let agino = geo.agbno_to_agino(AgBlock(17), 5);
        let ino = geo.ino_of(AgNumber(2), agino);
        assert_eq!(geo.ino_to_ag(ino), Some((AgNumber(2), agino)));
        assert_eq!(geo.agino_to_agbno(agino), AgBlock(17));
        assert_eq!(geo.agino_to_slot(agino), 5);
        // AG 3 is only 600 blocks long.
        let past = geo.ino_of(AgNumber(3), geo.agbno_to_agino(AgBlock(700), 0));
        assert_eq!(geo.ino_to_ag(past), None);
        assert_eq!(geo.ino_to_ag(geo.ino_of(AgNumber(9), AgInode(0))), None);
    }

    #[test]
    fn block_addresses_decompose() {
        let geo = Geometry::from_superblock(&sb()).unwrap();
        let fsb = geo.agb_to_fsb(AgNumber(1), AgBlock(5));
        assert_eq!(fsb, BlockNumber(1029));
        assert_eq!(geo.fsb_to_ag(fsb), Some((AgNumber(1), AgBlock(5))));
        assert_eq!(geo.fsb_to_ag(BlockNumber(geo.data_blocks)), None);
    }

    #[test]
    fn cluster_and_alignment() {
        let geo = Geometry::from_superblock(&sb()).unwrap();
        assert_eq!(geo.cluster_start(AgBlock(64), AgBlock(70)), AgBlock(68));
        let agino = geo.agbno_to_agino(AgBlock(70), 3);
        assert_eq!(geo.aligned_chunk_start(agino), Some(AgBlock(64)));

        let mut unaligned = sb();
        unaligned.inode_align = 0;
        let geo = Geometry::from_superblock(&unaligned).unwrap();
        assert_eq!(geo.aligned_chunk_start(agino), None);
    }

    #[test]
    fn record_bounds_follow_the_alignment() {
        let geo = Geometry::from_superblock(&sb()).unwrap();
        let bounds = geo.rec_bounds(AgNumber(3));
        assert_eq!(bounds.ag_blocks, 600);
        assert_eq!(bounds.ag_inodes, 600 * 8);
        assert_eq!(bounds.chunk_ino_align, 64);

        let mut unaligned = sb();
        unaligned.inode_align = 0;
        let geo = Geometry::from_superblock(&unaligned).unwrap();
        assert_eq!(geo.rec_bounds(AgNumber(0)).chunk_ino_align, 8);
    }

    #[test]
    fn alignment_below_chunk_rejected() {
        let mut bad = sb();
        bad.inode_align = 2;
        assert!(Geometry::from_superblock(&bad).is_err());
    }

    #[test]
    fn min_freelist_caps_at_max_levels() {
        let geo = Geometry::from_superblock(&sb()).unwrap();
        assert_eq!(geo.min_freelist(1, 1), 4.min(2 * geo.alloc_maxlevels));
        let max = geo.alloc_maxlevels;
        assert_eq!(geo.min_freelist(max, max), 2 * max);
    }
}
