//! Superblock codec.
//!
//! ```text
//! 0x00 magic          u32   0x3C inoalignmt     u32
//! 0x04 blocksize      u32   0x40 inode_cluster  u32
//! 0x08 dblocks        u64   0x44 features       u32
//! 0x10 rextents       u64   0x48 icount         u64
//! 0x18 uuid           [16]  0x50 ifree          u64
//! 0x28 agblocks       u32   0x58 fdblocks       u64
//! 0x2C agcount        u32   0x60 frextents      u64
//! 0x30 versionnum     u16
//! 0x32 sectsize       u16
//! 0x34 inodesize      u16
//! 0x36 inopblock      u16
//! 0x38 blocklog/inodelog/inopblog/agblklog  u8 x4
//! ```

use crate::{PREALLOC_BLOCKS, SB_MAGIC, SB_VERSION};
use agfs_types::{
    INODES_PER_CHUNK, ParseError, log2_roundup, put_be_u16, put_be_u32, put_be_u64, read_be_u16,
    read_be_u32, read_be_u64, read_fixed,
};
use serde::{Deserialize, Serialize};

pub const SB_ENCODED_SIZE: usize = 0x68;

/// Smallest AG this engine will mount: the fixed headers plus one inode chunk.
pub const MIN_AG_BLOCKS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: u32,
    pub data_blocks: u64,
    pub rt_extents: u64,
    pub uuid: [u8; 16],
    pub ag_blocks: u32,
    pub ag_count: u32,
    pub version: u16,
    pub sector_size: u16,
    pub inode_size: u16,
    pub inodes_per_block: u16,
    pub block_log: u8,
    pub inode_log: u8,
    pub inopb_log: u8,
    pub ag_block_log: u8,
    /// Inode chunk alignment in blocks; 0 means chunks are not aligned.
    pub inode_align: u32,
    pub inode_cluster_size: u32,
    pub features: u32,
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
    pub frextents: u64,
}

impl Superblock {
    /// Superblock for a fresh volume. Log fields are derived from the
    /// sizes, chunks are aligned to their own length and counters start at
    /// zero; `validate` still has the final say.
    #[must_use]
    pub fn for_volume(
        block_size: u32,
        inode_size: u16,
        ag_blocks: u32,
        ag_count: u32,
        data_blocks: u64,
    ) -> Self {
        let inopb = block_size.checked_div(u32::from(inode_size)).unwrap_or(0);
        let chunk_blocks = INODES_PER_CHUNK.checked_div(inopb).unwrap_or(1).max(1);
        Self {
            block_size,
            data_blocks,
            rt_extents: 0,
            uuid: [0; 16],
            ag_blocks,
            ag_count,
            version: SB_VERSION,
            sector_size: 512,
            inode_size,
            inodes_per_block: u16::try_from(inopb).unwrap_or(0),
            block_log: log2_roundup(block_size),
            inode_log: log2_roundup(u32::from(inode_size)),
            inopb_log: log2_roundup(inopb),
            ag_block_log: log2_roundup(ag_blocks),
            inode_align: chunk_blocks,
            inode_cluster_size: 8192,
            features: 0,
            icount: 0,
            ifree: 0,
            fdblocks: 0,
            frextents: 0,
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(bytes, 0x00)?;
        if magic != SB_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SB_MAGIC),
                actual: u64::from(magic),
            });
        }
        let raw = read_fixed::<4>(bytes, 0x38)?;
        Ok(Self {
            block_size: read_be_u32(bytes, 0x04)?,
            data_blocks: read_be_u64(bytes, 0x08)?,
            rt_extents: read_be_u64(bytes, 0x10)?,
            uuid: read_fixed::<16>(bytes, 0x18)?,
            ag_blocks: read_be_u32(bytes, 0x28)?,
            ag_count: read_be_u32(bytes, 0x2C)?,
            version: read_be_u16(bytes, 0x30)?,
            sector_size: read_be_u16(bytes, 0x32)?,
            inode_size: read_be_u16(bytes, 0x34)?,
            inodes_per_block: read_be_u16(bytes, 0x36)?,
            block_log: raw[0],
            inode_log: raw[1],
            inopb_log: raw[2],
            ag_block_log: raw[3],
            inode_align: read_be_u32(bytes, 0x3C)?,
            inode_cluster_size: read_be_u32(bytes, 0x40)?,
            features: read_be_u32(bytes, 0x44)?,
            icount: read_be_u64(bytes, 0x48)?,
            ifree: read_be_u64(bytes, 0x50)?,
            fdblocks: read_be_u64(bytes, 0x58)?,
            frextents: read_be_u64(bytes, 0x60)?,
        })
    }

    /// Encode into the start of `buf` (`buf.len() >= SB_ENCODED_SIZE`).
    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0x00, SB_MAGIC);
        put_be_u32(buf, 0x04, self.block_size);
        put_be_u64(buf, 0x08, self.data_blocks);
        put_be_u64(buf, 0x10, self.rt_extents);
        buf[0x18..0x28].copy_from_slice(&self.uuid);
        put_be_u32(buf, 0x28, self.ag_blocks);
        put_be_u32(buf, 0x2C, self.ag_count);
        put_be_u16(buf, 0x30, self.version);
        put_be_u16(buf, 0x32, self.sector_size);
        put_be_u16(buf, 0x34, self.inode_size);
        put_be_u16(buf, 0x36, self.inodes_per_block);
        buf[0x38] = self.block_log;
        buf[0x39] = self.inode_log;
        buf[0x3A] = self.inopb_log;
        buf[0x3B] = self.ag_block_log;
        put_be_u32(buf, 0x3C, self.inode_align);
        put_be_u32(buf, 0x40, self.inode_cluster_size);
        put_be_u32(buf, 0x44, self.features);
        put_be_u64(buf, 0x48, self.icount);
        put_be_u64(buf, 0x50, self.ifree);
        put_be_u64(buf, 0x58, self.fdblocks);
        put_be_u64(buf, 0x60, self.frextents);
    }

    /// Mount-time structural validation.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.version != SB_VERSION {
            return Err(ParseError::InvalidField {
                field: "versionnum",
                reason: "unsupported superblock version",
            });
        }
        if !self.block_size.is_power_of_two() || !(512..=65536).contains(&self.block_size) {
            return Err(ParseError::InvalidField {
                field: "blocksize",
                reason: "must be power of two in 512..=65536",
            });
        }
        if u32::from(self.block_log) != self.block_size.trailing_zeros() {
            return Err(ParseError::InvalidField {
                field: "blocklog",
                reason: "does not match blocksize",
            });
        }
        if !self.inode_size.is_power_of_two() || !(256..=2048).contains(&self.inode_size) {
            return Err(ParseError::InvalidField {
                field: "inodesize",
                reason: "must be power of two in 256..=2048",
            });
        }
        if u32::from(self.inode_log) != u32::from(self.inode_size).trailing_zeros() {
            return Err(ParseError::InvalidField {
                field: "inodelog",
                reason: "does not match inodesize",
            });
        }
        let inopb = self.block_size / u32::from(self.inode_size);
        if inopb == 0 || u32::from(self.inodes_per_block) != inopb {
            return Err(ParseError::InvalidField {
                field: "inopblock",
                reason: "does not match blocksize / inodesize",
            });
        }
        if inopb > INODES_PER_CHUNK {
            return Err(ParseError::InvalidField {
                field: "inopblock",
                reason: "more inodes per block than one chunk holds",
            });
        }
        if u32::from(self.inopb_log) != inopb.trailing_zeros() {
            return Err(ParseError::InvalidField {
                field: "inopblog",
                reason: "does not match inopblock",
            });
        }
        if self.ag_count == 0 {
            return Err(ParseError::InvalidField {
                field: "agcount",
                reason: "must be non-zero",
            });
        }
        if self.ag_blocks < MIN_AG_BLOCKS.max(PREALLOC_BLOCKS) {
            return Err(ParseError::InvalidField {
                field: "agblocks",
                reason: "allocation group too small",
            });
        }
        if self.ag_block_log != log2_roundup(self.ag_blocks) {
            return Err(ParseError::InvalidField {
                field: "agblklog",
                reason: "does not match agblocks",
            });
        }
        let max_blocks = u64::from(self.ag_count) * u64::from(self.ag_blocks);
        let min_blocks = u64::from(self.ag_count - 1) * u64::from(self.ag_blocks)
            + u64::from(MIN_AG_BLOCKS);
        if self.data_blocks > max_blocks || self.data_blocks < min_blocks {
            return Err(ParseError::InvalidField {
                field: "dblocks",
                reason: "inconsistent with agcount * agblocks",
            });
        }
        if self.inode_align != 0 && !self.inode_align.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "inoalignmt",
                reason: "must be zero or a power of two",
            });
        }
        if self.inode_cluster_size == 0 || !self.inode_cluster_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "inode_cluster_size",
                reason: "must be a power of two",
            });
        }
        if self.ifree > self.icount {
            return Err(ParseError::InvalidField {
                field: "ifree",
                reason: "more free inodes than allocated inodes",
            });
        }
        if self.fdblocks > self.data_blocks {
            return Err(ParseError::InvalidField {
                field: "fdblocks",
                reason: "more free blocks than data blocks",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Superblock {
        Superblock {
            block_size: 4096,
            data_blocks: 4 * 1024,
            rt_extents: 0,
            uuid: [0xAB; 16],
            ag_blocks: 1024,
            ag_count: 4,
            version: SB_VERSION,
            sector_size: 512,
            inode_size: 256,
            inodes_per_block: 16,
            block_log: 12,
            inode_log: 8,
            inopb_log: 4,
            ag_block_log: 10,
            inode_align: 4,
            inode_cluster_size: 8192,
            features: 0,
            icount: 64,
            ifree: 60,
            fdblocks: 4000,
            frextents: 0,
        }
    }

    #[test]
    fn encode_then_parse_preserves_fields() {
        let sb = sample();
        let mut buf = vec![0_u8; 4096];
        sb.encode(&mut buf);
        assert_eq!(&buf[0..4], b"XFSB");
        let parsed = Superblock::parse_from_bytes(&buf).unwrap();
        assert_eq!(parsed, sb);
        parsed.validate().unwrap();
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut buf = vec![0_u8; 512];
        sample().encode(&mut buf);
        buf[0] = b'Y';
        assert!(matches!(
            Superblock::parse_from_bytes(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn validate_catches_inconsistent_geometry() {
        let mut sb = sample();
        sb.inodes_per_block = 8;
        assert!(sb.validate().is_err());

        let mut sb = sample();
        sb.ag_block_log = 9;
        assert!(sb.validate().is_err());

        let mut sb = sample();
        sb.data_blocks = 5 * 1024;
        assert!(sb.validate().is_err());

        let mut sb = sample();
        sb.ifree = 65;
        assert!(sb.validate().is_err());

        let mut sb = sample();
        sb.block_size = 65536;
        sb.block_log = 16;
        sb.inodes_per_block = 256;
        sb.inopb_log = 8;
        assert!(sb.validate().is_err(), "256 inodes per block exceeds a chunk");
    }

    #[test]
    fn for_volume_derives_consistent_logs() {
        let sb = Superblock::for_volume(4096, 256, 1000, 3, 2900);
        sb.validate().unwrap();
        assert_eq!(sb.block_log, 12);
        assert_eq!(sb.inodes_per_block, 16);
        assert_eq!(sb.inopb_log, 4);
        assert_eq!(sb.ag_block_log, 10);
        assert_eq!(sb.inode_align, 4);
    }
}
