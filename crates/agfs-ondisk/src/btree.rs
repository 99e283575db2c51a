//! Btree block headers and the record shapes stored in AG btrees.
//!
//! Short-form blocks (AG-rooted trees) carry 32-bit AG-relative sibling
//! pointers; long-form blocks (trees whose root lives in an inode) carry
//! 64-bit filesystem block pointers.
//!
//! Interior blocks store `maxrecs` key slots followed by `maxrecs` pointer
//! slots, so a pointer's offset depends on the block's capacity rather than
//! its current record count.

use crate::{ABTB_MAGIC, ABTC_MAGIC, IBT_MAGIC};
use agfs_types::{
    INODES_PER_CHUNK, ParseError, put_be_i32, put_be_u16, put_be_u32, put_be_u64, read_be_i32,
    read_be_u16, read_be_u32, read_be_u64,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SHORT_HEADER_SIZE: usize = 16;
pub const LONG_HEADER_SIZE: usize = 24;

/// Size of an AG-relative child pointer in short-form interior blocks.
pub const SHORT_PTR_SIZE: usize = 4;

// ── Headers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortBtreeHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u32,
    pub rightsib: u32,
}

impl ShortBtreeHeader {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_be_u32(bytes, 0)?,
            level: read_be_u16(bytes, 4)?,
            numrecs: read_be_u16(bytes, 6)?,
            leftsib: read_be_u32(bytes, 8)?,
            rightsib: read_be_u32(bytes, 12)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0, self.magic);
        put_be_u16(buf, 4, self.level);
        put_be_u16(buf, 6, self.numrecs);
        put_be_u32(buf, 8, self.leftsib);
        put_be_u32(buf, 12, self.rightsib);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongBtreeHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u64,
    pub rightsib: u64,
}

impl LongBtreeHeader {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            magic: read_be_u32(bytes, 0)?,
            level: read_be_u16(bytes, 4)?,
            numrecs: read_be_u16(bytes, 6)?,
            leftsib: read_be_u64(bytes, 8)?,
            rightsib: read_be_u64(bytes, 16)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0, self.magic);
        put_be_u16(buf, 4, self.level);
        put_be_u16(buf, 6, self.numrecs);
        put_be_u64(buf, 8, self.leftsib);
        put_be_u64(buf, 16, self.rightsib);
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Free extent `{start_block, block_count}` (AG-relative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocRec {
    pub start: u32,
    pub len: u32,
}

impl AllocRec {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// One past the last block (saturating; verifiers reject overflow).
    #[must_use]
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.len)
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            start: read_be_u32(bytes, 0)?,
            len: read_be_u32(bytes, 4)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0, self.start);
        put_be_u32(buf, 4, self.len);
    }
}

impl fmt::Display for AllocRec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}+{}]", self.start, self.len)
    }
}

/// Inode chunk record: 64 inodes starting at `start_ino`, 1 bits free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InobtRec {
    pub start_ino: u32,
    pub free_count: i32,
    pub free_mask: u64,
}

impl InobtRec {
    pub const SIZE: usize = 16;

    /// A freshly created chunk with every inode free.
    #[must_use]
    pub fn all_free(start_ino: u32) -> Self {
        Self {
            start_ino,
            free_count: 64,
            free_mask: u64::MAX,
        }
    }

    #[must_use]
    pub fn contains(&self, agino: u32) -> bool {
        agino >= self.start_ino && agino - self.start_ino < INODES_PER_CHUNK
    }

    #[must_use]
    pub fn is_free(&self, offset: u32) -> bool {
        offset < INODES_PER_CHUNK && self.free_mask & (1_u64 << offset) != 0
    }

    /// Lowest-numbered free inode offset in the chunk.
    #[must_use]
    pub fn first_free(&self) -> Option<u32> {
        if self.free_mask == 0 {
            None
        } else {
            Some(self.free_mask.trailing_zeros())
        }
    }

    #[must_use]
    pub fn mask_consistent(&self) -> bool {
        i64::from(self.free_count) == i64::from(self.free_mask.count_ones())
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            start_ino: read_be_u32(bytes, 0)?,
            free_count: read_be_i32(bytes, 4)?,
            free_mask: read_be_u64(bytes, 8)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0, self.start_ino);
        put_be_i32(buf, 4, self.free_count);
        put_be_u64(buf, 8, self.free_mask);
    }
}

// ── Tagged record / key ─────────────────────────────────────────────────────

/// Which AG btree a block belongs to; selects record layout, key and magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BtreeKind {
    /// Free space keyed by start block.
    Bno,
    /// Free space keyed by (length, start block).
    Cnt,
    /// Inode chunks keyed by start inode.
    Ino,
}

/// One leaf record of any AG btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Record {
    FreeSpaceByBno(AllocRec),
    FreeSpaceBySize(AllocRec),
    InodeChunk(InobtRec),
}

/// Interior key of any AG btree.
///
/// Derived ordering compares fields in declaration order, which is the
/// per-kind ordering (`Cnt` sorts by length, then start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BtreeKey {
    Bno { start: u32 },
    Cnt { len: u32, start: u32 },
    Ino { start_ino: u32 },
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> BtreeKind {
        match self {
            Self::FreeSpaceByBno(_) => BtreeKind::Bno,
            Self::FreeSpaceBySize(_) => BtreeKind::Cnt,
            Self::InodeChunk(_) => BtreeKind::Ino,
        }
    }

    #[must_use]
    pub fn alloc(&self) -> Option<AllocRec> {
        match self {
            Self::FreeSpaceByBno(rec) | Self::FreeSpaceBySize(rec) => Some(*rec),
            Self::InodeChunk(_) => None,
        }
    }

    #[must_use]
    pub fn inode(&self) -> Option<InobtRec> {
        match self {
            Self::InodeChunk(rec) => Some(*rec),
            Self::FreeSpaceByBno(_) | Self::FreeSpaceBySize(_) => None,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreeSpaceByBno(rec) => write!(f, "bno{rec}"),
            Self::FreeSpaceBySize(rec) => write!(f, "cnt{rec}"),
            Self::InodeChunk(rec) => write!(
                f,
                "ino[{} free={} mask={:#018x}]",
                rec.start_ino, rec.free_count, rec.free_mask
            ),
        }
    }
}

/// What a decoded record of one allocation group must fit inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecBounds {
    pub ag_blocks: u32,
    /// AG inode numbers in the allocation group.
    pub ag_inodes: u64,
    /// Multiple every chunk's first AG inode number must be: the chunk
    /// alignment when chunks are aligned, one block of inodes otherwise.
    pub chunk_ino_align: u64,
}

impl BtreeKind {
    #[must_use]
    pub fn magic(self) -> u32 {
        match self {
            Self::Bno => ABTB_MAGIC,
            Self::Cnt => ABTC_MAGIC,
            Self::Ino => IBT_MAGIC,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bno => "bnobt",
            Self::Cnt => "cntbt",
            Self::Ino => "inobt",
        }
    }

    #[must_use]
    pub fn rec_len(self) -> usize {
        match self {
            Self::Bno | Self::Cnt => AllocRec::SIZE,
            Self::Ino => InobtRec::SIZE,
        }
    }

    /// Keys reuse the record layout for free-space trees (8 bytes) and the
    /// start inode alone for the inode tree.
    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            Self::Bno | Self::Cnt => AllocRec::SIZE,
            Self::Ino => 4,
        }
    }

    /// Records per leaf block.
    #[must_use]
    pub fn leaf_max(self, block_size: u32) -> usize {
        (block_size as usize - SHORT_HEADER_SIZE) / self.rec_len()
    }

    /// Key/pointer pairs per interior block.
    #[must_use]
    pub fn node_max(self, block_size: u32) -> usize {
        (block_size as usize - SHORT_HEADER_SIZE) / (self.key_len() + SHORT_PTR_SIZE)
    }

    #[must_use]
    pub fn key_of(self, rec: &Record) -> BtreeKey {
        match rec {
            Record::FreeSpaceByBno(r) => BtreeKey::Bno { start: r.start },
            Record::FreeSpaceBySize(r) => BtreeKey::Cnt {
                len: r.len,
                start: r.start,
            },
            Record::InodeChunk(r) => BtreeKey::Ino {
                start_ino: r.start_ino,
            },
        }
    }

    /// Wrap a free extent in this kind's record variant.
    #[must_use]
    pub fn alloc_record(self, rec: AllocRec) -> Option<Record> {
        match self {
            Self::Bno => Some(Record::FreeSpaceByBno(rec)),
            Self::Cnt => Some(Record::FreeSpaceBySize(rec)),
            Self::Ino => None,
        }
    }

    pub fn decode_rec(self, bytes: &[u8]) -> Result<Record, ParseError> {
        Ok(match self {
            Self::Bno => Record::FreeSpaceByBno(AllocRec::parse_from_bytes(bytes)?),
            Self::Cnt => Record::FreeSpaceBySize(AllocRec::parse_from_bytes(bytes)?),
            Self::Ino => Record::InodeChunk(InobtRec::parse_from_bytes(bytes)?),
        })
    }

    pub fn encode_rec(self, rec: &Record, buf: &mut [u8]) -> Result<(), ParseError> {
        match (self, rec) {
            (Self::Bno, Record::FreeSpaceByBno(r)) | (Self::Cnt, Record::FreeSpaceBySize(r)) => {
                r.encode(buf);
            }
            (Self::Ino, Record::InodeChunk(r)) => r.encode(buf),
            _ => {
                return Err(ParseError::InvalidField {
                    field: "record",
                    reason: "record variant does not match btree kind",
                });
            }
        }
        Ok(())
    }

    pub fn decode_key(self, bytes: &[u8]) -> Result<BtreeKey, ParseError> {
        Ok(match self {
            Self::Bno => BtreeKey::Bno {
                start: read_be_u32(bytes, 0)?,
            },
            Self::Cnt => BtreeKey::Cnt {
                start: read_be_u32(bytes, 0)?,
                len: read_be_u32(bytes, 4)?,
            },
            Self::Ino => BtreeKey::Ino {
                start_ino: read_be_u32(bytes, 0)?,
            },
        })
    }

    pub fn encode_key(self, key: &BtreeKey, buf: &mut [u8]) -> Result<(), ParseError> {
        match (self, key) {
            // By-bno keys keep the record shape with a zero length.
            (Self::Bno, BtreeKey::Bno { start }) => {
                put_be_u32(buf, 0, *start);
                put_be_u32(buf, 4, 0);
            }
            (Self::Cnt, BtreeKey::Cnt { len, start }) => {
                put_be_u32(buf, 0, *start);
                put_be_u32(buf, 4, *len);
            }
            (Self::Ino, BtreeKey::Ino { start_ino }) => put_be_u32(buf, 0, *start_ino),
            _ => {
                return Err(ParseError::InvalidField {
                    field: "key",
                    reason: "key variant does not match btree kind",
                });
            }
        }
        Ok(())
    }

    /// Per-record sanity check applied on every decode.
    pub fn check_rec(self, rec: &Record, bounds: &RecBounds) -> Result<(), &'static str> {
        match rec {
            Record::FreeSpaceByBno(r) | Record::FreeSpaceBySize(r) => {
                if r.len == 0 {
                    return Err("zero-length free extent");
                }
                if u64::from(r.start) + u64::from(r.len) > u64::from(bounds.ag_blocks) {
                    return Err("free extent extends past end of allocation group");
                }
            }
            Record::InodeChunk(r) => {
                if !r.mask_consistent() {
                    return Err("inode record free_count does not match popcount(free_mask)");
                }
                if u64::from(r.start_ino) % bounds.chunk_ino_align.max(1) != 0 {
                    return Err("inode record start is not chunk aligned");
                }
                if u64::from(r.start_ino) + u64::from(INODES_PER_CHUNK) > bounds.ag_inodes {
                    return Err("inode chunk extends past end of allocation group");
                }
            }
        }
        if rec.kind() != self {
            return Err("record variant does not match btree kind");
        }
        Ok(())
    }

    /// Tallest tree that can index `records` records with minimally full blocks.
    #[must_use]
    pub fn max_levels(self, block_size: u32, records: u64) -> u32 {
        let leaf_min = (self.leaf_max(block_size) / 2).max(1) as u64;
        let node_min = (self.node_max(block_size) / 2).max(2) as u64;
        let mut blocks = records.div_ceil(leaf_min);
        let mut levels = 1;
        while blocks > 1 {
            blocks = blocks.div_ceil(node_min);
            levels += 1;
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1024-block AG of 512-byte blocks holding two 256-byte inodes each,
    /// with chunks aligned to their own 32 blocks.
    const ALIGNED: RecBounds = RecBounds {
        ag_blocks: 1024,
        ag_inodes: 2048,
        chunk_ino_align: 64,
    };

    const UNALIGNED: RecBounds = RecBounds {
        chunk_ino_align: 2,
        ..ALIGNED
    };

    #[test]
    fn short_header_layout() {
        let hdr = ShortBtreeHeader {
            magic: ABTB_MAGIC,
            level: 1,
            numrecs: 2,
            leftsib: u32::MAX,
            rightsib: 9,
        };
        let mut buf = [0_u8; SHORT_HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(&buf[0..4], b"ABTB");
        assert_eq!(&buf[4..8], &[0, 1, 0, 2]);
        assert_eq!(ShortBtreeHeader::parse_from_bytes(&buf).unwrap(), hdr);
    }

    #[test]
    fn long_header_layout() {
        let hdr = LongBtreeHeader {
            magic: crate::BMAP_MAGIC,
            level: 0,
            numrecs: 5,
            leftsib: u64::MAX,
            rightsib: 0x1_0000_0000,
        };
        let mut buf = [0_u8; LONG_HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(&buf[0..4], b"BMAP");
        assert_eq!(LongBtreeHeader::parse_from_bytes(&buf).unwrap(), hdr);
    }

    #[test]
    fn cnt_keys_order_by_length_then_start() {
        let a = BtreeKey::Cnt { len: 4, start: 900 };
        let b = BtreeKey::Cnt { len: 5, start: 10 };
        let c = BtreeKey::Cnt { len: 5, start: 11 };
        assert!(a < b && b < c);
    }

    #[test]
    fn cnt_key_shares_record_layout() {
        let key = BtreeKey::Cnt { len: 40, start: 110 };
        let mut buf = [0_u8; 8];
        BtreeKind::Cnt.encode_key(&key, &mut buf).unwrap();
        assert_eq!(AllocRec::parse_from_bytes(&buf).unwrap(), AllocRec::new(110, 40));
        assert_eq!(BtreeKind::Cnt.decode_key(&buf).unwrap(), key);
    }

    #[test]
    fn mismatched_variant_is_rejected() {
        let rec = Record::InodeChunk(InobtRec::all_free(64));
        let mut buf = [0_u8; 16];
        assert!(BtreeKind::Bno.encode_rec(&rec, &mut buf).is_err());
        assert!(BtreeKind::Ino.encode_rec(&rec, &mut buf).is_ok());
        assert!(
            BtreeKind::Ino
                .encode_key(&BtreeKey::Bno { start: 1 }, &mut buf)
                .is_err()
        );
    }

    #[test]
    fn capacities_for_4k_blocks() {
        assert_eq!(BtreeKind::Bno.leaf_max(4096), 510);
        assert_eq!(BtreeKind::Bno.node_max(4096), 340);
        assert_eq!(BtreeKind::Ino.leaf_max(4096), 255);
        assert_eq!(BtreeKind::Ino.node_max(4096), 510);
    }

    #[test]
    fn inode_record_helpers() {
        let mut rec = InobtRec::all_free(128);
        assert!(rec.contains(128) && rec.contains(191) && !rec.contains(192));
        assert_eq!(rec.first_free(), Some(0));
        rec.free_mask &= !1;
        rec.free_count -= 1;
        assert!(rec.mask_consistent());
        assert_eq!(rec.first_free(), Some(1));
        assert!(!rec.is_free(0));
        rec.free_count = 64;
        assert!(!rec.mask_consistent());
        assert!(
            BtreeKind::Ino
                .check_rec(&Record::InodeChunk(rec), &ALIGNED)
                .is_err()
        );
    }

    #[test]
    fn chunk_alignment_follows_the_volume() {
        let off_chunk = Record::InodeChunk(InobtRec::all_free(22));
        assert!(BtreeKind::Ino.check_rec(&off_chunk, &ALIGNED).is_err());
        assert!(BtreeKind::Ino.check_rec(&off_chunk, &UNALIGNED).is_ok());
        let mid_block = Record::InodeChunk(InobtRec::all_free(23));
        assert!(BtreeKind::Ino.check_rec(&mid_block, &UNALIGNED).is_err());
        let past_end = Record::InodeChunk(InobtRec::all_free(2048 - 32));
        assert!(BtreeKind::Ino.check_rec(&past_end, &UNALIGNED).is_err());
        let last = Record::InodeChunk(InobtRec::all_free(2048 - 64));
        assert!(BtreeKind::Ino.check_rec(&last, &ALIGNED).is_ok());
    }

    #[test]
    fn check_rec_bounds_free_extents() {
        let ok = Record::FreeSpaceByBno(AllocRec::new(100, 50));
        assert!(BtreeKind::Bno.check_rec(&ok, &ALIGNED).is_ok());
        let past_end = Record::FreeSpaceByBno(AllocRec::new(1000, 50));
        assert!(BtreeKind::Bno.check_rec(&past_end, &ALIGNED).is_err());
        let empty = Record::FreeSpaceBySize(AllocRec::new(10, 0));
        assert!(BtreeKind::Cnt.check_rec(&empty, &ALIGNED).is_err());
        assert!(BtreeKind::Cnt.check_rec(&ok, &ALIGNED).is_err());
    }

    #[test]
    fn max_levels_grows_with_record_count() {
        assert_eq!(BtreeKind::Bno.max_levels(4096, 1), 1);
        assert_eq!(BtreeKind::Bno.max_levels(4096, 255), 1);
        assert_eq!(BtreeKind::Bno.max_levels(4096, 256), 2);
        assert!(BtreeKind::Bno.max_levels(512, 1 << 20) >= 4);
    }
}
