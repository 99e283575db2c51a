//! Allocation group headers: AGF (free space), AGI (inodes), AGFL (free list).

use crate::{AGF_MAGIC, AGF_VERSION, AGFL_MAGIC, AGI_MAGIC, AGI_VERSION};
use agfs_types::{
    NULL_AGBLOCK, NULL_AGINO, ParseError, put_be_u32, put_be_u64, read_be_u32, read_be_u64,
};
use serde::{Deserialize, Serialize};

// ── AGF ─────────────────────────────────────────────────────────────────────

/// Encoded AGF length (root/level slots for bno, cnt and an unused third tree).
pub const AGF_SIZE: usize = 64;

/// Free-space AG header.
///
/// ```text
/// 0x00 magic     0x10 roots[3]   0x28 flfirst   0x34 freeblks
/// 0x04 version   0x1C levels[3]  0x2C fllast    0x38 longest
/// 0x08 seqno                     0x30 flcount   0x3C btreeblks
/// 0x0C length
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agf {
    pub seqno: u32,
    pub length: u32,
    pub bno_root: u32,
    pub cnt_root: u32,
    pub bno_level: u32,
    pub cnt_level: u32,
    pub flfirst: u32,
    pub fllast: u32,
    pub flcount: u32,
    pub freeblks: u32,
    pub longest: u32,
    /// Blocks held by the free-space btrees beyond their initial roots.
    pub btreeblks: u32,
}

impl Agf {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(bytes, 0x00)?;
        if magic != AGF_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(AGF_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_be_u32(bytes, 0x04)? != AGF_VERSION {
            return Err(ParseError::InvalidField {
                field: "agf_versionnum",
                reason: "unsupported version",
            });
        }
        Ok(Self {
            seqno: read_be_u32(bytes, 0x08)?,
            length: read_be_u32(bytes, 0x0C)?,
            bno_root: read_be_u32(bytes, 0x10)?,
            cnt_root: read_be_u32(bytes, 0x14)?,
            bno_level: read_be_u32(bytes, 0x1C)?,
            cnt_level: read_be_u32(bytes, 0x20)?,
            flfirst: read_be_u32(bytes, 0x28)?,
            fllast: read_be_u32(bytes, 0x2C)?,
            flcount: read_be_u32(bytes, 0x30)?,
            freeblks: read_be_u32(bytes, 0x34)?,
            longest: read_be_u32(bytes, 0x38)?,
            btreeblks: read_be_u32(bytes, 0x3C)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0x00, AGF_MAGIC);
        put_be_u32(buf, 0x04, AGF_VERSION);
        put_be_u32(buf, 0x08, self.seqno);
        put_be_u32(buf, 0x0C, self.length);
        put_be_u32(buf, 0x10, self.bno_root);
        put_be_u32(buf, 0x14, self.cnt_root);
        put_be_u32(buf, 0x18, 0);
        put_be_u32(buf, 0x1C, self.bno_level);
        put_be_u32(buf, 0x20, self.cnt_level);
        put_be_u32(buf, 0x24, 0);
        put_be_u32(buf, 0x28, self.flfirst);
        put_be_u32(buf, 0x2C, self.fllast);
        put_be_u32(buf, 0x30, self.flcount);
        put_be_u32(buf, 0x34, self.freeblks);
        put_be_u32(buf, 0x38, self.longest);
        put_be_u32(buf, 0x3C, self.btreeblks);
    }

    /// Cross-field checks that do not need the btrees.
    pub fn validate(
        &self,
        seqno: u32,
        length: u32,
        agfl_size: u32,
        max_level: u32,
    ) -> Result<(), ParseError> {
        if self.seqno != seqno {
            return Err(ParseError::InvalidField {
                field: "agf_seqno",
                reason: "does not match allocation group index",
            });
        }
        if self.length != length {
            return Err(ParseError::InvalidField {
                field: "agf_length",
                reason: "does not match allocation group size",
            });
        }
        if self.bno_root >= length || self.cnt_root >= length {
            return Err(ParseError::InvalidField {
                field: "agf_roots",
                reason: "root block outside allocation group",
            });
        }
        if self.bno_level == 0
            || self.cnt_level == 0
            || self.bno_level > max_level
            || self.cnt_level > max_level
        {
            return Err(ParseError::InvalidField {
                field: "agf_levels",
                reason: "btree height out of range",
            });
        }
        if self.flcount > agfl_size || self.flfirst >= agfl_size || self.fllast >= agfl_size {
            return Err(ParseError::InvalidField {
                field: "agf_flcount",
                reason: "free list indices out of range",
            });
        }
        if self.freeblks > length || self.longest > self.freeblks {
            return Err(ParseError::InvalidField {
                field: "agf_freeblks",
                reason: "free block counts inconsistent",
            });
        }
        Ok(())
    }
}

// ── AGI ─────────────────────────────────────────────────────────────────────

/// Encoded AGI length including the 64 unlinked-list buckets.
pub const AGI_SIZE: usize = 0x28 + 64 * 4;

/// Inode AG header.
///
/// ```text
/// 0x00 magic     0x10 count      0x20 newino
/// 0x04 version   0x14 root       0x24 dirino
/// 0x08 seqno     0x18 level      0x28 unlinked[64]
/// 0x0C length    0x1C freecount
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agi {
    pub seqno: u32,
    pub length: u32,
    /// Allocated inodes (in chunks) in this AG.
    pub count: u32,
    pub root: u32,
    pub level: u32,
    pub freecount: u32,
    /// Start of the most recently created chunk, or `NULL_AGINO`.
    pub newino: u32,
    pub dirino: u32,
}

impl Agi {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(bytes, 0x00)?;
        if magic != AGI_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(AGI_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_be_u32(bytes, 0x04)? != AGI_VERSION {
            return Err(ParseError::InvalidField {
                field: "agi_versionnum",
                reason: "unsupported version",
            });
        }
        Ok(Self {
            seqno: read_be_u32(bytes, 0x08)?,
            length: read_be_u32(bytes, 0x0C)?,
            count: read_be_u32(bytes, 0x10)?,
            root: read_be_u32(bytes, 0x14)?,
            level: read_be_u32(bytes, 0x18)?,
            freecount: read_be_u32(bytes, 0x1C)?,
            newino: read_be_u32(bytes, 0x20)?,
            dirino: read_be_u32(bytes, 0x24)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0x00, AGI_MAGIC);
        put_be_u32(buf, 0x04, AGI_VERSION);
        put_be_u32(buf, 0x08, self.seqno);
        put_be_u32(buf, 0x0C, self.length);
        put_be_u32(buf, 0x10, self.count);
        put_be_u32(buf, 0x14, self.root);
        put_be_u32(buf, 0x18, self.level);
        put_be_u32(buf, 0x1C, self.freecount);
        put_be_u32(buf, 0x20, self.newino);
        put_be_u32(buf, 0x24, self.dirino);
        for bucket in 0..64 {
            put_be_u32(buf, 0x28 + bucket * 4, NULL_AGINO);
        }
    }

    pub fn validate(&self, seqno: u32, length: u32, max_level: u32) -> Result<(), ParseError> {
        if self.seqno != seqno {
            return Err(ParseError::InvalidField {
                field: "agi_seqno",
                reason: "does not match allocation group index",
            });
        }
        if self.length != length {
            return Err(ParseError::InvalidField {
                field: "agi_length",
                reason: "does not match allocation group size",
            });
        }
        if self.root >= length || self.level == 0 || self.level > max_level {
            return Err(ParseError::InvalidField {
                field: "agi_root",
                reason: "inode btree root out of range",
            });
        }
        if self.freecount > self.count {
            return Err(ParseError::InvalidField {
                field: "agi_freecount",
                reason: "more free inodes than allocated inodes",
            });
        }
        Ok(())
    }
}

impl Default for Agi {
    fn default() -> Self {
        Self {
            seqno: 0,
            length: 0,
            count: 0,
            root: NULL_AGBLOCK,
            level: 1,
            freecount: 0,
            newino: NULL_AGINO,
            dirino: NULL_AGINO,
        }
    }
}

// ── AGFL ────────────────────────────────────────────────────────────────────

/// `magic`, `seqno` and an 8-byte LSN slot precede the block array.
pub const AGFL_HEADER_SIZE: usize = 16;

/// Decoded free list block: every slot, in on-disk order.
///
/// The ring is interpreted through the AGF's `flfirst`/`fllast`/`flcount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgflBlock {
    pub seqno: u32,
    pub lsn: u64,
    pub slots: Vec<u32>,
}

impl AgflBlock {
    /// Slots that fit in one block after the header.
    #[must_use]
    pub fn capacity(block_size: u32) -> u32 {
        // AGFL_HEADER_SIZE is a small constant.
        #[expect(clippy::cast_possible_truncation)]
        let header = AGFL_HEADER_SIZE as u32;
        (block_size - header) / 4
    }

    #[must_use]
    pub fn empty(seqno: u32, block_size: u32) -> Self {
        let capacity = Self::capacity(block_size) as usize;
        Self {
            seqno,
            lsn: 0,
            slots: vec![NULL_AGBLOCK; capacity],
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(bytes, 0x00)?;
        if magic != AGFL_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(AGFL_MAGIC),
                actual: u64::from(magic),
            });
        }
        let seqno = read_be_u32(bytes, 0x04)?;
        let lsn = read_be_u64(bytes, 0x08)?;
        let count = bytes.len().saturating_sub(AGFL_HEADER_SIZE) / 4;
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(read_be_u32(bytes, AGFL_HEADER_SIZE + i * 4)?);
        }
        Ok(Self { seqno, lsn, slots })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0x00, AGFL_MAGIC);
        put_be_u32(buf, 0x04, self.seqno);
        put_be_u64(buf, 0x08, self.lsn);
        for (i, slot) in self.slots.iter().enumerate() {
            put_be_u32(buf, AGFL_HEADER_SIZE + i * 4, *slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agf() -> Agf {
        Agf {
            seqno: 2,
            length: 1024,
            bno_root: 4,
            cnt_root: 5,
            bno_level: 1,
            cnt_level: 1,
            flfirst: 0,
            fllast: 3,
            flcount: 4,
            freeblks: 1013,
            longest: 1013,
            btreeblks: 0,
        }
    }

    #[test]
    fn agf_layout_is_bit_exact() {
        let agf = sample_agf();
        let mut buf = vec![0_u8; 512];
        agf.encode(&mut buf);
        assert_eq!(&buf[0..4], b"XAGF");
        assert_eq!(read_be_u32(&buf, 0x08).unwrap(), 2);
        assert_eq!(read_be_u32(&buf, 0x10).unwrap(), 4);
        assert_eq!(read_be_u32(&buf, 0x14).unwrap(), 5);
        assert_eq!(read_be_u32(&buf, 0x30).unwrap(), 4);
        assert_eq!(read_be_u32(&buf, 0x38).unwrap(), 1013);
        assert_eq!(Agf::parse_from_bytes(&buf).unwrap(), agf);
    }

    #[test]
    fn agf_validate_rejects_bad_fields() {
        let agf = sample_agf();
        agf.validate(2, 1024, 100, 5).unwrap();
        assert!(agf.validate(3, 1024, 100, 5).is_err());
        let mut bad = agf;
        bad.longest = 2000;
        assert!(bad.validate(2, 1024, 100, 5).is_err());
        let mut bad = agf;
        bad.flcount = 101;
        assert!(bad.validate(2, 1024, 100, 5).is_err());
        let mut bad = agf;
        bad.cnt_level = 0;
        assert!(bad.validate(2, 1024, 100, 5).is_err());
    }

    #[test]
    fn agi_unlinked_buckets_are_null() {
        let agi = Agi {
            seqno: 1,
            length: 1024,
            root: 6,
            ..Agi::default()
        };
        let mut buf = vec![0_u8; 512];
        agi.encode(&mut buf);
        assert_eq!(&buf[0..4], b"XAGI");
        assert_eq!(read_be_u32(&buf, 0x28).unwrap(), NULL_AGINO);
        assert_eq!(read_be_u32(&buf, AGI_SIZE - 4).unwrap(), NULL_AGINO);
        let parsed = Agi::parse_from_bytes(&buf).unwrap();
        assert_eq!(parsed, agi);
        parsed.validate(1, 1024, 4).unwrap();
    }

    #[test]
    fn agfl_capacity_and_slots() {
        assert_eq!(AgflBlock::capacity(512), 124);
        assert_eq!(AgflBlock::capacity(4096), 1020);
        let mut agfl = AgflBlock::empty(0, 512);
        agfl.slots[0] = 77;
        let mut buf = vec![0_u8; 512];
        agfl.encode(&mut buf);
        let parsed = AgflBlock::parse_from_bytes(&buf).unwrap();
        assert_eq!(parsed.slots.len(), 124);
        assert_eq!(parsed.slots[0], 77);
        assert_eq!(parsed.slots[1], NULL_AGBLOCK);
    }
}
