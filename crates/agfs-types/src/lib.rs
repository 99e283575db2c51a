#![forbid(unsafe_code)]
//! Identifier newtypes and byte-level helpers shared by every agfs crate.
//!
//! All on-disk multi-byte integers are big-endian. The `read_be_*` helpers
//! bounds-check and return [`ParseError`]; the `put_be_*` helpers assume the
//! caller sized the destination buffer from a format constant.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Null AG-relative block pointer (sibling and root sentinels).
pub const NULL_AGBLOCK: u32 = u32::MAX;

/// Null AG-relative inode number (AGI `newino`, unlinked buckets).
pub const NULL_AGINO: u32 = u32::MAX;

/// Null 64-bit block pointer used by long-form btree headers.
pub const NULL_FSBLOCK: u64 = u64::MAX;

/// Inodes described by one inode btree record.
pub const INODES_PER_CHUNK: u32 = 64;

/// Absolute block address on the data device (linear: `ag * ag_blocks + agbno`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgNumber(pub u32);

/// Block number relative to the start of its allocation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgBlock(pub u32);

/// Inode number relative to the start of its allocation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgInode(pub u32);

/// Filesystem-wide inode number: `ag << (agblklog + inopblog) | agino`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId(pub u64);

/// Log sequence number assigned to a committed transaction record.
///
/// Monotonically increasing; `Lsn::ZERO` means "never logged".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl AgBlock {
    pub const NULL: Self = Self(NULL_AGBLOCK);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == NULL_AGBLOCK
    }

    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, len: u32) -> Option<Self> {
        self.0.checked_add(len).map(Self)
    }
}

impl AgInode {
    pub const NULL: Self = Self(NULL_AGINO);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == NULL_AGINO
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn as_usize(self) -> usize {
        // u32 always fits usize on supported targets.
        self.0 as usize
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn put_be_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Smallest `n` with `1 << n >= value` (0 for values 0 and 1).
#[must_use]
pub fn log2_roundup(value: u32) -> u8 {
    if value <= 1 {
        return 0;
    }
    // (value - 1).leading_zeros() <= 31, so the result fits in u8.
    #[expect(clippy::cast_possible_truncation)]
    let bits = (32 - (value - 1).leading_zeros()) as u8;
    bits
}

/// Round `value` up to the next multiple of `align` (`align` > 0).
#[must_use]
pub fn roundup_u32(value: u32, align: u32) -> Option<u32> {
    if align <= 1 {
        return Some(value);
    }
    let rem = value % align;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(align - rem)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AgBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for AgInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn be_readers_reject_short_input() {
        let data = [0x58, 0x41, 0x47];
        let err = read_be_u32(&data, 0).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3,
            }
        );
        assert!(read_be_u16(&data, 2).is_err());
        assert!(ensure_slice(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn be_writers_and_readers_agree() {
        let mut buf = [0_u8; 18];
        put_be_u16(&mut buf, 0, 0x494E);
        put_be_u32(&mut buf, 2, 0x5841_4746);
        put_be_i32(&mut buf, 6, -3);
        put_be_u64(&mut buf, 10, 0x0102_0304_0506_0708);
        assert_eq!(&buf[2..6], b"XAGF");
        assert_eq!(read_be_u16(&buf, 0).unwrap(), 0x494E);
        assert_eq!(read_be_i32(&buf, 6).unwrap(), -3);
        assert_eq!(read_be_u64(&buf, 10).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(read_fixed::<4>(&buf, 2).unwrap(), *b"XAGF");
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);
    }

    #[test]
    fn log2_roundup_matches_powers() {
        assert_eq!(log2_roundup(0), 0);
        assert_eq!(log2_roundup(1), 0);
        assert_eq!(log2_roundup(2), 1);
        assert_eq!(log2_roundup(3), 2);
        assert_eq!(log2_roundup(1024), 10);
        assert_eq!(log2_roundup(1025), 11);
    }

    #[test]
    fn roundup_handles_alignment_and_overflow() {
        assert_eq!(roundup_u32(100, 1), Some(100));
        assert_eq!(roundup_u32(100, 8), Some(104));
        assert_eq!(roundup_u32(104, 8), Some(104));
        assert_eq!(roundup_u32(u32::MAX, 8), None);
    }

    #[test]
    fn null_sentinels_display() {
        assert!(AgBlock::NULL.is_null());
        assert_eq!(AgBlock::NULL.to_string(), "null");
        assert_eq!(AgBlock(7).to_string(), "7");
        assert!(AgInode::NULL.is_null());
        assert_eq!(Lsn::ZERO.next(), Lsn(1));
    }
}
