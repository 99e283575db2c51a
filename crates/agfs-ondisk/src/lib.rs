#![forbid(unsafe_code)]
//! On-disk format codecs for agfs metadata.
//!
//! Pure parsing crate: no I/O, no side effects. Every structure is decoded
//! from and encoded into big-endian byte slices at fixed offsets:
//!
//! - [`Superblock`]: geometry and the five global counters.
//! - [`Agf`], [`Agi`], [`AgflBlock`]: per-AG free-space header, inode header
//!   and free list.
//! - [`ShortBtreeHeader`], [`LongBtreeHeader`]: btree block headers with
//!   32-bit (AG-rooted) or 64-bit (inode-rooted) sibling pointers.
//! - [`AllocRec`], [`InobtRec`] and the tagged [`Record`]/[`BtreeKey`]
//!   variants selected by [`BtreeKind`].
//! - [`DinodeCore`]: the inode core fields written when a chunk is created.
//! - [`Geometry`]: values derived once from the superblock.

pub mod ag;
pub mod btree;
pub mod dinode;
pub mod geometry;
pub mod sb;

pub use ag::{AGF_SIZE, AGI_SIZE, AGFL_HEADER_SIZE, Agf, AgflBlock, Agi};
pub use btree::{
    AllocRec, BtreeKey, BtreeKind, InobtRec, LONG_HEADER_SIZE, LongBtreeHeader, RecBounds, Record,
    SHORT_HEADER_SIZE, ShortBtreeHeader,
};
pub use dinode::{DINODE_CORE_SIZE, DinodeCore};
pub use geometry::Geometry;
pub use sb::{SB_ENCODED_SIZE, Superblock};

// ── Magic numbers ───────────────────────────────────────────────────────────

/// Superblock magic ("XFSB").
pub const SB_MAGIC: u32 = 0x5846_5342;
/// Free-space AG header magic ("XAGF").
pub const AGF_MAGIC: u32 = 0x5841_4746;
/// Inode AG header magic ("XAGI").
pub const AGI_MAGIC: u32 = 0x5841_4749;
/// AG free list magic ("XAFL").
pub const AGFL_MAGIC: u32 = 0x5841_464C;
/// Free-space by-bno btree block magic ("ABTB").
pub const ABTB_MAGIC: u32 = 0x4142_5442;
/// Free-space by-size btree block magic ("ABTC").
pub const ABTC_MAGIC: u32 = 0x4142_5443;
/// Inode btree block magic ("IABT").
pub const IBT_MAGIC: u32 = 0x4941_4254;
/// Inode-rooted block map btree magic ("BMAP").
pub const BMAP_MAGIC: u32 = 0x424D_4150;
/// Inode core magic ("IN").
pub const DINODE_MAGIC: u16 = 0x494E;

pub const AGF_VERSION: u32 = 1;
pub const AGI_VERSION: u32 = 1;
pub const SB_VERSION: u16 = 5;

// ── Fixed AG layout ─────────────────────────────────────────────────────────

/// Superblock copy (primary in AG 0).
pub const SB_AGBLOCK: u32 = 0;
pub const AGF_AGBLOCK: u32 = 1;
pub const AGI_AGBLOCK: u32 = 2;
pub const AGFL_AGBLOCK: u32 = 3;
/// Initial root of the by-bno free-space btree.
pub const BNO_ROOT_AGBLOCK: u32 = 4;
/// Initial root of the by-size free-space btree.
pub const CNT_ROOT_AGBLOCK: u32 = 5;
/// Initial root of the inode btree.
pub const INO_ROOT_AGBLOCK: u32 = 6;
/// First block handed to the free-space btrees by format.
pub const PREALLOC_BLOCKS: u32 = 7;

/// Granularity at which dirty buffer ranges are logged.
pub const LOG_CHUNK_SIZE: usize = 128;
