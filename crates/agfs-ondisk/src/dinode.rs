//! Inode core, restricted to the fields written when an inode chunk is
//! created and checked when an inode is handed out.

use crate::DINODE_MAGIC;
use agfs_types::{
    NULL_AGINO, ParseError, put_be_u16, put_be_u32, put_be_u64, read_be_u16, read_be_u32,
    read_be_u64,
};

pub const DINODE_CORE_SIZE: usize = 100;

/// On-disk version written for never-used inodes.
pub const DINODE_VERSION: u8 = 3;
/// Extent-list data fork format.
pub const DINODE_FMT_EXTENTS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DinodeCore {
    pub mode: u16,
    pub version: u8,
    pub format: u8,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub projid: u32,
    /// Blocks charged to the owner's quota.
    pub nblocks: u64,
    pub generation: u32,
    pub next_unlinked: u32,
}

impl DinodeCore {
    /// Marker written into every slot of a freshly created chunk.
    #[must_use]
    pub fn unused(generation: u32) -> Self {
        Self {
            mode: 0,
            version: DINODE_VERSION,
            format: DINODE_FMT_EXTENTS,
            uid: 0,
            gid: 0,
            nlink: 0,
            projid: 0,
            nblocks: 0,
            generation,
            next_unlinked: NULL_AGINO,
        }
    }

    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.mode == 0 && self.nlink == 0
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u16(bytes, 0)?;
        if magic != DINODE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(DINODE_MAGIC),
                actual: u64::from(magic),
            });
        }
        let core = agfs_types::ensure_slice(bytes, 0, DINODE_CORE_SIZE)?;
        Ok(Self {
            mode: read_be_u16(core, 2)?,
            version: core[4],
            format: core[5],
            uid: read_be_u32(core, 8)?,
            gid: read_be_u32(core, 12)?,
            nlink: read_be_u32(core, 16)?,
            projid: read_be_u32(core, 20)?,
            nblocks: read_be_u64(core, 56)?,
            generation: read_be_u32(core, 92)?,
            next_unlinked: read_be_u32(core, 96)?,
        })
    }

    /// Encode into the first `DINODE_CORE_SIZE` bytes of an inode slot.
    /// Fields this engine does not model are zeroed.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..DINODE_CORE_SIZE].fill(0);
        put_be_u16(buf, 0, DINODE_MAGIC);
        put_be_u16(buf, 2, self.mode);
        buf[4] = self.version;
        buf[5] = self.format;
        put_be_u32(buf, 8, self.uid);
        put_be_u32(buf, 12, self.gid);
        put_be_u32(buf, 16, self.nlink);
        put_be_u32(buf, 20, self.projid);
        put_be_u64(buf, 56, self.nblocks);
        put_be_u32(buf, 92, self.generation);
        put_be_u32(buf, 96, self.next_unlinked);
    }
}
