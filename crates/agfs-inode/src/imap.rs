//! Inode number to disk location.
//!
//! With chunks aligned to at least their own size the chunk start follows
//! from the inode number alone. Otherwise, and for inode numbers that come
//! from outside the filesystem, the chunk is looked up in the inode tree.

use crate::agi::AgiState;
use agfs_block::corrupt_at;
use agfs_btree::{Cursor, LookupDir};
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{BtreeKey, DINODE_CORE_SIZE, DinodeCore};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgInode, AgNumber, BlockNumber, InodeNumber, NULL_FSBLOCK};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeLocation {
    pub ino: InodeNumber,
    pub agno: AgNumber,
    pub agino: AgInode,
    /// First block of the inode's chunk.
    pub chunk: AgBlock,
    /// First block of the cluster buffer holding the inode.
    pub cluster: BlockNumber,
    pub cluster_blocks: u32,
    /// Block holding the inode.
    pub block: BlockNumber,
    /// Byte offset of the inode inside `block`.
    pub offset: u32,
    /// Byte offset of the inode inside the cluster buffer.
    pub cluster_offset: u32,
}

fn split_ino(tp: &Transaction, ino: InodeNumber) -> Result<(AgNumber, AgInode)> {
    tp.geometry()
        .ino_to_ag(ino)
        .ok_or_else(|| AgfsError::InvalidArgument(format!("inode {} outside the volume", ino.0)))
}

/// Split a number the filesystem itself produced; one that lands outside
/// every AG came from damaged metadata.
pub(crate) fn split_trusted_ino(
    tp: &Transaction,
    ino: InodeNumber,
) -> Result<(AgNumber, AgInode)> {
    tp.geometry().ino_to_ag(ino).ok_or_else(|| {
        error!(ino = ino.0, ag_count = tp.geometry().ag_count, "imap_ino_outside_volume");
        AgfsError::corruption(NULL_FSBLOCK, format!("inode {} maps outside the volume", ino.0))
    })
}

/// Chunk start from the inode tree. Only the AGI root is needed, so the AGI
/// is peeked rather than joined.
fn lookup_chunk(tp: &mut Transaction, agno: AgNumber, agino: AgInode) -> Result<Option<AgBlock>> {
    let mut st = AgiState {
        agno,
        agi: AgiState::peek(tp, agno)?,
    };
    let key = BtreeKey::Ino { start_ino: agino.0 };
    let mut cur = Cursor::new(&st.tree(), tp);
    if !cur.lookup(tp, &st.tree(), &key, LookupDir::Le)? {
        return Ok(None);
    }
    let Some(rec) = cur.get_rec(tp)?.and_then(|r| r.inode()) else {
        return Ok(None);
    };
    if !rec.contains(agino.0) {
        return Ok(None);
    }
    Ok(Some(tp.geometry().agino_to_agbno(AgInode(rec.start_ino))))
}

fn locate(
    tp: &Transaction,
    ino: InodeNumber,
    agno: AgNumber,
    agino: AgInode,
    chunk: AgBlock,
) -> InodeLocation {
    let geo = tp.geometry();
    let agbno = geo.agino_to_agbno(agino);
    let slot = geo.agino_to_slot(agino);
    let cluster = geo.cluster_start(chunk, agbno);
    let offset = slot * geo.inode_size;
    InodeLocation {
        ino,
        agno,
        agino,
        chunk,
        cluster: geo.agb_to_fsb(agno, cluster),
        cluster_blocks: geo.blocks_per_cluster,
        block: geo.agb_to_fsb(agno, agbno),
        offset,
        cluster_offset: (agbno.0 - cluster.0) * geo.block_size + offset,
    }
}

/// Locate an inode the filesystem handed out itself. Aligned volumes
/// compute the chunk; others fall back to the inode tree.
pub fn imap(tp: &mut Transaction, ino: InodeNumber) -> Result<InodeLocation> {
    let (agno, agino) = split_trusted_ino(tp, ino)?;
    if let Some(chunk) = tp.geometry().aligned_chunk_start(agino) {
        return Ok(locate(tp, ino, agno, agino, chunk));
    }
    imap_untrusted(tp, ino)
}

/// Locate an inode number of unknown origin: it must belong to a chunk
/// recorded in the inode tree.
pub fn imap_untrusted(tp: &mut Transaction, ino: InodeNumber) -> Result<InodeLocation> {
    let (agno, agino) = split_ino(tp, ino)?;
    let Some(chunk) = lookup_chunk(tp, agno, agino)? else {
        trace!(ino = ino.0, agno = agno.0, agino = agino.0, "imap_no_chunk");
        return Err(AgfsError::NotFound(format!("inode {} is in no chunk", ino.0)));
    };
    Ok(locate(tp, ino, agno, agino, chunk))
}

/// Decode the inode core at `loc` through the transaction.
pub fn read_dinode(tp: &mut Transaction, loc: &InodeLocation) -> Result<DinodeCore> {
    let start = loc.offset as usize;
    let bytes = tp.read_buf(loc.block)?;
    let slot = bytes
        .get(start..start + DINODE_CORE_SIZE)
        .ok_or_else(|| AgfsError::corruption(loc.block.0, "inode slot past end of block"))?;
    DinodeCore::parse_from_bytes(slot).map_err(corrupt_at(loc.block))
}

/// Encode `core` into the slot at `loc` and log the change.
pub fn write_dinode(tp: &mut Transaction, loc: &InodeLocation, core: &DinodeCore) -> Result<()> {
    let start = loc.offset as usize;
    let buf = tp.buf_mut(loc.block)?;
    let Some(slot) = buf.get_mut(start..start + DINODE_CORE_SIZE) else {
        return Err(AgfsError::corruption(loc.block.0, "inode slot past end of block"));
    };
    core.encode(slot);
    Ok(())
}
