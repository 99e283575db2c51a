//! Creating and removing inode chunks.

use crate::agi::AgiState;
use agfs_alloc::{AgAllocRequest, AgAllocType, AgExtent, alloc_in_ag, free_in_ag};
use agfs_btree::Cursor;
use agfs_error::Result;
use agfs_ondisk::{DinodeCore, InobtRec, Record};
use agfs_trans::{SbField, Transaction};
use agfs_types::{AgBlock, AgInode, INODES_PER_CHUNK, NULL_AGINO};
use tracing::{debug, trace};

/// Blocks for a new chunk: right after the newest chunk if that spot is
/// free and aligned, else near `hint` with inode alignment.
fn alloc_chunk_blocks(
    tp: &mut Transaction,
    st: &AgiState,
    hint: Option<AgBlock>,
) -> Result<Option<AgExtent>> {
    let geo = *tp.geometry();
    let blocks = geo.chunk_blocks;
    let align = geo.inode_align;
    if st.agi.newino != NULL_AGINO {
        let next = geo.agino_to_agbno(AgInode(st.agi.newino)).0 + blocks;
        if next % align == 0 && next + blocks <= geo.ag_blocks_of(st.agno) {
            let req = AgAllocRequest::new(AgAllocType::Exact(AgBlock(next)), blocks, blocks);
            if let Some(ext) = alloc_in_ag(tp, st.agno, &req)? {
                return Ok(Some(ext));
            }
        }
    }
    let kind = match hint {
        Some(block) => AgAllocType::Near(block),
        None => AgAllocType::Anywhere { near: None },
    };
    let req = AgAllocRequest::new(kind, blocks, blocks).aligned(align);
    alloc_in_ag(tp, st.agno, &req)
}

/// Write the unused marker into every inode slot of the chunk's blocks.
fn init_chunk_inodes(tp: &mut Transaction, ext: &AgExtent) -> Result<()> {
    let geo = *tp.geometry();
    let inode_size = geo.inode_size as usize;
    // Generation numbers only need to differ between reuses of a slot.
    let generation = u32::try_from(tp.tid().0 & u64::from(u32::MAX)).unwrap_or(0);
    let unused = DinodeCore::unused(generation);
    for offset in 0..ext.len {
        let fsb = geo.agb_to_fsb(ext.agno, AgBlock(ext.start.0 + offset));
        let buf = tp.get_buf(fsb)?;
        for slot in buf.chunks_exact_mut(inode_size) {
            unused.encode(slot);
        }
    }
    trace!(agno = ext.agno.0, agbno = ext.start.0, blocks = ext.len, "ialloc_chunk_initialised");
    Ok(())
}

/// Allocate, initialise and index a new all-free chunk. `Ok(None)` when
/// the AG has no suitably aligned room.
pub fn create_chunk(
    tp: &mut Transaction,
    st: &mut AgiState,
    hint: Option<AgBlock>,
) -> Result<Option<InobtRec>> {
    let Some(ext) = alloc_chunk_blocks(tp, st, hint)? else {
        debug!(agno = st.agno.0, "ialloc_chunk_no_space");
        return Ok(None);
    };
    init_chunk_inodes(tp, &ext)?;

    let geo = *tp.geometry();
    let rec = InobtRec::all_free(geo.agbno_to_agino(ext.start, 0).0);
    let mut cur = Cursor::new(&st.tree(), tp);
    cur.insert(tp, &mut st.tree(), &Record::InodeChunk(rec))?;

    st.agi.count += INODES_PER_CHUNK;
    st.agi.freecount += INODES_PER_CHUNK;
    st.agi.newino = rec.start_ino;
    st.write(tp)?;
    tp.mod_sb(SbField::Icount, i64::from(INODES_PER_CHUNK))?;
    tp.mod_sb(SbField::Ifree, i64::from(INODES_PER_CHUNK))?;
    debug!(
        agno = st.agno.0,
        agbno = ext.start.0,
        start_ino = rec.start_ino,
        count = st.agi.count,
        "ialloc_chunk_created"
    );
    Ok(Some(rec))
}

/// Drop the record under `cur`, whose chunk has just become entirely free
/// with the inode being released, and give its blocks back.
pub fn remove_chunk(
    tp: &mut Transaction,
    st: &mut AgiState,
    cur: &mut Cursor,
    rec: &InobtRec,
) -> Result<(AgBlock, u32)> {
    let geo = *tp.geometry();
    cur.delete(tp, &mut st.tree())?;

    // The inode being freed was still counted as in use.
    let free_before = INODES_PER_CHUNK - 1;
    let Some(count) = st.agi.count.checked_sub(INODES_PER_CHUNK) else {
        return Err(st.corrupt(tp, format!("inode count {} below one chunk", st.agi.count)));
    };
    let Some(freecount) = st.agi.freecount.checked_sub(free_before) else {
        return Err(st.corrupt(
            tp,
            format!("free inode count {} below chunk {}", st.agi.freecount, rec.start_ino),
        ));
    };
    st.agi.count = count;
    st.agi.freecount = freecount;
    if st.agi.newino == rec.start_ino {
        st.agi.newino = NULL_AGINO;
    }
    st.write(tp)?;
    tp.mod_sb(SbField::Icount, -i64::from(INODES_PER_CHUNK))?;
    tp.mod_sb(SbField::Ifree, -i64::from(free_before))?;

    let start = geo.agino_to_agbno(AgInode(rec.start_ino));
    free_in_ag(tp, st.agno, start, geo.chunk_blocks)?;
    debug!(
        agno = st.agno.0,
        agbno = start.0,
        start_ino = rec.start_ino,
        count = st.agi.count,
        "ialloc_chunk_removed"
    );
    Ok((start, geo.chunk_blocks))
}
