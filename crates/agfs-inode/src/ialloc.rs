//! Handing out and taking back inodes inside one allocation group.
//!
//! Picking a chunk with a free inode goes, in order:
//!
//! | Step | Source |
//! |------|--------|
//! | 1 | the chunk holding the locality hint, then its neighbours outward, nearest first, for at most `search_distance` records |
//! | 2 | the most recently created chunk (`newino`) |
//! | 3 | the first chunk with a free inode, scanning from the start of the tree |
//!
//! Within a chunk the lowest-numbered free inode is used.

use crate::agi::AgiState;
use crate::chunk;
use agfs_btree::{Cursor, LookupDir};
use agfs_error::Result;
use agfs_ondisk::{BtreeKey, InobtRec, Record};
use agfs_trans::{SbField, Transaction};
use agfs_types::{AgBlock, AgInode, NULL_AGINO};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Default number of neighbouring chunk records examined around the
/// locality hint.
pub const DEFAULT_SEARCH_DISTANCE: u32 = 10;

/// Inode allocation policy, fixed at mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IallocPolicy {
    /// Keep chunks whose inodes are all free instead of returning their
    /// blocks.
    pub keep_empty_chunks: bool,
    pub search_distance: u32,
}

impl Default for IallocPolicy {
    fn default() -> Self {
        Self {
            keep_empty_chunks: false,
            search_distance: DEFAULT_SEARCH_DISTANCE,
        }
    }
}

/// What freeing an inode did to its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freed {
    /// The inode was marked free; its chunk stays.
    Inode,
    /// The chunk became empty and its blocks were returned.
    Chunk { start: AgBlock, blocks: u32 },
}

fn ino_key(start_ino: u32) -> BtreeKey {
    BtreeKey::Ino { start_ino }
}

/// Chunk record under `cur`, checked for a consistent free mask.
fn chunk_rec(cur: &Cursor, tp: &mut Transaction, st: &AgiState) -> Result<Option<InobtRec>> {
    let Some(rec) = cur.get_rec(tp)?.and_then(|r| r.inode()) else {
        return Ok(None);
    };
    if !rec.mask_consistent() || rec.free_count < 0 {
        return Err(st.corrupt(
            tp,
            format!(
                "chunk {} free_count {} disagrees with mask {:#018x}",
                rec.start_ino, rec.free_count, rec.free_mask
            ),
        ));
    }
    Ok(Some(rec))
}

fn next_rec(
    cur: &mut Cursor,
    tp: &mut Transaction,
    st: &AgiState,
    forward: bool,
) -> Result<Option<InobtRec>> {
    let moved = if forward {
        cur.increment(tp)?
    } else {
        cur.decrement(tp)?
    };
    if moved { chunk_rec(cur, tp, st) } else { Ok(None) }
}

/// Step 1: the hint's chunk and its neighbours.
fn search_near(
    tp: &mut Transaction,
    st: &mut AgiState,
    pagino: AgInode,
    distance: u32,
) -> Result<Option<(Cursor, InobtRec)>> {
    let key = ino_key(pagino.0);
    let mut cur = Cursor::new(&st.tree(), tp);
    let found = cur.lookup(tp, &st.tree(), &key, LookupDir::Le)?
        || cur.lookup(tp, &st.tree(), &key, LookupDir::Ge)?;
    if !found {
        return Ok(None);
    }
    let Some(rec) = chunk_rec(&cur, tp, st)? else {
        return Ok(None);
    };
    if rec.free_count > 0 {
        return Ok(Some((cur, rec)));
    }

    let mut left = cur.clone();
    let mut right = cur;
    let mut left_rec = next_rec(&mut left, tp, st, false)?;
    let mut right_rec = next_rec(&mut right, tp, st, true)?;
    for _ in 0..distance {
        let go_left = match (left_rec, right_rec) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(l), Some(r)) => pagino.0.abs_diff(l.start_ino) <= r.start_ino.abs_diff(pagino.0),
        };
        if go_left {
            if let Some(rec) = left_rec.filter(|r| r.free_count > 0) {
                return Ok(Some((left, rec)));
            }
            left_rec = next_rec(&mut left, tp, st, false)?;
        } else {
            if let Some(rec) = right_rec.filter(|r| r.free_count > 0) {
                return Ok(Some((right, rec)));
            }
            right_rec = next_rec(&mut right, tp, st, true)?;
        }
    }
    trace!(agno = st.agno.0, pagino = pagino.0, distance, "ialloc_near_search_exhausted");
    Ok(None)
}

fn find_free(
    tp: &mut Transaction,
    st: &mut AgiState,
    hint: Option<AgInode>,
    policy: &IallocPolicy,
) -> Result<Option<(Cursor, InobtRec)>> {
    if let Some(pagino) = hint {
        if let Some(found) = search_near(tp, st, pagino, policy.search_distance)? {
            return Ok(Some(found));
        }
    }

    if st.agi.newino != NULL_AGINO {
        let key = ino_key(st.agi.newino);
        let mut cur = Cursor::new(&st.tree(), tp);
        if cur.lookup(tp, &st.tree(), &key, LookupDir::Eq)? {
            if let Some(rec) = chunk_rec(&cur, tp, st)?.filter(|r| r.free_count > 0) {
                return Ok(Some((cur, rec)));
            }
        }
    }

    let mut cur = Cursor::new(&st.tree(), tp);
    let mut more = cur.lookup(tp, &st.tree(), &ino_key(0), LookupDir::Ge)?;
    while more {
        let Some(rec) = chunk_rec(&cur, tp, st)? else {
            break;
        };
        if rec.free_count > 0 {
            return Ok(Some((cur, rec)));
        }
        more = cur.increment(tp)?;
    }
    Ok(None)
}

/// Allocate one inode in the AG of `st`, creating a chunk first when the
/// AG has no free inode. `Ok(None)` when no chunk could be created.
pub fn alloc_inode(
    tp: &mut Transaction,
    st: &mut AgiState,
    hint: Option<AgInode>,
    policy: &IallocPolicy,
) -> Result<Option<AgInode>> {
    if st.agi.freecount == 0 {
        let near = hint.map(|agino| tp.geometry().agino_to_agbno(agino));
        if chunk::create_chunk(tp, st, near)?.is_none() {
            return Ok(None);
        }
    }

    let Some((mut cur, rec)) = find_free(tp, st, hint, policy)? else {
        return Err(st.corrupt(
            tp,
            format!("AGI counts {} free inodes but no chunk has one", st.agi.freecount),
        ));
    };
    let Some(offset) = rec.first_free() else {
        return Err(st.corrupt(tp, format!("chunk {} has no free inode", rec.start_ino)));
    };
    let updated = InobtRec {
        free_count: rec.free_count - 1,
        free_mask: rec.free_mask & !(1_u64 << offset),
        ..rec
    };
    cur.update(tp, &st.tree(), &Record::InodeChunk(updated))?;

    let Some(freecount) = st.agi.freecount.checked_sub(1) else {
        return Err(st.corrupt(tp, "free inode count underflow".to_owned()));
    };
    st.agi.freecount = freecount;
    st.write(tp)?;
    tp.mod_sb(SbField::Ifree, -1)?;

    let agino = AgInode(rec.start_ino + offset);
    debug!(
        agno = st.agno.0,
        agino = agino.0,
        chunk = rec.start_ino,
        chunk_free = updated.free_count,
        ag_free = st.agi.freecount,
        "ialloc_inode_allocated"
    );
    Ok(Some(agino))
}

/// Mark `agino` free. Freeing an inode that is already free is corruption
/// and changes nothing.
pub fn free_inode(
    tp: &mut Transaction,
    st: &mut AgiState,
    agino: AgInode,
    policy: &IallocPolicy,
) -> Result<Freed> {
    let mut cur = Cursor::new(&st.tree(), tp);
    if !cur.lookup(tp, &st.tree(), &ino_key(agino.0), LookupDir::Le)? {
        return Err(st.corrupt(tp, format!("no chunk holds inode {}", agino.0)));
    }
    let Some(rec) = chunk_rec(&cur, tp, st)?.filter(|r| r.contains(agino.0)) else {
        return Err(st.corrupt(tp, format!("no chunk holds inode {}", agino.0)));
    };
    let offset = agino.0 - rec.start_ino;
    if rec.is_free(offset) {
        return Err(st.corrupt(
            tp,
            format!("inode {} freed twice (chunk {})", agino.0, rec.start_ino),
        ));
    }
    let updated = InobtRec {
        free_count: rec.free_count + 1,
        free_mask: rec.free_mask | (1_u64 << offset),
        ..rec
    };

    if updated.free_mask == u64::MAX && !policy.keep_empty_chunks {
        let (start, blocks) = chunk::remove_chunk(tp, st, &mut cur, &rec)?;
        return Ok(Freed::Chunk { start, blocks });
    }

    cur.update(tp, &st.tree(), &Record::InodeChunk(updated))?;
    st.agi.freecount += 1;
    if st.agi.freecount > st.agi.count {
        return Err(st.corrupt(
            tp,
            format!("free inodes {} exceed inodes {}", st.agi.freecount, st.agi.count),
        ));
    }
    st.write(tp)?;
    tp.mod_sb(SbField::Ifree, 1)?;
    debug!(
        agno = st.agno.0,
        agino = agino.0,
        chunk = rec.start_ino,
        chunk_free = updated.free_count,
        "ialloc_inode_freed"
    );
    Ok(Freed::Inode)
}
