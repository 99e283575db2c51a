#![forbid(unsafe_code)]
//! Inode allocation manager.
//!
//! Inodes live in chunks of 64, each backed by a run of contiguous blocks
//! taken from the AG's free space and indexed by one record in the AG's
//! inode tree. A record's free mask has a 1 bit for every unused inode.
//!
//! - [`dialloc`] picks an AG (the parent's first), creates a chunk there if
//!   the AG has no free inode, and hands out the lowest free inode of the
//!   chunk nearest the parent.
//! - [`difree`] marks an inode free again, rejects double frees, and gives
//!   an emptied chunk's blocks back unless the policy keeps empty chunks.
//! - [`imap`] turns an inode number into its cluster, block and offset.
//! - [`verify_inobt`] scrubs one AG's inode tree against its AGI.
//!
//! The caller holds the AG lock of every AG touched and a transaction
//! with a create (or remove) reservation; chunk blocks and inode tree
//! splits are charged to it.

pub mod agi;
pub mod chunk;
pub mod ialloc;
pub mod imap;
pub mod tree;
pub mod verify;

pub use agi::AgiState;
pub use ialloc::{DEFAULT_SEARCH_DISTANCE, Freed, IallocPolicy};
pub use imap::{InodeLocation, imap, imap_untrusted, read_dinode, write_dinode};
pub use tree::InodeTree;
pub use verify::{InodeTreeReport, verify_inobt};

use agfs_alloc::freelist::freelist_need;
use agfs_alloc::{AgLockSet, AgfState, space_available};
use agfs_btree::Cursor;
use agfs_btree::node::Node;
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{Agi, INO_ROOT_AGBLOCK};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber, InodeNumber};
use tracing::{debug, info, trace};

// ── AG initialisation ───────────────────────────────────────────────────────

/// Write a fresh AGI and an empty inode tree leaf for `agno`.
pub fn init_inodes(tp: &mut Transaction, agno: AgNumber) -> Result<Agi> {
    let geo = *tp.geometry();
    let agi = Agi {
        seqno: agno.0,
        length: geo.ag_blocks_of(agno),
        root: INO_ROOT_AGBLOCK,
        ..Agi::default()
    };
    let fsb = agi::agi_fsb(tp, agno);
    agi.encode(tp.get_buf(fsb)?);

    let mut st = AgiState { agno, agi };
    let loc = Cursor::new(&st.tree(), tp).loc();
    Node::empty(&loc, AgBlock(INO_ROOT_AGBLOCK), 0).store_new(tp, &loc)?;
    info!(agno = agno.0, root = INO_ROOT_AGBLOCK, "ialloc_ag_initialised");
    Ok(agi)
}

// ── Volume-wide entry points ────────────────────────────────────────────────

/// Whether `agno` could take a new chunk under this transaction: the
/// reservation covers the chunk plus a full-height inode tree split, and
/// the AG has that much room beyond what its free list needs.
fn chunk_space(tp: &mut Transaction, agno: AgNumber) -> Result<bool> {
    let geo = *tp.geometry();
    let need = u64::from(geo.chunk_blocks) + u64::from(geo.inobt_maxlevels);
    if tp.blocks_left() < need {
        trace!(agno = agno.0, left = tp.blocks_left(), need, "ialloc_reservation_short");
        return Ok(false);
    }
    let agf = AgfState::peek(tp, agno)?;
    let usable = u64::from(agf.freeblks) + u64::from(agf.flcount);
    let flneed = u64::from(freelist_need(tp, &agf));
    Ok(space_available(tp, &agf, geo.chunk_blocks) && usable >= flneed + need)
}

/// Release `agno` unless this transaction has joined one of its headers.
fn release_untouched(tp: &Transaction, locks: &mut AgLockSet<'_>, agno: AgNumber) {
    let geo = tp.geometry();
    let agf = geo.agb_to_fsb(agno, AgBlock(agfs_ondisk::AGF_AGBLOCK));
    if !tp.is_joined(agf) && !tp.is_joined(agi::agi_fsb(tp, agno)) {
        locks.unlock(agno);
    }
}

/// Allocate an inode, near `parent` when given. AGs are tried from the
/// parent's AG upward, wrapping. `Ok(None)` when no AG has a free inode
/// or room for a new chunk.
pub fn dialloc(
    tp: &mut Transaction,
    locks: &mut AgLockSet<'_>,
    parent: Option<InodeNumber>,
    policy: &IallocPolicy,
) -> Result<Option<InodeNumber>> {
    let geo = *tp.geometry();
    let (first, hint) = match parent.and_then(|ino| geo.ino_to_ag(ino)) {
        Some((agno, agino)) => (agno, Some(agino)),
        None => (AgNumber(0), None),
    };
    for i in 0..geo.ag_count {
        let agno = AgNumber((first.0 + i) % geo.ag_count);
        if !locks.lock(agno)? {
            continue;
        }
        let agi = AgiState::peek(tp, agno)?;
        if agi.freecount == 0 && !chunk_space(tp, agno)? {
            trace!(agno = agno.0, "ialloc_ag_skipped");
            release_untouched(tp, locks, agno);
            continue;
        }
        let mut st = AgiState::read(tp, agno)?;
        let near = if agno == first { hint } else { None };
        if let Some(agino) = ialloc::alloc_inode(tp, &mut st, near, policy)? {
            let ino = geo.ino_of(agno, agino);
            debug!(ino = ino.0, agno = agno.0, agino = agino.0, parent = ?parent, "dialloc_done");
            return Ok(Some(ino));
        }
        release_untouched(tp, locks, agno);
    }
    debug!(parent = ?parent, "dialloc_no_space");
    Ok(None)
}

/// Free inode `ino`, a number the filesystem handed out.
pub fn difree(
    tp: &mut Transaction,
    locks: &mut AgLockSet<'_>,
    ino: InodeNumber,
    policy: &IallocPolicy,
) -> Result<Freed> {
    let (agno, agino) = imap::split_trusted_ino(tp, ino)?;
    if !locks.lock(agno)? {
        return Err(AgfsError::Busy(format!("allocation group {} is locked", agno.0)));
    }
    let mut st = AgiState::read(tp, agno)?;
    let freed = ialloc::free_inode(tp, &mut st, agino, policy)?;
    debug!(ino = ino.0, agno = agno.0, agino = agino.0, freed = ?freed, "difree_done");
    Ok(freed)
}
