//! Binding of the by-bno and by-size free-space trees to the btree engine.
//!
//! Both trees take new blocks from the AG free list and return freed blocks
//! to it, never from ordinary allocation: a split in the middle of an
//! allocation must not recurse into the allocator. The blocks move between
//! `flcount` and `btreeblks`, so the global free block count is unchanged.

use crate::agf::AgfState;
use agfs_btree::BtreeOps;
use agfs_error::Result;
use agfs_ondisk::BtreeKind;
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber};
use tracing::debug;

pub struct FreeSpaceTree<'a> {
    kind: BtreeKind,
    state: &'a mut AgfState,
}

impl<'a> FreeSpaceTree<'a> {
    pub fn new(kind: BtreeKind, state: &'a mut AgfState) -> Self {
        debug_assert!(matches!(kind, BtreeKind::Bno | BtreeKind::Cnt));
        Self { kind, state }
    }
}

impl BtreeOps for FreeSpaceTree<'_> {
    fn kind(&self) -> BtreeKind {
        self.kind
    }

    fn agno(&self) -> AgNumber {
        self.state.agno
    }

    fn root(&self) -> (AgBlock, u32) {
        let agf = &self.state.agf;
        match self.kind {
            BtreeKind::Cnt => (AgBlock(agf.cnt_root), agf.cnt_level),
            _ => (AgBlock(agf.bno_root), agf.bno_level),
        }
    }

    fn set_root(&mut self, tp: &mut Transaction, root: AgBlock, levels: u32) -> Result<()> {
        let agf = &mut self.state.agf;
        match self.kind {
            BtreeKind::Cnt => {
                agf.cnt_root = root.0;
                agf.cnt_level = levels;
            }
            _ => {
                agf.bno_root = root.0;
                agf.bno_level = levels;
            }
        }
        debug!(
            agno = self.state.agno.0,
            tree = self.kind.name(),
            root = root.0,
            levels,
            "alloc_btree_new_root"
        );
        self.state.write(tp)
    }

    fn alloc_block(&mut self, tp: &mut Transaction, _near: AgBlock) -> Result<Option<AgBlock>> {
        let Some(block) = self.state.get_freelist(tp)? else {
            return Ok(None);
        };
        self.state.agf.btreeblks += 1;
        self.state.write(tp)?;
        Ok(Some(block))
    }

    fn free_block(&mut self, tp: &mut Transaction, block: AgBlock) -> Result<()> {
        self.state.put_freelist(tp, block)?;
        self.state.agf.btreeblks = self.state.agf.btreeblks.saturating_sub(1);
        self.state.write(tp)
    }
}
