//! Binding of the inode chunk tree to the btree engine.
//!
//! Unlike the free-space trees, the inode tree takes its blocks from
//! ordinary allocation in its own AG, so a split is charged to the
//! transaction's block reservation.

use crate::agi::AgiState;
use agfs_alloc::{AgAllocRequest, AgAllocType, alloc_in_ag, free_in_ag};
use agfs_btree::BtreeOps;
use agfs_error::Result;
use agfs_ondisk::BtreeKind;
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber};
use tracing::debug;

pub struct InodeTree<'a> {
    state: &'a mut AgiState,
}

impl<'a> InodeTree<'a> {
    pub fn new(state: &'a mut AgiState) -> Self {
        Self { state }
    }
}

impl BtreeOps for InodeTree<'_> {
    fn kind(&self) -> BtreeKind {
        BtreeKind::Ino
    }

    fn agno(&self) -> AgNumber {
        self.state.agno
    }

    fn root(&self) -> (AgBlock, u32) {
        (AgBlock(self.state.agi.root), self.state.agi.level)
    }

    fn set_root(&mut self, tp: &mut Transaction, root: AgBlock, levels: u32) -> Result<()> {
        self.state.agi.root = root.0;
        self.state.agi.level = levels;
        debug!(
            agno = self.state.agno.0,
            root = root.0,
            levels,
            "inobt_new_root"
        );
        self.state.write(tp)
    }

    fn alloc_block(&mut self, tp: &mut Transaction, near: AgBlock) -> Result<Option<AgBlock>> {
        let req = AgAllocRequest::new(AgAllocType::Near(near), 1, 1);
        Ok(alloc_in_ag(tp, self.state.agno, &req)?.map(|ext| ext.start))
    }

    fn free_block(&mut self, tp: &mut Transaction, block: AgBlock) -> Result<()> {
        free_in_ag(tp, self.state.agno, block, 1)
    }
}
