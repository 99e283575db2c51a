//! Decoded AGI of one allocation group, bound to a transaction.

use crate::tree::InodeTree;
use agfs_block::corrupt_at;
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{AGI_AGBLOCK, Agi};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber, BlockNumber};
use tracing::error;

#[derive(Debug)]
pub struct AgiState {
    pub agno: AgNumber,
    pub agi: Agi,
}

pub(crate) fn agi_fsb(tp: &Transaction, agno: AgNumber) -> BlockNumber {
    tp.geometry().agb_to_fsb(agno, AgBlock(AGI_AGBLOCK))
}

fn decode_agi(tp: &Transaction, agno: AgNumber, fsb: BlockNumber, bytes: &[u8]) -> Result<Agi> {
    let geo = tp.geometry();
    let agi = Agi::parse_from_bytes(bytes).map_err(corrupt_at(fsb))?;
    agi.validate(agno.0, geo.ag_blocks_of(agno), geo.inobt_maxlevels)
        .map_err(corrupt_at(fsb))?;
    Ok(agi)
}

impl AgiState {
    /// Join the AGI of `agno` to `tp` and decode it.
    pub fn read(tp: &mut Transaction, agno: AgNumber) -> Result<Self> {
        if agno.0 >= tp.geometry().ag_count {
            return Err(AgfsError::InvalidArgument(format!(
                "allocation group {} out of range",
                agno.0
            )));
        }
        let fsb = agi_fsb(tp, agno);
        let bytes = tp.read_buf(fsb)?.to_vec();
        let agi = decode_agi(tp, agno, fsb, &bytes)?;
        Ok(Self { agno, agi })
    }

    /// Current AGI without joining it; see `AgfState::peek`.
    pub fn peek(tp: &mut Transaction, agno: AgNumber) -> Result<Agi> {
        let fsb = agi_fsb(tp, agno);
        if tp.is_joined(fsb) {
            let bytes = tp.read_buf(fsb)?.to_vec();
            return decode_agi(tp, agno, fsb, &bytes);
        }
        let image = tp.manager().bufs().read(fsb)?;
        decode_agi(tp, agno, fsb, &image)
    }

    pub fn write(&self, tp: &mut Transaction) -> Result<()> {
        let fsb = agi_fsb(tp, self.agno);
        self.agi.encode(tp.buf_mut(fsb)?);
        Ok(())
    }

    pub fn tree(&mut self) -> InodeTree<'_> {
        InodeTree::new(self)
    }

    pub(crate) fn corrupt(&self, tp: &Transaction, detail: String) -> AgfsError {
        error!(
            agno = self.agno.0,
            detail = %detail,
            invariant = "inode_chunks_consistent",
            "ialloc_invariant_violation"
        );
        AgfsError::corruption(agi_fsb(tp, self.agno).0, detail)
    }
}
