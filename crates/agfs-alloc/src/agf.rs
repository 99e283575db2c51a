//! Decoded AGF and free list of one allocation group, bound to a transaction.
//!
//! An [`AgfState`] lives for a single allocator call. It is read through the
//! transaction (locking the AGF buffer until commit) and every change is
//! encoded straight back into the staged buffer, so a second `AgfState` for
//! the same AG later in the same transaction sees the current values.

use crate::tree::FreeSpaceTree;
use agfs_block::corrupt_at;
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{AGF_AGBLOCK, AGFL_AGBLOCK, Agf, AgflBlock, BtreeKind};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber, BlockNumber, NULL_AGBLOCK};
use tracing::{error, trace};

/// First block past the fixed AG headers; nothing below it is ever free.
pub const FIRST_DATA_AGBLOCK: u32 = agfs_ondisk::BNO_ROOT_AGBLOCK;

#[derive(Debug)]
pub struct AgfState {
    pub agno: AgNumber,
    pub agf: Agf,
    agfl: Option<AgflBlock>,
}

pub(crate) fn agf_fsb(tp: &Transaction, agno: AgNumber) -> BlockNumber {
    tp.geometry().agb_to_fsb(agno, AgBlock(AGF_AGBLOCK))
}

fn agfl_fsb(tp: &Transaction, agno: AgNumber) -> BlockNumber {
    tp.geometry().agb_to_fsb(agno, AgBlock(AGFL_AGBLOCK))
}

/// Decode and sanity-check an AGF image.
fn decode_agf(tp: &Transaction, agno: AgNumber, fsb: BlockNumber, bytes: &[u8]) -> Result<Agf> {
    let geo = tp.geometry();
    let agf = Agf::parse_from_bytes(bytes).map_err(corrupt_at(fsb))?;
    agf.validate(
        agno.0,
        geo.ag_blocks_of(agno),
        geo.agfl_size,
        geo.alloc_maxlevels,
    )
    .map_err(corrupt_at(fsb))?;
    Ok(agf)
}

impl AgfState {
    /// Join the AGF of `agno` to `tp` and decode it.
    pub fn read(tp: &mut Transaction, agno: AgNumber) -> Result<Self> {
        if agno.0 >= tp.geometry().ag_count {
            return Err(AgfsError::InvalidArgument(format!(
                "allocation group {} out of range",
                agno.0
            )));
        }
        let fsb = agf_fsb(tp, agno);
        let bytes = tp.read_buf(fsb)?.to_vec();
        let agf = decode_agf(tp, agno, fsb, &bytes)?;
        Ok(Self {
            agno,
            agf,
            agfl: None,
        })
    }

    /// State for an AGF that is being written from scratch.
    #[must_use]
    pub fn detached(agno: AgNumber, agf: Agf) -> Self {
        Self {
            agno,
            agf,
            agfl: None,
        }
    }

    /// Current AGF without joining it: the staged copy if this transaction
    /// already holds it, else the last committed image. The caller must
    /// hold the AG lock.
    pub fn peek(tp: &mut Transaction, agno: AgNumber) -> Result<Agf> {
        let fsb = agf_fsb(tp, agno);
        if tp.is_joined(fsb) {
            let bytes = tp.read_buf(fsb)?.to_vec();
            return decode_agf(tp, agno, fsb, &bytes);
        }
        let image = tp.manager().bufs().read(fsb)?;
        decode_agf(tp, agno, fsb, &image)
    }

    /// Encode the AGF into the staged buffer.
    pub fn write(&self, tp: &mut Transaction) -> Result<()> {
        let fsb = agf_fsb(tp, self.agno);
        self.agf.encode(tp.buf_mut(fsb)?);
        Ok(())
    }

    /// Binding of one of this AG's free-space trees to the btree engine.
    pub fn tree(&mut self, kind: BtreeKind) -> FreeSpaceTree<'_> {
        FreeSpaceTree::new(kind, self)
    }

    pub(crate) fn corrupt(&self, tp: &Transaction, detail: String) -> AgfsError {
        error!(
            agno = self.agno.0,
            detail = %detail,
            invariant = "free_space_consistent",
            "alloc_invariant_violation"
        );
        AgfsError::corruption(agf_fsb(tp, self.agno).0, detail)
    }

    // ── Free list ───────────────────────────────────────────────────────

    fn agfl(&mut self, tp: &mut Transaction) -> Result<&mut AgflBlock> {
        if self.agfl.is_none() {
            let fsb = agfl_fsb(tp, self.agno);
            let parsed = AgflBlock::parse_from_bytes(tp.read_buf(fsb)?).map_err(corrupt_at(fsb))?;
            if parsed.seqno != self.agno.0 {
                return Err(self.corrupt(tp, format!("free list seqno {}", parsed.seqno)));
            }
            self.agfl = Some(parsed);
        }
        self.agfl
            .as_mut()
            .ok_or_else(|| AgfsError::NotFound("free list".to_owned()))
    }

    fn write_agfl(&mut self, tp: &mut Transaction) -> Result<()> {
        let fsb = agfl_fsb(tp, self.agno);
        let Some(agfl) = self.agfl.as_ref() else {
            return Ok(());
        };
        let encoded = {
            let mut buf = tp.read_buf(fsb)?.to_vec();
            agfl.encode(&mut buf);
            buf
        };
        tp.buf_mut(fsb)?.copy_from_slice(&encoded);
        Ok(())
    }

    /// Blocks currently on the free list, head first.
    pub fn freelist_blocks(&mut self, tp: &mut Transaction) -> Result<Vec<AgBlock>> {
        let size = tp.geometry().agfl_size;
        let (first, count) = (self.agf.flfirst, self.agf.flcount);
        let agfl = self.agfl(tp)?;
        Ok((0..count)
            .map(|i| AgBlock(agfl.slots[((first + i) % size) as usize]))
            .collect())
    }

    /// Take the block at the head of the free list.
    pub fn get_freelist(&mut self, tp: &mut Transaction) -> Result<Option<AgBlock>> {
        if self.agf.flcount == 0 {
            return Ok(None);
        }
        let size = tp.geometry().agfl_size;
        let length = self.agf.length;
        let first = self.agf.flfirst;
        let agfl = self.agfl(tp)?;
        let block = agfl.slots[first as usize];
        agfl.slots[first as usize] = NULL_AGBLOCK;
        if block < FIRST_DATA_AGBLOCK || block >= length {
            return Err(self.corrupt(tp, format!("free list slot {first} holds block {block}")));
        }
        self.agf.flfirst = (first + 1) % size;
        self.agf.flcount -= 1;
        self.write_agfl(tp)?;
        self.write(tp)?;
        trace!(agno = self.agno.0, agbno = block, left = self.agf.flcount, "agfl_get");
        Ok(Some(AgBlock(block)))
    }

    /// Append `block` to the tail of the free list.
    pub fn put_freelist(&mut self, tp: &mut Transaction, block: AgBlock) -> Result<()> {
        let size = tp.geometry().agfl_size;
        if self.agf.flcount >= size {
            return Err(self.corrupt(tp, format!("free list full putting block {}", block.0)));
        }
        if block.0 < FIRST_DATA_AGBLOCK || block.0 >= self.agf.length {
            return Err(AgfsError::InvalidArgument(format!(
                "block {} cannot go on the free list of AG {}",
                block.0, self.agno.0
            )));
        }
        let last = (self.agf.fllast + 1) % size;
        let agfl = self.agfl(tp)?;
        agfl.slots[last as usize] = block.0;
        self.agf.fllast = last;
        self.agf.flcount += 1;
        self.write_agfl(tp)?;
        self.write(tp)?;
        trace!(agno = self.agno.0, agbno = block.0, count = self.agf.flcount, "agfl_put");
        Ok(())
    }
}
