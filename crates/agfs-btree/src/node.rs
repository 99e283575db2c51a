//! Decoded btree blocks.
//!
//! Block layout (short-pointer form, all AG btrees):
//!
//! ```text
//! leaf:     header(16) | rec[0] rec[1] ... rec[numrecs-1]
//! interior: header(16) | key[0] ... key[node_max-1] | ptr[0] ... ptr[node_max-1]
//! ```
//!
//! Pointer slots start after room for `node_max` keys, so a key insert never
//! moves the pointer array.

use agfs_block::corrupt_at;
use agfs_error::{AgfsError, Result};
use agfs_ondisk::btree::SHORT_PTR_SIZE;
use agfs_ondisk::{BtreeKey, BtreeKind, Record, SHORT_HEADER_SIZE, ShortBtreeHeader};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber, BlockNumber, put_be_u32, read_be_u32};
use tracing::error;

// ── Bounded container ───────────────────────────────────────────────────────

/// Sorted-array storage with a hard capacity. Every mutation is bounds
/// checked; an insert into a full container hands the item back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounded<T> {
    items: Vec<T>,
    cap: usize,
}

impl<T> Bounded<T> {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            items: Vec::with_capacity(cap),
            cap,
        }
    }

    /// `None` if `items` does not fit.
    #[must_use]
    pub fn from_vec(items: Vec<T>, cap: usize) -> Option<Self> {
        (items.len() <= cap).then_some(Self { items, cap })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.cap
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Shift `items[index..]` right by one and store `item` at `index`.
    pub fn insert(&mut self, index: usize, item: T) -> std::result::Result<(), T> {
        if self.is_full() || index > self.items.len() {
            return Err(item);
        }
        self.items.insert(index, item);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Replace `items[index]`, returning the old value.
    pub fn replace(&mut self, index: usize, item: T) -> Option<T> {
        self.items
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, item))
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn append(&mut self, other: Vec<T>) -> std::result::Result<(), Vec<T>> {
        if self.items.len() + other.len() > self.cap {
            return Err(other);
        }
        self.items.extend(other);
        Ok(())
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

// ── Entries ─────────────────────────────────────────────────────────────────

/// A leaf record or an interior key/child pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Rec(Record),
    Ptr(BtreeKey, AgBlock),
}

impl Entry {
    #[must_use]
    pub fn key(&self, kind: BtreeKind) -> BtreeKey {
        match self {
            Self::Rec(rec) => kind.key_of(rec),
            Self::Ptr(key, _) => *key,
        }
    }

    /// Bytes the entry occupies in its block.
    #[must_use]
    pub fn size(&self, kind: BtreeKind) -> usize {
        match self {
            Self::Rec(_) => kind.rec_len(),
            Self::Ptr(..) => kind.key_len() + SHORT_PTR_SIZE,
        }
    }
}

/// Split index for `sizes` (byte weight of each entry, post insert) so that
/// the left half's bytes land closest to half the total. Ties go to the
/// split that leaves the entry at `new_index` in the larger half.
#[must_use]
pub fn split_point(sizes: &[usize], new_index: usize) -> usize {
    let total: usize = sizes.iter().sum();
    let mut best = 1;
    let mut best_dist = usize::MAX;
    let mut left = 0;
    for (k, size) in sizes.iter().enumerate().take(sizes.len().saturating_sub(1)) {
        left += size;
        let split = k + 1;
        let dist = (2 * left).abs_diff(total);
        let better = dist < best_dist || (dist == best_dist && new_index < split);
        if better {
            best = split;
            best_dist = dist;
        }
    }
    best
}

// ── Node ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Node {
    pub block: AgBlock,
    pub level: u32,
    pub leftsib: AgBlock,
    pub rightsib: AgBlock,
    pub entries: Bounded<Entry>,
}

/// Where one tree lives: its kind, AG and capacities.
#[derive(Debug, Clone, Copy)]
pub struct TreeLoc {
    pub kind: BtreeKind,
    pub agno: AgNumber,
    pub leaf_cap: usize,
    pub node_cap: usize,
}

impl TreeLoc {
    #[must_use]
    pub fn cap(&self, level: u32) -> usize {
        if level == 0 { self.leaf_cap } else { self.node_cap }
    }

    #[must_use]
    pub fn fsb(&self, tp: &Transaction, block: AgBlock) -> BlockNumber {
        tp.geometry().agb_to_fsb(self.agno, block)
    }

    pub(crate) fn corrupt(&self, tp: &Transaction, block: AgBlock, detail: String) -> AgfsError {
        let fsb = self.fsb(tp, block);
        error!(
            tree = self.kind.name(),
            agno = self.agno.0,
            agbno = block.0,
            detail = %detail,
            invariant = "btree_block_well_formed",
            "btree_invariant_violation"
        );
        AgfsError::corruption(fsb.0, format!("{} block {}: {detail}", self.kind.name(), block.0))
    }
}

impl Node {
    #[must_use]
    pub fn empty(loc: &TreeLoc, block: AgBlock, level: u32) -> Self {
        Self {
            block,
            level,
            leftsib: AgBlock::NULL,
            rightsib: AgBlock::NULL,
            entries: Bounded::new(loc.cap(level)),
        }
    }

    /// Read and decode `block`, which must sit at `level`.
    pub fn load(tp: &mut Transaction, loc: &TreeLoc, block: AgBlock, level: u32) -> Result<Self> {
        let geo = *tp.geometry();
        if block.is_null() || block.0 >= geo.ag_blocks_of(loc.agno) {
            return Err(loc.corrupt(tp, block, "block pointer outside allocation group".into()));
        }
        let fsb = loc.fsb(tp, block);
        let data = tp.read_buf(fsb)?.to_vec();
        let header = ShortBtreeHeader::parse_from_bytes(&data).map_err(corrupt_at(fsb))?;
        if header.magic != loc.kind.magic() {
            return Err(loc.corrupt(tp, block, format!("bad magic {:#010x}", header.magic)));
        }
        if u32::from(header.level) != level {
            return Err(loc.corrupt(
                tp,
                block,
                format!("level {} where {level} expected", header.level),
            ));
        }
        let count = usize::from(header.numrecs);
        let cap = loc.cap(level);
        if count > cap {
            return Err(loc.corrupt(tp, block, format!("{count} records exceed capacity {cap}")));
        }
        let kind = loc.kind;
        let mut entries = Vec::with_capacity(count);
        if level == 0 {
            let bounds = geo.rec_bounds(loc.agno);
            for i in 0..count {
                let off = SHORT_HEADER_SIZE + i * kind.rec_len();
                let rec = kind
                    .decode_rec(data.get(off..).unwrap_or_default())
                    .map_err(corrupt_at(fsb))?;
                if let Err(why) = kind.check_rec(&rec, &bounds) {
                    return Err(loc.corrupt(tp, block, format!("record {i} {rec}: {why}")));
                }
                entries.push(Entry::Rec(rec));
            }
        } else {
            let ptr_base = SHORT_HEADER_SIZE + kind.node_max(geo.block_size) * kind.key_len();
            for i in 0..count {
                let key_off = SHORT_HEADER_SIZE + i * kind.key_len();
                let key = kind
                    .decode_key(data.get(key_off..).unwrap_or_default())
                    .map_err(corrupt_at(fsb))?;
                let child = read_be_u32(&data, ptr_base + i * SHORT_PTR_SIZE).map_err(corrupt_at(fsb))?;
                entries.push(Entry::Ptr(key, AgBlock(child)));
            }
        }
        let entries = Bounded::from_vec(entries, cap)
            .ok_or_else(|| loc.corrupt(tp, block, "entries exceed capacity".into()))?;
        Ok(Self {
            block,
            level,
            leftsib: AgBlock(header.leftsib),
            rightsib: AgBlock(header.rightsib),
            entries,
        })
    }

    fn encode_into(&self, loc: &TreeLoc, buf: &mut [u8]) -> Result<()> {
        let kind = loc.kind;
        let numrecs = u16::try_from(self.entries.len())
            .map_err(|_| AgfsError::InvalidArgument("btree block entry count".to_owned()))?;
        let level = u16::try_from(self.level)
            .map_err(|_| AgfsError::InvalidArgument("btree level".to_owned()))?;
        buf.fill(0);
        ShortBtreeHeader {
            magic: kind.magic(),
            level,
            numrecs,
            leftsib: self.leftsib.0,
            rightsib: self.rightsib.0,
        }
        .encode(buf);
        let block_size = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let ptr_base = SHORT_HEADER_SIZE + kind.node_max(block_size) * kind.key_len();
        for (i, entry) in self.entries.as_slice().iter().enumerate() {
            let bad = |_| AgfsError::InvalidArgument(format!("{} entry kind mismatch", kind.name()));
            match entry {
                Entry::Rec(rec) => {
                    let off = SHORT_HEADER_SIZE + i * kind.rec_len();
                    kind.encode_rec(rec, &mut buf[off..]).map_err(bad)?;
                }
                Entry::Ptr(key, child) => {
                    let off = SHORT_HEADER_SIZE + i * kind.key_len();
                    kind.encode_key(key, &mut buf[off..]).map_err(bad)?;
                    put_be_u32(buf, ptr_base + i * SHORT_PTR_SIZE, child.0);
                }
            }
        }
        Ok(())
    }

    /// Write back a block joined earlier.
    pub fn store(&self, tp: &mut Transaction, loc: &TreeLoc) -> Result<()> {
        let fsb = loc.fsb(tp, self.block);
        let buf = tp.buf_mut(fsb)?;
        self.encode_into(loc, buf)
    }

    /// Write a freshly allocated block without reading it first.
    pub fn store_new(&self, tp: &mut Transaction, loc: &TreeLoc) -> Result<()> {
        let fsb = loc.fsb(tp, self.block);
        let buf = tp.get_buf(fsb)?;
        self.encode_into(loc, buf)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn key(&self, kind: BtreeKind, index: usize) -> Option<BtreeKey> {
        self.entries.get(index).map(|e| e.key(kind))
    }

    #[must_use]
    pub fn low_key(&self, kind: BtreeKind) -> Option<BtreeKey> {
        self.key(kind, 0)
    }

    #[must_use]
    pub fn child(&self, index: usize) -> Option<AgBlock> {
        match self.entries.get(index) {
            Some(Entry::Ptr(_, child)) => Some(*child),
            _ => None,
        }
    }

    #[must_use]
    pub fn record(&self, index: usize) -> Option<Record> {
        match self.entries.get(index) {
            Some(Entry::Rec(rec)) => Some(*rec),
            _ => None,
        }
    }

    /// Overwrite the key of interior entry `index`.
    pub fn set_key(&mut self, index: usize, key: BtreeKey) -> bool {
        match self.entries.get(index) {
            Some(Entry::Ptr(_, child)) => {
                let child = *child;
                self.entries.replace(index, Entry::Ptr(key, child)).is_some()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_refuses_overflow() {
        let mut b = Bounded::new(2);
        b.insert(0, 10).unwrap();
        b.insert(0, 5).unwrap();
        assert_eq!(b.insert(1, 7), Err(7));
        assert_eq!(b.as_slice(), &[5, 10]);
        assert_eq!(b.remove(5), None);
        assert_eq!(b.append(vec![1]), Err(vec![1]));
        assert!(Bounded::from_vec(vec![1, 2, 3], 2).is_none());
    }

    #[test]
    fn bounded_insert_past_end_is_refused() {
        let mut b: Bounded<u8> = Bounded::new(4);
        assert_eq!(b.insert(1, 9), Err(9));
    }

    #[test]
    fn split_point_halves_uniform_entries() {
        assert_eq!(split_point(&[8; 10], 0), 5);
        // Odd count: the half holding the new entry keeps the extra one.
        assert_eq!(split_point(&[8; 9], 0), 5);
        assert_eq!(split_point(&[8; 9], 8), 4);
    }

    #[test]
    fn split_point_weighs_bytes() {
        // One heavy entry at the front pulls the split left.
        assert_eq!(split_point(&[40, 8, 8, 8, 8, 8], 5), 1);
        assert_eq!(split_point(&[8, 8], 1), 1);
    }
}
