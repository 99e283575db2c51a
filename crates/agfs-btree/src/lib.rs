#![forbid(unsafe_code)]
//! Generic balanced tree engine for the per-AG btrees.
//!
//! One engine serves the by-bno and by-size free-space trees and the inode
//! chunk tree. What a tree means is supplied through [`BtreeOps`]: where its
//! root lives, how blocks are allocated and freed for it, and how many
//! entries a level holds. The engine only moves [`Record`]s and keys.
//!
//! All block access goes through the caller's [`Transaction`], so every
//! node touched by an insert or delete is locked, staged and logged as part
//! of the enclosing operation. A failure part way through a split or merge
//! leaves the staged copies inconsistent; the caller must cancel the
//! transaction, which discards them.
//!
//! | Operation | Entry point |
//! |-----------|-------------|
//! | point / range lookup | [`Cursor::lookup`] with [`LookupDir`] |
//! | navigation | [`Cursor::increment`], [`Cursor::decrement`] |
//! | mutation | [`Cursor::insert`], [`Cursor::update`], [`Cursor::delete`] |
//! | full scan | [`walk`] |
//! | scrub | [`verify_tree`] |

pub mod cursor;
pub mod node;
pub mod verify;

pub use cursor::{Cursor, LookupDir};
pub use node::{Bounded, Entry, split_point};
pub use verify::{TreeReport, verify_tree, walk};

use agfs_error::Result;
use agfs_ondisk::{BtreeKey, BtreeKind, Record};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber};
use std::cmp::Ordering;

/// Callbacks that bind the engine to one concrete tree.
pub trait BtreeOps {
    fn kind(&self) -> BtreeKind;

    fn agno(&self) -> AgNumber;

    /// Root block and number of levels (1 for a lone leaf).
    fn root(&self) -> (AgBlock, u32);

    fn set_root(&mut self, tp: &mut Transaction, root: AgBlock, levels: u32) -> Result<()>;

    /// A block for a new node, ideally close to `near`. `None` means no
    /// block is available; the engine fails the operation.
    fn alloc_block(&mut self, tp: &mut Transaction, near: AgBlock) -> Result<Option<AgBlock>>;

    fn free_block(&mut self, tp: &mut Transaction, block: AgBlock) -> Result<()>;

    fn max_records(&self, block_size: u32, level: u32) -> usize {
        if level == 0 {
            self.kind().leaf_max(block_size)
        } else {
            self.kind().node_max(block_size)
        }
    }

    /// Fill floor for non-root blocks.
    fn min_records(&self, block_size: u32, level: u32) -> usize {
        (self.max_records(block_size, level) / 2).max(1)
    }

    fn key_of(&self, rec: &Record) -> BtreeKey {
        self.kind().key_of(rec)
    }

    fn compare(&self, a: &BtreeKey, b: &BtreeKey) -> Ordering {
        a.cmp(b)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use agfs_block::{BufCache, MemBlockDevice};
    use agfs_ondisk::{Geometry, Superblock};
    use agfs_trans::{Log, MemLog, SbCounterSnapshot, TransConfig, TransManager, TransRes};
    use std::sync::Arc;

    pub const AG_BLOCKS: u32 = 4096;

    /// In-memory tree binding: root kept in the struct, blocks handed out
    /// from a bump pointer and recycled through a free list.
    pub struct MemOps {
        pub kind: BtreeKind,
        pub root: AgBlock,
        pub levels: u32,
        pub next: u32,
        pub freed: Vec<AgBlock>,
        pub cap: Option<(usize, usize)>,
        pub allocs: usize,
    }

    impl MemOps {
        /// Writes an empty root leaf at block 8.
        pub fn new(tp: &mut Transaction, kind: BtreeKind, cap: Option<(usize, usize)>) -> Self {
            let ops = Self {
                kind,
                root: AgBlock(8),
                levels: 1,
                next: 9,
                freed: Vec::new(),
                cap,
                allocs: 0,
            };
            let loc = Cursor::new(&ops, tp).loc();
            node::Node::empty(&loc, AgBlock(8), 0).store_new(tp, &loc).unwrap();
            ops
        }
    }

    impl BtreeOps for MemOps {
        fn kind(&self) -> BtreeKind {
            self.kind
        }

        fn agno(&self) -> AgNumber {
            AgNumber(0)
        }

        fn root(&self) -> (AgBlock, u32) {
            (self.root, self.levels)
        }

        fn set_root(&mut self, _tp: &mut Transaction, root: AgBlock, levels: u32) -> Result<()> {
            self.root = root;
            self.levels = levels;
            Ok(())
        }

        fn alloc_block(&mut self, _tp: &mut Transaction, _near: AgBlock) -> Result<Option<AgBlock>> {
            self.allocs += 1;
            if let Some(block) = self.freed.pop() {
                return Ok(Some(block));
            }
            if self.next >= AG_BLOCKS {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(AgBlock(self.next - 1)))
        }

        fn free_block(&mut self, _tp: &mut Transaction, block: AgBlock) -> Result<()> {
            self.freed.push(block);
            Ok(())
        }

        fn max_records(&self, block_size: u32, level: u32) -> usize {
            match (self.cap, level) {
                (Some((leaf, _)), 0) => leaf,
                (Some((_, node)), _) => node,
                (None, 0) => self.kind.leaf_max(block_size),
                (None, _) => self.kind.node_max(block_size),
            }
        }
    }

    /// A manager over a single 512-byte-block AG and an open transaction
    /// with a log reservation large enough for any test.
    pub fn transaction() -> Transaction {
        let sb = Superblock::for_volume(512, 256, AG_BLOCKS, 1, u64::from(AG_BLOCKS));
        let geo = Geometry::from_superblock(&sb).unwrap();
        let dev = MemBlockDevice::zeroed(512, u64::from(AG_BLOCKS)).unwrap();
        let bufs = Arc::new(BufCache::new(Arc::new(dev), 1024));
        let log: Arc<dyn Log> = Arc::new(MemLog::new(1 << 40));
        let mgr = Arc::new(TransManager::new(
            geo,
            SbCounterSnapshot::default(),
            log,
            bufs,
            TransConfig::default(),
        ));
        let mut tp = mgr.alloc().unwrap();
        let res = TransRes {
            log_res: 1 << 32,
            log_count: 1,
            permanent: true,
        };
        tp.reserve(&res, 0, 0).unwrap();
        tp
    }
}
