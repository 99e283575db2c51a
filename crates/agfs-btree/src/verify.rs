//! Whole-tree traversal and structural scrub.

use crate::BtreeOps;
use crate::cursor::Cursor;
use crate::node::{Node, TreeLoc};
use agfs_error::Result;
use agfs_ondisk::{BtreeKey, Record};
use agfs_trans::Transaction;
use agfs_types::AgBlock;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::debug;

/// Everything a scrub saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    pub levels: u32,
    /// Every block of the tree, root first, in visit order.
    pub blocks: Vec<AgBlock>,
    /// Leaf records in key order.
    pub records: Vec<Record>,
}

/// Visit every record in key order. Returns the number visited.
pub fn walk<F>(tp: &mut Transaction, ops: &dyn BtreeOps, visitor: &mut F) -> Result<usize>
where
    F: FnMut(&Record) -> Result<()>,
{
    let loc = Cursor::new(ops, tp).loc();
    let (mut block, levels) = ops.root();
    for level in (1..levels).rev() {
        let node = Node::load(tp, &loc, block, level)?;
        block = node
            .child(0)
            .ok_or_else(|| loc.corrupt(tp, block, "empty interior block".into()))?;
    }
    let mut count = 0;
    while !block.is_null() {
        let node = Node::load(tp, &loc, block, 0)?;
        for i in 0..node.len() {
            if let Some(rec) = node.record(i) {
                visitor(&rec)?;
                count += 1;
            }
        }
        block = node.rightsib;
    }
    Ok(count)
}

struct Scrub<'a> {
    ops: &'a dyn BtreeOps,
    loc: TreeLoc,
    block_size: u32,
    seen: BTreeSet<AgBlock>,
    /// Last block visited on each level with its right-sibling link.
    last: Vec<Option<(AgBlock, AgBlock)>>,
    report: TreeReport,
}

impl Scrub<'_> {
    fn visit(
        &mut self,
        tp: &mut Transaction,
        block: AgBlock,
        level: u32,
        low: Option<BtreeKey>,
        high: Option<BtreeKey>,
    ) -> Result<()> {
        let loc = self.loc;
        let kind = loc.kind;
        if !self.seen.insert(block) {
            return Err(loc.corrupt(tp, block, "block reachable twice".into()));
        }
        let node = Node::load(tp, &loc, block, level)?;
        self.report.blocks.push(block);

        let is_root = low.is_none() && high.is_none() && self.report.blocks.len() == 1;
        let max = self.ops.max_records(self.block_size, level);
        let min = if is_root {
            if level > 0 { 2 } else { 0 }
        } else {
            self.ops.min_records(self.block_size, level)
        };
        if node.len() < min || node.len() > max {
            return Err(loc.corrupt(
                tp,
                block,
                format!("{} entries outside {min}..={max} at level {level}", node.len()),
            ));
        }

        let keys: Vec<BtreeKey> = node.entries.as_slice().iter().map(|e| e.key(kind)).collect();
        for pair in keys.windows(2) {
            if self.ops.compare(&pair[0], &pair[1]) != Ordering::Less {
                return Err(loc.corrupt(
                    tp,
                    block,
                    format!("keys out of order: {:?} then {:?}", pair[0], pair[1]),
                ));
            }
        }
        if let (Some(low), Some(first)) = (low, keys.first()) {
            if self.ops.compare(&low, first) != Ordering::Equal {
                return Err(loc.corrupt(
                    tp,
                    block,
                    format!("parent key {low:?} differs from first key {first:?}"),
                ));
            }
        }
        if let (Some(high), Some(last)) = (high, keys.last()) {
            if self.ops.compare(last, &high) != Ordering::Less {
                return Err(loc.corrupt(
                    tp,
                    block,
                    format!("key {last:?} not below the next separator {high:?}"),
                ));
            }
        }

        let slot = level as usize;
        let expected_left = self.last[slot].map_or(AgBlock::NULL, |(prev, _)| prev);
        if node.leftsib != expected_left {
            return Err(loc.corrupt(
                tp,
                block,
                format!("left sibling {} where {} expected", node.leftsib.0, expected_left.0),
            ));
        }
        if let Some((prev, prev_right)) = self.last[slot] {
            if prev_right != block {
                return Err(loc.corrupt(
                    tp,
                    prev,
                    format!("right sibling {} where {} expected", prev_right.0, block.0),
                ));
            }
        }
        self.last[slot] = Some((block, node.rightsib));

        if level == 0 {
            for i in 0..node.len() {
                if let Some(rec) = node.record(i) {
                    self.report.records.push(rec);
                }
            }
            return Ok(());
        }
        for i in 0..node.len() {
            let child = node
                .child(i)
                .ok_or_else(|| loc.corrupt(tp, block, "interior entry without child".into()))?;
            let child_high = keys.get(i + 1).copied().or(high);
            self.visit(tp, child, level - 1, keys.get(i).copied(), child_high)?;
        }
        Ok(())
    }
}

/// Walk the whole tree and check block headers, key order, parent keys,
/// fill levels, sibling chains and per-record sanity.
pub fn verify_tree(tp: &mut Transaction, ops: &dyn BtreeOps) -> Result<TreeReport> {
    let loc = Cursor::new(ops, tp).loc();
    let (root, levels) = ops.root();
    if levels == 0 {
        return Err(loc.corrupt(tp, root, "tree has zero levels".into()));
    }
    let mut scrub = Scrub {
        ops,
        loc,
        block_size: tp.geometry().block_size,
        seen: BTreeSet::new(),
        last: vec![None; levels as usize],
        report: TreeReport {
            levels,
            ..TreeReport::default()
        },
    };
    scrub.visit(tp, root, levels - 1, None, None)?;
    for (level, last) in scrub.last.iter().enumerate() {
        if let Some((block, right)) = last {
            if !right.is_null() {
                return Err(loc.corrupt(
                    tp,
                    *block,
                    format!("rightmost block at level {level} links to {}", right.0),
                ));
            }
        }
    }
    debug!(
        tree = loc.kind.name(),
        agno = loc.agno.0,
        levels,
        blocks = scrub.report.blocks.len(),
        records = scrub.report.records.len(),
        "btree_verified"
    );
    Ok(scrub.report)
}
