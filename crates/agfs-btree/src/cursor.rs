//! Cursor: a root-to-leaf path through one tree.
//!
//! `levels[0]` is the leaf. Each level records the block and a 1-based
//! position inside it. At the leaf, `1..=numrecs` points at a record, `0`
//! sits before the first and `numrecs + 1` after the last. At interior
//! levels the position names the child on the path.
//!
//! Mutations leave the cursor on a well-defined record: `insert` on the new
//! record, `delete` on the record that followed the deleted one.

use crate::BtreeOps;
use crate::node::{Entry, Node, TreeLoc, split_point};
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{BtreeKey, BtreeKind, Record};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber};
use std::cmp::Ordering;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupDir {
    /// Last record with key <= target.
    Le,
    /// Record with key == target, else the insertion point.
    Eq,
    /// First record with key >= target.
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Level {
    block: AgBlock,
    ptr: usize,
}

#[derive(Debug, Clone)]
pub struct Cursor {
    loc: TreeLoc,
    levels: Vec<Level>,
}

enum Rebalanced {
    Done,
    /// The parent lost the entry at this 0-based index.
    Merged(usize),
}

impl Cursor {
    #[must_use]
    pub fn new(ops: &dyn BtreeOps, tp: &Transaction) -> Self {
        let block_size = tp.geometry().block_size;
        Self {
            loc: TreeLoc {
                kind: ops.kind(),
                agno: ops.agno(),
                leaf_cap: ops.max_records(block_size, 0),
                node_cap: ops.max_records(block_size, 1),
            },
            levels: Vec::new(),
        }
    }

    #[must_use]
    pub fn loc(&self) -> TreeLoc {
        self.loc
    }

    #[must_use]
    pub fn kind(&self) -> BtreeKind {
        self.loc.kind
    }

    #[must_use]
    pub fn agno(&self) -> AgNumber {
        self.loc.agno
    }

    /// Levels on the current path (0 before the first lookup).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    fn load(&self, tp: &mut Transaction, level: usize) -> Result<Node> {
        let block = self.levels[level].block;
        Node::load(tp, &self.loc, block, level_u32(level))
    }

    fn min(&self, ops: &dyn BtreeOps, tp: &Transaction, level: usize) -> usize {
        ops.min_records(tp.geometry().block_size, level_u32(level))
    }

    fn corrupt(&self, tp: &Transaction, block: AgBlock, detail: &str) -> AgfsError {
        self.loc.corrupt(tp, block, detail.to_owned())
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Position on `key` per `dir`. Returns whether a matching record was
    /// found; on `false` the leaf position is the insertion point (`Eq`),
    /// before the first record (`Le`) or past the last (`Ge`).
    pub fn lookup(
        &mut self,
        tp: &mut Transaction,
        ops: &dyn BtreeOps,
        key: &BtreeKey,
        dir: LookupDir,
    ) -> Result<bool> {
        let (root, nlevels) = ops.root();
        if nlevels == 0 {
            return Err(self.corrupt(tp, root, "tree has zero levels"));
        }
        let kind = self.loc.kind;
        let depth = nlevels as usize;
        self.levels = vec![
            Level {
                block: AgBlock::NULL,
                ptr: 0,
            };
            depth
        ];
        let mut block = root;
        for level in (1..depth).rev() {
            let node = Node::load(tp, &self.loc, block, level_u32(level))?;
            if node.is_empty() {
                return Err(self.corrupt(tp, block, "empty interior block"));
            }
            let le = node
                .entries
                .as_slice()
                .partition_point(|e| ops.compare(&e.key(kind), key) != Ordering::Greater);
            let ptr = le.max(1);
            self.levels[level] = Level { block, ptr };
            block = node
                .child(ptr - 1)
                .ok_or_else(|| self.corrupt(tp, block, "interior entry without child"))?;
        }

        let leaf = Node::load(tp, &self.loc, block, 0)?;
        let keys = leaf.entries.as_slice();
        let lt = keys.partition_point(|e| ops.compare(&e.key(kind), key) == Ordering::Less);
        let found = match dir {
            LookupDir::Eq => {
                self.levels[0] = Level { block, ptr: lt + 1 };
                lt < keys.len() && ops.compare(&keys[lt].key(kind), key) == Ordering::Equal
            }
            LookupDir::Ge => {
                self.levels[0] = Level { block, ptr: lt + 1 };
                if lt < keys.len() {
                    true
                } else if keys.is_empty() {
                    false
                } else {
                    // Everything here is smaller; the answer is the next
                    // leaf's first record, if any.
                    self.levels[0].ptr = keys.len();
                    self.increment(tp)?
                }
            }
            LookupDir::Le => {
                let le =
                    keys.partition_point(|e| ops.compare(&e.key(kind), key) != Ordering::Greater);
                self.levels[0] = Level { block, ptr: le };
                le > 0
            }
        };
        trace!(
            tree = kind.name(),
            agno = self.loc.agno.0,
            ?key,
            ?dir,
            found,
            "btree_lookup"
        );
        Ok(found)
    }

    /// Record under the cursor.
    pub fn get_rec(&self, tp: &mut Transaction) -> Result<Option<Record>> {
        let Some(leaf) = self.levels.first() else {
            return Ok(None);
        };
        if leaf.ptr == 0 {
            return Ok(None);
        }
        let node = self.load(tp, 0)?;
        Ok(node.record(leaf.ptr - 1))
    }

    // ── Navigation ──────────────────────────────────────────────────────

    /// Step to the next record. `false` at the end of the tree.
    pub fn increment(&mut self, tp: &mut Transaction) -> Result<bool> {
        if self.levels.is_empty() {
            return Ok(false);
        }
        let leaf = self.load(tp, 0)?;
        if self.levels[0].ptr < leaf.len() {
            self.levels[0].ptr += 1;
            return Ok(true);
        }
        let mut level = 1;
        loop {
            if level >= self.levels.len() {
                self.levels[0].ptr = leaf.len() + 1;
                return Ok(false);
            }
            let node = self.load(tp, level)?;
            if self.levels[level].ptr < node.len() {
                self.levels[level].ptr += 1;
                break;
            }
            level += 1;
        }
        while level > 0 {
            let node = self.load(tp, level)?;
            let child = node
                .child(self.levels[level].ptr - 1)
                .ok_or_else(|| self.corrupt(tp, node.block, "interior entry without child"))?;
            level -= 1;
            self.levels[level] = Level {
                block: child,
                ptr: 1,
            };
        }
        let leaf = self.load(tp, 0)?;
        Ok(!leaf.is_empty())
    }

    /// Step to the previous record. `false` at the start of the tree.
    pub fn decrement(&mut self, tp: &mut Transaction) -> Result<bool> {
        if self.levels.is_empty() {
            return Ok(false);
        }
        if self.levels[0].ptr > 1 {
            self.levels[0].ptr -= 1;
            return Ok(true);
        }
        let mut level = 1;
        loop {
            if level >= self.levels.len() {
                self.levels[0].ptr = 0;
                return Ok(false);
            }
            if self.levels[level].ptr > 1 {
                self.levels[level].ptr -= 1;
                break;
            }
            level += 1;
        }
        while level > 0 {
            let node = self.load(tp, level)?;
            let child = node
                .child(self.levels[level].ptr - 1)
                .ok_or_else(|| self.corrupt(tp, node.block, "interior entry without child"))?;
            let below = Node::load(tp, &self.loc, child, level_u32(level - 1))?;
            level -= 1;
            self.levels[level] = Level {
                block: child,
                ptr: below.len(),
            };
        }
        Ok(self.levels[0].ptr > 0)
    }

    // ── Key maintenance ─────────────────────────────────────────────────

    /// Set the key of the path entry at `level` and continue upward while
    /// the changed entry is the first in its block.
    fn update_keys(&self, tp: &mut Transaction, level: usize, key: BtreeKey) -> Result<()> {
        let mut level = level;
        while level < self.levels.len() {
            let index = self.levels[level].ptr - 1;
            if !self.set_key_at(tp, level, index, key)? || index != 0 {
                break;
            }
            level += 1;
        }
        Ok(())
    }

    /// Set the key of entry `index` in the path block at `level`. Returns
    /// `false` if it already had that key.
    fn set_key_at(
        &self,
        tp: &mut Transaction,
        level: usize,
        index: usize,
        key: BtreeKey,
    ) -> Result<bool> {
        let mut node = self.load(tp, level)?;
        if node.key(self.loc.kind, index) == Some(key) {
            return Ok(false);
        }
        if !node.set_key(index, key) {
            return Err(self.corrupt(tp, node.block, "key update past end of block"));
        }
        node.store(tp, &self.loc)?;
        Ok(true)
    }

    /// Like `set_key_at`, propagating upward when `index` is 0.
    fn update_key_from(
        &self,
        tp: &mut Transaction,
        level: usize,
        index: usize,
        key: BtreeKey,
    ) -> Result<()> {
        if self.set_key_at(tp, level, index, key)? && index == 0 {
            self.update_keys(tp, level + 1, key)?;
        }
        Ok(())
    }

    // ── Update ──────────────────────────────────────────────────────────

    /// Overwrite the record under the cursor. The new key must keep the
    /// block ordered.
    pub fn update(&mut self, tp: &mut Transaction, ops: &dyn BtreeOps, rec: &Record) -> Result<()> {
        let kind = self.loc.kind;
        if rec.kind() != kind {
            return Err(AgfsError::InvalidArgument(format!(
                "{} record passed to {}",
                rec.kind().name(),
                kind.name()
            )));
        }
        let Some(Level { ptr, .. }) = self.levels.first().copied() else {
            return Err(AgfsError::InvalidArgument("update on unpositioned cursor".into()));
        };
        let mut node = self.load(tp, 0)?;
        if ptr == 0 || ptr > node.len() {
            return Err(AgfsError::InvalidArgument("cursor not on a record".into()));
        }
        let index = ptr - 1;
        let key = ops.key_of(rec);
        let before = index.checked_sub(1).and_then(|i| node.key(kind, i));
        let after = node.key(kind, index + 1);
        let ordered = before.is_none_or(|b| ops.compare(&b, &key) == Ordering::Less)
            && after.is_none_or(|a| ops.compare(&key, &a) == Ordering::Less);
        if !ordered {
            return Err(AgfsError::InvalidArgument(format!(
                "update of {} would break key order",
                kind.name()
            )));
        }
        let old_key = node.key(kind, index);
        node.entries.replace(index, Entry::Rec(*rec));
        node.store(tp, &self.loc)?;
        if index == 0 && old_key != Some(key) {
            self.update_keys(tp, 1, key)?;
        }
        trace!(tree = kind.name(), agno = self.loc.agno.0, %rec, "btree_update");
        Ok(())
    }

    // ── Insert ──────────────────────────────────────────────────────────

    /// Insert `rec`, splitting blocks upward as needed. A duplicate key is
    /// corruption.
    pub fn insert(&mut self, tp: &mut Transaction, ops: &mut dyn BtreeOps, rec: &Record) -> Result<()> {
        let kind = self.loc.kind;
        if rec.kind() != kind {
            return Err(AgfsError::InvalidArgument(format!(
                "{} record passed to {}",
                rec.kind().name(),
                kind.name()
            )));
        }
        let key = ops.key_of(rec);
        if self.lookup(tp, ops, &key, LookupDir::Eq)? {
            let block = self.levels[0].block;
            return Err(self.corrupt(tp, block, &format!("duplicate key for {rec}")));
        }

        let mut entry = Entry::Rec(*rec);
        let mut level = 0;
        loop {
            let Level { block, ptr } = self.levels[level];
            let mut node = self.load(tp, level)?;
            // Leaf: before the insertion point. Interior: after the child
            // that split.
            let pos = if level == 0 { ptr - 1 } else { ptr };
            if !node.entries.is_full() {
                if node.entries.insert(pos, entry).is_err() {
                    return Err(self.corrupt(tp, block, "insert position out of range"));
                }
                node.store(tp, &self.loc)?;
                if pos == 0 {
                    self.update_keys(tp, level + 1, entry.key(kind))?;
                }
                break;
            }
            let (right, separator) = self.split(tp, ops, level, node, pos, entry)?;
            entry = Entry::Ptr(separator, right);
            if level + 1 == self.levels.len() {
                self.grow_root(tp, ops, level, block, entry)?;
                break;
            }
            level += 1;
        }
        trace!(tree = kind.name(), agno = self.loc.agno.0, %rec, "btree_insert");
        self.lookup(tp, ops, &key, LookupDir::Eq)?;
        Ok(())
    }

    /// Split the full block `node` around the new `entry` at `pos`. The
    /// left part stays in place; returns the new right block and its key.
    fn split(
        &self,
        tp: &mut Transaction,
        ops: &mut dyn BtreeOps,
        level: usize,
        node: Node,
        pos: usize,
        entry: Entry,
    ) -> Result<(AgBlock, BtreeKey)> {
        let kind = self.loc.kind;
        let Node {
            block,
            leftsib,
            rightsib,
            entries,
            ..
        } = node;
        let mut all = entries.into_vec();
        all.insert(pos, entry);
        let sizes: Vec<usize> = all.iter().map(|e| e.size(kind)).collect();
        let at = split_point(&sizes, pos);
        let right_entries = all.split_off(at);

        let Some(new_block) = ops.alloc_block(tp, block)? else {
            warn!(tree = kind.name(), agno = self.loc.agno.0, level, "btree_split_no_block");
            return Err(AgfsError::NoSpace);
        };
        let cap = self.loc.cap(level_u32(level));
        let (Some(left), Some(right)) = (
            crate::Bounded::from_vec(all, cap),
            crate::Bounded::from_vec(right_entries, cap),
        ) else {
            return Err(self.corrupt(tp, block, "split half exceeds block capacity"));
        };
        let left = Node {
            block,
            level: level_u32(level),
            leftsib,
            rightsib: new_block,
            entries: left,
        };
        let right = Node {
            block: new_block,
            level: level_u32(level),
            leftsib: block,
            rightsib,
            entries: right,
        };
        if !rightsib.is_null() {
            let mut next = Node::load(tp, &self.loc, rightsib, level_u32(level))?;
            next.leftsib = new_block;
            next.store(tp, &self.loc)?;
        }
        left.store(tp, &self.loc)?;
        right.store_new(tp, &self.loc)?;
        let (Some(left_key), Some(right_key)) = (left.low_key(kind), right.low_key(kind)) else {
            return Err(self.corrupt(tp, block, "split produced an empty half"));
        };
        if pos == 0 {
            self.update_keys(tp, level + 1, left_key)?;
        }
        debug!(
            tree = kind.name(),
            agno = self.loc.agno.0,
            level,
            old_node = block.0,
            new_node = new_block.0,
            left = left.len(),
            right = right.len(),
            separator_key = ?right_key,
            "btree_split"
        );
        Ok((new_block, right_key))
    }

    /// The root at `level` split into `left` and `right_entry`: add a level.
    fn grow_root(
        &mut self,
        tp: &mut Transaction,
        ops: &mut dyn BtreeOps,
        level: usize,
        left: AgBlock,
        right_entry: Entry,
    ) -> Result<()> {
        let kind = self.loc.kind;
        let left_node = Node::load(tp, &self.loc, left, level_u32(level))?;
        let Some(left_key) = left_node.low_key(kind) else {
            return Err(self.corrupt(tp, left, "empty block after split"));
        };
        let Some(root) = ops.alloc_block(tp, left)? else {
            warn!(tree = kind.name(), agno = self.loc.agno.0, "btree_grow_no_block");
            return Err(AgfsError::NoSpace);
        };
        let mut node = Node::empty(&self.loc, root, level_u32(level + 1));
        let pushed = node.entries.insert(0, Entry::Ptr(left_key, left)).is_ok()
            && node.entries.insert(1, right_entry).is_ok();
        if !pushed {
            return Err(self.corrupt(tp, root, "new root cannot hold two entries"));
        }
        node.store_new(tp, &self.loc)?;
        ops.set_root(tp, root, level_u32(level + 2))?;
        self.levels.push(Level { block: root, ptr: 1 });
        debug!(
            tree = kind.name(),
            agno = self.loc.agno.0,
            new_root = root.0,
            levels = level + 2,
            "btree_root_grow"
        );
        Ok(())
    }

    // ── Delete ──────────────────────────────────────────────────────────

    /// Delete the record under the cursor. `false` if the cursor is not on
    /// a record.
    pub fn delete(&mut self, tp: &mut Transaction, ops: &mut dyn BtreeOps) -> Result<bool> {
        let kind = self.loc.kind;
        let Some(deleted) = self.get_rec(tp)? else {
            return Ok(false);
        };
        let key = ops.key_of(&deleted);

        let mut level = 0;
        loop {
            let Level { block, ptr } = self.levels[level];
            let mut node = self.load(tp, level)?;
            let index = ptr - 1;
            if node.entries.remove(index).is_none() {
                return Err(self.corrupt(tp, block, "delete position out of range"));
            }
            if level + 1 == self.levels.len() {
                if level > 0 && node.len() == 1 {
                    let child = node
                        .child(0)
                        .ok_or_else(|| self.corrupt(tp, block, "interior entry without child"))?;
                    ops.free_block(tp, block)?;
                    ops.set_root(tp, child, level_u32(level))?;
                    self.levels.pop();
                    debug!(
                        tree = kind.name(),
                        agno = self.loc.agno.0,
                        old_root = block.0,
                        new_root = child.0,
                        levels = level,
                        "btree_root_shrink"
                    );
                } else {
                    node.store(tp, &self.loc)?;
                }
                break;
            }
            if node.len() >= self.min(ops, tp, level) {
                node.store(tp, &self.loc)?;
                if index == 0 {
                    if let Some(low) = node.low_key(kind) {
                        self.update_keys(tp, level + 1, low)?;
                    }
                }
                break;
            }
            match self.rebalance(tp, ops, level, node, index)? {
                Rebalanced::Done => break,
                Rebalanced::Merged(removed) => {
                    self.levels[level + 1].ptr = removed + 1;
                    level += 1;
                }
            }
        }
        trace!(tree = kind.name(), agno = self.loc.agno.0, rec = %deleted, "btree_delete");
        self.lookup(tp, ops, &key, LookupDir::Ge)?;
        Ok(true)
    }

    /// Fix an underfull non-root block: borrow one entry from a sibling
    /// that can spare it, otherwise merge with a sibling. The sibling with
    /// more entries is preferred, the left one on a tie.
    fn rebalance(
        &self,
        tp: &mut Transaction,
        ops: &mut dyn BtreeOps,
        level: usize,
        mut node: Node,
        index: usize,
    ) -> Result<Rebalanced> {
        let kind = self.loc.kind;
        let lvl = level_u32(level);
        let min = self.min(ops, tp, level);
        let parent = self.load(tp, level + 1)?;
        let pidx = self.levels[level + 1].ptr - 1;
        let left = match pidx.checked_sub(1).and_then(|i| parent.child(i)) {
            Some(block) => Some(Node::load(tp, &self.loc, block, lvl)?),
            None => None,
        };
        let right = match parent.child(pidx + 1) {
            Some(block) => Some(Node::load(tp, &self.loc, block, lvl)?),
            None => None,
        };
        let (sibling, is_left) = match (left, right) {
            (Some(l), Some(r)) => {
                if l.len() >= r.len() {
                    (l, true)
                } else {
                    (r, false)
                }
            }
            (Some(l), None) => (l, true),
            (None, Some(r)) => (r, false),
            (None, None) => {
                return Err(self.corrupt(tp, node.block, "non-root block has no sibling"));
            }
        };

        if is_left {
            let mut left = sibling;
            if left.len() > min {
                let Some(moved) = left.entries.pop() else {
                    return Err(self.corrupt(tp, left.block, "empty sibling"));
                };
                if node.entries.insert(0, moved).is_err() {
                    return Err(self.corrupt(tp, node.block, "borrow overflows block"));
                }
                left.store(tp, &self.loc)?;
                node.store(tp, &self.loc)?;
                self.update_key_from(tp, level + 1, pidx, moved.key(kind))?;
                trace!(tree = kind.name(), level, from = left.block.0, to = node.block.0, "btree_borrow_left");
                return Ok(Rebalanced::Done);
            }
            let moved = node.entries.into_vec();
            let count = moved.len();
            if left.entries.append(moved).is_err() {
                return Err(self.corrupt(tp, left.block, "merge overflows block"));
            }
            left.rightsib = node.rightsib;
            self.relink_left_of(tp, lvl, node.rightsib, left.block)?;
            left.store(tp, &self.loc)?;
            ops.free_block(tp, node.block)?;
            debug!(
                tree = kind.name(),
                agno = self.loc.agno.0,
                level,
                into = left.block.0,
                freed = node.block.0,
                moved = count,
                "btree_merge"
            );
            return Ok(Rebalanced::Merged(pidx));
        }

        let mut right = sibling;
        if right.len() > min {
            let Some(moved) = right.entries.remove(0) else {
                return Err(self.corrupt(tp, right.block, "empty sibling"));
            };
            let at = node.len();
            if node.entries.insert(at, moved).is_err() {
                return Err(self.corrupt(tp, node.block, "borrow overflows block"));
            }
            right.store(tp, &self.loc)?;
            node.store(tp, &self.loc)?;
            if let Some(low) = right.low_key(kind) {
                self.update_key_from(tp, level + 1, pidx + 1, low)?;
            }
            if index == 0 {
                if let Some(low) = node.low_key(kind) {
                    self.update_key_from(tp, level + 1, pidx, low)?;
                }
            }
            trace!(tree = kind.name(), level, from = right.block.0, to = node.block.0, "btree_borrow_right");
            return Ok(Rebalanced::Done);
        }
        let freed = right.block;
        let moved = right.entries.into_vec();
        let count = moved.len();
        if node.entries.append(moved).is_err() {
            return Err(self.corrupt(tp, node.block, "merge overflows block"));
        }
        node.rightsib = right.rightsib;
        self.relink_left_of(tp, lvl, right.rightsib, node.block)?;
        node.store(tp, &self.loc)?;
        ops.free_block(tp, freed)?;
        if index == 0 {
            if let Some(low) = node.low_key(kind) {
                self.update_key_from(tp, level + 1, pidx, low)?;
            }
        }
        debug!(
            tree = kind.name(),
            agno = self.loc.agno.0,
            level,
            into = node.block.0,
            freed = freed.0,
            moved = count,
            "btree_merge"
        );
        Ok(Rebalanced::Merged(pidx + 1))
    }

    /// Point the left-sibling link of `block` (if any) at `left`.
    fn relink_left_of(
        &self,
        tp: &mut Transaction,
        level: u32,
        block: AgBlock,
        left: AgBlock,
    ) -> Result<()> {
        if block.is_null() {
            return Ok(());
        }
        let mut next = Node::load(tp, &self.loc, block, level)?;
        next.leftsib = left;
        next.store(tp, &self.loc)
    }
}

// Tree heights are bounded by `max_levels`, far below u32::MAX.
#[expect(clippy::cast_possible_truncation)]
fn level_u32(level: usize) -> u32 {
    level as u32
}
