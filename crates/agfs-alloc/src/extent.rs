//! Extent allocation and freeing inside one allocation group.
//!
//! Every free extent is a record in both trees: `{start, len}` in the
//! by-bno tree and `{len, start}` in the by-size tree. Allocation carves a
//! piece out of one record and reinserts the remainders; freeing merges
//! with both neighbours so that no two free records ever touch.
//!
//! | Request | Search |
//! |---------|--------|
//! | [`AgAllocType::Exact`] | by-bno `Le` on the block; the extent must cover it |
//! | [`AgAllocType::Near`] | by-bno outward in both directions from the hint |
//! | [`AgAllocType::Anywhere`] | by-size `Ge` on the wanted length, largest-first fallback |

use crate::agf::{AgfState, FIRST_DATA_AGBLOCK};
use agfs_btree::{Cursor, LookupDir};
use agfs_error::{AgfsError, Result};
use agfs_ondisk::{Agf, AllocRec, BtreeKey, BtreeKind, Record};
use agfs_trans::Transaction;
use agfs_types::{AgBlock, AgNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Same-length records inspected when breaking a best-fit tie by locality.
const PROXIMITY_SCAN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgAllocType {
    /// Start exactly at this block or fail.
    Exact(AgBlock),
    /// As close to this block as possible.
    Near(AgBlock),
    /// Smallest extent that fits; ties go to the one nearest `near`.
    Anywhere { near: Option<AgBlock> },
}

/// One allocation inside a single AG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgAllocRequest {
    pub kind: AgAllocType,
    pub min_len: u32,
    pub max_len: u32,
    /// Start alignment in blocks; 1 for none.
    pub alignment: u32,
    /// With `modulo`: prefer lengths where `len % prod == modulo`.
    pub prod: u32,
    pub modulo: u32,
}

impl AgAllocRequest {
    #[must_use]
    pub fn new(kind: AgAllocType, min_len: u32, max_len: u32) -> Self {
        Self {
            kind,
            min_len,
            max_len,
            alignment: 1,
            prod: 1,
            modulo: 0,
        }
    }

    #[must_use]
    pub fn aligned(mut self, alignment: u32) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    #[must_use]
    pub fn length_multiple(mut self, prod: u32, modulo: u32) -> Self {
        self.prod = prod.max(1);
        self.modulo = modulo;
        self
    }

    pub fn check(&self, ag_blocks: u32) -> Result<()> {
        let bad = |why: &str| Err(AgfsError::InvalidArgument(format!("allocation request: {why}")));
        if self.min_len == 0 || self.max_len < self.min_len {
            return bad("length range empty");
        }
        if self.max_len > ag_blocks {
            return bad("longer than an allocation group");
        }
        if self.alignment == 0 || self.prod == 0 || self.modulo >= self.prod {
            return bad("alignment or modulus out of range");
        }
        Ok(())
    }

    /// Trim `len` so that `len % prod == modulo` when that keeps it at or
    /// above `min_len`; otherwise leave it alone.
    #[must_use]
    pub fn fix_len(&self, len: u32) -> u32 {
        let len = len.min(self.max_len);
        if self.prod <= 1 || len < self.modulo || len == self.max_len {
            return len;
        }
        if self.modulo == 0 && len < self.prod {
            return len;
        }
        let k = len % self.prod;
        if k == self.modulo {
            return len;
        }
        let trimmed = if k > self.modulo {
            len - (k - self.modulo)
        } else {
            len - self.prod + (self.modulo - k)
        };
        if trimmed < self.min_len { len } else { trimmed }
    }

    /// Usable part of free extent `{start, len}`: aligned start and the
    /// length this request would take from it.
    #[must_use]
    pub fn usable(&self, start: u32, len: u32) -> Option<(u32, u32)> {
        let end = start.checked_add(len)?;
        let astart = start.checked_next_multiple_of(self.alignment)?;
        if astart >= end {
            return None;
        }
        let take = self.fix_len(end - astart);
        (take >= self.min_len).then_some((astart, take))
    }
}

/// An extent handed out by an AG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgExtent {
    pub agno: AgNumber,
    pub start: AgBlock,
    pub len: u32,
}

/// Longest extent an allocation could get once the free list has been
/// topped up to `need` blocks.
#[must_use]
pub fn longest_free(agf: &Agf, need: u32) -> u32 {
    let delta = if need > agf.flcount {
        (need - agf.flcount).min(agf.longest)
    } else {
        0
    };
    if agf.longest > delta {
        agf.longest - delta
    } else {
        u32::from(agf.flcount > 0 || agf.longest > 0)
    }
}

fn alloc_rec(cur: &Cursor, tp: &mut Transaction) -> Result<Option<AllocRec>> {
    Ok(cur.get_rec(tp)?.and_then(|r| r.alloc()))
}

fn bno_key(start: u32) -> BtreeKey {
    BtreeKey::Bno { start }
}

fn cnt_key(len: u32, start: u32) -> BtreeKey {
    BtreeKey::Cnt { len, start }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    free: AllocRec,
    start: u32,
    len: u32,
    diff: u32,
}

/// Closest aligned start to `want` for taking `take` blocks out of `free`.
fn closest_start(free: AllocRec, astart: u32, take: u32, want: u32, alignment: u32) -> u32 {
    let end = free.start + free.len;
    let hi = end - take;
    let hi = hi - hi % alignment;
    let hi = hi.max(astart);
    let target = want.clamp(astart, hi);
    let down = target - target % alignment;
    let down = down.max(astart);
    let up = down + alignment;
    if up <= hi && up - target < target - down { up } else { down }
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Allocate per `req` in the AG of `st`. `Ok(None)` when nothing fits.
/// The free list must already be topped up.
pub fn alloc_extent(
    tp: &mut Transaction,
    st: &mut AgfState,
    req: &AgAllocRequest,
) -> Result<Option<AgExtent>> {
    req.check(st.agf.length)?;
    let found = match req.kind {
        AgAllocType::Exact(bno) => alloc_exact(tp, st, req, bno)?,
        AgAllocType::Near(bno) => alloc_near(tp, st, req, bno)?,
        AgAllocType::Anywhere { near } => alloc_anywhere(tp, st, req, near)?,
    };
    let Some(pick) = found else {
        trace!(agno = st.agno.0, kind = ?req.kind, min = req.min_len, "alloc_ag_nothing_fits");
        return Ok(None);
    };
    fixup_trees(tp, st, pick.free, pick.start, pick.len)?;
    debug!(
        agno = st.agno.0,
        agbno = pick.start,
        len = pick.len,
        kind = ?req.kind,
        freeblks = st.agf.freeblks,
        longest = st.agf.longest,
        "alloc_ag_extent"
    );
    Ok(Some(AgExtent {
        agno: st.agno,
        start: AgBlock(pick.start),
        len: pick.len,
    }))
}

fn alloc_exact(
    tp: &mut Transaction,
    st: &mut AgfState,
    req: &AgAllocRequest,
    bno: AgBlock,
) -> Result<Option<Candidate>> {
    if bno.0 % req.alignment != 0 {
        return Ok(None);
    }
    let mut cur = Cursor::new(&st.tree(BtreeKind::Bno), tp);
    if !cur.lookup(tp, &st.tree(BtreeKind::Bno), &bno_key(bno.0), LookupDir::Le)? {
        return Ok(None);
    }
    let Some(free) = alloc_rec(&cur, tp)? else {
        return Ok(None);
    };
    let end = free.start + free.len;
    if bno.0 >= end {
        return Ok(None);
    }
    let len = req.fix_len(end - bno.0);
    if len < req.min_len {
        return Ok(None);
    }
    Ok(Some(Candidate {
        free,
        start: bno.0,
        len,
        diff: 0,
    }))
}

fn better(cand: &Candidate, best: Option<&Candidate>) -> bool {
    best.is_none_or(|b| cand.len > b.len || (cand.len == b.len && cand.diff < b.diff))
}

fn alloc_near(
    tp: &mut Transaction,
    st: &mut AgfState,
    req: &AgAllocRequest,
    hint: AgBlock,
) -> Result<Option<Candidate>> {
    let want = hint.0.min(st.agf.length.saturating_sub(1));
    let mut left = Cursor::new(&st.tree(BtreeKind::Bno), tp);
    let mut left_ok = left.lookup(tp, &st.tree(BtreeKind::Bno), &bno_key(want), LookupDir::Le)?;
    let mut right = left.clone();
    let mut right_ok = if left_ok {
        right.increment(tp)?
    } else {
        right.lookup(tp, &st.tree(BtreeKind::Bno), &bno_key(want), LookupDir::Ge)?
    };

    let mut best: Option<Candidate> = None;
    let consider = |free: AllocRec, best: &mut Option<Candidate>| {
        if let Some((astart, take)) = req.usable(free.start, free.len) {
            let start = closest_start(free, astart, take, want, req.alignment);
            let cand = Candidate {
                free,
                start,
                len: take,
                diff: start.abs_diff(want),
            };
            if better(&cand, best.as_ref()) {
                *best = Some(cand);
            }
        }
    };
    // Once the best candidate has the full length, a direction stops as
    // soon as its nearest possible start is farther than the best.
    let settled = |best: Option<Candidate>, bound: u32| {
        best.is_some_and(|b| b.len >= req.max_len && bound > b.diff)
    };
    while left_ok || right_ok {
        if left_ok {
            match alloc_rec(&left, tp)? {
                Some(free) if !settled(best, want.saturating_sub(free.start + free.len)) => {
                    consider(free, &mut best);
                    left_ok = left.decrement(tp)?;
                }
                _ => left_ok = false,
            }
        }
        if right_ok {
            match alloc_rec(&right, tp)? {
                Some(free) if !settled(best, free.start.saturating_sub(want)) => {
                    consider(free, &mut best);
                    right_ok = right.increment(tp)?;
                }
                _ => right_ok = false,
            }
        }
    }
    Ok(best)
}

fn alloc_anywhere(
    tp: &mut Transaction,
    st: &mut AgfState,
    req: &AgAllocRequest,
    near: Option<AgBlock>,
) -> Result<Option<Candidate>> {
    let wanted = req.max_len.saturating_add(req.alignment - 1);
    let mut cur = Cursor::new(&st.tree(BtreeKind::Cnt), tp);
    if cur.lookup(tp, &st.tree(BtreeKind::Cnt), &cnt_key(wanted, 0), LookupDir::Ge)? {
        let Some(first) = alloc_rec(&cur, tp)? else {
            return Ok(None);
        };
        let mut pick = first;
        if let Some(near) = near {
            let mut scanned = 1;
            while scanned < PROXIMITY_SCAN && cur.increment(tp)? {
                let Some(rec) = alloc_rec(&cur, tp)? else { break };
                if rec.len != first.len {
                    break;
                }
                if rec.start.abs_diff(near.0) < pick.start.abs_diff(near.0) {
                    pick = rec;
                }
                scanned += 1;
            }
        }
        if let Some((start, len)) = req.usable(pick.start, pick.len) {
            return Ok(Some(Candidate {
                free: pick,
                start,
                len,
                diff: 0,
            }));
        }
    }

    // Nothing long enough once aligned: take the most we can from the
    // largest extents.
    let mut best: Option<Candidate> = None;
    let mut more = cur.lookup(
        tp,
        &st.tree(BtreeKind::Cnt),
        &cnt_key(u32::MAX, u32::MAX),
        LookupDir::Le,
    )?;
    while more {
        let Some(rec) = alloc_rec(&cur, tp)? else { break };
        if rec.len < req.min_len || best.is_some_and(|b| rec.len <= b.len) {
            break;
        }
        if let Some((start, len)) = req.usable(rec.start, rec.len) {
            let cand = Candidate {
                free: rec,
                start,
                len,
                diff: 0,
            };
            if better(&cand, best.as_ref()) {
                best = Some(cand);
            }
        }
        more = cur.decrement(tp)?;
    }
    Ok(best)
}

/// Remove `{start, len}` from free record `free` in both trees, putting
/// back whatever is left on either side.
fn fixup_trees(
    tp: &mut Transaction,
    st: &mut AgfState,
    free: AllocRec,
    start: u32,
    len: u32,
) -> Result<()> {
    let fend = free.start + free.len;
    let end = start + len;
    if start < free.start || end > fend || len == 0 {
        return Err(st.corrupt(
            tp,
            format!("allocation {start}+{len} outside free extent {free}"),
        ));
    }
    let left = (start > free.start).then(|| AllocRec::new(free.start, start - free.start));
    let right = (end < fend).then(|| AllocRec::new(end, fend - end));

    let mut cnt = Cursor::new(&st.tree(BtreeKind::Cnt), tp);
    let key = cnt_key(free.len, free.start);
    if !cnt.lookup(tp, &st.tree(BtreeKind::Cnt), &key, LookupDir::Eq)? {
        return Err(st.corrupt(tp, format!("free extent {free} missing from by-size tree")));
    }
    cnt.delete(tp, &mut st.tree(BtreeKind::Cnt))?;
    for rest in [left, right].into_iter().flatten() {
        cnt.insert(tp, &mut st.tree(BtreeKind::Cnt), &Record::FreeSpaceBySize(rest))?;
    }

    let mut bno = Cursor::new(&st.tree(BtreeKind::Bno), tp);
    if !bno.lookup(tp, &st.tree(BtreeKind::Bno), &bno_key(free.start), LookupDir::Eq)? {
        return Err(st.corrupt(tp, format!("free extent {free} missing from by-bno tree")));
    }
    match (left, right) {
        (None, None) => {
            bno.delete(tp, &mut st.tree(BtreeKind::Bno))?;
        }
        (Some(l), r) => {
            bno.update(tp, &st.tree(BtreeKind::Bno), &Record::FreeSpaceByBno(l))?;
            if let Some(r) = r {
                bno.insert(tp, &mut st.tree(BtreeKind::Bno), &Record::FreeSpaceByBno(r))?;
            }
        }
        (None, Some(r)) => {
            bno.update(tp, &st.tree(BtreeKind::Bno), &Record::FreeSpaceByBno(r))?;
        }
    }

    st.agf.freeblks = st
        .agf
        .freeblks
        .checked_sub(len)
        .ok_or_else(|| st.corrupt(tp, format!("freeblks {} below allocation {len}", st.agf.freeblks)))?;
    refresh_longest(tp, st)?;
    st.write(tp)
}

/// Reload `longest` from the last record of the by-size tree.
fn refresh_longest(tp: &mut Transaction, st: &mut AgfState) -> Result<()> {
    let mut cur = Cursor::new(&st.tree(BtreeKind::Cnt), tp);
    let longest = if cur.lookup(
        tp,
        &st.tree(BtreeKind::Cnt),
        &cnt_key(u32::MAX, u32::MAX),
        LookupDir::Le,
    )? {
        alloc_rec(&cur, tp)?.map_or(0, |r| r.len)
    } else {
        0
    };
    st.agf.longest = longest;
    Ok(())
}

// ── Free ────────────────────────────────────────────────────────────────────

/// Return `{start, len}` to free space, merging with free neighbours.
pub fn free_extent(tp: &mut Transaction, st: &mut AgfState, start: AgBlock, len: u32) -> Result<()> {
    let (bno, end) = match start.0.checked_add(len) {
        Some(end) if len > 0 && start.0 >= FIRST_DATA_AGBLOCK && end <= st.agf.length => {
            (start.0, end)
        }
        _ => {
            return Err(AgfsError::InvalidArgument(format!(
                "cannot free {}+{len} in AG {}",
                start.0, st.agno.0
            )));
        }
    };

    let mut bcur = Cursor::new(&st.tree(BtreeKind::Bno), tp);
    let mut left = None;
    if bcur.lookup(tp, &st.tree(BtreeKind::Bno), &bno_key(bno), LookupDir::Le)? {
        let Some(rec) = alloc_rec(&bcur, tp)? else {
            return Err(st.corrupt(tp, "by-bno cursor lost its record".to_owned()));
        };
        if rec.start + rec.len > bno {
            return Err(st.corrupt(tp, format!("freeing {bno}+{len} overlaps free extent {rec}")));
        }
        left = Some(rec);
    }
    let mut right = None;
    if bcur.increment(tp)? {
        let Some(rec) = alloc_rec(&bcur, tp)? else {
            return Err(st.corrupt(tp, "by-bno cursor lost its record".to_owned()));
        };
        if end > rec.start {
            return Err(st.corrupt(tp, format!("freeing {bno}+{len} overlaps free extent {rec}")));
        }
        right = Some(rec);
    }
    let left = left.filter(|l| l.start + l.len == bno);
    let right = right.filter(|r| r.start == end);

    let mut ccur = Cursor::new(&st.tree(BtreeKind::Cnt), tp);
    for merged in [left, right].into_iter().flatten() {
        if !ccur.lookup(tp, &st.tree(BtreeKind::Cnt), &cnt_key(merged.len, merged.start), LookupDir::Eq)? {
            return Err(st.corrupt(tp, format!("free extent {merged} missing from by-size tree")));
        }
        ccur.delete(tp, &mut st.tree(BtreeKind::Cnt))?;
    }

    let combined = match (left, right) {
        (Some(l), Some(r)) => {
            if !bcur.lookup(tp, &st.tree(BtreeKind::Bno), &bno_key(r.start), LookupDir::Eq)? {
                return Err(st.corrupt(tp, format!("free extent {r} vanished")));
            }
            bcur.delete(tp, &mut st.tree(BtreeKind::Bno))?;
            let rec = AllocRec::new(l.start, l.len + len + r.len);
            reposition_and_update(tp, st, &mut bcur, l.start, rec)?;
            rec
        }
        (Some(l), None) => {
            let rec = AllocRec::new(l.start, l.len + len);
            reposition_and_update(tp, st, &mut bcur, l.start, rec)?;
            rec
        }
        (None, Some(r)) => {
            let rec = AllocRec::new(bno, len + r.len);
            reposition_and_update(tp, st, &mut bcur, r.start, rec)?;
            rec
        }
        (None, None) => {
            let rec = AllocRec::new(bno, len);
            bcur.insert(tp, &mut st.tree(BtreeKind::Bno), &Record::FreeSpaceByBno(rec))?;
            rec
        }
    };
    ccur.insert(tp, &mut st.tree(BtreeKind::Cnt), &Record::FreeSpaceBySize(combined))?;

    st.agf.freeblks += len;
    if st.agf.freeblks > st.agf.length {
        return Err(st.corrupt(
            tp,
            format!("freeblks {} exceeds AG length {}", st.agf.freeblks, st.agf.length),
        ));
    }
    refresh_longest(tp, st)?;
    st.write(tp)?;
    debug!(
        agno = st.agno.0,
        agbno = bno,
        len,
        merged_left = left.is_some(),
        merged_right = right.is_some(),
        freeblks = st.agf.freeblks,
        "alloc_ag_free"
    );
    Ok(())
}

fn reposition_and_update(
    tp: &mut Transaction,
    st: &mut AgfState,
    cur: &mut Cursor,
    at: u32,
    rec: AllocRec,
) -> Result<()> {
    if !cur.lookup(tp, &st.tree(BtreeKind::Bno), &bno_key(at), LookupDir::Eq)? {
        return Err(st.corrupt(tp, format!("free extent at {at} vanished")));
    }
    cur.update(tp, &st.tree(BtreeKind::Bno), &Record::FreeSpaceByBno(rec))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(min: u32, max: u32) -> AgAllocRequest {
        AgAllocRequest::new(AgAllocType::Anywhere { near: None }, min, max)
    }

    #[test]
    fn fix_len_honours_modulus() {
        let r = req(1, 100).length_multiple(4, 1);
        assert_eq!(r.fix_len(11), 9);
        assert_eq!(r.fix_len(8), 5);
        assert_eq!(r.fix_len(9), 9);
        // Trimming would fall below min_len.
        let r = req(7, 100).length_multiple(4, 0);
        assert_eq!(r.fix_len(7), 7);
        // max_len is always acceptable.
        assert_eq!(req(1, 10).length_multiple(4, 0).fix_len(30), 10);
    }

    #[test]
    fn usable_applies_alignment_first() {
        let r = req(4, 8).aligned(4);
        assert_eq!(r.usable(101, 10), Some((104, 7)));
        assert_eq!(r.usable(101, 6), None);
        assert_eq!(r.usable(100, 20), Some((100, 8)));
    }

    #[test]
    fn closest_start_stays_inside_the_extent() {
        let free = AllocRec::new(100, 50);
        assert_eq!(closest_start(free, 100, 10, 120, 1), 120);
        assert_eq!(closest_start(free, 100, 10, 10, 1), 100);
        assert_eq!(closest_start(free, 100, 10, 500, 1), 140);
        assert_eq!(closest_start(free, 100, 10, 123, 4), 124);
        assert_eq!(closest_start(free, 100, 10, 121, 4), 120);
    }

    #[test]
    fn longest_free_discounts_the_freelist_shortfall() {
        let agf = Agf {
            seqno: 0,
            length: 1000,
            bno_root: 4,
            cnt_root: 5,
            bno_level: 1,
            cnt_level: 1,
            flfirst: 0,
            fllast: 0,
            flcount: 1,
            freeblks: 500,
            longest: 100,
            btreeblks: 0,
        };
        assert_eq!(longest_free(&agf, 4), 97);
        assert_eq!(longest_free(&agf, 1), 100);
        let tiny = Agf { longest: 2, ..agf };
        assert_eq!(longest_free(&tiny, 4), 1);
    }

    #[test]
    fn request_validation() {
        assert!(req(0, 1).check(100).is_err());
        assert!(req(5, 4).check(100).is_err());
        assert!(req(1, 200).check(100).is_err());
        assert!(req(1, 10).length_multiple(4, 4).check(100).is_err());
        req(1, 10).aligned(8).check(100).unwrap();
    }
}
