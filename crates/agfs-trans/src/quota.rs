//! Quota reservation sub-protocol.
//!
//! A dquot tracks `count` (committed usage) and `reserved` (usage plus
//! outstanding reservations, so `reserved >= count` always). Transactions
//! reserve worst-case amounts up front, record actual usage as deltas and
//! apply them at commit; cancel returns the reservation untouched.
//!
//! | Step | count | reserved |
//! |------|-------|----------|
//! | reserve `r` | - | `+ r` |
//! | commit with usage `d` | `+ d` | `+ d - r` |
//! | cancel | - | `- r` |

use crate::lock::lock_ordered;
use agfs_error::{AgfsError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QuotaType {
    User,
    Group,
    Project,
}

impl QuotaType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Project => "project",
        }
    }

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::User => 0,
            Self::Group => 1,
            Self::Project => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::User),
            1 => Some(Self::Group),
            2 => Some(Self::Project),
            _ => None,
        }
    }
}

/// Dquot identity; the derived order is the lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DquotId {
    pub ty: QuotaType,
    pub id: u32,
}

impl DquotId {
    #[must_use]
    pub fn user(id: u32) -> Self {
        Self {
            ty: QuotaType::User,
            id,
        }
    }

    #[must_use]
    pub fn group(id: u32) -> Self {
        Self {
            ty: QuotaType::Group,
            id,
        }
    }

    #[must_use]
    pub fn project(id: u32) -> Self {
        Self {
            ty: QuotaType::Project,
            id,
        }
    }
}

/// Owner of an inode, i.e. the three dquots its usage is charged to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
    pub projid: u32,
}

impl Owner {
    #[must_use]
    pub fn dquot_ids(&self) -> [DquotId; 3] {
        [
            DquotId::user(self.uid),
            DquotId::group(self.gid),
            DquotId::project(self.projid),
        ]
    }
}

/// Quantity a dquot limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaResource {
    Blocks,
    Inodes,
    RtBlocks,
}

impl QuotaResource {
    fn index(self) -> usize {
        match self {
            Self::Blocks => 0,
            Self::Inodes => 1,
            Self::RtBlocks => 2,
        }
    }
}

/// Soft/hard limits; zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub blk_soft: u64,
    pub blk_hard: u64,
    pub ino_soft: u64,
    pub ino_hard: u64,
    pub rtb_soft: u64,
    pub rtb_hard: u64,
}

impl QuotaLimits {
    fn soft_hard(&self, resource: QuotaResource) -> (u64, u64) {
        match resource {
            QuotaResource::Blocks => (self.blk_soft, self.blk_hard),
            QuotaResource::Inodes => (self.ino_soft, self.ino_hard),
            QuotaResource::RtBlocks => (self.rtb_soft, self.rtb_hard),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub count: u64,
    pub reserved: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dquot {
    pub id: DquotId,
    pub limits: QuotaLimits,
    /// Indexed by `QuotaResource`.
    pub usage: [QuotaUsage; 3],
}

impl Dquot {
    fn new(id: DquotId) -> Self {
        Self {
            id,
            limits: QuotaLimits::default(),
            usage: [QuotaUsage::default(); 3],
        }
    }

    #[must_use]
    pub fn usage(&self, resource: QuotaResource) -> QuotaUsage {
        self.usage[resource.index()]
    }

    /// Would reserving `amount` more cross the hard limit?
    fn exceeds_hard(&self, resource: QuotaResource, amount: u64) -> bool {
        let (_, hard) = self.limits.soft_hard(resource);
        hard != 0 && self.usage[resource.index()].reserved + amount > hard
    }

    fn crosses_soft(&self, resource: QuotaResource, amount: u64) -> bool {
        let (soft, _) = self.limits.soft_hard(resource);
        soft != 0 && self.usage[resource.index()].reserved + amount > soft
    }
}

/// Reservation taken and usage recorded against one dquot by one
/// transaction. Indexed by `QuotaResource`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DquotDelta {
    pub reserved: [u64; 3],
    pub used: [i64; 3],
}

impl DquotDelta {
    fn add_reserved(&mut self, amounts: [u64; 3]) {
        for (slot, amount) in self.reserved.iter_mut().zip(amounts) {
            *slot += amount;
        }
    }

    /// Reservation still unconsumed by positive usage.
    fn unused(&self, resource: QuotaResource) -> u64 {
        let i = resource.index();
        let used = u64::try_from(self.used[i].max(0)).unwrap_or(0);
        self.reserved[i].saturating_sub(used)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reserved == [0; 3] && self.used == [0; 3]
    }
}

const RESOURCES: [QuotaResource; 3] = [
    QuotaResource::Blocks,
    QuotaResource::Inodes,
    QuotaResource::RtBlocks,
];

#[derive(Debug)]
pub struct QuotaManager {
    enforce: bool,
    dquots: Mutex<BTreeMap<DquotId, Arc<Mutex<Dquot>>>>,
}

impl QuotaManager {
    #[must_use]
    pub fn new(enforce: bool) -> Self {
        Self {
            enforce,
            dquots: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn is_enforcing(&self) -> bool {
        self.enforce
    }

    fn dquot(&self, id: DquotId) -> Arc<Mutex<Dquot>> {
        Arc::clone(
            self.dquots
                .lock()
                .entry(id)
                .or_insert_with(|| Arc::new(Mutex::new(Dquot::new(id)))),
        )
    }

    pub fn set_limits(&self, id: DquotId, limits: QuotaLimits) {
        self.dquot(id).lock().limits = limits;
        debug!(ty = id.ty.name(), id = id.id, ?limits, "dquot_limits_set");
    }

    /// Snapshot of one dquot (a fresh, empty one if never touched).
    #[must_use]
    pub fn get(&self, id: DquotId) -> Dquot {
        self.dquot(id).lock().clone()
    }

    /// Every dquot with a limit or non-zero usage, in id order.
    #[must_use]
    pub fn list(&self) -> Vec<Dquot> {
        let handles: Vec<_> = self.dquots.lock().values().cloned().collect();
        handles.iter().map(|d| d.lock().clone()).collect()
    }

    /// Reserve `amounts` on every dquot in `ids` as one step: either all
    /// reservations are taken or none is.
    pub fn reserve(&self, ids: &[DquotId], amounts: [u64; 3]) -> Result<()> {
        self.reserve_moving(&[], ids, amounts)
    }

    /// Like `reserve`, but also locks `also_lock` in the same ordered step
    /// (the dquots an ownership change moves usage away from).
    pub fn reserve_moving(
        &self,
        also_lock: &[DquotId],
        ids: &[DquotId],
        amounts: [u64; 3],
    ) -> Result<()> {
        let handles: Vec<(DquotId, Arc<Mutex<Dquot>>)> = ids
            .iter()
            .chain(also_lock)
            .map(|id| (*id, self.dquot(*id)))
            .collect();
        let refs: Vec<(DquotId, &Mutex<Dquot>)> =
            handles.iter().map(|(id, d)| (*id, d.as_ref())).collect();
        let mut guards = lock_ordered(&refs);

        for (id, dquot) in &guards {
            if !ids.contains(id) {
                continue;
            }
            for resource in RESOURCES {
                let amount = amounts[resource.index()];
                if amount == 0 {
                    continue;
                }
                let exempt = !self.enforce || id.id == 0;
                if !exempt && dquot.exceeds_hard(resource, amount) {
                    warn!(
                        ty = id.ty.name(),
                        id = id.id,
                        ?resource,
                        amount,
                        "dquot_hard_limit_exceeded"
                    );
                    return Err(AgfsError::QuotaExceeded {
                        kind: id.ty.name(),
                        id: id.id,
                    });
                }
                if !exempt && dquot.crosses_soft(resource, amount) {
                    warn!(ty = id.ty.name(), id = id.id, ?resource, "dquot_soft_limit_crossed");
                }
            }
        }
        for (id, dquot) in &mut guards {
            if !ids.contains(id) {
                continue;
            }
            for resource in RESOURCES {
                dquot.usage[resource.index()].reserved += amounts[resource.index()];
            }
        }
        Ok(())
    }

    /// Return an unconsumed reservation.
    pub fn unreserve(&self, id: DquotId, amounts: [u64; 3]) {
        let dquot = self.dquot(id);
        let mut dquot = dquot.lock();
        for resource in RESOURCES {
            let usage = &mut dquot.usage[resource.index()];
            usage.reserved = usage
                .reserved
                .saturating_sub(amounts[resource.index()])
                .max(usage.count);
        }
    }

    /// Fold one transaction's delta into the dquot (commit path).
    pub fn apply(&self, id: DquotId, delta: &DquotDelta) {
        let dquot = self.dquot(id);
        let mut dquot = dquot.lock();
        for resource in RESOURCES {
            let i = resource.index();
            let usage = &mut dquot.usage[i];
            let used = delta.used[i];
            usage.count = usage.count.saturating_add_signed(used);
            // Unconsumed reservation returns; consumed reservation already
            // sits in `reserved`; usage beyond it (or a release) moves it.
            let unused = delta.unused(resource);
            let uncovered = used - i64::try_from(delta.reserved[i]).unwrap_or(i64::MAX);
            usage.reserved = usage.reserved.saturating_sub(unused);
            if uncovered > 0 || used < 0 {
                let shift = if used < 0 { used } else { uncovered };
                usage.reserved = usage.reserved.saturating_add_signed(shift);
            }
            usage.reserved = usage.reserved.max(usage.count);
        }
    }

    /// Cancel path for a transaction's delta.
    pub fn cancel(&self, id: DquotId, delta: &DquotDelta) {
        self.unreserve(id, delta.reserved);
    }
}

/// Per-transaction quota state, keyed by dquot (ascending = lock order).
#[derive(Debug, Default, Clone)]
pub struct QuotaTrans {
    pub items: BTreeMap<DquotId, DquotDelta>,
}

impl QuotaTrans {
    pub fn note_reserved(&mut self, ids: &[DquotId], amounts: [u64; 3]) {
        for id in ids {
            self.items.entry(*id).or_default().add_reserved(amounts);
        }
    }

    /// Record usage; positive usage must be covered by the reservation
    /// unless the dquot is exempt.
    pub fn note_used(
        &mut self,
        id: DquotId,
        resource: QuotaResource,
        delta: i64,
        checked: bool,
    ) -> Result<()> {
        let item = self.items.entry(id).or_default();
        let i = resource.index();
        let next = item.used[i] + delta;
        let reserved = i64::try_from(item.reserved[i]).unwrap_or(i64::MAX);
        if checked && delta > 0 && next > reserved {
            return Err(AgfsError::ReservationOverrun {
                resource: "quota",
                reserved: item.reserved[i],
                requested: u64::try_from(next).unwrap_or(0),
            });
        }
        item.used[i] = next;
        Ok(())
    }

    /// What carries into a rolled continuation: reservations minus what the
    /// committed part consumed; no usage.
    #[must_use]
    pub fn carry_over(&self) -> Self {
        let mut next = Self::default();
        for (id, delta) in &self.items {
            let mut carried = DquotDelta::default();
            for resource in RESOURCES {
                carried.reserved[resource.index()] = delta.unused(resource);
            }
            if !carried.is_empty() {
                next.items.insert(*id, carried);
            }
        }
        next
    }

    /// The committed part of a rolled transaction keeps only what it used.
    #[must_use]
    pub fn consumed_part(&self) -> Self {
        let mut out = Self::default();
        for (id, delta) in &self.items {
            let mut part = *delta;
            for resource in RESOURCES {
                let i = resource.index();
                part.reserved[i] -= delta.unused(resource);
            }
            out.items.insert(*id, part);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKS: [u64; 3] = [10, 0, 0];

    fn limited(manager: &QuotaManager, id: DquotId, blk_hard: u64) {
        manager.set_limits(
            id,
            QuotaLimits {
                blk_hard,
                ino_hard: 5,
                ..QuotaLimits::default()
            },
        );
    }

    #[test]
    fn reserve_then_commit_moves_reservation_into_count() {
        let qm = QuotaManager::new(true);
        let id = DquotId::user(1000);
        qm.reserve(&[id], BLOCKS).unwrap();
        assert_eq!(qm.get(id).usage(QuotaResource::Blocks).reserved, 10);

        let mut qt = QuotaTrans::default();
        qt.note_reserved(&[id], BLOCKS);
        qt.note_used(id, QuotaResource::Blocks, 7, true).unwrap();
        qm.apply(id, &qt.items[&id]);

        let usage = qm.get(id).usage(QuotaResource::Blocks);
        assert_eq!(usage, QuotaUsage { count: 7, reserved: 7 });
    }

    #[test]
    fn cancel_restores_reservation() {
        let qm = QuotaManager::new(true);
        let id = DquotId::group(5);
        qm.reserve(&[id], [3, 1, 0]).unwrap();
        let mut qt = QuotaTrans::default();
        qt.note_reserved(&[id], [3, 1, 0]);
        qm.cancel(id, &qt.items[&id]);
        assert_eq!(qm.get(id).usage(QuotaResource::Blocks), QuotaUsage::default());
        assert_eq!(qm.get(id).usage(QuotaResource::Inodes), QuotaUsage::default());
    }

    #[test]
    fn hard_limit_rejects_all_or_nothing() {
        let qm = QuotaManager::new(true);
        let user = DquotId::user(1000);
        let group = DquotId::group(1000);
        limited(&qm, group, 15);
        qm.reserve(&[user, group], BLOCKS).unwrap();
        let err = qm.reserve(&[user, group], BLOCKS).unwrap_err();
        assert!(matches!(err, AgfsError::QuotaExceeded { kind: "group", id: 1000 }));
        assert_eq!(
            qm.get(user).usage(QuotaResource::Blocks).reserved,
            10,
            "user dquot untouched by the failed reservation"
        );
    }

    #[test]
    fn root_and_unenforced_are_exempt() {
        let qm = QuotaManager::new(true);
        limited(&qm, DquotId::user(0), 1);
        qm.reserve(&[DquotId::user(0)], BLOCKS).unwrap();

        let off = QuotaManager::new(false);
        limited(&off, DquotId::user(9), 1);
        off.reserve(&[DquotId::user(9)], BLOCKS).unwrap();
        assert_eq!(off.get(DquotId::user(9)).usage(QuotaResource::Blocks).reserved, 10);
    }

    #[test]
    fn negative_usage_releases_count_and_reservation() {
        let qm = QuotaManager::new(true);
        let id = DquotId::project(3);
        let mut qt = QuotaTrans::default();
        qm.reserve(&[id], BLOCKS).unwrap();
        qt.note_reserved(&[id], BLOCKS);
        qt.note_used(id, QuotaResource::Blocks, 10, true).unwrap();
        qm.apply(id, &qt.items[&id]);

        let mut free = QuotaTrans::default();
        free.note_used(id, QuotaResource::Blocks, -4, true).unwrap();
        qm.apply(id, &free.items[&id]);
        assert_eq!(
            qm.get(id).usage(QuotaResource::Blocks),
            QuotaUsage { count: 6, reserved: 6 }
        );
    }

    #[test]
    fn usage_beyond_reservation_is_an_overrun() {
        let mut qt = QuotaTrans::default();
        let id = DquotId::user(1);
        qt.note_reserved(&[id], [2, 0, 0]);
        assert!(qt.note_used(id, QuotaResource::Blocks, 3, true).is_err());
        assert!(qt.note_used(id, QuotaResource::Blocks, 3, false).is_ok());
    }

    #[test]
    fn roll_splits_consumed_and_carried_reservation() {
        let mut qt = QuotaTrans::default();
        let id = DquotId::user(1);
        qt.note_reserved(&[id], [10, 1, 0]);
        qt.note_used(id, QuotaResource::Blocks, 4, true).unwrap();
        let done = qt.consumed_part();
        let next = qt.carry_over();
        assert_eq!(done.items[&id].reserved, [4, 0, 0]);
        assert_eq!(next.items[&id].reserved, [6, 1, 0]);
        assert_eq!(next.items[&id].used, [0, 0, 0]);
    }
}
