//! Sharded superblock counters.
//!
//! Each counter is a folded global value plus a small set of per-thread
//! shards. Small deltas land in a shard and are folded into the global
//! value once the shard drifts past `batch`; large deltas and any decrement
//! that may cross the floor settle on the exact sum under a mutex.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tracing::trace;

static NEXT_SHARD_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn shard_slot() -> usize {
    SHARD_SLOT.with(|slot| {
        if let Some(value) = slot.get() {
            return value;
        }
        let value = NEXT_SHARD_SLOT.fetch_add(1, Ordering::Relaxed);
        slot.set(Some(value));
        value
    })
}

#[derive(Debug)]
pub struct PercpuCounter {
    global: AtomicI64,
    shards: Box<[AtomicI64]>,
    batch: i64,
    slow: Mutex<()>,
}

impl PercpuCounter {
    #[must_use]
    pub fn new(initial: i64, shards: usize, batch: i64) -> Self {
        Self {
            global: AtomicI64::new(initial),
            shards: (0..shards.max(1)).map(|_| AtomicI64::new(0)).collect(),
            batch: batch.max(1),
            slow: Mutex::new(()),
        }
    }

    fn shard(&self) -> &AtomicI64 {
        &self.shards[shard_slot() % self.shards.len()]
    }

    fn fold(&self, shard: &AtomicI64) {
        let value = shard.swap(0, Ordering::AcqRel);
        if value != 0 {
            self.global.fetch_add(value, Ordering::AcqRel);
        }
    }

    fn fold_all(&self) {
        for shard in &*self.shards {
            self.fold(shard);
        }
    }

    /// Largest error between `approx()` and the exact value while shards
    /// stay within their batch and no more threads than shards race.
    fn slack(&self) -> i64 {
        let shards = i64::try_from(self.shards.len()).unwrap_or(i64::MAX);
        self.batch.saturating_mul(shards).saturating_mul(2)
    }

    /// Eventually consistent add.
    pub fn add(&self, delta: i64) {
        if delta.abs() < self.batch {
            let shard = self.shard();
            let now = shard.fetch_add(delta, Ordering::AcqRel) + delta;
            if now.abs() >= self.batch {
                self.fold(shard);
            }
        } else {
            let _guard = self.slow.lock();
            self.global.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Subtract `amount` unless that would take the exact value below
    /// `floor`. Small amounts are taken first and checked afterwards, so a
    /// racing caller always sees them; near the floor the check runs on the
    /// exact sum and a refused amount is put back.
    pub fn try_sub(&self, amount: i64, floor: i64) -> bool {
        if amount < self.batch {
            self.add(-amount);
            if self.global.load(Ordering::Acquire) - self.slack() >= floor {
                return true;
            }
            let _guard = self.slow.lock();
            self.fold_all();
            let current = self.global.load(Ordering::Acquire);
            if current >= floor {
                return true;
            }
            self.global.fetch_add(amount, Ordering::AcqRel);
            trace!(current, amount, floor, "percpu_counter_try_sub_refused");
            return false;
        }
        let _guard = self.slow.lock();
        self.fold_all();
        let current = self.global.load(Ordering::Acquire);
        if current - amount < floor {
            trace!(current, amount, floor, "percpu_counter_try_sub_refused");
            return false;
        }
        self.global.fetch_sub(amount, Ordering::AcqRel);
        true
    }

    /// Folded value; off by at most the sum of unfolded shard deltas.
    #[must_use]
    pub fn approx(&self) -> i64 {
        self.global.load(Ordering::Acquire)
    }

    /// Exact value (folds every shard).
    #[must_use]
    pub fn sum(&self) -> i64 {
        let _guard = self.slow.lock();
        self.fold_all();
        self.global.load(Ordering::Acquire)
    }

    /// Exact value clamped at zero, as stored in the superblock.
    #[must_use]
    pub fn sum_positive(&self) -> u64 {
        u64::try_from(self.sum()).unwrap_or(0)
    }
}

/// Superblock counter a transaction can carry a delta for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SbField {
    Dblocks,
    Icount,
    Ifree,
    Fdblocks,
    Frextents,
}

impl SbField {
    pub const ALL: [Self; 5] = [
        Self::Dblocks,
        Self::Icount,
        Self::Ifree,
        Self::Fdblocks,
        Self::Frextents,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Dblocks => 0,
            Self::Icount => 1,
            Self::Ifree => 2,
            Self::Fdblocks => 3,
            Self::Frextents => 4,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    #[must_use]
    pub fn code(self) -> u8 {
        // index() is at most 4.
        #[expect(clippy::cast_possible_truncation)]
        let code = self.index() as u8;
        code
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Dblocks => "dblocks",
            Self::Icount => "icount",
            Self::Ifree => "ifree",
            Self::Fdblocks => "fdblocks",
            Self::Frextents => "frextents",
        }
    }
}

/// Exact counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbCounterSnapshot {
    pub dblocks: u64,
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
    pub frextents: u64,
}

#[derive(Debug)]
pub struct SbCounters {
    counters: [PercpuCounter; 5],
}

impl SbCounters {
    #[must_use]
    pub fn new(initial: SbCounterSnapshot, shards: usize, batch: i64) -> Self {
        let make = |value: u64| {
            PercpuCounter::new(i64::try_from(value).unwrap_or(i64::MAX), shards, batch)
        };
        Self {
            counters: [
                make(initial.dblocks),
                make(initial.icount),
                make(initial.ifree),
                make(initial.fdblocks),
                make(initial.frextents),
            ],
        }
    }

    #[must_use]
    pub fn counter(&self, field: SbField) -> &PercpuCounter {
        &self.counters[field.index()]
    }

    pub fn apply(&self, field: SbField, delta: i64) {
        if delta != 0 {
            self.counter(field).add(delta);
        }
    }

    #[must_use]
    pub fn get(&self, field: SbField) -> u64 {
        self.counter(field).sum_positive()
    }

    #[must_use]
    pub fn snapshot(&self) -> SbCounterSnapshot {
        SbCounterSnapshot {
            dblocks: self.get(SbField::Dblocks),
            icount: self.get(SbField::Icount),
            ifree: self.get(SbField::Ifree),
            fdblocks: self.get(SbField::Fdblocks),
            frextents: self.get(SbField::Frextents),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn small_deltas_fold_lazily_but_sum_is_exact() {
        let counter = PercpuCounter::new(100, 4, 32);
        for _ in 0..10 {
            counter.add(-1);
        }
        assert_eq!(counter.sum(), 90);
        counter.add(1000);
        assert_eq!(counter.approx(), 1090, "large delta goes straight to global");
    }

    #[test]
    fn try_sub_respects_floor_exactly() {
        let counter = PercpuCounter::new(50, 4, 8);
        assert!(counter.try_sub(40, 10));
        assert!(!counter.try_sub(1, 10));
        assert_eq!(counter.sum(), 10);
        assert!(counter.try_sub(10, 0));
        assert!(!counter.try_sub(1, 0));
    }

    #[test]
    fn concurrent_adds_sum_exactly() {
        let counter = Arc::new(PercpuCounter::new(0, 8, 16));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.add(if i % 2 == 0 { 3 } else { -1 });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.sum(), 4 * 3000 - 4 * 1000);
    }

    #[test]
    fn concurrent_try_sub_never_overdraws() {
        let counter = Arc::new(PercpuCounter::new(1000, 8, 4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let mut taken = 0;
                    while counter.try_sub(3, 0) {
                        taken += 3;
                    }
                    taken
                })
            })
            .collect();
        let taken: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let left = counter.sum();
        assert!(left >= 0);
        assert_eq!(taken + left, 1000);
    }

    #[test]
    fn try_sub_holds_the_floor_with_more_threads_than_shards() {
        let counter = Arc::new(PercpuCounter::new(400, 2, 8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let mut taken = 0;
                    for _ in 0..200 {
                        if counter.try_sub(7, 100) {
                            taken += 7;
                        }
                    }
                    taken
                })
            })
            .collect();
        let taken: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let left = counter.sum();
        assert!(left >= 100, "counter fell to {left}");
        assert_eq!(taken + left, 400);
        assert!(!counter.try_sub(7, left - 6));
        assert_eq!(counter.sum(), left);
    }

    #[test]
    fn sb_counters_snapshot() {
        let counters = SbCounters::new(
            SbCounterSnapshot {
                dblocks: 4096,
                icount: 64,
                ifree: 63,
                fdblocks: 4000,
                frextents: 0,
            },
            2,
            8,
        );
        counters.apply(SbField::Ifree, -1);
        counters.apply(SbField::Fdblocks, -100);
        let snap = counters.snapshot();
        assert_eq!(snap.ifree, 62);
        assert_eq!(snap.fdblocks, 3900);
        assert_eq!(SbField::from_code(SbField::Frextents.code()), Some(SbField::Frextents));
    }
}
