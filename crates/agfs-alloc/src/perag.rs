//! Per-AG locks.
//!
//! An AG lock guards the AG headers and every btree rooted in them. It is
//! taken before the first buffer of the AG is joined to a transaction and
//! must be held until that transaction has committed or cancelled, so the
//! [`AgLockSet`] is dropped only after the transaction is finished.
//!
//! AGs are locked in ascending order. Once a higher AG is held a lower one
//! is only try-locked; on contention the caller moves on instead of
//! waiting while holding a lock someone else may need.

use agfs_error::{AgfsError, Result};
use agfs_types::AgNumber;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug)]
pub struct PeragTable {
    locks: Vec<Mutex<()>>,
}

impl PeragTable {
    #[must_use]
    pub fn new(ag_count: u32) -> Self {
        Self {
            locks: (0..ag_count).map(|_| Mutex::new(())).collect(),
        }
    }

    #[must_use]
    pub fn ag_count(&self) -> u32 {
        u32::try_from(self.locks.len()).unwrap_or(u32::MAX)
    }

    /// An empty lock set for one transaction.
    #[must_use]
    pub fn lock_set(&self) -> AgLockSet<'_> {
        AgLockSet {
            table: self,
            held: BTreeMap::new(),
        }
    }
}

/// AG locks held on behalf of one transaction.
#[derive(Debug)]
pub struct AgLockSet<'a> {
    table: &'a PeragTable,
    held: BTreeMap<AgNumber, MutexGuard<'a, ()>>,
}

impl AgLockSet<'_> {
    /// Lock `agno`. Blocks unless a higher AG is already held, in which
    /// case only a try-lock is made; `false` means it was contended.
    pub fn lock(&mut self, agno: AgNumber) -> Result<bool> {
        if self.held.contains_key(&agno) {
            return Ok(true);
        }
        let mutex = self
            .table
            .locks
            .get(agno.0 as usize)
            .ok_or_else(|| {
                AgfsError::InvalidArgument(format!("allocation group {} out of range", agno.0))
            })?;
        let above = self.held.keys().next_back().is_some_and(|top| *top > agno);
        let guard = if above {
            let Some(guard) = mutex.try_lock() else {
                trace!(agno = agno.0, "ag_lock_contended");
                return Ok(false);
            };
            guard
        } else {
            mutex.lock()
        };
        self.held.insert(agno, guard);
        trace!(agno = agno.0, held = self.held.len(), "ag_locked");
        Ok(true)
    }

    /// Lock every AG in `agnos`, lowest first. An AG that can only be
    /// try-locked and is contended fails the whole call with `Busy`; the
    /// locks already taken stay held until the set is dropped.
    pub fn lock_all(&mut self, agnos: &[AgNumber]) -> Result<()> {
        let mut wanted = agnos.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        for agno in wanted {
            if !self.lock(agno)? {
                return Err(AgfsError::Busy(format!("allocation group {} is locked", agno.0)));
            }
        }
        Ok(())
    }

    /// Drop the lock on an AG the transaction never touched.
    pub fn unlock(&mut self, agno: AgNumber) {
        if self.held.remove(&agno).is_some() {
            trace!(agno = agno.0, "ag_unlocked");
        }
    }

    #[must_use]
    pub fn is_held(&self, agno: AgNumber) -> bool {
        self.held.contains_key(&agno)
    }

    #[must_use]
    pub fn held(&self) -> Vec<AgNumber> {
        self.held.keys().copied().collect()
    }
}
