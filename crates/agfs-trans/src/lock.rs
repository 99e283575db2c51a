//! Multi-object locking in a fixed total order.
//!
//! The lowest key is taken with a blocking lock; every further object is
//! only try-locked. If one is busy (typically because its holder is in the
//! middle of a commit), everything acquired so far is dropped and the whole
//! set is retried after a short backoff.

use parking_lot::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::trace;

const SPIN_ATTEMPTS: u32 = 4;
const MAX_BACKOFF: Duration = Duration::from_millis(2);

fn backoff(attempt: u32) {
    if attempt < SPIN_ATTEMPTS {
        thread::yield_now();
    } else {
        let micros = 50_u64 << (attempt - SPIN_ATTEMPTS).min(6);
        thread::sleep(Duration::from_micros(micros).min(MAX_BACKOFF));
    }
}

/// Lock every object, returning guards sorted by key. Duplicate keys are
/// locked once.
pub fn lock_ordered<'a, K, T>(items: &[(K, &'a Mutex<T>)]) -> Vec<(K, MutexGuard<'a, T>)>
where
    K: Ord + Copy + std::fmt::Debug,
{
    let mut sorted: Vec<(K, &'a Mutex<T>)> = items.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    sorted.dedup_by(|a, b| a.0 == b.0);

    let mut attempt = 0_u32;
    'retry: loop {
        let mut guards = Vec::with_capacity(sorted.len());
        for (index, (key, mutex)) in sorted.iter().enumerate() {
            if index == 0 {
                guards.push((*key, mutex.lock()));
                continue;
            }
            if let Some(guard) = mutex.try_lock() {
                guards.push((*key, guard));
            } else {
                trace!(key = ?key, attempt, "ordered_lock_backoff");
                drop(guards);
                backoff(attempt);
                attempt = attempt.saturating_add(1);
                continue 'retry;
            }
        }
        return guards;
    }
}

/// Lock two objects in key order; guards come back in argument order. The
/// second guard is `None` when both keys name the same object.
pub fn lock_pair<'a, K, T>(
    first: (K, &'a Mutex<T>),
    second: (K, &'a Mutex<T>),
) -> (MutexGuard<'a, T>, Option<MutexGuard<'a, T>>)
where
    K: Ord + Copy + std::fmt::Debug,
{
    let mut guards = lock_ordered(&[first, second]);
    if guards.len() == 1 {
        let (_, guard) = guards.remove(0);
        return (guard, None);
    }
    let (_, hi) = guards.remove(1);
    let (_, lo) = guards.remove(0);
    if first.0 < second.0 {
        (lo, Some(hi))
    } else {
        (hi, Some(lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn guards_come_back_in_argument_order() {
        let a = Mutex::new("a");
        let b = Mutex::new("b");
        let (ga, gb) = lock_pair((9_u32, &a), (3_u32, &b));
        assert_eq!(*ga, "a");
        assert_eq!(gb.map(|g| *g), Some("b"));
    }

    #[test]
    fn same_key_locks_once() {
        let a = Mutex::new(1);
        let (guard, other) = lock_pair((5_u32, &a), (5_u32, &a));
        assert_eq!(*guard, 1);
        assert!(other.is_none());
    }

    #[test]
    fn ordered_set_is_sorted_and_deduplicated() {
        let m: Vec<Mutex<u32>> = (0..4).map(Mutex::new).collect();
        let guards = lock_ordered(&[(3, &m[3]), (1, &m[1]), (3, &m[3]), (0, &m[0])]);
        let keys: Vec<u32> = guards.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![0, 1, 3]);
    }

    #[test]
    fn opposite_order_pairs_do_not_deadlock() {
        let a = Arc::new(Mutex::new(0_u64));
        let b = Arc::new(Mutex::new(0_u64));
        let done = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (a, b, done) = (Arc::clone(&a), Arc::clone(&b), Arc::clone(&done));
                thread::spawn(move || {
                    for _ in 0..500 {
                        let (mut x, y) = if i % 2 == 0 {
                            lock_pair((1, &*a), (2, &*b))
                        } else {
                            lock_pair((2, &*b), (1, &*a))
                        };
                        *x += 1;
                        if let Some(mut y) = y {
                            *y += 1;
                        }
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(*a.lock() + *b.lock(), 4000);
    }
}
