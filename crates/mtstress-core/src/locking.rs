//! Lock registry installed as the library's serialization callback.
//!
//! The underlying library is not thread-safe on its own. Whenever it touches
//! one of its shared tables (session cache, context statistics, error queue,
//! random state) it calls a locking callback with a small integer naming the
//! table. [`LockRegistry`] answers those calls with a fixed array of mutexes,
//! one per identifier, and counts every acquisition.
//!
//! The registry never allocates after construction. Acquire and release are
//! separate calls, so each slot is a mutex-protected owner cell plus a
//! condition variable rather than a guard-scoped mutex; release checks that
//! the caller is the owner.
//!
//! # Lifecycle
//!
//! ```text
//! LockRegistry::new(n) ──> Hooks::install ──> workers run ──> Hooks::uninstall ──> teardown()
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::error::LockError;

/// Direction of a locking callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Acquire the lock, blocking until it is free.
    Lock,
    /// Release a lock held by the calling thread.
    Unlock,
}

/// Callbacks a session library invokes for thread safety.
pub trait Locking: Send + Sync {
    /// Acquire or release lock `id` on behalf of the library.
    fn lock(&self, mode: LockMode, id: usize);

    /// Stable identifier of the calling thread.
    fn thread_id(&self) -> u64 {
        current_thread_id()
    }
}

/// Numeric identifier of the calling thread.
///
/// Assigned on first use, stable for the life of the thread, distinct across
/// concurrently-live threads.
pub fn current_thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }

    ID.with(|id| *id)
}

#[derive(Debug, Default)]
struct Slot {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl Slot {
    fn acquire(&self, id: usize) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner == Some(me) {
            return Err(LockError::AlreadyHeld { id });
        }
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(me);
        Ok(())
    }

    fn release(&self, id: usize) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        if *owner != Some(me) {
            return Err(LockError::NotHeld { id });
        }
        *owner = None;
        drop(owner);
        self.released.notify_one();
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.owner.lock().is_some()
    }
}

/// Fixed-size table of mutexes indexed by lock identifier.
#[derive(Debug)]
pub struct LockRegistry {
    slots: Box<[Slot]>,
    counters: Box<[AtomicU64]>,
}

impl LockRegistry {
    /// Create `lock_count` free locks with zeroed counters.
    pub fn new(lock_count: usize) -> Self {
        Self {
            slots: (0..lock_count).map(|_| Slot::default()).collect(),
            counters: (0..lock_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Number of lock identifiers.
    pub fn lock_count(&self) -> usize {
        self.slots.len()
    }

    /// Block until lock `id` is free, take it, and count the acquisition.
    pub fn acquire(&self, id: usize) -> Result<(), LockError> {
        let slot = self.slot(id)?;
        slot.acquire(id)?;
        self.counters[id].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release lock `id`, which the calling thread must hold.
    pub fn release(&self, id: usize) -> Result<(), LockError> {
        self.slot(id)?.release(id)
    }

    /// Acquisitions of lock `id` so far.
    pub fn count(&self, id: usize) -> Option<u64> {
        self.counters.get(id).map(|c| c.load(Ordering::Relaxed))
    }

    /// Snapshot of every counter.
    pub fn counters(&self) -> Vec<u64> {
        self.counters.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    /// Destroy the registry and return the final counters.
    ///
    /// Fails if anyone else still holds a reference (the callback is still
    /// installed, or a worker is alive) or if any lock is still held.
    pub fn teardown(self: Arc<Self>) -> Result<Vec<u64>, LockError> {
        let registry = Arc::try_unwrap(self)
            .map_err(|shared| LockError::InUse { holders: Arc::strong_count(&shared) - 1 })?;

        if let Some(id) = registry.slots.iter().position(Slot::is_held) {
            return Err(LockError::StillHeld { id });
        }

        Ok(registry.counters.into_vec().into_iter().map(AtomicU64::into_inner).collect())
    }

    fn slot(&self, id: usize) -> Result<&Slot, LockError> {
        self.slots.get(id).ok_or(LockError::OutOfRange { id, count: self.slots.len() })
    }
}

impl Locking for LockRegistry {
    fn lock(&self, mode: LockMode, id: usize) {
        let result = match mode {
            LockMode::Lock => self.acquire(id),
            LockMode::Unlock => self.release(id),
        };

        // Continuing would leave the library's shared tables unprotected.
        if let Err(err) = result {
            error!(%err, id, ?mode, thread = current_thread_id(), "lock registry misuse");
            std::process::abort();
        }
    }
}

/// Usage of one lock identifier at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockUsage {
    /// Lock identifier
    pub id: usize,
    /// Name declared by the library
    pub name: &'static str,
    /// Number of acquisitions
    pub count: u64,
}

/// Final counters of a torn-down registry, labelled by the library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    usage: Vec<LockUsage>,
}

impl LockStats {
    /// Label `counts` using the library's lock names.
    pub fn new(counts: Vec<u64>, name: impl Fn(usize) -> &'static str) -> Self {
        let usage = counts
            .into_iter()
            .enumerate()
            .map(|(id, count)| LockUsage { id, name: name(id), count })
            .collect();
        Self { usage }
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.usage.iter().map(|u| u.count).sum()
    }

    /// Counter for lock `id`.
    pub fn get(&self, id: usize) -> Option<u64> {
        self.usage.get(id).map(|u| u.count)
    }

    /// Counters in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &LockUsage> {
        self.usage.iter()
    }

    /// Raw counters in identifier order.
    pub fn counts(&self) -> Vec<u64> {
        self.usage.iter().map(|u| u.count).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn acquire_release_counts_once_per_acquire() {
        let registry = LockRegistry::new(4);
        for id in 0..4 {
            registry.acquire(id).unwrap();
            registry.release(id).unwrap();
        }
        registry.acquire(2).unwrap();
        registry.release(2).unwrap();

        assert_eq!(registry.counters(), vec![1, 1, 2, 1]);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let registry = LockRegistry::new(2);
        assert_eq!(registry.acquire(2), Err(LockError::OutOfRange { id: 2, count: 2 }));
        assert_eq!(registry.release(9), Err(LockError::OutOfRange { id: 9, count: 2 }));
        assert_eq!(registry.count(2), None);
    }

    #[test]
    fn release_without_acquire_is_misuse() {
        let registry = LockRegistry::new(1);
        assert_eq!(registry.release(0), Err(LockError::NotHeld { id: 0 }));
    }

    #[test]
    fn release_from_other_thread_is_misuse() {
        let registry = Arc::new(LockRegistry::new(1));
        registry.acquire(0).unwrap();

        let other = Arc::clone(&registry);
        let result = thread::spawn(move || other.release(0)).join().unwrap();
        assert_eq!(result, Err(LockError::NotHeld { id: 0 }));

        registry.release(0).unwrap();
    }

    #[test]
    fn reacquire_by_holder_is_misuse() {
        let registry = LockRegistry::new(1);
        registry.acquire(0).unwrap();
        assert_eq!(registry.acquire(0), Err(LockError::AlreadyHeld { id: 0 }));
        registry.release(0).unwrap();
    }

    #[test]
    fn teardown_requires_sole_owner() {
        let registry = Arc::new(LockRegistry::new(2));
        let extra = Arc::clone(&registry);
        assert_eq!(registry.teardown(), Err(LockError::InUse { holders: 1 }));

        extra.acquire(1).unwrap();
        extra.release(1).unwrap();
        assert_eq!(extra.teardown(), Ok(vec![0, 1]));
    }

    #[test]
    fn teardown_rejects_held_lock() {
        let registry = Arc::new(LockRegistry::new(2));
        registry.acquire(1).unwrap();
        assert_eq!(registry.teardown(), Err(LockError::StillHeld { id: 1 }));
    }

    #[test]
    fn lock_serializes_threads() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;

        let registry = Arc::new(LockRegistry::new(1));
        let inside = Arc::new(AtomicU64::new(0));
        let start = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let inside = Arc::clone(&inside);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    for _ in 0..ROUNDS {
                        registry.lock(LockMode::Lock, 0);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        registry.lock(LockMode::Unlock, 0);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.count(0), Some((THREADS * ROUNDS) as u64));
    }

    #[test]
    fn counters_are_monotonic_under_contention() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 300;

        let registry = Arc::new(LockRegistry::new(3));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut last = 0;
                    for round in 0..ROUNDS {
                        let id = (t + round) % 3;
                        registry.acquire(id).unwrap();
                        registry.release(id).unwrap();

                        let seen = registry.count(0).unwrap();
                        assert!(seen >= last, "counter went backwards: {seen} < {last}");
                        last = seen;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = registry.counters().iter().sum();
        assert_eq!(total, (THREADS * ROUNDS) as u64);
    }

    #[test]
    fn thread_ids_are_stable_and_distinct() {
        let mine = current_thread_id();
        assert_eq!(mine, current_thread_id());

        let theirs = thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(mine, theirs);
    }

    #[test]
    fn stats_carry_library_names() {
        let stats = LockStats::new(vec![3, 0, 4], |id| ["err", "ctx", "cache"][id]);
        assert_eq!(stats.total(), 7);
        assert_eq!(stats.get(2), Some(4));
        let names: Vec<_> = stats.iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["err", "ctx", "cache"]);
    }

    proptest! {
        #[test]
        fn paired_calls_count_exactly(lock_count in 1usize..16, ids in prop::collection::vec(0usize..16, 0..200)) {
            let registry = LockRegistry::new(lock_count);
            let mut expected = vec![0u64; lock_count];
            for id in ids {
                let id = id % lock_count;
                prop_assert!(registry.acquire(id).is_ok());
                prop_assert!(registry.release(id).is_ok());
                expected[id] += 1;
            }
            prop_assert_eq!(registry.counters(), expected);
        }
    }
}
