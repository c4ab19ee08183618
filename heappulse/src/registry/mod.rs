//! # Allocation Registry
//!
//! Concurrent map from block address to [`AllocationRecord`] for every
//! allocation that went through the hooks and has not been released.
//!
//! ## Layout
//!
//! ```text
//! address ──► shard_index() ──► Shard[i]: Mutex<HashMap<usize, AllocationRecord>>
//!                                   │
//!                                   └─ storage from the bookkeeping allocator
//! ```
//!
//! - **insert / remove**: lock exactly one shard, O(1) amortized
//! - **snapshot**: locks every shard in index order, copies, unlocks. Because
//!   single-shard operations never wait on a second lock, the ordered sweep
//!   cannot deadlock, and the copy is a true point-in-time view.
//! - **count**: derived from the maps themselves, so it can never drift from
//!   the number of stored records.
//!
//! ## Reentrancy
//!
//! Map growth uses the bookkeeping allocator (the real allocator, never the
//! hooks). The only other allocation made under a shard lock is the snapshot
//! buffer, which is built inside a suppression scope.
//!
//! ## Fork
//!
//! A shard lock held by another thread at `fork()` would stay held forever in
//! the child. The lifecycle's `pthread_atfork` handlers call
//! [`lock_for_fork`](AllocationRegistry::lock_for_fork) before the fork, then
//! [`unlock_after_fork`](AllocationRegistry::unlock_after_fork) in the parent
//! and [`reset_after_fork`](AllocationRegistry::reset_after_fork) in the child.

pub mod bookkeeping;

use allocator_api2::alloc::Allocator;
use foldhash::fast::FixedState;
use hashbrown::HashMap;
use heappulse_common::AllocationRecord;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, MutexGuard, RawMutex};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::guard;

pub use bookkeeping::SystemBookkeeping;

/// Number of independently locked shards
pub const SHARD_COUNT: usize = 64;

/// Fixed hasher seed: the registry must not ask the OS for randomness from
/// inside an allocation hook.
const HASH_SEED: u64 = 0x4845_4150_5055_4c53;

type ShardMap<B> = HashMap<usize, AllocationRecord, FixedState, B>;

/// The set of live allocations the lifecycle reports on and keeps fork-safe
pub trait LeakSource: Sync {
    /// Point-in-time copy of all live records, newest first
    fn snapshot(&self) -> Vec<AllocationRecord>;

    /// Number of live records
    fn count(&self) -> usize;

    /// Take every lock, to be held across a `fork()`
    fn lock_for_fork(&self);

    /// Release the locks taken by [`lock_for_fork`](Self::lock_for_fork)
    ///
    /// # Safety
    /// Must follow `lock_for_fork` on the same thread, in the parent.
    unsafe fn unlock_after_fork(&self);

    /// Return every lock to its unlocked state in a freshly forked child
    ///
    /// # Safety
    /// Must follow `lock_for_fork` and run in the child, which has one thread.
    unsafe fn reset_after_fork(&self);
}

struct Shard<B: Allocator> {
    /// `None` until the first insert, so an idle registry owns no storage
    map: Mutex<Option<ShardMap<B>>>,
}

impl<B: Allocator> Shard<B> {
    const fn new() -> Self {
        Self { map: parking_lot::const_mutex(None) }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ShardMap<B>>> {
        self.map.lock()
    }
}

/// Sharded registry of live allocations
///
/// `B` is the allocator used for the registry's own storage. It must not route
/// through the hooks that feed this registry.
pub struct AllocationRegistry<B: Allocator + Clone = SystemBookkeeping> {
    shards: [Shard<B>; SHARD_COUNT],
    bookkeeping: B,
    next_sequence: AtomicU64,
}

impl<B: Allocator + Clone> AllocationRegistry<B> {
    /// Create an empty registry; usable in `static` initializers
    #[must_use]
    pub const fn new(bookkeeping: B) -> Self {
        Self {
            shards: [const { Shard::new() }; SHARD_COUNT],
            bookkeeping,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Record a live allocation
    ///
    /// The record is stamped with the next insertion sequence number. An
    /// existing record for the same address is replaced. Returns `false` when
    /// the bookkeeping allocator could not make room, in which case this one
    /// allocation simply goes untracked.
    pub fn insert(&self, mut record: AllocationRecord) -> bool {
        record.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.store(record)
    }

    /// Put back a record obtained from [`take`](Self::take), keeping its
    /// original sequence number
    pub fn restore(&self, record: AllocationRecord) -> bool {
        self.store(record)
    }

    fn store(&self, record: AllocationRecord) -> bool {
        let mut shard = self.shards[shard_index(record.address)].lock();
        let map = shard.get_or_insert_with(|| {
            HashMap::with_hasher_in(FixedState::with_seed(HASH_SEED), self.bookkeeping.clone())
        });

        if map.try_reserve(1).is_err() {
            return false;
        }
        map.insert(record.address, record);
        true
    }

    /// Forget the record for `address`, returning whether one existed
    pub fn remove(&self, address: usize) -> bool {
        self.take(address).is_some()
    }

    /// Remove and return the record for `address`
    pub fn take(&self, address: usize) -> Option<AllocationRecord> {
        let mut shard = self.shards[shard_index(address)].lock();
        shard.as_mut().and_then(|map| map.remove(&address))
    }

    /// Copy of the record for `address`, if it is live
    #[must_use]
    pub fn get(&self, address: usize) -> Option<AllocationRecord> {
        let shard = self.shards[shard_index(address)].lock();
        shard.as_ref().and_then(|map| map.get(&address).copied())
    }

    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.get(address).is_some()
    }

    /// Number of live records
    #[must_use]
    pub fn count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().as_ref().map_or(0, HashMap::len))
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Point-in-time copy of every live record
    ///
    /// Ordered by descending insertion sequence (newest first), so the same
    /// registry state always yields the same sequence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        guard::suppressed(|| {
            let shards: Vec<_> = self.shards.iter().map(Shard::lock).collect();

            let total = shards.iter().map(|shard| shard.as_ref().map_or(0, HashMap::len)).sum();
            let mut records = Vec::with_capacity(total);
            for map in shards.iter().filter_map(|shard| shard.as_ref()) {
                records.extend(map.values().copied());
            }
            drop(shards);

            records.sort_unstable_by(|a, b| b.sequence.cmp(&a.sequence));
            records
        })
    }

    /// Lock every shard in index order and keep them locked
    ///
    /// The same order as [`snapshot`](Self::snapshot), so the two never
    /// deadlock against each other. Runs inside a suppression scope: nothing
    /// on this thread may reach the registry until the locks are released.
    pub fn lock_for_fork(&self) {
        for shard in &self.shards {
            std::mem::forget(shard.lock());
        }
    }

    /// Release the locks taken by [`lock_for_fork`](Self::lock_for_fork)
    ///
    /// # Safety
    /// Every shard must be locked by a `lock_for_fork` on this thread whose
    /// guards have not been released yet.
    pub unsafe fn unlock_after_fork(&self) {
        for shard in &self.shards {
            // SAFETY: the guard taken in `lock_for_fork` was forgotten.
            unsafe { shard.map.force_unlock() };
        }
    }

    /// Put every shard lock back into its initial state, keeping the records
    ///
    /// Threads of the parent that were parked on a shard do not exist in the
    /// child, so the locks are reinitialized rather than unlocked: a normal
    /// unlock would try to wake them.
    ///
    /// # Safety
    /// Only in a forked child, before it starts a second thread, after
    /// [`lock_for_fork`](Self::lock_for_fork) ran in the parent.
    pub unsafe fn reset_after_fork(&self) {
        for shard in &self.shards {
            // SAFETY: the child is single-threaded, nothing else touches the
            // lock. `RawMutex` is a single atomic, so writing through the
            // shared reference stays within its interior mutability.
            unsafe {
                let raw = std::ptr::from_ref(shard.map.raw()).cast_mut();
                raw.write(RawMutex::INIT);
            }
        }
    }
}

impl<B> LeakSource for AllocationRegistry<B>
where
    B: Allocator + Clone + Send + Sync,
{
    fn snapshot(&self) -> Vec<AllocationRecord> {
        AllocationRegistry::snapshot(self)
    }

    fn count(&self) -> usize {
        AllocationRegistry::count(self)
    }

    fn lock_for_fork(&self) {
        AllocationRegistry::lock_for_fork(self);
    }

    unsafe fn unlock_after_fork(&self) {
        // SAFETY: forwarded contract.
        unsafe { AllocationRegistry::unlock_after_fork(self) }
    }

    unsafe fn reset_after_fork(&self) {
        // SAFETY: forwarded contract.
        unsafe { AllocationRegistry::reset_after_fork(self) }
    }
}

/// Spread block addresses across shards
///
/// Heap blocks are at least 16-byte aligned, so the low bits carry no
/// information and are dropped before mixing in higher bits.
fn shard_index(address: usize) -> usize {
    ((address >> 4) ^ (address >> 16)) % SHARD_COUNT
}

static GLOBAL: AllocationRegistry<SystemBookkeeping> = AllocationRegistry::new(SystemBookkeeping);

/// Process-wide registry fed by [`LeakTracker`](crate::LeakTracker)
#[must_use]
pub fn global() -> &'static AllocationRegistry<SystemBookkeeping> {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::AllocError;
    use heappulse_common::StackTrace;
    use std::alloc::Layout;
    use std::collections::HashSet;
    use std::ptr::NonNull;
    use std::sync::Arc;

    fn record(address: usize, size: usize) -> AllocationRecord {
        AllocationRecord::new(address, size, StackTrace::from_frames(&[0x1000, 0x2000]))
    }

    fn registry() -> AllocationRegistry {
        AllocationRegistry::new(SystemBookkeeping)
    }

    #[test]
    fn test_balanced_round_trip_leaves_registry_empty() {
        let registry = registry();
        for i in 1..=500 {
            assert!(registry.insert(record(i * 16, i)));
        }
        assert_eq!(registry.count(), 500);

        for i in 1..=500 {
            assert!(registry.remove(i * 16));
        }
        assert_eq!(registry.count(), 0);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_unreleased_block_is_visible_in_snapshot() {
        let registry = registry();
        registry.insert(record(0x7000, 128));
        registry.insert(record(0x8000, 64));
        registry.remove(0x8000);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, 0x7000);
        assert_eq!(snapshot[0].size, 128);
        assert_eq!(snapshot[0].stack.frames(), &[0x1000, 0x2000]);
    }

    #[test]
    fn test_release_order_does_not_matter() {
        let registry = registry();
        let addresses: Vec<usize> = (1..=64).map(|i| i * 32).collect();
        for &address in &addresses {
            registry.insert(record(address, 8));
        }
        // release in an interleaved order: odd indices, then even indices reversed
        for &address in addresses.iter().skip(1).step_by(2) {
            assert!(registry.remove(address));
        }
        for &address in addresses.iter().step_by(2).rev() {
            assert!(registry.remove(address));
        }
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_remove_unknown_address() {
        let registry = registry();
        assert!(!registry.remove(0xdead_beef));

        registry.insert(record(0x1230, 4));
        assert!(!registry.remove(0x4560));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_double_remove_reports_absence() {
        let registry = registry();
        registry.insert(record(0x1230, 4));
        assert!(registry.remove(0x1230));
        assert!(!registry.remove(0x1230));
    }

    #[test]
    fn test_reinsert_replaces_record() {
        let registry = registry();
        registry.insert(record(0x5550, 16));
        registry.insert(record(0x5550, 48));

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(0x5550).map(|r| r.size), Some(48));
    }

    #[test]
    fn test_restore_keeps_original_position() {
        let registry = registry();
        registry.insert(record(0x100, 1));
        registry.insert(record(0x200, 2));

        let taken = registry.take(0x100).unwrap();
        registry.insert(record(0x300, 3));
        assert!(registry.restore(taken));

        let order: Vec<usize> = registry.snapshot().iter().map(|r| r.address).collect();
        assert_eq!(order, vec![0x300, 0x200, 0x100]);
    }

    #[test]
    fn test_snapshot_is_newest_first() {
        let registry = registry();
        for address in [0x100, 0x900, 0x300, 0x700] {
            registry.insert(record(address, 1));
        }

        let order: Vec<usize> = registry.snapshot().iter().map(|r| r.address).collect();
        assert_eq!(order, vec![0x700, 0x300, 0x900, 0x100]);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutation() {
        let registry = registry();
        registry.insert(record(0x100, 1));
        registry.insert(record(0x200, 2));

        let snapshot = registry.snapshot();
        registry.remove(0x100);
        registry.insert(record(0x300, 3));

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|r| r.address == 0x100));
        assert!(!snapshot.iter().any(|r| r.address == 0x300));
    }

    #[test]
    fn test_snapshots_of_same_state_are_identical() {
        let registry = registry();
        for i in 1..=100 {
            registry.insert(record(i * 48, i));
        }
        assert_eq!(registry.snapshot(), registry.snapshot());
    }

    #[test]
    fn test_sequence_numbers_are_unique() {
        let registry = registry();
        for i in 1..=200 {
            registry.insert(record(i * 16, 1));
        }
        let sequences: HashSet<u64> = registry.snapshot().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences.len(), 200);
    }

    #[test]
    fn test_concurrent_threads_keep_their_own_records() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_000;

        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    // tag every address with the owning thread in the high bits
                    let tag = (t + 1) << 40;
                    for i in 0..PER_THREAD {
                        registry.insert(record(tag | (i << 4), t + 1));
                    }
                    for i in 0..PER_THREAD {
                        let address = tag | (i << 4);
                        let found = registry.get(address).expect("own record vanished");
                        assert_eq!(found.size, t + 1, "record overwritten by another thread");
                        assert!(registry.remove(address));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_concurrent_snapshot_never_sees_torn_state() {
        let registry = Arc::new(registry());
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 1..=2_000 {
                    registry.insert(record(i * 16, i));
                    registry.remove(i * 16);
                }
            })
        };

        for _ in 0..50 {
            for r in registry.snapshot() {
                assert_eq!(r.address, r.size * 16);
            }
        }
        writer.join().unwrap();
        assert!(registry.is_empty());
    }

    #[derive(Clone, Copy)]
    struct Exhausted;

    // SAFETY: never hands out memory.
    unsafe impl Allocator for Exhausted {
        fn allocate(&self, _layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
            Err(AllocError)
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {}
    }

    #[test]
    fn test_insert_without_bookkeeping_memory_is_dropped() {
        let registry = AllocationRegistry::new(Exhausted);
        assert!(!registry.insert(record(0x1000, 64)));
        assert!(!registry.restore(record(0x2000, 32)));

        assert_eq!(registry.count(), 0);
        assert!(!registry.contains(0x1000));
        assert!(registry.snapshot().is_empty());
        assert!(!registry.remove(0x1000));
    }

    #[test]
    fn test_fork_locks_released_in_parent() {
        let registry = registry();
        registry.insert(record(0x4440, 8));

        registry.lock_for_fork();
        assert!(registry.shards.iter().all(|shard| shard.map.is_locked()));
        unsafe { registry.unlock_after_fork() };

        assert!(registry.shards.iter().all(|shard| !shard.map.is_locked()));
        registry.insert(record(0x5550, 16));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_fork_reset_keeps_records() {
        let registry = registry();
        registry.insert(record(0x4440, 8));

        registry.lock_for_fork();
        unsafe { registry.reset_after_fork() };

        assert_eq!(registry.get(0x4440).map(|r| r.size), Some(8));
        assert!(registry.remove(0x4440));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fork_lock_waits_for_snapshot_holder() {
        let registry = Arc::new(registry());
        for i in 1..=64 {
            registry.insert(record(i * 16, i));
        }

        let forker = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    guard::suppressed(|| {
                        registry.lock_for_fork();
                        unsafe { registry.unlock_after_fork() };
                    });
                }
            })
        };
        for _ in 0..200 {
            assert_eq!(registry.snapshot().len(), 64);
        }
        forker.join().unwrap();
    }

    #[test]
    fn test_shard_index_in_range() {
        for address in [0, 16, 0xffff_fff0, usize::MAX] {
            assert!(shard_index(address) < SHARD_COUNT);
        }
    }
}
