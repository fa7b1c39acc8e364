//! The lock-free table engine.
//!
//! [`LfMap`] keys opaque item pointers by 128-bit hash. Every operation
//! runs under a domain guard against the current store; writers that run
//! into a frozen bucket help finish the migration and retry against the
//! successor. The engine never dereferences item payloads except to read
//! their era headers for linearized views; allocating, committing, and
//! retiring items is the caller's side of the contract, driven by the
//! pointers the operations return.
//!
//! Migration is cooperative and runs in four phases: freeze every bucket
//! (monotone flag CAS), install a successor store, copy live records, and
//! publish. Any thread may start, help, or finish one. This engine is the
//! *polite* variant: a helper that finds a successor already installed
//! naps briefly, twice, re-checking for completion before it starts
//! copying — cheap insurance is explicitly not the point, it is a pure
//! throughput knob and correctness never depends on the naps.

use crate::hash::HashValue;
use crate::store::{EPOCH_MASK, F_MOVED, F_MOVING, F_RMVD, MIN_SIZE, Record, Store, new_size};
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use petek::{Domain, Guard};
use std::sync::Arc;
use std::time::Duration;

/// Nap length for the polite migration variant.
const MIGRATE_SLEEP_NS: u64 = 100_000;

/// A write ran into a migration; help, then retry in the successor.
pub(crate) struct MustMigrate;

/// The stable engine header: current store, item count, epoch counter.
pub(crate) struct Top<T> {
    pub(crate) store_current: AtomicPtr<Store<T>>,
    pub(crate) item_count: AtomicU64,
    pub(crate) next_epoch: AtomicU64,
    pub(crate) domain: Arc<Domain>,
}

impl<T> Top<T> {
    pub(crate) fn new(domain: Arc<Domain>, capacity: u64) -> Self {
        let size = capacity.next_power_of_two().max(MIN_SIZE);
        let store = Store::boxed(&domain, size);
        Top {
            store_current: AtomicPtr::new(store),
            item_count: AtomicU64::new(0),
            next_epoch: AtomicU64::new(1),
            domain,
        }
    }

    #[inline]
    pub(crate) fn store_ptr(&self) -> *mut Store<T> {
        self.store_current.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> u64 {
        self.item_count.load(Ordering::Relaxed)
    }

    pub(crate) fn capacity(&self) -> u64 {
        let _guard = self.domain.pin();
        // SAFETY: the store observed under the guard cannot be freed
        // before the guard drops.
        unsafe { (*self.store_ptr()).capacity() }
    }

    /// Reads never migrate: frozen buckets still hold their items, and a
    /// store observed under the guard outlives the operation.
    pub(crate) unsafe fn get<'g>(&self, _guard: &'g Guard<'_>, hv: HashValue) -> Option<&'g T> {
        let store = unsafe { &*self.store_ptr() };
        let mut bix = hv.bucket_index(store.last_slot);
        for _ in 0..=store.last_slot {
            let bucket = store.bucket(bix);
            let hv2 = bucket.load_hash();
            if hv2.is_empty() {
                return None;
            }
            if hv2 != hv {
                bix = (bix + 1) & store.last_slot as usize;
                continue;
            }
            let record = bucket.load_record::<T>();
            if record.is_live() {
                return Some(unsafe { &*record.item });
            }
            return None;
        }
        None
    }

    /// Cooperative migration of `store_ptr` into its successor.
    ///
    /// Returns the store to retry in. Every phase tolerates concurrent
    /// helpers: freeze flags are monotone, the successor is installed by
    /// CAS with losers retiring their proposal unused, and copy CASes are
    /// idempotent once a destination record is in place.
    pub(crate) fn migrate(
        &self,
        store_ptr: *mut Store<T>,
        guard: &Guard<'_>,
        polite: bool,
    ) -> *mut Store<T> {
        let current = self.store_ptr();
        if current != store_ptr {
            return current;
        }
        let store = unsafe { &*store_ptr };

        let mut new_store = store.next.load(Ordering::Acquire);

        if !new_store.is_null() {
            if polite {
                // Writers ahead of us are already copying; twice, give
                // them a chance to finish before we burn cycles helping.
                std::thread::sleep(Duration::from_nanos(MIGRATE_SLEEP_NS));
                new_store = store.next.load(Ordering::Acquire);
                if new_store == self.store_ptr() {
                    return new_store;
                }
                std::thread::sleep(Duration::from_nanos(MIGRATE_SLEEP_NS));
                new_store = store.next.load(Ordering::Acquire);
                if new_store == self.store_ptr() {
                    return new_store;
                }
            }
        } else {
            // Phase A: freeze every bucket, counting what will move.
            let mut live = 0u64;
            for i in 0..=store.last_slot as usize {
                let bucket = store.bucket(i);
                let mut record = bucket.load_record::<T>();
                loop {
                    if record.is_moving() {
                        break;
                    }
                    let frozen = if record.is_live() {
                        Record {
                            item: record.item,
                            info: record.info | F_MOVING,
                        }
                    } else {
                        Record {
                            item: record.item,
                            info: record.info | F_MOVING | F_MOVED,
                        }
                    };
                    match bucket.cas_record(record, frozen) {
                        Ok(()) => break,
                        Err(current) => record = current,
                    }
                }
                if record.is_live() {
                    live += 1;
                }
            }

            // Phase B: install a successor sized for what survived.
            new_store = store.next.load(Ordering::Acquire);
            if new_store.is_null() {
                let candidate = Store::boxed(&self.domain, new_size(store.last_slot, live));
                match store.next.compare_exchange(
                    core::ptr::null_mut(),
                    candidate,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => new_store = candidate,
                    Err(installed) => {
                        // SAFETY: our proposal was never published.
                        unsafe { self.domain.retire_unused(candidate) };
                        new_store = installed;
                    }
                }
            }
        }

        // Phase C: copy. Re-count from scratch; if the successor was
        // already installed when we arrived, we skipped phase A and never
        // counted. Whoever wins the used_count CAS below needs the number.
        let new_ref = unsafe { &*new_store };
        let mut live = 0u64;
        for i in 0..=store.last_slot as usize {
            let bucket = store.bucket(i);
            let record = bucket.load_record::<T>();
            if record.is_live() {
                live += 1;
            }
            if record.is_moved() {
                continue;
            }

            let hv = bucket.load_hash();
            let mut bix = hv.bucket_index(new_ref.last_slot);
            let mut target = None;
            for _ in 0..=new_ref.last_slot {
                let new_bucket = new_ref.bucket(bix);
                let hv2 = new_bucket.load_hash();
                if hv2.is_empty() {
                    if new_bucket.try_install_hash(hv) {
                        target = Some(new_bucket);
                        break;
                    }
                }
                let hv2 = new_bucket.load_hash();
                if hv2 != hv {
                    bix = (bix + 1) & new_ref.last_slot as usize;
                    continue;
                }
                target = Some(new_bucket);
                break;
            }
            // The successor is sized so that every live record fits.
            let new_bucket = target.expect("successor store full during migration");

            let candidate = Record {
                item: record.item,
                info: record.epoch_bits(),
            };
            // Losers find the record already installed; that is success.
            let _ = new_bucket.cas_record(Record::null(), candidate);

            let moved = Record {
                item: record.item,
                info: record.info | F_MOVED,
            };
            let _ = bucket.cas_record(record, moved);
        }

        // Phase D: publish the count, swing the top, retire the source.
        let _ = new_ref
            .used_count
            .compare_exchange(0, live, Ordering::AcqRel, Ordering::Acquire);

        if self
            .store_current
            .compare_exchange(store_ptr, new_store, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: the store is unlinked from the top; readers that
            // still hold it are protected by their guards.
            unsafe { guard.retire(store_ptr) };
        }

        self.store_ptr()
    }

    pub(crate) unsafe fn store_put(
        &self,
        store_ptr: *mut Store<T>,
        hv: HashValue,
        item: *mut T,
    ) -> Result<Option<*mut T>, MustMigrate> {
        let store = unsafe { &*store_ptr };
        let mut bix = hv.bucket_index(store.last_slot);
        let mut target = None;
        for _ in 0..=store.last_slot {
            let bucket = store.bucket(bix);
            let hv2 = bucket.load_hash();
            if hv2.is_empty() {
                if bucket.try_install_hash(hv) {
                    if store.used_count.fetch_add(1, Ordering::AcqRel) >= store.threshold {
                        return Err(MustMigrate);
                    }
                    target = Some(bucket);
                    break;
                }
            }
            let hv2 = bucket.load_hash();
            if hv2 != hv {
                bix = (bix + 1) & store.last_slot as usize;
                continue;
            }
            target = Some(bucket);
            break;
        }
        let Some(bucket) = target else {
            return Err(MustMigrate);
        };

        let record = bucket.load_record::<T>();
        if record.is_moving() {
            return Err(MustMigrate);
        }

        let (old, info) = if record.is_live() {
            (Some(record.item), record.info)
        } else {
            (None, self.next_epoch.fetch_add(1, Ordering::AcqRel) & EPOCH_MASK)
        };

        let candidate = Record { item, info };
        match bucket.cas_record(record, candidate) {
            Ok(()) => {
                if old.is_none() {
                    self.item_count.fetch_add(1, Ordering::AcqRel);
                }
                Ok(old)
            }
            Err(current) => {
                if current.is_moving() {
                    Err(MustMigrate)
                } else {
                    // We lost the slot to another writer: linearize as
                    // installed and immediately overwritten.
                    Ok(Some(item))
                }
            }
        }
    }

    pub(crate) unsafe fn store_replace(
        &self,
        store_ptr: *mut Store<T>,
        hv: HashValue,
        item: *mut T,
    ) -> Result<Option<*mut T>, MustMigrate> {
        let store = unsafe { &*store_ptr };
        let mut bix = hv.bucket_index(store.last_slot);
        let mut target = None;
        for _ in 0..=store.last_slot {
            let bucket = store.bucket(bix);
            let hv2 = bucket.load_hash();
            if hv2.is_empty() {
                return Ok(None);
            }
            if hv2 != hv {
                bix = (bix + 1) & store.last_slot as usize;
                continue;
            }
            target = Some(bucket);
            break;
        }
        let Some(bucket) = target else {
            return Ok(None);
        };

        let mut record = bucket.load_record::<T>();
        loop {
            if record.is_moving() {
                return Err(MustMigrate);
            }
            if !record.is_live() {
                return Ok(None);
            }
            let candidate = Record {
                item,
                info: record.info,
            };
            match bucket.cas_record(record, candidate) {
                Ok(()) => return Ok(Some(record.item)),
                Err(current) => record = current,
            }
        }
    }

    pub(crate) unsafe fn store_add(
        &self,
        store_ptr: *mut Store<T>,
        hv: HashValue,
        item: *mut T,
    ) -> Result<bool, MustMigrate> {
        let store = unsafe { &*store_ptr };
        let mut bix = hv.bucket_index(store.last_slot);
        let mut target = None;
        for _ in 0..=store.last_slot {
            let bucket = store.bucket(bix);
            let hv2 = bucket.load_hash();
            if hv2.is_empty() {
                if bucket.try_install_hash(hv) {
                    if store.used_count.fetch_add(1, Ordering::AcqRel) >= store.threshold {
                        return Err(MustMigrate);
                    }
                    target = Some(bucket);
                    break;
                }
            }
            let hv2 = bucket.load_hash();
            if hv2 != hv {
                bix = (bix + 1) & store.last_slot as usize;
                continue;
            }
            target = Some(bucket);
            break;
        }
        let Some(bucket) = target else {
            return Err(MustMigrate);
        };

        let record = bucket.load_record::<T>();
        if record.is_moving() {
            return Err(MustMigrate);
        }
        if record.is_live() {
            return Ok(false);
        }

        let candidate = Record {
            item,
            info: self.next_epoch.fetch_add(1, Ordering::AcqRel) & EPOCH_MASK,
        };
        match bucket.cas_record(record, candidate) {
            Ok(()) => {
                self.item_count.fetch_add(1, Ordering::AcqRel);
                Ok(true)
            }
            Err(current) => {
                if current.is_moving() {
                    Err(MustMigrate)
                } else {
                    Ok(false)
                }
            }
        }
    }

    pub(crate) unsafe fn store_remove(
        &self,
        store_ptr: *mut Store<T>,
        hv: HashValue,
    ) -> Result<Option<*mut T>, MustMigrate> {
        let store = unsafe { &*store_ptr };
        let mut bix = hv.bucket_index(store.last_slot);
        let mut target = None;
        for _ in 0..=store.last_slot {
            let bucket = store.bucket(bix);
            let hv2 = bucket.load_hash();
            if hv2.is_empty() {
                return Ok(None);
            }
            if hv2 != hv {
                bix = (bix + 1) & store.last_slot as usize;
                continue;
            }
            target = Some(bucket);
            break;
        }
        let Some(bucket) = target else {
            return Ok(None);
        };

        let record = bucket.load_record::<T>();
        if record.is_moving() {
            return Err(MustMigrate);
        }
        if !record.is_live() {
            return Ok(None);
        }

        // The tombstone keeps the displaced item's pointer and stamps the
        // removal era into the epoch bits; linearized views read both.
        let candidate = Record {
            item: record.item,
            info: F_RMVD | (self.domain.advance_era() & EPOCH_MASK),
        };
        match bucket.cas_record(record, candidate) {
            Ok(()) => {
                self.item_count.fetch_sub(1, Ordering::AcqRel);
                Ok(Some(record.item))
            }
            Err(current) => {
                if current.is_moving() {
                    Err(MustMigrate)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl<T> Drop for Top<T> {
    fn drop(&mut self) {
        // Quiescent teardown: free the store chain directly. Items are the
        // container layer's responsibility and have been dealt with by now.
        let mut store = self.store_current.load(Ordering::Acquire);
        while !store.is_null() {
            // SAFETY: no operation is in flight; the chain is exclusively ours.
            let next = unsafe { (*store).next.load(Ordering::Acquire) };
            unsafe {
                drop(Box::from_raw(store));
            }
            store = next;
        }
    }
}

/// A lock-free hash table over opaque, era-tracked item pointers.
///
/// This is the engine beneath the safe containers; use [`crate::Dict`] or
/// [`crate::Set`] unless you are building one. All operations are
/// linearizable at their record CAS (reads at their record load) and no
/// operation blocks: writers that meet a migration help complete it.
///
/// # Safety contract
///
/// Items passed to the write operations must be fresh `Box` allocations,
/// committed in this map's domain, and never passed twice. Pointers
/// returned by the operations follow the reclamation protocol: retire
/// what a successful `put`/`replace`/`remove` displaces, and drop
/// rejected candidates with `retire_unused`.
pub struct LfMap<T> {
    pub(crate) top: Top<T>,
}

impl<T> LfMap<T> {
    /// An empty map in `domain` with the minimum capacity.
    pub fn new(domain: Arc<Domain>) -> Self {
        Self::with_capacity(domain, MIN_SIZE)
    }

    /// An empty map with at least `capacity` buckets.
    pub fn with_capacity(domain: Arc<Domain>, capacity: u64) -> Self {
        LfMap {
            top: Top::new(domain, capacity),
        }
    }

    /// The reclamation domain this map lives in.
    pub fn domain(&self) -> &Arc<Domain> {
        &self.top.domain
    }

    /// Published item count. Eventually consistent, not linearizable.
    pub fn len(&self) -> u64 {
        self.top.len()
    }

    /// True when no items are published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the current store.
    pub fn capacity(&self) -> u64 {
        self.top.capacity()
    }

    /// The next insertion epoch the map will hand out.
    pub fn next_epoch(&self) -> u64 {
        self.top.next_epoch.load(Ordering::Relaxed)
    }

    /// Looks up the live item for `hv`.
    ///
    /// # Safety
    ///
    /// The map must uphold the item contract (see type docs); the
    /// returned reference is valid while `guard` lives.
    pub unsafe fn get<'g>(&self, guard: &'g Guard<'_>, hv: HashValue) -> Option<&'g T> {
        unsafe { self.top.get(guard, hv) }
    }

    /// Inserts or updates `hv`, returning the displaced item (the caller
    /// retires it). `None` means the key had no live item before.
    ///
    /// # Safety
    ///
    /// `item` per the type-level contract; `guard` must be on this map's
    /// domain.
    pub unsafe fn put(&self, guard: &Guard<'_>, hv: HashValue, item: *mut T) -> Option<*mut T> {
        let mut store = self.top.store_ptr();
        loop {
            match unsafe { self.top.store_put(store, hv, item) } {
                Ok(old) => return old,
                Err(MustMigrate) => store = self.top.migrate(store, guard, true),
            }
        }
    }

    /// Updates `hv` only if it has a live item; returns the displaced
    /// item, or `None` (caller drops its candidate unused) when absent.
    ///
    /// # Safety
    ///
    /// As for [`put`](Self::put).
    pub unsafe fn replace(&self, guard: &Guard<'_>, hv: HashValue, item: *mut T) -> Option<*mut T> {
        let mut store = self.top.store_ptr();
        loop {
            match unsafe { self.top.store_replace(store, hv, item) } {
                Ok(old) => return old,
                Err(MustMigrate) => store = self.top.migrate(store, guard, true),
            }
        }
    }

    /// Inserts `hv` only if it has no live item. `false` leaves the map
    /// untouched (caller drops its candidate unused).
    ///
    /// # Safety
    ///
    /// As for [`put`](Self::put).
    pub unsafe fn add(&self, guard: &Guard<'_>, hv: HashValue, item: *mut T) -> bool {
        let mut store = self.top.store_ptr();
        loop {
            match unsafe { self.top.store_add(store, hv, item) } {
                Ok(done) => return done,
                Err(MustMigrate) => store = self.top.migrate(store, guard, true),
            }
        }
    }

    /// Removes `hv`'s live item, returning it for retirement.
    ///
    /// # Safety
    ///
    /// `guard` must be on this map's domain.
    pub unsafe fn remove(&self, guard: &Guard<'_>, hv: HashValue) -> Option<*mut T> {
        let mut store = self.top.store_ptr();
        loop {
            match unsafe { self.top.store_remove(store, hv) } {
                Ok(old) => return old,
                Err(MustMigrate) => store = self.top.migrate(store, guard, true),
            }
        }
    }

    /// Snapshot of the live records, optionally in insertion order.
    ///
    /// # Safety
    ///
    /// As for [`get`](Self::get); entries are valid while `guard` lives.
    pub unsafe fn view(&self, guard: &Guard<'_>, sort: bool) -> Vec<crate::view::ViewEntry<T>> {
        unsafe { self.top.view(guard, sort) }
    }
}

impl<T: petek::Tracked> LfMap<T> {
    /// Linearized snapshot at `era` (from
    /// [`Domain::pin_linearized`](petek::Domain::pin_linearized), with
    /// `guard` being that reservation).
    ///
    /// # Safety
    ///
    /// As for [`view`](Self::view).
    pub unsafe fn view_at(&self, guard: &Guard<'_>, era: u64) -> Vec<crate::view::ViewEntry<T>> {
        unsafe { self.top.view_at(guard, era) }
    }
}

// SAFETY: the engine's interior state is atomics; items are Send + Sync.
unsafe impl<T: Send + Sync> Send for LfMap<T> {}
unsafe impl<T: Send + Sync> Sync for LfMap<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use petek::{EraHeader, Tracked};

    #[repr(C)]
    struct Item {
        hdr: EraHeader,
        value: u64,
    }

    unsafe impl Tracked for Item {
        fn era_header(&self) -> &EraHeader {
            &self.hdr
        }
    }

    fn item(domain: &Domain, value: u64) -> *mut Item {
        let ptr = Box::into_raw(Box::new(Item {
            hdr: EraHeader::new(),
            value,
        }));
        domain.commit(unsafe { &*ptr });
        ptr
    }

    fn hv(n: u64) -> HashValue {
        crate::hash::hash_one(&n)
    }

    /// A hash engineered to land on a chosen home bucket, for forcing
    /// probe collisions.
    fn colliding(home: u64, salt: u64) -> HashValue {
        HashValue::from_parts(salt + 1, home)
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let domain = Domain::new();
        let map = LfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        unsafe {
            assert!(map.put(&guard, hv(1), item(&domain, 10)).is_none());
            assert_eq!(map.get(&guard, hv(1)).map(|i| i.value), Some(10));

            let old = map.put(&guard, hv(1), item(&domain, 11)).unwrap();
            assert_eq!((*old).value, 10);
            guard.retire(old);

            let old = map.remove(&guard, hv(1)).unwrap();
            assert_eq!((*old).value, 11);
            guard.retire(old);

            assert!(map.get(&guard, hv(1)).is_none());
            assert!(map.remove(&guard, hv(1)).is_none());
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn add_and_replace_respect_liveness() {
        let domain = Domain::new();
        let map = LfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        unsafe {
            // replace on an absent key fails.
            let candidate = item(&domain, 1);
            assert!(map.replace(&guard, hv(5), candidate).is_none());
            domain.retire_unused(candidate);

            assert!(map.add(&guard, hv(5), item(&domain, 2)));

            // add on a live key fails.
            let candidate = item(&domain, 3);
            assert!(!map.add(&guard, hv(5), candidate));
            domain.retire_unused(candidate);

            // replace on a live key swaps the item, preserving the epoch.
            let old = map.replace(&guard, hv(5), item(&domain, 4)).unwrap();
            assert_eq!((*old).value, 2);
            guard.retire(old);
            assert_eq!(map.get(&guard, hv(5)).map(|i| i.value), Some(4));

            let old = map.remove(&guard, hv(5)).unwrap();
            guard.retire(old);
        }
    }

    #[test]
    fn tombstoned_bucket_is_reused() {
        let domain = Domain::new();
        let map = LfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        let key = colliding(3, 7);
        unsafe {
            assert!(map.put(&guard, key, item(&domain, 1)).is_none());
            let old = map.remove(&guard, key).unwrap();
            guard.retire(old);

            // Same hash claims the same bucket; a fresh epoch is assigned.
            let epoch_before = map.next_epoch();
            assert!(map.put(&guard, key, item(&domain, 2)).is_none());
            assert!(map.next_epoch() > epoch_before);
            assert_eq!(map.get(&guard, key).map(|i| i.value), Some(2));

            let old = map.remove(&guard, key).unwrap();
            guard.retire(old);
        }
    }

    #[test]
    fn linear_probing_resolves_collisions() {
        let domain = Domain::new();
        let map = LfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        unsafe {
            // Three distinct hashes, one home bucket.
            for salt in 0..3 {
                assert!(map.put(&guard, colliding(2, salt), item(&domain, salt)).is_none());
            }
            for salt in 0..3 {
                assert_eq!(
                    map.get(&guard, colliding(2, salt)).map(|i| i.value),
                    Some(salt)
                );
            }
            assert_eq!(map.len(), 3);
            for salt in 0..3 {
                let old = map.remove(&guard, colliding(2, salt)).unwrap();
                guard.retire(old);
            }
        }
    }

    #[test]
    fn growth_preserves_items_and_epochs() {
        let domain = Domain::new();
        let map = LfMap::<Item>::new(domain.clone());
        assert_eq!(map.capacity(), 8);
        {
            let guard = domain.pin();
            unsafe {
                for k in 0u64..7 {
                    assert!(map.put(&guard, hv(k), item(&domain, k * 100)).is_none());
                }
            }
        }
        // Seven keys breach the 75% threshold of 8: the table doubled.
        assert_eq!(map.capacity(), 16);
        assert_eq!(map.len(), 7);
        assert!(map.next_epoch() >= 8);
        let guard = domain.pin();
        unsafe {
            for k in 0u64..7 {
                assert_eq!(map.get(&guard, hv(k)).map(|i| i.value), Some(k * 100));
            }
        }
    }

    #[test]
    fn shrink_after_mass_removal() {
        let domain = Domain::new();
        let map = LfMap::<Item>::with_capacity(domain.clone(), 64);
        let guard = domain.pin();
        unsafe {
            for k in 0u64..40 {
                assert!(map.put(&guard, hv(k), item(&domain, k)).is_none());
            }
            for k in 0u64..40 {
                let old = map.remove(&guard, hv(k)).unwrap();
                guard.retire(old);
            }
            // Everything is tombstoned; keep inserting until the used
            // threshold forces a migration, which compacts and shrinks.
            for k in 100u64..140 {
                assert!(map.put(&guard, hv(k), item(&domain, k)).is_none());
            }
            for k in 100u64..140 {
                assert_eq!(map.get(&guard, hv(k)).map(|i| i.value), Some(k));
            }
            for k in 0u64..40 {
                assert!(map.get(&guard, hv(k)).is_none());
            }
        }
    }
}
