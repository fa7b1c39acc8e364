//! The wait-free table engine.
//!
//! [`WfMap`] has the same surface and record discipline as
//! [`LfMap`](crate::LfMap), plus a write-helping protocol that bounds
//! every writer's delay by the work of the threads around it:
//!
//! 1. A writer first runs a short fast path (two direct attempts).
//! 2. On contention it helps every pending request, then publishes its
//!    own: a heap-allocated, era-tracked [`HelpReq`] in its per-thread
//!    slot describing `(kind, hv, item)` with a pre-drawn epoch.
//! 3. Anyone (the owner included) can drive a request through its state
//!    word: `OPEN -> CLAIM(expected record) -> DONE(outcome)`. The claim
//!    publishes the exact record the install CAS expects, so every helper
//!    computes the identical candidate and the install is idempotent: at
//!    most one CAS ever succeeds, stale helpers fail benignly, and the
//!    displaced value rides in the claim for anyone to report.
//! 4. Installed records carry the `USED` flag until the outcome word is
//!    written. A writer that finds `USED` on a record completes that
//!    request's outcome before touching the record, which is what makes
//!    "the record left the claimed state, therefore our candidate was
//!    never installed" a safe conclusion for claim invalidation.
//!
//! Requests are reclaimed through the domain, so a helper that stalls for
//! an arbitrarily long time still holds a valid request when it wakes;
//! its state word has long been `DONE` and the wakeup is a no-op.
//!
//! Migration here is the impatient variant: no naps, and the freeze phase
//! resolves `USED` records before freezing them so a successor store
//! never carries an unconsumed install.

use crate::hash::HashValue;
use crate::lockfree::{MustMigrate, Top};
use crate::store::{EPOCH_MASK, F_MOVED, F_MOVING, F_RMVD, F_USED, MIN_SIZE, Record, Store, new_size};
use crate::view::ViewEntry;
use core::sync::atomic::{AtomicPtr, Ordering};
use petek::{Domain, EraHeader, Guard, MAX_THREADS, Tracked};
use portable_atomic::AtomicU128;
use std::sync::Arc;

/// Direct attempts before a writer publishes a help request.
const FAST_ATTEMPTS: u32 = 2;

const TAG_CLAIM: u128 = 0b001;
const TAG_DONE: u128 = 0b010;
const TAG_SUCCESS: u128 = 0b100;
const PTR_MASK: u128 = (u64::MAX as u128) & !0b111;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum OpKind {
    Put,
    Replace,
    Add,
    Remove,
}

/// A published write intention. Allocated fresh for every helped round;
/// the era header keeps stale helpers safe.
#[repr(C)]
struct HelpReq<T> {
    hdr: EraHeader,
    kind: OpKind,
    hv: HashValue,
    item: *mut T,
    /// Pre-drawn insertion epoch (removal era for `Remove`), so every
    /// helper installs the same candidate.
    epoch: u64,
    /// `OPEN` (0) -> `CLAIM(record)|tag` -> `DONE(old, success)|tag`.
    state: AtomicU128,
}

unsafe impl<T> Tracked for HelpReq<T> {
    fn era_header(&self) -> &EraHeader {
        &self.hdr
    }
}

unsafe impl<T: Send + Sync> Send for HelpReq<T> {}
unsafe impl<T: Send + Sync> Sync for HelpReq<T> {}

impl<T> HelpReq<T> {
    /// The one candidate record this request installs over `expected`.
    fn candidate(&self, expected: Record<T>) -> Record<T> {
        match self.kind {
            OpKind::Put => Record {
                item: self.item,
                info: if expected.is_live() {
                    expected.epoch_bits()
                } else {
                    self.epoch
                } | F_USED,
            },
            OpKind::Add => Record {
                item: self.item,
                info: self.epoch | F_USED,
            },
            OpKind::Replace => Record {
                item: self.item,
                info: expected.epoch_bits() | F_USED,
            },
            OpKind::Remove => Record {
                item: expected.item,
                info: F_RMVD | self.epoch | F_USED,
            },
        }
    }

    /// Outcome for a round whose install (over `expected`) happened.
    fn done_applied(&self, expected: Record<T>) -> u128 {
        let old = if expected.is_live() {
            expected.item
        } else {
            core::ptr::null_mut()
        };
        done_word(true, old)
    }
}

fn done_word<T>(success: bool, old: *mut T) -> u128 {
    (old as usize as u128) | TAG_DONE | if success { TAG_SUCCESS } else { 0 }
}

fn decode_done<T>(state: u128) -> Option<(bool, *mut T)> {
    if state & TAG_DONE != 0 {
        Some((
            state & TAG_SUCCESS != 0,
            (state & PTR_MASK) as u64 as usize as *mut T,
        ))
    } else {
        None
    }
}

fn claim_word<T>(expected: Record<T>) -> u128 {
    expected.pack() | TAG_CLAIM
}

fn decode_claim<T>(state: u128) -> Option<Record<T>> {
    if state & TAG_CLAIM != 0 {
        Some(Record::unpack(state & !TAG_CLAIM))
    } else {
        None
    }
}

#[repr(align(128))]
struct HelpSlot<T> {
    req: AtomicPtr<HelpReq<T>>,
}

enum FastMiss {
    Migrate,
    Contended,
}

/// A wait-free hash table over opaque, era-tracked item pointers.
///
/// The surface and safety contract match [`LfMap`](crate::LfMap); the
/// difference is progress: no writer is indefinitely delayed by
/// contention, because any writer can finish any other writer's pending
/// operation.
pub struct WfMap<T> {
    pub(crate) top: Top<T>,
    help: Box<[HelpSlot<T>]>,
}

// SAFETY: as for LfMap; help slots hold atomics over tracked requests.
unsafe impl<T: Send + Sync> Send for WfMap<T> {}
unsafe impl<T: Send + Sync> Sync for WfMap<T> {}

impl<T> WfMap<T> {
    /// An empty map in `domain` with the minimum capacity.
    pub fn new(domain: Arc<Domain>) -> Self {
        Self::with_capacity(domain, MIN_SIZE)
    }

    /// An empty map with at least `capacity` buckets.
    pub fn with_capacity(domain: Arc<Domain>, capacity: u64) -> Self {
        let mut help = Vec::with_capacity(MAX_THREADS);
        for _ in 0..MAX_THREADS {
            help.push(HelpSlot {
                req: AtomicPtr::new(core::ptr::null_mut()),
            });
        }
        WfMap {
            top: Top::new(domain, capacity),
            help: help.into_boxed_slice(),
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

    /// Looks up the live item for `hv`. Reads are naturally wait-free.
    ///
    /// # Safety
    ///
    /// As for [`LfMap::get`](crate::LfMap::get).
    pub unsafe fn get<'g>(&self, guard: &'g Guard<'_>, hv: HashValue) -> Option<&'g T> {
        unsafe { self.top.get(guard, hv) }
    }

    /// Inserts or updates `hv`; see [`LfMap::put`](crate::LfMap::put).
    ///
    /// # Safety
    ///
    /// As for [`LfMap::put`](crate::LfMap::put).
    pub unsafe fn put(&self, guard: &Guard<'_>, hv: HashValue, item: *mut T) -> Option<*mut T> {
        let mut store = self.top.store_ptr();
        let mut attempts = 0;
        loop {
            if attempts >= FAST_ATTEMPTS {
                let (_, old) = self.run_helped(guard, OpKind::Put, hv, item);
                return if old.is_null() { None } else { Some(old) };
            }
            match unsafe { self.try_put(store, guard, hv, item) } {
                Ok(old) => return old,
                Err(FastMiss::Migrate) => store = self.migrate(store, guard),
                Err(FastMiss::Contended) => {
                    attempts += 1;
                    store = self.top.store_ptr();
                }
            }
        }
    }

    /// Updates `hv` only if live; see [`LfMap::replace`](crate::LfMap::replace).
    ///
    /// # Safety
    ///
    /// As for [`LfMap::put`](crate::LfMap::put).
    pub unsafe fn replace(&self, guard: &Guard<'_>, hv: HashValue, item: *mut T) -> Option<*mut T> {
        let mut store = self.top.store_ptr();
        let mut attempts = 0;
        loop {
            if attempts >= FAST_ATTEMPTS {
                let (success, old) = self.run_helped(guard, OpKind::Replace, hv, item);
                return if success { Some(old) } else { None };
            }
            match unsafe { self.try_replace(store, guard, hv, item) } {
                Ok(old) => return old,
                Err(FastMiss::Migrate) => store = self.migrate(store, guard),
                Err(FastMiss::Contended) => {
                    attempts += 1;
                    store = self.top.store_ptr();
                }
            }
        }
    }

    /// Inserts `hv` only if absent; see [`LfMap::add`](crate::LfMap::add).
    ///
    /// # Safety
    ///
    /// As for [`LfMap::put`](crate::LfMap::put).
    pub unsafe fn add(&self, guard: &Guard<'_>, hv: HashValue, item: *mut T) -> bool {
        let mut store = self.top.store_ptr();
        let mut attempts = 0;
        loop {
            if attempts >= FAST_ATTEMPTS {
                let (success, _) = self.run_helped(guard, OpKind::Add, hv, item);
                return success;
            }
            match unsafe { self.try_add(store, guard, hv, item) } {
                Ok(done) => return done,
                Err(FastMiss::Migrate) => store = self.migrate(store, guard),
                Err(FastMiss::Contended) => {
                    attempts += 1;
                    store = self.top.store_ptr();
                }
            }
        }
    }

    /// Removes `hv`'s live item; see [`LfMap::remove`](crate::LfMap::remove).
    ///
    /// # Safety
    ///
    /// As for [`LfMap::remove`](crate::LfMap::remove).
    pub unsafe fn remove(&self, guard: &Guard<'_>, hv: HashValue) -> Option<*mut T> {
        let mut store = self.top.store_ptr();
        let mut attempts = 0;
        loop {
            if attempts >= FAST_ATTEMPTS {
                let (success, old) =
                    self.run_helped(guard, OpKind::Remove, hv, core::ptr::null_mut());
                return if success { Some(old) } else { None };
            }
            match unsafe { self.try_remove(store, guard, hv) } {
                Ok(old) => return old,
                Err(FastMiss::Migrate) => store = self.migrate(store, guard),
                Err(FastMiss::Contended) => {
                    attempts += 1;
                    store = self.top.store_ptr();
                }
            }
        }
    }

    // ---- fast path ----

    unsafe fn try_put(
        &self,
        store_ptr: *mut Store<T>,
        guard: &Guard<'_>,
        hv: HashValue,
        item: *mut T,
    ) -> Result<Option<*mut T>, FastMiss> {
        let store = unsafe { &*store_ptr };
        let bucket = find_bucket_acquiring(store, hv).map_err(|_| FastMiss::Migrate)?;

        let record = bucket.load_record::<T>();
        if record.is_moving() {
            return Err(FastMiss::Migrate);
        }
        if record.is_used() {
            self.resolve_used(guard, bucket, record);
            return Err(FastMiss::Contended);
        }

        let (old, info) = if record.is_live() {
            (Some(record.item), record.info)
        } else {
            (None, self.top.next_epoch.fetch_add(1, Ordering::AcqRel) & EPOCH_MASK)
        };
        match bucket.cas_record(record, Record { item, info }) {
            Ok(()) => {
                if old.is_none() {
                    self.top.item_count.fetch_add(1, Ordering::AcqRel);
                }
                Ok(old)
            }
            Err(current) if current.is_moving() => Err(FastMiss::Migrate),
            Err(_) => Err(FastMiss::Contended),
        }
    }

    unsafe fn try_replace(
        &self,
        store_ptr: *mut Store<T>,
        guard: &Guard<'_>,
        hv: HashValue,
        item: *mut T,
    ) -> Result<Option<*mut T>, FastMiss> {
        let store = unsafe { &*store_ptr };
        let Some(bucket) = find_bucket(store, hv) else {
            return Ok(None);
        };

        let record = bucket.load_record::<T>();
        if record.is_moving() {
            return Err(FastMiss::Migrate);
        }
        if record.is_used() {
            self.resolve_used(guard, bucket, record);
            return Err(FastMiss::Contended);
        }
        if !record.is_live() {
            return Ok(None);
        }
        let candidate = Record {
            item,
            info: record.info,
        };
        match bucket.cas_record(record, candidate) {
            Ok(()) => Ok(Some(record.item)),
            Err(current) if current.is_moving() => Err(FastMiss::Migrate),
            Err(_) => Err(FastMiss::Contended),
        }
    }

    unsafe fn try_add(
        &self,
        store_ptr: *mut Store<T>,
        guard: &Guard<'_>,
        hv: HashValue,
        item: *mut T,
    ) -> Result<bool, FastMiss> {
        let store = unsafe { &*store_ptr };
        let bucket = find_bucket_acquiring(store, hv).map_err(|_| FastMiss::Migrate)?;

        let record = bucket.load_record::<T>();
        if record.is_moving() {
            return Err(FastMiss::Migrate);
        }
        if record.is_used() {
            self.resolve_used(guard, bucket, record);
            return Err(FastMiss::Contended);
        }
        if record.is_live() {
            return Ok(false);
        }
        let candidate = Record {
            item,
            info: self.top.next_epoch.fetch_add(1, Ordering::AcqRel) & EPOCH_MASK,
        };
        match bucket.cas_record(record, candidate) {
            Ok(()) => {
                self.top.item_count.fetch_add(1, Ordering::AcqRel);
                Ok(true)
            }
            Err(current) if current.is_moving() => Err(FastMiss::Migrate),
            Err(_) => Err(FastMiss::Contended),
        }
    }

    unsafe fn try_remove(
        &self,
        store_ptr: *mut Store<T>,
        guard: &Guard<'_>,
        hv: HashValue,
    ) -> Result<Option<*mut T>, FastMiss> {
        let store = unsafe { &*store_ptr };
        let Some(bucket) = find_bucket(store, hv) else {
            return Ok(None);
        };

        let record = bucket.load_record::<T>();
        if record.is_moving() {
            return Err(FastMiss::Migrate);
        }
        if record.is_used() {
            self.resolve_used(guard, bucket, record);
            return Err(FastMiss::Contended);
        }
        if !record.is_live() {
            return Ok(None);
        }
        let candidate = Record {
            item: record.item,
            info: F_RMVD | (self.top.domain.advance_era() & EPOCH_MASK),
        };
        match bucket.cas_record(record, candidate) {
            Ok(()) => {
                self.top.item_count.fetch_sub(1, Ordering::AcqRel);
                Ok(Some(record.item))
            }
            Err(current) if current.is_moving() => Err(FastMiss::Migrate),
            Err(_) => Err(FastMiss::Contended),
        }
    }

    // ---- helping ----

    /// Publish an operation and drive it to completion, helping everyone
    /// else pending along the way.
    fn run_helped(
        &self,
        guard: &Guard<'_>,
        kind: OpKind,
        hv: HashValue,
        item: *mut T,
    ) -> (bool, *mut T) {
        self.sweep(guard);

        let epoch = match kind {
            OpKind::Remove => self.top.domain.advance_era() & EPOCH_MASK,
            _ => self.top.next_epoch.fetch_add(1, Ordering::AcqRel) & EPOCH_MASK,
        };
        let req = Box::into_raw(Box::new(HelpReq {
            hdr: EraHeader::new(),
            kind,
            hv,
            item,
            epoch,
            state: AtomicU128::new(0),
        }));
        // SAFETY: freshly boxed, not yet shared.
        self.top.domain.commit(unsafe { &*req });

        let slot = &self.help[guard.tid()];
        slot.req.store(req, Ordering::Release);

        // SAFETY: req is valid and published; we are its owner.
        let done = unsafe { self.execute(guard, &*req) };

        slot.req.store(core::ptr::null_mut(), Ordering::Release);
        // SAFETY: unpublished above; helpers that still hold the pointer
        // are protected by their guards.
        unsafe { guard.retire(req) };
        done
    }

    /// Help every pending request once.
    fn sweep(&self, guard: &Guard<'_>) {
        for slot in self.help.iter() {
            let req = slot.req.load(Ordering::Acquire);
            if req.is_null() {
                continue;
            }
            // SAFETY: a request observed non-null under our guard is
            // retired strictly after our reservation.
            let req = unsafe { &*req };
            if decode_done::<T>(req.state.load(Ordering::Acquire)).is_none() {
                unsafe { self.execute(guard, req) };
            }
        }
    }

    /// Drive `req` through its state machine until `DONE`.
    unsafe fn execute(&self, guard: &Guard<'_>, req: &HelpReq<T>) -> (bool, *mut T) {
        loop {
            let state = req.state.load(Ordering::Acquire);
            if let Some(done) = decode_done(state) {
                return done;
            }

            let store_ptr = self.top.store_ptr();
            let store = unsafe { &*store_ptr };

            let bucket = match req.kind {
                OpKind::Put | OpKind::Add => match find_bucket_acquiring(store, req.hv) {
                    Ok(bucket) => bucket,
                    Err(MustMigrate) => {
                        self.migrate(store_ptr, guard);
                        continue;
                    }
                },
                OpKind::Replace | OpKind::Remove => match find_bucket(store, req.hv) {
                    Some(bucket) => bucket,
                    None => {
                        // Key absent. A standing claim (made against an
                        // older store) can no longer apply; retract it,
                        // then conclude not-found.
                        if state & TAG_CLAIM != 0 {
                            let _ = req.state.compare_exchange(
                                state,
                                0,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        } else {
                            let _ = req.state.compare_exchange(
                                state,
                                done_word::<T>(false, core::ptr::null_mut()),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            );
                        }
                        continue;
                    }
                },
            };

            let record = bucket.load_record::<T>();
            if record.is_moving() {
                self.migrate(store_ptr, guard);
                continue;
            }

            if let Some(expected) = decode_claim::<T>(state) {
                let candidate = req.candidate(expected);
                if record == candidate {
                    // Installed (by us or anyone): report and unmark.
                    let _ = req.state.compare_exchange(
                        state,
                        req.done_applied(expected),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    let _ = bucket.cas_record(candidate, candidate.without_used());
                    continue;
                }
                if record == expected {
                    if bucket.cas_record(expected, candidate).is_ok() {
                        match req.kind {
                            OpKind::Put | OpKind::Add if !expected.is_live() => {
                                self.top.item_count.fetch_add(1, Ordering::AcqRel);
                            }
                            OpKind::Remove => {
                                self.top.item_count.fetch_sub(1, Ordering::AcqRel);
                            }
                            _ => {}
                        }
                        let _ = req.state.compare_exchange(
                            state,
                            req.done_applied(expected),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        let _ = bucket.cas_record(candidate, candidate.without_used());
                    }
                    continue;
                }
                // The record is neither the claim nor the candidate. The
                // USED discipline guarantees an installed candidate stays
                // in place until the outcome is written, so the install
                // never happened: retract the claim. The CAS keeps us
                // honest if the outcome landed in the meantime.
                let _ = req
                    .state
                    .compare_exchange(state, 0, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }

            // OPEN: decide against the record in front of us.
            if record.is_used() {
                self.resolve_used(guard, bucket, record);
                continue;
            }
            let outcome_now = match req.kind {
                OpKind::Put => None,
                OpKind::Add => record.is_live().then(|| done_word::<T>(false, core::ptr::null_mut())),
                OpKind::Replace | OpKind::Remove => {
                    (!record.is_live()).then(|| done_word::<T>(false, core::ptr::null_mut()))
                }
            };
            match outcome_now {
                Some(done) => {
                    let _ = req
                        .state
                        .compare_exchange(state, done, Ordering::AcqRel, Ordering::Acquire);
                }
                None => {
                    let _ = req.state.compare_exchange(
                        state,
                        claim_word(record),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
        }
    }

    /// Complete the request behind a `USED` record, then unmark it.
    ///
    /// A `USED` record in a bucket implies its request is claimed or
    /// done; if the owning slot is already empty the outcome was
    /// consumed, and clearing the flag is all that is left.
    fn resolve_used(&self, _guard: &Guard<'_>, bucket: &crate::store::Bucket, record: Record<T>) {
        for slot in self.help.iter() {
            let req = slot.req.load(Ordering::Acquire);
            if req.is_null() {
                continue;
            }
            // SAFETY: protected by our guard, as in `sweep`.
            let req = unsafe { &*req };
            let state = req.state.load(Ordering::Acquire);
            if let Some(expected) = decode_claim::<T>(state) {
                if req.candidate(expected) == record {
                    let _ = req.state.compare_exchange(
                        state,
                        req.done_applied(expected),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    break;
                }
            }
        }
        let _ = bucket.cas_record(record, record.without_used());
    }

    /// Cooperative migration, impatient variant: identical four-phase
    /// protocol to the lock-free engine's, except that the freeze pass
    /// resolves `USED` records first (a successor must never inherit an
    /// unconsumed install) and nobody naps.
    fn migrate(&self, store_ptr: *mut Store<T>, guard: &Guard<'_>) -> *mut Store<T> {
        let current = self.top.store_ptr();
        if current != store_ptr {
            return current;
        }
        let store = unsafe { &*store_ptr };

        let mut new_store = store.next.load(Ordering::Acquire);

        if new_store.is_null() {
            // Phase A: freeze, resolving pending installs on the way.
            let mut live = 0u64;
            for i in 0..=store.last_slot as usize {
                let bucket = store.bucket(i);
                let mut record = bucket.load_record::<T>();
                loop {
                    if record.is_moving() {
                        break;
                    }
                    if record.is_used() {
                        self.resolve_used(guard, bucket, record);
                        record = bucket.load_record::<T>();
                        continue;
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
                        Err(actual) => record = actual,
                    }
                }
                if record.is_live() {
                    live += 1;
                }
            }

            // Phase B.
            new_store = store.next.load(Ordering::Acquire);
            if new_store.is_null() {
                let candidate = Store::boxed(&self.top.domain, new_size(store.last_slot, live));
                match store.next.compare_exchange(
                    core::ptr::null_mut(),
                    candidate,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => new_store = candidate,
                    Err(installed) => {
                        // SAFETY: our proposal was never published.
                        unsafe { self.top.domain.retire_unused(candidate) };
                        new_store = installed;
                    }
                }
            }
        }

        // Phase C.
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
            let new_bucket = target.expect("successor store full during migration");

            let candidate = Record {
                item: record.item,
                info: record.epoch_bits(),
            };
            let _ = new_bucket.cas_record(Record::null(), candidate);

            let moved = Record {
                item: record.item,
                info: record.info | F_MOVED,
            };
            let _ = bucket.cas_record(record, moved);
        }

        // Phase D.
        let _ = new_ref
            .used_count
            .compare_exchange(0, live, Ordering::AcqRel, Ordering::Acquire);

        if self
            .top
            .store_current
            .compare_exchange(store_ptr, new_store, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: unlinked from the top; readers hold guards.
            unsafe { guard.retire(store_ptr) };
        }

        self.top.store_ptr()
    }

    /// Snapshot of the live records; see [`LfMap`](crate::LfMap) views.
    ///
    /// # Safety
    ///
    /// As for the write operations; entries are valid while `guard` lives.
    pub unsafe fn view(&self, guard: &Guard<'_>, sort: bool) -> Vec<ViewEntry<T>> {
        unsafe { self.top.view(guard, sort) }
    }
}

impl<T: Tracked> WfMap<T> {
    /// Linearized snapshot at `era` (from
    /// [`Domain::pin_linearized`](petek::Domain::pin_linearized), with
    /// `guard` being that reservation).
    ///
    /// # Safety
    ///
    /// As for [`view`](Self::view).
    pub unsafe fn view_at(&self, guard: &Guard<'_>, era: u64) -> Vec<ViewEntry<T>> {
        unsafe { self.top.view_at(guard, era) }
    }
}

fn find_bucket_acquiring<T>(store: &Store<T>, hv: HashValue) -> Result<&crate::store::Bucket, MustMigrate> {
    let mut bix = hv.bucket_index(store.last_slot);
    for _ in 0..=store.last_slot {
        let bucket = store.bucket(bix);
        let hv2 = bucket.load_hash();
        if hv2.is_empty() {
            if bucket.try_install_hash(hv) {
                if store.used_count.fetch_add(1, Ordering::AcqRel) >= store.threshold {
                    return Err(MustMigrate);
                }
                return Ok(bucket);
            }
        }
        let hv2 = bucket.load_hash();
        if hv2 != hv {
            bix = (bix + 1) & store.last_slot as usize;
            continue;
        }
        return Ok(bucket);
    }
    Err(MustMigrate)
}

fn find_bucket<T>(store: &Store<T>, hv: HashValue) -> Option<&crate::store::Bucket> {
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
        return Some(bucket);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn surface_matches_lock_free_engine() {
        let domain = Domain::new();
        let map = WfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        unsafe {
            assert!(map.put(&guard, hv(1), item(&domain, 10)).is_none());
            assert!(map.add(&guard, hv(2), item(&domain, 20)));

            let rejected = item(&domain, 21);
            assert!(!map.add(&guard, hv(2), rejected));
            domain.retire_unused(rejected);

            let old = map.replace(&guard, hv(1), item(&domain, 11)).unwrap();
            assert_eq!((*old).value, 10);
            guard.retire(old);

            assert_eq!(map.get(&guard, hv(1)).map(|i| i.value), Some(11));
            assert_eq!(map.len(), 2);

            let old = map.remove(&guard, hv(1)).unwrap();
            assert_eq!((*old).value, 11);
            guard.retire(old);
            let old = map.remove(&guard, hv(2)).unwrap();
            guard.retire(old);
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn helped_round_reports_the_displaced_item() {
        let domain = Domain::new();
        let map = WfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        unsafe {
            let first = item(&domain, 1);
            assert!(map.put(&guard, hv(9), first).is_none());

            // Drive a put through the published-request path directly.
            let second = item(&domain, 2);
            let (success, old) = map.run_helped(&guard, OpKind::Put, hv(9), second);
            assert!(success);
            assert_eq!(old, first);
            guard.retire(old);

            assert_eq!(map.get(&guard, hv(9)).map(|i| i.value), Some(2));
            // The outcome was consumed, so the record must be unmarked.
            let store = &*map.top.store_ptr();
            let bucket = find_bucket(store, hv(9)).unwrap();
            assert!(!bucket.load_record::<Item>().is_used());

            let old = map.remove(&guard, hv(9)).unwrap();
            guard.retire(old);
        }
    }

    #[test]
    fn helped_round_respects_semantics() {
        let domain = Domain::new();
        let map = WfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        unsafe {
            // Helped add on a live key fails without touching it.
            assert!(map.put(&guard, hv(3), item(&domain, 30)).is_none());
            let rejected = item(&domain, 31);
            let (success, _) = map.run_helped(&guard, OpKind::Add, hv(3), rejected);
            assert!(!success);
            domain.retire_unused(rejected);
            assert_eq!(map.get(&guard, hv(3)).map(|i| i.value), Some(30));

            // Helped remove of an absent key reports not-found.
            let (success, _) =
                map.run_helped(&guard, OpKind::Remove, hv(77), core::ptr::null_mut());
            assert!(!success);

            // Helped remove of a live key returns it.
            let (success, old) =
                map.run_helped(&guard, OpKind::Remove, hv(3), core::ptr::null_mut());
            assert!(success);
            assert_eq!((*old).value, 30);
            guard.retire(old);
            assert!(map.get(&guard, hv(3)).is_none());
        }
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn growth_works_through_the_helped_path() {
        let domain = Domain::new();
        let map = WfMap::<Item>::new(domain.clone());
        let guard = domain.pin();
        unsafe {
            for k in 0u64..30 {
                let fresh = item(&domain, k);
                let (success, old) = map.run_helped(&guard, OpKind::Put, hv(k), fresh);
                assert!(success);
                assert!(old.is_null());
            }
            for k in 0u64..30 {
                assert_eq!(map.get(&guard, hv(k)).map(|i| i.value), Some(k));
            }
        }
        assert_eq!(map.len(), 30);
        assert!(map.capacity() >= 64);
    }
}
