//! Guards and per-thread reclamation state.
//!
//! Implements the reserve/retire protocol:
//! - Pin: publish the observed era into the thread's registry slot, then
//!   re-validate it (a plain load-then-store leaves a window in which a
//!   scanning thread misses the reservation).
//! - Retire: stamp the retire era, link the header into the thread's
//!   deferred list; every `RETIRE_SCAN_FREQ` retirements the list is
//!   swept against the minimum active reservation.
//! - Thread exit: sweep once, hand any survivors to the domain.

use crate::domain::{Domain, INACTIVE};
use crate::tracked::{EraHeader, Tracked};
use core::cell::{Cell, RefCell};
use core::marker::PhantomData as marker;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use std::sync::Arc;

/// Sweep the deferred list every this many retirements.
const RETIRE_SCAN_FREQ: usize = 64;

/// Per-(thread, domain) state. Boxed so its address is stable for the
/// lifetime of the thread; reached through a raw pointer from [`Guard`].
struct HandleEntry {
    domain: Arc<Domain>,
    tid: usize,
    /// Live guards on this thread. Only the outermost publishes the
    /// reservation; inner guards share it.
    nesting: Cell<usize>,
    /// Head of the deferred retirement list (intrusive via `EraHeader::next`).
    head: Cell<*mut EraHeader>,
    /// Retirements since the last sweep.
    since_scan: Cell<usize>,
}

impl Drop for HandleEntry {
    fn drop(&mut self) {
        // No guard can outlive the thread, so our slot is inactive and the
        // sweep sees every other thread's true reservation.
        scan(&self.domain, self);
        let head = self.head.replace(core::ptr::null_mut());
        self.domain.adopt_orphans(head);
        self.domain.free_tid(self.tid);
    }
}

std::thread_local! {
    static HANDLES: RefCell<Vec<Box<HandleEntry>>> = const { RefCell::new(Vec::new()) };
}

/// Find or create this thread's entry for `domain`.
///
/// The returned pointer stays valid until thread exit: entries are boxed
/// and never removed from the thread-local vector before then.
fn entry_for(domain: &Domain) -> NonNull<HandleEntry> {
    HANDLES.with(|handles| {
        let mut handles = handles.borrow_mut();
        if let Some(entry) = handles.iter().find(|e| e.domain.id == domain.id) {
            return NonNull::from(&**entry);
        }
        let domain = domain
            .weak_self
            .upgrade()
            .expect("domain used while being torn down");
        let tid = domain.alloc_tid();
        let entry = Box::new(HandleEntry {
            domain,
            tid,
            nesting: Cell::new(0),
            head: Cell::new(core::ptr::null_mut()),
            since_scan: Cell::new(0),
        });
        let ptr = NonNull::from(&*entry);
        handles.push(entry);
        ptr
    })
}

/// RAII reservation on a [`Domain`].
///
/// While a guard exists, no allocation retired after the guard's era is
/// physically dropped, so pointers loaded from shared structures stay
/// valid. Nested pins on the same thread share the outermost reservation.
///
/// Guards are not `Send`: the reservation lives in a per-thread slot.
pub struct Guard<'d> {
    domain: &'d Domain,
    entry: NonNull<HandleEntry>,
    _marker: marker<*mut ()>,
}

impl Domain {
    /// Enters a reservation; see [`Guard`].
    pub fn pin(&self) -> Guard<'_> {
        let entry = entry_for(self);
        // SAFETY: entry_for returns a pointer valid for the thread's
        // lifetime, and Guard is !Send.
        let e = unsafe { entry.as_ref() };
        if e.nesting.get() == 0 {
            let slot = &self.slots[e.tid].reservation;
            loop {
                let era = self.era();
                slot.store(era, Ordering::SeqCst);
                if self.era() == era {
                    break;
                }
            }
        }
        e.nesting.set(e.nesting.get() + 1);
        Guard {
            domain: self,
            entry,
            _marker: marker,
        }
    }

    /// Enters a reservation and returns the reserved era, the common
    /// linearization point for multi-structure snapshots: allocations
    /// committed at or before it are visible, retirements after it are
    /// still observable.
    pub fn pin_linearized(&self) -> (Guard<'_>, u64) {
        let guard = self.pin();
        let era = guard.era();
        (guard, era)
    }

    /// Sweeps the calling thread's deferred list now, dropping everything
    /// no active reservation can still observe.
    pub fn flush(&self) {
        let entry = entry_for(self);
        // SAFETY: as in `pin`.
        let e = unsafe { entry.as_ref() };
        e.since_scan.set(0);
        scan(self, e);
    }
}

impl<'d> Guard<'d> {
    /// The domain this guard reserves.
    #[inline]
    pub fn domain(&self) -> &'d Domain {
        self.domain
    }

    /// The era this thread's outermost guard published.
    #[inline]
    pub fn era(&self) -> u64 {
        let e = unsafe { self.entry.as_ref() };
        self.domain.slots[e.tid].reservation.load(Ordering::Acquire)
    }

    /// Registry slot index of the calling thread in this domain.
    ///
    /// Stable for the thread's lifetime; usable as a dense thread key by
    /// structures layered on the domain.
    #[inline]
    pub fn tid(&self) -> usize {
        unsafe { self.entry.as_ref() }.tid
    }

    /// Retires `ptr`: stamps its retire era and defers its destruction
    /// until every reservation has moved past it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid `Box`-allocated `T` that has been unlinked
    /// from all shared structures (no thread can newly reach it), and it
    /// must be retired exactly once.
    pub unsafe fn retire<T: Tracked>(&self, ptr: *mut T) {
        let e = unsafe { self.entry.as_ref() };
        let era = self.domain.advance_era();
        let hdr = ptr as *mut EraHeader;
        // SAFETY: Tracked guarantees the header sits at offset 0; this
        // thread exclusively owns the header's link and destructor slot.
        unsafe {
            (*hdr).retire_era.store(era, Ordering::SeqCst);
            (*hdr).destructor.set(Some(dealloc_erased::<T>));
            (*hdr).next.store(e.head.get(), Ordering::Relaxed);
        }
        e.head.set(hdr);
        e.since_scan.set(e.since_scan.get() + 1);
        if e.since_scan.get() >= RETIRE_SCAN_FREQ {
            e.since_scan.set(0);
            scan(self.domain, e);
        }
    }
}

impl Drop for Guard<'_> {
    #[inline]
    fn drop(&mut self) {
        let e = unsafe { self.entry.as_ref() };
        let nesting = e.nesting.get();
        e.nesting.set(nesting - 1);
        if nesting == 1 {
            self.domain.slots[e.tid]
                .reservation
                .store(INACTIVE, Ordering::SeqCst);
        }
    }
}

unsafe fn dealloc_erased<T: Tracked>(hdr: *mut EraHeader) {
    // SAFETY: the header was linked by `retire::<T>`, so the allocation
    // is a T; scan calls each destructor once.
    unsafe {
        T::dealloc(hdr as *mut T);
    }
}

/// Sweep `entry`'s deferred list: drop everything retired before the
/// minimum active reservation, keep the rest.
fn scan(domain: &Domain, entry: &HandleEntry) {
    let mut cur = entry.head.replace(core::ptr::null_mut());

    // Adopt lists abandoned by exited threads, without blocking.
    if let Some(mut orphans) = domain.orphans.try_lock() {
        for orphan in orphans.drain(..) {
            let mut tail = orphan.head;
            // SAFETY: orphan lists are unreachable and exclusively ours.
            unsafe {
                loop {
                    let next = (*tail).next.load(Ordering::Relaxed);
                    if next.is_null() {
                        break;
                    }
                    tail = next;
                }
                (*tail).next.store(cur, Ordering::Relaxed);
            }
            cur = orphan.head;
        }
    }

    let min = domain.min_reservation();
    let mut kept: *mut EraHeader = core::ptr::null_mut();
    let mut kept_tail: *mut EraHeader = core::ptr::null_mut();

    while !cur.is_null() {
        // SAFETY: every node in the list was retired exactly once and is
        // reachable only through this list.
        unsafe {
            let next = (*cur).next.load(Ordering::Relaxed);
            if (*cur).retire_era.load(Ordering::Acquire) < min {
                if let Some(dtor) = (*cur).destructor.get() {
                    dtor(cur);
                }
            } else {
                (*cur).next.store(kept, Ordering::Relaxed);
                if kept.is_null() {
                    kept_tail = cur;
                }
                kept = cur;
            }
            cur = next;
        }
    }

    // Splice survivors back in front of anything a destructor re-retired
    // while we were sweeping.
    if !kept.is_null() {
        // SAFETY: kept/kept_tail delimit a detached list we own.
        unsafe {
            (*kept_tail).next.store(entry.head.get(), Ordering::Relaxed);
        }
        entry.head.set(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracked::EraHeader;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrd};

    #[repr(C)]
    struct Node {
        hdr: EraHeader,
        drops: Arc<AtomicUsize>,
    }

    unsafe impl Tracked for Node {
        fn era_header(&self) -> &EraHeader {
            &self.hdr
        }
    }

    impl Drop for Node {
        fn drop(&mut self) {
            self.drops.fetch_add(1, AOrd::SeqCst);
        }
    }

    fn boxed(domain: &Domain, drops: &Arc<AtomicUsize>) -> *mut Node {
        let node = Box::into_raw(Box::new(Node {
            hdr: EraHeader::new(),
            drops: drops.clone(),
        }));
        domain.commit(unsafe { &*node });
        node
    }

    #[test]
    fn retired_nodes_drop_after_flush() {
        let domain = Domain::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let node = boxed(&domain, &drops);
        {
            let guard = domain.pin();
            unsafe { guard.retire(node) };
        }
        domain.flush();
        assert_eq!(drops.load(AOrd::SeqCst), 1);
    }

    #[test]
    fn active_guard_blocks_reclamation() {
        let domain = Domain::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let node = boxed(&domain, &drops);
        let outer = domain.pin();
        {
            let inner = domain.pin();
            unsafe { inner.retire(node) };
        }
        domain.flush();
        // Retired after `outer` reserved: must survive the sweep.
        assert_eq!(drops.load(AOrd::SeqCst), 0);
        drop(outer);
        domain.flush();
        assert_eq!(drops.load(AOrd::SeqCst), 1);
    }

    #[test]
    fn linearized_era_is_reservation() {
        let domain = Domain::new();
        let (guard, era) = domain.pin_linearized();
        assert_eq!(era, guard.era());
        assert!(era <= domain.era());
    }
}
