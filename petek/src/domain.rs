//! Reclamation domains.
//!
//! A [`Domain`] is the construct-once context behind a family of
//! containers: the global era counter, the registry of per-thread
//! reservation slots, and the thread-id allocator. Independent subsystems
//! (or test harnesses) create independent domains; containers that take
//! part in the same linearized snapshots must share one.

use crate::tracked::{EraHeader, Tracked};
use crate::ttas::TTas;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use once_cell::sync::Lazy;
use std::sync::{Arc, Weak};

/// Maximum threads simultaneously registered with one domain.
///
/// Configurable via cargo features:
/// `petek = { features = ["max-threads-512"] }`. Default: 128.
/// Exceeding it is a fatal configuration error.
#[cfg(feature = "max-threads-1024")]
pub const MAX_THREADS: usize = 1024;
/// Maximum threads simultaneously registered with one domain.
#[cfg(all(feature = "max-threads-512", not(feature = "max-threads-1024")))]
pub const MAX_THREADS: usize = 512;
/// Maximum threads simultaneously registered with one domain.
#[cfg(all(
    feature = "max-threads-256",
    not(any(feature = "max-threads-512", feature = "max-threads-1024"))
))]
pub const MAX_THREADS: usize = 256;
/// Maximum threads simultaneously registered with one domain.
///
/// Configurable via cargo features:
/// `petek = { features = ["max-threads-512"] }`. Default: 128.
/// Exceeding it is a fatal configuration error.
#[cfg(not(any(
    feature = "max-threads-256",
    feature = "max-threads-512",
    feature = "max-threads-1024"
)))]
pub const MAX_THREADS: usize = 128;

/// Reservation value meaning "no operation in flight".
pub(crate) const INACTIVE: u64 = u64::MAX;

/// One reservation slot, padded to its own cache line.
#[repr(align(128))]
pub(crate) struct Slot {
    /// The era the owning thread reserved on entry, or [`INACTIVE`].
    pub(crate) reservation: AtomicU64,
}

/// Head of a deferred list abandoned by an exiting thread.
pub(crate) struct OrphanList {
    pub(crate) head: *mut EraHeader,
}

// SAFETY: the list is exclusively owned once it lands in the orphan
// vector; the TTAS serializes hand-off and adoption.
unsafe impl Send for OrphanList {}

/// A reclamation domain: era clock + reservation registry.
///
/// Cheap to share (`Arc`); every container holds one. Threads register
/// lazily on first use and keep their slot until they exit.
pub struct Domain {
    pub(crate) slots: Box<[Slot]>,
    era: AtomicU64,
    next_tid: AtomicUsize,
    free_tids: TTas<Vec<usize>>,
    pub(crate) orphans: TTas<Vec<OrphanList>>,
    pub(crate) weak_self: Weak<Domain>,
    pub(crate) id: u64,
}

static DEFAULT_DOMAIN: Lazy<Arc<Domain>> = Lazy::new(Domain::new);

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

impl Domain {
    /// Creates a fresh domain with an empty registry and era clock at 1.
    pub fn new() -> Arc<Self> {
        let mut slots = Vec::with_capacity(MAX_THREADS);
        for _ in 0..MAX_THREADS {
            slots.push(Slot {
                reservation: AtomicU64::new(INACTIVE),
            });
        }
        Arc::new_cyclic(|weak| Domain {
            slots: slots.into_boxed_slice(),
            era: AtomicU64::new(1),
            next_tid: AtomicUsize::new(0),
            free_tids: TTas::new(Vec::new()),
            orphans: TTas::new(Vec::new()),
            weak_self: weak.clone(),
            id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// The process-wide default domain, built on first use.
    ///
    /// A convenience for containers constructed without an explicit
    /// domain; it is an ordinary domain, reachable and shareable.
    pub fn default_ref() -> &'static Arc<Domain> {
        &DEFAULT_DOMAIN
    }

    /// Current global era.
    #[inline]
    pub fn era(&self) -> u64 {
        self.era.load(Ordering::SeqCst)
    }

    /// Advances the global era, returning the new value.
    #[inline]
    pub fn advance_era(&self) -> u64 {
        self.era.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Commits `value`: stamps its write era with the advanced global era,
    /// making it attributable in linearized snapshots.
    ///
    /// Call once, after construction and before publication.
    #[inline]
    pub fn commit<T: Tracked>(&self, value: &T) {
        let era = self.advance_era();
        value.era_header().write_era.store(era, Ordering::Release);
    }

    /// Immediately drops an allocation that was never published.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid `Box`-allocated `T` that no other thread has
    /// ever observed.
    pub unsafe fn retire_unused<T: Tracked>(&self, ptr: *mut T) {
        // SAFETY: forwarded caller contract.
        unsafe {
            T::dealloc(ptr);
        }
    }

    /// The smallest era reserved by any registered thread, or
    /// [`INACTIVE`] when no operation is in flight.
    pub(crate) fn min_reservation(&self) -> u64 {
        let limit = self.next_tid.load(Ordering::Acquire).min(MAX_THREADS);
        let mut min = INACTIVE;
        for slot in &self.slots[..limit] {
            let r = slot.reservation.load(Ordering::SeqCst);
            if r < min {
                min = r;
            }
        }
        min
    }

    /// Allocates a registry slot index, recycling exited threads' ids.
    pub(crate) fn alloc_tid(&self) -> usize {
        {
            let mut free = self.free_tids.lock();
            if let Some(tid) = free.pop() {
                return tid;
            }
        }
        // CAS loop: only bump on success so the counter stays valid if the
        // assert unwinds and is caught.
        loop {
            let current = self.next_tid.load(Ordering::Relaxed);
            assert!(
                current < MAX_THREADS,
                "petek: exceeded maximum thread count ({MAX_THREADS})"
            );
            match self.next_tid.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current,
                Err(_) => continue,
            }
        }
    }

    /// Returns a tid to the free list after clearing its reservation.
    pub(crate) fn free_tid(&self, tid: usize) {
        self.slots[tid].reservation.store(INACTIVE, Ordering::Release);
        let mut free = self.free_tids.lock();
        free.push(tid);
    }

    /// Hands an exiting thread's unreclaimed list to the domain.
    pub(crate) fn adopt_orphans(&self, head: *mut EraHeader) {
        if head.is_null() {
            return;
        }
        let mut orphans = self.orphans.lock();
        orphans.push(OrphanList { head });
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // The domain is unreachable: no registered thread holds an Arc
        // anymore, so nothing can be pinned. Drain orphaned lists.
        let mut orphans = self.orphans.lock();
        for orphan in orphans.drain(..) {
            let mut cur = orphan.head;
            while !cur.is_null() {
                // SAFETY: nodes in an orphan list are retired, unreachable,
                // and exclusively owned here.
                unsafe {
                    let next = (*cur).next.load(Ordering::Relaxed);
                    if let Some(dtor) = (*cur).destructor.get() {
                        dtor(cur);
                    }
                    cur = next;
                }
            }
        }
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("era", &self.era())
            .field("registered", &self.next_tid.load(Ordering::Relaxed))
            .finish()
    }
}
