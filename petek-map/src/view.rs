//! Snapshot views over a store.
//!
//! Two flavors:
//!
//! - [`Top::view`]: a single pass over the current store collecting live
//!   records, optionally sorted by insertion epoch. Backs iteration
//!   (keys/values/entries).
//! - [`Top::view_at`]: taken under a linearized reservation at era `E`.
//!   Each bucket's record is read once, atomically, and admitted iff it
//!   was visible at `E`: live records whose item was committed at or
//!   before `E`, and tombstones whose removal happened after `E` (their
//!   item pointer is still in the record word, and the reservation at
//!   `E` keeps any item retired after `E` unreclaimed, so reading it is
//!   safe). Entries carry the item's write era as the sort key — a
//!   domain-global clock, so views of two containers in one domain merge
//!   in true insertion order.

use crate::hash::HashValue;
use crate::lockfree::Top;
use petek::{Guard, Tracked, write_era_of};

/// One snapshot entry.
pub struct ViewEntry<T> {
    /// The bucket's hash identity.
    pub hv: HashValue,
    /// The item observed at snapshot time. Valid while the guard the view
    /// was taken under is live.
    pub item: *mut T,
    /// Sort key: insertion epoch ([`Top::view`]) or item write era
    /// ([`Top::view_at`]).
    pub sort_epoch: u64,
}

impl<T> Clone for ViewEntry<T> {
    fn clone(&self) -> Self {
        ViewEntry {
            hv: self.hv,
            item: self.item,
            sort_epoch: self.sort_epoch,
        }
    }
}

impl<T> Top<T> {
    /// Collects the live records of the current store.
    pub(crate) unsafe fn view(&self, _guard: &Guard<'_>, sort: bool) -> Vec<ViewEntry<T>> {
        let store = unsafe { &*self.store_ptr() };
        let mut out = Vec::with_capacity(self.len() as usize + 1);
        for i in 0..=store.last_slot as usize {
            let bucket = store.bucket(i);
            let record = bucket.load_record::<T>();
            if !record.is_live() {
                continue;
            }
            out.push(ViewEntry {
                hv: bucket.load_hash(),
                item: record.item,
                sort_epoch: record.epoch_bits(),
            });
        }
        if sort {
            out.sort_unstable_by_key(|e| e.sort_epoch);
        }
        out
    }
}

impl<T: Tracked> Top<T> {
    /// Collects the records visible at `era`, which must come from
    /// [`petek::Domain::pin_linearized`] and `guard` must be that
    /// reservation.
    pub(crate) unsafe fn view_at(&self, _guard: &Guard<'_>, era: u64) -> Vec<ViewEntry<T>> {
        let store = unsafe { &*self.store_ptr() };
        let mut out = Vec::with_capacity(self.len() as usize + 1);
        for i in 0..=store.last_slot as usize {
            let bucket = store.bucket(i);
            let record = bucket.load_record::<T>();
            if record.item.is_null() {
                // Unclaimed, or frozen-empty during a migration.
                continue;
            }
            if record.is_live() {
                // SAFETY: a live record's item cannot be retired before it
                // is displaced, and any displacement after our reservation
                // retires it after `era`; the guard keeps it valid.
                let write = write_era_of(unsafe { &*record.item });
                if write <= era {
                    out.push(ViewEntry {
                        hv: bucket.load_hash(),
                        item: record.item,
                        sort_epoch: write,
                    });
                }
            } else if record.is_removed() && record.epoch_bits() > era {
                // Removed after our linearization: the key was still live
                // at `era`. SAFETY: the removal era exceeds our reserved
                // era, so the item's retirement does too; the guard keeps
                // it valid.
                let write = write_era_of(unsafe { &*record.item });
                if write <= era {
                    out.push(ViewEntry {
                        hv: bucket.load_hash(),
                        item: record.item,
                        sort_epoch: write,
                    });
                }
            }
        }
        out
    }
}

/// Sorts a view by hash identity, the precondition for the set-algebra
/// merge scans. Live hashes are unique within one view.
pub(crate) fn sort_by_hash<T>(view: &mut [ViewEntry<T>]) {
    view.sort_unstable_by_key(|e| e.hv);
}

/// Sorts a view by its epoch key (insertion order).
pub(crate) fn sort_by_epoch<T>(view: &mut [ViewEntry<T>]) {
    view.sort_unstable_by_key(|e| e.sort_epoch);
}
