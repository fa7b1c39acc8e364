//! Stores: fixed-capacity bucket arrays with 128-bit atomic slots.
//!
//! A bucket is two double-width words. The first holds the 128-bit hash
//! that claims the bucket (installed once, permanent for the store's
//! lifetime). The second packs the record: the item pointer in the low
//! half and the info word in the high half. On x86_64/aarch64/s390x both
//! are native 16-byte atomics via [`portable_atomic`]; elsewhere the
//! crate's fallback keeps them correct.
//!
//! Info word layout, high bit down:
//!
//! ```text
//! MOVING | MOVED | USED | RMVD | epoch (60 bits)
//! ```
//!
//! - `MOVING`: the bucket is frozen; writers must help migrate.
//! - `MOVED`: the bucket's content (if live) exists in the successor.
//! - `USED`: the record was installed through the write-helping protocol
//!   and its completion word may not be consumed yet.
//! - `RMVD`: tombstone. The epoch bits then hold the era of the removal
//!   and the item half still names the displaced item, which is what lets
//!   linearized snapshots include removals that happened after their era.
//! - Otherwise the epoch bits hold the key's insertion epoch; zero means
//!   the bucket never held an item.

use crate::hash::HashValue;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use petek::{Domain, EraHeader, Tracked};
use portable_atomic::AtomicU128;

pub(crate) const F_MOVING: u64 = 1 << 63;
pub(crate) const F_MOVED: u64 = 1 << 62;
pub(crate) const F_USED: u64 = 1 << 61;
pub(crate) const F_RMVD: u64 = 1 << 60;
pub(crate) const EPOCH_MASK: u64 = (1 << 60) - 1;

/// Smallest store capacity; shrink never goes below this.
pub const MIN_SIZE: u64 = 8;

/// Capacity of a store's successor given its occupancy.
///
/// Doubles above half occupancy, quarters below one eighth (bounded by
/// [`MIN_SIZE`]), and otherwise keeps the current size: migration is also
/// how the table compacts tombstoned buckets.
pub(crate) fn new_size(last_slot: u64, num_items: u64) -> u64 {
    let size = last_slot + 1;
    if num_items > size / 2 {
        size * 2
    } else if num_items < size / 8 && size / 4 >= MIN_SIZE {
        size / 4
    } else {
        size
    }
}

/// Bucket-acquisition threshold: 75% of capacity.
pub(crate) fn table_threshold(size: u64) -> u64 {
    size - (size >> 2)
}

/// A decoded record word.
pub(crate) struct Record<T> {
    pub(crate) item: *mut T,
    pub(crate) info: u64,
}

// Manual impls: the derives would bound T, and a record is a plain
// 128-bit word whatever the item type is.
impl<T> Clone for Record<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Record<T> {}

impl<T> PartialEq for Record<T> {
    fn eq(&self, other: &Self) -> bool {
        self.item == other.item && self.info == other.info
    }
}

impl<T> Eq for Record<T> {}

impl<T> Record<T> {
    #[inline]
    pub(crate) fn null() -> Self {
        Record {
            item: core::ptr::null_mut(),
            info: 0,
        }
    }

    #[inline]
    pub(crate) fn pack(self) -> u128 {
        (self.item as usize as u128) | ((self.info as u128) << 64)
    }

    #[inline]
    pub(crate) fn unpack(raw: u128) -> Self {
        Record {
            item: raw as u64 as usize as *mut T,
            info: (raw >> 64) as u64,
        }
    }

    /// Insertion epoch for live records, removal era for tombstones.
    #[inline]
    pub(crate) fn epoch_bits(self) -> u64 {
        self.info & EPOCH_MASK
    }

    /// A record holding a current item: nonzero epoch and not tombstoned.
    #[inline]
    pub(crate) fn is_live(self) -> bool {
        self.info & EPOCH_MASK != 0 && self.info & F_RMVD == 0
    }

    #[inline]
    pub(crate) fn is_moving(self) -> bool {
        self.info & F_MOVING != 0
    }

    #[inline]
    pub(crate) fn is_moved(self) -> bool {
        self.info & F_MOVED != 0
    }

    #[inline]
    pub(crate) fn is_used(self) -> bool {
        self.info & F_USED != 0
    }

    #[inline]
    pub(crate) fn is_removed(self) -> bool {
        self.info & F_RMVD != 0
    }

    #[inline]
    pub(crate) fn without_used(self) -> Self {
        Record {
            item: self.item,
            info: self.info & !F_USED,
        }
    }
}

/// One table slot: a claimable hash word plus a record word.
pub(crate) struct Bucket {
    hv: AtomicU128,
    record: AtomicU128,
}

impl Bucket {
    fn new() -> Self {
        Self {
            hv: AtomicU128::new(0),
            record: AtomicU128::new(0),
        }
    }

    #[inline]
    pub(crate) fn load_hash(&self) -> HashValue {
        HashValue::from_raw(self.hv.load(Ordering::Acquire))
    }

    /// First-writer claim: EMPTY -> `hv`. The winner owns the bucket for
    /// this store's lifetime.
    #[inline]
    pub(crate) fn try_install_hash(&self, hv: HashValue) -> bool {
        self.hv
            .compare_exchange(0, hv.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn load_record<T>(&self) -> Record<T> {
        Record::unpack(self.record.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn cas_record<T>(
        &self,
        expected: Record<T>,
        new: Record<T>,
    ) -> Result<(), Record<T>> {
        match self.record.compare_exchange(
            expected.pack(),
            new.pack(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) => Err(Record::unpack(current)),
        }
    }
}

/// A fixed-capacity bucket array. Replaced by migration, never resized in
/// place; the `next` link names the successor while one is being filled.
#[repr(C)]
pub(crate) struct Store<T> {
    hdr: EraHeader,
    pub(crate) last_slot: u64,
    pub(crate) threshold: u64,
    pub(crate) used_count: AtomicU64,
    pub(crate) next: AtomicPtr<Store<T>>,
    buckets: Box<[Bucket]>,
    _items: PhantomData<*mut T>,
}

// SAFETY: buckets hold atomics and type-erased pointers to T; the engine
// hands out references to T only under a domain guard.
unsafe impl<T: Send + Sync> Send for Store<T> {}
unsafe impl<T: Send + Sync> Sync for Store<T> {}

unsafe impl<T> Tracked for Store<T> {
    fn era_header(&self) -> &EraHeader {
        &self.hdr
    }
}

impl<T> Store<T> {
    /// Allocates and commits a store of `size` buckets (a power of two).
    pub(crate) fn boxed(domain: &Domain, size: u64) -> *mut Store<T> {
        debug_assert!(size.is_power_of_two());
        let mut buckets = Vec::with_capacity(size as usize);
        for _ in 0..size {
            buckets.push(Bucket::new());
        }
        let store = Box::into_raw(Box::new(Store {
            hdr: EraHeader::new(),
            last_slot: size - 1,
            threshold: table_threshold(size),
            used_count: AtomicU64::new(0),
            next: AtomicPtr::new(core::ptr::null_mut()),
            buckets: buckets.into_boxed_slice(),
            _items: PhantomData,
        }));
        // SAFETY: freshly boxed, not yet shared.
        domain.commit(unsafe { &*store });
        store
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        self.last_slot + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_packing_roundtrip() {
        let item = 0x1000usize as *mut u32;
        let rec = Record {
            item,
            info: F_MOVING | 42,
        };
        let back: Record<u32> = Record::unpack(rec.pack());
        assert_eq!(back.item, item);
        assert_eq!(back.info, F_MOVING | 42);
        assert!(back.is_moving());
        assert!(!back.is_moved());
        assert_eq!(back.epoch_bits(), 42);
    }

    #[test]
    fn record_classification() {
        let live: Record<u32> = Record {
            item: 0x8usize as *mut u32,
            info: 7,
        };
        assert!(live.is_live());

        let tombstone: Record<u32> = Record {
            item: 0x8usize as *mut u32,
            info: F_RMVD | 99,
        };
        assert!(!tombstone.is_live());
        assert!(tombstone.is_removed());
        assert_eq!(tombstone.epoch_bits(), 99);

        assert!(!Record::<u32>::null().is_live());
    }

    #[test]
    fn size_policy() {
        // Growth past half occupancy.
        assert_eq!(new_size(7, 5), 16);
        assert_eq!(new_size(7, 6), 16);
        // Shrink below one eighth, bounded by the minimum.
        assert_eq!(new_size(127, 16), 128);
        assert_eq!(new_size(127, 7), 32);
        assert_eq!(new_size(15, 1), 16);
        assert_eq!(new_size(31, 1), 8);
        // Steady state.
        assert_eq!(new_size(15, 6), 16);
    }

    #[test]
    fn threshold_is_three_quarters() {
        assert_eq!(table_threshold(8), 6);
        assert_eq!(table_threshold(16), 12);
        assert_eq!(table_threshold(1024), 768);
    }

    #[test]
    fn bucket_claim_is_exclusive() {
        let bucket = Bucket::new();
        let a = HashValue::from_parts(1, 2);
        let b = HashValue::from_parts(3, 4);
        assert!(bucket.load_hash().is_empty());
        assert!(bucket.try_install_hash(a));
        assert!(!bucket.try_install_hash(b));
        assert_eq!(bucket.load_hash(), a);
    }
}
