//! The set facade and its algebra.
//!
//! [`Set`] stores owned items keyed by their 128-bit hash identity. The
//! binary operations take one linearized reservation and snapshot both
//! operands at the same era, so each answer corresponds to an atomic
//! instant even while other threads keep mutating: equality, subset,
//! superset and disjointness are merge scans over hash-sorted views, and
//! the constructive operations build their result from the two snapshots.
//!
//! `union` and `difference` insert in item-write-era order, preserving
//! global insertion order across both operands. `intersection` and
//! `symmetric_difference` work hash-sorted and do not preserve insertion
//! order.
//!
//! Operands of a binary operation must live in the same reclamation
//! domain (a shared era clock is what "the same instant" means); mixing
//! domains is a programming error and panics.

use crate::hash::Hashable;
use crate::view::{ViewEntry, sort_by_epoch, sort_by_hash};
use crate::waitfree::WfMap;
use petek::{Domain, EraHeader, Guard, Tracked};
use std::sync::Arc;

type FreeHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[repr(C)]
pub(crate) struct SetItem<T> {
    hdr: EraHeader,
    pub(crate) value: T,
    eject: Option<FreeHandler<T>>,
}

unsafe impl<T> Tracked for SetItem<T> {
    fn era_header(&self) -> &EraHeader {
        &self.hdr
    }
}

impl<T> Drop for SetItem<T> {
    fn drop(&mut self) {
        if let Some(eject) = &self.eject {
            eject(&self.value);
        }
    }
}

/// A concurrent, wait-free set with snapshot-consistent algebra.
///
/// # Examples
///
/// ```rust
/// use petek::Domain;
/// use petek_map::Set;
///
/// let domain = Domain::new();
/// let a: Set<u64> = Set::with_domain(domain.clone());
/// let b: Set<u64> = Set::with_domain(domain.clone());
/// for k in [1, 2, 3] {
///     a.add(k);
/// }
/// for k in [3, 4] {
///     b.add(k);
/// }
/// assert!(!a.is_disjoint(&b));
/// assert_eq!(a.union(&b).len(), 5);
/// assert_eq!(a.intersection(&b).len(), 1);
/// ```
pub struct Set<T> {
    map: WfMap<SetItem<T>>,
    eject: Option<FreeHandler<T>>,
}

impl<T> Set<T>
where
    T: Hashable + Send + Sync,
{
    /// An empty set in the process default domain.
    pub fn new() -> Self {
        Self::with_domain(Domain::default_ref().clone())
    }

    /// An empty set in `domain`.
    pub fn with_domain(domain: Arc<Domain>) -> Self {
        Set {
            map: WfMap::new(domain),
            eject: None,
        }
    }

    /// Installs a handler called with every item when its record is
    /// physically reclaimed, including at drop of the set. Runs on the
    /// reclaiming thread. Result sets of the algebra carry no handler.
    pub fn set_free_handler(&mut self, handler: impl Fn(&T) + Send + Sync + 'static) {
        self.eject = Some(Arc::new(handler));
    }

    /// The reclamation domain this set lives in.
    pub fn domain(&self) -> &Arc<Domain> {
        self.map.domain()
    }

    /// Published item count. Eventually consistent, not linearizable.
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    /// True when no items are published.
    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// True if an item with `item`'s hash identity is present.
    pub fn contains(&self, item: &T) -> bool {
        let hv = item.hash_value();
        let guard = self.map.domain().pin();
        unsafe { self.map.get(&guard, hv).is_some() }
    }

    fn new_item(&self, value: T, eject: Option<FreeHandler<T>>) -> *mut SetItem<T> {
        let item = Box::into_raw(Box::new(SetItem {
            hdr: EraHeader::new(),
            value,
            eject,
        }));
        // SAFETY: freshly boxed, not yet shared.
        self.map.domain().commit(unsafe { &*item });
        item
    }

    fn discard_candidate(&self, item: *mut SetItem<T>) {
        // SAFETY: rejected by the engine, never published, exclusively ours.
        unsafe {
            let mut boxed = Box::from_raw(item);
            boxed.eject = None;
            drop(boxed);
        }
    }

    /// Inserts `item`, replacing any existing item with the same hash
    /// identity. Returns `true` if the item was newly inserted.
    pub fn insert(&self, item: T) -> bool {
        let hv = item.hash_value();
        let guard = self.map.domain().pin();
        let item = self.new_item(item, self.eject.clone());
        // SAFETY: item honors the engine contract; displaced items are
        // retired exactly once.
        unsafe {
            match self.map.put(&guard, hv, item) {
                Some(old) => {
                    guard.retire(old);
                    false
                }
                None => true,
            }
        }
    }

    /// Inserts `item` only if its hash identity is absent.
    pub fn add(&self, item: T) -> bool {
        let hv = item.hash_value();
        let guard = self.map.domain().pin();
        let item = self.new_item(item, self.eject.clone());
        // SAFETY: as for insert.
        unsafe {
            if self.map.add(&guard, hv, item) {
                true
            } else {
                self.discard_candidate(item);
                false
            }
        }
    }

    /// Removes the item with `item`'s hash identity, if present.
    pub fn remove(&self, item: &T) -> bool {
        let hv = item.hash_value();
        let guard = self.map.domain().pin();
        // SAFETY: the displaced item is retired exactly once.
        unsafe {
            match self.map.remove(&guard, hv) {
                Some(old) => {
                    guard.retire(old);
                    true
                }
                None => false,
            }
        }
    }

    /// All items, in no particular order.
    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        let guard = self.map.domain().pin();
        // SAFETY: view entries are valid while the guard lives.
        unsafe {
            self.map
                .view(&guard, false)
                .into_iter()
                .map(|entry| (*entry.item).value.clone())
                .collect()
        }
    }

    /// All items, in insertion order.
    pub fn items_sorted(&self) -> Vec<T>
    where
        T: Clone,
    {
        let guard = self.map.domain().pin();
        // SAFETY: as for items.
        unsafe {
            self.map
                .view(&guard, true)
                .into_iter()
                .map(|entry| (*entry.item).value.clone())
                .collect()
        }
    }

    // ---- algebra ----

    fn assert_same_domain(&self, other: &Self) {
        assert!(
            Arc::ptr_eq(self.map.domain(), other.map.domain()),
            "set algebra operands must share one reclamation domain"
        );
    }

    /// Both operands' views at one linearization era.
    fn paired_views<'g>(
        &self,
        other: &Self,
        guard: &Guard<'g>,
        era: u64,
    ) -> (Vec<ViewEntry<SetItem<T>>>, Vec<ViewEntry<SetItem<T>>>) {
        // SAFETY: guard is the linearized reservation for `era` on the
        // shared domain of both maps.
        unsafe { (self.map.view_at(guard, era), other.map.view_at(guard, era)) }
    }

    /// True if both sets hold exactly the same hash identities.
    pub fn is_eq(&self, other: &Self) -> bool {
        self.assert_same_domain(other);
        let (guard, era) = self.map.domain().pin_linearized();
        let (mut ours, mut theirs) = self.paired_views(other, &guard, era);
        if ours.len() != theirs.len() {
            return false;
        }
        sort_by_hash(&mut ours);
        sort_by_hash(&mut theirs);
        ours.iter().zip(theirs.iter()).all(|(a, b)| a.hv == b.hv)
    }

    /// True if every item of `other` is in `self`; with `proper`, `self`
    /// must also be strictly larger.
    pub fn is_superset(&self, other: &Self, proper: bool) -> bool {
        self.assert_same_domain(other);
        let (guard, era) = self.map.domain().pin_linearized();
        let (mut ours, mut theirs) = self.paired_views(other, &guard, era);
        if theirs.len() > ours.len() {
            return false;
        }
        sort_by_hash(&mut ours);
        sort_by_hash(&mut theirs);

        let mut i = 0;
        for entry in &theirs {
            // Advance through our view while it is below the sought hash.
            loop {
                if i == ours.len() || ours[i].hv > entry.hv {
                    return false;
                }
                if ours[i].hv == entry.hv {
                    break;
                }
                i += 1;
            }
        }
        !(proper && ours.len() == theirs.len())
    }

    /// True if every item of `self` is in `other`; with `proper`, `other`
    /// must also be strictly larger.
    pub fn is_subset(&self, other: &Self, proper: bool) -> bool {
        other.is_superset(self, proper)
    }

    /// True if the sets share no hash identity.
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.assert_same_domain(other);
        let (guard, era) = self.map.domain().pin_linearized();
        let (mut ours, mut theirs) = self.paired_views(other, &guard, era);
        sort_by_hash(&mut ours);
        sort_by_hash(&mut theirs);

        let mut i = 0;
        let mut j = 0;
        while i < ours.len() && j < theirs.len() {
            if ours[i].hv == theirs[j].hv {
                return false;
            }
            if ours[i].hv > theirs[j].hv {
                j += 1;
            } else {
                i += 1;
            }
        }
        true
    }
}

impl<T> Set<T>
where
    T: Hashable + Clone + Send + Sync,
{
    /// Put a snapshotted entry into a result set, reusing the snapshot's
    /// hash so the identity is bit-identical.
    ///
    /// # Safety
    ///
    /// `entry` must come from a view taken under `guard`.
    unsafe fn put_entry(&self, guard: &Guard<'_>, entry: &ViewEntry<SetItem<T>>) {
        let item = self.new_item(unsafe { (*entry.item).value.clone() }, None);
        // SAFETY: fresh committed item; displaced duplicates are retired.
        unsafe {
            if let Some(old) = self.map.put(guard, entry.hv, item) {
                guard.retire(old);
            }
        }
    }

    /// Add a snapshotted entry to a result set, ignoring duplicates.
    ///
    /// # Safety
    ///
    /// As for [`put_entry`](Self::put_entry).
    unsafe fn add_entry(&self, guard: &Guard<'_>, entry: &ViewEntry<SetItem<T>>) {
        let item = self.new_item(unsafe { (*entry.item).value.clone() }, None);
        // SAFETY: fresh committed item; rejects are reclaimed unused.
        unsafe {
            if !self.map.add(guard, entry.hv, item) {
                self.discard_candidate(item);
            }
        }
    }

    /// Items of `self` that are not in `other`, insertion order preserved.
    pub fn difference(&self, other: &Self) -> Set<T> {
        self.assert_same_domain(other);
        let result = Set::with_domain(self.map.domain().clone());
        let (guard, era) = self.map.domain().pin_linearized();
        let (mut ours, theirs) = self.paired_views(other, &guard, era);

        // Rather than a tandem scan, pour our whole snapshot in (sorted
        // so the result's epochs reproduce our insertion order), then
        // carve the other side out by hash.
        sort_by_epoch(&mut ours);
        for entry in &ours {
            // SAFETY: entries come from views under `guard`.
            unsafe { result.put_entry(&guard, entry) };
        }
        for entry in &theirs {
            // SAFETY: displaced items of the result are retired once.
            unsafe {
                if let Some(old) = result.map.remove(&guard, entry.hv) {
                    guard.retire(old);
                }
            }
        }
        result
    }

    /// All items of both sets, global insertion order preserved.
    pub fn union(&self, other: &Self) -> Set<T> {
        self.assert_same_domain(other);
        let result = Set::with_domain(self.map.domain().clone());
        let (guard, era) = self.map.domain().pin_linearized();
        let (mut ours, mut theirs) = self.paired_views(other, &guard, era);

        // Merge by write era so items land in the order they were first
        // inserted anywhere.
        sort_by_epoch(&mut ours);
        sort_by_epoch(&mut theirs);

        let mut i = 0;
        let mut j = 0;
        while i < ours.len() && j < theirs.len() {
            // SAFETY: entries come from views under `guard`.
            unsafe {
                if ours[i].sort_epoch < theirs[j].sort_epoch {
                    result.add_entry(&guard, &ours[i]);
                    i += 1;
                } else {
                    result.add_entry(&guard, &theirs[j]);
                    j += 1;
                }
            }
        }
        while i < ours.len() {
            unsafe { result.add_entry(&guard, &ours[i]) };
            i += 1;
        }
        while j < theirs.len() {
            unsafe { result.add_entry(&guard, &theirs[j]) };
            j += 1;
        }
        result
    }

    /// Items present in both sets. Insertion order is not preserved.
    pub fn intersection(&self, other: &Self) -> Set<T> {
        self.assert_same_domain(other);
        let result = Set::with_domain(self.map.domain().clone());
        let (guard, era) = self.map.domain().pin_linearized();
        let (mut ours, mut theirs) = self.paired_views(other, &guard, era);
        sort_by_hash(&mut ours);
        sort_by_hash(&mut theirs);

        let mut i = 0;
        let mut j = 0;
        while i < ours.len() && j < theirs.len() {
            if ours[i].hv == theirs[j].hv {
                // SAFETY: entries come from views under `guard`.
                unsafe { result.add_entry(&guard, &ours[i]) };
                i += 1;
                j += 1;
            } else if ours[i].hv > theirs[j].hv {
                j += 1;
            } else {
                i += 1;
            }
        }
        result
    }

    /// Items present in exactly one of the sets. Insertion order is not
    /// preserved.
    pub fn symmetric_difference(&self, other: &Self) -> Set<T> {
        self.assert_same_domain(other);
        let result = Set::with_domain(self.map.domain().clone());
        let (guard, era) = self.map.domain().pin_linearized();
        let (mut ours, mut theirs) = self.paired_views(other, &guard, era);
        sort_by_hash(&mut ours);
        sort_by_hash(&mut theirs);

        let mut i = 0;
        let mut j = 0;
        while i < ours.len() && j < theirs.len() {
            if ours[i].hv == theirs[j].hv {
                i += 1;
                j += 1;
            } else if ours[i].hv > theirs[j].hv {
                // SAFETY: entries come from views under `guard`.
                unsafe { result.add_entry(&guard, &theirs[j]) };
                j += 1;
            } else {
                unsafe { result.add_entry(&guard, &ours[i]) };
                i += 1;
            }
        }
        while i < ours.len() {
            unsafe { result.add_entry(&guard, &ours[i]) };
            i += 1;
        }
        while j < theirs.len() {
            unsafe { result.add_entry(&guard, &theirs[j]) };
            j += 1;
        }
        result
    }
}

impl<T> Default for Set<T>
where
    T: Hashable + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Set<T> {
    fn drop(&mut self) {
        // Quiescent teardown, as for Dict: live items are exclusively
        // ours; everything displaced went through the domain.
        let guard = self.map.domain().pin();
        // SAFETY: exclusive access; live items were never retired.
        unsafe {
            for entry in self.map.view(&guard, false) {
                drop(Box::from_raw(entry.item));
            }
        }
    }
}

impl<T> core::fmt::Debug for Set<T>
where
    T: Hashable + Send + Sync,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Set").field("len", &self.len()).finish()
    }
}
