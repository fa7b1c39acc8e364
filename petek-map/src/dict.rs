//! The dictionary facade.
//!
//! [`Dict`] wraps the wait-free engine with owned keys and values: every
//! mutation allocates an era-tracked item record holding `(K, V)`,
//! commits it, and retires whatever the engine displaces. Readers clone
//! values out under the operation's guard, so reclamation never races a
//! return value.
//!
//! An optional free handler is invoked once per item record at physical
//! reclamation (not at logical removal), on the reclaiming thread.

use crate::hash::Hashable;
use crate::waitfree::WfMap;
use petek::{Domain, EraHeader, Tracked};
use std::sync::Arc;

type FreeHandler<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

#[repr(C)]
pub(crate) struct DictItem<K, V> {
    hdr: EraHeader,
    pub(crate) key: K,
    pub(crate) value: V,
    eject: Option<FreeHandler<K, V>>,
}

unsafe impl<K, V> Tracked for DictItem<K, V> {
    fn era_header(&self) -> &EraHeader {
        &self.hdr
    }
}

impl<K, V> Drop for DictItem<K, V> {
    fn drop(&mut self) {
        if let Some(eject) = &self.eject {
            eject(&self.key, &self.value);
        }
    }
}

/// A concurrent, wait-free dictionary.
///
/// All operations are safe to call from any number of threads. Values
/// are cloned out on reads; keys and values are owned by the dictionary
/// and dropped (running the free handler, if any) once no concurrent
/// reader can still observe them.
///
/// # Examples
///
/// ```rust
/// use petek_map::Dict;
///
/// let dict: Dict<u64, &str> = Dict::new();
/// dict.insert(1, "one");
/// assert_eq!(dict.get(&1), Some("one"));
/// assert!(dict.remove(&1));
/// assert_eq!(dict.get(&1), None);
/// ```
pub struct Dict<K, V> {
    map: WfMap<DictItem<K, V>>,
    eject: Option<FreeHandler<K, V>>,
}

impl<K, V> Dict<K, V>
where
    K: Hashable + Send + Sync,
    V: Send + Sync,
{
    /// An empty dictionary in the process default domain.
    pub fn new() -> Self {
        Self::with_domain(Domain::default_ref().clone())
    }

    /// An empty dictionary in `domain`.
    pub fn with_domain(domain: Arc<Domain>) -> Self {
        Dict {
            map: WfMap::new(domain),
            eject: None,
        }
    }

    /// Installs a handler called with every `(key, value)` pair when its
    /// record is physically reclaimed, including at drop of the
    /// dictionary. Runs on the reclaiming thread.
    pub fn set_free_handler(&mut self, handler: impl Fn(&K, &V) + Send + Sync + 'static) {
        self.eject = Some(Arc::new(handler));
    }

    /// The reclamation domain this dictionary lives in.
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

    /// Bucket capacity of the current store.
    pub fn capacity(&self) -> u64 {
        self.map.capacity()
    }

    fn new_item(&self, key: K, value: V) -> *mut DictItem<K, V> {
        let item = Box::into_raw(Box::new(DictItem {
            hdr: EraHeader::new(),
            key,
            value,
            eject: self.eject.clone(),
        }));
        // SAFETY: freshly boxed, not yet shared.
        self.map.domain().commit(unsafe { &*item });
        item
    }

    /// Reclaims a candidate that never made it into the table. The free
    /// handler is only for items that were logically present, so it is
    /// stripped first.
    fn discard_candidate(&self, item: *mut DictItem<K, V>) {
        // SAFETY: the candidate was rejected by the engine and never
        // published; we own it exclusively.
        unsafe {
            let mut boxed = Box::from_raw(item);
            boxed.eject = None;
            drop(boxed);
        }
    }

    /// Looks up `key`, cloning its value.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let hv = key.hash_value();
        let guard = self.map.domain().pin();
        // SAFETY: items follow the engine contract; the clone happens
        // under the guard.
        unsafe { self.map.get(&guard, hv).map(|item| item.value.clone()) }
    }

    /// True if `key` has a live value.
    pub fn contains_key(&self, key: &K) -> bool {
        let hv = key.hash_value();
        let guard = self.map.domain().pin();
        unsafe { self.map.get(&guard, hv).is_some() }
    }

    /// Inserts or updates `key`. Any previous value is retired and its
    /// record reclaimed once no reader can still observe it.
    pub fn insert(&self, key: K, value: V) {
        let hv = key.hash_value();
        let guard = self.map.domain().pin();
        let item = self.new_item(key, value);
        // SAFETY: item honors the engine contract; displaced items are
        // retired exactly once.
        unsafe {
            if let Some(old) = self.map.put(&guard, hv, item) {
                guard.retire(old);
            }
        }
    }

    /// Updates `key` only if it is present. Returns whether it was.
    pub fn replace(&self, key: K, value: V) -> bool {
        let hv = key.hash_value();
        let guard = self.map.domain().pin();
        let item = self.new_item(key, value);
        // SAFETY: as for insert.
        unsafe {
            match self.map.replace(&guard, hv, item) {
                Some(old) => {
                    guard.retire(old);
                    true
                }
                None => {
                    self.discard_candidate(item);
                    false
                }
            }
        }
    }

    /// Inserts `key` only if it is absent. Returns whether it inserted.
    pub fn add(&self, key: K, value: V) -> bool {
        let hv = key.hash_value();
        let guard = self.map.domain().pin();
        let item = self.new_item(key, value);
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

    /// Removes `key`. Returns whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let hv = key.hash_value();
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

    /// All keys, in no particular order.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.collect(false, |item| item.key.clone())
    }

    /// All keys, in insertion order.
    pub fn keys_sorted(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.collect(true, |item| item.key.clone())
    }

    /// All values, in no particular order.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.collect(false, |item| item.value.clone())
    }

    /// All values, in insertion order.
    pub fn values_sorted(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.collect(true, |item| item.value.clone())
    }

    /// All `(key, value)` pairs, in no particular order.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.collect(false, |item| (item.key.clone(), item.value.clone()))
    }

    /// All `(key, value)` pairs, in insertion order.
    pub fn entries_sorted(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.collect(true, |item| (item.key.clone(), item.value.clone()))
    }

    fn collect<R>(&self, sort: bool, mut project: impl FnMut(&DictItem<K, V>) -> R) -> Vec<R> {
        let guard = self.map.domain().pin();
        // SAFETY: view entries are valid while the guard lives.
        unsafe {
            self.map
                .view(&guard, sort)
                .into_iter()
                .map(|entry| project(&*entry.item))
                .collect()
        }
    }
}

impl<K, V> Default for Dict<K, V>
where
    K: Hashable + Send + Sync,
    V: Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for Dict<K, V> {
    fn drop(&mut self) {
        // Quiescent teardown: reclaim the live items directly. Displaced
        // and removed items were retired through the domain and are on
        // their own schedule.
        let guard = self.map.domain().pin();
        // SAFETY: exclusive access; live items were never retired, so
        // this is their single owner.
        unsafe {
            for entry in self.map.view(&guard, false) {
                drop(Box::from_raw(entry.item));
            }
        }
    }
}

impl<K, V> core::fmt::Debug for Dict<K, V>
where
    K: Hashable + Send + Sync,
    V: Send + Sync,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dict").field("len", &self.len()).finish()
    }
}
