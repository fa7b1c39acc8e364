//! 128-bit hash values and the hashing trait the containers key on.
//!
//! The table engine treats hashes as opaque 128-bit identities: equality
//! decides key identity (full keys are never compared), the total order
//! feeds the set-algebra merges, and the all-zero encoding is reserved to
//! mean "bucket unclaimed". Values are produced by hashing the key with
//! two differently seeded [`foldhash`] states and packing the outputs;
//! the reserved zero is remapped.

use core::hash::{BuildHasher, Hash};
use foldhash::fast::FixedState;
use portable_atomic::AtomicU128;
use std::sync::atomic::Ordering;

const SEED_LO: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_HI: u64 = 0xc2b2_ae3d_27d4_eb4f;

/// An opaque 128-bit hash identity.
///
/// `HashValue::EMPTY` (all zero) is reserved by the engine and never
/// produced by the hashing helpers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashValue(u128);

impl HashValue {
    /// The reserved "no hash" encoding.
    pub const EMPTY: HashValue = HashValue(0);

    /// Builds a hash value from two 64-bit halves, remapping the reserved
    /// zero encoding.
    #[inline]
    pub fn from_parts(hi: u64, lo: u64) -> Self {
        let raw = ((hi as u128) << 64) | lo as u128;
        if raw == 0 { HashValue(1) } else { HashValue(raw) }
    }

    /// True for the reserved empty encoding.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Home bucket index in a table with the given power-of-two mask.
    #[inline]
    pub(crate) fn bucket_index(self, last_slot: u64) -> usize {
        (self.0 as u64 & last_slot) as usize
    }

    #[inline]
    pub(crate) fn raw(self) -> u128 {
        self.0
    }

    #[inline]
    pub(crate) fn from_raw(raw: u128) -> Self {
        HashValue(raw)
    }
}

impl core::fmt::Debug for HashValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HashValue({:032x})", self.0)
    }
}

/// Hashes any `Hash` value into a 128-bit identity.
#[inline]
pub fn hash_one<T: Hash + ?Sized>(value: &T) -> HashValue {
    let lo = FixedState::with_seed(SEED_LO).hash_one(value);
    let hi = FixedState::with_seed(SEED_HI).hash_one(value);
    HashValue::from_parts(hi, lo)
}

/// Hashes a pointer by address.
#[inline]
pub fn hash_pointer<T>(ptr: *const T) -> HashValue {
    hash_one(&(ptr as usize))
}

/// Hashes an `f64` by bit pattern, with `-0.0` normalized so numeric
/// equality and hash equality agree.
#[inline]
pub fn hash_real(value: f64) -> HashValue {
    let normalized = if value == 0.0 { 0.0f64 } else { value };
    hash_one(&normalized.to_bits())
}

/// Key types the containers can hash.
///
/// Implementations must be stable (the same value always yields the same
/// hash) and two values that compare equal must hash identically; the
/// containers compare *only* hashes.
pub trait Hashable {
    /// This value's 128-bit hash identity.
    fn hash_value(&self) -> HashValue;
}

macro_rules! hashable_int {
    ($($t:ty),*) => {
        $(impl Hashable for $t {
            #[inline]
            fn hash_value(&self) -> HashValue {
                hash_one(&(*self as u64))
            }
        })*
    };
}

hashable_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl Hashable for f64 {
    #[inline]
    fn hash_value(&self) -> HashValue {
        hash_real(*self)
    }
}

impl Hashable for str {
    #[inline]
    fn hash_value(&self) -> HashValue {
        hash_one(self)
    }
}

impl Hashable for String {
    #[inline]
    fn hash_value(&self) -> HashValue {
        hash_one(self.as_str())
    }
}

impl Hashable for &str {
    #[inline]
    fn hash_value(&self) -> HashValue {
        hash_one(*self)
    }
}

impl<T> Hashable for *const T {
    #[inline]
    fn hash_value(&self) -> HashValue {
        hash_pointer(*self)
    }
}

impl<T> Hashable for *mut T {
    #[inline]
    fn hash_value(&self) -> HashValue {
        hash_pointer(*self as *const T)
    }
}

/// Wraps a value with a caller-supplied hash function.
///
/// The object-keyed escape hatch: when the key identity is computed from
/// a field (or any projection) rather than the whole value, wrap items in
/// `CustomHashable` with the projection baked into the function.
pub struct CustomHashable<T> {
    /// The wrapped value.
    pub value: T,
    hash_fn: fn(&T) -> HashValue,
}

impl<T> CustomHashable<T> {
    /// Wraps `value`; `hash_fn` must be stable for the value's lifetime.
    pub fn new(value: T, hash_fn: fn(&T) -> HashValue) -> Self {
        Self { value, hash_fn }
    }
}

impl<T> Hashable for CustomHashable<T> {
    #[inline]
    fn hash_value(&self) -> HashValue {
        (self.hash_fn)(&self.value)
    }
}

impl<T: Clone> Clone for CustomHashable<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            hash_fn: self.hash_fn,
        }
    }
}

impl<T> core::ops::Deref for CustomHashable<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

/// A 16-byte hash cache an object can embed so its identity is computed
/// once and reused on every container operation.
///
/// ```rust
/// use petek_map::{CachedHash, HashValue, Hashable, hash_one};
///
/// struct Session {
///     token: String,
///     hash_cache: CachedHash,
/// }
///
/// impl Hashable for Session {
///     fn hash_value(&self) -> HashValue {
///         self.hash_cache.get_or_compute(|| hash_one(self.token.as_str()))
///     }
/// }
/// ```
#[derive(Default)]
pub struct CachedHash {
    cached: AtomicU128,
}

impl CachedHash {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            cached: AtomicU128::new(0),
        }
    }

    /// Returns the cached hash, computing and storing it on first use.
    /// Racing computations are benign: `compute` is deterministic.
    #[inline]
    pub fn get_or_compute(&self, compute: impl FnOnce() -> HashValue) -> HashValue {
        let cached = self.cached.load(Ordering::Relaxed);
        if cached != 0 {
            return HashValue::from_raw(cached);
        }
        let hv = compute();
        self.cached.store(hv.raw(), Ordering::Relaxed);
        hv
    }
}

impl Clone for CachedHash {
    fn clone(&self) -> Self {
        Self {
            cached: AtomicU128::new(self.cached.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_never_empty() {
        for i in 0u64..1000 {
            assert!(!i.hash_value().is_empty());
        }
        assert!(!"".hash_value().is_empty());
    }

    #[test]
    fn equal_values_hash_equal() {
        assert_eq!(17u64.hash_value(), 17u64.hash_value());
        assert_eq!("key".hash_value(), String::from("key").hash_value());
        assert_eq!((-0.0f64).hash_value(), 0.0f64.hash_value());
    }

    #[test]
    fn distinct_values_disagree() {
        assert_ne!(1u64.hash_value(), 2u64.hash_value());
        assert_ne!("a".hash_value(), "b".hash_value());
    }

    #[test]
    fn total_order_is_consistent() {
        let a = hash_one(&1u64);
        let b = hash_one(&2u64);
        assert_eq!(a < b, !(b < a || a == b));
    }

    #[test]
    fn cached_hash_computes_once() {
        let cache = CachedHash::new();
        let first = cache.get_or_compute(|| hash_one(&42u64));
        let second = cache.get_or_compute(|| panic!("must hit the cache"));
        assert_eq!(first, second);
    }

    #[test]
    fn bucket_index_uses_low_bits() {
        let hv = HashValue::from_parts(0xdead_beef, 0b1011);
        assert_eq!(hv.bucket_index(0b111), 0b011);
    }
}
