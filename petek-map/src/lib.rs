//! Petek-map: lock-free and wait-free hash tables on era-based reclamation.
//!
//! The crate is two layers:
//!
//! - **Engines** ([`LfMap`], [`WfMap`]): open-addressed bucket arrays
//!   keyed by opaque 128-bit hashes, storing era-tracked item pointers.
//!   Stores migrate cooperatively and atomically as they fill or empty;
//!   the wait-free engine adds a write-helping protocol so no writer is
//!   indefinitely delayed by contention.
//! - **Containers** ([`Dict`], [`Set`]): safe facades that own their keys
//!   and values, hash them via [`Hashable`], and drive the reclamation
//!   protocol for every displaced item. The set carries full algebra
//!   (equality, subset/superset, disjointness, union, intersection,
//!   difference, symmetric difference) computed over snapshots of both
//!   operands taken at a single linearization era.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use petek_map::Dict;
//!
//! let dict: Arc<Dict<u64, u64>> = Arc::new(Dict::new());
//! let handles: Vec<_> = (0..4)
//!     .map(|t| {
//!         let dict = dict.clone();
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 dict.insert(t * 100 + i, i);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(dict.len(), 400);
//! ```

#![warn(missing_docs)]

mod dict;
mod hash;
mod lockfree;
mod set;
mod store;
mod view;
mod waitfree;

pub use dict::Dict;
pub use hash::{CachedHash, CustomHashable, HashValue, Hashable, hash_one, hash_pointer, hash_real};
pub use lockfree::LfMap;
pub use set::Set;
pub use store::MIN_SIZE;
pub use view::ViewEntry;
pub use waitfree::WfMap;
