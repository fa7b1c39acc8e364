//! Petek: era-based safe memory reclamation for lock-free data structures.
//!
//! Petek defers destruction of shared allocations until no concurrent
//! reader can still observe them, using a global era clock and a fixed
//! registry of per-thread reservation slots.
//!
//! # Key properties
//!
//! - **Bounded registration**: a fixed slot registry, recycled across
//!   thread lifetimes, never per-operation allocation on the read path.
//! - **Explicit context**: all state lives in a [`Domain`] you construct
//!   and hand to your containers; independent subsystems get independent
//!   domains, and nothing hides in a process singleton (the default
//!   domain is an ordinary, reachable one).
//! - **Era attribution**: every tracked allocation records the era it was
//!   committed and the era it was retired, which is what makes consistent
//!   multi-structure snapshots possible on top.
//!
//! # Example
//!
//! ```rust
//! use petek::{Domain, EraHeader, Tracked};
//!
//! #[repr(C)]
//! struct Node {
//!     hdr: EraHeader,
//!     value: u64,
//! }
//!
//! unsafe impl Tracked for Node {
//!     fn era_header(&self) -> &EraHeader {
//!         &self.hdr
//!     }
//! }
//!
//! let domain = Domain::new();
//! let node = Box::into_raw(Box::new(Node {
//!     hdr: EraHeader::new(),
//!     value: 42,
//! }));
//! domain.commit(unsafe { &*node });
//!
//! // Enter a critical section; loaded pointers stay valid until the
//! // guard drops.
//! let guard = domain.pin();
//! assert_eq!(unsafe { (*node).value }, 42);
//!
//! // Once unlinked from every shared structure, hand it back.
//! unsafe { guard.retire(node) };
//! drop(guard);
//! domain.flush();
//! ```

#![warn(missing_docs)]

mod domain;
mod guard;
mod tracked;
mod ttas;

pub use domain::{Domain, MAX_THREADS};
pub use guard::Guard;
pub use tracked::{EraHeader, Tracked, retire_era_of, write_era_of};
