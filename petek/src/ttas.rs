//! TTAS (Test-Test-And-Set) spinlock.
//!
//! Guards the cold-path bookkeeping state (tid free list, orphaned
//! retirement lists). Never taken on the read or reclamation fast path.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct TTas<T: ?Sized> {
    acquired: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TTas<T> {}
unsafe impl<T: ?Sized + Send> Sync for TTas<T> {}

impl<T> TTas<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self {
            acquired: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning on a relaxed load between attempts.
    #[inline]
    pub(crate) fn lock(&self) -> TTasGuard<'_, T> {
        loop {
            while self.acquired.load(Ordering::Relaxed) {
                spin_loop();
            }
            if !self.acquired.swap(true, Ordering::Acquire) {
                return TTasGuard { ttas: self };
            }
        }
    }

    /// Single acquisition attempt. Used on paths that must stay non-blocking.
    #[inline]
    pub(crate) fn try_lock(&self) -> Option<TTasGuard<'_, T>> {
        if self.acquired.load(Ordering::Relaxed) {
            return None;
        }
        if !self.acquired.swap(true, Ordering::Acquire) {
            Some(TTasGuard { ttas: self })
        } else {
            None
        }
    }
}

/// RAII guard for the TTAS. Releases the lock on drop.
pub(crate) struct TTasGuard<'a, T: ?Sized> {
    ttas: &'a TTas<T>,
}

impl<T: ?Sized> Deref for TTasGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.ttas.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TTasGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.ttas.data.get() }
    }
}

impl<T: ?Sized> Drop for TTasGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.ttas.acquired.store(false, Ordering::Release);
    }
}
