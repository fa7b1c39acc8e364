//! Correctness tests for petek memory reclamation.
//!
//! These verify the core safety guarantees:
//! 1. No premature free (allocations stay valid while a guard references them)
//! 2. Eventual reclamation (retired allocations are eventually dropped)
//! 3. Era attribution (write/retire eras bracket a reservation correctly)

use petek::{Domain, EraHeader, Tracked, retire_era_of, write_era_of};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[repr(C)]
struct TestNode {
    hdr: EraHeader,
    value: usize,
    freed: Arc<AtomicBool>,
}

unsafe impl Tracked for TestNode {
    fn era_header(&self) -> &EraHeader {
        &self.hdr
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.freed.store(true, Ordering::Release);
    }
}

fn new_node(domain: &Domain, value: usize, freed: Arc<AtomicBool>) -> *mut TestNode {
    let node = Box::into_raw(Box::new(TestNode {
        hdr: EraHeader::new(),
        value,
        freed,
    }));
    domain.commit(unsafe { &*node });
    node
}

#[test]
fn no_premature_free() {
    let domain = Domain::new();
    let freed = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(AtomicPtr::new(new_node(&domain, 42, freed.clone())));

    let started = Arc::new(AtomicBool::new(false));
    let can_check = Arc::new(AtomicBool::new(false));

    // Thread 1: hold a guard and keep reading the node.
    let d1 = domain.clone();
    let slot1 = slot.clone();
    let freed1 = freed.clone();
    let started1 = started.clone();
    let can_check1 = can_check.clone();
    let reader = thread::spawn(move || {
        let guard = d1.pin();
        let ptr = slot1.load(Ordering::Acquire);
        let node = unsafe { &*ptr };
        assert_eq!(node.value, 42);
        started1.store(true, Ordering::Release);

        while !can_check1.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }

        // The node must not have been freed while our guard is live.
        assert!(!freed1.load(Ordering::Acquire), "node freed prematurely");
        assert_eq!(node.value, 42);
        drop(guard);
    });

    // Thread 2: unlink and retire the node, then churn retirements so the
    // deferred list gets swept.
    let d2 = domain.clone();
    let slot2 = slot.clone();
    let started2 = started.clone();
    let can_check2 = can_check.clone();
    let retirer = thread::spawn(move || {
        while !started2.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }

        let guard = d2.pin();
        let old = slot2.swap(core::ptr::null_mut(), Ordering::AcqRel);
        unsafe { guard.retire(old) };
        drop(guard);

        for i in 0..200 {
            let dummy = new_node(&d2, i, Arc::new(AtomicBool::new(false)));
            let guard = d2.pin();
            unsafe { guard.retire(dummy) };
            drop(guard);
        }
        d2.flush();

        can_check2.store(true, Ordering::Release);
    });

    retirer.join().unwrap();
    reader.join().unwrap();

    domain.flush();
    assert!(freed.load(Ordering::Acquire), "node never reclaimed");
}

#[test]
fn eventual_reclamation_under_churn() {
    let domain = Domain::new();
    let drops = Arc::new(AtomicUsize::new(0));

    #[repr(C)]
    struct Counted {
        hdr: EraHeader,
        drops: Arc<AtomicUsize>,
    }
    unsafe impl Tracked for Counted {
        fn era_header(&self) -> &EraHeader {
            &self.hdr
        }
    }
    impl Drop for Counted {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    let total = 4 * 500;
    let mut handles = Vec::new();
    for _ in 0..4 {
        let domain = domain.clone();
        let drops = drops.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                let node = Box::into_raw(Box::new(Counted {
                    hdr: EraHeader::new(),
                    drops: drops.clone(),
                }));
                domain.commit(unsafe { &*node });
                let guard = domain.pin();
                unsafe { guard.retire(node) };
                drop(guard);
            }
            domain.flush();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    domain.flush();
    // Worker threads flush on exit as well; everything must come back.
    assert_eq!(drops.load(Ordering::SeqCst), total);
}

#[test]
fn eras_bracket_reservations() {
    let domain = Domain::new();
    let freed = Arc::new(AtomicBool::new(false));

    let node = new_node(&domain, 1, freed.clone());
    let write = write_era_of(unsafe { &*node });
    assert!(write > 0);
    assert_eq!(retire_era_of(unsafe { &*node }), 0);

    let (guard, era) = domain.pin_linearized();
    assert!(era >= write);

    unsafe { guard.retire(node) };
    let retire = retire_era_of(unsafe { &*node });
    assert!(retire > era);
    drop(guard);
    domain.flush();
    assert!(freed.load(Ordering::Acquire));
}

#[test]
fn thread_exit_hands_off_orphans() {
    let domain = Domain::new();
    let freed = Arc::new(AtomicBool::new(false));

    let d = domain.clone();
    let f = freed.clone();
    thread::spawn(move || {
        let node = new_node(&d, 7, f);
        let outer = d.pin();
        // A reservation on the main thread would also work; pinning here
        // just guarantees the node cannot be swept before thread exit.
        let guard = d.pin();
        unsafe { guard.retire(node) };
        drop(guard);
        drop(outer);
    })
    .join()
    .unwrap();

    // The exiting thread either reclaimed the node itself or orphaned it;
    // an explicit flush adopts whatever is left.
    domain.flush();
    assert!(freed.load(Ordering::Acquire));
}
