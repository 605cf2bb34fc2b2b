use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use shared_handle::{Handle, Teardown, TeardownFn};

const SENTINEL: i32 = 0xdeadbeef_u32 as i32;

/// Owns a shared cell and writes a sentinel into it when dropped.
struct Data {
    value: Arc<AtomicI32>,
}

impl Data {
    fn new(value: i32) -> (Box<Data>, Arc<AtomicI32>) {
        let cell = Arc::new(AtomicI32::new(value));
        (Box::new(Data { value: cell.clone() }), cell)
    }
}

impl Drop for Data {
    fn drop(&mut self) {
        self.value.store(SENTINEL, Ordering::SeqCst);
    }
}

#[test]
fn create_over_int() {
    let h = Handle::new(Box::new(5));
    assert_eq!(*h, 5);
    assert_eq!(h.ref_count(), 1);
}

#[test]
fn transfer_empties_source() {
    let (data, five) = Data::new(5);
    let mut slot = Some(data);
    {
        let h = Handle::transfer(&mut slot).unwrap();
        assert!(slot.is_none());
        assert_eq!(five.load(Ordering::SeqCst), 5);
        assert_eq!(h.value.load(Ordering::SeqCst), 5);
    }
    assert_eq!(five.load(Ordering::SeqCst), SENTINEL);
    assert!(Handle::transfer(&mut slot).is_none());
}

#[test]
fn raw_transfer_empties_source() {
    let (data, five) = Data::new(5);
    let mut raw = Box::into_raw(data);
    {
        let h = unsafe { Handle::from_raw_transfer(&mut raw, Teardown::Drop) }.unwrap();
        assert!(raw.is_null());
        assert_eq!(h.value.load(Ordering::SeqCst), 5);
    }
    assert_eq!(five.load(Ordering::SeqCst), SENTINEL);
}

#[test]
fn two_handles() {
    let (data, five) = Data::new(5);
    {
        let s = Handle::new(data);
        let t = s.clone();
        assert_eq!(s.ref_count(), 2);
        assert_eq!(t.ref_count(), 2);
        assert_eq!(five.load(Ordering::SeqCst), 5);
    }
    assert_eq!(five.load(Ordering::SeqCst), SENTINEL);
}

#[test]
fn two_handles_different_lifetimes() {
    let (data, five) = Data::new(5);
    {
        let s = Handle::new(data);
        {
            let _t = s.clone();
        }
        assert_eq!(s.ref_count(), 1);
        assert_eq!(five.load(Ordering::SeqCst), 5);
    }
    assert_eq!(five.load(Ordering::SeqCst), SENTINEL);
}

#[test]
fn end_to_end() {
    let original = Handle::new(Box::new(5));
    assert_eq!(original.ref_count(), 1);
    let copy = original.clone();
    assert_eq!(original.ref_count(), 2);
    assert_eq!(copy.ref_count(), 2);
    drop(copy);
    assert_eq!(original.ref_count(), 1);
    assert_eq!(*original, 5);
    assert!(original.release());
}

#[test]
fn move_keeps_count() {
    let (data, five) = Data::new(5);
    let h1 = Handle::new(data);
    let _other = h1.clone();
    let before = h1.ref_count();

    let mut slot = Some(h1);
    let h2 = slot.take().unwrap();
    assert_eq!(h2.ref_count(), before);
    assert!(slot.is_none());
    drop(slot);
    assert_eq!(h2.ref_count(), before);
    assert_eq!(five.load(Ordering::SeqCst), 5);
}

#[test]
fn deref_mutates_shared_object() {
    fn set(data: &Data, value: i32) {
        data.value.store(value, Ordering::SeqCst);
    }

    let (data, five) = Data::new(5);
    let s = Handle::new(data);
    let t = s.clone();

    set(&s, 6);
    assert_eq!(five.load(Ordering::SeqCst), 6);
    assert_eq!(t.get().value.load(Ordering::SeqCst), 6);

    set(s.get(), 0x0abc_deff);
    assert_eq!(t.value.load(Ordering::SeqCst), 0x0abc_deff);
    assert!(std::ptr::eq(&*s, t.get()));
}

static TORN_DOWN: AtomicUsize = AtomicUsize::new(0);
static POOL: Mutex<Vec<Box<Data>>> = Mutex::new(Vec::new());

/// Marks the object and parks it instead of dropping it.
fn park(data: Box<Data>) {
    data.value.store(7, Ordering::SeqCst);
    TORN_DOWN.fetch_add(1, Ordering::SeqCst);
    POOL.lock().unwrap().push(data);
}

#[test]
fn custom_teardown_replaces_drop() {
    let (data, five) = Data::new(5);
    {
        let s = Handle::with_teardown(data, park);
        let _copies = (0..3).map(|_| s.clone()).collect::<Vec<_>>();
        assert_eq!(s.ref_count(), 4);
        assert_eq!(five.load(Ordering::SeqCst), 5);
    }
    // Teardown ran once, and `Drop` did not.
    assert_eq!(TORN_DOWN.load(Ordering::SeqCst), 1);
    assert_eq!(five.load(Ordering::SeqCst), 7);

    let parked = POOL.lock().unwrap().pop().unwrap();
    drop(parked);
    assert_eq!(five.load(Ordering::SeqCst), SENTINEL);
}

static RECLAIMED: AtomicUsize = AtomicUsize::new(0);

fn reclaim(data: Box<u32>) {
    RECLAIMED.fetch_add(*data as usize, Ordering::SeqCst);
}

#[test]
fn teardown_through_slot_and_try_new() {
    let mut slot = Some(Box::new(10u32));
    let h = Handle::transfer_with_teardown(&mut slot, reclaim).unwrap();
    assert!(slot.is_none());
    let t = Handle::try_new(Box::new(20u32), Teardown::from(reclaim as TeardownFn<u32>)).unwrap();
    drop(h);
    drop(t);
    assert_eq!(RECLAIMED.load(Ordering::SeqCst), 30);
}

#[test]
fn clone_from_same_object_is_noop() {
    let (data, five) = Data::new(5);
    let mut s = Handle::new(data);
    let t = s.clone();
    s.clone_from(&t);
    assert_eq!(s.ref_count(), 2);
    drop(t);
    assert_eq!(s.ref_count(), 1);
    assert_eq!(five.load(Ordering::SeqCst), 5);
}

#[test]
fn destroyed_exactly_once_in_any_order() {
    let drops = Arc::new(AtomicUsize::new(0));

    struct Counted(Arc<AtomicUsize>);
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let root = Handle::new(Box::new(Counted(drops.clone())));
    let mut handles = (0..8).map(|_| root.clone()).collect::<Vec<_>>();
    handles.insert(3, root);
    // Drop from the middle outwards.
    while !handles.is_empty() {
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        let h = handles.remove(handles.len() / 2);
        assert_eq!(h.ref_count(), handles.len() + 1);
        drop(h);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

proptest! {
    #[test]
    fn count_tracks_copies_and_drops(copies in 0usize..64, drops in 0usize..64) {
        let drops = drops.min(copies);
        let root = Handle::new(Box::new(0u8));
        let mut handles = (0..copies).map(|_| root.clone()).collect::<Vec<_>>();
        handles.truncate(copies - drops);
        prop_assert_eq!(root.ref_count(), 1 + copies - drops);
        for h in &handles {
            prop_assert_eq!(h.ref_count(), 1 + copies - drops);
        }
    }
}
