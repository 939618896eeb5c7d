//! Tests for the reference keeper

use super::*;
use crate::lock::acquire;
use crate::runtime::{ManagedHeap, Value};
use std::thread;

#[test]
fn test_keep_release_round_trip() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let obj = heap.alloc(&lock, Value::Int(7));
    assert_eq!(heap.refcount(&lock, &obj), 1);

    let kept = KeptRef::keep(&heap, &lock, &obj);
    assert_eq!(heap.refcount(&lock, &obj), 2);
    assert_eq!(*kept.object(), obj);

    kept.release(&lock);
    assert_eq!(heap.refcount(&lock, &obj), 1);
}

#[test]
fn test_drop_releases_under_held_lock() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let obj = heap.alloc(&lock, Value::None);

    {
        let _a = KeptRef::keep(&heap, &lock, &obj);
        let _b = KeptRef::keep(&heap, &lock, &obj);
        assert_eq!(heap.refcount(&lock, &obj), 3);
    }
    assert_eq!(heap.refcount(&lock, &obj), 1);
}

#[test]
fn test_drop_acquires_lock_when_not_held() {
    let heap = ManagedHeap::new();
    let (obj, kept) = {
        let lock = acquire(&*heap).unwrap();
        let obj = heap.alloc(&lock, Value::None);
        (obj, KeptRef::keep(&heap, &lock, &obj))
    };

    // Dropped on a thread that holds nothing
    thread::spawn(move || drop(kept)).join().unwrap();

    let lock = acquire(&*heap).unwrap();
    assert_eq!(heap.refcount(&lock, &obj), 1);
}

#[test]
fn test_drop_after_teardown_leaks_quietly() {
    let heap = ManagedHeap::new();
    let (obj, kept) = {
        let lock = acquire(&*heap).unwrap();
        let obj = heap.alloc(&lock, Value::None);
        (obj, KeptRef::keep(&heap, &lock, &obj))
    };

    heap.begin_finalization();
    drop(kept);

    // Still pinned: nothing touched the object once the runtime was gone
    assert!(heap.is_live(obj));
}

#[test]
fn test_adopt_takes_existing_reference() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let obj = heap.alloc(&lock, Value::None);

    let kept = KeptRef::adopt(&heap, obj);
    assert_eq!(heap.refcount(&lock, &obj), 1);
    kept.release(&lock);
    assert!(!heap.is_live(obj));
}

#[test]
fn test_into_inner_hands_over_reference() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let obj = heap.alloc(&lock, Value::None);

    let kept = KeptRef::keep(&heap, &lock, &obj);
    let raw = kept.into_inner();
    assert_eq!(heap.refcount(&lock, &raw), 2);
    heap.decref(&lock, raw);
    assert_eq!(heap.refcount(&lock, &obj), 1);
}

#[test]
fn test_kept_refs_roles_and_order() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let parent = heap.alloc(&lock, Value::Str("parent".into()));
    let callback = heap.alloc(&lock, Value::Str("callback".into()));

    let mut refs = KeptRefs::new();
    refs.keep(&heap, &lock, "parent", &parent);
    refs.keep_opt(&heap, &lock, "callback", Some(&callback));
    refs.keep_opt(&heap, &lock, "missing", None);

    assert_eq!(refs.len(), 2);
    assert_eq!(refs.get("parent"), Some(&parent));
    assert_eq!(refs.get("callback"), Some(&callback));
    assert_eq!(refs.get("missing"), None);

    refs.release_all(&lock);
    assert!(refs.is_empty());
    assert_eq!(heap.refcount(&lock, &parent), 1);
    assert_eq!(heap.refcount(&lock, &callback), 1);
}

#[test]
fn test_last_pin_collects_object() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let obj = heap.alloc(&lock, Value::None);

    let mut refs = KeptRefs::new();
    refs.keep(&heap, &lock, "obj", &obj);
    heap.decref(&lock, obj);
    assert!(heap.is_live(obj));

    drop(refs);
    assert!(!heap.is_live(obj));
}
