use super::*;
use crate::lock::acquire;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

unsafe fn count_finalize(ptr: NonNull<c_void>) {
    drop(Box::from_raw(ptr.as_ptr().cast::<u32>()));
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

const NAME: &CStr = c"native_bridge.runtime_test";
const OTHER: &CStr = c"native_bridge.other";

#[test]
fn test_value_accessors() {
    let map = Value::Map(vec![("a".into(), Value::Int(1)), ("b".into(), Value::from("x"))]);
    assert_eq!(map.get("a").and_then(Value::as_int), Some(1));
    assert_eq!(map.get("b").and_then(Value::as_str), Some("x"));
    assert_eq!(map.get("c"), None);
    assert_eq!(Value::from(None::<String>), Value::None);
    assert_eq!(Value::from(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
    assert_eq!(Value::Tuple(vec![]).type_name(), "tuple");
}

#[test]
fn test_refcount_collects_at_zero() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let obj = heap.alloc(&lock, Value::from("payload"));

    heap.incref(&lock, &obj);
    assert_eq!(heap.refcount(&lock, &obj), 2);
    heap.decref(&lock, obj);
    assert!(heap.is_live(obj));
    heap.decref(&lock, obj);
    assert!(!heap.is_live(obj));
    assert_eq!(heap.refcount(&lock, &obj), 0);
}

#[test]
fn test_capsule_finalizer_runs_once() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let before = FINALIZED.load(Ordering::SeqCst);
    let pointer = NonNull::from(Box::leak(Box::new(7u32))).cast();

    let capsule = heap.new_capsule(&lock, NAME, pointer, count_finalize).unwrap();
    assert_eq!(heap.capsule_pointer(&lock, &capsule, NAME), Some(pointer));
    assert_eq!(heap.capsule_pointer(&lock, &capsule, OTHER), None);

    heap.incref(&lock, &capsule);
    heap.decref(&lock, capsule);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), before);
    heap.decref(&lock, capsule);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), before + 1);
    assert_eq!(heap.finalized_capsules(), 1);
    assert_eq!(heap.capsule_pointer(&lock, &capsule, NAME), None);
}

#[test]
fn test_call_passes_arguments() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let data = heap.alloc(&lock, Value::Int(40));
    let add = heap.alloc_callable(&lock, |lock, args| {
        let base = match &args[0] {
            Arg::Object(obj) => lock.runtime().value(lock, *obj).and_then(|v| v.as_int()).unwrap_or(0),
            Arg::Value(_) => 0,
        };
        let delta = match &args[1] {
            Arg::Value(v) => v.as_int().unwrap_or(0),
            Arg::Object(_) => 0,
        };
        Ok(Value::Int(base + delta))
    });

    let out = heap.call(&lock, &add, vec![Arg::Object(data), Arg::value(2i64)]).unwrap();
    assert_eq!(out, Value::Int(42));
    assert_eq!(heap.call_count(), 1);
}

#[test]
fn test_call_errors() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    let data = heap.alloc(&lock, Value::None);
    assert_eq!(heap.call(&lock, &data, vec![]).unwrap_err().kind, "TypeError");

    let raises = heap.alloc_callable(&lock, |_, _| Err(ManagedError::new("KeyError", "missing")));
    let err = heap.call(&lock, &raises, vec![]).unwrap_err();
    assert_eq!(err.to_string(), "KeyError: missing");

    heap.decref(&lock, raises);
    assert_eq!(heap.call(&lock, &raises, vec![]).unwrap_err().kind, "ReferenceError");
}

#[test]
fn test_unraisable_sink_records() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    heap.report_unraisable(&lock, &ManagedError::type_error("bad"), "somewhere");

    let records = heap.unraisable();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].origin, "somewhere");
    assert_eq!(records[0].error, ManagedError::type_error("bad"));
}

#[test]
fn test_finalization_keeps_current_holder() {
    let heap = ManagedHeap::new();
    let lock = acquire(&*heap).unwrap();
    heap.begin_finalization();
    assert!(heap.is_finalizing());
    // The holder can still finish its work
    let obj = heap.alloc(&lock, Value::None);
    heap.decref(&lock, obj);
    drop(lock);

    let other = {
        let heap = Arc::clone(&heap);
        std::thread::spawn(move || acquire(&*heap).is_err())
    };
    assert!(other.join().unwrap());
}
