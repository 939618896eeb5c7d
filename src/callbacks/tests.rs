//! Tests for the adapter shape

use super::*;
use crate::runtime::{ManagedHeap, ObjRef};
use std::sync::atomic::AtomicBool;
use std::thread;

fn failing(heap: &ManagedHeap, lock: &LockToken<'_, ManagedHeap>) -> ObjRef {
    heap.alloc_callable(lock, |_, _| Err(ManagedError::new("ValueError", "boom")))
}

#[test]
fn test_enter_runs_under_lock() {
    let heap = ManagedHeap::new();
    let out = thread::spawn({
        let heap = Arc::clone(&heap);
        move || enter(&*heap, "test", -1, |lock| {
            assert!(lock.is_owned());
            assert!(lock.runtime().held_by_current_thread());
            7
        })
    })
    .join()
    .unwrap();

    assert_eq!(out, 7);
    assert!(!heap.held_by_current_thread());
}

#[test]
fn test_enter_unavailable_skips_body() {
    let heap = ManagedHeap::new();
    heap.begin_finalization();

    let touched = AtomicBool::new(false);
    let out = enter(&*heap, "test", 0, |_| {
        touched.store(true, Ordering::SeqCst);
        1
    });

    assert_eq!(out, 0);
    assert!(!touched.load(Ordering::SeqCst));
}

#[test]
fn test_enter_contains_panics_and_releases_lock() {
    let heap = ManagedHeap::new();
    let out: i32 = enter(&*heap, "test", 42, |_| panic!("adapter bug"));

    assert_eq!(out, 42);
    assert!(!heap.held_by_current_thread());
    assert!(lock::acquire(&*heap).is_ok());
}

#[test]
fn test_invoke_passes_arguments() {
    let heap = ManagedHeap::new();
    let lock = lock::acquire(&*heap).unwrap();
    let echo = heap.alloc_callable(&lock, |_, args| {
        let mut out = Vec::new();
        for arg in args {
            match arg {
                Arg::Value(v) => out.push(v),
                Arg::Object(o) => out.push(Value::Int(o.id() as i64)),
            }
        }
        Ok(Value::Tuple(out))
    });

    let result = invoke(&lock, &echo, vec![Arg::value(3), Arg::value("x")], "test").unwrap();
    assert_eq!(result, Value::Tuple(vec![Value::Int(3), Value::Str("x".into())]));
}

#[test]
fn test_invoke_error_becomes_code_and_unraisable() {
    let heap = ManagedHeap::new();
    let lock = lock::acquire(&*heap).unwrap();
    let callable = failing(&heap, &lock);

    let err = invoke(&lock, &callable, vec![], "stream.on_body").unwrap_err();
    assert_eq!(err, ErrorCode::CALLBACK_FAILURE);

    let sink = heap.unraisable();
    assert_eq!(sink.len(), 1);
    assert_eq!(sink[0].origin, "stream.on_body");
    assert_eq!(sink[0].error.kind, "ValueError");
}

#[test]
fn test_invoke_non_callable() {
    let heap = ManagedHeap::new();
    let lock = lock::acquire(&*heap).unwrap();
    let data = heap.alloc(&lock, Value::Int(1));

    assert_eq!(invoke(&lock, &data, vec![], "test"), Err(ErrorCode::CALLBACK_FAILURE));
    assert_eq!(heap.unraisable()[0].error.kind, "TypeError");
}

#[test]
fn test_call_context_round_trip() {
    let heap = ManagedHeap::new();
    let lock = lock::acquire(&*heap).unwrap();
    let callback = heap.alloc(&lock, Value::None);

    let mut ctx = CallContext::<ManagedHeap, u32>::new(&heap, 9);
    ctx.keep(&lock, "on_complete", &callback);
    assert_eq!(heap.refcount(&lock, &callback), 2);

    let user_data = ctx.into_user_data();
    let ctx = unsafe { CallContext::<ManagedHeap, u32>::reclaim(user_data) }.unwrap();
    assert_eq!(*ctx.extra(), 9);
    assert_eq!(ctx.get("on_complete"), Some(&callback));

    ctx.complete(&lock);
    assert_eq!(heap.refcount(&lock, &callback), 1);
}

#[test]
fn test_reclaim_null() {
    assert!(unsafe { CallContext::<ManagedHeap>::reclaim(core::ptr::null_mut()) }.is_none());
}

#[test]
fn test_abandoned_context_releases_on_drop() {
    let heap = ManagedHeap::new();
    let (callback, user_data) = {
        let lock = lock::acquire(&*heap).unwrap();
        let callback = heap.alloc(&lock, Value::None);
        let mut ctx = CallContext::<ManagedHeap>::new(&heap, ());
        ctx.keep(&lock, "on_complete", &callback);
        (callback, ctx.into_user_data() as usize)
    };

    // Completion arrives on a thread without the lock
    thread::spawn(move || drop(unsafe { CallContext::<ManagedHeap>::reclaim(user_data as *mut c_void) }))
        .join()
        .unwrap();

    let lock = lock::acquire(&*heap).unwrap();
    assert_eq!(heap.refcount(&lock, &callback), 1);
}
