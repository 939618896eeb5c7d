//! Tests for bindings, handles and the two-phase release protocol

use super::*;
use crate::error::{BridgeError, FatalViolation};
use std::panic::{self, AssertUnwindSafe};
use crate::lock::acquire;
use crate::runtime::{ManagedHeap, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Native side double: counts release calls, optionally fails them
#[derive(Default)]
struct FakeNative {
    releases: AtomicUsize,
    fail_release: AtomicBool,
}

/// Counts how many times binding memory is freed
struct FreeCounter(Arc<AtomicUsize>);

impl Drop for FreeCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestKind;

impl ResourceKind for TestKind {
    const NAME: &'static CStr = c"native_bridge.test";
    const LABEL: &'static str = "test";

    type Api = FakeNative;
    type Extra = FreeCounter;

    fn release_native(api: &FakeNative, _native: NativePtr) -> Result<(), ErrorCode> {
        api.releases.fetch_add(1, Ordering::SeqCst);
        if api.fail_release.load(Ordering::SeqCst) {
            Err(ErrorCode::UNKNOWN)
        } else {
            Ok(())
        }
    }
}

struct OtherKind;

impl ResourceKind for OtherKind {
    const NAME: &'static CStr = c"native_bridge.other";
    const LABEL: &'static str = "other";

    type Api = FakeNative;
    type Extra = ();

    fn release_native(_api: &FakeNative, _native: NativePtr) -> Result<(), ErrorCode> {
        Ok(())
    }
}

struct Fixture {
    heap: Arc<ManagedHeap>,
    api: Arc<FakeNative>,
    frees: Arc<AtomicUsize>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            heap: ManagedHeap::new(),
            api: Arc::new(FakeNative::default()),
            frees: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn binding(&self) -> BindingPtr<ManagedHeap, TestKind> {
        Binding::<ManagedHeap, TestKind>::new(
            &self.heap,
            Arc::clone(&self.api),
            FreeCounter(Arc::clone(&self.frees)),
        )
        .into_ptr()
    }

    fn active(&self) -> (BindingPtr<ManagedHeap, TestKind>, Handle<ManagedHeap, TestKind>) {
        let ptr = self.binding();
        let handle = unsafe { ptr.activate(NativePtr::dangling()) };
        (ptr, handle)
    }

    fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

#[test]
fn test_transition_table() {
    use Phase::*;
    use Signal::*;

    assert_eq!(Constructing.on(Constructed), Ok(Active));
    assert_eq!(Constructing.on(ConstructionFailed), Ok(Failed));
    assert_eq!(Active.on(Release), Ok(AwaitingShutdown));
    assert_eq!(Active.on(Shutdown), Ok(AwaitingRelease));
    assert_eq!(AwaitingShutdown.on(Shutdown), Ok(Terminated));
    assert_eq!(AwaitingRelease.on(Release), Ok(Terminated));

    assert!(AwaitingShutdown.on(Release).is_err());
    assert!(AwaitingRelease.on(Shutdown).is_err());
    assert!(Constructing.on(Shutdown).is_err());
    assert!(Active.on(Constructed).is_err());
    for signal in [Constructed, ConstructionFailed, Release, Shutdown] {
        assert!(Terminated.on(signal).is_err());
        assert!(Failed.on(signal).is_err());
    }
}

#[test]
fn test_phase_flags() {
    assert!(Phase::AwaitingShutdown.release_called());
    assert!(!Phase::AwaitingShutdown.shutdown_called());
    assert!(Phase::AwaitingRelease.shutdown_called());
    assert!(Phase::Terminated.release_called() && Phase::Terminated.shutdown_called());
    assert!(Phase::Failed.is_terminal());
    assert!(!Phase::Active.is_terminal());
}

#[test]
fn test_release_then_shutdown_frees_once() {
    let fx = Fixture::new();
    let (ptr, handle) = fx.active();
    assert_eq!(handle.binding().phase(), Phase::Active);

    handle.release();
    assert_eq!(fx.api.releases.load(Ordering::SeqCst), 1);
    assert_eq!(unsafe { ptr.get() }.phase(), Phase::AwaitingShutdown);
    assert_eq!(fx.frees(), 0);

    unsafe { ptr.signal_shutdown() };
    assert_eq!(fx.frees(), 1);
}

#[test]
fn test_shutdown_then_release_frees_once() {
    let fx = Fixture::new();
    let (ptr, handle) = fx.active();

    // Remote close: native side finishes first
    unsafe { ptr.signal_shutdown() };
    assert_eq!(handle.binding().phase(), Phase::AwaitingRelease);
    assert_eq!(fx.frees(), 0);

    drop(handle);
    assert_eq!(fx.frees(), 1);
    assert_eq!(fx.api.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_kept_refs_survive_until_second_signal() {
    let fx = Fixture::new();
    let (ptr, handle) = fx.active();

    let obj = {
        let lock = acquire(&*fx.heap).unwrap();
        let obj = fx.heap.alloc(&lock, Value::Str("parent".into()));
        handle.binding().keep(&lock, "parent", &obj);
        fx.heap.decref(&lock, obj);
        obj
    };

    unsafe { ptr.signal_shutdown() };
    assert!(fx.heap.is_live(obj), "kept ref dropped before release");

    drop(handle);
    assert!(!fx.heap.is_live(obj));
}

#[test]
fn test_failed_construction_frees_synchronously() {
    let fx = Fixture::new();
    let ptr = fx.binding();

    let obj = {
        let lock = acquire(&*fx.heap).unwrap();
        let obj = fx.heap.alloc(&lock, Value::None);
        unsafe { ptr.get() }.keep(&lock, "callback", &obj);
        assert_eq!(fx.heap.refcount(&lock, &obj), 2);
        obj
    };

    unsafe { ptr.fail_construction(ErrorCode::CONNECTION_REFUSED) };
    assert_eq!(fx.frees(), 1);
    assert_eq!(fx.api.releases.load(Ordering::SeqCst), 0);

    let lock = acquire(&*fx.heap).unwrap();
    assert_eq!(fx.heap.refcount(&lock, &obj), 1);
}

#[test]
fn test_failed_native_release_counts_as_shutdown() {
    let fx = Fixture::new();
    fx.api.fail_release.store(true, Ordering::SeqCst);
    let (_ptr, handle) = fx.active();

    handle.release();
    assert_eq!(fx.frees(), 1);
}

#[test]
fn test_native_pointer_cleared_on_release() {
    let fx = Fixture::new();
    let (ptr, handle) = fx.active();
    assert_eq!(handle.native(), NativePtr::dangling());
    assert_eq!(unsafe { ptr.get() }.native(), Some(handle.native()));

    drop(handle);
    assert!(unsafe { ptr.get() }.native().is_none());
    unsafe { ptr.signal_shutdown() };
}

#[test]
fn test_concurrent_signals_free_exactly_once() {
    for _ in 0..200 {
        let fx = Fixture::new();
        let (ptr, handle) = fx.active();

        let native = thread::spawn(move || unsafe { ptr.signal_shutdown() });
        let managed = thread::spawn(move || drop(handle));
        native.join().unwrap();
        managed.join().unwrap();

        assert_eq!(fx.frees(), 1);
    }
}

/// Run `f`, which must unwind with a protocol violation
fn violation_of(f: impl FnOnce()) -> FatalViolation {
    let payload = panic::catch_unwind(AssertUnwindSafe(f)).expect_err("protocol violation expected");
    *payload.downcast::<FatalViolation>().expect("violation payload")
}

#[test]
fn test_double_shutdown_is_fatal() {
    let fx = Fixture::new();
    let (ptr, handle) = fx.active();
    std::mem::forget(handle);

    unsafe { ptr.signal_shutdown() };
    let violation = violation_of(|| unsafe { ptr.signal_shutdown() });
    assert!(violation.detail.starts_with("test: "));
    assert!(violation.detail.contains("Shutdown"));
}

#[test]
fn test_shutdown_during_construction_is_fatal() {
    let fx = Fixture::new();
    let ptr = fx.binding();
    let violation = violation_of(|| unsafe { ptr.signal_shutdown() });
    assert!(violation.detail.contains("Constructing"));
}

#[test]
fn test_capsule_finalizer_releases() {
    let fx = Fixture::new();
    let (ptr, handle) = fx.active();

    let lock = acquire(&*fx.heap).unwrap();
    let capsule = handle.into_capsule(&lock).unwrap();

    let borrowed = Handle::<ManagedHeap, TestKind>::from_capsule(&lock, &capsule).unwrap();
    assert_eq!(borrowed.user_data(), ptr.as_user_data());
    assert_eq!(fx.api.releases.load(Ordering::SeqCst), 0);

    // Last reference: the heap runs the capsule destructor on this thread
    fx.heap.decref(&lock, capsule);
    assert_eq!(fx.heap.finalized_capsules(), 1);
    assert_eq!(fx.api.releases.load(Ordering::SeqCst), 1);
    drop(lock);

    unsafe { ptr.signal_shutdown() };
    assert_eq!(fx.frees(), 1);
}

#[test]
fn test_from_capsule_rejects_other_kinds() {
    let fx = Fixture::new();
    let (ptr, handle) = fx.active();

    let lock = acquire(&*fx.heap).unwrap();
    let capsule = handle.into_capsule(&lock).unwrap();
    let plain = fx.heap.alloc(&lock, Value::Int(3));

    let err = Handle::<ManagedHeap, OtherKind>::from_capsule(&lock, &capsule).unwrap_err();
    assert_eq!(err, BridgeError::WrongHandle { expected: "other" });
    assert!(Handle::<ManagedHeap, TestKind>::from_capsule(&lock, &plain).is_err());

    fx.heap.decref(&lock, capsule);
    drop(lock);
    unsafe { ptr.signal_shutdown() };
}

#[test]
fn test_stats_track_outcomes() {
    let before = stats();
    let fx = Fixture::new();

    let failed = fx.binding();
    unsafe { failed.fail_construction(ErrorCode::UNKNOWN) };

    let (ptr, handle) = fx.active();
    drop(handle);
    unsafe { ptr.signal_shutdown() };

    let after = stats();
    assert!(after.created >= before.created + 2);
    assert!(after.failed > before.failed);
    assert!(after.terminated > before.terminated);
}
