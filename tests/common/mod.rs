//! Shared fixtures for integration tests
#![allow(dead_code)]

use native_bridge::lock::{acquire, LockToken};
use native_bridge::native::{
    Credentials, CredentialsApi, CredentialsFn, CredentialsView, DelegateGetFn, NativeLibrary, NativePtr,
    ShutdownFn, UserData,
};
use native_bridge::{Arg, Bridge, BridgeConfig, ErrorCode, Loopback, ManagedHeap, ManagedRuntime, NativeStack, ObjRef, Value};
use core::ffi::c_void;
use flume::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);
pub const HOST: &str = "example.test";

pub type Call = Vec<Arg<ObjRef>>;

/// Bridge over the managed heap and a loopback library
pub struct World {
    pub heap: Arc<ManagedHeap>,
    pub loopback: Arc<Loopback>,
    pub bridge: Bridge<ManagedHeap>,
}

impl World {
    pub fn new() -> Self {
        Self::with_credentials(None)
    }

    /// Loopback for everything, optionally with another credentials library
    pub fn with_credentials(credentials: Option<Arc<dyn CredentialsApi>>) -> Self {
        let mut config = BridgeConfig::default();
        config.event_loop.threads = 4;
        config.loopback.chunk_size = 8;
        let heap = ManagedHeap::new();
        let loopback = Loopback::new(&config);
        let mut native = NativeStack::from_library(Arc::clone(&loopback));
        if let Some(credentials) = credentials {
            native.credentials = credentials;
        }
        let bridge = Bridge::new(Arc::clone(&heap), native, config).unwrap();
        Self { heap, loopback, bridge }
    }

    pub fn lock(&self) -> LockToken<'_, ManagedHeap> {
        acquire(&*self.heap).unwrap()
    }

    /// Wait for loopback callbacks, lock not held
    pub fn idle(&self) {
        assert!(self.loopback.join_all_threads(WAIT), "native work did not drain");
    }

    pub fn refcount(&self, obj: ObjRef) -> usize {
        let lock = self.lock();
        self.heap.refcount(&lock, &obj)
    }

    pub fn decref(&self, obj: ObjRef) {
        let lock = self.lock();
        self.heap.decref(&lock, obj);
    }

    /// Callable recording its arguments; object arguments are increfed
    pub fn recorder(&self, lock: &LockToken<'_, ManagedHeap>) -> (ObjRef, Receiver<Call>) {
        let (tx, rx) = flume::unbounded();
        let callable = self.heap.alloc_callable(lock, move |lock, args| {
            for arg in &args {
                if let Arg::Object(obj) = arg {
                    lock.runtime().incref(lock, obj);
                }
            }
            let _ = tx.send(args);
            Ok(Value::None)
        });
        (callable, rx)
    }

    /// Delegate returning fixed credentials
    pub fn delegate(&self, lock: &LockToken<'_, ManagedHeap>) -> ObjRef {
        self.heap.alloc_callable(lock, |_, _| {
            Ok(Value::Tuple(vec![Value::from("DELEGATED"), Value::from("s3cret"), Value::None]))
        })
    }
}

pub fn next(rx: &Receiver<Call>) -> Call {
    rx.recv_timeout(WAIT).expect("managed callback did not fire")
}

pub fn int(arg: &Arg<ObjRef>) -> i64 {
    match arg {
        Arg::Value(Value::Int(i)) => *i,
        other => panic!("expected int, got {other:?}"),
    }
}

pub fn value(arg: &Arg<ObjRef>) -> &Value {
    match arg {
        Arg::Value(v) => v,
        other => panic!("expected value, got {other:?}"),
    }
}

pub fn object(arg: &Arg<ObjRef>) -> ObjRef {
    match arg {
        Arg::Object(obj) => *obj,
        other => panic!("expected object, got {other:?}"),
    }
}

// ============================================================================
// Scripted credentials library
// ============================================================================

#[derive(Clone, Copy)]
struct Provider {
    get: Option<DelegateGetFn>,
    on_shutdown: ShutdownFn,
    user_data: UserData,
}

/// Credentials library whose callbacks fire only when the test says so,
/// on the test's own thread
#[derive(Default)]
pub struct Scripted {
    provider: Mutex<Option<Provider>>,
    pending: Mutex<Vec<Option<(CredentialsFn, UserData)>>>,
    pub releases: AtomicUsize,
    /// Constructor fails with this code when set
    pub fail_with: Mutex<Option<ErrorCode>>,
}

unsafe extern "C" fn store(sink: *mut c_void, credentials: *const CredentialsView) {
    *sink.cast::<Option<Credentials>>() = Some(Credentials::from_view(&*credentials));
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().iter().filter(|p| p.is_some()).count()
    }

    /// Complete the `index`th issued fetch
    pub fn complete(&self, index: usize) {
        let (on_complete, user_data) = self.pending.lock()[index].take().expect("fetch already completed");
        let credentials = Credentials::new("SCRIPTED", "secret");
        let view = credentials.view();
        unsafe { on_complete(&view, 0, user_data.0) };
    }

    /// Call the delegate the way a native fetch would
    pub fn call_delegate(&self) -> (i32, Option<Credentials>) {
        let (get, user_data) = {
            let provider = self.provider.lock();
            let provider = provider.as_ref().expect("no provider");
            (provider.get.expect("not a delegate provider"), provider.user_data)
        };
        let mut sink: Option<Credentials> = None;
        let rc = unsafe { get((&mut sink as *mut Option<Credentials>).cast(), store, user_data.0) };
        (rc, sink)
    }

    /// Deliver the provider's shutdown callback. The library does not
    /// guard against repeats, so a second call reaches the adapter again.
    pub fn fire_shutdown(&self) {
        let provider = self.provider.lock().expect("no provider");
        unsafe { (provider.on_shutdown)(0, provider.user_data.0) };
    }

    fn register(&self, get: Option<DelegateGetFn>, on_shutdown: ShutdownFn, user_data: *mut c_void) -> Result<NativePtr, ErrorCode> {
        if let Some(code) = *self.fail_with.lock() {
            return Err(code);
        }
        *self.provider.lock() = Some(Provider {
            get,
            on_shutdown,
            user_data: UserData(user_data),
        });
        Ok(NativePtr::dangling())
    }
}

impl CredentialsApi for Scripted {
    fn new_static_provider(
        &self,
        _credentials: &Credentials,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<NativePtr, ErrorCode> {
        self.register(None, on_shutdown, user_data)
    }

    fn new_delegate_provider(
        &self,
        get: DelegateGetFn,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<NativePtr, ErrorCode> {
        self.register(Some(get), on_shutdown, user_data)
    }

    fn get_credentials(&self, _provider: NativePtr, on_complete: CredentialsFn, user_data: *mut c_void) -> Result<(), ErrorCode> {
        self.pending.lock().push(Some((on_complete, UserData(user_data))));
        Ok(())
    }

    fn release_provider(&self, _provider: NativePtr) -> Result<(), ErrorCode> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
