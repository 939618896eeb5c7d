//! In-process managed heap
//!
//! A small reference-counted object space with a global lock, closures as
//! callables, and capsules with finalizers. It behaves like an embedded
//! interpreter as far as the bridge can observe:
//! - one thread at a time holds the lock (re-entry is not supported)
//! - a capsule's finalizer runs on whichever thread drops its last reference
//! - `begin_finalization` makes every later acquire report `Unavailable`

use super::{Arg, CapsuleDestructor, ManagedRuntime, Value};
use crate::error::{ManagedError, Unavailable};
use crate::lock::LockToken;
use crate::logging::{debug, trace, warn};
use core::ffi::c_void;
use core::ptr::NonNull;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::ffi::CStr;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Reference to an object on a `ManagedHeap`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u64);

impl ObjRef {
    #[inline]
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef(#{})", self.0)
    }
}

/// Closure exposed to the bridge as a managed callable
pub type HeapFn =
    dyn Fn(&LockToken<'_, ManagedHeap>, Vec<Arg<ObjRef>>) -> Result<Value, ManagedError> + Send + Sync;

struct CapsulePtr(NonNull<c_void>);

// Safety: the pointer is only handed back under the heap lock, and the
// destructor runs once, when the slot is removed
unsafe impl Send for CapsulePtr {}
unsafe impl Sync for CapsulePtr {}

enum Payload {
    Data(Value),
    Callable(Arc<HeapFn>),
    Capsule {
        name: &'static CStr,
        pointer: CapsulePtr,
        destructor: CapsuleDestructor,
    },
}

struct Slot {
    refcount: usize,
    payload: Payload,
}

/// An error passed to the unraisable sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnraisableRecord {
    pub origin: String,
    pub error: ManagedError,
}

pub struct ManagedHeap {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
    finalizing: AtomicBool,
    objects: DashMap<u64, Slot>,
    next_id: AtomicU64,
    unraisable: Mutex<Vec<UnraisableRecord>>,
    calls: AtomicUsize,
    finalized_capsules: AtomicUsize,
}

impl ManagedHeap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            finalizing: AtomicBool::new(false),
            objects: DashMap::with_capacity(64),
            next_id: AtomicU64::new(1),
            unraisable: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            finalized_capsules: AtomicUsize::new(0),
        })
    }

    /// Simulate interpreter teardown: every later acquire is `Unavailable`.
    ///
    /// A thread currently holding the lock keeps it until it releases.
    pub fn begin_finalization(&self) {
        self.finalizing.store(true, Ordering::SeqCst);
        debug!(event = "heap_finalizing", live_objects = self.objects.len());
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::SeqCst)
    }

    /// Allocate a data object (new reference)
    pub fn alloc(&self, _lock: &LockToken<'_, Self>, value: Value) -> ObjRef {
        self.insert(Payload::Data(value))
    }

    /// Allocate a callable object (new reference)
    pub fn alloc_callable<F>(&self, _lock: &LockToken<'_, Self>, f: F) -> ObjRef
    where
        F: Fn(&LockToken<'_, ManagedHeap>, Vec<Arg<ObjRef>>) -> Result<Value, ManagedError>
            + Send
            + Sync
            + 'static,
    {
        self.insert(Payload::Callable(Arc::new(f)))
    }

    /// Copy of the data stored in a data object
    pub fn value(&self, _lock: &LockToken<'_, Self>, obj: ObjRef) -> Option<Value> {
        self.objects.get(&obj.0).and_then(|slot| match &slot.payload {
            Payload::Data(v) => Some(v.clone()),
            _ => None,
        })
    }

    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.objects.contains_key(&obj.0)
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    /// Number of managed calls made through the bridge
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn finalized_capsules(&self) -> usize {
        self.finalized_capsules.load(Ordering::Relaxed)
    }

    /// Errors reported to the unraisable sink so far
    pub fn unraisable(&self) -> Vec<UnraisableRecord> {
        self.unraisable.lock().clone()
    }

    fn insert(&self, payload: Payload) -> ObjRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(
            id,
            Slot {
                refcount: 1,
                payload,
            },
        );
        trace!(event = "heap_alloc", id);
        ObjRef(id)
    }

    fn take_lock(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(me);
    }

    fn drop_lock(&self) {
        let mut owner = self.owner.lock();
        debug_assert_eq!(*owner, Some(thread::current().id()), "heap lock released by non-owner");
        *owner = None;
        drop(owner);
        self.released.notify_one();
    }
}

impl fmt::Debug for ManagedHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHeap")
            .field("live_objects", &self.objects.len())
            .field("finalizing", &self.is_finalizing())
            .finish()
    }
}

impl ManagedRuntime for ManagedHeap {
    type Object = ObjRef;
    type LockState = ();
    type Suspended = ();

    fn try_acquire(&self) -> Result<(), Unavailable> {
        if self.is_finalizing() {
            return Err(Unavailable);
        }
        self.take_lock();

        // Teardown may have begun while we waited
        if self.is_finalizing() {
            self.drop_lock();
            return Err(Unavailable);
        }
        Ok(())
    }

    fn release(&self, _state: ()) {
        self.drop_lock();
    }

    fn held_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    fn suspend(&self) {
        self.drop_lock();
    }

    fn resume(&self, _suspended: ()) {
        self.take_lock();
    }

    fn incref(&self, _lock: &LockToken<'_, Self>, obj: &ObjRef) {
        match self.objects.get_mut(&obj.0) {
            Some(mut slot) => {
                slot.refcount += 1;
            }
            None => warn!(event = "heap_incref_dead", id = obj.0, "incref of a collected object"),
        }
    }

    fn decref(&self, _lock: &LockToken<'_, Self>, obj: ObjRef) {
        let collect = match self.objects.get_mut(&obj.0) {
            Some(mut slot) => {
                debug_assert!(slot.refcount > 0, "refcount underflow");
                slot.refcount -= 1;
                slot.refcount == 0
            }
            None => {
                warn!(event = "heap_decref_dead", id = obj.0, "decref of a collected object");
                false
            }
        };

        if !collect {
            return;
        }

        // Slot guard is released before the finalizer runs; finalizers decref
        // other objects on this same thread
        if let Some((_, slot)) = self.objects.remove(&obj.0) {
            trace!(event = "heap_collect", id = obj.0);
            if let Payload::Capsule {
                pointer,
                destructor,
                ..
            } = slot.payload
            {
                self.finalized_capsules.fetch_add(1, Ordering::Relaxed);
                // Safety: the pointer was registered together with this
                // destructor and the slot is gone, so this runs exactly once
                unsafe { destructor(pointer.0) };
            }
        }
    }

    fn refcount(&self, _lock: &LockToken<'_, Self>, obj: &ObjRef) -> usize {
        self.objects.get(&obj.0).map_or(0, |slot| slot.refcount)
    }

    fn call(
        &self,
        lock: &LockToken<'_, Self>,
        callable: &ObjRef,
        args: Vec<Arg<ObjRef>>,
    ) -> Result<Value, ManagedError> {
        let f = match self.objects.get(&callable.0).map(|slot| match &slot.payload {
            Payload::Callable(f) => Some(Arc::clone(f)),
            _ => None,
        }) {
            Some(Some(f)) => f,
            Some(None) => return Err(ManagedError::type_error("object is not callable")),
            None => return Err(ManagedError::new("ReferenceError", "callable was collected")),
        };

        self.calls.fetch_add(1, Ordering::Relaxed);
        f(lock, args)
    }

    fn report_unraisable(&self, _lock: &LockToken<'_, Self>, err: &ManagedError, origin: &str) {
        warn!(event = "unraisable", origin, error = %err, "exception ignored in native callback");
        self.unraisable.lock().push(UnraisableRecord {
            origin: origin.to_owned(),
            error: err.clone(),
        });
    }

    fn new_capsule(
        &self,
        _lock: &LockToken<'_, Self>,
        name: &'static CStr,
        pointer: NonNull<c_void>,
        destructor: CapsuleDestructor,
    ) -> Result<ObjRef, ManagedError> {
        Ok(self.insert(Payload::Capsule {
            name,
            pointer: CapsulePtr(pointer),
            destructor,
        }))
    }

    fn capsule_pointer(
        &self,
        _lock: &LockToken<'_, Self>,
        obj: &ObjRef,
        name: &'static CStr,
    ) -> Option<NonNull<c_void>> {
        self.objects.get(&obj.0).and_then(|slot| match &slot.payload {
            Payload::Capsule {
                name: capsule_name,
                pointer,
                ..
            } if *capsule_name == name => Some(pointer.0),
            _ => None,
        })
    }
}
