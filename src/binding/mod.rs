//! Binding - one native resource paired with the managed references it pins
//!
//! Design: a `Binding` is boxed once and its address is shared:
//! - the managed side owns it through a `Handle` (finalizer = release)
//! - the native side receives the same address as callback `user_data`
//!
//! Memory is reclaimed by whichever of the two signals (managed release,
//! native shutdown) arrives second, as decided by `AtomicPhase`. When the
//! native constructor fails, no shutdown will ever be delivered and the
//! binding is freed on the spot.

mod handle;
mod phase;

#[cfg(test)]
mod tests;

pub use handle::Handle;
pub use phase::{AtomicPhase, Phase, ProtocolViolation, Signal};

use crate::error::{ErrorCode, FatalViolation};
use crate::lock::LockToken;
use crate::logging::{log_binding_freed, log_construction_failed, log_transition, warn};
use crate::native::NativePtr;
use crate::refs::KeptRefs;
use crate::runtime::ManagedRuntime;
use core::ffi::c_void;
use core::ptr::NonNull;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Static description of one bridged resource type
pub trait ResourceKind: Send + Sync + Sized + 'static {
    /// Capsule name; also the type check when borrowing a handle back
    const NAME: &'static CStr;
    /// Short label for logs and errors
    const LABEL: &'static str;

    /// Native API the resource is created through
    type Api: ?Sized + Send + Sync + 'static;
    /// Per-binding data that never touches managed objects
    type Extra: Send + Sync + 'static;

    /// Begin native shutdown. Called at most once per native object.
    fn release_native(api: &Self::Api, native: NativePtr) -> Result<(), ErrorCode>;
}

/// Process-wide binding counters
static STATS: Lazy<StatsCell> = Lazy::new(StatsCell::default);

#[derive(Default)]
struct StatsCell {
    created: AtomicUsize,
    terminated: AtomicUsize,
    failed: AtomicUsize,
}

/// Binding statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingStats {
    pub created: usize,
    pub terminated: usize,
    pub failed: usize,
    /// Allocated and not yet freed
    pub live: usize,
}

/// Snapshot of binding counters
pub fn stats() -> BindingStats {
    let created = STATS.created.load(Ordering::Relaxed);
    let terminated = STATS.terminated.load(Ordering::Relaxed);
    let failed = STATS.failed.load(Ordering::Relaxed);
    BindingStats {
        created,
        terminated,
        failed,
        live: created.saturating_sub(terminated + failed),
    }
}

pub struct Binding<R: ManagedRuntime, K: ResourceKind> {
    runtime: Arc<R>,
    api: Arc<K::Api>,
    /// Set while the native object is alive and not yet released
    native: Mutex<Option<NativePtr>>,
    kept: Mutex<KeptRefs<R>>,
    phase: AtomicPhase,
    extra: K::Extra,
}

impl<R: ManagedRuntime, K: ResourceKind> Binding<R, K> {
    /// Allocate a binding in the `Constructing` phase
    pub fn new(runtime: &Arc<R>, api: Arc<K::Api>, extra: K::Extra) -> Box<Self> {
        STATS.created.fetch_add(1, Ordering::Relaxed);
        Box::new(Self {
            runtime: Arc::clone(runtime),
            api,
            native: Mutex::new(None),
            kept: Mutex::new(KeptRefs::new()),
            phase: AtomicPhase::new(),
            extra,
        })
    }

    /// Pin `obj` for the lifetime of this binding
    pub fn keep(&self, lock: &LockToken<'_, R>, role: &'static str, obj: &R::Object) {
        self.kept.lock().keep(&self.runtime, lock, role, obj);
    }

    pub fn keep_opt(&self, lock: &LockToken<'_, R>, role: &'static str, obj: Option<&R::Object>) {
        self.kept.lock().keep_opt(&self.runtime, lock, role, obj);
    }

    /// Object pinned under `role`; stays valid while the binding lives
    pub fn kept(&self, _lock: &LockToken<'_, R>, role: &str) -> Option<R::Object> {
        self.kept.lock().get(role).cloned()
    }

    pub fn kept_len(&self) -> usize {
        self.kept.lock().len()
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    #[inline]
    pub fn api(&self) -> &Arc<K::Api> {
        &self.api
    }

    #[inline]
    pub fn extra(&self) -> &K::Extra {
        &self.extra
    }

    /// Native pointer, while the native object is alive and unreleased
    #[inline]
    pub fn native(&self) -> Option<NativePtr> {
        *self.native.lock()
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase.load()
    }

    /// Hand the binding over to raw-pointer ownership
    pub fn into_ptr(self: Box<Self>) -> BindingPtr<R, K> {
        BindingPtr {
            ptr: NonNull::from(Box::leak(self)),
            _kind: PhantomData,
        }
    }
}

impl<R: ManagedRuntime, K: ResourceKind> fmt::Debug for Binding<R, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("kind", &K::LABEL)
            .field("phase", &self.phase())
            .field("native", &self.native())
            .field("kept", &self.kept_len())
            .finish()
    }
}

/// Raw, shared address of a boxed binding.
///
/// Valid from `into_ptr` until the transition into a terminal phase.
pub struct BindingPtr<R: ManagedRuntime, K: ResourceKind> {
    ptr: NonNull<Binding<R, K>>,
    _kind: PhantomData<K>,
}

impl<R: ManagedRuntime, K: ResourceKind> Clone for BindingPtr<R, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: ManagedRuntime, K: ResourceKind> Copy for BindingPtr<R, K> {}

// Safety: Binding itself is Send + Sync; the pointer is shared exactly the
// way a reference would be, with lifetime governed by the phase machine
unsafe impl<R: ManagedRuntime, K: ResourceKind> Send for BindingPtr<R, K> {}
unsafe impl<R: ManagedRuntime, K: ResourceKind> Sync for BindingPtr<R, K> {}

impl<R: ManagedRuntime, K: ResourceKind> fmt::Debug for BindingPtr<R, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BindingPtr<{}>({:p})", K::LABEL, self.ptr)
    }
}

impl<R: ManagedRuntime, K: ResourceKind> BindingPtr<R, K> {
    /// `user_data` for native callbacks
    #[inline]
    pub fn as_user_data(self) -> *mut c_void {
        self.ptr.as_ptr().cast()
    }

    /// Rebuild from callback `user_data`
    ///
    /// # Safety
    /// `user_data` must come from `as_user_data` of the same `R`/`K` pair.
    #[inline]
    pub unsafe fn from_user_data(user_data: *mut c_void) -> Option<Self> {
        NonNull::new(user_data.cast()).map(|ptr| Self {
            ptr,
            _kind: PhantomData,
        })
    }

    /// Borrow the binding.
    ///
    /// # Safety
    /// The binding must not have reached a terminal phase.
    #[inline]
    pub unsafe fn get<'a>(self) -> &'a Binding<R, K> {
        self.ptr.as_ref()
    }

    #[inline]
    fn addr(self) -> *const () {
        self.ptr.as_ptr() as *const ()
    }

    /// Native constructor succeeded: store the pointer and create the handle
    ///
    /// # Safety
    /// Binding must be in `Constructing`.
    pub unsafe fn activate(self, native: NativePtr) -> Handle<R, K> {
        *self.get().native.lock() = Some(native);
        self.transition(Signal::Constructed);
        Handle::from_ptr(self, native)
    }

    /// Native constructor failed: free everything now.
    ///
    /// # Safety
    /// Binding must be in `Constructing`; the pointer is dangling afterwards.
    pub unsafe fn fail_construction(self, code: ErrorCode) {
        log_construction_failed(K::LABEL, code);
        let to = self.transition(Signal::ConstructionFailed);
        debug_assert_eq!(to, Phase::Failed);
        self.destroy(to);
    }

    /// Native shutdown completed. Frees the binding if release already happened.
    ///
    /// # Safety
    /// Called at most once, from the native shutdown path, before the binding
    /// is freed. The pointer may be dangling afterwards.
    pub unsafe fn signal_shutdown(self) {
        let to = self.transition(Signal::Shutdown);
        if to.is_terminal() {
            self.destroy(to);
        }
    }

    /// Managed release (handle finalizer). Issues the native release first,
    /// so a racing shutdown callback can never free the binding under us.
    pub(crate) unsafe fn signal_release(self) {
        let binding = self.get();
        let native = binding.native.lock().take();

        let mut release_failed = false;
        if let Some(native) = native {
            if let Err(code) = K::release_native(&binding.api, native) {
                warn!(
                    event = "native_release_failed",
                    kind = K::LABEL,
                    code = code.0,
                    "Native release failed; treating as shutdown complete"
                );
                release_failed = true;
            }
        }

        let mut to = self.transition(Signal::Release);
        if release_failed && to == Phase::AwaitingShutdown {
            // A failed release never delivers its shutdown callback
            to = self.transition(Signal::Shutdown);
        }
        if to.is_terminal() {
            self.destroy(to);
        }
    }

    /// Apply one signal. The binding may be freed by another thread as soon
    /// as this returns a non-terminal phase, so nothing here touches it after
    /// the CAS.
    unsafe fn transition(self, signal: Signal) -> Phase {
        match self.get().phase.apply(signal) {
            Ok((from, to)) => {
                log_transition(K::LABEL, self.addr(), from.as_str(), to.as_str(), signal_name(signal));
                to
            }
            Err(violation) => protocol_violation::<K>(violation),
        }
    }

    unsafe fn destroy(self, terminal: Phase) {
        let binding = Box::from_raw(self.ptr.as_ptr());
        log_binding_freed(K::LABEL, self.addr(), binding.kept_len());
        match terminal {
            Phase::Failed => STATS.failed.fetch_add(1, Ordering::Relaxed),
            _ => STATS.terminated.fetch_add(1, Ordering::Relaxed),
        };
        // Kept references are released here, under the caller's lock when held
        drop(binding);
    }
}

fn signal_name(signal: Signal) -> &'static str {
    match signal {
        Signal::Constructed => "constructed",
        Signal::ConstructionFailed => "construction_failed",
        Signal::Release => "release",
        Signal::Shutdown => "shutdown",
    }
}

#[cold]
#[track_caller]
fn protocol_violation<K: ResourceKind>(violation: ProtocolViolation) -> ! {
    FatalViolation::raise(format!("{}: {violation}", K::LABEL))
}
