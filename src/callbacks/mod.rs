//! Callback adapters - the shape every native callback follows
//!
//! Design: a native thread enters managed code in one way only:
//! 1. `enter` catches panics and acquires the lock (fallback on `Unavailable`)
//! 2. native data is copied into owned `Value`s
//! 3. `invoke` calls the managed callable; errors become native codes and
//!    are reported to the unraisable sink
//! 4. per-call references (`CallContext`) are released before the lock
//!
//! Nothing escapes an adapter except a plain native return value.

use crate::error::{ErrorCode, FatalViolation, ManagedError};
use crate::lock::{self, LockToken};
use crate::logging::{error, log_callback_error, log_callback_panic, log_runtime_unavailable, trace};
use crate::refs::KeptRefs;
use crate::runtime::{Arg, ManagedRuntime, Value};
use core::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(test)]
mod tests;

/// Run `f` under the managed lock, from a native thread.
///
/// Returns `fallback` when the runtime is gone or `f` panics. A
/// `FatalViolation` aborts the process instead.
pub fn enter<R, T>(runtime: &R, origin: &'static str, fallback: T, f: impl FnOnce(&LockToken<'_, R>) -> T) -> T
where
    R: ManagedRuntime,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match lock::acquire(runtime) {
        Ok(lock) => Some(f(&lock)),
        Err(_) => {
            log_runtime_unavailable(origin);
            None
        }
    }));

    match outcome {
        Ok(Some(value)) => value,
        Ok(None) => fallback,
        Err(payload) => {
            if let Some(violation) = payload.downcast_ref::<FatalViolation>() {
                error!(event = "adapter_abort", origin, detail = %violation.detail, "Aborting");
                process::abort();
            }
            log_callback_panic(origin);
            fallback
        }
    }
}

/// Call a managed callable from an adapter.
///
/// A raised error is reported to the unraisable sink and mapped to
/// `CALLBACK_FAILURE`; it never propagates back into native code.
pub fn invoke<R: ManagedRuntime>(
    lock: &LockToken<'_, R>,
    callable: &R::Object,
    args: Vec<Arg<R::Object>>,
    origin: &str,
) -> Result<Value, ErrorCode> {
    lock.runtime()
        .call(lock, callable, args)
        .map_err(|err| report(lock, &err, origin))
}

/// Report an error that has no managed caller to return to
pub fn report<R: ManagedRuntime>(lock: &LockToken<'_, R>, err: &ManagedError, origin: &str) -> ErrorCode {
    log_callback_error(origin, &err.to_string());
    lock.runtime().report_unraisable(lock, err, origin);
    ErrorCode::CALLBACK_FAILURE
}

/// Number of per-call contexts issued and not yet completed
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

pub fn in_flight_calls() -> usize {
    IN_FLIGHT.load(Ordering::Relaxed)
}

/// Transient state for one issued native operation.
///
/// Holds the callables and buffers that operation needs, independent of any
/// binding. Created per call, consumed by the single completion callback.
pub struct CallContext<R: ManagedRuntime, E = ()> {
    runtime: Arc<R>,
    refs: KeptRefs<R>,
    extra: E,
}

impl<R: ManagedRuntime, E> CallContext<R, E> {
    pub fn new(runtime: &Arc<R>, extra: E) -> Self {
        Self {
            runtime: Arc::clone(runtime),
            refs: KeptRefs::new(),
            extra,
        }
    }

    /// Pin `obj` until this call completes
    pub fn keep(&mut self, lock: &LockToken<'_, R>, role: &'static str, obj: &R::Object) {
        self.refs.keep(&self.runtime, lock, role, obj);
    }

    pub fn get(&self, role: &str) -> Option<&R::Object> {
        self.refs.get(role)
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    #[inline]
    pub fn extra(&self) -> &E {
        &self.extra
    }

    /// Issue: hand the context to native code as `user_data`
    pub fn into_user_data(self) -> *mut c_void {
        IN_FLIGHT.fetch_add(1, Ordering::Relaxed);
        trace!(event = "call_issued", refs = self.refs.len());
        Box::into_raw(Box::new(self)).cast()
    }

    /// Take the context back from `user_data`.
    ///
    /// # Safety
    /// `user_data` must come from `into_user_data` with the same `R`/`E`, and
    /// may be reclaimed only once.
    pub unsafe fn reclaim(user_data: *mut c_void) -> Option<Box<Self>> {
        if user_data.is_null() {
            return None;
        }
        IN_FLIGHT.fetch_sub(1, Ordering::Relaxed);
        Some(Box::from_raw(user_data.cast()))
    }

    /// Completed: release this call's references under the held lock
    pub fn complete(mut self: Box<Self>, lock: &LockToken<'_, R>) {
        trace!(event = "call_completed", refs = self.refs.len());
        self.refs.release_all(lock);
    }
}
