//! Interpreter-lock guard
//!
//! Design: RAII token proving the managed runtime's global lock is held.
//! - `acquire` takes the lock (fatal if this thread already holds it)
//! - `current` borrows a lock the thread already holds (finalizer paths)
//! - `ensure` is `current`, falling back to `acquire`
//!
//! Every successful acquire is paired with exactly one release, on every exit
//! path, because release happens in `Drop`.

use crate::error::{FatalViolation, Unavailable};
use crate::logging::trace;
use crate::runtime::ManagedRuntime;
use core::marker::PhantomData;

/// Proof that the managed lock is held by this thread.
///
/// Not `Send`: a token released on a different thread than it was acquired on
/// would corrupt the host's lock state.
pub struct LockToken<'r, R: ManagedRuntime> {
    runtime: &'r R,
    /// `None` for a borrowed token, which never releases
    state: Option<R::LockState>,
    _not_send: PhantomData<*const ()>,
}

impl<'r, R: ManagedRuntime> LockToken<'r, R> {
    #[inline]
    pub fn runtime(&self) -> &'r R {
        self.runtime
    }

    /// True if this token will release the lock when dropped
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.state.is_some()
    }

    /// Drop the lock while `f` runs, then take it back.
    ///
    /// Used only for bounded blocking waits; `f` must not touch managed objects.
    pub fn allow_threads<T>(&self, f: impl FnOnce() -> T) -> T {
        let suspended = self.runtime.suspend();
        trace!(event = "lock_suspended");
        let out = f();
        self.runtime.resume(suspended);
        trace!(event = "lock_resumed");
        out
    }
}

impl<R: ManagedRuntime> Drop for LockToken<'_, R> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.runtime.release(state);
        }
    }
}

/// Acquire the managed lock.
///
/// Returns `Unavailable` once the runtime has started tearing down; callers
/// return their native "no-op" value and touch nothing managed.
///
/// # Panics
/// If the calling thread already holds the lock. Nested guards within one
/// logical operation are a programming error.
#[track_caller]
pub fn acquire<R: ManagedRuntime>(runtime: &R) -> Result<LockToken<'_, R>, Unavailable> {
    if runtime.held_by_current_thread() {
        FatalViolation::raise("interpreter lock acquired re-entrantly");
    }

    match runtime.try_acquire() {
        Ok(state) => Ok(LockToken {
            runtime,
            state: Some(state),
            _not_send: PhantomData,
        }),
        Err(unavailable) => {
            trace!(event = "lock_unavailable");
            Err(unavailable)
        }
    }
}

/// Borrow the lock if the current thread already holds it
#[inline]
pub fn current<R: ManagedRuntime>(runtime: &R) -> Option<LockToken<'_, R>> {
    runtime.held_by_current_thread().then(|| LockToken {
        runtime,
        state: None,
        _not_send: PhantomData,
    })
}

/// Borrow the lock if held, otherwise acquire it
#[inline]
pub fn ensure<R: ManagedRuntime>(runtime: &R) -> Result<LockToken<'_, R>, Unavailable> {
    match current(runtime) {
        Some(token) => Ok(token),
        None => acquire(runtime),
    }
}
