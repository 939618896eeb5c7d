//! Reference keeper - pin managed objects while native code needs them
//!
//! Design: one `KeptRef` is one increment of a managed refcount.
//! - `keep` increments, `adopt` takes over a reference just produced
//! - `release` decrements exactly once
//! - an unreleased `KeptRef` decrements in `Drop`, so every exit path
//!   (errors, early returns, panics) gives its reference back
//!
//! Native libraries never keep managed wrappers alive on their own; the
//! binding layer pins parents, callables and buffers with these tokens.

use crate::lock::{self, LockToken};
use crate::logging::trace;
use crate::runtime::ManagedRuntime;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(test)]
mod tests;

/// Process-wide count of outstanding pins (diagnostics)
static LIVE_REFS: AtomicUsize = AtomicUsize::new(0);

/// Number of `KeptRef`s currently holding a reference
pub fn live_refs() -> usize {
    LIVE_REFS.load(Ordering::Relaxed)
}

/// One pinned reference to a managed object
pub struct KeptRef<R: ManagedRuntime> {
    runtime: Arc<R>,
    object: Option<R::Object>,
}

impl<R: ManagedRuntime> KeptRef<R> {
    /// Increment `obj`'s refcount and hold it until release
    pub fn keep(runtime: &Arc<R>, lock: &LockToken<'_, R>, obj: &R::Object) -> Self {
        debug_assert!(core::ptr::eq(lock.runtime(), &**runtime), "lock belongs to another runtime");
        runtime.incref(lock, obj);
        Self::track(runtime, obj.clone())
    }

    /// Take ownership of a reference the runtime already handed us
    pub fn adopt(runtime: &Arc<R>, obj: R::Object) -> Self {
        Self::track(runtime, obj)
    }

    fn track(runtime: &Arc<R>, obj: R::Object) -> Self {
        LIVE_REFS.fetch_add(1, Ordering::Relaxed);
        trace!(event = "ref_kept", object = ?obj);
        Self {
            runtime: Arc::clone(runtime),
            object: Some(obj),
        }
    }

    /// The pinned object (borrowed)
    #[inline]
    pub fn object(&self) -> &R::Object {
        self.object
            .as_ref()
            .expect("KeptRef object is present until release")
    }

    /// Hand the reference to the caller without decrementing
    pub fn into_inner(mut self) -> R::Object {
        LIVE_REFS.fetch_sub(1, Ordering::Relaxed);
        self.object
            .take()
            .expect("KeptRef object is present until release")
    }

    /// Decrement the refcount; the matching half of `keep`
    pub fn release(mut self, lock: &LockToken<'_, R>) {
        if let Some(obj) = self.object.take() {
            Self::decref(lock, obj);
        }
    }

    fn decref(lock: &LockToken<'_, R>, obj: R::Object) {
        LIVE_REFS.fetch_sub(1, Ordering::Relaxed);
        trace!(event = "ref_released", object = ?obj);
        lock.runtime().decref(lock, obj);
    }
}

impl<R: ManagedRuntime> Drop for KeptRef<R> {
    fn drop(&mut self) {
        let Some(obj) = self.object.take() else {
            return;
        };

        match lock::ensure(&*self.runtime) {
            Ok(lock) => Self::decref(&lock, obj),
            Err(_) => {
                // Runtime is gone; leak rather than touch the object
                LIVE_REFS.fetch_sub(1, Ordering::Relaxed);
                trace!(event = "ref_leaked", object = ?obj);
            }
        }
    }
}

impl<R: ManagedRuntime> fmt::Debug for KeptRef<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeptRef").field(&self.object).finish()
    }
}

/// Ordered, role-labelled set of pins owned by one binding or call
pub struct KeptRefs<R: ManagedRuntime> {
    entries: Vec<(&'static str, KeptRef<R>)>,
}

impl<R: ManagedRuntime> Default for KeptRefs<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: ManagedRuntime> KeptRefs<R> {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(4),
        }
    }

    /// Pin `obj` under `role`
    pub fn keep(&mut self, runtime: &Arc<R>, lock: &LockToken<'_, R>, role: &'static str, obj: &R::Object) {
        self.push(role, KeptRef::keep(runtime, lock, obj));
    }

    /// Pin `obj` under `role` if present
    pub fn keep_opt(
        &mut self,
        runtime: &Arc<R>,
        lock: &LockToken<'_, R>,
        role: &'static str,
        obj: Option<&R::Object>,
    ) {
        if let Some(obj) = obj {
            self.keep(runtime, lock, role, obj);
        }
    }

    pub fn push(&mut self, role: &'static str, kept: KeptRef<R>) {
        debug_assert!(self.get(role).is_none(), "role {role} kept twice");
        self.entries.push((role, kept));
    }

    /// Object pinned under `role`
    pub fn get(&self, role: &str) -> Option<&R::Object> {
        self.entries
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, kept)| kept.object())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every pin, newest first
    pub fn release_all(&mut self, lock: &LockToken<'_, R>) {
        while let Some((_, kept)) = self.entries.pop() {
            kept.release(lock);
        }
    }
}

impl<R: ManagedRuntime> Drop for KeptRefs<R> {
    fn drop(&mut self) {
        // Newest first, matching release_all
        while let Some((_, kept)) = self.entries.pop() {
            drop(kept);
        }
    }
}

impl<R: ManagedRuntime> fmt::Debug for KeptRefs<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(role, kept)| (role, kept.object())))
            .finish()
    }
}
