//! Managed-visible owner of a binding
//!
//! Dropping a `Handle` is the managed finalizer: it issues the native release
//! and applies the `Release` signal. A `Handle` is consumed by release, so a
//! second release of the same binding cannot be expressed.

use super::{Binding, BindingPtr, ResourceKind};
use crate::error::BridgeError;
use crate::lock::LockToken;
use crate::native::NativePtr;
use crate::runtime::ManagedRuntime;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::fmt;
use std::sync::Arc;

pub struct Handle<R: ManagedRuntime, K: ResourceKind> {
    binding: BindingPtr<R, K>,
    /// Released only by this handle's drop, so valid while it exists
    native: NativePtr,
}

impl<R: ManagedRuntime, K: ResourceKind> Handle<R, K> {
    pub(super) fn from_ptr(binding: BindingPtr<R, K>, native: NativePtr) -> Self {
        Self { binding, native }
    }

    /// The owned binding; alive for as long as this handle is
    #[inline]
    pub fn binding(&self) -> &Binding<R, K> {
        // Safety: release has not been signalled, so the phase is not terminal
        unsafe { self.binding.get() }
    }

    /// Address handed to native callbacks
    #[inline]
    pub fn user_data(&self) -> *mut c_void {
        self.binding.as_user_data()
    }

    #[inline]
    pub fn native(&self) -> NativePtr {
        self.native
    }

    /// Explicit release; same as dropping the handle
    pub fn release(self) {
        drop(self);
    }

    /// Move this handle into a managed capsule whose finalizer releases it.
    ///
    /// Returns a new reference. If the capsule cannot be created the handle
    /// is released before returning the error.
    pub fn into_capsule(self, lock: &LockToken<'_, R>) -> Result<R::Object, BridgeError> {
        let runtime: Arc<R> = Arc::clone(self.binding().runtime());
        let raw = NonNull::from(Box::leak(Box::new(self))).cast::<c_void>();

        match runtime.new_capsule(lock, K::NAME, raw, finalize_capsule::<R, K>) {
            Ok(capsule) => Ok(capsule),
            Err(err) => {
                // Safety: the runtime did not take ownership of `raw`
                unsafe { finalize_capsule::<R, K>(raw) };
                Err(BridgeError::Managed(err))
            }
        }
    }

    /// Borrow the handle stored in a capsule of this kind.
    ///
    /// The borrow is tied to the lock; callers that run managed code while
    /// holding it must pin the capsule first.
    pub fn from_capsule<'l>(lock: &'l LockToken<'_, R>, obj: &R::Object) -> Result<&'l Self, BridgeError> {
        let pointer = lock
            .runtime()
            .capsule_pointer(lock, obj, K::NAME)
            .ok_or(BridgeError::WrongHandle { expected: K::LABEL })?;
        // Safety: capsules named `K::NAME` are only created by `into_capsule`
        // for this kind, and the capsule is alive while the caller borrows it
        Ok(unsafe { pointer.cast::<Self>().as_ref() })
    }
}

impl<R: ManagedRuntime, K: ResourceKind> Drop for Handle<R, K> {
    fn drop(&mut self) {
        // Safety: each handle owns its binding exactly once
        unsafe { self.binding.signal_release() }
    }
}

impl<R: ManagedRuntime, K: ResourceKind> fmt::Debug for Handle<R, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(self.binding()).finish()
    }
}

/// Capsule destructor: runs when the managed runtime collects the capsule
unsafe fn finalize_capsule<R: ManagedRuntime, K: ResourceKind>(pointer: NonNull<c_void>) {
    drop(Box::from_raw(pointer.cast::<Handle<R, K>>().as_ptr()));
}
