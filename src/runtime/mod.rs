//! Managed runtime abstraction
//!
//! Design: the host language is an injectable capability rather than a
//! hard-coded interpreter. Everything the bridge needs from it:
//! 1. A global lock (acquire / release / suspend), with an "unavailable" result
//! 2. Reference counting on opaque object pointers
//! 3. Calling a managed callable with typed arguments
//! 4. Capsules: managed objects owning a native pointer plus a finalizer
//!
//! Reference-count and call operations take a `LockToken` as proof that the
//! lock is held by the calling thread.

pub mod heap;
#[cfg(feature = "python")]
pub mod python;

#[cfg(test)]
mod tests;

pub use heap::{ManagedHeap, ObjRef};
#[cfg(feature = "python")]
pub use python::{PyPtr, PythonRuntime};

use crate::error::{ManagedError, Unavailable};
use crate::lock::LockToken;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::ffi::CStr;
use std::fmt;

/// Finalizer stored alongside a capsule pointer.
///
/// Called exactly once, with the managed lock held, when the capsule is collected.
pub type CapsuleDestructor = unsafe fn(NonNull<c_void>);

/// Data crossing the bridge by value (copied, never aliased)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
    Tuple(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Lookup in a `Map` value
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Short type name, used in conversion errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::Map(_) => "dict",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::None, Into::into)
    }
}

/// Positional argument for a managed call
#[derive(Debug, Clone)]
pub enum Arg<O> {
    Value(Value),
    /// Borrowed reference; the callee increfs if it wants to keep it
    Object(O),
}

impl<O> Arg<O> {
    #[inline]
    pub fn value(v: impl Into<Value>) -> Self {
        Arg::Value(v.into())
    }
}

impl<O> From<Value> for Arg<O> {
    fn from(v: Value) -> Self {
        Arg::Value(v)
    }
}

/// Host-language capability consumed by every binding
pub trait ManagedRuntime: Send + Sync + Sized + 'static {
    /// Unowned object pointer. Ownership is tracked by `KeptRef`.
    type Object: Clone + Send + Sync + fmt::Debug + 'static;
    /// State returned by a successful acquire, handed back on release
    type LockState;
    /// State of a temporarily dropped lock
    type Suspended;

    /// Acquire the global lock, or report that the runtime is gone
    fn try_acquire(&self) -> Result<Self::LockState, Unavailable>;

    fn release(&self, state: Self::LockState);

    fn held_by_current_thread(&self) -> bool;

    /// Drop the lock held by this thread; must be paired with `resume`
    fn suspend(&self) -> Self::Suspended;

    fn resume(&self, suspended: Self::Suspended);

    fn incref(&self, lock: &LockToken<'_, Self>, obj: &Self::Object);

    /// Consumes one reference; may run finalizers on this thread
    fn decref(&self, lock: &LockToken<'_, Self>, obj: Self::Object);

    fn refcount(&self, lock: &LockToken<'_, Self>, obj: &Self::Object) -> usize;

    fn call(
        &self,
        lock: &LockToken<'_, Self>,
        callable: &Self::Object,
        args: Vec<Arg<Self::Object>>,
    ) -> Result<Value, ManagedError>;

    /// Sink for errors that cannot be propagated to any managed caller
    fn report_unraisable(&self, lock: &LockToken<'_, Self>, err: &ManagedError, origin: &str);

    /// Wrap a native pointer in a new managed object (returned as a new reference)
    fn new_capsule(
        &self,
        lock: &LockToken<'_, Self>,
        name: &'static CStr,
        pointer: NonNull<c_void>,
        destructor: CapsuleDestructor,
    ) -> Result<Self::Object, ManagedError>;

    /// Pointer stored in `obj` if it is a live capsule with the given name
    fn capsule_pointer(
        &self,
        lock: &LockToken<'_, Self>,
        obj: &Self::Object,
        name: &'static CStr,
    ) -> Option<NonNull<c_void>>;
}
