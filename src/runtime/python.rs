//! CPython runtime
//!
//! The interpreter behind a `ManagedRuntime`, driven through the raw C API:
//! - the lock is the GIL (`PyGILState_*`), unavailable once the interpreter
//!   is finalizing or gone
//! - objects are borrowed `PyObject` pointers; ownership is tracked by `KeptRef`
//! - capsules carry the bridge finalizer in their context slot

use super::{Arg, CapsuleDestructor, ManagedRuntime, Value};
use crate::error::{ManagedError, Unavailable};
use crate::lock::LockToken;
use crate::logging::{debug, warn};
use core::ffi::{c_char, c_void};
use core::ptr::{self, NonNull};
use once_cell::sync::Lazy;
use pyo3::ffi;
use pyo3::{PyAny, PyObject, Python};
use std::ffi::{CStr, CString};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set by the interpreter's exit hook; every later acquire is `Unavailable`
static FINALIZING: AtomicBool = AtomicBool::new(false);

static RUNTIME: Lazy<Arc<PythonRuntime>> = Lazy::new(|| Arc::new(PythonRuntime { _private: () }));

/// Borrowed pointer to a Python object
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PyPtr(NonNull<ffi::PyObject>);

// Safety: the pointer is only dereferenced by the C API with the GIL held
unsafe impl Send for PyPtr {}
unsafe impl Sync for PyPtr {}

impl PyPtr {
    #[inline]
    pub fn from_any(obj: &PyAny) -> Self {
        // Safety: a `&PyAny` is never null
        Self(unsafe { NonNull::new_unchecked(obj.as_ptr()) })
    }

    /// # Safety
    /// `ptr` must be a live Python object.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut ffi::PyObject) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut ffi::PyObject {
        self.0.as_ptr()
    }

    /// Convert an owned reference into a pyo3 object
    ///
    /// # Safety
    /// The caller must own one reference to `self`, which is transferred.
    pub unsafe fn into_object(self, py: Python<'_>) -> PyObject {
        PyObject::from_owned_ptr(py, self.as_ptr())
    }
}

impl fmt::Debug for PyPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PyPtr({:p})", self.0)
    }
}

/// The embedding interpreter
pub struct PythonRuntime {
    _private: (),
}

impl PythonRuntime {
    /// Process-wide instance shared by every binding
    pub fn global() -> Arc<Self> {
        Arc::clone(&RUNTIME)
    }

    /// Stop entering the interpreter; called from its exit hook
    pub fn mark_finalizing() {
        if !FINALIZING.swap(true, Ordering::SeqCst) {
            debug!(event = "python_finalizing");
        }
    }

    pub fn is_finalizing() -> bool {
        FINALIZING.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for PythonRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PythonRuntime")
            .field("finalizing", &Self::is_finalizing())
            .finish()
    }
}

// ============================================================================
// Value conversion (GIL held)
// ============================================================================

/// Take the pending Python exception as a `ManagedError`
unsafe fn fetch_error() -> ManagedError {
    let mut ptype = ptr::null_mut();
    let mut pvalue = ptr::null_mut();
    let mut ptraceback = ptr::null_mut();
    ffi::PyErr_Fetch(&mut ptype, &mut pvalue, &mut ptraceback);
    if ptype.is_null() {
        return ManagedError::new("SystemError", "error indicator set without an exception");
    }
    ffi::PyErr_NormalizeException(&mut ptype, &mut pvalue, &mut ptraceback);

    let kind = type_name(ptype).unwrap_or_else(|| "Exception".to_owned());
    let message = if pvalue.is_null() {
        String::new()
    } else {
        let text = ffi::PyObject_Str(pvalue);
        let message = str_of(text).unwrap_or_default();
        if text.is_null() {
            ffi::PyErr_Clear();
        } else {
            ffi::Py_DecRef(text);
        }
        message
    };

    for obj in [ptype, pvalue, ptraceback] {
        if !obj.is_null() {
            ffi::Py_DecRef(obj);
        }
    }
    ManagedError::new(kind, message)
}

unsafe fn checked(obj: *mut ffi::PyObject) -> Result<*mut ffi::PyObject, ManagedError> {
    if obj.is_null() {
        Err(fetch_error())
    } else {
        Ok(obj)
    }
}

unsafe fn str_of(obj: *mut ffi::PyObject) -> Option<String> {
    if obj.is_null() {
        return None;
    }
    let mut size: ffi::Py_ssize_t = 0;
    let data = ffi::PyUnicode_AsUTF8AndSize(obj, &mut size);
    if data.is_null() {
        ffi::PyErr_Clear();
        return None;
    }
    let bytes = core::slice::from_raw_parts(data.cast::<u8>(), size as usize);
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// `__name__` of a type object
unsafe fn type_name(ty: *mut ffi::PyObject) -> Option<String> {
    let name = ffi::PyObject_GetAttrString(ty, c"__name__".as_ptr());
    if name.is_null() {
        ffi::PyErr_Clear();
        return None;
    }
    let out = str_of(name);
    ffi::Py_DecRef(name);
    out
}

/// New reference for `value`
unsafe fn to_python(value: &Value) -> Result<*mut ffi::PyObject, ManagedError> {
    match value {
        Value::None => {
            let none = ffi::Py_None();
            ffi::Py_IncRef(none);
            Ok(none)
        }
        Value::Bool(b) => checked(ffi::PyBool_FromLong(*b as _)),
        Value::Int(i) => checked(ffi::PyLong_FromLongLong(*i)),
        Value::Bytes(b) => checked(ffi::PyBytes_FromStringAndSize(
            b.as_ptr().cast::<c_char>(),
            b.len() as ffi::Py_ssize_t,
        )),
        Value::Str(s) => checked(ffi::PyUnicode_FromStringAndSize(
            s.as_ptr().cast::<c_char>(),
            s.len() as ffi::Py_ssize_t,
        )),
        Value::Tuple(items) => {
            let tuple = checked(ffi::PyTuple_New(items.len() as ffi::Py_ssize_t))?;
            for (i, item) in items.iter().enumerate() {
                match to_python(item) {
                    // Steals `obj`
                    Ok(obj) => {
                        ffi::PyTuple_SetItem(tuple, i as ffi::Py_ssize_t, obj);
                    }
                    Err(err) => {
                        ffi::Py_DecRef(tuple);
                        return Err(err);
                    }
                }
            }
            Ok(tuple)
        }
        Value::Map(entries) => {
            let dict = checked(ffi::PyDict_New())?;
            for (key, item) in entries {
                let result = to_python(&Value::Str(key.clone())).and_then(|k| match to_python(item) {
                    Ok(v) => {
                        let rc = ffi::PyDict_SetItem(dict, k, v);
                        ffi::Py_DecRef(k);
                        ffi::Py_DecRef(v);
                        if rc == 0 {
                            Ok(())
                        } else {
                            Err(fetch_error())
                        }
                    }
                    Err(err) => {
                        ffi::Py_DecRef(k);
                        Err(err)
                    }
                });
                if let Err(err) = result {
                    ffi::Py_DecRef(dict);
                    return Err(err);
                }
            }
            Ok(dict)
        }
    }
}

/// Copy a borrowed Python object into a `Value`
unsafe fn from_python(obj: *mut ffi::PyObject) -> Result<Value, ManagedError> {
    if obj == ffi::Py_None() {
        return Ok(Value::None);
    }
    if ffi::PyBool_Check(obj) != 0 {
        return Ok(Value::Bool(obj == ffi::Py_True()));
    }
    if ffi::PyLong_Check(obj) != 0 {
        let v = ffi::PyLong_AsLongLong(obj);
        if v == -1 && !ffi::PyErr_Occurred().is_null() {
            return Err(fetch_error());
        }
        return Ok(Value::Int(v));
    }
    if ffi::PyBytes_Check(obj) != 0 {
        let data = ffi::PyBytes_AsString(obj);
        let len = ffi::PyBytes_Size(obj) as usize;
        return Ok(Value::Bytes(core::slice::from_raw_parts(data.cast::<u8>(), len).to_vec()));
    }
    if ffi::PyUnicode_Check(obj) != 0 {
        return str_of(obj).map(Value::Str).ok_or_else(|| ManagedError::new("UnicodeError", "invalid str"));
    }
    if ffi::PyTuple_Check(obj) != 0 {
        let len = ffi::PyTuple_Size(obj);
        let items = (0..len)
            .map(|i| from_python(ffi::PyTuple_GetItem(obj, i)))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::Tuple(items));
    }
    if ffi::PyDict_Check(obj) != 0 {
        let mut pos: ffi::Py_ssize_t = 0;
        let mut key = ptr::null_mut();
        let mut value = ptr::null_mut();
        let mut entries = Vec::new();
        while ffi::PyDict_Next(obj, &mut pos, &mut key, &mut value) != 0 {
            let key = str_of(key).ok_or_else(|| ManagedError::type_error("dict keys must be str"))?;
            entries.push((key, from_python(value)?));
        }
        return Ok(Value::Map(entries));
    }

    let name = type_name(ffi::Py_TYPE(obj).cast()).unwrap_or_else(|| "object".to_owned());
    Err(ManagedError::type_error(format!("cannot convert {name} for native code")))
}

unsafe extern "C" fn capsule_trampoline(capsule: *mut ffi::PyObject) {
    let name = ffi::PyCapsule_GetName(capsule);
    let pointer = ffi::PyCapsule_GetPointer(capsule, name);
    let context = ffi::PyCapsule_GetContext(capsule);
    if pointer.is_null() || context.is_null() {
        ffi::PyErr_Clear();
        return;
    }
    // Safety: the context slot only ever holds a `CapsuleDestructor`
    let destructor = core::mem::transmute::<*mut c_void, CapsuleDestructor>(context);
    destructor(NonNull::new_unchecked(pointer));
}

impl ManagedRuntime for PythonRuntime {
    type Object = PyPtr;
    type LockState = ffi::PyGILState_STATE;
    type Suspended = *mut ffi::PyThreadState;

    fn try_acquire(&self) -> Result<Self::LockState, Unavailable> {
        // Safety: Py_IsInitialized may be called at any time
        if Self::is_finalizing() || unsafe { ffi::Py_IsInitialized() } == 0 {
            return Err(Unavailable);
        }
        Ok(unsafe { ffi::PyGILState_Ensure() })
    }

    fn release(&self, state: Self::LockState) {
        unsafe { ffi::PyGILState_Release(state) }
    }

    fn held_by_current_thread(&self) -> bool {
        unsafe { ffi::Py_IsInitialized() != 0 && ffi::PyGILState_Check() == 1 }
    }

    fn suspend(&self) -> Self::Suspended {
        unsafe { ffi::PyEval_SaveThread() }
    }

    fn resume(&self, suspended: Self::Suspended) {
        unsafe { ffi::PyEval_RestoreThread(suspended) }
    }

    fn incref(&self, _lock: &LockToken<'_, Self>, obj: &PyPtr) {
        unsafe { ffi::Py_IncRef(obj.as_ptr()) }
    }

    fn decref(&self, _lock: &LockToken<'_, Self>, obj: PyPtr) {
        unsafe { ffi::Py_DecRef(obj.as_ptr()) }
    }

    fn refcount(&self, _lock: &LockToken<'_, Self>, obj: &PyPtr) -> usize {
        unsafe { ffi::Py_REFCNT(obj.as_ptr()) as usize }
    }

    fn call(&self, _lock: &LockToken<'_, Self>, callable: &PyPtr, args: Vec<Arg<PyPtr>>) -> Result<Value, ManagedError> {
        unsafe {
            let tuple = checked(ffi::PyTuple_New(args.len() as ffi::Py_ssize_t))?;
            for (i, arg) in args.iter().enumerate() {
                let item = match arg {
                    Arg::Object(obj) => {
                        ffi::Py_IncRef(obj.as_ptr());
                        Ok(obj.as_ptr())
                    }
                    Arg::Value(value) => to_python(value),
                };
                match item {
                    Ok(item) => {
                        ffi::PyTuple_SetItem(tuple, i as ffi::Py_ssize_t, item);
                    }
                    Err(err) => {
                        ffi::Py_DecRef(tuple);
                        return Err(err);
                    }
                }
            }

            let result = ffi::PyObject_Call(callable.as_ptr(), tuple, ptr::null_mut());
            ffi::Py_DecRef(tuple);
            let result = checked(result)?;
            let value = from_python(result);
            ffi::Py_DecRef(result);
            value
        }
    }

    fn report_unraisable(&self, _lock: &LockToken<'_, Self>, err: &ManagedError, origin: &str) {
        let message = CString::new(err.to_string()).unwrap_or_default();
        let context = CString::new(origin).unwrap_or_default();
        unsafe {
            ffi::PyErr_SetString(ffi::PyExc_RuntimeError, message.as_ptr());
            let context = ffi::PyUnicode_FromString(context.as_ptr());
            ffi::PyErr_WriteUnraisable(context);
            if context.is_null() {
                ffi::PyErr_Clear();
            } else {
                ffi::Py_DecRef(context);
            }
        }
    }

    fn new_capsule(
        &self,
        _lock: &LockToken<'_, Self>,
        name: &'static CStr,
        pointer: NonNull<c_void>,
        destructor: CapsuleDestructor,
    ) -> Result<PyPtr, ManagedError> {
        unsafe {
            let capsule = checked(ffi::PyCapsule_New(pointer.as_ptr(), name.as_ptr(), Some(capsule_trampoline)))?;
            if ffi::PyCapsule_SetContext(capsule, destructor as *mut c_void) != 0 {
                let err = fetch_error();
                // No context yet, so the trampoline leaves the pointer alone
                ffi::Py_DecRef(capsule);
                warn!(event = "capsule_context_failed", error = %err);
                return Err(err);
            }
            Ok(PyPtr(NonNull::new_unchecked(capsule)))
        }
    }

    fn capsule_pointer(&self, _lock: &LockToken<'_, Self>, obj: &PyPtr, name: &'static CStr) -> Option<NonNull<c_void>> {
        unsafe {
            if ffi::PyCapsule_IsValid(obj.as_ptr(), name.as_ptr()) != 1 {
                return None;
            }
            NonNull::new(ffi::PyCapsule_GetPointer(obj.as_ptr(), name.as_ptr()))
        }
    }
}
