//! Request streams on a connection
//!
//! Keeps the parent connection capsule, the request body source (a callable
//! `read(max) -> bytes`, empty or `None` meaning end of body), `on_body`
//! (optional) and `on_complete`. Completion is the stream's shutdown signal.

use super::{native_of, ConnectionKind};
use crate::binding::{Binding, BindingPtr, ResourceKind};
use crate::callbacks::{enter, invoke, report};
use crate::error::{BridgeError, ErrorCode, ManagedError};
use crate::lock::LockToken;
use crate::native::{ConnectionApi, NativePtr, ReadBodyFn, RequestOptions, StreamCallbacks};
use crate::runtime::{Arg, ManagedRuntime, Value};
use core::ffi::c_void;
use std::ffi::CStr;
use std::sync::Arc;

pub struct StreamKind;

impl ResourceKind for StreamKind {
    const NAME: &'static CStr = c"native_bridge.stream";
    const LABEL: &'static str = "stream";

    type Api = dyn ConnectionApi;
    type Extra = RequestOptions;

    fn release_native(api: &Self::Api, native: NativePtr) -> Result<(), ErrorCode> {
        api.release_stream(native)
    }
}

/// Issue a request on `connection` and start it. Returns the stream capsule.
#[allow(clippy::too_many_arguments)]
pub fn request<R: ManagedRuntime>(
    runtime: &Arc<R>,
    lock: &LockToken<'_, R>,
    api: &Arc<dyn ConnectionApi>,
    connection: &R::Object,
    options: RequestOptions,
    body: Option<&R::Object>,
    on_body: Option<&R::Object>,
    on_complete: &R::Object,
) -> Result<R::Object, BridgeError> {
    let connection_native = native_of::<R, ConnectionKind>(lock, connection)?;

    let binding = Binding::<R, StreamKind>::new(runtime, Arc::clone(api), options);
    binding.keep(lock, "connection", connection);
    binding.keep_opt(lock, "body", body);
    binding.keep_opt(lock, "on_body", on_body);
    binding.keep(lock, "on_complete", on_complete);
    let ptr = binding.into_ptr();

    let callbacks = StreamCallbacks {
        read_body: body.map(|_| on_stream_read_body::<R> as ReadBodyFn),
        on_body: Some(on_stream_body::<R>),
        on_complete: on_stream_complete::<R>,
        user_data: ptr.as_user_data(),
    };

    // Safety: ptr is Constructing and owned by this call until activated
    let created = api.make_request(connection_native, unsafe { ptr.get() }.extra(), callbacks);
    let native = match created {
        Ok(native) => native,
        Err(code) => {
            unsafe { ptr.fail_construction(code) };
            return Err(BridgeError::Native(code));
        }
    };

    let handle = unsafe { ptr.activate(native) };
    if let Err(code) = api.activate_stream(native) {
        // No completion will be delivered for a stream that never started
        unsafe { ptr.signal_shutdown() };
        drop(handle);
        return Err(BridgeError::Native(code));
    }

    handle.into_capsule(lock)
}

/// Request early termination; completion still fires, with `CANCELED`
pub fn cancel<R: ManagedRuntime>(
    lock: &LockToken<'_, R>,
    api: &dyn ConnectionApi,
    stream: &R::Object,
) -> Result<(), BridgeError> {
    let native = native_of::<R, StreamKind>(lock, stream)?;
    api.cancel_stream(native, ErrorCode::CANCELED);
    Ok(())
}

unsafe extern "C" fn on_stream_read_body<R: ManagedRuntime>(
    buf: *mut u8,
    capacity: usize,
    written: *mut usize,
    eof: *mut bool,
    user_data: *mut c_void,
) -> i32 {
    const ORIGIN: &str = "stream.read_body";
    // Runtime gone: end the body quietly
    *written = 0;
    *eof = true;

    let Some(ptr) = BindingPtr::<R, StreamKind>::from_user_data(user_data) else {
        return ErrorCode::SUCCESS.0;
    };
    let runtime = Arc::clone(ptr.get().runtime());

    enter(&*runtime, ORIGIN, ErrorCode::SUCCESS.0, |lock| {
        let Some(body) = ptr.get().kept(lock, "body") else {
            return ErrorCode::SUCCESS.0;
        };

        let data = match invoke(lock, &body, vec![Arg::value(capacity as i64)], ORIGIN) {
            Ok(Value::Bytes(data)) => data,
            Ok(Value::None) => Vec::new(),
            Ok(other) => {
                let err = ManagedError::type_error(format!("body read must return bytes, not {}", other.type_name()));
                return report(lock, &err, ORIGIN).0;
            }
            Err(code) => return code.0,
        };

        if data.len() > capacity {
            let err = ManagedError::new("ValueError", format!("body read returned {} bytes, limit {capacity}", data.len()));
            return report(lock, &err, ORIGIN).0;
        }

        core::ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
        *written = data.len();
        *eof = data.is_empty();
        ErrorCode::SUCCESS.0
    })
}

unsafe extern "C" fn on_stream_body<R: ManagedRuntime>(
    _stream: *mut c_void,
    data: *const u8,
    len: usize,
    user_data: *mut c_void,
) -> i32 {
    const ORIGIN: &str = "stream.on_body";
    let Some(ptr) = BindingPtr::<R, StreamKind>::from_user_data(user_data) else {
        return ErrorCode::SUCCESS.0;
    };
    let runtime = Arc::clone(ptr.get().runtime());

    enter(&*runtime, ORIGIN, ErrorCode::SUCCESS.0, |lock| {
        let Some(on_body) = ptr.get().kept(lock, "on_body") else {
            return ErrorCode::SUCCESS.0;
        };
        // The native buffer is only valid during this call
        let chunk = if data.is_null() {
            Vec::new()
        } else {
            core::slice::from_raw_parts(data, len).to_vec()
        };
        match invoke(lock, &on_body, vec![Arg::value(chunk)], ORIGIN) {
            Ok(_) => ErrorCode::SUCCESS.0,
            Err(code) => code.0,
        }
    })
}

unsafe extern "C" fn on_stream_complete<R: ManagedRuntime>(_stream: *mut c_void, error_code: i32, user_data: *mut c_void) {
    const ORIGIN: &str = "stream.on_complete";
    let Some(ptr) = BindingPtr::<R, StreamKind>::from_user_data(user_data) else {
        return;
    };
    let runtime = Arc::clone(ptr.get().runtime());

    enter(&*runtime, ORIGIN, (), |lock| {
        if let Some(on_complete) = ptr.get().kept(lock, "on_complete") {
            let _ = invoke(lock, &on_complete, vec![Arg::value(error_code as i64)], ORIGIN);
        }
        ptr.signal_shutdown();
    });
}
