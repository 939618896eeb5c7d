//! Client connections
//!
//! Keeps `bootstrap` (optional), `on_setup` and `on_shutdown` (optional).
//! The binding is activated inside the asynchronous setup callback; a failed
//! setup is a failed construction and no shutdown follows.

use super::native_of;
use crate::binding::{Binding, BindingPtr, ResourceKind};
use crate::callbacks::{enter, invoke};
use crate::error::{BridgeError, ErrorCode};
use crate::lock::LockToken;
use crate::logging::debug;
use crate::native::{ConnectOptions, ConnectionApi, NativePtr};
use crate::refs::KeptRef;
use crate::runtime::{Arg, ManagedRuntime, Value};
use core::ffi::c_void;
use std::ffi::CStr;
use std::sync::Arc;

pub struct ConnectionKind;

impl ResourceKind for ConnectionKind {
    const NAME: &'static CStr = c"native_bridge.connection";
    const LABEL: &'static str = "connection";

    type Api = dyn ConnectionApi;
    type Extra = ConnectOptions;

    fn release_native(api: &Self::Api, native: NativePtr) -> Result<(), ErrorCode> {
        api.release_connection(native)
    }
}

/// Start connecting. `on_setup(connection | None, error_code)` fires once.
///
/// A synchronous native failure is returned here and `on_setup` never fires.
pub fn connect<R: ManagedRuntime>(
    runtime: &Arc<R>,
    lock: &LockToken<'_, R>,
    api: &Arc<dyn ConnectionApi>,
    options: ConnectOptions,
    bootstrap: Option<&R::Object>,
    on_setup: &R::Object,
    on_shutdown: Option<&R::Object>,
) -> Result<(), BridgeError> {
    let binding = Binding::<R, ConnectionKind>::new(runtime, Arc::clone(api), options);
    binding.keep_opt(lock, "bootstrap", bootstrap);
    binding.keep(lock, "on_setup", on_setup);
    binding.keep_opt(lock, "on_shutdown", on_shutdown);
    let ptr = binding.into_ptr();

    // Safety: ptr is live and Constructing until the setup callback fires
    let result = api.connect(
        unsafe { ptr.get() }.extra(),
        on_connection_setup::<R>,
        on_connection_shutdown::<R>,
        ptr.as_user_data(),
    );

    if let Err(code) = result {
        // Safety: the native side took no reference to user_data
        unsafe { ptr.fail_construction(code) };
        return Err(BridgeError::Native(code));
    }
    Ok(())
}

/// Begin closing; `on_shutdown` follows asynchronously
pub fn close<R: ManagedRuntime>(
    lock: &LockToken<'_, R>,
    api: &dyn ConnectionApi,
    connection: &R::Object,
) -> Result<(), BridgeError> {
    let native = native_of::<R, ConnectionKind>(lock, connection)?;
    api.close(native);
    Ok(())
}

pub fn is_open<R: ManagedRuntime>(
    lock: &LockToken<'_, R>,
    api: &dyn ConnectionApi,
    connection: &R::Object,
) -> Result<bool, BridgeError> {
    let native = native_of::<R, ConnectionKind>(lock, connection)?;
    Ok(api.is_open(native))
}

unsafe extern "C" fn on_connection_setup<R: ManagedRuntime>(
    connection: *mut c_void,
    error_code: i32,
    user_data: *mut c_void,
) {
    const ORIGIN: &str = "connection.on_setup";
    let Some(ptr) = BindingPtr::<R, ConnectionKind>::from_user_data(user_data) else {
        return;
    };
    let runtime = Arc::clone(ptr.get().runtime());

    enter(&*runtime, ORIGIN, (), |lock| {
        let on_setup = ptr.get().kept(lock, "on_setup");
        let outcome = match (NativePtr::from_raw(connection), ErrorCode::check(error_code)) {
            (Some(native), Ok(())) => Ok(native),
            (None, Ok(())) => Err(ErrorCode::UNKNOWN),
            (_, Err(code)) => Err(code),
        };

        match outcome {
            Ok(native) => {
                let handle = ptr.activate(native);
                debug!(event = "connection_established", host = %handle.binding().extra().host);
                match handle.into_capsule(lock) {
                    Ok(capsule) => {
                        let capsule = KeptRef::adopt(&runtime, capsule);
                        if let Some(on_setup) = on_setup {
                            let args = vec![Arg::Object(capsule.object().clone()), Arg::value(0)];
                            let _ = invoke(lock, &on_setup, args, ORIGIN);
                        }
                        // Without a managed owner the capsule finalizer releases it
                        capsule.release(lock);
                    }
                    Err(_) => {
                        if let Some(on_setup) = on_setup {
                            let args = vec![Arg::value(Value::None), Arg::value(ErrorCode::UNKNOWN.0 as i64)];
                            let _ = invoke(lock, &on_setup, args, ORIGIN);
                        }
                    }
                }
            }
            Err(code) => {
                if let Some(on_setup) = on_setup {
                    let args = vec![Arg::value(Value::None), Arg::value(code.0 as i64)];
                    let _ = invoke(lock, &on_setup, args, ORIGIN);
                }
                ptr.fail_construction(code);
            }
        }
    });
}

unsafe extern "C" fn on_connection_shutdown<R: ManagedRuntime>(error_code: i32, user_data: *mut c_void) {
    const ORIGIN: &str = "connection.on_shutdown";
    let Some(ptr) = BindingPtr::<R, ConnectionKind>::from_user_data(user_data) else {
        return;
    };
    let runtime = Arc::clone(ptr.get().runtime());

    enter(&*runtime, ORIGIN, (), |lock| {
        if let Some(on_shutdown) = ptr.get().kept(lock, "on_shutdown") {
            let _ = invoke(lock, &on_shutdown, vec![Arg::value(error_code as i64)], ORIGIN);
        }
        ptr.signal_shutdown();
    });
}
