//! Credential providers
//!
//! Static providers keep nothing. Delegate providers keep the managed
//! `delegate() -> (access_key_id, secret_access_key, session_token | None)`
//! callable, invoked from native threads on every fetch.
//! `get_credentials` is a per-call operation with its own `CallContext`.

use super::native_of;
use crate::binding::{Binding, BindingPtr, ResourceKind};
use crate::callbacks::{enter, invoke, report, CallContext};
use crate::error::{BridgeError, ErrorCode, ManagedError};
use crate::lock::LockToken;
use crate::native::{Credentials, CredentialsApi, CredentialsView, NativePtr, SetCredentialsFn};
use crate::runtime::{Arg, ManagedRuntime, Value};
use core::ffi::c_void;
use std::ffi::CStr;
use std::sync::Arc;

pub struct CredentialsProviderKind;

impl ResourceKind for CredentialsProviderKind {
    const NAME: &'static CStr = c"native_bridge.credentials_provider";
    const LABEL: &'static str = "credentials provider";

    type Api = dyn CredentialsApi;
    type Extra = ();

    fn release_native(api: &Self::Api, native: NativePtr) -> Result<(), ErrorCode> {
        api.release_provider(native)
    }
}

/// Managed representation of credentials
pub fn credentials_to_value(credentials: &Credentials) -> Value {
    Value::Map(vec![
        ("access_key_id".into(), credentials.access_key_id.clone().into()),
        ("secret_access_key".into(), credentials.secret_access_key.clone().into()),
        ("session_token".into(), credentials.session_token.clone().into()),
        (
            "expiration".into(),
            i64::try_from(credentials.expiration).map_or(Value::None, Value::Int),
        ),
    ])
}

/// Accepts a `(access_key_id, secret_access_key[, session_token])` tuple
/// or a map with those keys
pub fn credentials_from_value(value: &Value) -> Result<Credentials, ManagedError> {
    let field = |v: Option<&Value>, name: &str| -> Result<Option<String>, ManagedError> {
        match v {
            None | Some(Value::None) => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ManagedError::type_error(format!("{name} must be str, not {}", other.type_name()))),
        }
    };
    let required = |v: Option<&Value>, name: &str| -> Result<String, ManagedError> {
        field(v, name)?.ok_or_else(|| ManagedError::new("ValueError", format!("{name} is required")))
    };

    let (akid, secret, token) = match value {
        Value::Tuple(items) => (items.first(), items.get(1), items.get(2)),
        Value::Map(_) => (value.get("access_key_id"), value.get("secret_access_key"), value.get("session_token")),
        other => {
            return Err(ManagedError::type_error(format!(
                "credentials must be a tuple or dict, not {}",
                other.type_name()
            )))
        }
    };

    Ok(Credentials {
        access_key_id: required(akid, "access_key_id")?,
        secret_access_key: required(secret, "secret_access_key")?,
        session_token: field(token, "session_token")?,
        expiration: u64::MAX,
    })
}

/// Provider that always returns `credentials`
pub fn static_provider<R: ManagedRuntime>(
    runtime: &Arc<R>,
    lock: &LockToken<'_, R>,
    api: &Arc<dyn CredentialsApi>,
    credentials: &Credentials,
) -> Result<R::Object, BridgeError> {
    let ptr = Binding::<R, CredentialsProviderKind>::new(runtime, Arc::clone(api), ()).into_ptr();

    match api.new_static_provider(credentials, on_provider_shutdown::<R>, ptr.as_user_data()) {
        Ok(native) => unsafe { ptr.activate(native) }.into_capsule(lock),
        Err(code) => {
            unsafe { ptr.fail_construction(code) };
            Err(BridgeError::Native(code))
        }
    }
}

/// Provider that calls `delegate()` for every fetch
pub fn delegate_provider<R: ManagedRuntime>(
    runtime: &Arc<R>,
    lock: &LockToken<'_, R>,
    api: &Arc<dyn CredentialsApi>,
    delegate: &R::Object,
) -> Result<R::Object, BridgeError> {
    let binding = Binding::<R, CredentialsProviderKind>::new(runtime, Arc::clone(api), ());
    binding.keep(lock, "delegate", delegate);
    let ptr = binding.into_ptr();

    match api.new_delegate_provider(on_delegate_get::<R>, on_provider_shutdown::<R>, ptr.as_user_data()) {
        Ok(native) => unsafe { ptr.activate(native) }.into_capsule(lock),
        Err(code) => {
            unsafe { ptr.fail_construction(code) };
            Err(BridgeError::Native(code))
        }
    }
}

/// Fetch credentials; `on_complete(error_code, credentials | None)` fires once
pub fn get_credentials<R: ManagedRuntime>(
    runtime: &Arc<R>,
    lock: &LockToken<'_, R>,
    api: &dyn CredentialsApi,
    provider: &R::Object,
    on_complete: &R::Object,
) -> Result<(), BridgeError> {
    let native = native_of::<R, CredentialsProviderKind>(lock, provider)?;

    let mut ctx = CallContext::<R>::new(runtime, ());
    ctx.keep(lock, "on_complete", on_complete);
    let user_data = ctx.into_user_data();

    if let Err(code) = api.get_credentials(native, on_credentials_complete::<R>, user_data) {
        // Not issued: no completion will come
        if let Some(ctx) = unsafe { CallContext::<R>::reclaim(user_data) } {
            ctx.complete(lock);
        }
        return Err(BridgeError::Native(code));
    }
    Ok(())
}

unsafe extern "C" fn on_credentials_complete<R: ManagedRuntime>(
    credentials: *const CredentialsView,
    error_code: i32,
    user_data: *mut c_void,
) {
    const ORIGIN: &str = "credentials.on_complete";
    let Some(ctx) = CallContext::<R>::reclaim(user_data) else {
        return;
    };
    // Copy before the view goes away
    let credentials = (!credentials.is_null()).then(|| Credentials::from_view(&*credentials));
    let runtime = Arc::clone(ctx.runtime());

    enter(&*runtime, ORIGIN, (), move |lock| {
        if let Some(on_complete) = ctx.get("on_complete") {
            let value = credentials.as_ref().map_or(Value::None, credentials_to_value);
            let args = vec![Arg::value(error_code as i64), Arg::value(value)];
            let _ = invoke(lock, on_complete, args, ORIGIN);
        }
        ctx.complete(lock);
    });
}

unsafe extern "C" fn on_delegate_get<R: ManagedRuntime>(
    sink: *mut c_void,
    set: SetCredentialsFn,
    user_data: *mut c_void,
) -> i32 {
    const ORIGIN: &str = "credentials.delegate";
    let Some(ptr) = BindingPtr::<R, CredentialsProviderKind>::from_user_data(user_data) else {
        return ErrorCode::SUCCESS.0;
    };
    let runtime = Arc::clone(ptr.get().runtime());

    enter(&*runtime, ORIGIN, ErrorCode::SUCCESS.0, |lock| {
        let Some(delegate) = ptr.get().kept(lock, "delegate") else {
            return ErrorCode::CREDENTIALS_UNAVAILABLE.0;
        };
        let value = match invoke(lock, &delegate, Vec::new(), ORIGIN) {
            Ok(value) => value,
            Err(code) => return code.0,
        };
        match credentials_from_value(&value) {
            Ok(credentials) => {
                set(sink, &credentials.view());
                ErrorCode::SUCCESS.0
            }
            Err(err) => report(lock, &err, ORIGIN).0,
        }
    })
}

unsafe extern "C" fn on_provider_shutdown<R: ManagedRuntime>(_error_code: i32, user_data: *mut c_void) {
    const ORIGIN: &str = "credentials.on_shutdown";
    let Some(ptr) = BindingPtr::<R, CredentialsProviderKind>::from_user_data(user_data) else {
        return;
    };
    let runtime = Arc::clone(ptr.get().runtime());

    enter(&*runtime, ORIGIN, (), |_lock| ptr.signal_shutdown());
}
