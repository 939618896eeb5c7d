//! Request signing (per-call)

use super::{native_of, CredentialsProviderKind};
use crate::callbacks::{enter, invoke, CallContext};
use crate::error::BridgeError;
use crate::lock::LockToken;
use crate::native::{SignableRequest, SigningApi, SigningConfig, SigningResultView};
use crate::runtime::{Arg, ManagedRuntime, Value};
use core::ffi::c_void;
use std::sync::Arc;

/// Sign `request` with credentials from `provider`.
///
/// `on_complete(error_code, headers | None)` fires once; headers are a map
/// of the header names and values to add to the request.
pub fn sign_request<R: ManagedRuntime>(
    runtime: &Arc<R>,
    lock: &LockToken<'_, R>,
    api: &dyn SigningApi,
    provider: &R::Object,
    request: &SignableRequest,
    config: &SigningConfig,
    on_complete: &R::Object,
) -> Result<(), BridgeError> {
    let native = native_of::<R, CredentialsProviderKind>(lock, provider)?;

    let mut ctx = CallContext::<R>::new(runtime, ());
    ctx.keep(lock, "provider", provider);
    ctx.keep(lock, "on_complete", on_complete);
    let user_data = ctx.into_user_data();

    if let Err(code) = api.sign_request(request, config, native, on_signing_complete::<R>, user_data) {
        if let Some(ctx) = unsafe { CallContext::<R>::reclaim(user_data) } {
            ctx.complete(lock);
        }
        return Err(BridgeError::Native(code));
    }
    Ok(())
}

unsafe extern "C" fn on_signing_complete<R: ManagedRuntime>(
    result: *const SigningResultView,
    error_code: i32,
    user_data: *mut c_void,
) {
    const ORIGIN: &str = "signing.on_complete";
    let Some(ctx) = CallContext::<R>::reclaim(user_data) else {
        return;
    };
    let headers = (!result.is_null()).then(|| {
        (*result)
            .headers()
            .iter()
            .map(|h| (h.name.to_string_lossy(), Value::Str(h.value.to_string_lossy())))
            .collect::<Vec<_>>()
    });
    let runtime = Arc::clone(ctx.runtime());

    enter(&*runtime, ORIGIN, (), move |lock| {
        if let Some(on_complete) = ctx.get("on_complete") {
            let value = headers.map_or(Value::None, Value::Map);
            let args = vec![Arg::value(error_code as i64), Arg::value(value)];
            let _ = invoke(lock, on_complete, args, ORIGIN);
        }
        ctx.complete(lock);
    });
}
