//! Loopback credential providers

use super::{native_ptr_of, EventLoopGroup, Loopback};
use crate::error::ErrorCode;
use crate::logging::{debug, trace, warn};
use crate::native::{
    Credentials, CredentialsApi, CredentialsFn, CredentialsView, DelegateGetFn, NativePtr, ShutdownFn,
    UserData,
};
use core::ffi::c_void;
use std::sync::Arc;

enum Source {
    Static(Credentials),
    Delegate(DelegateGetFn),
}

/// A provider stays alive while the registry or an in-flight fetch holds
/// it; the last holder schedules the shutdown callback.
pub(super) struct LoopProvider {
    source: Source,
    on_shutdown: ShutdownFn,
    user_data: UserData,
    group: Arc<EventLoopGroup>,
}

impl LoopProvider {
    /// Fetch credentials; runs on an event-loop thread
    pub(super) fn resolve(&self) -> Result<Credentials, ErrorCode> {
        match &self.source {
            Source::Static(credentials) => Ok(credentials.clone()),
            Source::Delegate(get) => {
                let mut sink: Option<Credentials> = None;
                // Safety: `sink` outlives the call and matches `store_credentials`
                let rc = unsafe {
                    get(
                        (&mut sink as *mut Option<Credentials>).cast(),
                        store_credentials,
                        self.user_data.0,
                    )
                };
                ErrorCode::check(rc)?;
                sink.ok_or(ErrorCode::CREDENTIALS_UNAVAILABLE)
            }
        }
    }
}

impl Drop for LoopProvider {
    fn drop(&mut self) {
        let on_shutdown = self.on_shutdown;
        let user_data = self.user_data;
        let scheduled = self.group.schedule(move || {
            let user_data = user_data;
            trace!(event = "loopback_provider_shutdown");
            // Safety: shutdown fires once, after every fetch released its hold
            unsafe { on_shutdown(ErrorCode::SUCCESS.0, user_data.0) };
        });
        if !scheduled {
            warn!(event = "loopback_provider_shutdown_dropped", "event loop gone; shutdown not delivered");
        }
    }
}

/// `SetCredentialsFn` used by delegate providers
unsafe extern "C" fn store_credentials(sink: *mut c_void, credentials: *const CredentialsView) {
    if sink.is_null() || credentials.is_null() {
        return;
    }
    *sink.cast::<Option<Credentials>>() = Some(Credentials::from_view(&*credentials));
}

impl Loopback {
    fn register_provider(&self, source: Source, on_shutdown: ShutdownFn, user_data: *mut c_void) -> NativePtr {
        let provider = Arc::new(LoopProvider {
            source,
            on_shutdown,
            user_data: UserData(user_data),
            group: Arc::clone(&self.shared.group),
        });
        let ptr = native_ptr_of(&provider);
        self.shared.providers.insert(ptr.addr(), provider);
        ptr
    }

    pub(super) fn provider(&self, provider: NativePtr) -> Result<Arc<LoopProvider>, ErrorCode> {
        self.shared
            .providers
            .get(&provider.addr())
            .map(|p| Arc::clone(p.value()))
            .ok_or(ErrorCode::INVALID_ARGUMENT)
    }
}

impl CredentialsApi for Loopback {
    fn new_static_provider(
        &self,
        credentials: &Credentials,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<NativePtr, ErrorCode> {
        if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
            return Err(ErrorCode::INVALID_ARGUMENT);
        }
        debug!(event = "loopback_provider_created", source = "static");
        Ok(self.register_provider(Source::Static(credentials.clone()), on_shutdown, user_data))
    }

    fn new_delegate_provider(
        &self,
        get: DelegateGetFn,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<NativePtr, ErrorCode> {
        debug!(event = "loopback_provider_created", source = "delegate");
        Ok(self.register_provider(Source::Delegate(get), on_shutdown, user_data))
    }

    fn get_credentials(
        &self,
        provider: NativePtr,
        on_complete: CredentialsFn,
        user_data: *mut c_void,
    ) -> Result<(), ErrorCode> {
        let provider = self.provider(provider)?;
        let user_data = UserData(user_data);

        let scheduled = self.shared.group.schedule(move || {
            let user_data = user_data;
            match provider.resolve() {
                Ok(credentials) => {
                    let view = credentials.view();
                    // Safety: the view borrows `credentials`, alive across the call
                    unsafe { on_complete(&view, ErrorCode::SUCCESS.0, user_data.0) };
                }
                Err(code) => unsafe { on_complete(core::ptr::null(), code.0, user_data.0) },
            }
            // Last fetch out may trigger the shutdown callback
            drop(provider);
        });

        if scheduled {
            Ok(())
        } else {
            Err(ErrorCode::SHUTDOWN_IN_PROGRESS)
        }
    }

    fn release_provider(&self, provider: NativePtr) -> Result<(), ErrorCode> {
        self.shared
            .providers
            .remove(&provider.addr())
            .map(|_| ())
            .ok_or(ErrorCode::INVALID_ARGUMENT)
    }
}
