//! Native API contract
//!
//! Design: every wrapped native library looks the same from the bridge:
//! - constructors take a shutdown callback plus an opaque `user_data`
//! - release is called at most once and only schedules shutdown
//! - operations take a completion callback and per-call `user_data`,
//!   invoked exactly once and never from inside the issuing call
//!
//! Callbacks use the C calling convention and only FFI-safe arguments.
//! Data handed to a callback (`ByteCursor` views) is valid for the duration
//! of that callback only.

use crate::error::ErrorCode;
use core::ffi::c_void;
use core::ptr::NonNull;
use std::fmt;
use std::time::Duration;

/// Pointer to a native object, owned by the native library
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativePtr(NonNull<c_void>);

// Safety: native objects are thread-safe by contract; the pointer is an
// opaque address the bridge never dereferences
unsafe impl Send for NativePtr {}
unsafe impl Sync for NativePtr {}

impl NativePtr {
    #[inline]
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[inline]
    pub fn from_nonnull(ptr: NonNull<c_void>) -> Self {
        Self(ptr)
    }

    /// A non-null pointer that refers to nothing, for test doubles
    #[inline]
    pub fn dangling() -> Self {
        Self(NonNull::dangling())
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativePtr({:p})", self.0)
    }
}

/// Opaque callback context carried by the native side
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub *mut c_void);

// Safety: the native side only stores and returns this value
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({:p})", self.0)
    }
}

/// Borrowed byte range (`ptr` may be null when `len` is 0)
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ByteCursor {
    pub ptr: *const u8,
    pub len: usize,
}

impl ByteCursor {
    pub const EMPTY: Self = Self {
        ptr: core::ptr::null(),
        len: 0,
    };

    #[inline]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// # Safety
    /// `ptr` must be valid for `len` bytes for the returned lifetime.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.len == 0 {
            &[]
        } else {
            core::slice::from_raw_parts(self.ptr, self.len)
        }
    }

    /// Owned copy, lossily decoded as UTF-8
    ///
    /// # Safety
    /// Same as `as_slice`.
    pub unsafe fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_slice()).into_owned()
    }
}

// ============================================================================
// Callback signatures
// ============================================================================

/// Native object finished shutting down. Fires at most once.
pub type ShutdownFn = unsafe extern "C" fn(error_code: i32, user_data: *mut c_void);

/// Connection attempt finished; `connection` is null on failure.
pub type ConnectionSetupFn =
    unsafe extern "C" fn(connection: *mut c_void, error_code: i32, user_data: *mut c_void);

/// Fill `buf` with up to `capacity` bytes of request body.
pub type ReadBodyFn = unsafe extern "C" fn(
    buf: *mut u8,
    capacity: usize,
    written: *mut usize,
    eof: *mut bool,
    user_data: *mut c_void,
) -> i32;

/// One chunk of response body. Non-zero return fails the stream.
pub type BodyFn =
    unsafe extern "C" fn(stream: *mut c_void, data: *const u8, len: usize, user_data: *mut c_void) -> i32;

/// Stream finished. Fires exactly once per activated stream.
pub type StreamCompleteFn = unsafe extern "C" fn(stream: *mut c_void, error_code: i32, user_data: *mut c_void);

/// Credentials fetch finished; `credentials` is null on failure.
pub type CredentialsFn =
    unsafe extern "C" fn(credentials: *const CredentialsView, error_code: i32, user_data: *mut c_void);

/// Store credentials into a native-owned sink (copies the view).
pub type SetCredentialsFn = unsafe extern "C" fn(sink: *mut c_void, credentials: *const CredentialsView);

/// Delegate provider callback: produce credentials through `set`.
pub type DelegateGetFn =
    unsafe extern "C" fn(sink: *mut c_void, set: SetCredentialsFn, user_data: *mut c_void) -> i32;

/// Signing finished; `result` is null on failure.
pub type SignedFn =
    unsafe extern "C" fn(result: *const SigningResultView, error_code: i32, user_data: *mut c_void);

// ============================================================================
// Data exchanged with native code
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestOptions {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// Callbacks for one stream; all receive the same `user_data`
#[derive(Clone, Copy)]
pub struct StreamCallbacks {
    /// Request body source; no body when `None`
    pub read_body: Option<ReadBodyFn>,
    pub on_body: Option<BodyFn>,
    pub on_complete: StreamCompleteFn,
    pub user_data: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CredentialsView {
    pub access_key_id: ByteCursor,
    pub secret_access_key: ByteCursor,
    /// Null when absent
    pub session_token: ByteCursor,
    /// Seconds since the epoch; `u64::MAX` when the credentials never expire
    pub expiration: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HeaderView {
    pub name: ByteCursor,
    pub value: ByteCursor,
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SigningResultView {
    pub headers: *const HeaderView,
    pub count: usize,
}

impl SigningResultView {
    /// # Safety
    /// `headers` must point at `count` valid views.
    pub unsafe fn headers<'a>(&self) -> &'a [HeaderView] {
        if self.headers.is_null() || self.count == 0 {
            &[]
        } else {
            core::slice::from_raw_parts(self.headers, self.count)
        }
    }
}

/// Owned credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: u64,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiration: u64::MAX,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Borrowed view, valid while `self` is
    pub fn view(&self) -> CredentialsView {
        CredentialsView {
            access_key_id: ByteCursor::from_slice(self.access_key_id.as_bytes()),
            secret_access_key: ByteCursor::from_slice(self.secret_access_key.as_bytes()),
            session_token: self
                .session_token
                .as_deref()
                .map_or(ByteCursor::EMPTY, |t| ByteCursor::from_slice(t.as_bytes())),
            expiration: self.expiration,
        }
    }

    /// Copy out of a view
    ///
    /// # Safety
    /// Every cursor in `view` must be valid.
    pub unsafe fn from_view(view: &CredentialsView) -> Self {
        Self {
            access_key_id: view.access_key_id.to_string_lossy(),
            secret_access_key: view.secret_access_key.to_string_lossy(),
            session_token: (!view.session_token.is_null()).then(|| view.session_token.to_string_lossy()),
            expiration: view.expiration,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignableRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningConfig {
    pub region: String,
    pub service: String,
    /// Signing time, seconds since the epoch
    pub timestamp: u64,
}

// ============================================================================
// Native library traits
// ============================================================================

pub trait ConnectionApi: Send + Sync {
    /// Start connecting. On `Err` no callback will ever fire.
    ///
    /// `on_setup` fires once. `on_shutdown` fires once, only if setup
    /// succeeded, after release or a remote close.
    fn connect(
        &self,
        options: &ConnectOptions,
        on_setup: ConnectionSetupFn,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<(), ErrorCode>;

    /// Begin closing; `on_shutdown` follows
    fn close(&self, connection: NativePtr);

    fn is_open(&self, connection: NativePtr) -> bool;

    /// Last use of the pointer. Closes the connection if still open.
    fn release_connection(&self, connection: NativePtr) -> Result<(), ErrorCode>;

    /// Create an unstarted stream on an open connection
    fn make_request(
        &self,
        connection: NativePtr,
        options: &RequestOptions,
        callbacks: StreamCallbacks,
    ) -> Result<NativePtr, ErrorCode>;

    /// Start the stream. On `Err` no stream callback will fire.
    fn activate_stream(&self, stream: NativePtr) -> Result<(), ErrorCode>;

    /// Advisory: the completion callback still fires, carrying `code`
    fn cancel_stream(&self, stream: NativePtr, code: ErrorCode);

    /// Last use of the pointer; a running stream still completes
    fn release_stream(&self, stream: NativePtr) -> Result<(), ErrorCode>;
}

pub trait CredentialsApi: Send + Sync {
    fn new_static_provider(
        &self,
        credentials: &Credentials,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<NativePtr, ErrorCode>;

    /// `get` and `on_shutdown` share `user_data`; `get` is never called
    /// after shutdown has fired
    fn new_delegate_provider(
        &self,
        get: DelegateGetFn,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<NativePtr, ErrorCode>;

    fn get_credentials(
        &self,
        provider: NativePtr,
        on_complete: CredentialsFn,
        user_data: *mut c_void,
    ) -> Result<(), ErrorCode>;

    /// Shutdown fires once every in-flight fetch has completed
    fn release_provider(&self, provider: NativePtr) -> Result<(), ErrorCode>;
}

pub trait SigningApi: Send + Sync {
    fn sign_request(
        &self,
        request: &SignableRequest,
        config: &SigningConfig,
        provider: NativePtr,
        on_complete: SignedFn,
        user_data: *mut c_void,
    ) -> Result<(), ErrorCode>;
}

pub trait NativeLibrary: Send + Sync {
    /// Wait for background work to drain; false on timeout
    fn join_all_threads(&self, timeout: Duration) -> bool;
}
