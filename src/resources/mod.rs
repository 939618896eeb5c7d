//! Bridged resource types
//!
//! Each submodule pairs a `ResourceKind` with its managed-facing operations
//! and the `extern "C"` adapters it registers with the native library.
//! All operations take the held lock and return managed objects as new
//! references.

pub mod connection;
pub mod credentials;
pub mod signing;
pub mod stream;


pub use connection::ConnectionKind;
pub use credentials::CredentialsProviderKind;
pub use stream::StreamKind;

use crate::binding::{Handle, ResourceKind};
use crate::error::BridgeError;
use crate::lock::LockToken;
use crate::native::NativePtr;
use crate::runtime::ManagedRuntime;

/// Native pointer behind a live handle capsule of kind `K`
pub(crate) fn native_of<R: ManagedRuntime, K: ResourceKind>(
    lock: &LockToken<'_, R>,
    capsule: &R::Object,
) -> Result<NativePtr, BridgeError> {
    Ok(Handle::<R, K>::from_capsule(lock, capsule)?.native())
}
