//! native-bridge - lifetime bridge between callback-driven native resources
//! and a reference-counted managed runtime
//!
//! Native objects are wrapped in a `Binding` that pins every managed object
//! the native side may call back into, and is freed only after both the
//! managed release and the native shutdown have happened, in either order.

// Core modules
pub mod binding;
pub mod callbacks;
pub mod error;
pub mod lock;
pub mod refs;
pub mod runtime;

// Native side
pub mod loopback;
pub mod native;
pub mod resources;

// Surface
pub mod bridge;
pub mod config;
pub mod logging;

#[cfg(feature = "python")]
mod python;

// Re-export commonly used items
pub use binding::{stats, BindingStats, Handle, Phase, ProtocolViolation, ResourceKind, Signal};
pub use bridge::{Bridge, NativeStack};
pub use callbacks::{in_flight_calls, CallContext};
pub use config::BridgeConfig;
pub use error::{BridgeError, ErrorCode, FatalViolation, ManagedError, Result, Unavailable};
pub use lock::LockToken;
pub use logging::{init as init_logging, LogConfig};
pub use loopback::Loopback;
pub use native::{ConnectOptions, Credentials, RequestOptions, SignableRequest, SigningConfig};
pub use refs::{live_refs, KeptRef, KeptRefs};
pub use resources::{ConnectionKind, CredentialsProviderKind, StreamKind};
pub use runtime::{Arg, ManagedHeap, ManagedRuntime, ObjRef, Value};

/// Initialize the bridge with logging configured from the environment
pub fn init() {
    logging::init();
}
