//! Bridge facade
//!
//! Bundles one managed runtime, the native libraries and configuration, and
//! exposes every bridged operation. All operations take the held lock, so
//! they can be called from top-level code and from inside managed callbacks
//! alike.

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::lock::LockToken;
use crate::logging::{self, debug, perf};
use crate::loopback::Loopback;
use crate::native::{
    ConnectOptions, ConnectionApi, Credentials, CredentialsApi, NativeLibrary, RequestOptions, SignableRequest,
    SigningApi, SigningConfig,
};
use crate::resources::{connection, credentials, signing, stream};
use crate::runtime::ManagedRuntime;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Native libraries behind the bridge
#[derive(Clone)]
pub struct NativeStack {
    pub connections: Arc<dyn ConnectionApi>,
    pub credentials: Arc<dyn CredentialsApi>,
    pub signing: Arc<dyn SigningApi>,
    pub library: Arc<dyn NativeLibrary>,
}

impl NativeStack {
    /// One library implementing every contract
    pub fn from_library<L>(library: Arc<L>) -> Self
    where
        L: ConnectionApi + CredentialsApi + SigningApi + NativeLibrary + 'static,
    {
        Self {
            connections: library.clone(),
            credentials: library.clone(),
            signing: library.clone(),
            library,
        }
    }
}

pub struct Bridge<R: ManagedRuntime> {
    runtime: Arc<R>,
    native: NativeStack,
    config: BridgeConfig,
}

impl<R: ManagedRuntime> Bridge<R> {
    /// Validates `config` and applies its `[logging]` section. Logging is
    /// process-wide, so only the first bridge (or `init_logging` call) sets it.
    pub fn new(runtime: Arc<R>, native: NativeStack, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        logging::init_with_config(&config.logging);
        debug!(event = "bridge_created", threads = config.event_loop.threads);
        Ok(Self {
            runtime,
            native,
            config,
        })
    }

    /// Bridge backed by a fresh loopback library
    pub fn loopback(runtime: Arc<R>, config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let library = Loopback::new(&config);
        Self::new(runtime, NativeStack::from_library(library), config)
    }

    #[inline]
    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    #[inline]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[inline]
    pub fn native(&self) -> &NativeStack {
        &self.native
    }

    // ------------------------------------------------------------------------
    // Connections and streams
    // ------------------------------------------------------------------------

    pub fn connect(
        &self,
        lock: &LockToken<'_, R>,
        host: &str,
        port: u16,
        bootstrap: Option<&R::Object>,
        on_setup: &R::Object,
        on_shutdown: Option<&R::Object>,
    ) -> Result<(), BridgeError> {
        let options = ConnectOptions {
            host: host.to_string(),
            port,
        };
        connection::connect(
            &self.runtime,
            lock,
            &self.native.connections,
            options,
            bootstrap,
            on_setup,
            on_shutdown,
        )
    }

    pub fn close_connection(&self, lock: &LockToken<'_, R>, connection: &R::Object) -> Result<(), BridgeError> {
        connection::close(lock, &*self.native.connections, connection)
    }

    pub fn is_connection_open(&self, lock: &LockToken<'_, R>, connection: &R::Object) -> Result<bool, BridgeError> {
        connection::is_open(lock, &*self.native.connections, connection)
    }

    pub fn request(
        &self,
        lock: &LockToken<'_, R>,
        connection: &R::Object,
        options: RequestOptions,
        body: Option<&R::Object>,
        on_body: Option<&R::Object>,
        on_complete: &R::Object,
    ) -> Result<R::Object, BridgeError> {
        stream::request(
            &self.runtime,
            lock,
            &self.native.connections,
            connection,
            options,
            body,
            on_body,
            on_complete,
        )
    }

    pub fn cancel_stream(&self, lock: &LockToken<'_, R>, stream: &R::Object) -> Result<(), BridgeError> {
        stream::cancel(lock, &*self.native.connections, stream)
    }

    // ------------------------------------------------------------------------
    // Credentials and signing
    // ------------------------------------------------------------------------

    pub fn static_credentials_provider(
        &self,
        lock: &LockToken<'_, R>,
        credentials: &Credentials,
    ) -> Result<R::Object, BridgeError> {
        credentials::static_provider(&self.runtime, lock, &self.native.credentials, credentials)
    }

    pub fn delegate_credentials_provider(
        &self,
        lock: &LockToken<'_, R>,
        delegate: &R::Object,
    ) -> Result<R::Object, BridgeError> {
        credentials::delegate_provider(&self.runtime, lock, &self.native.credentials, delegate)
    }

    pub fn get_credentials(
        &self,
        lock: &LockToken<'_, R>,
        provider: &R::Object,
        on_complete: &R::Object,
    ) -> Result<(), BridgeError> {
        credentials::get_credentials(&self.runtime, lock, &*self.native.credentials, provider, on_complete)
    }

    pub fn sign_request(
        &self,
        lock: &LockToken<'_, R>,
        provider: &R::Object,
        request: &SignableRequest,
        config: &SigningConfig,
        on_complete: &R::Object,
    ) -> Result<(), BridgeError> {
        signing::sign_request(
            &self.runtime,
            lock,
            &*self.native.signing,
            provider,
            request,
            config,
            on_complete,
        )
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Wait for native background work with the lock released, so pending
    /// callbacks can run. `None` uses `shutdown.join_timeout_ms`.
    /// Returns false on timeout.
    pub fn join_all_threads(&self, lock: &LockToken<'_, R>, timeout: Option<Duration>) -> bool {
        let _perf = perf::track("join_all_threads");
        let timeout = timeout.unwrap_or_else(|| self.config.shutdown.join_timeout());
        let library = Arc::clone(&self.native.library);
        lock.allow_threads(move || library.join_all_threads(timeout))
    }
}

impl<R: ManagedRuntime> fmt::Debug for Bridge<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
