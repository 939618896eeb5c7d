//! Loopback native library
//!
//! Design: an in-process implementation of every native contract, running
//! its callbacks on an `EventLoopGroup` the way a real networking library
//! does:
//! - connections accept any host except `"refused"` (or port 0) and echo
//!   each request body back as response chunks
//! - credential providers serve static or delegate credentials and report
//!   shutdown only after in-flight fetches drain
//! - signing computes an HMAC-SHA256 request signature
//!
//! Native objects live in registries keyed by their address; the pointer
//! handed out is the address of the registered `Arc`'s contents.

mod connection;
mod credentials;
mod event_loop;
mod signing;


pub use event_loop::EventLoopGroup;
pub use signing::{sign, ALGORITHM};

use crate::config::{BridgeConfig, LoopbackConfig};
use crate::logging::debug;
use crate::native::{NativeLibrary, NativePtr};
use connection::{LoopConnection, LoopStream};
use credentials::LoopProvider;
use core::ptr::NonNull;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// State shared with scheduled jobs
struct Shared {
    group: Arc<EventLoopGroup>,
    config: LoopbackConfig,
    connections: DashMap<usize, Arc<LoopConnection>>,
    streams: DashMap<usize, Arc<LoopStream>>,
    providers: DashMap<usize, Arc<LoopProvider>>,
}

pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    /// Library with its own event-loop group sized from `config`
    pub fn new(config: &BridgeConfig) -> Arc<Self> {
        Self::with_group(EventLoopGroup::new(config.event_loop.threads), config.loopback.clone())
    }

    pub fn with_group(group: Arc<EventLoopGroup>, config: LoopbackConfig) -> Arc<Self> {
        debug!(
            event = "loopback_created",
            threads = group.threads(),
            chunk_size = config.chunk_size,
            max_body_size = config.max_body_size
        );
        Arc::new(Self {
            shared: Arc::new(Shared {
                group,
                config,
                connections: DashMap::new(),
                streams: DashMap::new(),
                providers: DashMap::new(),
            }),
        })
    }

    pub fn group(&self) -> &Arc<EventLoopGroup> {
        &self.shared.group
    }

    /// Simulate the peer closing every connection to `host`.
    /// Returns the number of connections closed.
    pub fn hang_up(&self, host: &str) -> usize {
        let targets: Vec<_> = self
            .shared
            .connections
            .iter()
            .filter(|entry| entry.host() == host)
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        targets
            .iter()
            .filter(|conn| conn.close(&self.shared, crate::error::ErrorCode::CONNECTION_CLOSED))
            .count()
    }

    /// Registered native objects (connections, streams, providers)
    pub fn live_objects(&self) -> usize {
        self.shared.connections.len() + self.shared.streams.len() + self.shared.providers.len()
    }
}

impl NativeLibrary for Loopback {
    fn join_all_threads(&self, timeout: Duration) -> bool {
        let joined = self.shared.group.wait_idle(timeout);
        debug!(event = "join_all_threads", joined, timeout_ms = timeout.as_millis() as u64);
        joined
    }
}

/// Native pointer for a registered object
fn native_ptr_of<T>(object: &Arc<T>) -> NativePtr {
    NativePtr::from_nonnull(NonNull::from(&**object).cast())
}
