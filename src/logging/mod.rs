//! Logging infrastructure - structured tracing throughout the bridge
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels from the environment
//! - Zero-cost when disabled
//! - Console output, or a daily-rotated file via `tracing-appender`
//! - Named events (`event = "..."`) for every lifecycle transition

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

pub use tracing::{debug, error, info, trace, warn, Level};

/// Global logging state; holds the appender guard so file output is flushed
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Log file directory; console (stderr) when unset
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Show span events (new/close)
    #[serde(default)]
    pub show_spans: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            directory: None,
            format: LogFormat::default(),
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `NATIVE_BRIDGE_LOG_*` variables on top of this config
    pub fn with_env_overrides(mut self) -> Self {
        // NATIVE_BRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("NATIVE_BRIDGE_LOG_LEVEL") {
            self.level = level.to_lowercase();
        }

        // NATIVE_BRIDGE_LOG_FILE: directory for rotated log files
        if let Ok(dir) = std::env::var("NATIVE_BRIDGE_LOG_FILE") {
            self.directory = Some(dir);
        }

        if std::env::var("NATIVE_BRIDGE_LOG_JSON").is_ok() {
            self.format = LogFormat::Json;
        }

        if std::env::var("NATIVE_BRIDGE_LOG_SPANS").is_ok() {
            self.show_spans = true;
        }

        self
    }

    /// Verbose config for debugging lifetime issues
    pub fn debug() -> Self {
        Self {
            level: "trace".to_string(),
            directory: None,
            format: LogFormat::Pretty,
            show_spans: true,
        }
    }

    /// Parsed level, falling back to INFO on garbage input
    pub fn level(&self) -> Level {
        self.level.parse().unwrap_or(Level::INFO)
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(&LogConfig::from_env());
}

/// Initialize logging with a custom configuration (idempotent)
pub fn init_with_config(config: &LogConfig) {
    LOGGER.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "native_bridge={}",
                config.level().as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match &config.directory {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, "native-bridge.log");
                let (w, g) = tracing_appender::non_blocking(appender);
                (w, Some(g))
            }
            None => {
                let (w, g) = tracing_appender::non_blocking(io::stderr());
                (w, Some(g))
            }
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(true);

        let layer = match config.format {
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Json => layer.json().boxed(),
        };

        // Another subscriber may already be installed by the host
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            return None;
        }
        guard
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

// ============================================================================
// Bridge-specific logging functions
// ============================================================================

/// Log a binding phase transition
#[inline]
pub fn log_transition(kind: &str, binding: *const (), from: &str, to: &str, signal: &str) {
    debug!(
        event = "binding_transition",
        kind,
        binding = ?binding,
        from,
        to,
        signal,
        "Binding phase changed"
    );
}

/// Log the moment binding memory is freed
#[inline]
pub fn log_binding_freed(kind: &str, binding: *const (), kept_refs: usize) {
    debug!(
        event = "binding_freed",
        kind,
        binding = ?binding,
        kept_refs,
        "Binding freed"
    );
}

/// Log a native construction failure
pub fn log_construction_failed(kind: &str, code: crate::error::ErrorCode) {
    debug!(
        event = "construction_failed",
        kind,
        code = code.0,
        name = code.name(),
        "Native constructor failed"
    );
}

/// Log a callback dropped because the managed runtime is gone
#[inline]
pub fn log_runtime_unavailable(origin: &str) {
    trace!(
        event = "runtime_unavailable",
        origin,
        "Managed runtime unavailable, callback skipped"
    );
}

/// Log a managed callback failure mapped to a native code
pub fn log_callback_error(origin: &str, error: &str) {
    debug!(
        event = "callback_error",
        origin,
        error,
        "Managed callback failed"
    );
}

/// Log a panic caught at the native boundary
pub fn log_callback_panic(origin: &str) {
    error!(
        event = "callback_panic",
        origin,
        "Panic caught in native callback adapter"
    );
}

/// Log a lifetime protocol violation (followed by a fatal panic)
pub fn log_protocol_violation(detail: &str) {
    error!(
        event = "protocol_violation",
        detail,
        "Lifetime protocol violated"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            debug!(
                operation = self.operation,
                duration_us = self.start.elapsed().as_micros() as u64,
                "operation completed"
            );
        }
    }
}
