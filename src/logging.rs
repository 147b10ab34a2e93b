//! Diagnostic log sink and tracing setup.
//!
//! Raw diagnostic detail (response bodies, parser errors, rejected
//! endpoints) is never returned to callers.  It is handed to a
//! [`DebugLog`] sink instead, which the host application enables or
//! disables with its debug flag.

use std::sync::Mutex;

use crate::config::LoggingConfig;

/// Tracing target used for debug-sink entries.
pub const DEBUG_TARGET: &str = "s3cs::debug";

/// Destination for diagnostic messages.
pub trait DebugLog: Send + Sync {
    /// Whether the host has debug logging switched on.
    fn enabled(&self) -> bool;

    /// Store one diagnostic entry.  Only called when [`enabled`](Self::enabled).
    fn write(&self, message: &str);

    /// Record a diagnostic entry if logging is enabled.
    fn record(&self, message: &str) {
        if self.enabled() {
            self.write(message);
        }
    }
}

/// Forwards entries to `tracing` under [`DEBUG_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDebugLog {
    enabled: bool,
}

impl TracingDebugLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl DebugLog for TracingDebugLog {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn write(&self, message: &str) {
        tracing::debug!(target: DEBUG_TARGET, "[S3CS] {}", message);
    }
}

/// Keeps entries in memory so a host can display them later.
#[derive(Debug, Default)]
pub struct BufferedDebugLog {
    entries: Mutex<Vec<String>>,
}

impl BufferedDebugLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded entries, oldest first.
    pub fn entries(&self) -> Vec<String> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Drop all recorded entries.
    pub fn clear(&self) {
        match self.entries.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl DebugLog for BufferedDebugLog {
    fn enabled(&self) -> bool {
        true
    }

    fn write(&self, message: &str) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(message.to_string()),
            Err(poisoned) => poisoned.into_inner().push(message.to_string()),
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.  The format is
/// `json` or anything else for human-readable text.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A second init (tests, embedding hosts) keeps the first subscriber.
    let _ = if config.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
