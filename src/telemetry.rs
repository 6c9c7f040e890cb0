//! Tracing initialization and relayer counters.
//!
//! Metrics exposition and error reporting transports live outside this
//! process; the relayer only maintains the [`Observer`] counter set that
//! such sinks (and the health endpoint) read.

use std::env;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Builder for the tracing subscriber stack.
///
/// Filtering follows `RUST_LOG`; without it, the service logs at `info`.
pub struct Telemetry {
    name: &'static str,
    version: &'static str,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self { name: "relayer", version: "0.0.0" }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    pub fn register(self) {
        let filter = env::var(EnvFilter::DEFAULT_ENV)
            .map(EnvFilter::new)
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
        tracing::info!(service = self.name, version = self.version, "telemetry initialized");
    }
}

/// Process-wide counters. Cheap to bump from any task; read by the health
/// endpoint and logged at connection teardown.
#[derive(Debug, Default)]
pub struct Observer {
    active_connections: AtomicUsize,
    messages: AtomicU64,
    errors: AtomicU64,
    broadcasts: AtomicU64,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the active-connection gauge and return the new value.
    pub fn connection_opened(&self) -> usize {
        self.active_connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn connection_closed(&self) -> usize {
        let previous = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        previous.saturating_sub(1)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn count_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Malformed JSON, unknown types, oversized frames, handler failures.
    pub fn count_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn count_broadcast(&self, recipients: usize) {
        self.broadcasts.fetch_add(recipients as u64, Ordering::Relaxed);
    }

    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_gauge_tracks_open_and_close() {
        let observer = Observer::new();
        assert_eq!(observer.connection_opened(), 1);
        assert_eq!(observer.connection_opened(), 2);
        assert_eq!(observer.connection_closed(), 1);
        assert_eq!(observer.active_connections(), 1);
    }

    #[test]
    fn counters_accumulate() {
        let observer = Observer::new();
        observer.count_message();
        observer.count_message();
        observer.count_error();
        observer.count_broadcast(3);
        assert_eq!(observer.messages(), 2);
        assert_eq!(observer.errors(), 1);
        assert_eq!(observer.broadcasts(), 3);
    }
}
