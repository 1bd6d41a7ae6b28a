//! Immutable configuration snapshots.
//!
//! Components receive their configuration at construction and never observe in-place changes;
//! reconfiguration is expressed as stop, rebuild with a new snapshot, restart.
use std::time::Duration;

/// Default maximum number of queued analytics events.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;
/// Default interval between automatic event flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Default interval between flag polls when streaming is not used.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(300);

/// Endpoints and credentials for talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Base URL for flag requests.
    pub base_url: String,
    /// Base URL for the server-push stream.
    pub stream_url: String,
    /// Base URL for event publishing.
    pub events_url: String,
    /// Credential identifying the SDK installation.
    pub sdk_key: String,
    /// SDK name reported to the backend.
    pub sdk_name: String,
    /// SDK version reported to the backend.
    pub sdk_version: String,
}

impl ServiceConfig {
    /// Create a configuration for the given credential with default endpoint URLs.
    pub fn new(sdk_key: impl Into<String>) -> ServiceConfig {
        ServiceConfig {
            base_url: "https://app.flagsync.example".to_owned(),
            stream_url: "https://stream.flagsync.example".to_owned(),
            events_url: "https://events.flagsync.example".to_owned(),
            sdk_key: sdk_key.into(),
            sdk_name: "flagsync".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Override the flag request base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> ServiceConfig {
        self.base_url = base_url.into();
        self
    }

    /// Override the stream base URL.
    pub fn with_stream_url(mut self, stream_url: impl Into<String>) -> ServiceConfig {
        self.stream_url = stream_url.into();
        self
    }

    /// Override the events base URL.
    pub fn with_events_url(mut self, events_url: impl Into<String>) -> ServiceConfig {
        self.events_url = events_url.into();
        self
    }
}

/// Configuration for the event reporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsConfig {
    /// Maximum number of queued events; recording beyond this drops the new event.
    pub event_capacity: usize,
    /// Interval between automatic flushes while online.
    pub flush_interval: Duration,
}

impl EventsConfig {
    /// Create a configuration with default capacity and flush interval.
    pub fn new() -> EventsConfig {
        EventsConfig {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    /// Override the queue capacity.
    pub fn with_event_capacity(mut self, event_capacity: usize) -> EventsConfig {
        self.event_capacity = event_capacity;
        self
    }

    /// Override the flush interval.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> EventsConfig {
        self.flush_interval = flush_interval;
        self
    }
}

impl Default for EventsConfig {
    fn default() -> EventsConfig {
        EventsConfig::new()
    }
}

/// Configuration for the flag synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Interval between flag requests in polling mode.
    pub polling_interval: Duration,
    /// Whether flag requests use the REPORT verb (with a single GET fallback on
    /// method-rejection statuses).
    pub use_report: bool,
}

impl SyncConfig {
    /// Create a configuration with the default poll interval and GET requests.
    pub fn new() -> SyncConfig {
        SyncConfig {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            use_report: false,
        }
    }

    /// Override the polling interval.
    pub fn with_polling_interval(mut self, polling_interval: Duration) -> SyncConfig {
        self.polling_interval = polling_interval;
        self
    }

    /// Request flags with the REPORT verb.
    pub fn with_use_report(mut self, use_report: bool) -> SyncConfig {
        self.use_report = use_report;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig::new()
    }
}
