use std::time::Duration;

use serde::Deserialize;

const fn default_batch_size() -> usize {
    1000
}

const fn default_concurrency() -> usize {
    10
}

const fn default_message_rate() -> usize {
    10
}

const fn default_max_send_errors() -> i64 {
    1000
}

const fn default_scan_interval() -> u64 {
    5
}

const fn default_true() -> bool {
    true
}

const fn default_window_duration() -> u64 {
    3600
}

const fn default_window_rate() -> usize {
    10_000
}

fn default_root_url() -> String {
    "http://localhost:9000".to_string()
}

/// Cap on messages pushed per window across the whole engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SlidingWindow {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_window_duration")]
    pub duration_secs: u64,

    #[serde(default = "default_window_rate")]
    pub rate: usize,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_secs: default_window_duration(),
            rate: default_window_rate(),
        }
    }
}

impl SlidingWindow {
    /// A window only limits anything when it spans more than a second and
    /// allows at least one message.
    pub const fn is_active(&self) -> bool {
        self.enabled && self.rate > 0 && self.duration_secs > 1
    }

    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Delivery engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Subscribers fetched per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of delivery workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Messages a single worker pushes per second before pausing
    #[serde(default = "default_message_rate")]
    pub message_rate: usize,

    /// Push failures after which a campaign is paused.
    ///
    /// Zero or negative disables the threshold entirely.
    #[serde(default = "default_max_send_errors")]
    pub max_send_errors: i64,

    /// How often to look for due campaigns (in seconds)
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Discover campaigns at all. Disable on instances that only run workers.
    #[serde(default = "default_true")]
    pub scan_campaigns: bool,

    #[serde(default)]
    pub sliding_window: SlidingWindow,

    /// Track clicks and views per subscriber instead of anonymously
    #[serde(default)]
    pub individual_tracking: bool,

    /// Add `List-Unsubscribe` headers to campaign messages
    #[serde(default = "default_true")]
    pub unsubscribe_header: bool,

    /// Public URL tracking, unsubscribe and archive links are built from
    #[serde(default = "default_root_url")]
    pub root_url: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            message_rate: default_message_rate(),
            max_send_errors: default_max_send_errors(),
            scan_interval_secs: default_scan_interval(),
            scan_campaigns: true,
            sliding_window: SlidingWindow::default(),
            individual_tracking: false,
            unsubscribe_header: true,
            root_url: default_root_url(),
        }
    }
}

impl ManagerConfig {
    /// Clamp values that would stall the engine to their minimum.
    #[must_use]
    pub fn normalised(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.concurrency = self.concurrency.max(1);
        self.message_rate = self.message_rate.max(1);
        self.scan_interval_secs = self.scan_interval_secs.max(1);
        self.root_url = self.root_url.trim_end_matches('/').to_string();
        self
    }

    pub const fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Capacity of the error report queue, at least one slot.
    pub fn error_queue_size(&self) -> usize {
        usize::try_from(self.max_send_errors).unwrap_or(0).max(1)
    }
}
