//! Configuration for the consumer-side event stream.

use std::time::Duration;

/// Polling behavior for [`crate::events::EventStream`].
///
/// The dispatcher has no push channel into a subscriber's queue, so the
/// stream discovers new [`trace_service::ServiceEvent`]s by asking on this
/// interval. Shorter intervals trade CPU for latency.
#[derive(Debug, Clone, Copy)]
pub struct EventStreamConfig {
    /// Default: 10ms.
    pub poll_interval: Duration,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(10) }
    }
}

impl EventStreamConfig {
    /// Shorter poll interval for callers that care about event latency
    /// (e.g. a UI observing `DataSourceInstanceStateChange`).
    #[must_use]
    pub fn low_latency() -> Self {
        Self { poll_interval: Duration::from_millis(1) }
    }

    /// Longer poll interval for callers that only care about eventual
    /// delivery, to avoid waking an idle task.
    #[must_use]
    pub fn high_throughput() -> Self {
        Self { poll_interval: Duration::from_millis(50) }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
