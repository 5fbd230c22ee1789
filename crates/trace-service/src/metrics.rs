//! Service-wide runtime counters, exposed through `QueryServiceState`.
//! Plain relaxed atomics: these are cheap, eventually-consistent counters
//! for observability, not coordination, so there's no need for anything
//! stronger.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    sessions_started: AtomicU64,
    sessions_disabled: AtomicU64,
    producers_connected: AtomicU64,
    producers_disconnected: AtomicU64,
    flush_requests: AtomicU64,
    flush_timeouts: AtomicU64,
    triggers_activated: AtomicU64,
    clones_completed: AtomicU64,
    commit_data_calls: AtomicU64,
    commit_data_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceMetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_disabled: u64,
    pub producers_connected: u64,
    pub producers_disconnected: u64,
    pub flush_requests: u64,
    pub flush_timeouts: u64,
    pub triggers_activated: u64,
    pub clones_completed: u64,
    pub commit_data_calls: u64,
    pub commit_data_bytes: u64,
}

impl ServiceMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_disabled(&self) {
        self.sessions_disabled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_connected(&self) {
        self.producers_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_disconnected(&self) {
        self.producers_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_request(&self) {
        self.flush_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_timeout(&self) {
        self.flush_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trigger_activated(&self) {
        self.triggers_activated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clone_completed(&self) {
        self.clones_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit_data(&self, bytes: u64) {
        self.commit_data_calls.fetch_add(1, Ordering::Relaxed);
        self.commit_data_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_disabled: self.sessions_disabled.load(Ordering::Relaxed),
            producers_connected: self.producers_connected.load(Ordering::Relaxed),
            producers_disconnected: self.producers_disconnected.load(Ordering::Relaxed),
            flush_requests: self.flush_requests.load(Ordering::Relaxed),
            flush_timeouts: self.flush_timeouts.load(Ordering::Relaxed),
            triggers_activated: self.triggers_activated.load(Ordering::Relaxed),
            clones_completed: self.clones_completed.load(Ordering::Relaxed),
            commit_data_calls: self.commit_data_calls.load(Ordering::Relaxed),
            commit_data_bytes: self.commit_data_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        let m = ServiceMetrics::new();
        m.record_session_started();
        m.record_commit_data(128);
        m.record_commit_data(64);
        let snap = m.snapshot();
        assert_eq!(snap.sessions_started, 1);
        assert_eq!(snap.commit_data_calls, 2);
        assert_eq!(snap.commit_data_bytes, 192);
    }
}
