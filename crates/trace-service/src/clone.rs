//! Session cloning.
//!
//! The full protocol fans out a `Flush(reason=kTraceClone)` to every
//! producer in the source session and only materializes the clone once all
//! replies land or their timers expire. The actual producer round-trip is
//! owned by the IPC layer; this module only tracks the clone's bookkeeping
//! (`PendingClone`), so it's agnostic to how the flush replies actually
//! arrive. The per-buffer `transfer_on_clone`/`clear_before_clone` rules
//! are applied directly in `TracingService::clone_session`, since they
//! need mutable access to the source and cloned `TraceBuffer`s.

use trace_types::TracingSessionId;

/// Mirrors `NotifyFlushComplete`'s caller for clone purposes: one entry per
/// flush-capable producer group in the source session.
pub struct PendingClone {
    pub source_session: TracingSessionId,
    pub requested_by_uid: u32,
    pub pending_flush_cnt: usize,
}

impl PendingClone {
    #[must_use]
    pub fn new(source_session: TracingSessionId, requested_by_uid: u32, pending_flush_cnt: usize) -> Self {
        Self { source_session, requested_by_uid, pending_flush_cnt }
    }

    /// Call once per producer flush reply (or per producer whose flush
    /// timed out — a timeout still counts as "accounted for", the clone
    /// just gets whatever that producer had already committed).
    pub fn record_flush_settled(&mut self) {
        self.pending_flush_cnt = self.pending_flush_cnt.saturating_sub(1);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.pending_flush_cnt == 0
    }
}

/// Caller uid must equal source uid, OR the source session
/// has a positive `bugreport_score` and the caller is the bugreport
/// principal.
#[must_use]
pub fn is_clone_authorized(source_uid: u32, caller_uid: u32, bugreport_score: i32, is_bugreport_principal: bool) -> bool {
    source_uid == caller_uid || (bugreport_score > 0 && is_bugreport_principal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_uid_is_always_authorized() {
        assert!(is_clone_authorized(10, 10, 0, false));
    }

    #[test]
    fn bugreport_principal_authorized_only_with_positive_score() {
        assert!(!is_clone_authorized(10, 20, 0, true));
        assert!(is_clone_authorized(10, 20, 1, true));
    }

    #[test]
    fn other_uid_without_bugreport_role_is_rejected() {
        assert!(!is_clone_authorized(10, 20, 5, false));
    }

    #[test]
    fn pending_clone_ready_once_all_flushes_settle() {
        let mut pc = PendingClone::new(TracingSessionId::from(1), 10, 2);
        assert!(!pc.is_ready());
        pc.record_flush_settled();
        assert!(!pc.is_ready());
        pc.record_flush_settled();
        assert!(pc.is_ready());
    }
}
