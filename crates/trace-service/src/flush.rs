//! Flush protocol: monotonic-ack tracking across producers.

use std::collections::HashSet;

use trace_types::{FlushRequestId, ProducerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushInitiator {
    Consumer,
    PeriodicTimer,
    SessionStop,
    Clone,
}

#[derive(Debug, Clone, Copy)]
pub struct FlushFlags {
    pub initiator: FlushInitiator,
    pub reason_is_clone: bool,
}

/// One in-flight `Flush` round. The callback isn't stored here — callers
/// hold the `FlushRequestId` and poll [`PendingFlush::is_complete`] (or the
/// engine invokes their callback directly when this drains to empty).
pub struct PendingFlush {
    pub id: FlushRequestId,
    pub producers: HashSet<ProducerId>,
    pub flags: FlushFlags,
}

impl PendingFlush {
    #[must_use]
    pub fn new(id: FlushRequestId, producers: HashSet<ProducerId>, flags: FlushFlags) -> Self {
        Self { id, producers, flags }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn ack(&mut self, producer: ProducerId) {
        self.producers.remove(&producer);
    }
}

/// Tracks every pending flush round for one session, applying the
/// monotonic-ack rule: an ack for flush `id` also acks every pending flush
/// with id ≤ `id`.
#[derive(Default)]
pub struct FlushTracker {
    pending: Vec<PendingFlush>,
}

impl FlushTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, flush: PendingFlush) {
        self.pending.push(flush);
    }

    /// Applies `NotifyFlushComplete(producer, id)`. Returns the ids of
    /// every pending flush that just completed (producers set went empty),
    /// in registration order, for the caller to fire callbacks and remove.
    pub fn notify_complete(&mut self, producer: ProducerId, id: FlushRequestId) -> Vec<FlushRequestId> {
        let mut completed = Vec::new();
        self.pending.retain_mut(|pf| {
            if pf.id.get() <= id.get() {
                pf.ack(producer);
            }
            if pf.is_complete() {
                completed.push(pf.id);
                false
            } else {
                true
            }
        });
        completed
    }

    /// Removes and returns every flush whose id is in `expired`, for the
    /// caller to fire `success=false` callbacks.
    pub fn expire(&mut self, expired: &[FlushRequestId]) -> Vec<PendingFlush> {
        let (timed_out, remaining): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|pf| expired.contains(&pf.id));
        self.pending = remaining;
        timed_out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producers(ids: &[u16]) -> HashSet<ProducerId> {
        ids.iter().map(|&id| ProducerId::from(id)).collect()
    }

    #[test]
    fn ack_for_n_implies_ack_for_all_less_than_n() {
        let mut tracker = FlushTracker::new();
        let flags = FlushFlags { initiator: FlushInitiator::Consumer, reason_is_clone: false };
        tracker.register(PendingFlush::new(FlushRequestId::from(1), producers(&[1, 2]), flags));
        tracker.register(PendingFlush::new(FlushRequestId::from(2), producers(&[1, 2]), flags));

        let completed = tracker.notify_complete(ProducerId::from(1), FlushRequestId::from(2));
        assert!(completed.is_empty());

        let completed = tracker.notify_complete(ProducerId::from(2), FlushRequestId::from(2));
        assert_eq!(completed.len(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn partial_ack_keeps_flush_pending() {
        let mut tracker = FlushTracker::new();
        let flags = FlushFlags { initiator: FlushInitiator::Consumer, reason_is_clone: false };
        tracker.register(PendingFlush::new(FlushRequestId::from(1), producers(&[1, 2]), flags));
        let completed = tracker.notify_complete(ProducerId::from(1), FlushRequestId::from(1));
        assert!(completed.is_empty());
        assert!(!tracker.is_empty());
    }
}
