//! `ObserveEvents`: event types a consumer can subscribe to instead
//! of polling `QueryServiceState`.

use trace_types::{DataSourceInstanceId, ProducerId, TracingSessionId};

use crate::data_source::DataSourceInstanceState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    DataSourceInstanceStateChange {
        session: TracingSessionId,
        producer: ProducerId,
        instance: DataSourceInstanceId,
        state: DataSourceInstanceState,
    },
    CloneTriggered {
        source_session: TracingSessionId,
        cloned_session: TracingSessionId,
    },
    AllDataSourcesStarted {
        session: TracingSessionId,
    },
}

/// Per-consumer subscription: which event kinds it wants, and the backlog
/// it hasn't been delivered yet. The engine appends to every subscriber's
/// queue on each event and the transport layer drains it on each poll.
#[derive(Default)]
pub struct EventSubscription {
    pub want_state_changes: bool,
    pub want_clone_triggered: bool,
    queue: Vec<ServiceEvent>,
}

impl EventSubscription {
    #[must_use]
    pub fn new(want_state_changes: bool, want_clone_triggered: bool) -> Self {
        Self { want_state_changes, want_clone_triggered, queue: Vec::new() }
    }

    pub fn notify(&mut self, event: ServiceEvent) {
        let wanted = match event {
            ServiceEvent::DataSourceInstanceStateChange { .. } | ServiceEvent::AllDataSourcesStarted { .. } => {
                self.want_state_changes
            }
            ServiceEvent::CloneTriggered { .. } => self.want_clone_triggered,
        };
        if wanted {
            self.queue.push(event);
        }
    }

    pub fn drain(&mut self) -> Vec<ServiceEvent> {
        std::mem::take(&mut self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undesired_event_kind_is_not_queued() {
        let mut sub = EventSubscription::new(false, true);
        sub.notify(ServiceEvent::DataSourceInstanceStateChange {
            session: TracingSessionId::from(1),
            producer: ProducerId::from(1),
            instance: DataSourceInstanceId::from(1),
            state: DataSourceInstanceState::Started,
        });
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn drain_empties_the_queue() {
        let mut sub = EventSubscription::new(true, false);
        sub.notify(ServiceEvent::AllDataSourcesStarted { session: TracingSessionId::from(1) });
        assert_eq!(sub.drain().len(), 1);
        assert!(sub.drain().is_empty());
    }
}
