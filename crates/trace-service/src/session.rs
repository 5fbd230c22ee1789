//! `TracingSession`: the top-level state machine owning one
//! trace's buffers, data source instances, and in-flight flush/trigger
//! state.

use trace_types::{BufferId, TracingSessionId};

use crate::config::TraceConfig;
use crate::data_source::DataSourceInstance;
use crate::flush::FlushTracker;
use crate::trigger::TriggerQuota;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configured,
    Started,
    DisablingWaitingStopAcks,
    Disabled,
    ClonedReadOnly,
}

pub struct TracingSession {
    pub id: TracingSessionId,
    pub consumer_uid: u32,
    pub config: TraceConfig,
    pub state: SessionState,
    pub buffer_ids: Vec<BufferId>,
    pub data_source_instances: Vec<DataSourceInstance>,
    pub flush_tracker: FlushTracker,
    pub trigger_quota: TriggerQuota,
    pub received_triggers: Vec<String>,
    pub detach_key: Option<String>,
    /// Set once a `CLONE_SNAPSHOT` trigger has fired; `ReadBuffers` on the
    /// original session returns empty from then on.
    pub cloned_out: bool,
    /// Bumped each time incremental state is cleared. Data source instances
    /// with `handles_incremental_state_clear` are notified of the new value
    /// through the same channel used for start/stop acks.
    pub incremental_state_generation: u32,
}

impl TracingSession {
    #[must_use]
    pub fn new(id: TracingSessionId, consumer_uid: u32, config: TraceConfig, buffer_ids: Vec<BufferId>) -> Self {
        Self {
            id,
            consumer_uid,
            config,
            state: SessionState::Configured,
            buffer_ids,
            data_source_instances: Vec::new(),
            flush_tracker: FlushTracker::new(),
            trigger_quota: TriggerQuota::new(),
            received_triggers: Vec::new(),
            detach_key: None,
            cloned_out: false,
            incremental_state_generation: 0,
        }
    }

    pub fn start(&mut self) {
        debug_assert_eq!(self.state, SessionState::Configured);
        self.state = SessionState::Started;
        for ds in &mut self.data_source_instances {
            ds.mark_starting();
        }
    }

    pub fn begin_disable(&mut self) {
        self.state = SessionState::DisablingWaitingStopAcks;
        for ds in &mut self.data_source_instances {
            ds.mark_stopping();
        }
    }

    pub fn finish_disable(&mut self) {
        self.state = SessionState::Disabled;
    }

    #[must_use]
    pub fn all_stop_acks_received(&self) -> bool {
        !self.data_source_instances.iter().any(DataSourceInstance::awaits_stop_ack)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Configured | SessionState::Started | SessionState::DisablingWaitingStopAcks)
    }

    /// Bumps and returns the new incremental-state generation. Driven by an
    /// external timer on `incremental_state_config.clear_period_ms`, the same
    /// way `flush_period_ms` ticks are driven outside this synchronous core.
    pub fn bump_incremental_state_generation(&mut self) -> u32 {
        self.incremental_state_generation += 1;
        self.incremental_state_generation
    }
}
