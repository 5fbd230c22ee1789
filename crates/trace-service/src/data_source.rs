//! `DataSourceInstance`.

use trace_types::{BufferId, DataSourceInstanceId, ProducerId};

use crate::config::DataSourceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceInstanceState {
    Configured,
    Starting,
    Started,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DataSourceCapabilities {
    pub will_notify_on_start: bool,
    pub will_notify_on_stop: bool,
    pub handles_incremental_state_clear: bool,
    pub no_flush: bool,
}

#[derive(Debug, Clone)]
pub struct DataSourceInstance {
    pub id: DataSourceInstanceId,
    pub producer_id: ProducerId,
    pub config: DataSourceConfig,
    pub target_buffer: BufferId,
    pub capabilities: DataSourceCapabilities,
    pub state: DataSourceInstanceState,
}

impl DataSourceInstance {
    #[must_use]
    pub fn new(id: DataSourceInstanceId, producer_id: ProducerId, config: DataSourceConfig, target_buffer: BufferId) -> Self {
        Self {
            id,
            producer_id,
            config,
            target_buffer,
            capabilities: DataSourceCapabilities::default(),
            state: DataSourceInstanceState::Configured,
        }
    }

    pub fn mark_starting(&mut self) {
        debug_assert_eq!(self.state, DataSourceInstanceState::Configured);
        self.state = DataSourceInstanceState::Starting;
    }

    /// If the instance never advertised `will_notify_on_start`, it's
    /// considered started immediately once `StartDataSource` is issued.
    pub fn mark_started(&mut self) {
        self.state = DataSourceInstanceState::Started;
    }

    pub fn mark_stopping(&mut self) {
        self.state = DataSourceInstanceState::Stopping;
    }

    pub fn mark_stopped(&mut self) {
        self.state = DataSourceInstanceState::Stopped;
    }

    #[must_use]
    pub fn awaits_start_ack(&self) -> bool {
        self.capabilities.will_notify_on_start && self.state == DataSourceInstanceState::Starting
    }

    #[must_use]
    pub fn awaits_stop_ack(&self) -> bool {
        self.capabilities.will_notify_on_stop && self.state == DataSourceInstanceState::Stopping
    }
}
