//! Service-side `Producer` record: bookkeeping the service keeps per
//! connected producer process, independent of any one session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use trace_smb::SharedMemoryAbi;
use trace_types::{BufferId, ProducerId, WriterId};

#[derive(Debug, Clone)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub will_notify_on_start: bool,
    pub will_notify_on_stop: bool,
    pub handles_incremental_state_clear: bool,
    pub no_flush: bool,
}

/// One connected producer process.
pub struct Producer {
    pub id: ProducerId,
    pub uid: u32,
    pub pid: u32,
    pub name: String,
    pub shared_memory: Option<Arc<SharedMemoryAbi>>,
    /// Intersection of target buffers across every session this producer
    /// currently participates in.
    pub allowed_target_buffers: HashSet<BufferId>,
    pub writer_to_buffer: HashMap<WriterId, BufferId>,
    pub registered_data_sources: HashMap<String, DataSourceDescriptor>,
}

impl Producer {
    #[must_use]
    pub fn new(id: ProducerId, uid: u32, pid: u32, name: String) -> Self {
        Self {
            id,
            uid,
            pid,
            name,
            shared_memory: None,
            allowed_target_buffers: HashSet::new(),
            writer_to_buffer: HashMap::new(),
            registered_data_sources: HashMap::new(),
        }
    }

    /// Also serves as `UpdateDataSource`: re-registering an already-known
    /// name replaces the descriptor in place without tearing down any
    /// `DataSourceInstance` already created from the old one.
    pub fn register_data_source(&mut self, descriptor: DataSourceDescriptor) {
        self.registered_data_sources.insert(descriptor.name.clone(), descriptor);
    }

    pub fn unregister_data_source(&mut self, name: &str) {
        self.registered_data_sources.remove(name);
    }

    /// `RegisterTraceWriter`: binds writer→buffer for scraping.
    pub fn register_trace_writer(&mut self, writer_id: WriterId, buffer_id: BufferId) {
        self.writer_to_buffer.insert(writer_id, buffer_id);
    }

    pub fn unregister_trace_writer(&mut self, writer_id: WriterId) {
        self.writer_to_buffer.remove(&writer_id);
    }

    #[must_use]
    pub fn can_write_to(&self, buffer: BufferId) -> bool {
        self.allowed_target_buffers.contains(&buffer)
    }
}
