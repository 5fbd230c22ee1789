//! Service-side session engine: owns `TracingSession` state machines, the
//! producer registry, and the `TraceBuffer`s backing every active trace.
//!
//! [`TracingService`] itself is synchronous and single-threaded by design —
//! every mutation borrows `&mut self`. [`ServiceHandle`] is the async façade
//! the rest of the workspace (and, eventually, `trace-ipc`) talks to: it
//! owns the service behind a `tokio::sync::Mutex` so every request becomes
//! an (operation, result) pair scheduled onto whatever task happens to hold
//! the lock next, matching how a real service's IPC dispatch loop serializes
//! concurrent producer/consumer requests onto one thread.

mod clone;
mod commit;
mod config;
mod data_source;
mod error;
mod events;
mod filter;
mod flush;
mod metrics;
mod producer;
mod service;
mod session;
mod trigger;

use std::sync::Arc;

use tokio::sync::Mutex;
use trace_types::{BufferId, DataSourceInstanceId, FlushRequestId, ProducerId, TracingSessionId};

pub use clone::{is_clone_authorized, PendingClone};
pub use commit::{ChunkCommit, PatchCommit};
pub use config::{
    resolve_page_size, BufferConfig, CompressionType, DataSourceConfig, FillPolicy, IncrementalStateConfig, LockdownMode, ProducerConfig,
    TraceConfig, TriggerConfig, TriggerMode, TriggerRule, DEFAULT_DATA_SOURCE_STOP_TIMEOUT_MS, DEFAULT_PAGE_SIZE, DEFAULT_SHM_SIZE_KB,
    MAX_PAGE_SIZE, MAX_TRACE_DURATION_MS, MIN_PAGE_SIZE,
};
pub use data_source::{DataSourceCapabilities, DataSourceInstance, DataSourceInstanceState};
pub use error::ServiceError;
pub use events::{EventSubscription, ServiceEvent};
pub use filter::{filter_stream, StringRedactionRule, TraceFilter};
pub use flush::{FlushFlags, FlushInitiator, FlushTracker, PendingFlush};
pub use metrics::{ServiceMetrics, ServiceMetricsSnapshot};
pub use producer::{DataSourceDescriptor, Producer};
pub use service::{ProducerSummary, ServiceCapabilities, ServiceStateSnapshot, SessionSummary, TracingService};
pub use session::{SessionState, TracingSession};
pub use trigger::{evaluate_trigger, TriggerAction, TriggerQuota};
pub use trace_smb::SharedMemoryAbi;

/// Shared, lock-guarded handle to a [`TracingService`] for use from async
/// contexts. Cloning a handle is cheap (`Arc` bump); every method takes the
/// lock for the duration of one request, so two concurrent callers never
/// see interleaved partial mutations.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<Mutex<TracingService>>,
}

impl Default for ServiceHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHandle {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(TracingService::new())) }
    }

    pub async fn register_producer(&self, uid: u32, pid: u32, name: String) -> Result<ProducerId, ServiceError> {
        self.inner.lock().await.register_producer(uid, pid, name)
    }

    pub async fn unregister_producer(&self, id: ProducerId) {
        self.inner.lock().await.unregister_producer(id);
    }

    pub async fn provision_shared_memory(&self, producer_id: ProducerId, shm_size_kb: u32, page_size_kb: u32) -> Result<Arc<SharedMemoryAbi>, ServiceError> {
        self.inner.lock().await.provision_shared_memory(producer_id, shm_size_kb, page_size_kb)
    }

    pub async fn register_data_source(&self, producer_id: ProducerId, descriptor: DataSourceDescriptor) -> Result<(), ServiceError> {
        self.inner.lock().await.register_data_source(producer_id, descriptor)
    }

    pub async fn enable_tracing(&self, consumer_uid: u32, config: TraceConfig) -> Result<TracingSessionId, ServiceError> {
        self.inner.lock().await.enable_tracing(consumer_uid, config)
    }

    pub async fn start_tracing(&self, session_id: TracingSessionId) -> Result<(), ServiceError> {
        self.inner.lock().await.start_tracing(session_id)
    }

    pub async fn disable_tracing(&self, session_id: TracingSessionId) -> Result<(), ServiceError> {
        self.inner.lock().await.disable_tracing(session_id)
    }

    pub async fn notify_data_source_started(&self, producer_id: ProducerId, session_id: TracingSessionId, instance_id: DataSourceInstanceId) -> Result<(), ServiceError> {
        self.inner.lock().await.notify_data_source_started(producer_id, session_id, instance_id)
    }

    pub async fn notify_data_source_stopped(&self, producer_id: ProducerId, session_id: TracingSessionId, instance_id: DataSourceInstanceId) -> Result<(), ServiceError> {
        self.inner.lock().await.notify_data_source_stopped(producer_id, session_id, instance_id)
    }

    pub async fn commit_data(&self, producer_id: ProducerId, chunks: Vec<ChunkCommit>) -> Result<(), ServiceError> {
        self.inner.lock().await.commit_data(producer_id, chunks)
    }

    pub async fn apply_patches(&self, producer_id: ProducerId, patches: Vec<PatchCommit>) {
        self.inner.lock().await.apply_patches(producer_id, patches);
    }

    pub async fn request_flush(&self, session_id: TracingSessionId, initiator: FlushInitiator) -> Result<FlushRequestId, ServiceError> {
        self.inner.lock().await.request_flush(session_id, initiator)
    }

    pub async fn notify_flush_complete(&self, session_id: TracingSessionId, producer: ProducerId, id: FlushRequestId) -> Vec<FlushRequestId> {
        self.inner.lock().await.notify_flush_complete(session_id, producer, id)
    }

    pub async fn activate_trigger(&self, producer_id: ProducerId, name: &str, skip_roll: f64, now: std::time::Instant) -> Result<(), ServiceError> {
        self.inner.lock().await.activate_trigger(producer_id, name, skip_roll, now)
    }

    pub async fn clone_session(&self, source_session_id: TracingSessionId, caller_uid: u32, is_bugreport_principal: bool) -> Result<TracingSessionId, ServiceError> {
        self.inner.lock().await.clone_session(source_session_id, caller_uid, is_bugreport_principal)
    }

    pub async fn detach(&self, session_id: TracingSessionId, key: String) -> Result<(), ServiceError> {
        self.inner.lock().await.detach(session_id, key)
    }

    pub async fn attach(&self, key: &str) -> Result<TracingSessionId, ServiceError> {
        self.inner.lock().await.attach(key)
    }

    pub async fn read_buffers(&self, session_id: TracingSessionId) -> Result<Vec<(BufferId, Vec<trace_buffer::StitchedSequence>)>, ServiceError> {
        self.inner.lock().await.read_buffers(session_id)
    }

    pub async fn query_service_state(&self) -> ServiceStateSnapshot {
        self.inner.lock().await.query_service_state()
    }

    #[must_use]
    pub async fn capabilities(&self) -> ServiceCapabilities {
        self.inner.lock().await.capabilities()
    }

    pub async fn metrics(&self) -> ServiceMetricsSnapshot {
        self.inner.lock().await.metrics()
    }

    pub async fn subscribe_events(&self, want_state_changes: bool, want_clone_triggered: bool) -> u64 {
        self.inner.lock().await.subscribe_events(want_state_changes, want_clone_triggered)
    }

    pub async fn unsubscribe_events(&self, subscriber_id: u64) {
        self.inner.lock().await.unsubscribe_events(subscriber_id);
    }

    pub async fn poll_events(&self, subscriber_id: u64) -> Vec<ServiceEvent> {
        self.inner.lock().await.poll_events(subscriber_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_round_trips_enable_and_read_buffers() {
        let handle = ServiceHandle::new();
        let config = TraceConfig { buffers: vec![BufferConfig { size_kb: 64, ..Default::default() }], ..Default::default() };
        let session_id = handle.enable_tracing(1, config).await.unwrap();
        let stitched = handle.read_buffers(session_id).await.unwrap();
        assert_eq!(stitched.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_handles_share_state() {
        let handle = ServiceHandle::new();
        let producer_id = handle.register_producer(1, 100, "p".into()).await.unwrap();
        let other = handle.clone();
        let state = other.query_service_state().await;
        assert_eq!(state.producers.len(), 1);
        assert_eq!(state.producers[0].id, producer_id);
    }
}
