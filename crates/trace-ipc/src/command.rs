//! Requests the dispatcher understands.
//!
//! Every request becomes a `(request, completion-callback)` pair: the
//! endpoint builds a [`Command`] carrying a `oneshot::Sender` for the
//! reply, sends it down the shared `mpsc` channel, and awaits the
//! oneshot. The dispatcher task owns the [`TracingService`] outright, so
//! handling one command never races another.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use trace_buffer::StitchedSequence;
use trace_service::{
    ChunkCommit, DataSourceDescriptor, FlushInitiator, PatchCommit, ServiceCapabilities, ServiceError, ServiceEvent,
    ServiceMetricsSnapshot, ServiceStateSnapshot, SharedMemoryAbi, TraceConfig,
};
use trace_types::{BufferId, DataSourceInstanceId, FlushRequestId, ProducerId, TracingSessionId};

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    RegisterProducer { uid: u32, pid: u32, name: String, reply: Reply<Result<ProducerId, ServiceError>> },
    UnregisterProducer { id: ProducerId, reply: Reply<()> },
    ProvisionSharedMemory { producer_id: ProducerId, shm_size_kb: u32, page_size_kb: u32, reply: Reply<Result<Arc<SharedMemoryAbi>, ServiceError>> },
    RegisterDataSource { producer_id: ProducerId, descriptor: DataSourceDescriptor, reply: Reply<Result<(), ServiceError>> },
    EnableTracing { consumer_uid: u32, config: Box<TraceConfig>, reply: Reply<Result<TracingSessionId, ServiceError>> },
    StartTracing { session_id: TracingSessionId, reply: Reply<Result<(), ServiceError>> },
    DisableTracing { session_id: TracingSessionId, reply: Reply<Result<(), ServiceError>> },
    NotifyDataSourceStarted { producer_id: ProducerId, session_id: TracingSessionId, instance_id: DataSourceInstanceId, reply: Reply<Result<(), ServiceError>> },
    NotifyDataSourceStopped { producer_id: ProducerId, session_id: TracingSessionId, instance_id: DataSourceInstanceId, reply: Reply<Result<(), ServiceError>> },
    CommitData { producer_id: ProducerId, chunks: Vec<ChunkCommit>, reply: Reply<Result<(), ServiceError>> },
    ApplyPatches { producer_id: ProducerId, patches: Vec<PatchCommit>, reply: Reply<()> },
    RequestFlush { session_id: TracingSessionId, initiator: FlushInitiator, reply: Reply<Result<FlushRequestId, ServiceError>> },
    NotifyFlushComplete { session_id: TracingSessionId, producer: ProducerId, id: FlushRequestId, reply: Reply<Vec<FlushRequestId>> },
    ActivateTrigger { producer_id: ProducerId, name: String, skip_roll: f64, now: Instant, reply: Reply<Result<(), ServiceError>> },
    CloneSession {
        source_session_id: TracingSessionId,
        caller_uid: u32,
        is_bugreport_principal: bool,
        reply: Reply<Result<TracingSessionId, ServiceError>>,
    },
    Detach { session_id: TracingSessionId, key: String, reply: Reply<Result<(), ServiceError>> },
    Attach { key: String, reply: Reply<Result<TracingSessionId, ServiceError>> },
    ReadBuffers { session_id: TracingSessionId, reply: Reply<Result<Vec<(BufferId, Vec<StitchedSequence>)>, ServiceError>> },
    QueryServiceState { reply: Reply<ServiceStateSnapshot> },
    Capabilities { reply: Reply<ServiceCapabilities> },
    Metrics { reply: Reply<ServiceMetricsSnapshot> },
    SubscribeEvents { want_state_changes: bool, want_clone_triggered: bool, reply: Reply<u64> },
    UnsubscribeEvents { subscriber_id: u64, reply: Reply<()> },
    PollEvents { subscriber_id: u64, reply: Reply<Vec<ServiceEvent>> },
}
