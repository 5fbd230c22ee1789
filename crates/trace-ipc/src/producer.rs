//! Producer-side endpoint: the handle a producer process would hold to
//! talk to the dispatcher task.

use std::sync::Arc;
use std::time::Instant;

#[cfg(debug_assertions)]
use crate::invariants::debug_assert_explicit_registration;
use tokio::sync::{mpsc, oneshot};

use trace_service::{ChunkCommit, DataSourceDescriptor, PatchCommit, SharedMemoryAbi};
use trace_types::{DataSourceInstanceId, FlushRequestId, ProducerId, TracingSessionId};

use crate::command::Command;
use crate::error::IpcError;
use crate::shutdown::ShutdownSignal;

async fn call<T>(tx: &mpsc::Sender<Command>, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, IpcError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(build(reply_tx)).await.map_err(|_| IpcError::DispatcherClosed)?;
    reply_rx.await.map_err(|_| IpcError::NoResponse)
}

/// Registers new producers with the dispatcher. Cloneable: every producer
/// process connecting to the service goes through its own clone of the
/// factory, mirroring one `SharedMemoryArbiter` client per process.
#[derive(Clone)]
pub struct ProducerEndpointFactory {
    tx: mpsc::Sender<Command>,
    signal: ShutdownSignal,
}

impl ProducerEndpointFactory {
    pub(crate) fn new(tx: mpsc::Sender<Command>, signal: ShutdownSignal) -> Self {
        Self { tx, signal }
    }

    /// Registers a new producer process and returns the endpoint bound to
    /// its `ProducerId`. Each call yields a distinct, non-cloneable
    /// endpoint — a producer process owns exactly one registration.
    pub async fn register(&self, uid: u32, pid: u32, name: String) -> Result<ProducerEndpoint, IpcError> {
        if self.signal.is_closed() {
            return Err(IpcError::DispatcherClosed);
        }
        let id = call(&self.tx, |reply| Command::RegisterProducer { uid, pid, name, reply }).await??;
        #[cfg(debug_assertions)]
        debug_assert_explicit_registration!(true);
        Ok(ProducerEndpoint { tx: self.tx.clone(), id })
    }
}

/// One connected producer's view of the service. Not `Clone`: a producer
/// process registers once and keeps the one endpoint that resulted, the
/// same way it owns exactly one shared-memory region.
pub struct ProducerEndpoint {
    tx: mpsc::Sender<Command>,
    id: ProducerId,
}

impl ProducerEndpoint {
    #[must_use]
    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub async fn register_data_source(&self, descriptor: DataSourceDescriptor) -> Result<(), IpcError> {
        call(&self.tx, |reply| Command::RegisterDataSource { producer_id: self.id, descriptor, reply }).await??;
        Ok(())
    }

    pub async fn commit_data(&self, chunks: Vec<ChunkCommit>) -> Result<(), IpcError> {
        call(&self.tx, |reply| Command::CommitData { producer_id: self.id, chunks, reply }).await??;
        Ok(())
    }

    pub async fn apply_patches(&self, patches: Vec<PatchCommit>) -> Result<(), IpcError> {
        call(&self.tx, |reply| Command::ApplyPatches { producer_id: self.id, patches, reply }).await
    }

    pub async fn notify_flush_complete(&self, session_id: TracingSessionId, flush_id: FlushRequestId) -> Result<Vec<FlushRequestId>, IpcError> {
        call(&self.tx, |reply| Command::NotifyFlushComplete { session_id, producer: self.id, id: flush_id, reply }).await
    }

    pub async fn notify_data_source_started(&self, session_id: TracingSessionId, instance_id: DataSourceInstanceId) -> Result<(), IpcError> {
        Ok(call(&self.tx, |reply| Command::NotifyDataSourceStarted { producer_id: self.id, session_id, instance_id, reply }).await??)
    }

    pub async fn notify_data_source_stopped(&self, session_id: TracingSessionId, instance_id: DataSourceInstanceId) -> Result<(), IpcError> {
        Ok(call(&self.tx, |reply| Command::NotifyDataSourceStopped { producer_id: self.id, session_id, instance_id, reply }).await??)
    }

    /// `ActivateTriggers`: this producer's identity is matched against any
    /// admitted rule's `producer_name_regex`.
    pub async fn activate_trigger(&self, name: String, skip_roll: f64, now: Instant) -> Result<(), IpcError> {
        Ok(call(&self.tx, |reply| Command::ActivateTrigger { producer_id: self.id, name, skip_roll, now, reply }).await??)
    }

    /// `InitializeConnection`'s SMB handshake: requests the service allocate
    /// this producer's shared-memory arena.
    pub async fn provision_shared_memory(&self, shm_size_kb: u32, page_size_kb: u32) -> Result<Arc<SharedMemoryAbi>, IpcError> {
        Ok(call(&self.tx, |reply| Command::ProvisionSharedMemory { producer_id: self.id, shm_size_kb, page_size_kb, reply }).await??)
    }

    pub async fn unregister(self) -> Result<(), IpcError> {
        call(&self.tx, |reply| Command::UnregisterProducer { id: self.id, reply }).await
    }
}
