//! Consumer-side endpoint: the handle a tracing UI or CLI would hold to
//! talk to the dispatcher task.
//!
//! Producer-originated notifications (`NotifyDataSourceStarted`,
//! `NotifyDataSourceStopped`, `ActivateTriggers`) live on
//! [`ProducerEndpoint`](crate::ProducerEndpoint) instead, since they carry
//! the calling producer's identity.

use tokio::sync::{mpsc, oneshot};

use trace_buffer::StitchedSequence;
use trace_service::{FlushInitiator, ServiceCapabilities, ServiceMetricsSnapshot, ServiceStateSnapshot, TraceConfig};
use trace_types::{BufferId, FlushRequestId, TracingSessionId};

use crate::command::Command;
use crate::error::IpcError;
use crate::events::EventStream;

async fn call<T>(tx: &mpsc::Sender<Command>, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, IpcError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(build(reply_tx)).await.map_err(|_| IpcError::DispatcherClosed)?;
    reply_rx.await.map_err(|_| IpcError::NoResponse)
}

/// A consumer's view of the service. Cheaply cloneable (it's a thin
/// wrapper over the command channel's sender) since a consumer process
/// often wants one handle for session control and another for streaming
/// events or periodic buffer reads.
#[derive(Clone)]
pub struct ConsumerEndpoint {
    tx: mpsc::Sender<Command>,
}

impl ConsumerEndpoint {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    pub async fn enable_tracing(&self, consumer_uid: u32, config: TraceConfig) -> Result<TracingSessionId, IpcError> {
        Ok(call(&self.tx, |reply| Command::EnableTracing { consumer_uid, config: Box::new(config), reply }).await??)
    }

    pub async fn start_tracing(&self, session_id: TracingSessionId) -> Result<(), IpcError> {
        Ok(call(&self.tx, |reply| Command::StartTracing { session_id, reply }).await??)
    }

    pub async fn disable_tracing(&self, session_id: TracingSessionId) -> Result<(), IpcError> {
        Ok(call(&self.tx, |reply| Command::DisableTracing { session_id, reply }).await??)
    }

    pub async fn request_flush(&self, session_id: TracingSessionId, initiator: FlushInitiator) -> Result<FlushRequestId, IpcError> {
        Ok(call(&self.tx, |reply| Command::RequestFlush { session_id, initiator, reply }).await??)
    }

    pub async fn clone_session(
        &self,
        source_session_id: TracingSessionId,
        caller_uid: u32,
        is_bugreport_principal: bool,
    ) -> Result<TracingSessionId, IpcError> {
        Ok(call(&self.tx, |reply| Command::CloneSession { source_session_id, caller_uid, is_bugreport_principal, reply }).await??)
    }

    pub async fn detach(&self, session_id: TracingSessionId, key: String) -> Result<(), IpcError> {
        Ok(call(&self.tx, |reply| Command::Detach { session_id, key, reply }).await??)
    }

    pub async fn attach(&self, key: String) -> Result<TracingSessionId, IpcError> {
        Ok(call(&self.tx, |reply| Command::Attach { key, reply }).await??)
    }

    pub async fn read_buffers(&self, session_id: TracingSessionId) -> Result<Vec<(BufferId, Vec<StitchedSequence>)>, IpcError> {
        Ok(call(&self.tx, |reply| Command::ReadBuffers { session_id, reply }).await??)
    }

    pub async fn query_service_state(&self) -> Result<ServiceStateSnapshot, IpcError> {
        call(&self.tx, |reply| Command::QueryServiceState { reply }).await
    }

    pub async fn capabilities(&self) -> Result<ServiceCapabilities, IpcError> {
        call(&self.tx, |reply| Command::Capabilities { reply }).await
    }

    pub async fn metrics(&self) -> Result<ServiceMetricsSnapshot, IpcError> {
        call(&self.tx, |reply| Command::Metrics { reply }).await
    }

    /// Subscribes to service events and returns a [`Stream`](futures_core::Stream)
    /// of them, polling the dispatcher with the given cadence.
    pub async fn observe_events(
        &self,
        want_state_changes: bool,
        want_clone_triggered: bool,
        config: crate::config::EventStreamConfig,
    ) -> Result<EventStream, IpcError> {
        let subscriber_id = call(&self.tx, |reply| Command::SubscribeEvents { want_state_changes, want_clone_triggered, reply }).await?;
        Ok(EventStream::new(self.tx.clone(), subscriber_id, config))
    }
}
