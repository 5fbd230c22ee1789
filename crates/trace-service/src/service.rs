//! `TracingService`: the top-level orchestrator a consumer and a
//! producer both talk to — session lifecycle, producer bookkeeping,
//! `CommitData` ingestion into the right `TraceBuffer`, flush/trigger/clone
//! dispatch, and buffer read-out.

use std::collections::HashMap;
use std::sync::Arc;

use trace_buffer::{ChunkKey, FillPolicy as BufferFillPolicy, TraceBuffer};
use trace_smb::SharedMemoryAbi;
use trace_types::{BufferId, DataSourceInstanceId, FlushRequestId, ProducerId, TracingSessionId};

use crate::clone::{is_clone_authorized, PendingClone};
use crate::commit::{ChunkCommit, PatchCommit};
use crate::config::{resolve_page_size, FillPolicy, TraceConfig};
use crate::data_source::{DataSourceCapabilities, DataSourceInstance};
use crate::error::ServiceError;
use crate::events::{EventSubscription, ServiceEvent};
use crate::flush::{FlushFlags, FlushInitiator, PendingFlush};
use crate::metrics::{ServiceMetrics, ServiceMetricsSnapshot};
use crate::producer::{DataSourceDescriptor, Producer};
use crate::session::{SessionState, TracingSession};
use crate::trigger::{evaluate_trigger, TriggerAction};

fn to_buffer_fill_policy(policy: FillPolicy) -> BufferFillPolicy {
    match policy {
        FillPolicy::RingBuffer => BufferFillPolicy::RingBuffer,
        FillPolicy::Discard => BufferFillPolicy::Discard,
    }
}

/// Flattens one writer's stitched chunks into a single filtered,
/// re-framed chunk. `ReadBuffers` applies this per sequence when the
/// session carries a `trace_filter`; the original chunk boundaries aren't
/// meaningful to a consumer reading a filtered packet stream, so they
/// collapse into one.
fn apply_trace_filter(seq: &trace_buffer::StitchedSequence, filter: &crate::filter::TraceFilter) -> trace_buffer::StitchedSequence {
    let stream: Vec<u8> = seq.chunks.iter().flat_map(|(_, bytes, _)| bytes.iter().copied()).collect();
    let filtered = crate::filter::filter_stream(&stream, filter);
    let chunk_id = seq.chunks.last().map_or(trace_types::ChunkId::from(0), |(id, _, _)| *id);
    trace_buffer::StitchedSequence { producer_uid: seq.producer_uid, writer_id: seq.writer_id, chunks: vec![(chunk_id, filtered, 0)] }
}

#[derive(Debug, Clone)]
pub struct ProducerSummary {
    pub id: ProducerId,
    pub name: String,
    pub uid: u32,
    pub data_sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: TracingSessionId,
    pub consumer_uid: u32,
    pub state: SessionState,
    pub buffer_ids: Vec<BufferId>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceStateSnapshot {
    pub producers: Vec<ProducerSummary>,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceCapabilities {
    pub has_trigger_config: bool,
    pub has_clone_session: bool,
    pub has_incremental_state_clear: bool,
    pub supported_buffer_fill_policies: u8,
}

impl Default for ServiceCapabilities {
    fn default() -> Self {
        Self {
            has_trigger_config: true,
            has_clone_session: true,
            has_incremental_state_clear: true,
            supported_buffer_fill_policies: 2,
        }
    }
}

/// Owns every session, producer and buffer known to one service instance.
/// Not `Send`/`Sync` on its own; the IPC layer is expected to serialize
/// access behind a single task, matching how `trace-ipc` dispatches
/// (request, completion-callback) pairs onto one runner.
pub struct TracingService {
    producers: HashMap<ProducerId, Producer>,
    producer_ids: trace_types::IdPool,
    sessions: HashMap<TracingSessionId, TracingSession>,
    next_session_id: u64,
    buffers: HashMap<BufferId, TraceBuffer>,
    buffer_ids: trace_types::IdPool,
    next_ds_instance_id: u64,
    next_flush_request_id: u64,
    pending_clones: HashMap<TracingSessionId, PendingClone>,
    detach_keys: HashMap<String, TracingSessionId>,
    subscriptions: HashMap<u64, EventSubscription>,
    next_subscriber_id: u64,
    metrics: ServiceMetrics,
}

impl Default for TracingService {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            producers: HashMap::new(),
            producer_ids: trace_types::IdPool::new(u64::from(u16::MAX)),
            sessions: HashMap::new(),
            next_session_id: 0,
            buffers: HashMap::new(),
            buffer_ids: trace_types::IdPool::new(u64::from(u16::MAX)),
            next_ds_instance_id: 0,
            next_flush_request_id: 0,
            pending_clones: HashMap::new(),
            detach_keys: HashMap::new(),
            subscriptions: HashMap::new(),
            next_subscriber_id: 0,
            metrics: ServiceMetrics::new(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> ServiceMetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn capabilities(&self) -> ServiceCapabilities {
        ServiceCapabilities::default()
    }

    // --- Producer bookkeeping -------------------------------------------

    pub fn register_producer(&mut self, uid: u32, pid: u32, name: String) -> Result<ProducerId, ServiceError> {
        let raw = self.producer_ids.alloc().ok_or_else(|| ServiceError::InvalidConfig("producer ids exhausted".into()))?;
        let id = ProducerId::from(raw as u16);
        self.producers.insert(id, Producer::new(id, uid, pid, name));
        self.metrics.record_producer_connected();
        Ok(id)
    }

    /// `InitializeConnection`'s SMB handshake: the service allocates the
    /// producer's shared-memory arena sized off `shm_size_kb` (falling back
    /// to `page_size_kb` as the producer's hint) and hands back a reference
    /// the producer commits chunks into directly.
    pub fn provision_shared_memory(&mut self, id: ProducerId, shm_size_kb: u32, page_size_kb: u32) -> Result<Arc<SharedMemoryAbi>, ServiceError> {
        let producer = self.producers.get_mut(&id).ok_or_else(|| ServiceError::InvalidConfig("unknown producer".into()))?;
        let page_size = resolve_page_size(page_size_kb, 0) as usize;
        let shm_bytes = (shm_size_kb as usize) * 1024;
        let page_count = (shm_bytes / page_size).max(1);
        let shmem = Arc::new(SharedMemoryAbi::new(page_count, page_size));
        producer.shared_memory = Some(Arc::clone(&shmem));
        Ok(shmem)
    }

    pub fn unregister_producer(&mut self, id: ProducerId) {
        if let Some(producer) = self.producers.remove(&id) {
            self.producer_ids.release(u64::from(id.get()));
            self.metrics.record_producer_disconnected();
            self.scrape_departing_producer(&producer);
        }
    }

    /// Pulls any `BeingWritten` chunks the producer left behind in its SMB
    /// into the right buffers, for sessions that opted into
    /// `smb_scraping_enabled` and have a data source instance bound to this
    /// producer. Mirrors the real flush-on-disconnect scrape: a producer
    /// that dies mid-chunk shouldn't lose data already staged in shared
    /// memory.
    fn scrape_departing_producer(&mut self, producer: &Producer) {
        let Some(shmem) = &producer.shared_memory else { return };
        let should_scrape = self.sessions.values().any(|s| {
            s.is_active() && s.config.smb_scraping_enabled && s.data_source_instances.iter().any(|d| d.producer_id == producer.id)
        });
        if !should_scrape {
            return;
        }
        for (writer_id, chunk_id, bytes) in shmem.scrape_being_written_chunks() {
            let Some(&buffer_id) = producer.writer_to_buffer.get(&writer_id) else { continue };
            let Some(buffer) = self.buffers.get_mut(&buffer_id) else { continue };
            let key = ChunkKey { producer_uid: producer.uid, writer_id, chunk_id };
            let _ = buffer.copy_in(key, 0, 0, &bytes);
        }
    }

    pub fn register_data_source(&mut self, producer_id: ProducerId, descriptor: DataSourceDescriptor) -> Result<(), ServiceError> {
        let producer = self.producers.get_mut(&producer_id).ok_or_else(|| ServiceError::InvalidConfig("unknown producer".into()))?;
        producer.register_data_source(descriptor);
        Ok(())
    }

    // --- Session lifecycle --------------------------------------

    pub fn enable_tracing(&mut self, consumer_uid: u32, config: TraceConfig) -> Result<TracingSessionId, ServiceError> {
        config.validate()?;
        if let Some(name) = &config.unique_session_name {
            let dup = self.sessions.values().any(|s| s.is_active() && s.config.unique_session_name.as_deref() == Some(name.as_str()));
            if dup {
                return Err(ServiceError::DuplicateSessionName(name.clone()));
            }
        }

        let mut buffer_ids = Vec::with_capacity(config.buffers.len());
        for buffer_config in &config.buffers {
            let raw = self.buffer_ids.alloc().ok_or_else(|| ServiceError::InvalidConfig("buffer ids exhausted".into()))?;
            let buffer_id = BufferId::from(raw as u16);
            let capacity_bytes = buffer_config.size_kb as usize * 1024;
            self.buffers.insert(buffer_id, TraceBuffer::new(capacity_bytes, to_buffer_fill_policy(buffer_config.fill_policy)));
            buffer_ids.push(buffer_id);
        }

        self.next_session_id += 1;
        let session_id = TracingSessionId::from(self.next_session_id);
        let mut session = TracingSession::new(session_id, consumer_uid, config.clone(), buffer_ids.clone());

        for ds_config in &config.data_sources {
            let target_buffer = buffer_ids.get(ds_config.target_buffer as usize).copied().unwrap_or(BufferId::INVALID);
            for producer in self.producers.values() {
                let Some(descriptor) = producer.registered_data_sources.get(&ds_config.name) else { continue };
                if !ds_config.producer_name_filter.is_empty() && !ds_config.producer_name_filter.contains(&producer.name) {
                    continue;
                }
                if !ds_config.producer_name_regex_filter.is_empty()
                    && !ds_config.producer_name_regex_filter.iter().any(|pattern| regex::Regex::new(pattern).is_ok_and(|re| re.is_match(&producer.name)))
                {
                    continue;
                }
                self.next_ds_instance_id += 1;
                let mut instance = DataSourceInstance::new(
                    DataSourceInstanceId::from(self.next_ds_instance_id),
                    producer.id,
                    ds_config.clone(),
                    target_buffer,
                );
                instance.capabilities = DataSourceCapabilities {
                    will_notify_on_start: descriptor.will_notify_on_start,
                    will_notify_on_stop: descriptor.will_notify_on_stop,
                    handles_incremental_state_clear: descriptor.handles_incremental_state_clear,
                    no_flush: descriptor.no_flush,
                };
                session.data_source_instances.push(instance);
            }
        }

        let deferred = session.config.deferred_start;
        self.sessions.insert(session_id, session);
        self.metrics.record_session_started();
        if !deferred {
            self.start_tracing(session_id)?;
        }
        Ok(session_id)
    }

    pub fn start_tracing(&mut self, session_id: TracingSessionId) -> Result<(), ServiceError> {
        let session = self.sessions.get_mut(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        if session.state != SessionState::Configured {
            return Err(ServiceError::InvalidSessionState(session_id));
        }
        session.start();
        for ds in &mut session.data_source_instances {
            if !ds.capabilities.will_notify_on_start {
                ds.mark_started();
            }
        }
        Ok(())
    }

    pub fn disable_tracing(&mut self, session_id: TracingSessionId) -> Result<(), ServiceError> {
        let session = self.sessions.get_mut(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        if !session.is_active() {
            return Err(ServiceError::InvalidSessionState(session_id));
        }
        session.begin_disable();
        for ds in &mut session.data_source_instances {
            if !ds.capabilities.will_notify_on_stop {
                ds.mark_stopped();
            }
        }
        if session.all_stop_acks_received() {
            session.finish_disable();
            self.metrics.record_session_disabled();
            log::info!("session {session_id:?} torn down: all data sources stopped");
        } else {
            log::debug!("session {session_id:?} disabling, waiting on stop acks");
        }
        Ok(())
    }

    pub fn notify_data_source_started(&mut self, producer_id: ProducerId, session_id: TracingSessionId, instance_id: DataSourceInstanceId) -> Result<(), ServiceError> {
        let session = self.sessions.get_mut(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        let instance = session.data_source_instances.iter_mut().find(|d| d.id == instance_id).ok_or(ServiceError::InvalidSessionState(session_id))?;
        if instance.producer_id != producer_id {
            return Err(ServiceError::InvalidSessionState(session_id));
        }
        instance.mark_started();
        let producer = instance.producer_id;
        let all_started = session.data_source_instances.iter().all(|d| d.state == crate::data_source::DataSourceInstanceState::Started);
        let event = if all_started { Some(ServiceEvent::AllDataSourcesStarted { session: session_id }) } else { None };
        self.broadcast(ServiceEvent::DataSourceInstanceStateChange {
            session: session_id,
            producer,
            instance: instance_id,
            state: crate::data_source::DataSourceInstanceState::Started,
        });
        if let Some(event) = event {
            self.broadcast(event);
        }
        Ok(())
    }

    pub fn notify_data_source_stopped(&mut self, producer_id: ProducerId, session_id: TracingSessionId, instance_id: DataSourceInstanceId) -> Result<(), ServiceError> {
        let session = self.sessions.get_mut(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        let instance = session.data_source_instances.iter_mut().find(|d| d.id == instance_id).ok_or(ServiceError::InvalidSessionState(session_id))?;
        if instance.producer_id != producer_id {
            return Err(ServiceError::InvalidSessionState(session_id));
        }
        instance.mark_stopped();
        let producer = instance.producer_id;
        if session.state == SessionState::DisablingWaitingStopAcks && session.all_stop_acks_received() {
            session.finish_disable();
            self.metrics.record_session_disabled();
        }
        self.broadcast(ServiceEvent::DataSourceInstanceStateChange {
            session: session_id,
            producer,
            instance: instance_id,
            state: crate::data_source::DataSourceInstanceState::Stopped,
        });
        Ok(())
    }

    // --- CommitData ---------------------------------------------

    pub fn commit_data(&mut self, producer_id: ProducerId, chunks: Vec<ChunkCommit>) -> Result<(), ServiceError> {
        let producer = self.producers.get_mut(&producer_id).ok_or_else(|| ServiceError::InvalidConfig("unknown producer".into()))?;
        for chunk in chunks {
            producer.writer_to_buffer.insert(chunk.writer_id, chunk.target_buffer);
            let Some(buffer) = self.buffers.get_mut(&chunk.target_buffer) else { continue };
            let key = ChunkKey { producer_uid: producer.uid, writer_id: chunk.writer_id, chunk_id: chunk.chunk_id };
            let len = chunk.payload.len() as u64;
            if buffer.copy_in(key, chunk.packet_count, chunk.flags.bits(), &chunk.payload).is_ok() {
                self.metrics.record_commit_data(len);
            }
        }
        Ok(())
    }

    pub fn apply_patches(&mut self, producer_id: ProducerId, patches: Vec<PatchCommit>) {
        let Some(producer) = self.producers.get(&producer_id) else { return };
        for patch_commit in patches {
            let patch = patch_commit.patch;
            let Some(&buffer_id) = producer.writer_to_buffer.get(&patch.writer_id) else { continue };
            let Some(buffer) = self.buffers.get_mut(&buffer_id) else { continue };
            let key = ChunkKey { producer_uid: producer.uid, writer_id: patch.writer_id, chunk_id: patch.chunk_id };
            buffer.apply_patch(key, patch.offset_in_chunk, patch.payload);
        }
    }

    // --- Flush ---------------------------------------------------

    pub fn request_flush(&mut self, session_id: TracingSessionId, initiator: FlushInitiator) -> Result<FlushRequestId, ServiceError> {
        let session = self.sessions.get_mut(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        self.next_flush_request_id += 1;
        let id = FlushRequestId::from(self.next_flush_request_id);
        let producers: std::collections::HashSet<_> = session
            .data_source_instances
            .iter()
            .filter(|d| !d.capabilities.no_flush)
            .map(|d| d.producer_id)
            .collect();
        session.flush_tracker.register(PendingFlush::new(id, producers, FlushFlags { initiator, reason_is_clone: matches!(initiator, FlushInitiator::Clone) }));
        self.metrics.record_flush_request();
        Ok(id)
    }

    pub fn notify_flush_complete(&mut self, session_id: TracingSessionId, producer: ProducerId, id: FlushRequestId) -> Vec<FlushRequestId> {
        let Some(session) = self.sessions.get_mut(&session_id) else { return Vec::new() };
        session.flush_tracker.notify_complete(producer, id)
    }

    pub fn expire_flushes(&mut self, session_id: TracingSessionId, expired: &[FlushRequestId]) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            let timed_out = session.flush_tracker.expire(expired);
            for id in &timed_out {
                log::warn!("flush {id:?} on session {session_id:?} timed out waiting for producer acks");
                self.metrics.record_flush_timeout();
            }
        }
    }

    // --- Triggers -------------------------------------------------

    pub fn activate_trigger(&mut self, producer_id: ProducerId, name: &str, skip_roll: f64, now: std::time::Instant) -> Result<(), ServiceError> {
        let producer_name = self.producers.get(&producer_id).ok_or_else(|| ServiceError::InvalidConfig("unknown producer".into()))?.name.clone();
        let session_ids: Vec<_> = self.sessions.iter().filter(|(_, s)| s.is_active()).map(|(id, _)| *id).collect();
        for session_id in session_ids {
            let action = {
                let session = self.sessions.get_mut(&session_id).expect("collected above");
                evaluate_trigger(&session.config.trigger_config, &mut session.trigger_quota, name, &producer_name, skip_roll, now)
            };
            let Some(action) = action else {
                log::debug!("trigger {name:?} not admitted for session {session_id:?} (unknown, quota, or skip roll)");
                continue;
            };
            log::info!("trigger {name:?} admitted for session {session_id:?}: {action:?}");
            self.metrics.record_trigger_activated();
            match action {
                TriggerAction::StartTracing { .. } => {
                    let _ = self.start_tracing(session_id);
                }
                TriggerAction::ScheduleFlushAndDisable { .. } => {
                    let _ = self.request_flush(session_id, FlushInitiator::SessionStop);
                    let _ = self.disable_tracing(session_id);
                }
                TriggerAction::CloneSnapshot => {
                    let uid = self.sessions.get(&session_id).map(|s| s.consumer_uid);
                    if let Some(uid) = uid {
                        if let Ok(cloned) = self.clone_session(session_id, uid, false) {
                            self.broadcast(ServiceEvent::CloneTriggered { source_session: session_id, cloned_session: cloned });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Clone ----------------------------------------------------

    /// Simplified synchronous clone: rather than fanning out
    /// `Flush(reason=kTraceClone)` to every producer and waiting for acks to
    /// land before snapshotting, this copies each source buffer's
    /// currently-indexed chunks immediately. The in-flight-fragment window
    /// that a real flush round-trip would close is accepted as a known gap
    /// (see `PendingClone`, whose bookkeeping this still exercises so a
    /// caller that *does* drive a real flush round-trip can use it).
    ///
    /// Per buffer, `BufferConfig::transfer_on_clone` and `clear_before_clone`
    /// (step 3 of the clone sequence) decide how the clone's buffer is
    /// built: `transfer_on_clone` moves the source buffer's storage
    /// wholesale into the clone and replaces the source with a fresh empty
    /// buffer of the same shape; `clear_before_clone` resets the source to
    /// empty once its chunks have been copied into the clone; neither flag
    /// set falls back to copying the source's currently-indexed chunks into
    /// a fresh `Discard`-policy buffer, leaving the source untouched.
    pub fn clone_session(&mut self, source_session_id: TracingSessionId, caller_uid: u32, is_bugreport_principal: bool) -> Result<TracingSessionId, ServiceError> {
        let source = self.sessions.get(&source_session_id).ok_or(ServiceError::SessionNotFound(source_session_id))?;
        if !is_clone_authorized(source.consumer_uid, caller_uid, source.config.bugreport_score, is_bugreport_principal) {
            log::warn!("uid {caller_uid} denied cloning session {source_session_id:?} owned by uid {}", source.consumer_uid);
            return Err(ServiceError::CloneNotAuthorized);
        }
        let buffer_configs = source.config.buffers.clone();
        let source_buffer_ids = source.buffer_ids.clone();

        let mut pending = PendingClone::new(source_session_id, caller_uid, source_buffer_ids.len());
        let mut new_buffer_ids = Vec::with_capacity(source_buffer_ids.len());
        for (idx, &source_buffer_id) in source_buffer_ids.iter().enumerate() {
            let transfer = buffer_configs.get(idx).is_some_and(|c| c.transfer_on_clone);
            let clear_before = buffer_configs.get(idx).is_some_and(|c| c.clear_before_clone);

            let cloned = if transfer {
                let Some(source_buffer) = self.buffers.remove(&source_buffer_id) else { continue };
                let replacement = TraceBuffer::new(source_buffer.capacity(), source_buffer.fill_policy());
                self.buffers.insert(source_buffer_id, replacement);
                source_buffer
            } else {
                let Some(source_buffer) = self.buffers.get(&source_buffer_id) else { continue };
                let mut fresh = TraceBuffer::new(source_buffer.capacity(), BufferFillPolicy::Discard);
                for seq in source_buffer.read_stitched() {
                    for (chunk_id, bytes, flags) in seq.chunks {
                        let key = ChunkKey { producer_uid: seq.producer_uid, writer_id: seq.writer_id, chunk_id };
                        let _ = fresh.copy_in(key, 0, flags, &bytes);
                    }
                }
                if clear_before {
                    if let Some(source_buffer) = self.buffers.get_mut(&source_buffer_id) {
                        source_buffer.clear();
                    }
                }
                fresh
            };

            pending.record_flush_settled();
            let raw = self.buffer_ids.alloc().ok_or_else(|| ServiceError::InvalidConfig("buffer ids exhausted".into()))?;
            let new_id = BufferId::from(raw as u16);
            self.buffers.insert(new_id, cloned);
            new_buffer_ids.push(new_id);
        }

        self.next_session_id += 1;
        let cloned_session_id = TracingSessionId::from(self.next_session_id);
        let source_config = self.sessions.get(&source_session_id).expect("checked above").config.clone();
        let mut cloned_session = TracingSession::new(cloned_session_id, caller_uid, source_config, new_buffer_ids);
        cloned_session.state = SessionState::ClonedReadOnly;
        self.sessions.insert(cloned_session_id, cloned_session);

        if let Some(source) = self.sessions.get_mut(&source_session_id) {
            source.cloned_out = true;
        }
        self.pending_clones.insert(source_session_id, pending);
        self.metrics.record_clone_completed();
        Ok(cloned_session_id)
    }

    // --- Incremental state ------------------------------------------------

    /// Ticks `incremental_state_config.clear_period_ms` for one session:
    /// bumps the generation counter and returns the instance ids that need
    /// an explicit clear notification (those with
    /// `handles_incremental_state_clear`). Instances without that capability
    /// clear implicitly on their own next read, nothing to send them.
    pub fn clear_incremental_state(&mut self, session_id: TracingSessionId) -> Result<(u32, Vec<DataSourceInstanceId>), ServiceError> {
        let session = self.sessions.get_mut(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        let generation = session.bump_incremental_state_generation();
        let notify = session
            .data_source_instances
            .iter()
            .filter(|d| d.capabilities.handles_incremental_state_clear)
            .map(|d| d.id)
            .collect();
        log::debug!("session {session_id:?} incremental state cleared, generation={generation}");
        Ok((generation, notify))
    }

    // --- Detach/Attach --------------------------------------------

    pub fn detach(&mut self, session_id: TracingSessionId, key: String) -> Result<(), ServiceError> {
        let session = self.sessions.get_mut(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        session.detach_key = Some(key.clone());
        self.detach_keys.insert(key, session_id);
        Ok(())
    }

    pub fn attach(&mut self, key: &str) -> Result<TracingSessionId, ServiceError> {
        self.detach_keys.remove(key).ok_or_else(|| ServiceError::UnknownDetachKey(key.to_string()))
    }

    // --- Read-out --------------------------------------------------

    pub fn read_buffers(&mut self, session_id: TracingSessionId) -> Result<Vec<(BufferId, Vec<trace_buffer::StitchedSequence>)>, ServiceError> {
        let session = self.sessions.get(&session_id).ok_or(ServiceError::SessionNotFound(session_id))?;
        if session.cloned_out {
            return Ok(Vec::new());
        }
        let filter = session.config.trace_filter.clone().filter(|f| !f.is_noop());
        let stitched: Vec<(BufferId, Vec<trace_buffer::StitchedSequence>)> =
            session.buffer_ids.iter().filter_map(|id| self.buffers.get(id).map(|b| (*id, b.read_stitched()))).collect();
        Ok(match filter {
            Some(filter) => stitched.into_iter().map(|(id, seqs)| (id, seqs.iter().map(|s| apply_trace_filter(s, &filter)).collect())).collect(),
            None => stitched,
        })
    }

    // --- Observability ------------------------------------------------------

    pub fn query_service_state(&self) -> ServiceStateSnapshot {
        ServiceStateSnapshot {
            producers: self
                .producers
                .values()
                .map(|p| ProducerSummary { id: p.id, name: p.name.clone(), uid: p.uid, data_sources: p.registered_data_sources.keys().cloned().collect() })
                .collect(),
            sessions: self
                .sessions
                .values()
                .map(|s| SessionSummary { id: s.id, consumer_uid: s.consumer_uid, state: s.state, buffer_ids: s.buffer_ids.clone() })
                .collect(),
        }
    }

    pub fn subscribe_events(&mut self, want_state_changes: bool, want_clone_triggered: bool) -> u64 {
        self.next_subscriber_id += 1;
        let id = self.next_subscriber_id;
        self.subscriptions.insert(id, EventSubscription::new(want_state_changes, want_clone_triggered));
        id
    }

    pub fn unsubscribe_events(&mut self, subscriber_id: u64) {
        self.subscriptions.remove(&subscriber_id);
    }

    pub fn poll_events(&mut self, subscriber_id: u64) -> Vec<ServiceEvent> {
        self.subscriptions.get_mut(&subscriber_id).map(EventSubscription::drain).unwrap_or_default()
    }

    fn broadcast(&mut self, event: ServiceEvent) {
        for sub in self.subscriptions.values_mut() {
            sub.notify(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, DataSourceConfig};
    use crate::producer::DataSourceDescriptor;
    use trace_smb::{ChunkFlags, ChunkHeader};
    use trace_types::{ChunkId, WriterId};

    fn basic_config() -> TraceConfig {
        TraceConfig {
            buffers: vec![BufferConfig { size_kb: 64, ..Default::default() }],
            data_sources: vec![DataSourceConfig { name: "ds".into(), target_buffer: 0, ..Default::default() }],
            ..Default::default()
        }
    }

    #[test]
    fn enable_tracing_creates_instance_for_matching_producer() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        svc.register_data_source(producer_id, DataSourceDescriptor { name: "ds".into(), will_notify_on_start: false, will_notify_on_stop: false, handles_incremental_state_clear: false, no_flush: false }).unwrap();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        let session = svc.sessions.get(&session_id).unwrap();
        assert_eq!(session.data_source_instances.len(), 1);
        assert_eq!(session.state, SessionState::Started);
    }

    #[test]
    fn commit_data_lands_in_target_buffer() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        let buffer_id = svc.sessions.get(&session_id).unwrap().buffer_ids[0];
        svc.commit_data(
            producer_id,
            vec![ChunkCommit { writer_id: WriterId::from(1), chunk_id: ChunkId::from(0), target_buffer: buffer_id, packet_count: 1, flags: ChunkFlags::NONE, payload: vec![1, 2, 3, 4] }],
        )
        .unwrap();
        let stitched = svc.read_buffers(session_id).unwrap();
        assert_eq!(stitched[0].1.len(), 1);
    }

    #[test]
    fn clear_incremental_state_bumps_generation_and_lists_capable_instances() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        svc.register_data_source(
            producer_id,
            DataSourceDescriptor { name: "ds".into(), will_notify_on_start: false, will_notify_on_stop: false, handles_incremental_state_clear: true, no_flush: false },
        )
        .unwrap();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        let instance_id = svc.sessions.get(&session_id).unwrap().data_source_instances[0].id;

        let (generation, notify) = svc.clear_incremental_state(session_id).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(notify, vec![instance_id]);

        let (generation, _) = svc.clear_incremental_state(session_id).unwrap();
        assert_eq!(generation, 2);
    }

    #[test]
    fn disable_tracing_completes_immediately_without_stop_ack_capability() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        svc.register_data_source(producer_id, DataSourceDescriptor { name: "ds".into(), will_notify_on_start: false, will_notify_on_stop: false, handles_incremental_state_clear: false, no_flush: false }).unwrap();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        svc.disable_tracing(session_id).unwrap();
        assert_eq!(svc.sessions.get(&session_id).unwrap().state, SessionState::Disabled);
    }

    #[test]
    fn provision_shared_memory_resolves_page_size_and_stores_arena() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        let shmem = svc.provision_shared_memory(producer_id, 64, 8).unwrap();
        assert_eq!(shmem.page_size(), 8 * 1024);
        assert!(shmem.page_count() >= 1);
        assert!(svc.producers.get(&producer_id).unwrap().shared_memory.is_some());
    }

    #[test]
    fn unregister_producer_scrapes_being_written_chunks_when_smb_scraping_enabled() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        svc.register_data_source(producer_id, DataSourceDescriptor { name: "ds".into(), will_notify_on_start: false, will_notify_on_stop: false, handles_incremental_state_clear: false, no_flush: false }).unwrap();
        let mut cfg = basic_config();
        cfg.smb_scraping_enabled = true;
        let session_id = svc.enable_tracing(1, cfg).unwrap();
        let buffer_id = svc.sessions.get(&session_id).unwrap().buffer_ids[0];

        let shmem = svc.provision_shared_memory(producer_id, 64, 4).unwrap();
        svc.producers.get_mut(&producer_id).unwrap().register_trace_writer(WriterId::from(9), buffer_id);

        shmem.try_partition_page(0, 1, buffer_id);
        let (page_idx, chunk_idx, mut guard) = shmem.try_acquire_chunk_for_writing(WriterId::from(9), ChunkId::from(5)).unwrap();
        let packet_one = trace_types::varint::encode_varint_fixed4(2);
        guard.payload_mut()[0..4].copy_from_slice(&packet_one);
        guard.payload_mut()[4..6].copy_from_slice(b"hi");
        let packet_two_len = trace_types::varint::encode_varint_fixed4(100);
        guard.payload_mut()[6..10].copy_from_slice(&packet_two_len);
        shmem.update_chunk_header(page_idx, chunk_idx, ChunkHeader { packet_count: 2, ..ChunkHeader::new(WriterId::from(9), ChunkId::from(5)) });

        svc.unregister_producer(producer_id);

        let stitched = svc.read_buffers(session_id).unwrap();
        assert_eq!(stitched[0].1.len(), 1);
        assert_eq!(stitched[0].1[0].chunks.len(), 1);
    }

    #[test]
    fn unregister_producer_does_not_scrape_when_smb_scraping_disabled() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        svc.register_data_source(producer_id, DataSourceDescriptor { name: "ds".into(), will_notify_on_start: false, will_notify_on_stop: false, handles_incremental_state_clear: false, no_flush: false }).unwrap();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        let buffer_id = svc.sessions.get(&session_id).unwrap().buffer_ids[0];

        let shmem = svc.provision_shared_memory(producer_id, 64, 4).unwrap();
        svc.producers.get_mut(&producer_id).unwrap().register_trace_writer(WriterId::from(9), buffer_id);
        shmem.try_partition_page(0, 1, buffer_id);
        let (page_idx, chunk_idx, mut guard) = shmem.try_acquire_chunk_for_writing(WriterId::from(9), ChunkId::from(5)).unwrap();
        guard.payload_mut()[0..4].copy_from_slice(&trace_types::varint::encode_varint_fixed4(2));
        guard.payload_mut()[4..6].copy_from_slice(b"hi");
        guard.payload_mut()[6..10].copy_from_slice(&trace_types::varint::encode_varint_fixed4(100));
        shmem.update_chunk_header(page_idx, chunk_idx, ChunkHeader { packet_count: 2, ..ChunkHeader::new(WriterId::from(9), ChunkId::from(5)) });

        svc.unregister_producer(producer_id);

        let stitched = svc.read_buffers(session_id).unwrap();
        assert_eq!(stitched[0].1.len(), 0);
    }

    #[test]
    fn clone_requires_authorization() {
        let mut svc = TracingService::new();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        assert_eq!(svc.clone_session(session_id, 2, false).unwrap_err(), ServiceError::CloneNotAuthorized);
    }

    #[test]
    fn clone_marks_source_cloned_out() {
        let mut svc = TracingService::new();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        let cloned_id = svc.clone_session(session_id, 1, false).unwrap();
        assert!(svc.sessions.get(&session_id).unwrap().cloned_out);
        assert_eq!(svc.sessions.get(&cloned_id).unwrap().state, SessionState::ClonedReadOnly);
        assert!(svc.read_buffers(session_id).unwrap().iter().all(|(_, seqs)| seqs.is_empty()));
    }

    #[test]
    fn producer_name_regex_filter_admits_only_matching_producers() {
        let mut svc = TracingService::new();
        let matching = svc.register_producer(1, 100, "trusted_app".into()).unwrap();
        let non_matching = svc.register_producer(1, 101, "other_app".into()).unwrap();
        for id in [matching, non_matching] {
            svc.register_data_source(id, DataSourceDescriptor { name: "ds".into(), will_notify_on_start: false, will_notify_on_stop: false, handles_incremental_state_clear: false, no_flush: false }).unwrap();
        }
        let cfg = TraceConfig {
            buffers: vec![BufferConfig { size_kb: 64, ..Default::default() }],
            data_sources: vec![DataSourceConfig { name: "ds".into(), target_buffer: 0, producer_name_regex_filter: vec!["^trusted_.*".into()], ..Default::default() }],
            ..Default::default()
        };
        let session_id = svc.enable_tracing(1, cfg).unwrap();
        let session = svc.sessions.get(&session_id).unwrap();
        assert_eq!(session.data_source_instances.len(), 1);
        assert_eq!(session.data_source_instances[0].producer_id, matching);
    }

    #[test]
    fn read_buffers_applies_session_trace_filter() {
        use crate::filter::{StringRedactionRule, TraceFilter};

        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        let mut cfg = basic_config();
        cfg.trace_filter = Some(TraceFilter { allowed_field_numbers: vec![], string_redactions: vec![StringRedactionRule { field_number: 1, pattern: "secret".into(), replacement: '*' }] });
        let session_id = svc.enable_tracing(1, cfg).unwrap();
        let buffer_id = svc.sessions.get(&session_id).unwrap().buffer_ids[0];

        let mut packet = trace_types::varint::write_varint(1 << 3 | 2);
        packet.extend(trace_types::varint::write_varint(b"my secret value".len() as u64));
        packet.extend_from_slice(b"my secret value");
        let mut payload = trace_types::varint::encode_varint_fixed4(packet.len() as u32).to_vec();
        payload.extend_from_slice(&packet);

        svc.commit_data(producer_id, vec![ChunkCommit { writer_id: WriterId::from(1), chunk_id: ChunkId::from(0), target_buffer: buffer_id, packet_count: 1, flags: ChunkFlags::NONE, payload }])
            .unwrap();

        let stitched = svc.read_buffers(session_id).unwrap();
        let bytes = &stitched[0].1[0].chunks[0].1;
        assert!(!bytes.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn clone_with_transfer_on_clone_moves_source_buffer_and_resets_it() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        let mut cfg = basic_config();
        cfg.buffers = vec![BufferConfig { size_kb: 64, transfer_on_clone: true, ..Default::default() }];
        let session_id = svc.enable_tracing(1, cfg).unwrap();
        let buffer_id = svc.sessions.get(&session_id).unwrap().buffer_ids[0];
        svc.commit_data(producer_id, vec![ChunkCommit { writer_id: WriterId::from(1), chunk_id: ChunkId::from(0), target_buffer: buffer_id, packet_count: 1, flags: ChunkFlags::NONE, payload: vec![1, 2, 3, 4] }])
            .unwrap();

        let cloned_id = svc.clone_session(session_id, 1, false).unwrap();

        let source_stitched = svc.read_buffers(session_id).unwrap();
        assert!(source_stitched[0].1.is_empty(), "source buffer should be empty after transfer_on_clone");

        let cloned_buffer_id = svc.sessions.get(&cloned_id).unwrap().buffer_ids[0];
        let cloned_stitched = svc.buffers.get(&cloned_buffer_id).unwrap().read_stitched();
        assert_eq!(cloned_stitched.len(), 1);
    }

    #[test]
    fn clone_with_clear_before_clone_empties_source_after_copying() {
        let mut svc = TracingService::new();
        let producer_id = svc.register_producer(1, 100, "prod".into()).unwrap();
        let mut cfg = basic_config();
        cfg.buffers = vec![BufferConfig { size_kb: 64, clear_before_clone: true, ..Default::default() }];
        let session_id = svc.enable_tracing(1, cfg).unwrap();
        let buffer_id = svc.sessions.get(&session_id).unwrap().buffer_ids[0];
        svc.commit_data(producer_id, vec![ChunkCommit { writer_id: WriterId::from(1), chunk_id: ChunkId::from(0), target_buffer: buffer_id, packet_count: 1, flags: ChunkFlags::NONE, payload: vec![1, 2, 3, 4] }])
            .unwrap();

        let cloned_id = svc.clone_session(session_id, 1, false).unwrap();

        assert_eq!(svc.buffers.get(&buffer_id).unwrap().indexed_chunk_count(), 0);
        let cloned_buffer_id = svc.sessions.get(&cloned_id).unwrap().buffer_ids[0];
        let cloned_stitched = svc.buffers.get(&cloned_buffer_id).unwrap().read_stitched();
        assert_eq!(cloned_stitched.len(), 1);
    }

    #[test]
    fn duplicate_session_name_is_rejected() {
        let mut svc = TracingService::new();
        let mut cfg = basic_config();
        cfg.unique_session_name = Some("only-one".into());
        svc.enable_tracing(1, cfg.clone()).unwrap();
        assert_eq!(svc.enable_tracing(2, cfg).unwrap_err(), ServiceError::DuplicateSessionName("only-one".into()));
    }

    #[test]
    fn detach_then_attach_roundtrips_session_id() {
        let mut svc = TracingService::new();
        let session_id = svc.enable_tracing(1, basic_config()).unwrap();
        svc.detach(session_id, "mykey".into()).unwrap();
        assert_eq!(svc.attach("mykey").unwrap(), session_id);
        assert!(svc.attach("mykey").is_err());
    }
}
