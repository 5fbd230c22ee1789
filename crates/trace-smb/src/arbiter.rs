//! Producer-side arbiter: hands out fresh chunks to competing
//! `TraceWriter`s, batches completed-chunk notifications, allocates
//! `WriterId`s, and buffers writes from before the arbiter is bound to a
//! real SMB.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use trace_types::{ChunkId, Patch, WriterId};

use crate::abi::SharedMemoryAbi;
use crate::chunk::{ChunkFlags, ChunkHeader};
use crate::error::SmbError;

/// What a writer should do when a full sweep of the SMB finds no free chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferExhaustedPolicy {
    /// Block until the service frees a page.
    Stall,
    /// Drop the packet in progress and enter discard mode.
    Drop,
}

/// Callback invoked once per batching window when the pending-notification
/// list transitions from empty to non-empty; the actual delay/dispatch
/// policy (immediate vs a timer) lives with whatever schedules the task,
/// not with the arbiter itself.
pub trait CommitScheduler: Send + Sync {
    fn schedule_commit(&self);
}

/// A no-delay scheduler: every `ReturnCompletedChunk` that opens a new batch
/// invokes the callback synchronously. Useful for tests and for services
/// configured with a zero batching window.
pub struct ImmediateScheduler<F: Fn() + Send + Sync>(pub F);

impl<F: Fn() + Send + Sync> CommitScheduler for ImmediateScheduler<F> {
    fn schedule_commit(&self) {
        (self.0)()
    }
}

struct ArbiterState {
    cursor: usize,
    writer_ids: trace_types::IdPool,
    pending_pages: Vec<usize>,
    /// Chunks the arbiter still owns (not yet handed off via `CommitData`),
    /// eligible for direct in-place patching.
    owned_chunks: std::collections::HashSet<(WriterId, ChunkId, usize, usize)>,
    startup_buffer: Vec<(WriterId, Vec<u8>)>,
    bound: bool,
}

/// Arbitrates a single SMB region among the `TraceWriter`s of one producer.
pub struct Arbiter {
    abi: Arc<SharedMemoryAbi>,
    default_layout: u8,
    scheduler: Box<dyn CommitScheduler>,
    state: Mutex<ArbiterState>,
    stalled_waiters: AtomicUsize,
}

impl Arbiter {
    #[must_use]
    pub fn new(abi: Arc<SharedMemoryAbi>, default_layout: u8, scheduler: Box<dyn CommitScheduler>) -> Self {
        Self {
            abi,
            default_layout,
            scheduler,
            state: Mutex::new(ArbiterState {
                cursor: 0,
                writer_ids: trace_types::IdPool::new(u64::from(u16::MAX)),
                pending_pages: Vec::new(),
                owned_chunks: std::collections::HashSet::new(),
                startup_buffer: Vec::new(),
                bound: true,
            }),
            stalled_waiters: AtomicUsize::new(0),
        }
    }

    /// Constructs an unbound arbiter that buffers all writes until
    /// [`Self::bind`] is called (cold-start path).
    #[must_use]
    pub fn new_unbound(default_layout: u8, scheduler: Box<dyn CommitScheduler>) -> Self {
        let unbound_abi = Arc::new(SharedMemoryAbi::new(0, 0));
        let arbiter = Self::new(unbound_abi, default_layout, scheduler);
        arbiter.state.lock().unwrap().bound = false;
        arbiter
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.state.lock().unwrap().bound
    }

    /// Allocates a fresh `WriterId` from the `[1, 2^16-1]` pool.
    pub fn new_writer_id(&self) -> Result<WriterId, SmbError> {
        let mut state = self.state.lock().unwrap();
        state
            .writer_ids
            .alloc()
            .map(|id| WriterId::from(id as u16))
            .ok_or(SmbError::WriterIdsExhausted)
    }

    pub fn release_writer_id(&self, id: WriterId) {
        self.state.lock().unwrap().writer_ids.release(u64::from(id.get()));
    }

    /// `GetNewChunk`: one full rotating sweep of the arena, partitioning
    /// a free page if the cursor lands on one, otherwise acquiring the first
    /// free chunk in a page whose `target_buffer` matches.
    pub fn get_new_chunk(
        &self,
        writer_id: WriterId,
        chunk_id: ChunkId,
        target_buffer: trace_types::BufferId,
        policy: BufferExhaustedPolicy,
    ) -> Option<(usize, usize, ChunkHeader)> {
        if let Some(found) = self.sweep_once(writer_id, chunk_id, target_buffer) {
            return Some(found);
        }
        match policy {
            BufferExhaustedPolicy::Drop => {
                log::warn!("writer {writer_id:?} dropping chunk {chunk_id:?}: arena exhausted, policy=Drop");
                None
            }
            BufferExhaustedPolicy::Stall => {
                log::debug!("writer {writer_id:?} stalling for a free chunk (target_buffer={target_buffer:?})");
                self.stalled_waiters.fetch_add(1, Ordering::SeqCst);
                let found = loop {
                    std::thread::yield_now();
                    if let Some(found) = self.sweep_once(writer_id, chunk_id, target_buffer) {
                        break Some(found);
                    }
                    if self.abi.free_chunk_count() == 0 && self.abi.page_count() == 0 {
                        break None;
                    }
                };
                self.stalled_waiters.fetch_sub(1, Ordering::SeqCst);
                found
            }
        }
    }

    fn sweep_once(
        &self,
        writer_id: WriterId,
        chunk_id: ChunkId,
        target_buffer: trace_types::BufferId,
    ) -> Option<(usize, usize, ChunkHeader)> {
        let page_count = self.abi.page_count();
        if page_count == 0 {
            return None;
        }
        let start = {
            let mut state = self.state.lock().unwrap();
            let start = state.cursor;
            state.cursor = (state.cursor + 1) % page_count;
            start
        };
        for i in 0..page_count {
            let page_idx = (start + i) % page_count;
            let is_free = self.abi.try_partition_page(page_idx, self.default_layout, target_buffer);
            if !is_free && self.abi.page_target_buffer(page_idx) != Some(target_buffer) {
                continue;
            }
            if let Some(chunk_idx) = self.try_acquire_on_page(page_idx, writer_id, chunk_id) {
                return Some((page_idx, chunk_idx, ChunkHeader::new(writer_id, chunk_id)));
            }
        }
        None
    }

    fn try_acquire_on_page(&self, page_idx: usize, writer_id: WriterId, chunk_id: ChunkId) -> Option<usize> {
        if let Some((acquired_page, chunk_idx, _guard)) = self.abi.try_acquire_chunk_for_writing(writer_id, chunk_id) {
            debug_assert_eq!(acquired_page, page_idx);
            let mut state = self.state.lock().unwrap();
            state.owned_chunks.insert((writer_id, chunk_id, page_idx, chunk_idx));
            Some(chunk_idx)
        } else {
            None
        }
    }

    #[must_use]
    pub fn default_layout(&self) -> u8 {
        self.default_layout
    }

    #[must_use]
    pub fn chunk_payload_len(&self) -> usize {
        self.abi.chunk_payload_len(self.default_layout)
    }

    pub fn write_chunk_bytes(&self, page_idx: usize, chunk_idx: usize, offset: usize, bytes: &[u8]) {
        self.abi.write_chunk_bytes(page_idx, chunk_idx, self.default_layout, offset, bytes);
    }

    /// Mirrors the writer's in-progress chunk header (packet count, flags)
    /// into the SMB's out-of-band metadata table so a scrape on producer
    /// disconnect can see progress made since the chunk was acquired.
    pub fn update_chunk_header(&self, page_idx: usize, chunk_idx: usize, header: ChunkHeader) {
        self.abi.update_chunk_header(page_idx, chunk_idx, header);
    }

    #[must_use]
    pub fn read_chunk_bytes(&self, page_idx: usize, chunk_idx: usize, offset: usize, len: usize) -> Vec<u8> {
        self.abi.read_chunk_bytes(page_idx, chunk_idx, self.default_layout, offset, len)
    }

    /// `ReturnCompletedChunk`: marks the chunk `Complete` and schedules
    /// a batched commit if this is the first pending page in the window.
    pub fn return_completed_chunk(&self, page_idx: usize, chunk_idx: usize, writer_id: WriterId, chunk_id: ChunkId) {
        self.abi.release_chunk_as_complete(page_idx, chunk_idx);
        let should_schedule = {
            let mut state = self.state.lock().unwrap();
            state.owned_chunks.remove(&(writer_id, chunk_id, page_idx, chunk_idx));
            let was_empty = state.pending_pages.is_empty();
            state.pending_pages.push(page_idx);
            was_empty
        };
        if should_schedule {
            self.scheduler.schedule_commit();
        }
    }

    /// Drains the pending-notification list, e.g. for the batched
    /// `CommitData` task to consume.
    pub fn drain_pending_pages(&self) -> Vec<usize> {
        std::mem::take(&mut self.state.lock().unwrap().pending_pages)
    }

    /// Applies a patch in place if the arbiter still owns
    /// the target chunk, otherwise returns the patch for the caller to
    /// forward via `CommitData.chunks_to_patch`.
    pub fn apply_or_forward_patch(&self, patch: Patch) -> Result<(), Patch> {
        let owned = {
            let state = self.state.lock().unwrap();
            state
                .owned_chunks
                .iter()
                .find(|&&(w, c, _, _)| w == patch.writer_id && c == patch.chunk_id)
                .copied()
        };
        match owned {
            Some((_, _, page_idx, chunk_idx)) => {
                let layout = self.default_layout;
                self.abi
                    .apply_patch(page_idx, chunk_idx, layout, patch.offset_in_chunk, patch.payload);
                Ok(())
            }
            None => Err(patch),
        }
    }

    /// Cold-start buffering: before the arbiter is bound, writes accumulate
    /// per-writer in a heap buffer preserving packet boundaries.
    pub fn buffer_startup_write(&self, writer_id: WriterId, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(!state.bound, "buffer_startup_write called on a bound arbiter");
        if let Some((_, buf)) = state.startup_buffer.iter_mut().find(|(w, _)| *w == writer_id) {
            buf.extend_from_slice(bytes);
        } else {
            state.startup_buffer.push((writer_id, bytes.to_vec()));
        }
    }

    /// Binds a previously-unbound arbiter to a real SMB, replaying buffered
    /// startup writes into freshly acquired chunks.
    pub fn bind(&mut self, abi: Arc<SharedMemoryAbi>, target_buffer: trace_types::BufferId) {
        self.abi = abi;
        let buffered = {
            let mut state = self.state.lock().unwrap();
            state.bound = true;
            std::mem::take(&mut state.startup_buffer)
        };
        for (writer_id, bytes) in buffered {
            let mut offset = 0;
            let mut chunk_id = ChunkId::from(0);
            while offset < bytes.len() {
                let Some((page_idx, chunk_idx, mut guard)) =
                    self.abi.try_acquire_chunk_for_writing(writer_id, chunk_id)
                else {
                    break;
                };
                let n = bytes.len() - offset;
                let cap = guard.payload_mut().len().min(n);
                guard.payload_mut()[..cap].copy_from_slice(&bytes[offset..offset + cap]);
                if cap < n {
                    guard.header_mut().flags.insert(ChunkFlags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK);
                }
                self.abi.release_chunk_as_complete(page_idx, chunk_idx);
                offset += cap;
                chunk_id = chunk_id.next();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_types::BufferId;

    fn test_scheduler() -> Box<dyn CommitScheduler> {
        Box::new(ImmediateScheduler(|| {}))
    }

    #[test]
    fn allocates_writer_ids_starting_at_one() {
        let abi = Arc::new(SharedMemoryAbi::new(2, 4096));
        let arbiter = Arbiter::new(abi, 2, test_scheduler());
        let id = arbiter.new_writer_id().unwrap();
        assert_eq!(id.get(), 1);
    }

    #[test]
    fn get_new_chunk_partitions_and_acquires() {
        let abi = Arc::new(SharedMemoryAbi::new(2, 4096));
        let arbiter = Arbiter::new(abi, 2, test_scheduler());
        let writer_id = arbiter.new_writer_id().unwrap();
        let found = arbiter.get_new_chunk(
            writer_id,
            ChunkId::from(0),
            BufferId::from(1),
            BufferExhaustedPolicy::Drop,
        );
        assert!(found.is_some());
    }

    #[test]
    fn exhaustion_with_drop_policy_returns_none() {
        let abi = Arc::new(SharedMemoryAbi::new(1, 4096));
        let arbiter = Arbiter::new(abi, 1, test_scheduler());
        let writer_id = arbiter.new_writer_id().unwrap();
        let first = arbiter.get_new_chunk(writer_id, ChunkId::from(0), BufferId::from(1), BufferExhaustedPolicy::Drop);
        assert!(first.is_some());
        let second = arbiter.get_new_chunk(writer_id, ChunkId::from(1), BufferId::from(1), BufferExhaustedPolicy::Drop);
        assert!(second.is_none());
    }

    #[test]
    fn return_completed_chunk_schedules_batch_once() {
        use std::sync::atomic::AtomicUsize;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let abi = Arc::new(SharedMemoryAbi::new(1, 4096));
        let arbiter = Arbiter::new(abi, 1, Box::new(ImmediateScheduler(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        })));
        let writer_id = arbiter.new_writer_id().unwrap();
        let (page_idx, chunk_idx, _) = arbiter
            .get_new_chunk(writer_id, ChunkId::from(0), BufferId::from(1), BufferExhaustedPolicy::Drop)
            .unwrap();
        arbiter.return_completed_chunk(page_idx, chunk_idx, writer_id, ChunkId::from(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(arbiter.drain_pending_pages(), vec![page_idx]);
    }

    #[test]
    fn startup_buffer_replays_on_bind() {
        let arbiter_scheduler = test_scheduler();
        let mut arbiter = Arbiter::new_unbound(2, arbiter_scheduler);
        assert!(!arbiter.is_bound());
        let writer_id = WriterId::from(3);
        arbiter.buffer_startup_write(writer_id, b"hello");
        let abi = Arc::new(SharedMemoryAbi::new(1, 4096));
        arbiter.bind(abi, BufferId::from(1));
        assert!(arbiter.is_bound());
    }
}
