//! The per-{session,buffer} append-only ring.

use std::collections::{HashMap, VecDeque};

use trace_types::{ChunkId, WriterId};

use crate::error::BufferError;
use crate::index::{ChunkKey, ChunkLocation};

/// How the buffer behaves once full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    /// Overwrite the oldest chunks to make room (the common case).
    RingBuffer,
    /// Refuse new chunks once full; the buffer never wraps.
    Discard,
}

/// Per-buffer counters surfaced in `TraceStats`/`BufferStats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub chunks_written: u64,
    pub chunks_overwritten: u64,
    pub chunks_discarded: u64,
    pub patches_dropped: u64,
    pub bytes_written: u64,
}

/// One fully reassembled (or partial, if still in flight) fragment
/// sequence for a single writer, ordered by `chunk_id`.
#[derive(Debug, Clone)]
pub struct StitchedSequence {
    pub producer_uid: u32,
    pub writer_id: WriterId,
    pub chunks: Vec<(ChunkId, Vec<u8>, u8)>,
}

/// Fixed-capacity append-only ring of bytes, indexed by `(producer_uid,
/// writer_id, chunk_id)` for patching and read-out stitching.
pub struct TraceBuffer {
    capacity: usize,
    fill_policy: FillPolicy,
    storage: Vec<u8>,
    write_cursor: usize,
    index: HashMap<ChunkKey, ChunkLocation>,
    /// Insertion order, oldest first; drives oldest-first eviction.
    order: VecDeque<ChunkKey>,
    stats: BufferStats,
}

impl TraceBuffer {
    #[must_use]
    pub fn new(capacity_bytes: usize, fill_policy: FillPolicy) -> Self {
        Self {
            capacity: capacity_bytes,
            fill_policy,
            storage: vec![0u8; capacity_bytes],
            write_cursor: 0,
            index: HashMap::new(),
            order: VecDeque::new(),
            stats: BufferStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn fill_policy(&self) -> FillPolicy {
        self.fill_policy
    }

    /// Resets the buffer to empty, keeping its capacity, fill policy, and
    /// cumulative stats. Used for a session clone's `clear_before_clone`
    /// buffers, and for the fresh buffer a `transfer_on_clone` buffer's
    /// source is replaced with.
    pub fn clear(&mut self) {
        self.write_cursor = 0;
        self.index.clear();
        self.order.clear();
    }

    /// Copies a chunk's payload into the ring, evicting oldest entries as
    /// needed under `RingBuffer` policy. Returns an error (chunk dropped,
    /// no data mutated) if it can't fit.
    pub fn copy_in(&mut self, key: ChunkKey, packet_count: u16, flags: u8, payload: &[u8]) -> Result<(), BufferError> {
        let len = payload.len();
        if len > self.capacity {
            self.stats.chunks_discarded += 1;
            log::warn!("chunk {key:?} ({len}B) exceeds buffer capacity ({}B), dropping", self.capacity);
            return Err(BufferError::ChunkTooLarge { len, capacity: self.capacity });
        }

        let start = if self.write_cursor + len <= self.capacity {
            self.write_cursor
        } else {
            match self.fill_policy {
                FillPolicy::Discard => {
                    self.stats.chunks_discarded += 1;
                    log::debug!("chunk {key:?} dropped: buffer full under Discard policy");
                    return Err(BufferError::Discarded);
                }
                FillPolicy::RingBuffer => 0,
            }
        };

        self.evict_overlapping(start, len);
        self.storage[start..start + len].copy_from_slice(payload);
        self.write_cursor = start + len;

        self.index.insert(key, ChunkLocation { offset: start, len, packet_count, flags });
        self.order.push_back(key);
        self.stats.chunks_written += 1;
        self.stats.bytes_written += len as u64;
        Ok(())
    }

    /// Drops any indexed chunk whose byte range intersects `[start, start+len)`,
    /// oldest first — the region about to be overwritten.
    fn evict_overlapping(&mut self, start: usize, len: usize) {
        let end = start + len;
        while let Some(&oldest) = self.order.front() {
            let Some(loc) = self.index.get(&oldest) else {
                self.order.pop_front();
                continue;
            };
            let overlaps = loc.offset < end && start < loc.offset + loc.len;
            if !overlaps {
                break;
            }
            self.order.pop_front();
            self.index.remove(&oldest);
            self.stats.chunks_overwritten += 1;
        }
    }

    /// An invalid patch is silently dropped if the chunk was evicted or the
    /// offset falls outside its payload.
    pub fn apply_patch(&mut self, key: ChunkKey, offset_in_chunk: u32, bytes: [u8; 4]) -> bool {
        let Some(loc) = self.index.get(&key).copied() else {
            self.stats.patches_dropped += 1;
            return false;
        };
        let off = offset_in_chunk as usize;
        if off + 4 > loc.len {
            self.stats.patches_dropped += 1;
            return false;
        }
        let base = loc.offset + off;
        self.storage[base..base + 4].copy_from_slice(&bytes);
        true
    }

    /// `ReadBuffers`: snapshots every still-indexed chunk grouped by
    /// writer and ordered by `chunk_id`, for the service to reassemble
    /// fragment sequences. The read cursor is independent of the write
    /// cursor and is implicitly reset by calling this again.
    #[must_use]
    pub fn read_stitched(&self) -> Vec<StitchedSequence> {
        let mut by_writer: HashMap<(u32, WriterId), Vec<(ChunkId, Vec<u8>, u8)>> = HashMap::new();
        for key in &self.order {
            let Some(loc) = self.index.get(key) else { continue };
            let bytes = self.storage[loc.offset..loc.offset + loc.len].to_vec();
            by_writer
                .entry((key.producer_uid, key.writer_id))
                .or_default()
                .push((key.chunk_id, bytes, loc.flags));
        }
        by_writer
            .into_iter()
            .map(|((producer_uid, writer_id), mut chunks)| {
                chunks.sort_by_key(|(chunk_id, _, _)| chunk_id.get());
                StitchedSequence { producer_uid, writer_id, chunks }
            })
            .collect()
    }

    #[must_use]
    pub fn indexed_chunk_count(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(writer: u16, chunk: u32) -> ChunkKey {
        ChunkKey { producer_uid: 1, writer_id: WriterId::from(writer), chunk_id: ChunkId::from(chunk) }
    }

    #[test]
    fn copy_in_and_stitch_preserves_chunk_id_order() {
        let mut buf = TraceBuffer::new(256, FillPolicy::RingBuffer);
        buf.copy_in(key(1, 1), 1, 0, &[1u8; 16]).unwrap();
        buf.copy_in(key(1, 0), 1, 0, &[0u8; 16]).unwrap();
        let stitched = buf.read_stitched();
        assert_eq!(stitched.len(), 1);
        assert_eq!(stitched[0].chunks[0].0.get(), 0);
        assert_eq!(stitched[0].chunks[1].0.get(), 1);
    }

    #[test]
    fn oldest_entries_evicted_on_wraparound() {
        let mut buf = TraceBuffer::new(32, FillPolicy::RingBuffer);
        buf.copy_in(key(1, 0), 1, 0, &[0u8; 20]).unwrap();
        buf.copy_in(key(1, 1), 1, 0, &[1u8; 20]).unwrap();
        assert_eq!(buf.stats().chunks_overwritten, 1);
        assert_eq!(buf.indexed_chunk_count(), 1);
    }

    #[test]
    fn discard_policy_rejects_once_full() {
        let mut buf = TraceBuffer::new(16, FillPolicy::Discard);
        buf.copy_in(key(1, 0), 1, 0, &[0u8; 16]).unwrap();
        let err = buf.copy_in(key(1, 1), 1, 0, &[1u8; 4]).unwrap_err();
        assert_eq!(err, BufferError::Discarded);
        assert_eq!(buf.stats().chunks_discarded, 1);
    }

    #[test]
    fn patch_on_evicted_chunk_is_dropped_silently() {
        let mut buf = TraceBuffer::new(32, FillPolicy::RingBuffer);
        buf.copy_in(key(1, 0), 1, 0, &[0u8; 20]).unwrap();
        buf.copy_in(key(1, 1), 1, 0, &[1u8; 20]).unwrap();
        assert!(!buf.apply_patch(key(1, 0), 0, [9, 9, 9, 9]));
        assert_eq!(buf.stats().patches_dropped, 1);
    }

    #[test]
    fn patch_out_of_bounds_is_dropped() {
        let mut buf = TraceBuffer::new(64, FillPolicy::RingBuffer);
        buf.copy_in(key(1, 0), 1, 0, &[0u8; 8]).unwrap();
        assert!(!buf.apply_patch(key(1, 0), 6, [1, 2, 3, 4]));
    }

    #[test]
    fn chunk_larger_than_capacity_is_rejected() {
        let mut buf = TraceBuffer::new(8, FillPolicy::RingBuffer);
        let err = buf.copy_in(key(1, 0), 1, 0, &[0u8; 16]).unwrap_err();
        assert_eq!(err, BufferError::ChunkTooLarge { len: 16, capacity: 8 });
    }

    #[test]
    fn clear_empties_the_index_but_keeps_capacity_and_stats() {
        let mut buf = TraceBuffer::new(64, FillPolicy::RingBuffer);
        buf.copy_in(key(1, 0), 1, 0, &[0u8; 16]).unwrap();
        let stats_before = buf.stats();
        buf.clear();
        assert_eq!(buf.indexed_chunk_count(), 0);
        assert!(buf.read_stitched().is_empty());
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.stats().chunks_written, stats_before.chunks_written);
        buf.copy_in(key(1, 0), 1, 0, &[1u8; 16]).unwrap();
        assert_eq!(buf.indexed_chunk_count(), 1);
    }
}
