//! Property-based tests for the append-only ring buffer's capacity and
//! eviction bookkeeping.

use proptest::prelude::*;
use trace_buffer::{FillPolicy, TraceBuffer};
use trace_types::{ChunkId, WriterId};

fn key(chunk: u32) -> trace_buffer::ChunkKey {
    trace_buffer::ChunkKey { producer_uid: 1, writer_id: WriterId::from(1), chunk_id: ChunkId::from(chunk) }
}

proptest! {
    /// Under `RingBuffer` policy, a sequence of same-size writes never
    /// raises `indexed_chunk_count` above what the capacity can hold, and
    /// every write either lands in the index or is rejected outright (never
    /// silently lost with no counter moved).
    #[test]
    fn ring_buffer_never_exceeds_capacity(
        chunk_size in 1usize..64,
        capacity_chunks in 1usize..16,
        writes in 1usize..100,
    ) {
        let capacity = chunk_size * capacity_chunks;
        let mut buf = TraceBuffer::new(capacity, FillPolicy::RingBuffer);
        let max_indexed = capacity / chunk_size;

        for i in 0..writes {
            let before = buf.stats();
            let result = buf.copy_in(key(i as u32), 1, 0, &vec![0xAB; chunk_size]);
            let after = buf.stats();
            prop_assert!(result.is_ok(), "RingBuffer policy should never reject a chunk that fits capacity");
            prop_assert!(after.chunks_written > before.chunks_written);
            prop_assert!(buf.indexed_chunk_count() <= max_indexed.max(1));
        }
    }

    /// Under `Discard` policy, once the buffer is full no further chunk is
    /// ever indexed: `indexed_chunk_count` is monotonically non-decreasing
    /// only up to the point capacity is reached, then frozen.
    #[test]
    fn discard_policy_freezes_index_once_full(
        chunk_size in 1usize..64,
        capacity_chunks in 1usize..8,
        writes in 1usize..60,
    ) {
        let capacity = chunk_size * capacity_chunks;
        let mut buf = TraceBuffer::new(capacity, FillPolicy::Discard);

        let mut saw_rejection = false;
        for i in 0..writes {
            let count_before = buf.indexed_chunk_count();
            let result = buf.copy_in(key(i as u32), 1, 0, &vec![0xCD; chunk_size]);
            if result.is_err() {
                saw_rejection = true;
                prop_assert_eq!(buf.indexed_chunk_count(), count_before, "Discard policy must not mutate the index on rejection");
            }
            if saw_rejection {
                prop_assert!(result.is_err(), "once Discard has rejected once, it never accepts again without room freed");
            }
        }
    }
}
