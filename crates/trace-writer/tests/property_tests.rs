//! Property-based tests for the out-of-band patch list.

use proptest::prelude::*;
use trace_types::{ChunkId, WriterId};
use trace_writer::PatchList;

proptest! {
    /// Pushing `n` patches for the same chunk and resolving them in the
    /// same order yields `n` resolved patches, `has_more_patches` set on
    /// every one but the last, and the list empty afterward.
    #[test]
    fn resolving_in_push_order_tags_every_entry_but_the_last(
        offsets in prop::collection::vec(0u32..4096, 1..30),
        value in any::<u32>().prop_filter("fits in 28-bit varint", |v| *v < (1 << 28)),
    ) {
        let mut list = PatchList::new();
        let writer_id = WriterId::from(1);
        let chunk_id = ChunkId::from(0);
        let seqs: Vec<u64> = offsets.iter().map(|&offset| list.push(writer_id, chunk_id, offset)).collect();
        let n = seqs.len();

        let patches: Vec<_> = seqs.into_iter().map(|seq| list.resolve(seq, value).unwrap()).collect();

        prop_assert_eq!(patches.len(), n);
        prop_assert!(list.is_empty());
        for (i, patch) in patches.iter().enumerate() {
            prop_assert_eq!(patch.has_more_patches, i + 1 < n);
        }
    }

    /// Patches pushed for distinct chunks never influence each other's
    /// `has_more_patches`, regardless of how many are pending at once.
    #[test]
    fn distinct_chunks_never_see_has_more_patches_from_each_other(
        chunk_count in 1u32..8,
        value in any::<u32>().prop_filter("fits in 28-bit varint", |v| *v < (1 << 28)),
    ) {
        let mut list = PatchList::new();
        let writer_id = WriterId::from(1);
        let seqs: Vec<u64> = (0..chunk_count).map(|c| list.push(writer_id, ChunkId::from(c), 0)).collect();

        for seq in seqs {
            let patch = list.resolve(seq, value).unwrap();
            prop_assert!(!patch.has_more_patches, "each chunk has exactly one pending patch");
        }
    }
}
