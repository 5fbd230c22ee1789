//! Debug assertion macros for SMB state machine invariants. Only active in
//! debug builds, zero overhead in release.

// =============================================================================
// INV-SMB-01: Exclusive chunk ownership
// =============================================================================

/// At most one party may observe a chunk in `BeingWritten` or `BeingRead` at
/// a time; this is enforced structurally by the single compare-exchange in
/// `try_acquire_chunk_for_writing`/`try_acquire_all_chunks_for_reading`, but
/// we still assert the state we just transitioned *from* was the one we
/// expected, to catch a protocol violation early rather than silently
/// corrupting chunk data.
macro_rules! debug_assert_transitioned_from {
    ($observed:expr, $expected:expr) => {
        debug_assert!(
            $observed == $expected,
            "INV-SMB-01 violated: expected prior chunk state {:?}, observed {:?}",
            $expected,
            $observed
        )
    };
}

// =============================================================================
// INV-SMB-02: writer_id == 0 is reserved
// =============================================================================

macro_rules! debug_assert_writer_id_valid {
    ($writer_id:expr) => {
        debug_assert!(
            $writer_id.is_valid(),
            "INV-SMB-02 violated: writer_id 0 is reserved for invalid"
        )
    };
}

// =============================================================================
// INV-SMB-03: patch offsets are within the payload region
// =============================================================================

macro_rules! debug_assert_patch_in_bounds {
    ($offset:expr, $payload_len:expr) => {
        debug_assert!(
            ($offset as usize) + 4 <= $payload_len,
            "INV-SMB-03 violated: patch offset {} + 4 exceeds payload length {}",
            $offset,
            $payload_len
        )
    };
}

pub(crate) use debug_assert_patch_in_bounds;
pub(crate) use debug_assert_transitioned_from;
pub(crate) use debug_assert_writer_id_valid;
