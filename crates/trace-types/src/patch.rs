//! The 4-byte backfill rewrite used when a fragmenting packet leaves a
//! length field in a chunk the writer no longer owns.

use crate::ids::{ChunkId, WriterId};

/// A single patch: rewrite 4 bytes at `offset_in_chunk` within the payload
/// region of `(writer_id, chunk_id)`.
///
/// Patches are idempotent byte writes, so submission order across a
/// `CommitData` batch never matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub offset_in_chunk: u32,
    pub payload: [u8; 4],
    /// More patches for this chunk may still arrive; mirrors the wire flag
    /// so the receiver doesn't release bookkeeping for the chunk early.
    pub has_more_patches: bool,
}

impl Patch {
    #[must_use]
    pub fn new(writer_id: WriterId, chunk_id: ChunkId, offset_in_chunk: u32, payload: [u8; 4]) -> Self {
        Self {
            writer_id,
            chunk_id,
            offset_in_chunk,
            payload,
            has_more_patches: false,
        }
    }
}
