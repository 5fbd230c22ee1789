//! `CommitData`: the unit a producer hands to the service once a
//! chunk is released. In the full protocol this travels inside a
//! `CommitDataRequest`'s embedded `Chunk` message, carrying its own payload
//! bytes rather than a raw SMB offset — so the service never needs to read
//! the producer's shared memory directly to learn a chunk's metadata.

use trace_smb::ChunkFlags;
use trace_types::{BufferId, ChunkId, Patch, WriterId};

#[derive(Debug, Clone)]
pub struct ChunkCommit {
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub target_buffer: BufferId,
    pub packet_count: u16,
    pub flags: ChunkFlags,
    pub payload: Vec<u8>,
}

/// A patch carried alongside a `CommitDataRequest` for a chunk the producer
/// no longer owns.
#[derive(Debug, Clone)]
pub struct PatchCommit {
    pub patch: Patch,
    pub has_more_patches: bool,
}
