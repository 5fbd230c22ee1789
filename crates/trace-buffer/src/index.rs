//! Stitching index: maps `(producer_uid, writer_id, chunk_id)` to the byte
//! range a copied-in chunk occupies, so patches can find it and readers can
//! reassemble a writer's fragment sequence.

use trace_types::{ChunkId, WriterId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub producer_uid: u32,
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkLocation {
    pub offset: usize,
    pub len: usize,
    pub packet_count: u16,
    pub flags: u8,
}
