//! The out-of-band fix-up list for size fields that get written before their
//! final value is known: nested submessages and the packet's own
//! redundant length prefix.
//!
//! Because a packet can have several independently-sized fields pending at
//! once (its own length plus one per still-open nested submessage), each
//! entry is keyed by a `seq` handed back from [`PatchList::push`]; the
//! caller carries that `seq` and presents it back to [`PatchList::resolve`]
//! once that specific field's size is known, rather than resolving every
//! pending entry against a single shared value.

use trace_types::{ChunkId, Patch, WriterId};

/// One pending fix-up: a 4-byte field at `offset_in_chunk` within
/// `(writer_id, chunk_id)` that needs its placeholder bytes replaced once
/// the enclosing packet/submessage is finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingPatch {
    pub seq: u64,
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub offset_in_chunk: u32,
}

/// Patches accumulated by one [`crate::TraceWriter`] across its lifetime.
#[derive(Debug, Default)]
pub struct PatchList {
    entries: Vec<PendingPatch>,
    next_seq: u64,
}

impl PatchList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new pending patch, returning the `seq` that identifies it
    /// to a later [`Self::resolve`] call.
    pub fn push(&mut self, writer_id: WriterId, chunk_id: ChunkId, offset_in_chunk: u32) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(PendingPatch { seq, writer_id, chunk_id, offset_in_chunk });
        seq
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolves the pending patch identified by `seq` to `value`, removing
    /// it from the list and producing a finished [`Patch`] ready to hand to
    /// the arbiter. `has_more_patches` is set if any other patch still
    /// pending targets the same `(writer_id, chunk_id)`, mirroring the real
    /// protocol's hint that more fix-ups for that chunk may follow. Returns
    /// `None` if `seq` is not (or no longer) pending.
    pub fn resolve(&mut self, seq: u64, value: u32) -> Option<Patch> {
        let idx = self.entries.iter().position(|e| e.seq == seq)?;
        let entry = self.entries.remove(idx);
        let has_more_patches = self.entries.iter().any(|e| e.writer_id == entry.writer_id && e.chunk_id == entry.chunk_id);
        let bytes = trace_types::varint::encode_varint_fixed4(value);
        let mut patch = Patch::new(entry.writer_id, entry.chunk_id, entry.offset_in_chunk, bytes);
        patch.has_more_patches = has_more_patches;
        Some(patch)
    }
}
