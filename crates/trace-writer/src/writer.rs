//! Fragments a stream of packets into SMB chunks obtained from an
//! [`Arbiter`], maintaining the redundant length-prefix-and-patch protocol
//! described here, including nested submessages: a packet may have any
//! number of length-delimited fields open inside it at once, each with its
//! own pending size fix-up.

use std::sync::Arc;

use trace_smb::{Arbiter, BufferExhaustedPolicy, ChunkFlags, ChunkHeader};
use trace_types::{BufferId, ChunkId, FlushRequestId, WriterId};

use crate::error::WriterError;
use crate::patch_list::PatchList;

struct OpenChunk {
    page_idx: usize,
    chunk_idx: usize,
    chunk_id: ChunkId,
    write_offset: usize,
    capacity: usize,
    packet_count: u16,
    flags: ChunkFlags,
}

/// One open length-delimited field awaiting its final size: the packet
/// itself, or a nested submessage opened inside it. The stack's bottom
/// entry is always the packet; everything above it is a nested message,
/// innermost last.
struct OpenField {
    length_field_chunk_id: ChunkId,
    length_field_page_idx: usize,
    length_field_chunk_idx: usize,
    length_field_offset: u32,
    /// Set once a patch has been recorded for this field's length (the
    /// chunk holding it was released mid-write); from then on the final
    /// size must be resolved through the patch list instead of a direct
    /// write.
    patch_seq: Option<u64>,
    payload_len: u32,
}

/// Serializes packets into SMB chunks, handling fragmentation and the
/// out-of-band patch list for size fields that cross a chunk boundary.
pub struct TraceWriter {
    arbiter: Arc<Arbiter>,
    writer_id: WriterId,
    target_buffer: BufferId,
    policy: BufferExhaustedPolicy,
    next_chunk_id: ChunkId,
    current: Option<OpenChunk>,
    open_fields: Vec<OpenField>,
    first_packet_on_sequence: bool,
    drop_packets: bool,
    previous_packet_dropped: bool,
    patch_list: PatchList,
}

/// Length, in bytes, of the redundant fixed-size length prefix in front of
/// every packet's (or nested submessage's) payload.
const LENGTH_PREFIX_SIZE: usize = 4;

impl TraceWriter {
    #[must_use]
    pub fn new(arbiter: Arc<Arbiter>, writer_id: WriterId, target_buffer: BufferId, policy: BufferExhaustedPolicy) -> Self {
        Self {
            arbiter,
            writer_id,
            target_buffer,
            policy,
            next_chunk_id: ChunkId::from(0),
            current: None,
            open_fields: Vec::new(),
            first_packet_on_sequence: true,
            drop_packets: false,
            previous_packet_dropped: false,
            patch_list: PatchList::new(),
        }
    }

    #[must_use]
    pub fn writer_id(&self) -> WriterId {
        self.writer_id
    }

    #[must_use]
    pub fn is_dropping_packets(&self) -> bool {
        self.drop_packets
    }

    /// Opens a new packet. Errors if a packet (or one of its nested
    /// submessages) is already open — the writer is used by a single
    /// caller at a time, one packet open at most.
    pub fn new_trace_packet(&mut self) -> Result<(), WriterError> {
        if !self.open_fields.is_empty() {
            return Err(WriterError::PacketAlreadyOpen);
        }
        self.ensure_chunk()?;
        {
            let chunk = self.current.as_mut().expect("ensure_chunk guarantees Some");
            chunk.packet_count += 1;
        }
        self.open_field()?;
        self.sync_chunk_header();
        Ok(())
    }

    /// `BeginNestedMessage`: opens a length-delimited submessage inside the
    /// currently open packet (or the currently open nested message),
    /// pushing its own pending size field onto the stack. Errors if no
    /// packet is open yet.
    pub fn begin_nested_message(&mut self) -> Result<(), WriterError> {
        if self.open_fields.is_empty() {
            return Err(WriterError::NoOpenPacket);
        }
        self.open_field()
    }

    /// `FinishNestedMessage`: closes the innermost open nested submessage,
    /// resolving its size field the same way the packet's own length gets
    /// resolved. Errors if no nested message (only the packet itself) is
    /// open.
    pub fn finish_nested_message(&mut self) -> Result<(), WriterError> {
        if self.open_fields.len() < 2 {
            return Err(WriterError::NoOpenPacket);
        }
        self.finalize_innermost_field();
        Ok(())
    }

    /// Writes the fixed-size length placeholder at the current chunk
    /// offset and pushes a new entry onto the open-field stack.
    fn open_field(&mut self) -> Result<(), WriterError> {
        self.ensure_chunk()?;
        let chunk = self.current.as_mut().expect("ensure_chunk guarantees Some");
        let length_field_offset = chunk.write_offset as u32;
        self.arbiter
            .write_chunk_bytes(chunk.page_idx, chunk.chunk_idx, chunk.write_offset, &trace_types::varint::encode_varint_fixed4(0));
        chunk.write_offset += LENGTH_PREFIX_SIZE;
        self.open_fields.push(OpenField {
            length_field_chunk_id: chunk.chunk_id,
            length_field_page_idx: chunk.page_idx,
            length_field_chunk_idx: chunk.chunk_idx,
            length_field_offset,
            patch_seq: None,
            payload_len: 0,
        });
        Ok(())
    }

    /// Returns `true` exactly once after a dropped packet, for the caller
    /// to set `previous_packet_dropped` on the next packet it builds.
    pub fn take_previous_packet_dropped(&mut self) -> bool {
        std::mem::replace(&mut self.previous_packet_dropped, false)
    }

    /// Appends bytes to every currently open field (the packet and any
    /// nested submessages enclosing the write), fragmenting into a fresh
    /// chunk via `GetNewBuffer` if the current one is full.
    pub fn write_payload(&mut self, mut bytes: &[u8]) -> Result<(), WriterError> {
        if self.open_fields.is_empty() {
            return Err(WriterError::PacketAlreadyOpen);
        }
        while !bytes.is_empty() {
            let chunk = self.current.as_mut().expect("packet open implies chunk open");
            let space = chunk.capacity - chunk.write_offset;
            if space == 0 {
                self.get_new_buffer()?;
                continue;
            }
            let n = space.min(bytes.len());
            let chunk = self.current.as_mut().expect("just ensured");
            self.arbiter.write_chunk_bytes(chunk.page_idx, chunk.chunk_idx, chunk.write_offset, &bytes[..n]);
            chunk.write_offset += n;
            for field in &mut self.open_fields {
                field.payload_len += n as u32;
            }
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// `GetNewBuffer`: the current chunk is full mid-packet. Finalizes it
    /// as a fragment, records a patch for every open field's length whose
    /// placeholder lives in the chunk being released, and acquires a fresh
    /// chunk continuing the fragment.
    fn get_new_buffer(&mut self) -> Result<(), WriterError> {
        {
            let chunk = self.current.as_mut().expect("get_new_buffer called with an open chunk");
            chunk.flags.insert(ChunkFlags::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK);
        }
        for field in &mut self.open_fields {
            if field.patch_seq.is_none() {
                let seq = self.patch_list.push(self.writer_id, field.length_field_chunk_id, field.length_field_offset);
                field.patch_seq = Some(seq);
            }
        }
        self.release_current_chunk();
        self.acquire_chunk(true)
    }

    fn ensure_chunk(&mut self) -> Result<(), WriterError> {
        if self.current.is_some() {
            return Ok(());
        }
        self.acquire_chunk(false)
    }

    fn acquire_chunk(&mut self, continuing_fragment: bool) -> Result<(), WriterError> {
        let chunk_id = self.next_chunk_id;
        match self.arbiter.get_new_chunk(self.writer_id, chunk_id, self.target_buffer, self.policy) {
            Some((page_idx, chunk_idx, mut header)) => {
                self.next_chunk_id = chunk_id.next();
                if continuing_fragment {
                    header.flags.insert(ChunkFlags::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK);
                }
                if self.drop_packets {
                    self.drop_packets = false;
                    self.previous_packet_dropped = true;
                }
                self.current = Some(OpenChunk {
                    page_idx,
                    chunk_idx,
                    chunk_id,
                    write_offset: 0,
                    capacity: self.arbiter.chunk_payload_len(),
                    packet_count: if continuing_fragment { 1 } else { 0 },
                    flags: header.flags,
                });
                self.sync_chunk_header();
                Ok(())
            }
            None => {
                self.drop_packets = true;
                self.current = None;
                Err(WriterError::PacketDropped)
            }
        }
    }

    fn release_current_chunk(&mut self) {
        if let Some(chunk) = self.current.take() {
            self.arbiter.return_completed_chunk(chunk.page_idx, chunk.chunk_idx, self.writer_id, chunk.chunk_id);
        }
    }

    /// Mirrors the current chunk's header into the SMB's out-of-band
    /// metadata table (see [`Arbiter::update_chunk_header`]) so a scrape on
    /// producer disconnect can see packets already completed in it.
    fn sync_chunk_header(&self) {
        if let Some(chunk) = &self.current {
            self.arbiter.update_chunk_header(
                chunk.page_idx,
                chunk.chunk_idx,
                ChunkHeader { writer_id: self.writer_id, chunk_id: chunk.chunk_id, packet_count: chunk.packet_count, flags: chunk.flags },
            );
        }
    }

    /// Finalizes the innermost open field: resolves its length, either
    /// with a direct write (chunk still owned) or via the patch list
    /// (chunk already released), and pops it off the stack.
    fn finalize_innermost_field(&mut self) {
        let Some(field) = self.open_fields.pop() else { return };
        match field.patch_seq {
            Some(seq) => {
                if let Some(patch) = self.patch_list.resolve(seq, field.payload_len) {
                    if self.arbiter.apply_or_forward_patch(patch).is_err() {
                        log::debug!(
                            "patch for writer {} chunk {} offset {} forwarded (chunk no longer owned)",
                            self.writer_id,
                            patch.chunk_id,
                            patch.offset_in_chunk
                        );
                    }
                }
            }
            None => {
                let resolved = trace_types::varint::encode_varint_fixed4(field.payload_len);
                self.arbiter.write_chunk_bytes(field.length_field_page_idx, field.length_field_chunk_idx, field.length_field_offset as usize, &resolved);
            }
        }
    }

    /// Closes every field still open, innermost first, so a packet left
    /// with unfinished nested messages still serializes to something
    /// well-formed.
    fn finalize_all_open_fields(&mut self) {
        while !self.open_fields.is_empty() {
            self.finalize_innermost_field();
        }
    }

    /// `FinishTracePacket`: explicit finalization for callers streaming
    /// raw bytes directly, without opening a new packet. Inflates the
    /// current chunk's `packet_count` by one extra to produce a safe
    /// scraping boundary.
    pub fn finish_trace_packet(&mut self) {
        self.finalize_all_open_fields();
        if let Some(chunk) = self.current.as_mut() {
            chunk.packet_count += 1;
        }
        self.sync_chunk_header();
    }

    /// `Flush`: finalizes any open packet (and nested messages), marks the
    /// current chunk `Complete`, and returns the pending pages that should
    /// be forwarded to the service tagged with `flush_request_id`. Whether
    /// the ack actually arrives is the service's flush state machine's
    /// concern, not this writer's.
    pub fn flush(&mut self, flush_request_id: FlushRequestId) -> Vec<usize> {
        self.finalize_all_open_fields();
        self.release_current_chunk();
        log::debug!("writer {} flush {} pending pages drained", self.writer_id, flush_request_id);
        self.arbiter.drain_pending_pages()
    }

    #[must_use]
    pub fn first_packet_on_sequence(&mut self) -> bool {
        std::mem::replace(&mut self.first_packet_on_sequence, false)
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        self.finalize_all_open_fields();
        self.release_current_chunk();
        self.arbiter.release_writer_id(self.writer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_smb::{ImmediateScheduler, SharedMemoryAbi};

    fn test_arbiter(page_count: usize, page_size: usize, layout: u8) -> Arc<Arbiter> {
        let abi = Arc::new(SharedMemoryAbi::new(page_count, page_size));
        Arc::new(Arbiter::new(abi, layout, Box::new(ImmediateScheduler(|| {}))))
    }

    #[test]
    fn single_packet_fits_in_one_chunk() {
        let arbiter = test_arbiter(2, 4096, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(Arc::clone(&arbiter), writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);
        writer.new_trace_packet().unwrap();
        writer.write_payload(b"hello world").unwrap();
        writer.finish_trace_packet();
        assert!(writer.open_fields.is_empty());
    }

    #[test]
    fn packet_spanning_two_chunks_records_a_patch() {
        // Two pages, each 1 chunk wide, small enough that one packet must
        // fragment across both.
        let arbiter = test_arbiter(2, 64, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(Arc::clone(&arbiter), writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);
        writer.new_trace_packet().unwrap();
        let payload = vec![0xABu8; 120];
        writer.write_payload(&payload).unwrap();
        writer.finish_trace_packet();
        assert!(writer.current.is_some());
    }

    #[test]
    fn double_open_errors() {
        let arbiter = test_arbiter(2, 4096, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(arbiter, writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);
        writer.new_trace_packet().unwrap();
        assert_eq!(writer.new_trace_packet(), Err(WriterError::PacketAlreadyOpen));
    }

    #[test]
    fn exhaustion_under_drop_policy_sets_drop_mode() {
        let arbiter = test_arbiter(1, 16, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(Arc::clone(&arbiter), writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);
        writer.new_trace_packet().unwrap();
        let _ = writer.write_payload(&[0u8; 64]);
        assert!(writer.is_dropping_packets());
    }

    #[test]
    fn nested_message_without_open_packet_errors() {
        let arbiter = test_arbiter(2, 4096, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(arbiter, writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);
        assert_eq!(writer.begin_nested_message(), Err(WriterError::NoOpenPacket));
    }

    #[test]
    fn finish_nested_message_without_one_open_errors() {
        let arbiter = test_arbiter(2, 4096, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(arbiter, writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);
        writer.new_trace_packet().unwrap();
        assert_eq!(writer.finish_nested_message(), Err(WriterError::NoOpenPacket));
        writer.finish_trace_packet();
    }

    /// One patch for the packet's own length and one for a nested
    /// submessage's length, once both placeholders end up in a chunk that
    /// gets released mid-write.
    #[test]
    fn nested_submessage_spanning_a_chunk_boundary_records_two_patches() {
        let arbiter = test_arbiter(3, 64, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(Arc::clone(&arbiter), writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);

        writer.new_trace_packet().unwrap();
        writer.write_payload(b"outer-prefix").unwrap();
        writer.begin_nested_message().unwrap();
        // Force at least one chunk rollover while both the packet's and
        // the nested message's length fields are still unresolved.
        writer.write_payload(&[0x42u8; 120]).unwrap();
        writer.finish_nested_message().unwrap();
        writer.write_payload(b"outer-suffix").unwrap();
        writer.finish_trace_packet();

        assert!(writer.open_fields.is_empty());
    }

    #[test]
    fn nested_message_left_open_is_auto_closed_on_finish() {
        let arbiter = test_arbiter(2, 4096, 1);
        let writer_id = arbiter.new_writer_id().unwrap();
        let mut writer = TraceWriter::new(arbiter, writer_id, BufferId::from(1), BufferExhaustedPolicy::Drop);
        writer.new_trace_packet().unwrap();
        writer.write_payload(b"a").unwrap();
        writer.begin_nested_message().unwrap();
        writer.write_payload(b"nested").unwrap();
        // Caller never calls finish_nested_message(); finish_trace_packet
        // must still leave nothing open.
        writer.finish_trace_packet();
        assert!(writer.open_fields.is_empty());
    }
}
