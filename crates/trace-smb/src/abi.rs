//! The shared-memory ABI itself: a fixed-size arena of pages, each
//! partitioned into chunks on first use, plus the byte storage backing each
//! chunk's payload.
//!
//! Real Perfetto maps this region with `mmap` so a separate producer process
//! can write directly into it; here the region is an in-process owned byte
//! arena; the wire transport that would otherwise move these bytes between
//! processes is out of scope (no chunk's logical shape or transition
//! protocol depends on the backing storage being `mmap`-backed).

use std::sync::Mutex;

use crate::chunk::ChunkHeader;
use crate::error::SmbError;
use crate::page::{ChunkState, PageHeader, CHUNKS_PER_LAYOUT, MAX_CHUNKS_PER_PAGE};
use trace_types::{BufferId, ChunkId, WriterId};

/// A handle to one acquired chunk's payload, analogous to a zero-copy
/// reservation: the writer fills it in place and then releases it.
pub struct ChunkWriteGuard<'a> {
    header: ChunkHeader,
    payload: &'a mut [u8],
}

impl<'a> ChunkWriteGuard<'a> {
    #[must_use]
    pub fn header(&self) -> ChunkHeader {
        self.header
    }

    #[must_use]
    pub fn header_mut(&mut self) -> &mut ChunkHeader {
        &mut self.header
    }

    #[must_use]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.payload
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload
    }
}

/// A handle to one page's worth of chunks acquired for reading, in
/// partition order (chunk 0 first).
pub struct PageReadGuard<'a> {
    pub page_idx: usize,
    pub chunk_payloads: Vec<&'a [u8]>,
    pub target_buffer: Option<BufferId>,
}

/// Fixed-size arena of `page_count` pages, each `page_size` bytes.
pub struct SharedMemoryAbi {
    page_size: usize,
    headers: Vec<PageHeader>,
    storage: Box<[std::cell::UnsafeCell<u8>]>,
    /// Out-of-band record of the `writer_id`/`chunk_id`/`packet_count`
    /// a chunk currently in `BeingWritten` belongs to. The chunk's raw
    /// bytes never carry this header (unlike a real `mmap`'d region where
    /// the writer encodes it inline); scraping a still-open chunk needs
    /// it, so the writer mirrors it here on every packet boundary.
    chunk_meta: Box<[Mutex<Option<ChunkHeader>>]>,
}

// SAFETY: access to `storage` is gated entirely by the atomic chunk-state
// transitions in `PageHeader`; a byte range is only ever reachable through
// exactly one of a `ChunkWriteGuard` or a `PageReadGuard` at a time.
unsafe impl Sync for SharedMemoryAbi {}
unsafe impl Send for SharedMemoryAbi {}

impl SharedMemoryAbi {
    #[must_use]
    pub fn new(page_count: usize, page_size: usize) -> Self {
        let mut storage = Vec::with_capacity(page_count * page_size);
        storage.resize_with(page_count * page_size, std::cell::UnsafeCell::new(0u8));
        Self {
            page_size,
            headers: (0..page_count).map(|_| PageHeader::new()).collect(),
            storage: storage.into_boxed_slice(),
            chunk_meta: (0..page_count * MAX_CHUNKS_PER_PAGE).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn meta_index(page_idx: usize, chunk_idx: usize) -> usize {
        page_idx * MAX_CHUNKS_PER_PAGE + chunk_idx
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.headers.len()
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn chunk_size(&self, layout: u8) -> usize {
        self.page_size / CHUNKS_PER_LAYOUT[layout as usize] as usize
    }

    fn chunk_slice(&self, page_idx: usize, chunk_idx: usize, layout: u8) -> &mut [u8] {
        let chunk_size = self.chunk_size(layout);
        let base = page_idx * self.page_size + chunk_idx * chunk_size;
        // SAFETY: caller holds an exclusive chunk-state transition (checked
        // by `PageHeader`) for [base, base+chunk_size).
        unsafe {
            let ptr = self.storage[base].get();
            std::slice::from_raw_parts_mut(ptr, chunk_size)
        }
    }

    /// Payload capacity of one chunk at the given `layout`.
    #[must_use]
    pub fn chunk_payload_len(&self, layout: u8) -> usize {
        self.chunk_size(layout)
    }

    /// Copies `bytes` into an acquired chunk's payload at `offset`. Callers
    /// (the arbiter, on behalf of a `TraceWriter`) are trusted to only call
    /// this on a chunk they currently own.
    pub fn write_chunk_bytes(&self, page_idx: usize, chunk_idx: usize, layout: u8, offset: usize, bytes: &[u8]) {
        let slice = self.chunk_slice(page_idx, chunk_idx, layout);
        slice[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads `len` bytes from an acquired chunk's payload at `offset`.
    #[must_use]
    pub fn read_chunk_bytes(&self, page_idx: usize, chunk_idx: usize, layout: u8, offset: usize, len: usize) -> Vec<u8> {
        let slice = self.chunk_slice(page_idx, chunk_idx, layout);
        slice[offset..offset + len].to_vec()
    }

    #[must_use]
    pub fn page_target_buffer(&self, page_idx: usize) -> Option<BufferId> {
        self.headers[page_idx].target_buffer()
    }

    /// Partitions `page_idx` into `layout` chunks targeting `target_buffer`,
    /// or returns `false` if it's already partitioned.
    pub fn try_partition_page(&self, page_idx: usize, layout: u8, target_buffer: BufferId) -> bool {
        self.headers[page_idx].try_partition(layout, target_buffer)
    }

    /// Scans every page for a free chunk and attempts a single-shot
    /// acquisition; does not retry internally (callers, i.e. the arbiter's
    /// sweep, own retry/backoff policy).
    pub fn try_acquire_chunk_for_writing(
        &self,
        writer_id: trace_types::WriterId,
        chunk_id: trace_types::ChunkId,
    ) -> Option<(usize, usize, ChunkWriteGuard<'_>)> {
        for (page_idx, header) in self.headers.iter().enumerate() {
            let layout = header.layout();
            if layout == 0 {
                continue;
            }
            for chunk_idx in header.free_chunk_indices() {
                if header.try_acquire_for_writing(chunk_idx) {
                    let payload = self.chunk_slice(page_idx, chunk_idx, layout);
                    let chunk_header = ChunkHeader::new(writer_id, chunk_id);
                    *self.chunk_meta[Self::meta_index(page_idx, chunk_idx)].lock().unwrap() = Some(chunk_header);
                    let guard = ChunkWriteGuard { header: chunk_header, payload };
                    return Some((page_idx, chunk_idx, guard));
                }
            }
        }
        None
    }

    /// Mirrors a chunk's current header (packet count, flags) into the
    /// out-of-band metadata table so a scrape can see progress made since
    /// the chunk was acquired. The writer calls this at every packet
    /// boundary and whenever it finalizes flags before release.
    pub fn update_chunk_header(&self, page_idx: usize, chunk_idx: usize, header: ChunkHeader) {
        *self.chunk_meta[Self::meta_index(page_idx, chunk_idx)].lock().unwrap() = Some(header);
    }

    /// Attempts to partition the first unpartitioned page found, for
    /// `target_buffer` at the smallest chunk layout that satisfies
    /// `min_chunks`.
    pub fn try_partition_free_page(&self, target_buffer: BufferId, layout: u8) -> Result<usize, SmbError> {
        for (page_idx, header) in self.headers.iter().enumerate() {
            if header.layout() == 0 && header.try_partition(layout, target_buffer) {
                return Ok(page_idx);
            }
        }
        Err(SmbError::BufferExhausted)
    }

    /// Releases an acquired chunk as `Complete`. Returns `true` if the page
    /// has no remaining `BeingWritten` chunks (a hint to batch commit
    /// notifications at the page granularity).
    pub fn release_chunk_as_complete(&self, page_idx: usize, chunk_idx: usize) -> bool {
        self.headers[page_idx].release_as_complete(chunk_idx)
    }

    /// Patches 4 bytes at `offset` within an already-released (`Complete` or
    /// later) chunk. Idempotent: callers may retry the same patch safely.
    pub fn apply_patch(&self, page_idx: usize, chunk_idx: usize, layout: u8, offset_in_chunk: u32, bytes: [u8; 4]) {
        let slice = self.chunk_slice(page_idx, chunk_idx, layout);
        let off = offset_in_chunk as usize;
        slice[off..off + 4].copy_from_slice(&bytes);
    }

    /// Acquires every `Complete` page in the arena for reading, releasing
    /// the guards' payloads back to `Free` is the caller's responsibility
    /// via [`Self::release_page_as_free`].
    pub fn try_acquire_all_complete_pages(&self) -> Vec<PageReadGuard<'_>> {
        let mut out = Vec::new();
        for (page_idx, header) in self.headers.iter().enumerate() {
            if header.layout() == 0 {
                continue;
            }
            if header.try_acquire_all_for_reading() {
                let layout = header.layout();
                let n = PageHeader::chunks_in_layout(layout) as usize;
                let payloads = (0..n).map(|i| &*self.chunk_slice(page_idx, i, layout)).collect();
                out.push(PageReadGuard {
                    page_idx,
                    chunk_payloads: payloads,
                    target_buffer: header.target_buffer(),
                });
            }
        }
        out
    }

    pub fn release_page_as_free(&self, page_idx: usize) {
        self.headers[page_idx].release_all_as_free();
        for chunk_idx in 0..MAX_CHUNKS_PER_PAGE {
            *self.chunk_meta[Self::meta_index(page_idx, chunk_idx)].lock().unwrap() = None;
        }
    }

    /// Non-destructively reads every chunk still `BeingWritten` across the
    /// arena, for scraping a producer's shared memory on disconnect
    /// (without waiting for `FinishTracePacket`/`ReturnCompletedChunk`).
    ///
    /// A chunk whose `packet_count` is 0 or 1 has at most the
    /// currently-open packet started and nothing safe to read is returned
    /// for it: the packet in progress may be only partially written, so
    /// only the first `packet_count - 1` complete packets (measured via
    /// their own length prefixes) are included.
    #[must_use]
    pub fn scrape_being_written_chunks(&self) -> Vec<(WriterId, ChunkId, Vec<u8>)> {
        let mut out = Vec::new();
        for (page_idx, page) in self.headers.iter().enumerate() {
            let layout = page.layout();
            if layout == 0 {
                continue;
            }
            let n = PageHeader::chunks_in_layout(layout) as usize;
            for chunk_idx in 0..n {
                if page.chunk_state(chunk_idx) != ChunkState::BeingWritten {
                    continue;
                }
                let Some(header) = *self.chunk_meta[Self::meta_index(page_idx, chunk_idx)].lock().unwrap() else {
                    continue;
                };
                if header.packet_count < 2 {
                    continue;
                }
                let bytes = self.chunk_slice(page_idx, chunk_idx, layout).to_vec();
                let safe_packet_count = (header.packet_count - 1) as usize;
                let prefix_len = trace_types::varint::prefix_of_n_packets(&bytes, safe_packet_count);
                if prefix_len == 0 {
                    continue;
                }
                out.push((header.writer_id, header.chunk_id, bytes[..prefix_len].to_vec()));
            }
        }
        out
    }

    /// Total number of `Free` chunk slots across the whole arena, for
    /// backpressure/stall-vs-drop decisions.
    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        self.headers
            .iter()
            .map(|h| {
                if h.layout() == 0 {
                    0
                } else {
                    h.free_chunk_indices().len()
                }
            })
            .sum()
    }

    #[must_use]
    pub fn total_chunk_capacity(&self) -> usize {
        self.headers.len() * MAX_CHUNKS_PER_PAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_types::{ChunkId, WriterId};

    fn abi() -> SharedMemoryAbi {
        SharedMemoryAbi::new(4, 4096)
    }

    #[test]
    fn partition_then_acquire_roundtrip() {
        let a = abi();
        assert!(a.try_partition_page(0, 2, BufferId::from(1)));
        let (page_idx, chunk_idx, mut guard) = a
            .try_acquire_chunk_for_writing(WriterId::from(5), ChunkId::from(1))
            .expect("chunk available");
        assert_eq!(page_idx, 0);
        guard.payload_mut()[0] = 0xAB;
        let page_done = a.release_chunk_as_complete(page_idx, chunk_idx);
        assert!(!page_done);
    }

    #[test]
    fn all_pages_unpartitioned_yields_no_acquirable_chunk() {
        let a = abi();
        assert!(a.try_acquire_chunk_for_writing(WriterId::from(1), ChunkId::from(0)).is_none());
    }

    #[test]
    fn reading_requires_every_chunk_complete() {
        let a = abi();
        a.try_partition_page(0, 1, BufferId::from(9));
        let (page_idx, chunk_idx, _guard) = a
            .try_acquire_chunk_for_writing(WriterId::from(1), ChunkId::from(0))
            .unwrap();
        assert!(a.try_acquire_all_complete_pages().is_empty());
        a.release_chunk_as_complete(page_idx, chunk_idx);
        let guards = a.try_acquire_all_complete_pages();
        assert_eq!(guards.len(), 1);
        assert_eq!(guards[0].target_buffer, Some(BufferId::from(9)));
        a.release_page_as_free(page_idx);
    }

    #[test]
    fn patch_rewrites_bytes_in_place() {
        let a = abi();
        a.try_partition_page(0, 1, BufferId::from(1));
        let (page_idx, chunk_idx, mut guard) = a
            .try_acquire_chunk_for_writing(WriterId::from(1), ChunkId::from(0))
            .unwrap();
        guard.payload_mut()[0..4].copy_from_slice(&[0, 0, 0, 0]);
        a.release_chunk_as_complete(page_idx, chunk_idx);
        a.apply_patch(page_idx, chunk_idx, 1, 0, [1, 2, 3, 4]);
        let guards = a.try_acquire_all_complete_pages();
        assert_eq!(&guards[0].chunk_payloads[0][0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn scraping_ignores_chunks_with_no_complete_packet() {
        let a = abi();
        a.try_partition_page(0, 1, BufferId::from(1));
        let (page_idx, chunk_idx, _guard) = a.try_acquire_chunk_for_writing(WriterId::from(1), ChunkId::from(0)).unwrap();
        a.update_chunk_header(page_idx, chunk_idx, ChunkHeader { packet_count: 1, ..ChunkHeader::new(WriterId::from(1), ChunkId::from(0)) });
        assert!(a.scrape_being_written_chunks().is_empty());
    }

    #[test]
    fn scraping_returns_the_complete_prefix_excluding_the_open_packet() {
        let a = abi();
        a.try_partition_page(0, 1, BufferId::from(1));
        let (page_idx, chunk_idx, mut guard) = a.try_acquire_chunk_for_writing(WriterId::from(7), ChunkId::from(3)).unwrap();

        let packet_one = trace_types::varint::encode_varint_fixed4(2);
        guard.payload_mut()[0..4].copy_from_slice(&packet_one);
        guard.payload_mut()[4..6].copy_from_slice(b"hi");
        // A second, still-open packet: only its length prefix is written.
        let packet_two_len = trace_types::varint::encode_varint_fixed4(100);
        guard.payload_mut()[6..10].copy_from_slice(&packet_two_len);

        a.update_chunk_header(page_idx, chunk_idx, ChunkHeader { packet_count: 2, ..ChunkHeader::new(WriterId::from(7), ChunkId::from(3)) });

        let scraped = a.scrape_being_written_chunks();
        assert_eq!(scraped.len(), 1);
        let (writer_id, chunk_id, bytes) = &scraped[0];
        assert_eq!(*writer_id, WriterId::from(7));
        assert_eq!(*chunk_id, ChunkId::from(3));
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[4..6], b"hi");
    }
}
