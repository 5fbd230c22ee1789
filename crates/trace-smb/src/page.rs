//! Page header: the partition layout and per-chunk state machine.
//!
//! A page is subdivided into `{1, 2, 4, 7, 14}` fixed-size chunks. We pack
//! the partition layout, every chunk's 2-bit state, and the page's target
//! buffer id into a single `AtomicU64` so that `try_partition_page` can
//! publish all three with one compare-exchange. Splitting `target_buffer`
//! into its own atomic would let a losing CAS on the layout word clobber a
//! target_buffer a winning partitioner had already published.

use std::sync::atomic::{AtomicU64, Ordering};

use trace_types::BufferId;

/// Chunks-per-page for each of the 6 layout codes; index 0 means
/// unpartitioned (free).
pub const CHUNKS_PER_LAYOUT: [u8; 6] = [0, 1, 2, 4, 7, 14];

pub const MAX_CHUNKS_PER_PAGE: usize = 14;

const LAYOUT_BITS: u32 = 4;
const LAYOUT_SHIFT: u32 = 0;
const LAYOUT_MASK: u64 = (1 << LAYOUT_BITS) - 1;

const CHUNK_STATE_BITS: u32 = 2;
const CHUNK_STATE_SHIFT_BASE: u32 = LAYOUT_BITS;
const CHUNK_STATE_MASK: u64 = (1 << CHUNK_STATE_BITS) - 1;

const TARGET_BUFFER_SHIFT: u32 = CHUNK_STATE_SHIFT_BASE + CHUNK_STATE_BITS * MAX_CHUNKS_PER_PAGE as u32;
const TARGET_BUFFER_BITS: u32 = 16;
const TARGET_BUFFER_MASK: u64 = (1 << TARGET_BUFFER_BITS) - 1;

/// The lifecycle of a single chunk slot within a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkState {
    Free = 0,
    BeingWritten = 1,
    Complete = 2,
    BeingRead = 3,
}

impl ChunkState {
    const fn from_bits(bits: u64) -> Self {
        match bits & CHUNK_STATE_MASK {
            0 => Self::Free,
            1 => Self::BeingWritten,
            2 => Self::Complete,
            3 => Self::BeingRead,
            _ => unreachable!(),
        }
    }

    const fn bits(self) -> u64 {
        self as u64
    }
}

/// Atomic page-level state: `layout:4 | chunk_state[14]:28 | target_buffer:16`.
#[derive(Debug)]
pub struct PageHeader {
    word: AtomicU64,
}

impl Default for PageHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl PageHeader {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    fn chunk_shift(chunk_idx: usize) -> u32 {
        debug_assert!(chunk_idx < MAX_CHUNKS_PER_PAGE);
        CHUNK_STATE_SHIFT_BASE + CHUNK_STATE_BITS * chunk_idx as u32
    }

    /// `0` means unpartitioned; `1..=5` index into [`CHUNKS_PER_LAYOUT`].
    #[must_use]
    pub fn layout(&self) -> u8 {
        ((self.word.load(Ordering::Acquire) >> LAYOUT_SHIFT) & LAYOUT_MASK) as u8
    }

    #[must_use]
    pub fn chunks_in_layout(layout: u8) -> u8 {
        CHUNKS_PER_LAYOUT[layout as usize]
    }

    #[must_use]
    pub fn target_buffer(&self) -> Option<BufferId> {
        let raw = ((self.word.load(Ordering::Acquire) >> TARGET_BUFFER_SHIFT) & TARGET_BUFFER_MASK) as u16;
        if raw == 0 {
            None
        } else {
            Some(BufferId::from(raw))
        }
    }

    #[must_use]
    pub fn chunk_state(&self, chunk_idx: usize) -> ChunkState {
        let shift = Self::chunk_shift(chunk_idx);
        let bits = (self.word.load(Ordering::Acquire) >> shift) & CHUNK_STATE_MASK;
        ChunkState::from_bits(bits)
    }

    /// Atomically partitions a `Free` (all-zero) page into `layout` chunks
    /// all starting `Free`, and publishes `target_buffer` with it. Fails if
    /// the page is already partitioned.
    pub fn try_partition(&self, layout: u8, target_buffer: BufferId) -> bool {
        debug_assert!((1..=5).contains(&layout));
        let new_word = ((layout as u64) << LAYOUT_SHIFT) | ((target_buffer.get() as u64) << TARGET_BUFFER_SHIFT);
        self.word
            .compare_exchange(0, new_word, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Single-shot CAS: `Free -> BeingWritten` for chunk `chunk_idx`.
    pub fn try_acquire_for_writing(&self, chunk_idx: usize) -> bool {
        let shift = Self::chunk_shift(chunk_idx);
        let current = self.word.load(Ordering::Acquire);
        if ChunkState::from_bits((current >> shift) & CHUNK_STATE_MASK) != ChunkState::Free {
            return false;
        }
        let new_word = (current & !(CHUNK_STATE_MASK << shift)) | (ChunkState::BeingWritten.bits() << shift);
        self.word
            .compare_exchange(current, new_word, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// `BeingWritten -> Complete`. Returns `true` if, after this transition,
    /// every chunk in the page's layout is non-`BeingWritten` (the arbiter
    /// uses this to decide whether to flush a batched commit notification).
    pub fn release_as_complete(&self, chunk_idx: usize) -> bool {
        let shift = Self::chunk_shift(chunk_idx);
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            debug_assert_eq!(
                ChunkState::from_bits((current >> shift) & CHUNK_STATE_MASK),
                ChunkState::BeingWritten
            );
            let new_word = (current & !(CHUNK_STATE_MASK << shift)) | (ChunkState::Complete.bits() << shift);
            match self
                .word
                .compare_exchange_weak(current, new_word, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let layout = ((new_word >> LAYOUT_SHIFT) & LAYOUT_MASK) as u8;
                    let n = Self::chunks_in_layout(layout) as usize;
                    return (0..n).all(|i| {
                        let s = (new_word >> Self::chunk_shift(i)) & CHUNK_STATE_MASK;
                        ChunkState::from_bits(s) != ChunkState::BeingWritten
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Single-shot CAS: every chunk in `layout` transitions `Complete ->
    /// BeingRead` together, or the whole attempt fails (partial reads would
    /// violate per-writer sequencing).
    pub fn try_acquire_all_for_reading(&self) -> bool {
        let current = self.word.load(Ordering::Acquire);
        let layout = ((current >> LAYOUT_SHIFT) & LAYOUT_MASK) as u8;
        if layout == 0 {
            return false;
        }
        let n = Self::chunks_in_layout(layout) as usize;
        let mut new_word = current;
        for i in 0..n {
            let shift = Self::chunk_shift(i);
            let state = (current >> shift) & CHUNK_STATE_MASK;
            if ChunkState::from_bits(state) != ChunkState::Complete {
                return false;
            }
            new_word = (new_word & !(CHUNK_STATE_MASK << shift)) | (ChunkState::BeingRead.bits() << shift);
        }
        self.word
            .compare_exchange(current, new_word, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the whole page back to `Free` (all chunk-state bits and the
    /// layout/target_buffer fields zeroed) once a read pass has consumed it.
    pub fn release_all_as_free(&self) {
        self.word.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn free_chunk_indices(&self) -> Vec<usize> {
        let current = self.word.load(Ordering::Acquire);
        let layout = ((current >> LAYOUT_SHIFT) & LAYOUT_MASK) as u8;
        if layout == 0 {
            return Vec::new();
        }
        let n = Self::chunks_in_layout(layout) as usize;
        (0..n)
            .filter(|&i| {
                let shift = Self::chunk_shift(i);
                ChunkState::from_bits((current >> shift) & CHUNK_STATE_MASK) == ChunkState::Free
            })
            .collect()
    }
}
