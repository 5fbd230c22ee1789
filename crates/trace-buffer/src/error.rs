use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// A chunk's payload is larger than the buffer's total capacity; it can
    /// never fit, regardless of eviction.
    #[error("chunk of {len} bytes exceeds buffer capacity {capacity}")]
    ChunkTooLarge { len: usize, capacity: usize },
    /// `fill_policy = DISCARD` and the buffer has no room left.
    #[error("buffer full under discard fill policy")]
    Discarded,
}
