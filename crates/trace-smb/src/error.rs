use thiserror::Error;

/// Errors surfaced by the SMB ABI and arbiter.
///
/// None of these are fatal to the service; producers that hit them
/// fall back to drop/stall policy or simply retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SmbError {
    /// `Arbiter::new_writer_id` ran out of the `[1, 2^16-1]` range.
    #[error("writer id pool exhausted")]
    WriterIdsExhausted,
    /// A full sweep of the SMB found no acquirable chunk.
    #[error("shared memory buffer exhausted")]
    BufferExhausted,
    /// The region is closed (producer disconnected).
    #[error("shared memory region is closed")]
    Closed,
}
