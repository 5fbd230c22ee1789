//! Lock-free shared-memory ABI and producer-side arbiter.
//!
//! [`SharedMemoryAbi`] owns the page/chunk arena and its atomic state
//! transitions; [`Arbiter`] is the single point of contention producers go
//! through to get a chunk, return one, and patch already-written data.

mod abi;
mod arbiter;
mod backoff;
mod chunk;
mod error;
mod invariants;
mod page;

pub use abi::{ChunkWriteGuard, PageReadGuard, SharedMemoryAbi};
pub use arbiter::{Arbiter, BufferExhaustedPolicy, CommitScheduler, ImmediateScheduler};
pub use backoff::Backoff;
pub use chunk::{ChunkFlags, ChunkHeader};
pub use error::SmbError;
pub use page::{ChunkState, PageHeader, CHUNKS_PER_LAYOUT, MAX_CHUNKS_PER_PAGE};
