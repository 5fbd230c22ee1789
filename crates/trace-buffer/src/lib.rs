//! Service-side append-only ring buffer: copy-in from
//! committed SMB chunks, a stitching index keyed by `(producer_uid,
//! writer_id, chunk_id)`, out-of-band patching, and indexed read-out.

mod buffer;
mod error;
mod index;

pub use buffer::{BufferStats, FillPolicy, StitchedSequence, TraceBuffer};
pub use error::BufferError;
pub use index::{ChunkKey, ChunkLocation};
