//! Shared id types, free-list allocator, clock and patch primitives used
//! across the `trace-smb`, `trace-writer`, `trace-buffer`, `trace-service`
//! and `trace-ipc` crates.

mod clock;
mod id_pool;
mod ids;
mod patch;
pub mod varint;

pub use clock::{Clock, FakeClock, SystemClock};
pub use id_pool::IdPool;
pub use ids::{BufferId, ChunkId, DataSourceInstanceId, FlushRequestId, ProducerId, TracingSessionId, WriterId};
pub use patch::Patch;
