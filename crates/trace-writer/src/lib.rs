//! Fragments a stream of packets into chunks obtained from a
//! `trace_smb::Arbiter`, maintaining the redundant length-prefix-and-patch
//! protocol described here.

mod error;
mod patch_list;
mod writer;

pub use error::WriterError;
pub use patch_list::{PatchList, PendingPatch};
pub use writer::TraceWriter;
