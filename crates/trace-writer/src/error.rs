use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriterError {
    /// `NewTracePacket` called while a packet is already open (DCHECK in
    /// the original; recoverable here since producers are untrusted).
    #[error("packet already open on this writer sequence")]
    PacketAlreadyOpen,
    /// SMB exhausted under `BufferExhaustedPolicy::Drop`.
    #[error("shared memory exhausted, packet dropped")]
    PacketDropped,
    /// `BeginNestedMessage`/`FinishNestedMessage` called with no enclosing
    /// packet (or no enclosing nested message) open.
    #[error("no open packet or nested message to operate on")]
    NoOpenPacket,
    #[error(transparent)]
    Smb(#[from] trace_smb::SmbError),
}
