//! Errors surfaced to an endpoint caller.

use thiserror::Error;

use trace_service::ServiceError;

/// Errors an endpoint can observe. `Service` wraps whatever
/// [`ServiceError`] the dispatcher returned; the other variants describe
/// the transport itself going away rather than a request being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The dispatcher task has stopped accepting new commands.
    #[error("dispatcher is no longer accepting requests")]
    DispatcherClosed,

    /// The dispatcher dropped the response channel without answering,
    /// almost always because it shut down mid-request.
    #[error("dispatcher dropped the response channel without answering")]
    NoResponse,
}

impl IpcError {
    /// Whether a caller could usefully retry. A closed dispatcher never
    /// comes back and a dropped response is the same shutdown race, so
    /// neither is retryable; service errors inherit their own judgment.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            IpcError::Service(e) => e.is_recoverable(),
            IpcError::DispatcherClosed | IpcError::NoResponse => false,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_recoverable()
    }
}
