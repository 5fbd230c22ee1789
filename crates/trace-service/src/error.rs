use thiserror::Error;

use trace_types::TracingSessionId;

/// Errors surfaced to a consumer or producer by the session engine. None of
/// these abort the service process: a malformed request from an
/// untrusted peer only ever fails that peer's call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("trace config invalid: {0}")]
    InvalidConfig(String),
    #[error("unique_session_name {0:?} already in use")]
    DuplicateSessionName(String),
    #[error("duration_ms {0} exceeds the maximum allowed trace duration")]
    DurationTooLong(u32),
    #[error("session {0} not found")]
    SessionNotFound(TracingSessionId),
    #[error("session {0} is not in a state that allows this operation")]
    InvalidSessionState(TracingSessionId),
    #[error("detach/attach key {0:?} not found")]
    UnknownDetachKey(String),
    #[error("clone not authorized")]
    CloneNotAuthorized,
    #[error("source session ended before clone completed")]
    CloneSourceEnded,
}

impl ServiceError {
    /// Whether this error reflects a caller mistake worth logging loudly
    /// versus routine churn (session already gone, etc).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ServiceError::InvalidConfig(_) | ServiceError::DurationTooLong(_))
    }
}
