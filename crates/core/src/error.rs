use crate::session::Phase;
use sonic_realtime::{DecodeError, StreamError};

/// Substring the service uses when a stream outlives its maximum length.
const STREAM_LENGTH_EXCEEDED: &str = "exceeded max length";

/// Errors surfaced by the session controller, dispatcher and supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no translation session is active")]
    NotActive,
    #[error("cannot {operation} while the session is in phase {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
    #[error("a session is already active on this controller")]
    AlreadyActive,
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("background task failed: {0}")]
    TaskFailed(String),
    #[error("gave up after {0} restarts")]
    RestartLimit(u32),
}

impl SessionError {
    /// True when the service ended the stream because it grew past its
    /// maximum length. This is the one failure recovered by a restart.
    pub fn is_stream_length_exceeded(&self) -> bool {
        self.to_string().contains(STREAM_LENGTH_EXCEEDED)
    }

    /// True for the transport's invalid-state error, reported when the stream
    /// is used after it was closed.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, SessionError::Stream(StreamError::InvalidState(_)))
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::TaskFailed(err.to_string())
    }
}
