//! Error taxonomy for the pipeline workers

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by pipeline workers. None of these terminate the process;
/// workers catch them at the loop boundary, count them and emit a notification.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("connection error: {0}")]
    Connection(#[source] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no complete response within {0:?}")]
    Timeout(Duration),

    #[error("frame source error: {0}")]
    SourceRead(#[from] SourceError),

    #[error("frame encode error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Connection(_) => ErrorKind::Connection,
            PipelineError::Protocol(_) | PipelineError::Encode(_) => ErrorKind::Protocol,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::SourceRead(_) => ErrorKind::SourceRead,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the connection must be dropped and re-established.
    pub fn needs_reconnect(&self) -> bool {
        match self {
            PipelineError::Connection(_) | PipelineError::Timeout(_) => true,
            PipelineError::Protocol(e) => e.is_framing(),
            _ => false,
        }
    }
}

/// Wire-level failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the stream part-way through a message.
    #[error("connection closed mid-message ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },

    #[error("declared message length {0} exceeds limit {1}")]
    FrameTooLarge(usize, usize),

    #[error("malformed message body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected message type {0:?}")]
    UnexpectedType(String),
}

impl ProtocolError {
    /// Framing errors leave the stream in an unknown position.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::Truncated { .. } | ProtocolError::FrameTooLarge(..)
        )
    }
}

/// Failures reported by a [`crate::capture::FrameSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not produce this frame; playback finishes gracefully.
    #[error("read failed: {0}")]
    Read(String),

    /// The underlying device or file is gone; playback enters `Error`.
    #[error("fatal I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("seek to {0} out of range")]
    SeekOutOfRange(u64),
}

impl SourceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Io(_))
    }
}

/// Error category carried by asynchronous error notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Timeout,
    SourceRead,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Timeout => "timeout",
            ErrorKind::SourceRead => "source_read",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_force_reconnect() {
        let truncated = PipelineError::from(ProtocolError::Truncated {
            received: 10,
            expected: 40,
        });
        assert!(truncated.needs_reconnect());
        assert_eq!(truncated.kind(), ErrorKind::Protocol);

        let bad_type = PipelineError::from(ProtocolError::UnexpectedType("hello".into()));
        assert!(!bad_type.needs_reconnect());
    }

    #[test]
    fn timeout_is_its_own_kind() {
        let err = PipelineError::Timeout(Duration::from_secs(5));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.needs_reconnect());
        assert_eq!(err.kind().to_string(), "timeout");
    }

    #[test]
    fn only_io_source_errors_are_fatal() {
        assert!(!SourceError::Read("corrupt frame".into()).is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(SourceError::Io(io).is_fatal());
    }
}
