//! Failure taxonomy of the source and sink collaborators.
//!
//! None of these escape the relay: source errors feed the reconnect loop and
//! sink errors drop a single frame.

use std::fmt;

/// Opening a connection to the upstream source failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorKind {
    EndOfStream,
    Timeout,
    Decode,
}

impl fmt::Display for ReadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadErrorKind::EndOfStream => "end of stream",
            ReadErrorKind::Timeout => "timed out",
            ReadErrorKind::Decode => "decode error",
        })
    }
}

/// Reading the next frame from an open connection failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("read failed ({kind}): {message}")]
pub struct ReadError {
    pub kind: ReadErrorKind,
    pub message: String,
}

impl ReadError {
    pub fn new(kind: ReadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn end_of_stream() -> Self {
        Self::new(ReadErrorKind::EndOfStream, "stream ended")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::Timeout, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ReadErrorKind::Decode, message)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.kind == ReadErrorKind::EndOfStream
    }
}

/// The sink refused a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Downstream is congested; this frame is dropped
    #[error("sink busy")]
    Busy,

    /// No consumer is attached (any more); wait for readiness again
    #[error("sink not ready")]
    NotReady,
}

/// Why a source session ended, carried on `Failed` events
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceFailure {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Read(#[from] ReadError),
}

impl SourceFailure {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, SourceFailure::Read(e) if e.is_end_of_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_display_names_kind() {
        let err = ReadError::timeout("no sample within 5s");
        assert_eq!(err.to_string(), "read failed (timed out): no sample within 5s");
    }

    #[test]
    fn failure_classifies_end_of_stream() {
        let eos: SourceFailure = ReadError::end_of_stream().into();
        let connect: SourceFailure = ConnectError::Unreachable("10.0.0.1".into()).into();
        assert!(eos.is_end_of_stream());
        assert!(!connect.is_end_of_stream());
        assert_eq!(connect.to_string(), "source unreachable: 10.0.0.1");
    }
}
