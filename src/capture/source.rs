//! Upstream collaborator contract and the status it reports.

use std::fmt;

use crate::capture::Frame;
use crate::error::{ConnectError, ReadError, SourceFailure};

/// A connection-oriented producer of decoded frames.
///
/// Implementations own transport and decoding. They are driven from a single
/// worker thread at a time, so methods take `&mut self` and may block.
pub trait Source: Send + 'static {
    /// Open connection, exclusively owned by the caller until `close`
    type Handle: Send;

    /// Open a connection. May block up to an implementation-defined timeout.
    fn connect(&mut self, address: &str) -> Result<Self::Handle, ConnectError>;

    /// Block until the next complete frame is available
    fn read_frame(&mut self, handle: &mut Self::Handle) -> Result<Frame, ReadError>;

    /// Release a connection. Must not fail.
    fn close(&mut self, handle: Self::Handle);
}

/// Connection state of a [`FrameSource`](crate::capture::FrameSource)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceState {
    #[default]
    Disconnected,
    Connecting,
    Streaming,
    Failed,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceState::Disconnected => "disconnected",
            SourceState::Connecting => "connecting",
            SourceState::Streaming => "streaming",
            SourceState::Failed => "failed",
        })
    }
}

/// State transition published by a frame source worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEvent {
    /// Worker instance that emitted the event; bumped on every `run`
    pub generation: u64,
    pub state: SourceState,
    pub cause: Option<SourceFailure>,
}

impl SourceEvent {
    pub fn is_failure(&self) -> bool {
        self.state == SourceState::Failed
    }
}
