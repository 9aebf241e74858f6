//! Downstream collaborators the pacer publishes to

mod log_sink;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_sink;
#[cfg(feature = "gstreamer-pipeline")]
pub mod rtsp_server;

pub use log_sink::LogSink;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_sink::GstSink;
#[cfg(feature = "gstreamer-pipeline")]
pub use rtsp_server::RtspServerSink;

use crate::capture::Frame;
use crate::error::SinkError;

/// Consumer of paced frames.
///
/// Owned exclusively by the pacer thread.
pub trait Sink: Send + 'static {
    /// Whether a consumer is attached and asking for data
    fn is_ready(&self) -> bool;

    /// Hand over one frame with its presentation timestamp and duration in
    /// nanoseconds. Must not block indefinitely.
    fn submit(&mut self, frame: Frame, timestamp_ns: u64, duration_ns: u64)
        -> Result<(), SinkError>;

    /// Release the downstream connection; called once at shutdown
    fn close(&mut self) {}
}

impl<T: Sink + ?Sized> Sink for Box<T> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn submit(&mut self, frame: Frame, timestamp_ns: u64, duration_ns: u64) -> Result<(), SinkError> {
        (**self).submit(frame, timestamp_ns, duration_ns)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
