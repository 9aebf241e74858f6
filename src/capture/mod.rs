pub mod frame;
pub mod frame_source;
pub mod source;
pub mod test_pattern;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use frame_source::FrameSource;
pub use source::{Source, SourceEvent, SourceState};
pub use test_pattern::TestPatternSource;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstSource;
