use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One decoded image, moved through the relay as an atomic unit
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - never written to after capture
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Stream timestamp if the source reports one
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time since the frame was captured
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("size", &format_args!("{}x{}", self.meta.width, self.meta.height))
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Pixel formats we relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Nv12,
    I420,
    Mjpeg,
}

impl PixelFormat {
    /// Raw frame size in bytes, `None` for compressed formats
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::Yuyv4 => Some(pixels * 2),
            // 4:2:0 chroma planes are subsampled in both directions
            PixelFormat::Nv12 | PixelFormat::I420 => {
                let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
                Some(pixels + 2 * chroma)
            }
            PixelFormat::Mjpeg => None,
        }
    }

    /// Format name as it appears in raw video caps
    pub fn caps_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Bgr24 => "BGR",
            PixelFormat::Yuyv4 => "YUY2",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::I420 => "I420",
            PixelFormat::Mjpeg => "JPEG",
        }
    }

    /// Bytes per pixel on the first plane, used as stride multiplier
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Yuyv4 => 2,
            PixelFormat::Nv12 | PixelFormat::I420 | PixelFormat::Mjpeg => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_sizes() {
        assert_eq!(PixelFormat::Bgr24.frame_size(1920, 1080), Some(1920 * 1080 * 3));
        assert_eq!(PixelFormat::Yuyv4.frame_size(640, 480), Some(640 * 480 * 2));
        assert_eq!(PixelFormat::I420.frame_size(4, 4), Some(16 + 8));
        assert_eq!(PixelFormat::Nv12.frame_size(3, 3), Some(9 + 8));
        assert_eq!(PixelFormat::Mjpeg.frame_size(640, 480), None);
    }

    #[test]
    fn debug_omits_pixel_bytes() {
        let frame = Frame::new(
            Bytes::from_static(&[0u8; 12]),
            FrameMetadata {
                sequence: 7,
                width: 2,
                height: 2,
                stride: 6,
                format: PixelFormat::Rgb24,
                device_timestamp: None,
            },
        );
        let text = format!("{frame:?}");
        assert!(text.contains("sequence: 7"));
        assert!(text.contains("2x2"));
        assert!(text.contains("bytes: 12"));
    }
}
