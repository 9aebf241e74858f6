//! Synthetic paced source for `test://` addresses and demos

use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, instrument};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::source::Source;
use crate::error::{ConnectError, ReadError};
use crate::OutputConfig;

/// Solid-colour frames cycling through a small palette at a fixed rate.
///
/// Can simulate an unreliable camera: `fail_connects` rejects the first N
/// connection attempts and `frames_per_session` ends each session with
/// end-of-stream after that many frames.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    format: PixelFormat,
    interval: Duration,
    fail_connects: u32,
    frames_per_session: Option<u64>,
    attempts: u32,
    sequence: u64,
}

/// Per-connection state
pub struct PatternHandle {
    produced: u64,
    next_due: Instant,
}

const PALETTE: [[u8; 3]; 4] = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255]];

impl TestPatternSource {
    pub fn new(config: &OutputConfig, fps: u32) -> Result<Self> {
        if config.format.frame_size(config.width, config.height).is_none() {
            return Err(eyre!("Test pattern needs a raw format, got {:?}", config.format));
        }
        Ok(Self {
            width: config.width,
            height: config.height,
            format: config.format,
            interval: Duration::from_secs(1) / fps.max(1),
            fail_connects: 0,
            frames_per_session: None,
            attempts: 0,
            sequence: 0,
        })
    }

    pub fn fail_connects(mut self, count: u32) -> Self {
        self.fail_connects = count;
        self
    }

    pub fn frames_per_session(mut self, count: u64) -> Self {
        self.frames_per_session = Some(count);
        self
    }

    /// Apply `?fail_connects=N&session_frames=M` from a `test://` address
    pub fn with_address_options(mut self, address: &str) -> Self {
        let Some((_, query)) = address.split_once('?') else {
            return self;
        };
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("fail_connects", n)) => {
                    if let Ok(n) = n.parse() {
                        self.fail_connects = n;
                    }
                }
                Some(("session_frames", n)) => {
                    if let Ok(n) = n.parse() {
                        self.frames_per_session = Some(n);
                    }
                }
                _ => debug!("ignoring test pattern option {pair:?}"),
            }
        }
        self
    }

    fn render(&self, sequence: u64) -> Bytes {
        // Checked in `new`
        let size = self.format.frame_size(self.width, self.height).unwrap_or(0);
        let colour = PALETTE[(sequence / 30) as usize % PALETTE.len()];
        match self.format {
            PixelFormat::Rgb24 => colour.iter().copied().cycle().take(size).collect(),
            PixelFormat::Bgr24 => colour.iter().rev().copied().cycle().take(size).collect(),
            // Mid-grey luma, neutral chroma
            _ => Bytes::from(vec![128u8; size]),
        }
    }
}

impl Source for TestPatternSource {
    type Handle = PatternHandle;

    #[instrument(skip(self))]
    fn connect(&mut self, address: &str) -> Result<PatternHandle, ConnectError> {
        self.attempts += 1;
        if self.attempts <= self.fail_connects {
            return Err(ConnectError::Unreachable(format!(
                "simulated failure {}/{}",
                self.attempts, self.fail_connects
            )));
        }
        Ok(PatternHandle {
            produced: 0,
            next_due: Instant::now(),
        })
    }

    fn read_frame(&mut self, handle: &mut PatternHandle) -> Result<Frame, ReadError> {
        if self
            .frames_per_session
            .is_some_and(|limit| handle.produced >= limit)
        {
            return Err(ReadError::end_of_stream());
        }

        // Behave like a live camera: frames become available at the nominal rate
        let now = Instant::now();
        if handle.next_due > now {
            std::thread::sleep(handle.next_due - now);
        }
        handle.next_due += self.interval;
        handle.produced += 1;
        self.sequence += 1;

        Ok(Frame::new(
            self.render(self.sequence),
            FrameMetadata {
                sequence: self.sequence,
                width: self.width,
                height: self.height,
                stride: self.width * self.format.bytes_per_pixel(),
                format: self.format,
                device_timestamp: Some(Duration::from_nanos(
                    (self.interval.as_nanos() as u64).saturating_mul(handle.produced),
                )),
            },
        ))
    }

    fn close(&mut self, handle: PatternHandle) {
        debug!(produced = handle.produced, "test pattern session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(width: u32, height: u32, format: PixelFormat) -> OutputConfig {
        OutputConfig {
            width,
            height,
            format,
            ..OutputConfig::default()
        }
    }

    #[test]
    fn rejects_compressed_format() {
        assert!(TestPatternSource::new(&output(4, 4, PixelFormat::Mjpeg), 30).is_err());
    }

    #[test]
    fn frames_have_raw_size_and_rising_sequence() {
        let mut source = TestPatternSource::new(&output(4, 2, PixelFormat::Bgr24), 1000).unwrap();
        let mut handle = source.connect("test://pattern").unwrap();

        let a = source.read_frame(&mut handle).unwrap();
        let b = source.read_frame(&mut handle).unwrap();
        assert_eq!(a.len(), 4 * 2 * 3);
        assert_eq!(&a.data[..3], &[0, 0, 255]); // red in BGR order
        assert_eq!(b.sequence(), a.sequence() + 1);
        assert_eq!(a.meta.stride, 12);
    }

    #[test]
    fn address_options_script_failures() {
        let mut source = TestPatternSource::new(&output(2, 2, PixelFormat::Rgb24), 1000)
            .unwrap()
            .with_address_options("test://pattern?fail_connects=2&session_frames=1");

        assert!(source.connect("test://pattern").is_err());
        assert!(source.connect("test://pattern").is_err());
        let mut handle = source.connect("test://pattern").unwrap();
        assert!(source.read_frame(&mut handle).is_ok());
        let err = source.read_frame(&mut handle).unwrap_err();
        assert!(err.is_end_of_stream());
    }
}
