use std::time::Duration;

use tracing::{debug, info};

use super::Sink;
use crate::capture::Frame;
use crate::error::SinkError;

/// Always-ready sink that only counts and logs what it receives
pub struct LogSink {
    every: u64,
    forwarded: u64,
    bytes: u64,
    last_timestamp_ns: Option<u64>,
}

impl LogSink {
    /// Log one line every `every` frames
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            forwarded: 0,
            bytes: 0,
            last_timestamp_ns: None,
        }
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn last_timestamp_ns(&self) -> Option<u64> {
        self.last_timestamp_ns
    }
}

impl Sink for LogSink {
    fn is_ready(&self) -> bool {
        true
    }

    fn submit(&mut self, frame: Frame, timestamp_ns: u64, duration_ns: u64) -> Result<(), SinkError> {
        self.forwarded += 1;
        self.bytes += frame.len() as u64;
        self.last_timestamp_ns = Some(timestamp_ns);

        if self.forwarded % self.every == 0 {
            info!(
                "pushed frame {} (seq {}), pts {:?}, duration {} ns, latency {:?}",
                self.forwarded,
                frame.sequence(),
                Duration::from_nanos(timestamp_ns),
                duration_ns,
                frame.age()
            );
        }
        Ok(())
    }

    fn close(&mut self) {
        debug!(frames = self.forwarded, bytes = self.bytes, "log sink closed");
    }
}
