//! Relay assembly: frame source -> relay buffer -> pacer -> sink

pub mod pacer;
pub mod ringbuf;
pub mod watchdog;

pub use pacer::{Pacer, PacerHandle, PacerStats, PacingClock};
pub use ringbuf::{BufferStats, PushOutcome, RelayBuffer};
pub use watchdog::Watchdog;

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, instrument};

use crate::capture::{FrameSource, Source, SourceState};
use crate::sink::Sink;
use crate::utils::redact_credentials;
use crate::Config;

/// Combined counters of a running or finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub buffer: BufferStats,
    pub pacer: PacerStats,
    pub source_restarts: u64,
    pub source_state: SourceState,
}

/// A running relay: one source worker, one pacer and their watchdog
/// sharing a single [`RelayBuffer`].
///
/// Dropping a relay tears it down in the same order as [`Relay::shutdown`],
/// minus the returned counters.
pub struct Relay<S: Source> {
    buffer: Arc<RelayBuffer>,
    // Field order is drop order: the source stops before the pacer flushes
    watchdog: Watchdog<S>,
    pacer: PacerHandle,
}

impl<S: Source> Relay<S> {
    /// Validate `config` and start all workers
    #[instrument(skip_all)]
    pub fn start<K: Sink>(config: &Config, source: S, sink: K) -> Result<Self> {
        config.validate()?;
        info!(
            "Starting relay from {} at {} fps, buffer {} frames",
            redact_credentials(&config.source.address),
            config.pipeline.fps,
            config.pipeline.buffer_capacity
        );

        let buffer = Arc::new(RelayBuffer::new(config.pipeline.buffer_capacity));
        let pacer = Pacer::new(buffer.clone(), sink, &config.pipeline).start()?;

        let (events, events_rx) = flume::unbounded();
        let source = FrameSource::new(&config.source, source, buffer.clone(), events);
        let watchdog = match Watchdog::spawn(source, events_rx) {
            Ok(watchdog) => watchdog,
            Err(e) => {
                buffer.close();
                let _ = pacer.shutdown();
                return Err(e);
            }
        };

        Ok(Self {
            buffer,
            watchdog,
            pacer,
        })
    }

    pub fn buffer(&self) -> &Arc<RelayBuffer> {
        &self.buffer
    }

    pub fn source_state(&self) -> SourceState {
        self.watchdog.state()
    }

    /// Block until the source reports `state`, up to `timeout`
    pub fn wait_for_source(&self, state: SourceState, timeout: Duration) -> bool {
        self.watchdog.wait_for(state, timeout)
    }

    /// Force a reconnect of the source
    pub fn restart_source(&self) -> Result<()> {
        self.watchdog.restart_now()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            buffer: self.buffer.stats(),
            pacer: self.pacer.stats(),
            source_restarts: self.watchdog.restarts(),
            source_state: self.watchdog.state(),
        }
    }

    /// Stop the source, close the buffer, let the pacer flush and release
    /// the sink. Returns the final counters.
    pub fn shutdown(self) -> Result<RelayStats> {
        info!("Shutting down relay");
        let source_restarts = self.watchdog.restarts();

        self.watchdog.shutdown();
        self.buffer.close();
        let pacer = self.pacer.shutdown()?;

        let stats = RelayStats {
            buffer: self.buffer.stats(),
            pacer,
            source_restarts,
            source_state: SourceState::Disconnected,
        };
        info!(
            forwarded = stats.pacer.frames_forwarded,
            evicted = stats.buffer.frames_evicted,
            restarts = stats.source_restarts,
            "Relay stopped"
        );
        Ok(stats)
    }
}
