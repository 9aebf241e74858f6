//! Reconnecting capture worker feeding the relay buffer

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use crossbeam::atomic::AtomicCell;
use flume::{RecvTimeoutError, Sender};
use tracing::{debug, error, info, info_span, warn};

use crate::capture::source::{Source, SourceEvent, SourceState};
use crate::error::SourceFailure;
use crate::pipeline::{PushOutcome, RelayBuffer};
use crate::utils::redact_credentials;
use crate::SourceConfig;

/// Owns a [`Source`] collaborator and keeps it connected on a worker thread.
///
/// Every frame read is pushed into the shared [`RelayBuffer`]. Any connect or
/// read failure closes the handle, waits the fixed backoff and reconnects,
/// until [`FrameSource::stop`] is called. State transitions are published on
/// the event channel.
pub struct FrameSource<S: Source> {
    address: String,
    backoff: Duration,
    buffer: Arc<RelayBuffer>,
    events: Sender<SourceEvent>,
    state: Arc<AtomicCell<SourceState>>,
    generation: u64,
    /// Collaborator while no worker runs
    idle: Option<S>,
    worker: Option<Worker<S>>,
}

struct Worker<S> {
    generation: u64,
    /// Dropping this wakes the worker out of its backoff wait
    stop: Sender<()>,
    thread: JoinHandle<S>,
}

impl<S: Source> FrameSource<S> {
    pub fn new(
        config: &SourceConfig,
        source: S,
        buffer: Arc<RelayBuffer>,
        events: Sender<SourceEvent>,
    ) -> Self {
        Self {
            address: config.address.clone(),
            backoff: config.backoff(),
            buffer,
            events,
            state: Arc::new(AtomicCell::new(SourceState::Disconnected)),
            generation: 0,
            idle: Some(source),
            worker: None,
        }
    }

    /// Start the worker if it is not running
    pub fn run(&mut self) -> Result<()> {
        self.run_after(Duration::ZERO)
    }

    /// Start the worker, letting it wait `delay` before its first connect
    pub fn run_after(&mut self, delay: Duration) -> Result<()> {
        if self.worker.is_some() {
            debug!(generation = self.generation, "frame source already running");
            return Ok(());
        }

        let source = self
            .idle
            .take()
            .ok_or_else(|| eyre!("source collaborator was lost by a panicked worker"))?;

        self.generation += 1;
        let generation = self.generation;
        let (stop, stop_rx) = flume::bounded::<()>(0);

        let ctx = WorkerContext {
            address: self.address.clone(),
            backoff: self.backoff,
            buffer: self.buffer.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            stop: stop_rx,
            generation,
        };

        let thread = thread::Builder::new()
            .name(format!("frame-source-{generation}"))
            .spawn(move || ctx.run(source, delay))
            .map_err(|e| eyre!("Failed to spawn frame source worker: {}", e))?;

        self.worker = Some(Worker {
            generation,
            stop,
            thread,
        });
        Ok(())
    }

    /// Stop the worker and wait for it to close its connection.
    ///
    /// Returns after the worker's current blocking call completes.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        drop(worker.stop);
        match worker.thread.join() {
            Ok(source) => self.idle = Some(source),
            Err(_) => error!(
                generation = worker.generation,
                "frame source worker panicked, collaborator dropped"
            ),
        }

        self.state.store(SourceState::Disconnected);
        let _ = self.events.send(SourceEvent {
            generation: worker.generation,
            state: SourceState::Disconnected,
            cause: None,
        });
        info!(generation = worker.generation, "frame source stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn state(&self) -> SourceState {
        self.state.load()
    }

    /// Generation of the most recently started worker
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl<S: Source> Drop for FrameSource<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything a worker thread needs, moved into it at spawn
struct WorkerContext {
    address: String,
    backoff: Duration,
    buffer: Arc<RelayBuffer>,
    events: Sender<SourceEvent>,
    state: Arc<AtomicCell<SourceState>>,
    stop: flume::Receiver<()>,
    generation: u64,
}

impl WorkerContext {
    fn run<S: Source>(self, mut source: S, delay: Duration) -> S {
        let span = info_span!("frame_source", generation = self.generation);
        let _enter = span.enter();
        let address = redact_credentials(&self.address);

        if !self.wait(delay) {
            return source;
        }

        while !self.stopped() {
            self.publish(SourceState::Connecting, None);
            debug!(%address, "connecting");

            let failure = match source.connect(&self.address) {
                Ok(mut handle) => {
                    info!(%address, "connected");
                    let outcome = self.stream(&mut source, &mut handle);
                    source.close(handle);
                    match outcome {
                        Some(failure) => failure,
                        None => break,
                    }
                }
                Err(e) => e.into(),
            };

            if failure.is_end_of_stream() {
                info!(%address, "end of stream, reconnecting in {:?}", self.backoff);
            } else {
                warn!(%address, "{}, reconnecting in {:?}", failure, self.backoff);
            }
            self.publish(SourceState::Failed, Some(failure));

            if !self.wait(self.backoff) {
                break;
            }
        }

        debug!("frame source worker exiting");
        source
    }

    /// Read frames until failure (`Some`) or shutdown (`None`)
    fn stream<S: Source>(&self, source: &mut S, handle: &mut S::Handle) -> Option<SourceFailure> {
        let mut streaming = false;
        loop {
            if self.stopped() {
                return None;
            }

            let frame = match source.read_frame(handle) {
                Ok(frame) => frame,
                Err(e) => return Some(e.into()),
            };

            if !streaming {
                streaming = true;
                self.publish(SourceState::Streaming, None);
                info!(
                    "streaming {}x{} {:?}",
                    frame.meta.width, frame.meta.height, frame.meta.format
                );
            }

            if self.buffer.push(frame) == PushOutcome::Closed {
                debug!("relay buffer closed, discarding frame");
                return None;
            }
        }
    }

    fn publish(&self, state: SourceState, cause: Option<SourceFailure>) {
        self.state.store(state);
        let _ = self.events.send(SourceEvent {
            generation: self.generation,
            state,
            cause,
        });
    }

    fn stopped(&self) -> bool {
        self.stop.is_disconnected()
    }

    /// Sleep for `duration` unless stopped first; `false` means stop
    fn wait(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.stopped();
        }
        matches!(
            self.stop.recv_timeout(duration),
            Err(RecvTimeoutError::Timeout)
        )
    }
}
