//! Paced republishing of buffered frames to a sink

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use crossbeam::utils::CachePadded;
use tracing::{debug, info, info_span, trace, warn};

use crate::capture::Frame;
use crate::error::SinkError;
use crate::pipeline::RelayBuffer;
use crate::sink::Sink;
use crate::PipelineConfig;

/// Presentation clock advancing by exactly one frame duration per forwarded
/// frame, whatever the wall-clock gap between arrivals.
#[derive(Debug, Clone)]
pub struct PacingClock {
    index: u64,
    frame_duration_ns: u64,
}

impl PacingClock {
    pub fn new(fps: u32) -> Self {
        Self {
            index: 0,
            frame_duration_ns: frame_duration_ns(fps),
        }
    }

    /// Timestamp the next forwarded frame will carry
    pub fn next_timestamp(&self) -> u64 {
        self.index * self.frame_duration_ns
    }

    pub fn advance(&mut self) {
        self.index += 1;
    }

    pub fn frame_duration_ns(&self) -> u64 {
        self.frame_duration_ns
    }

    /// Frames forwarded so far
    pub fn frames(&self) -> u64 {
        self.index
    }
}

/// One frame period in nanoseconds, truncated like the media clock does
pub fn frame_duration_ns(fps: u32) -> u64 {
    1_000_000_000 / u64::from(fps.max(1))
}

/// Snapshot of pacer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerStats {
    pub frames_forwarded: u64,
    pub frames_rejected: u64,
    pub frames_discarded: u64,
    pub empty_polls: u64,
}

#[derive(Default)]
struct Counters {
    frames_forwarded: AtomicU64,
    frames_rejected: AtomicU64,
    frames_discarded: AtomicU64,
    empty_polls: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PacerStats {
        PacerStats {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }
}

/// Drains the relay buffer into a [`Sink`] with a regular timeline
pub struct Pacer<K: Sink> {
    buffer: Arc<RelayBuffer>,
    sink: K,
    clock: PacingClock,
    pop_timeout: Duration,
    ready_poll: Duration,
    drain_on_shutdown: bool,
    /// Sink has asked for data and not refused with `NotReady` since
    sink_ready: bool,
    stop: Arc<AtomicBool>,
    counters: Arc<CachePadded<Counters>>,
}

impl<K: Sink> Pacer<K> {
    pub fn new(buffer: Arc<RelayBuffer>, sink: K, config: &PipelineConfig) -> Self {
        Self {
            buffer,
            sink,
            clock: PacingClock::new(config.fps),
            pop_timeout: config.pop_timeout(),
            ready_poll: config.ready_poll(),
            drain_on_shutdown: config.drain_on_shutdown,
            sink_ready: false,
            stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(CachePadded::new(Counters::default())),
        }
    }

    /// Spawn the drain loop on its own thread
    pub fn start(self) -> Result<PacerHandle> {
        let stop = self.stop.clone();
        let counters = self.counters.clone();
        let thread = thread::Builder::new()
            .name("pacer".into())
            .spawn(move || self.run())
            .map_err(|e| eyre!("Failed to spawn pacer: {}", e))?;

        Ok(PacerHandle {
            stop,
            counters,
            thread: Some(thread),
        })
    }

    /// Submit one frame stamped with the next clock value.
    ///
    /// The clock only advances on acceptance; a refused frame is dropped.
    pub fn push_to_sink(&mut self, frame: Frame) -> Result<u64, SinkError> {
        let timestamp = self.clock.next_timestamp();
        let sequence = frame.sequence();

        match self
            .sink
            .submit(frame, timestamp, self.clock.frame_duration_ns())
        {
            Ok(()) => {
                self.clock.advance();
                self.counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camrelay_frames_forwarded_total").increment(1);

                let frames = self.clock.frames();
                if frames % 30 == 0 {
                    debug!(
                        "pushed frame {}, pts {:?}",
                        frames,
                        Duration::from_nanos(timestamp)
                    );
                }
                Ok(timestamp)
            }
            Err(e) => {
                if e == SinkError::NotReady {
                    self.sink_ready = false;
                }
                self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                let reason = match e {
                    SinkError::Busy => "busy",
                    SinkError::NotReady => "not_ready",
                };
                metrics::counter!("camrelay_frames_rejected_total", "reason" => reason).increment(1);
                trace!(sequence, "{}, dropping frame", e);
                Err(e)
            }
        }
    }

    pub fn clock(&self) -> &PacingClock {
        &self.clock
    }

    pub fn stats(&self) -> PacerStats {
        self.counters.snapshot()
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Poll sink readiness; `false` if shutdown came first
    fn await_ready(&mut self) -> bool {
        let mut waited = false;
        while !self.sink.is_ready() {
            if self.stopping() {
                return false;
            }
            if !waited {
                info!("waiting for a downstream consumer");
                waited = true;
            }
            thread::sleep(self.ready_poll);
        }
        if waited {
            info!("sink ready");
        }
        self.sink_ready = true;
        true
    }

    fn run(mut self) -> PacerStats {
        let span = info_span!("pacer");
        let _enter = span.enter();

        if self.await_ready() {
            while !self.stopping() {
                match self.buffer.try_pop(self.pop_timeout) {
                    Some(frame) => {
                        if self.push_to_sink(frame) == Err(SinkError::NotReady) && !self.await_ready()
                        {
                            break;
                        }
                    }
                    None if self.buffer.is_closed() => break,
                    None => {
                        self.counters.empty_polls.fetch_add(1, Ordering::Relaxed);
                        debug!("buffer empty, skipping");
                    }
                }
            }
        }

        self.finish()
    }

    fn finish(mut self) -> PacerStats {
        // Nothing drains the buffer after us
        self.buffer.close();

        // A sink that never asked for data, or went away, gets nothing
        let mut remaining = self.buffer.capacity();
        let mut drained = 0u64;
        let mut discarded = 0u64;
        while remaining > 0 {
            let Some(frame) = self.buffer.try_pop(Duration::ZERO) else {
                break;
            };
            remaining -= 1;
            if self.drain_on_shutdown && self.sink_ready && self.push_to_sink(frame).is_ok() {
                drained += 1;
            } else {
                discarded += 1;
            }
        }
        self.counters
            .frames_discarded
            .fetch_add(discarded, Ordering::Relaxed);

        if drained + discarded > 0 {
            info!(drained, discarded, "flushed buffered frames at shutdown");
        }

        self.sink.close();
        let stats = self.counters.snapshot();
        info!(
            forwarded = stats.frames_forwarded,
            rejected = stats.frames_rejected,
            "pacer stopped"
        );
        stats
    }
}

/// Running pacer thread; dropping it stops the thread and closes the sink
pub struct PacerHandle {
    stop: Arc<AtomicBool>,
    counters: Arc<CachePadded<Counters>>,
    thread: Option<JoinHandle<PacerStats>>,
}

impl PacerHandle {
    pub fn stats(&self) -> PacerStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the loop, flush per the drain policy, close the sink and join
    pub fn shutdown(mut self) -> Result<PacerStats> {
        self.join().unwrap_or_else(|| Ok(self.counters.snapshot()))
    }

    fn join(&mut self) -> Option<Result<PacerStats>> {
        let thread = self.thread.take()?;
        self.stop.store(true, Ordering::Release);
        Some(thread.join().map_err(|_| {
            warn!("pacer thread panicked");
            eyre!("pacer thread panicked")
        }))
    }
}

impl Drop for PacerHandle {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.join() {
            warn!("pacer shutdown on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ringbuf::tests::frame;
    use crate::pipeline::PushOutcome;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Records what it receives; refuses according to `script`
    #[derive(Clone, Default)]
    struct Recorder {
        received: Arc<Mutex<Vec<(u64, u64)>>>,
        refuse: Arc<Mutex<Vec<SinkError>>>,
        ready: Arc<AtomicBool>,
        closed: Arc<AtomicU64>,
    }

    impl Recorder {
        fn ready() -> Self {
            let recorder = Self::default();
            recorder.ready.store(true, Ordering::SeqCst);
            recorder
        }

        fn received(&self) -> Vec<(u64, u64)> {
            self.received.lock().unwrap().clone()
        }
    }

    impl Sink for Recorder {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn submit(&mut self, frame: Frame, ts: u64, _duration: u64) -> Result<(), SinkError> {
            if let Some(err) = self.refuse.lock().unwrap().pop() {
                return Err(err);
            }
            self.received.lock().unwrap().push((frame.sequence(), ts));
            Ok(())
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(fps: u32) -> PipelineConfig {
        PipelineConfig {
            fps,
            pop_timeout_ms: 10,
            ready_poll_ms: 5,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn frame_duration_truncates() {
        assert_eq!(frame_duration_ns(30), 33_333_333);
        assert_eq!(frame_duration_ns(25), 40_000_000);
        assert_eq!(frame_duration_ns(0), 1_000_000_000);
    }

    #[test]
    fn timestamps_advance_by_one_duration_per_forwarded_frame() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::ready();
        let mut pacer = Pacer::new(buffer, sink.clone(), &config(30));

        for seq in 1..=10 {
            // Irregular arrivals must not show up in the timeline
            thread::sleep(Duration::from_millis(seq % 3 * 7));
            pacer.push_to_sink(frame(seq)).unwrap();
        }

        let received = sink.received();
        for (k, (_, ts)) in received.iter().enumerate() {
            assert_eq!(*ts, k as u64 * 33_333_333);
        }
        assert_eq!(pacer.clock().frames(), 10);
    }

    #[test]
    fn busy_sink_drops_frame_without_gap() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::ready();
        sink.refuse.lock().unwrap().push(SinkError::Busy);
        let mut pacer = Pacer::new(buffer, sink.clone(), &config(25));

        assert_eq!(pacer.push_to_sink(frame(1)), Err(SinkError::Busy));
        assert_eq!(pacer.push_to_sink(frame(2)), Ok(0));
        assert_eq!(pacer.push_to_sink(frame(3)), Ok(40_000_000));

        assert_eq!(sink.received(), vec![(2, 0), (3, 40_000_000)]);
        assert_eq!(pacer.stats().frames_rejected, 1);
    }

    #[test]
    fn forwards_in_fifo_order_and_survives_empty_buffer() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::ready();
        let handle = Pacer::new(buffer.clone(), sink.clone(), &config(30))
            .start()
            .unwrap();

        buffer.push(frame(1));
        buffer.push(frame(2));
        thread::sleep(Duration::from_millis(60));
        buffer.push(frame(3));
        thread::sleep(Duration::from_millis(60));

        buffer.close();
        let stats = handle.shutdown().unwrap();

        let order: Vec<u64> = sink.received().iter().map(|(s, _)| *s).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(stats.frames_forwarded, 3);
        assert!(stats.empty_polls > 0);
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waits_for_readiness_before_forwarding() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::default();
        let handle = Pacer::new(buffer.clone(), sink.clone(), &config(30))
            .start()
            .unwrap();

        buffer.push(frame(1));
        thread::sleep(Duration::from_millis(50));
        assert!(sink.received().is_empty());
        assert_eq!(buffer.len(), 1);

        sink.ready.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(1);
        while sink.received().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        buffer.close();
        handle.shutdown().unwrap();
        assert_eq!(sink.received(), vec![(1, 0)]);
    }

    #[test]
    fn shutdown_without_consumer_discards_and_closes() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::default();
        let mut cfg = config(30);
        cfg.drain_on_shutdown = false;
        let handle = Pacer::new(buffer.clone(), sink.clone(), &cfg).start().unwrap();

        for seq in 0..5 {
            buffer.push(frame(seq));
        }
        buffer.close();
        let stats = handle.shutdown().unwrap();

        assert_eq!(stats.frames_discarded, 5);
        assert!(buffer.is_empty());
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_on_shutdown_forwards_remaining() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::ready();
        let mut pacer = Pacer::new(buffer.clone(), sink.clone(), &config(30));
        pacer.drain_on_shutdown = true;
        assert!(pacer.await_ready());

        for seq in 0..4 {
            buffer.push(frame(seq));
        }
        buffer.close();
        let stats = pacer.finish();

        assert_eq!(stats.frames_forwarded, 4);
        assert_eq!(sink.received().len(), 4);
    }

    #[test]
    fn drain_skips_sink_that_never_became_ready() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::default();
        let handle = Pacer::new(buffer.clone(), sink.clone(), &config(30))
            .start()
            .unwrap();

        for seq in 0..5 {
            buffer.push(frame(seq));
        }
        // Readiness only flips after the stop request
        let stats = handle.shutdown().unwrap();
        sink.ready.store(true, Ordering::SeqCst);

        assert!(sink.received().is_empty());
        assert_eq!(stats.frames_discarded, 5);
        assert_eq!(stats.frames_forwarded, 0);
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_stops_once_sink_goes_away() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::ready();
        let mut pacer = Pacer::new(buffer.clone(), sink.clone(), &config(30));
        assert!(pacer.await_ready());

        for seq in 0..4 {
            buffer.push(frame(seq));
        }
        sink.refuse.lock().unwrap().push(SinkError::NotReady);
        let stats = pacer.finish();

        assert!(sink.received().is_empty());
        assert_eq!(stats.frames_rejected, 1);
        assert_eq!(stats.frames_discarded, 4);
    }

    #[test]
    fn dropping_handle_stops_thread_and_closes_sink() {
        let buffer = Arc::new(RelayBuffer::new(30));
        let sink = Recorder::ready();
        let handle = Pacer::new(buffer.clone(), sink.clone(), &config(30))
            .start()
            .unwrap();

        buffer.push(frame(1));
        let deadline = Instant::now() + Duration::from_secs(1);
        while sink.received().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(handle);

        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
        assert!(buffer.is_closed());
        assert_eq!(buffer.push(frame(2)), PushOutcome::Closed);
    }
}
