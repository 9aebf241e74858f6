//! Event-driven supervisor restarting the frame source on failure

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use flume::{Receiver, Selector, Sender};
use tracing::{debug, error, info, info_span, warn};

use crate::capture::{FrameSource, Source, SourceEvent, SourceState};

/// Latest source state as seen through the event stream
#[derive(Default)]
pub struct StateMirror {
    latest: Mutex<Observed>,
    changed: Condvar,
}

#[derive(Default, Clone, Copy)]
struct Observed {
    generation: u64,
    state: SourceState,
}

impl StateMirror {
    /// Record `state` unless a newer worker generation has already reported.
    ///
    /// Returns whether the event was applied.
    fn update(&self, generation: u64, state: SourceState) -> bool {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if generation < latest.generation {
            return false;
        }
        *latest = Observed { generation, state };
        drop(latest);
        self.changed.notify_all();
        true
    }

    pub fn get(&self) -> SourceState {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Block until the mirrored state equals `wanted`, up to `timeout`
    pub fn wait_for(&self, wanted: SourceState, timeout: Duration) -> bool {
        let guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |latest| latest.state != wanted)
            .unwrap_or_else(PoisonError::into_inner);
        guard.state == wanted
    }
}

enum Wake {
    Event(SourceEvent),
    Shutdown,
}

/// Reacts to `Failed` events by stopping and re-running the [`FrameSource`].
///
/// Restarts are single-flight: they run to completion under the source lock,
/// and a failure event is acted on only if it comes from the worker
/// generation currently running and that worker is still failed. Duplicate
/// or late events are ignored.
pub struct Watchdog<S: Source> {
    source: Arc<Mutex<FrameSource<S>>>,
    mirror: Arc<StateMirror>,
    restarts: Arc<AtomicU64>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: Source> Watchdog<S> {
    /// Run the source and start supervising it through `events`
    pub fn spawn(mut source: FrameSource<S>, events: Receiver<SourceEvent>) -> Result<Self> {
        source.run()?;

        let source = Arc::new(Mutex::new(source));
        let mirror = Arc::new(StateMirror::default());
        let restarts = Arc::new(AtomicU64::new(0));
        let (shutdown, shutdown_rx) = flume::bounded::<()>(0);

        let thread = {
            let source = source.clone();
            let mirror = mirror.clone();
            let restarts = restarts.clone();
            thread::Builder::new()
                .name("watchdog".into())
                .spawn(move || supervise(source, events, shutdown_rx, mirror, restarts))
                .map_err(|e| eyre!("Failed to spawn watchdog: {}", e))?
        };

        Ok(Self {
            source,
            mirror,
            restarts,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> SourceState {
        self.mirror.get()
    }

    pub fn wait_for(&self, state: SourceState, timeout: Duration) -> bool {
        self.mirror.wait_for(state, timeout)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Generation of the running source worker
    pub fn generation(&self) -> u64 {
        lock(&self.source).generation()
    }

    /// Operator-requested restart, without waiting for a failure
    pub fn restart_now(&self) -> Result<()> {
        let generation = self.generation();
        restart(&self.source, generation, Duration::ZERO, &self.restarts, false)?;
        Ok(())
    }

    /// Stop supervising, then stop the source
    pub fn shutdown(mut self) {
        self.stop_supervisor();
        lock(&self.source).stop();
    }

    fn stop_supervisor(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("watchdog thread panicked");
            }
        }
    }
}

impl<S: Source> Drop for Watchdog<S> {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

fn lock<S: Source>(source: &Mutex<FrameSource<S>>) -> MutexGuard<'_, FrameSource<S>> {
    source.lock().unwrap_or_else(PoisonError::into_inner)
}

fn supervise<S: Source>(
    source: Arc<Mutex<FrameSource<S>>>,
    events: Receiver<SourceEvent>,
    shutdown: Receiver<()>,
    mirror: Arc<StateMirror>,
    restarts: Arc<AtomicU64>,
) {
    let span = info_span!("watchdog");
    let _enter = span.enter();

    loop {
        let wake = Selector::new()
            .recv(&events, |event| match event {
                Ok(event) => Wake::Event(event),
                Err(_) => Wake::Shutdown,
            })
            .recv(&shutdown, |_| Wake::Shutdown)
            .wait();

        let event = match wake {
            Wake::Event(event) => event,
            Wake::Shutdown => break,
        };

        debug!(generation = event.generation, state = %event.state, "source event");
        if !mirror.update(event.generation, event.state) {
            debug!(generation = event.generation, "ignoring event from replaced worker");
            continue;
        }

        if !event.is_failure() {
            continue;
        }

        match &event.cause {
            Some(cause) if cause.is_end_of_stream() => info!("source reached end of stream"),
            Some(cause) => warn!("source failed: {}", cause),
            None => warn!("source failed"),
        }

        let backoff = lock(&source).backoff();
        if let Err(e) = restart(&source, event.generation, backoff, &restarts, true) {
            error!("frame source restart failed: {:#}", e);
        }
    }

    debug!("watchdog stopped");
}

/// Stop and re-run the source if `generation` is still the running worker.
/// With `require_failed`, a worker that has already left `Failed` (it
/// reconnected by itself) is left alone.
///
/// Returns whether a restart happened.
fn restart<S: Source>(
    source: &Mutex<FrameSource<S>>,
    generation: u64,
    delay: Duration,
    restarts: &AtomicU64,
    require_failed: bool,
) -> Result<bool> {
    let mut source = lock(source);
    if source.generation() != generation || !source.is_running() {
        debug!(
            event_generation = generation,
            current = source.generation(),
            "ignoring stale failure"
        );
        return Ok(false);
    }
    if require_failed && source.state() != SourceState::Failed {
        debug!(
            generation,
            state = %source.state(),
            "source recovered before restart, ignoring failure"
        );
        return Ok(false);
    }

    let started = Instant::now();
    source.stop();
    source.run_after(delay)?;

    restarts.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("camrelay_source_restarts_total").increment(1);
    info!(
        generation = source.generation(),
        "frame source restarted in {:?}, reconnecting after {:?}",
        started.elapsed(),
        delay
    );
    Ok(true)
}
