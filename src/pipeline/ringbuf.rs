//! Bounded drop-oldest hand-off buffer between capture and pacing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::trace;

use crate::Frame;

/// Bounded FIFO of frames with a drop-oldest overload policy.
///
/// `push` never waits for the consumer: a full buffer evicts its oldest
/// frame under the same lock as the insert, so `len() <= capacity()` holds
/// at every observable point. The lock is never held while a caller does
/// anything else.
pub struct RelayBuffer {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Inner {
    ring: HeapRb<Frame>,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicU64,
    frames_popped: AtomicU64,
    frames_evicted: AtomicU64,
    frames_rejected: AtomicU64,
}

/// What happened to a pushed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// Stored after evicting the frame with this sequence number
    Evicted(u64),
    /// The buffer is closed; the frame was discarded
    Closed,
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub frames_pushed: u64,
    pub frames_popped: u64,
    pub frames_evicted: u64,
    pub frames_rejected: u64,
    pub occupancy: usize,
}

impl RelayBuffer {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "relay buffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                ring: HeapRb::new(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Frames are plain data, a panicking holder cannot leave them half-written
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: store a frame, evicting the oldest one if full
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let (evicted, occupancy) = {
            let mut inner = self.lock();
            if inner.closed {
                drop(inner);
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                return PushOutcome::Closed;
            }
            let evicted = inner.ring.push_overwrite(frame);
            (evicted, inner.ring.occupied_len())
        };
        self.available.notify_one();

        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("camrelay_buffer_occupancy").set(occupancy as f64);

        match evicted {
            Some(old) => {
                self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("camrelay_frames_evicted_total").increment(1);
                trace!(sequence = old.sequence(), "buffer full, evicted oldest frame");
                PushOutcome::Evicted(old.sequence())
            }
            None => PushOutcome::Stored,
        }
    }

    /// Consumer: wait for the oldest frame.
    ///
    /// Returns `None` only once the buffer is closed and empty.
    pub fn pop(&self) -> Option<Frame> {
        let mut inner = self.lock();
        loop {
            if let Some(frame) = inner.ring.try_pop() {
                drop(inner);
                self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
                return Some(frame);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Consumer: wait up to `timeout` for the oldest frame
    pub fn try_pop(&self, timeout: Duration) -> Option<Frame> {
        let inner = self.lock();
        let (mut inner, _) = self
            .available
            .wait_timeout_while(inner, timeout, |inner| {
                inner.ring.is_empty() && !inner.closed
            })
            .unwrap_or_else(PoisonError::into_inner);

        let frame = inner.ring.try_pop();
        drop(inner);
        if frame.is_some() {
            self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Stop accepting frames; buffered frames stay poppable
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            frames_pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            frames_popped: self.stats.frames_popped.load(Ordering::Relaxed),
            frames_evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
            frames_rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
            occupancy: self.len(),
        }
    }
}
