//! Frame pacer
//!
//! Background thread that pokes the video encoder's frame hint at a fixed
//! interval while recording. It is a pull trigger only: a tick does not mean
//! the mirroring source produced a frame.

use crate::encoder::FrameSignal;
use crate::utils::error::RecorderResult;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Non-owning handle to the pipeline the pacer drives
///
/// The recorder raises `torn_down` before releasing anything; the pacer checks
/// it before every hint.
#[derive(Debug, Clone)]
pub struct PacerTarget {
    pub signal: Arc<FrameSignal>,
    pub torn_down: Arc<AtomicBool>,
}

impl PacerTarget {
    /// Deliver one hint. Returns false once the pipeline is gone.
    fn fire(&self) -> bool {
        if self.torn_down.load(Ordering::SeqCst) {
            return false;
        }
        self.signal.notify();
        true
    }
}

/// Cooperative cancellation shared between the pacer and its owner
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (cancelled, condvar) = &*self.inner;
        *cancelled.lock() = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep until `deadline` or cancellation. Returns true if cancelled.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let (cancelled, condvar) = &*self.inner;
        let mut cancelled = cancelled.lock();
        while !*cancelled {
            if condvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// Running pacer thread
pub struct FramePacer {
    cancel: CancelToken,
    ticks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl FramePacer {
    pub fn start(interval: Duration, target: PacerTarget) -> RecorderResult<Self> {
        let cancel = CancelToken::new();
        let ticks = Arc::new(AtomicU64::new(0));

        let thread_cancel = cancel.clone();
        let thread_ticks = ticks.clone();
        let handle = std::thread::Builder::new()
            .name("frame-pacer".to_string())
            .spawn(move || run_pacer(interval, target, thread_cancel, thread_ticks))?;

        tracing::debug!("Frame pacer started: interval={:?}", interval);
        Ok(Self {
            cancel,
            ticks,
            handle: Some(handle),
        })
    }

    /// Hints delivered so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Cancel and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Frame pacer thread panicked");
            }
            tracing::debug!("Frame pacer stopped after {} ticks", self.ticks());
        }
    }
}

impl Drop for FramePacer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_pacer(interval: Duration, target: PacerTarget, cancel: CancelToken, ticks: Arc<AtomicU64>) {
    let mut deadline = Instant::now() + interval;

    loop {
        if cancel.wait_until(deadline) {
            break;
        }
        if !target.fire() {
            tracing::debug!("Pipeline torn down, frame pacer exiting");
            break;
        }
        ticks.fetch_add(1, Ordering::Relaxed);

        // Skip ticks we overslept instead of bursting to catch up
        deadline += interval;
        let now = Instant::now();
        while deadline <= now {
            deadline += interval;
        }
    }
}
