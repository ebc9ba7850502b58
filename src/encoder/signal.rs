//! Coalescing "frame available" hint
//!
//! At most one hint is ever pending: repeated notifications before the
//! encoder consumes the hint collapse into one.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Advisory signal shared by the pacer, the mirroring source and the video encoder
#[derive(Debug, Default)]
pub struct FrameSignal {
    pending: Mutex<bool>,
    condvar: Condvar,
    notifications: AtomicU64,
}

impl FrameSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a frame as available and wake the waiting encoder
    pub fn notify(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        *self.pending.lock() = true;
        self.condvar.notify_one();
    }

    /// Consume the pending hint, returning whether one was set
    pub fn take(&self) -> bool {
        std::mem::replace(&mut *self.pending.lock(), false)
    }

    /// Whether a hint is pending, without consuming it
    pub fn is_pending(&self) -> bool {
        *self.pending.lock()
    }

    /// Block until a hint is pending or the timeout elapses
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.condvar.wait_for(&mut pending, timeout);
        }
        *pending
    }

    /// Wake waiters without setting a hint (used on stop)
    pub fn wake(&self) {
        let _guard = self.pending.lock();
        self.condvar.notify_all();
    }

    /// Total number of notifications received, coalesced or not
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}
