//! Send-side flow observation
//!
//! The link task publishes how many frames are waiting for acknowledgment;
//! client sessions read it to reject early and to wait for room instead of
//! spinning on busy submissions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Shared view of a link's send queue
#[derive(Debug)]
pub struct FlowGuard {
    outstanding: AtomicUsize,
    window: usize,
    high_water: usize,
    peer_busy: AtomicBool,
    capacity: Notify,
}

impl FlowGuard {
    /// Guard for a window of `window` frames, admitting up to `high_water`
    pub fn new(window: usize, high_water: usize) -> Self {
        let window = window.max(1);
        Self {
            outstanding: AtomicUsize::new(0),
            window,
            high_water: high_water.clamp(1, window),
            peer_busy: AtomicBool::new(false),
            capacity: Notify::new(),
        }
    }

    /// Window size
    pub fn window(&self) -> usize {
        self.window
    }

    /// Queue length at which submissions are refused
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Frames accepted but not yet acknowledged
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Fill ratio of the send window, 0.0 to 1.0
    pub fn fill_ratio(&self) -> f32 {
        self.outstanding() as f32 / self.window as f32
    }

    /// Would a submission be admitted right now?
    pub fn admits(&self) -> bool {
        self.outstanding() < self.high_water
    }

    /// Peer signalled receive-not-ready
    pub fn peer_busy(&self) -> bool {
        self.peer_busy.load(Ordering::Acquire)
    }

    /// Either the peer is busy or no more submissions fit
    pub fn is_suspended(&self) -> bool {
        self.peer_busy() || !self.admits()
    }

    pub(crate) fn set_outstanding(&self, outstanding: usize) {
        let previous = self.outstanding.swap(outstanding, Ordering::AcqRel);
        if outstanding < previous {
            self.capacity.notify_waiters();
        }
    }

    pub(crate) fn set_peer_busy(&self, busy: bool) {
        self.peer_busy.store(busy, Ordering::Release);
    }

    /// Wake every waiter, e.g. when the link is torn down
    pub(crate) fn wake_all(&self) {
        self.capacity.notify_waiters();
    }

    /// Resolve once the queue is below the high-water mark
    pub async fn capacity_available(&self) {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.admits() {
                return;
            }
            notified.await;
        }
    }
}
