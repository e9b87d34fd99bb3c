//! Peer liveness tracking
//!
//! Every valid frame refreshes the activity timestamp. When the idle window
//! passes without traffic a keepalive poll is due; if the following window is
//! silent as well the link is considered dead.

use std::time::Duration;
use tokio::time::Instant;

/// What the protocol should do when the idle deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveAction {
    /// Nothing due yet
    None,
    /// Send a keepalive poll
    Probe,
    /// Peer stayed silent through the poll
    Dead,
}

/// Liveness state of one link
#[derive(Debug, Clone)]
pub struct AliveState {
    idle_timeout: Duration,
    last_activity: Option<Instant>,
    probe_sent: Option<Instant>,
    alive: bool,
}

impl AliveState {
    /// New tracker with the given idle window
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            last_activity: None,
            probe_sent: None,
            alive: false,
        }
    }

    /// Has the peer been heard from recently?
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Is a keepalive poll outstanding?
    pub fn is_probing(&self) -> bool {
        self.probe_sent.is_some()
    }

    /// Record a valid frame. Returns `true` when the alive flag changed.
    pub fn frame_seen(&mut self, now: Instant) -> bool {
        self.last_activity = Some(now);
        self.probe_sent = None;
        !std::mem::replace(&mut self.alive, true)
    }

    /// Start watching, as if the peer was just heard from
    pub fn arm(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.probe_sent = None;
    }

    /// Stop watching. Returns `true` when the alive flag changed.
    pub fn disarm(&mut self) -> bool {
        self.last_activity = None;
        self.probe_sent = None;
        std::mem::replace(&mut self.alive, false)
    }

    /// When the next idle check is due
    pub fn deadline(&self) -> Option<Instant> {
        match (self.probe_sent, self.last_activity) {
            (Some(sent), _) => Some(sent + self.idle_timeout),
            (None, Some(last)) => Some(last + self.idle_timeout),
            (None, None) => None,
        }
    }

    /// Evaluate the idle deadline
    pub fn on_timeout(&mut self, now: Instant) -> AliveAction {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                if self.probe_sent.is_some() {
                    self.last_activity = None;
                    self.probe_sent = None;
                    self.alive = false;
                    AliveAction::Dead
                } else {
                    self.probe_sent = Some(now);
                    AliveAction::Probe
                }
            }
            _ => AliveAction::None,
        }
    }
}
