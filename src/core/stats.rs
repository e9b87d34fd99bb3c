//! Per-link counters
//!
//! Counters only ever grow. They are shared between the link task, which
//! writes them, and anybody holding the link handle, who reads snapshots.

use crate::core::hdlc::codec::DiscardReason;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Link statistics
#[derive(Debug, Default)]
pub struct LinkStatistics {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    payloads_delivered: AtomicU64,
    payloads_sent: AtomicU64,
    discarded_unterminated: AtomicU64,
    discarded_invalid_escape: AtomicU64,
    discarded_checksum: AtomicU64,
    discarded_too_short: AtomicU64,
    discarded_unsupported: AtomicU64,
    retransmissions: AtomicU64,
    rejects_sent: AtomicU64,
    rejects_received: AtomicU64,
    out_of_sequence: AtomicU64,
    duplicates_ignored: AtomicU64,
    connects: AtomicU64,
    reconnects: AtomicU64,
    link_failures: AtomicU64,
    submissions_rejected: AtomicU64,
    sends_failed: AtomicU64,
    client_overflows: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LinkStatistics {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_sent(&self, wire_len: usize) {
        bump(&self.frames_sent);
        self.bytes_sent.fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn bytes_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_received(&self) {
        bump(&self.frames_received);
    }

    pub(crate) fn discarded(&self, reason: DiscardReason) {
        let counter = match reason {
            DiscardReason::Unterminated => &self.discarded_unterminated,
            DiscardReason::InvalidEscape => &self.discarded_invalid_escape,
            DiscardReason::ChecksumMismatch => &self.discarded_checksum,
            DiscardReason::TooShort => &self.discarded_too_short,
            DiscardReason::UnsupportedControl => &self.discarded_unsupported,
        };
        bump(counter);
    }

    pub(crate) fn payload_delivered(&self) {
        bump(&self.payloads_delivered);
    }

    pub(crate) fn payload_sent(&self) {
        bump(&self.payloads_sent);
    }

    pub(crate) fn retransmission(&self) {
        bump(&self.retransmissions);
    }

    pub(crate) fn reject_sent(&self) {
        bump(&self.rejects_sent);
    }

    pub(crate) fn reject_received(&self) {
        bump(&self.rejects_received);
    }

    pub(crate) fn out_of_sequence(&self) {
        bump(&self.out_of_sequence);
    }

    pub(crate) fn duplicate_ignored(&self) {
        bump(&self.duplicates_ignored);
    }

    /// Every connect after the first one is also a reconnect
    pub(crate) fn connected(&self) {
        if self.connects.fetch_add(1, Ordering::Relaxed) > 0 {
            bump(&self.reconnects);
        }
    }

    pub(crate) fn link_failure(&self) {
        bump(&self.link_failures);
    }

    pub(crate) fn submission_rejected(&self) {
        bump(&self.submissions_rejected);
    }

    pub(crate) fn sends_failed(&self, count: usize) {
        self.sends_failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn client_overflow(&self) {
        bump(&self.client_overflows);
    }

    /// Total discarded frames over all reasons
    pub fn discarded_total(&self) -> u64 {
        self.snapshot().discarded_total()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_sent: load(&self.frames_sent),
            frames_received: load(&self.frames_received),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            payloads_delivered: load(&self.payloads_delivered),
            payloads_sent: load(&self.payloads_sent),
            discarded_unterminated: load(&self.discarded_unterminated),
            discarded_invalid_escape: load(&self.discarded_invalid_escape),
            discarded_checksum: load(&self.discarded_checksum),
            discarded_too_short: load(&self.discarded_too_short),
            discarded_unsupported: load(&self.discarded_unsupported),
            retransmissions: load(&self.retransmissions),
            rejects_sent: load(&self.rejects_sent),
            rejects_received: load(&self.rejects_received),
            out_of_sequence: load(&self.out_of_sequence),
            duplicates_ignored: load(&self.duplicates_ignored),
            connects: load(&self.connects),
            reconnects: load(&self.reconnects),
            link_failures: load(&self.link_failures),
            submissions_rejected: load(&self.submissions_rejected),
            sends_failed: load(&self.sends_failed),
            client_overflows: load(&self.client_overflows),
        }
    }
}

/// Copy of the link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub payloads_delivered: u64,
    pub payloads_sent: u64,
    pub discarded_unterminated: u64,
    pub discarded_invalid_escape: u64,
    pub discarded_checksum: u64,
    pub discarded_too_short: u64,
    pub discarded_unsupported: u64,
    pub retransmissions: u64,
    pub rejects_sent: u64,
    pub rejects_received: u64,
    pub out_of_sequence: u64,
    pub duplicates_ignored: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub link_failures: u64,
    pub submissions_rejected: u64,
    pub sends_failed: u64,
    pub client_overflows: u64,
}

impl StatsSnapshot {
    /// Total discarded frames over all reasons
    pub fn discarded_total(&self) -> u64 {
        self.discarded_unterminated
            + self.discarded_invalid_escape
            + self.discarded_checksum
            + self.discarded_too_short
            + self.discarded_unsupported
    }
}
