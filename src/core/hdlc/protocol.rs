//! Link protocol state machine
//!
//! [`ProtocolState`] implements the connection-oriented, go-back-N part of
//! the link:
//! - SABM / UA / DISC / DM connection management
//! - Modulo-8 sequence numbers with a send window of at most 7 frames
//! - Cumulative acknowledgment via RR, RNR, REJ and piggybacked N(R)
//! - One retransmission timer (T1) and a retry limit (N2)
//! - Keepalive polling when the peer goes quiet
//!
//! The state machine performs no I/O. Callers feed it received frames and
//! timer expirations, then drain frames to transmit and packets to deliver.

use super::alive::{AliveAction, AliveState};
use super::frame::{seq_distance, seq_next, Control, Frame, SupervisoryKind, UnnumberedKind, DEFAULT_ADDRESS};
use super::packet::{ControlPacket, DataPacket, Direction, DisconnectReason, Packet, PortStatus};
use crate::core::flow::FlowGuard;
use crate::core::stats::LinkStatistics;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Largest send window modulo-8 numbering allows
pub const MAX_WINDOW: u8 = 7;

/// Fixed link parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkProfile {
    /// Address octet, `None` on address-less links
    pub address: Option<u8>,
    /// Send window (1..=7)
    pub window: u8,
    /// Retransmission timer
    pub t1: Duration,
    /// Transmission attempts before giving up
    pub n2: u32,
    /// Silence tolerated before a keepalive poll
    pub idle_timeout: Duration,
    /// Largest information field accepted for sending
    pub max_payload: usize,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            address: Some(DEFAULT_ADDRESS),
            window: MAX_WINDOW,
            t1: Duration::from_millis(500),
            n2: 10,
            idle_timeout: Duration::from_secs(15),
            max_payload: 4096,
        }
    }
}

impl LinkProfile {
    /// Set the send window, clamped to 1..=7
    #[must_use]
    pub fn window(mut self, window: u8) -> Self {
        self.window = window.clamp(1, MAX_WINDOW);
        self
    }

    /// Set T1
    #[must_use]
    pub fn t1(mut self, t1: Duration) -> Self {
        self.t1 = t1;
        self
    }

    /// Set N2
    #[must_use]
    pub fn n2(mut self, n2: u32) -> Self {
        self.n2 = n2.max(1);
        self
    }

    /// Set the idle window
    #[must_use]
    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    /// Set the address octet
    #[must_use]
    pub fn address(mut self, address: Option<u8>) -> Self {
        self.address = address;
        self
    }

    /// Set the largest payload
    #[must_use]
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
}

/// Link states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    /// No logical connection
    Disconnected,
    /// SABM sent, waiting for UA
    Connecting,
    /// Information transfer
    Connected,
    /// DISC sent, waiting for UA
    Disconnecting,
}

/// Why a submission was refused
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Send window (or high-water mark) reached
    #[error("Link busy: send window full")]
    Busy,

    /// No logical connection to send on
    #[error("Link not connected")]
    NotConnected,

    /// Payload exceeds the configured maximum
    #[error("Payload too large: {len} > {max}")]
    TooLarge {
        /// Submitted length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Session may only read
    #[error("Session is read-only")]
    ReadOnly,
}

#[derive(Debug, Clone)]
struct Outstanding {
    seq: u8,
    payload: Bytes,
    tx_count: u32,
}

/// Protocol state for one link
pub struct ProtocolState {
    profile: LinkProfile,
    state: LinkState,
    /// V(S): sequence number of the next new I-frame
    vs: u8,
    /// V(R): sequence number expected from the peer
    vr: u8,
    /// Unacknowledged I-frames, oldest first
    queue: VecDeque<Outstanding>,
    /// Payloads accepted while the link is still coming up
    pending: VecDeque<Bytes>,
    t1: Option<Instant>,
    retries: u32,
    peer_busy: bool,
    reject_sent: bool,
    ack_pending: bool,
    /// Until when a P/F S-frame counts as the answer to our own poll
    poll_outstanding: Option<Instant>,
    /// UI-frames queued but not yet taken by the transmitter
    unsent_ui: usize,
    alive: AliveState,
    transmit: VecDeque<Frame>,
    events: VecDeque<Packet>,
    status: PortStatus,
    stats: Arc<LinkStatistics>,
    flow: Arc<FlowGuard>,
}

impl ProtocolState {
    /// Create a disconnected link
    pub fn new(profile: LinkProfile, stats: Arc<LinkStatistics>, flow: Arc<FlowGuard>) -> Self {
        let alive = AliveState::new(profile.idle_timeout);
        Self {
            profile,
            state: LinkState::Disconnected,
            vs: 0,
            vr: 0,
            queue: VecDeque::with_capacity(usize::from(MAX_WINDOW)),
            pending: VecDeque::new(),
            t1: None,
            retries: 0,
            peer_busy: false,
            reject_sent: false,
            ack_pending: false,
            poll_outstanding: None,
            unsent_ui: 0,
            alive,
            transmit: VecDeque::new(),
            events: VecDeque::new(),
            status: PortStatus::default(),
            stats,
            flow,
        }
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Link profile
    pub fn profile(&self) -> &LinkProfile {
        &self.profile
    }

    /// Number of unacknowledged I-frames
    pub fn unacknowledged(&self) -> usize {
        self.queue.len()
    }

    /// Status as last reported to consumers
    pub fn port_status(&self) -> PortStatus {
        self.status
    }

    fn high_water(&self) -> usize {
        self.flow.high_water().min(usize::from(self.profile.window))
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Start bringing the link up
    pub fn connect(&mut self, now: Instant) {
        if self.state != LinkState::Disconnected {
            return;
        }
        debug!("Sending SABM");
        self.state = LinkState::Connecting;
        self.retries = 0;
        self.push_unnumbered(UnnumberedKind::Sabm, true);
        self.t1 = Some(now + self.profile.t1);
    }

    /// Take the link down
    pub fn disconnect(&mut self, reason: DisconnectReason, now: Instant) {
        match self.state {
            LinkState::Connected | LinkState::Connecting => {
                self.go_down(reason);
                self.state = LinkState::Disconnecting;
                self.retries = 0;
                self.push_unnumbered(UnnumberedKind::Disc, true);
                self.t1 = Some(now + self.profile.t1);
            }
            LinkState::Disconnecting | LinkState::Disconnected => {}
        }
    }

    /// Queue a payload for transmission
    ///
    /// Reliable payloads become I-frames and are retransmitted until
    /// acknowledged; unreliable ones go out once as UI-frames.
    pub fn submit(&mut self, payload: Bytes, reliable: bool, now: Instant) -> Result<(), SubmitError> {
        let result = self.try_submit(payload, reliable, now);
        if result.is_err() {
            self.stats.submission_rejected();
        }
        self.sync_flow();
        result
    }

    fn try_submit(&mut self, payload: Bytes, reliable: bool, now: Instant) -> Result<(), SubmitError> {
        if payload.len() > self.profile.max_payload {
            return Err(SubmitError::TooLarge {
                len: payload.len(),
                max: self.profile.max_payload,
            });
        }
        if !reliable {
            if self.state != LinkState::Connected {
                return Err(SubmitError::NotConnected);
            }
            if self.unsent_ui >= self.high_water() {
                return Err(SubmitError::Busy);
            }
            self.unsent_ui += 1;
            self.transmit.push_back(Frame::ui(self.profile.address, payload.clone()));
            self.echo_sent(payload, false);
            return Ok(());
        }
        match self.state {
            LinkState::Connected => {
                if self.queue.len() >= self.high_water() {
                    return Err(SubmitError::Busy);
                }
                self.enqueue(payload, now);
                Ok(())
            }
            LinkState::Connecting => {
                if self.pending.len() >= self.high_water() {
                    return Err(SubmitError::Busy);
                }
                self.pending.push_back(payload);
                Ok(())
            }
            LinkState::Disconnected | LinkState::Disconnecting => Err(SubmitError::NotConnected),
        }
    }

    fn enqueue(&mut self, payload: Bytes, now: Instant) {
        let seq = self.vs;
        self.vs = seq_next(self.vs);
        self.queue.push_back(Outstanding {
            seq,
            payload,
            tx_count: 0,
        });
        if !self.peer_busy {
            self.transmit_unsent(now);
        }
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// Process a valid frame from the peer
    pub fn handle_frame(&mut self, frame: Frame, now: Instant) {
        trace!(frame = %frame, "Received");
        self.stats.frame_received();
        self.alive.frame_seen(now);
        match frame.control {
            Control::Unnumbered { kind, poll_final } => {
                self.on_unnumbered(kind, poll_final, frame.payload, now);
            }
            Control::Supervisory { kind, nr, poll_final } => {
                self.on_supervisory(kind, nr, poll_final, now);
            }
            Control::Information { ns, nr, poll } => {
                self.on_information(ns, nr, poll, frame.payload, now);
            }
        }
        self.sync_flow();
        self.publish_status();
    }

    /// Process timer expirations up to `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if matches!(self.t1, Some(deadline) if now >= deadline) {
            self.on_t1_expired(now);
        }
        if self.state == LinkState::Connected {
            match self.alive.on_timeout(now) {
                AliveAction::None => {}
                AliveAction::Probe => {
                    debug!("Peer idle, sending keepalive poll");
                    self.send_poll(now);
                }
                AliveAction::Dead => {
                    warn!("Peer silent after keepalive poll");
                    self.stats.link_failure();
                    self.go_down(DisconnectReason::IdleTimeout);
                }
            }
        }
        self.sync_flow();
        self.publish_status();
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout) has work
    pub fn next_deadline(&self) -> Option<Instant> {
        let idle = if self.state == LinkState::Connected {
            self.alive.deadline()
        } else {
            None
        };
        match (self.t1, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------

    /// Next frame to put on the line
    ///
    /// Sequence acknowledgments are filled in here, so every I- or S-frame
    /// carries the latest V(R) and doubles as the pending acknowledgment.
    pub fn poll_transmit(&mut self) -> Option<Frame> {
        if let Some(mut frame) = self.transmit.pop_front() {
            match &mut frame.control {
                Control::Information { nr, .. } | Control::Supervisory { nr, .. } => {
                    *nr = self.vr;
                    self.ack_pending = false;
                }
                Control::Unnumbered { kind, .. } => {
                    if *kind == UnnumberedKind::Ui {
                        self.unsent_ui -= 1;
                        self.sync_flow();
                    }
                }
            }
            return Some(frame);
        }
        if self.ack_pending && self.state == LinkState::Connected {
            self.ack_pending = false;
            return Some(Frame::supervisory(
                self.profile.address,
                SupervisoryKind::ReceiveReady,
                self.vr,
                false,
            ));
        }
        None
    }

    /// Next packet for the consumer
    pub fn poll_event(&mut self) -> Option<Packet> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Frame handlers
    // ------------------------------------------------------------------

    fn on_unnumbered(&mut self, kind: UnnumberedKind, poll_final: bool, payload: Bytes, now: Instant) {
        match kind {
            UnnumberedKind::Sabm => {
                if self.state == LinkState::Disconnecting {
                    self.push_unnumbered(UnnumberedKind::Dm, poll_final);
                    return;
                }
                self.push_unnumbered(UnnumberedKind::Ua, poll_final);
                if self.state == LinkState::Connected {
                    info!("Peer reset the link");
                    self.go_down(DisconnectReason::PeerReset);
                }
                self.enter_connected(now);
            }
            UnnumberedKind::Ua => match self.state {
                LinkState::Connecting => self.enter_connected(now),
                LinkState::Disconnecting => self.finish_disconnect(),
                LinkState::Connected | LinkState::Disconnected => self.stats.duplicate_ignored(),
            },
            UnnumberedKind::Disc => match self.state {
                LinkState::Disconnected => self.push_unnumbered(UnnumberedKind::Dm, poll_final),
                LinkState::Disconnecting => {
                    self.push_unnumbered(UnnumberedKind::Ua, poll_final);
                    self.finish_disconnect();
                }
                LinkState::Connected | LinkState::Connecting => {
                    info!("Peer disconnected");
                    self.push_unnumbered(UnnumberedKind::Ua, poll_final);
                    self.go_down(DisconnectReason::PeerDisconnected);
                }
            },
            UnnumberedKind::Dm => match self.state {
                LinkState::Connecting => {
                    info!("Peer refused connection");
                    self.go_down(DisconnectReason::ConnectRefused);
                }
                LinkState::Connected => {
                    warn!("Peer reports disconnected mode");
                    self.go_down(DisconnectReason::ProtocolError);
                }
                LinkState::Disconnecting => self.finish_disconnect(),
                LinkState::Disconnected => self.stats.duplicate_ignored(),
            },
            UnnumberedKind::Frmr => {
                if self.state == LinkState::Connected {
                    warn!(info = %hex::encode(&payload), "Peer rejected a frame");
                    self.go_down(DisconnectReason::ProtocolError);
                } else {
                    self.stats.duplicate_ignored();
                }
            }
            UnnumberedKind::Ui => {
                self.stats.payload_delivered();
                self.events.push_back(Packet::Data(DataPacket {
                    payload,
                    reliable: false,
                    direction: Direction::Received,
                }));
            }
            UnnumberedKind::Test => {
                if poll_final {
                    self.transmit.push_back(Frame {
                        address: self.profile.address,
                        control: Control::Unnumbered {
                            kind: UnnumberedKind::Test,
                            poll_final: true,
                        },
                        payload,
                    });
                }
            }
        }
    }

    fn on_supervisory(&mut self, kind: SupervisoryKind, nr: u8, poll_final: bool, now: Instant) {
        if self.state != LinkState::Connected {
            self.stats.duplicate_ignored();
            return;
        }
        self.answer_poll(poll_final, now);

        let was_busy = self.peer_busy;
        self.peer_busy = kind == SupervisoryKind::ReceiveNotReady;

        let Some(acked) = self.acknowledge(nr, now) else {
            return;
        };
        match kind {
            SupervisoryKind::Reject => {
                self.stats.reject_received();
                debug!(nr, "Peer rejected, going back");
                self.retransmit_queue();
                if !self.queue.is_empty() {
                    self.t1 = Some(now + self.profile.t1);
                }
            }
            SupervisoryKind::ReceiveReady => {
                if was_busy {
                    self.transmit_unsent(now);
                } else if acked == 0 && !poll_final {
                    self.stats.duplicate_ignored();
                }
            }
            SupervisoryKind::ReceiveNotReady => {
                if !was_busy {
                    debug!("Peer busy");
                }
            }
        }
    }

    fn on_information(&mut self, ns: u8, nr: u8, poll: bool, payload: Bytes, now: Instant) {
        if self.state != LinkState::Connected {
            if self.state == LinkState::Disconnected {
                self.push_unnumbered(UnnumberedKind::Dm, poll);
            } else {
                self.stats.duplicate_ignored();
            }
            return;
        }
        self.acknowledge(nr, now);

        if ns == self.vr {
            self.vr = seq_next(self.vr);
            self.reject_sent = false;
            self.ack_pending = true;
            self.stats.payload_delivered();
            self.events.push_back(Packet::Data(DataPacket::received(payload)));
            if poll {
                self.push_supervisory(SupervisoryKind::ReceiveReady, true);
            }
        } else {
            self.stats.out_of_sequence();
            trace!(ns, expected = self.vr, "Out of sequence");
            if !self.reject_sent {
                self.reject_sent = true;
                self.stats.reject_sent();
                self.push_supervisory(SupervisoryKind::Reject, poll);
            } else if poll {
                self.push_supervisory(SupervisoryKind::ReceiveReady, true);
            }
        }
    }

    fn send_poll(&mut self, now: Instant) {
        self.poll_outstanding = Some(now + self.profile.t1);
        self.push_supervisory(SupervisoryKind::ReceiveReady, true);
    }

    /// A late P/F is the peer polling us, not a reply to our poll
    fn answer_poll(&mut self, poll_final: bool, now: Instant) {
        if !poll_final {
            return;
        }
        match self.poll_outstanding.take() {
            Some(answer_by) if now <= answer_by => {}
            _ => self.push_supervisory(SupervisoryKind::ReceiveReady, true),
        }
    }

    /// Apply a cumulative acknowledgment N(R)
    ///
    /// Returns how many frames it released, or `None` when N(R) lies outside
    /// the window of outstanding frames.
    fn acknowledge(&mut self, nr: u8, now: Instant) -> Option<usize> {
        let va = self.queue.front().map_or(self.vs, |entry| entry.seq);
        let span = seq_distance(va, self.vs);
        let acked = seq_distance(va, nr);
        if acked > span {
            self.stats.duplicate_ignored();
            debug!(nr, va, vs = self.vs, "Stale acknowledgment ignored");
            return None;
        }
        for _ in 0..acked {
            self.queue.pop_front();
        }
        if acked > 0 {
            self.retries = 0;
            self.t1 = if self.queue.is_empty() {
                None
            } else {
                Some(now + self.profile.t1)
            };
        }
        Some(usize::from(acked))
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn on_t1_expired(&mut self, now: Instant) {
        self.retries += 1;
        let exhausted = self.retries >= self.profile.n2;
        match self.state {
            LinkState::Connecting => {
                if exhausted {
                    warn!(attempts = self.retries, "No answer to SABM");
                    self.go_down(DisconnectReason::ConnectFailed);
                } else {
                    self.push_unnumbered(UnnumberedKind::Sabm, true);
                    self.t1 = Some(now + self.profile.t1);
                }
            }
            LinkState::Connected => {
                if self.queue.is_empty() {
                    self.t1 = None;
                } else if exhausted {
                    warn!(attempts = self.retries, "Retransmission limit reached");
                    self.stats.link_failure();
                    self.go_down(DisconnectReason::LinkFailed);
                } else {
                    if self.peer_busy {
                        self.send_poll(now);
                    } else {
                        debug!(outstanding = self.queue.len(), "T1 expired, retransmitting");
                        self.retransmit_queue();
                    }
                    self.t1 = Some(now + self.profile.t1);
                }
            }
            LinkState::Disconnecting => {
                if exhausted {
                    self.finish_disconnect();
                } else {
                    self.push_unnumbered(UnnumberedKind::Disc, true);
                    self.t1 = Some(now + self.profile.t1);
                }
            }
            LinkState::Disconnected => self.t1 = None,
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn enter_connected(&mut self, now: Instant) {
        info!("Link connected");
        self.state = LinkState::Connected;
        self.vs = 0;
        self.vr = 0;
        self.queue.clear();
        self.t1 = None;
        self.retries = 0;
        self.peer_busy = false;
        self.reject_sent = false;
        self.ack_pending = false;
        self.poll_outstanding = None;
        self.alive.arm(now);
        self.stats.connected();
        self.events.push_back(Packet::Control(ControlPacket::Connected));

        while let Some(payload) = self.pending.pop_front() {
            self.enqueue(payload, now);
        }
    }

    /// Drop every queued payload and report the link down
    fn go_down(&mut self, reason: DisconnectReason) {
        let failed = self.queue.len() + self.pending.len() + self.unsent_ui;
        if failed > 0 {
            debug!(failed, "Dropping unacknowledged payloads");
            self.stats.sends_failed(failed);
        }
        self.queue.clear();
        self.pending.clear();
        self.unsent_ui = 0;
        self.transmit.retain(|frame| {
            !frame.is_information()
                && !matches!(
                    frame.control,
                    Control::Unnumbered {
                        kind: UnnumberedKind::Ui,
                        ..
                    }
                )
        });
        self.state = LinkState::Disconnected;
        self.t1 = None;
        self.retries = 0;
        self.peer_busy = false;
        self.ack_pending = false;
        self.poll_outstanding = None;
        self.alive.disarm();
        self.events.push_back(Packet::Control(ControlPacket::Disconnected(reason)));
        self.flow.wake_all();
    }

    fn finish_disconnect(&mut self) {
        debug!("Link disconnected");
        self.state = LinkState::Disconnected;
        self.t1 = None;
        self.retries = 0;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn transmit_unsent(&mut self, now: Instant) {
        let address = self.profile.address;
        let mut sent = Vec::new();
        for entry in self.queue.iter_mut().filter(|entry| entry.tx_count == 0) {
            entry.tx_count = 1;
            self.transmit
                .push_back(Frame::information(address, entry.seq, self.vr, entry.payload.clone()));
            sent.push(entry.payload.clone());
        }
        for payload in sent {
            self.echo_sent(payload, true);
        }
        if self.t1.is_none() && !self.queue.is_empty() {
            self.t1 = Some(now + self.profile.t1);
        }
    }

    fn retransmit_queue(&mut self) {
        let address = self.profile.address;
        let mut first_time = Vec::new();
        for entry in &mut self.queue {
            if entry.tx_count == 0 {
                first_time.push(entry.payload.clone());
            } else {
                self.stats.retransmission();
            }
            entry.tx_count += 1;
            self.transmit
                .push_back(Frame::information(address, entry.seq, self.vr, entry.payload.clone()));
        }
        for payload in first_time {
            self.echo_sent(payload, true);
        }
    }

    fn echo_sent(&mut self, payload: Bytes, reliable: bool) {
        self.stats.payload_sent();
        self.events.push_back(Packet::Data(DataPacket {
            payload,
            reliable,
            direction: Direction::Sent,
        }));
    }

    fn push_unnumbered(&mut self, kind: UnnumberedKind, poll_final: bool) {
        self.transmit
            .push_back(Frame::unnumbered(self.profile.address, kind, poll_final));
    }

    fn push_supervisory(&mut self, kind: SupervisoryKind, poll_final: bool) {
        self.transmit
            .push_back(Frame::supervisory(self.profile.address, kind, self.vr, poll_final));
    }

    fn sync_flow(&self) {
        self.flow
            .set_outstanding(self.queue.len() + self.pending.len() + self.unsent_ui);
        self.flow.set_peer_busy(self.peer_busy);
    }

    fn publish_status(&mut self) {
        let status = PortStatus {
            alive: self.alive.is_alive(),
            connected: self.state == LinkState::Connected,
            flow_suspended: self.flow.is_suspended(),
        };
        if status != self.status {
            self.status = status;
            self.events.push_back(Packet::Control(ControlPacket::PortStatus(status)));
        }
    }
}
