//! Helpers shared by the integration tests

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use hdlcd_core::core::flow::FlowGuard;
use hdlcd_core::core::hdlc::packet::Direction;
use hdlcd_core::core::hdlc::{
    Control, Frame, FrameGenerator, FrameParser, LinkEvent, LinkProfile, LinkState, Packet, PacketEndpoint,
    ParseResult, SubmitError, UnnumberedKind,
};
use hdlcd_core::core::stats::LinkStatistics;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Profile with a short retransmission timer
pub fn fast_profile() -> LinkProfile {
    LinkProfile::default().t1(Duration::from_millis(40)).n2(5)
}

pub fn endpoint(io: DuplexStream, profile: LinkProfile) -> (PacketEndpoint<DuplexStream>, Arc<LinkStatistics>) {
    let stats = Arc::new(LinkStatistics::new());
    let window = usize::from(profile.window);
    let endpoint = PacketEndpoint::new(io, profile, stats.clone(), Arc::new(FlowGuard::new(window, window)));
    (endpoint, stats)
}

/// Delimited, escaped form of `frame`
pub fn wire(frame: &Frame) -> BytesMut {
    let mut out = BytesMut::new();
    FrameGenerator::encode(frame, &mut out);
    out
}

pub fn is_sabm(frame: &Frame) -> bool {
    matches!(
        frame.control,
        Control::Unnumbered {
            kind: UnnumberedKind::Sabm,
            ..
        }
    )
}

/// The device on the far end of a serial line, as a running task
pub struct Peer {
    /// Payloads for the peer to send reliably
    pub outgoing: mpsc::UnboundedSender<Bytes>,
    /// Payloads the peer received
    pub received: mpsc::UnboundedReceiver<Bytes>,
}

/// Run a passive endpoint on `io`; it accepts whatever connects to it
///
/// Outgoing payloads wait in a backlog while the send window is full.
pub fn spawn_peer(io: DuplexStream, profile: LinkProfile) -> Peer {
    let (outgoing, mut to_send) = mpsc::unbounded_channel::<Bytes>();
    let (delivered, received) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let window = usize::from(profile.window);
        let flow = Arc::new(FlowGuard::new(window, window));
        let mut endpoint = PacketEndpoint::new(io, profile, Arc::new(LinkStatistics::new()), flow.clone());
        let mut backlog = VecDeque::new();
        loop {
            let connected = endpoint.state() == LinkState::Connected;
            while connected {
                let Some(payload) = backlog.front().cloned() else {
                    break;
                };
                match endpoint.submit(payload, true) {
                    Ok(()) => {
                        backlog.pop_front();
                    }
                    Err(SubmitError::Busy) => break,
                    Err(err) => panic!("peer submit: {err}"),
                }
            }
            tokio::select! {
                event = endpoint.next_event() => match event {
                    Ok(LinkEvent::Packet(Packet::Data(data))) if data.direction == Direction::Received => {
                        if delivered.send(data.payload).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
                Some(payload) = to_send.recv() => backlog.push_back(payload),
                () = flow.capacity_available(), if connected && !backlog.is_empty() => {}
            }
        }
    });
    Peer { outgoing, received }
}

/// A peer that completes the handshake and then never answers again
pub fn spawn_mute_peer(mut io: DuplexStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut parser = FrameParser::new();
        let mut answered = false;
        let mut buf = [0u8; 512];
        loop {
            let n = match io.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for result in parser.push(&buf[..n]) {
                if let ParseResult::Frame { frame, .. } = result {
                    if !answered && is_sabm(&frame) {
                        answered = true;
                        let ua = Frame::unnumbered(frame.address, UnnumberedKind::Ua, true);
                        if io.write_all(&wire(&ua)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Pass frames from `from` to `to`, dropping those `drop_frame` picks
///
/// Frames are parsed and re-serialized, so only complete, valid frames
/// make it across.
pub fn spawn_filter(
    mut from: tokio::io::ReadHalf<DuplexStream>,
    mut to: tokio::io::WriteHalf<DuplexStream>,
    mut drop_frame: impl FnMut(&Frame) -> bool + Send + 'static,
) {
    tokio::spawn(async move {
        let mut parser = FrameParser::new();
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            buf.clear();
            match from.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            for result in parser.push(&buf) {
                if let ParseResult::Frame { frame, .. } = result {
                    if drop_frame(&frame) {
                        continue;
                    }
                    if to.write_all(&wire(&frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}

/// Two endpoints' streams joined through a relay; frames travelling from
/// the first to the second pass through `drop_frame`
pub fn lossy_line(
    drop_frame: impl FnMut(&Frame) -> bool + Send + 'static,
) -> (DuplexStream, DuplexStream) {
    let (left, left_relay) = tokio::io::duplex(16 * 1024);
    let (right, right_relay) = tokio::io::duplex(16 * 1024);
    let (left_read, left_write) = tokio::io::split(left_relay);
    let (right_read, right_write) = tokio::io::split(right_relay);
    spawn_filter(left_read, right_write, drop_frame);
    spawn_filter(right_read, left_write, |_| false);
    (left, right)
}
