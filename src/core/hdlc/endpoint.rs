//! Packet endpoint over a byte stream
//!
//! Binds a [`FrameParser`] and a [`ProtocolState`] to anything that is
//! `AsyncRead + AsyncWrite`: a serial device in production, an in-memory
//! duplex pipe in tests.

use super::codec::{FrameGenerator, FrameParser, ParseResult, FRAME_OVERHEAD};
use super::packet::{Direction, DisconnectReason, FrameTrace, LinkEvent, PortStatus};
use super::protocol::{LinkProfile, LinkState, ProtocolState, SubmitError};
use crate::core::flow::FlowGuard;
use crate::core::stats::LinkStatistics;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Encoded bytes held back from the stream before frames stay queued in
/// the protocol state
const TX_BUFFER_LIMIT: usize = 4096;

/// Endpoint failures; all of them end the use of the underlying stream
#[derive(Error, Debug)]
pub enum EndpointError {
    /// Read or write failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream reached end of file
    #[error("Stream closed")]
    Closed,
}

/// Reliable packet endpoint
pub struct PacketEndpoint<T> {
    reader: ReadHalf<T>,
    writer: WriteHalf<T>,
    parser: FrameParser,
    protocol: ProtocolState,
    rx_buf: BytesMut,
    tx_buf: BytesMut,
    tracing: bool,
    traces: VecDeque<FrameTrace>,
    stats: Arc<LinkStatistics>,
}

impl<T> PacketEndpoint<T>
where
    T: AsyncRead + AsyncWrite,
{
    /// Wrap `io`; the link starts disconnected
    pub fn new(io: T, profile: LinkProfile, stats: Arc<LinkStatistics>, flow: Arc<FlowGuard>) -> Self {
        let parser = FrameParser::with_options(profile.address.is_some(), profile.max_payload + FRAME_OVERHEAD);
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader,
            writer,
            parser,
            protocol: ProtocolState::new(profile, stats.clone(), flow),
            rx_buf: BytesMut::with_capacity(4096),
            tx_buf: BytesMut::with_capacity(TX_BUFFER_LIMIT),
            tracing: false,
            traces: VecDeque::new(),
            stats,
        }
    }

    /// Link state
    pub fn state(&self) -> LinkState {
        self.protocol.state()
    }

    /// Port status as last reported
    pub fn port_status(&self) -> PortStatus {
        self.protocol.port_status()
    }

    /// Start connection establishment
    pub fn connect(&mut self) {
        self.protocol.connect(Instant::now());
    }

    /// Take the link down
    pub fn disconnect(&mut self, reason: DisconnectReason) {
        self.protocol.disconnect(reason, Instant::now());
    }

    /// Hand a payload to the link. Never waits for acknowledgment.
    pub fn submit(&mut self, payload: Bytes, reliable: bool) -> Result<(), SubmitError> {
        self.protocol.submit(payload, reliable, Instant::now())
    }

    /// Also yield a [`LinkEvent::Frame`] for every valid frame on the line
    pub fn set_tracing(&mut self, enabled: bool) {
        self.tracing = enabled;
        if !enabled {
            self.traces.clear();
        }
    }

    /// Is anything still waiting to be written?
    pub fn has_pending_output(&self) -> bool {
        !self.tx_buf.is_empty()
    }

    /// Recover the byte stream
    pub fn into_inner(self) -> T
    where
        T: Unpin,
    {
        self.reader.unsplit(self.writer)
    }

    /// Next link event
    ///
    /// Drives transmission, reception and timers until something is ready
    /// for the consumer. Cancel safe: dropping the future loses no data.
    pub async fn next_event(&mut self) -> Result<LinkEvent, EndpointError> {
        loop {
            self.fill_tx();
            if let Some(event) = self.ready_event() {
                return Ok(event);
            }
            let deadline = self.protocol.next_deadline();

            tokio::select! {
                biased;

                written = self.writer.write(&self.tx_buf), if !self.tx_buf.is_empty() => {
                    let n = written?;
                    if n == 0 {
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    self.tx_buf.advance(n);
                }
                read = self.reader.read_buf(&mut self.rx_buf) => {
                    if read? == 0 {
                        return Err(EndpointError::Closed);
                    }
                    self.process_input();
                }
                () = sleep_until(deadline) => {
                    self.protocol.handle_timeout(Instant::now());
                }
            }
        }
    }

    /// Next event that is ready without any I/O
    pub fn poll_ready(&mut self) -> Option<LinkEvent> {
        self.fill_tx();
        self.ready_event()
    }

    /// Write out everything queued, e.g. a final DISC before closing
    pub async fn flush(&mut self) -> Result<(), EndpointError> {
        loop {
            self.fill_tx();
            if self.tx_buf.is_empty() {
                break;
            }
            let n = self.writer.write(&self.tx_buf).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            self.tx_buf.advance(n);
        }
        self.writer.flush().await?;
        Ok(())
    }

    fn fill_tx(&mut self) {
        while self.tx_buf.len() < TX_BUFFER_LIMIT {
            let Some(frame) = self.protocol.poll_transmit() else {
                break;
            };
            let before = self.tx_buf.len();
            let raw = FrameGenerator::encode(&frame, &mut self.tx_buf);
            self.stats.frame_sent(self.tx_buf.len() - before);
            trace!(frame = %frame, "Sending");
            if self.tracing {
                self.traces.push_back(FrameTrace {
                    direction: Direction::Sent,
                    frame,
                    raw,
                });
            }
        }
    }

    fn process_input(&mut self) {
        let data = self.rx_buf.split();
        self.stats.bytes_received(data.len());
        let now = Instant::now();
        for result in self.parser.push(&data) {
            match result {
                ParseResult::Frame { frame, raw } => {
                    if self.tracing {
                        self.traces.push_back(FrameTrace {
                            direction: Direction::Received,
                            frame: frame.clone(),
                            raw,
                        });
                    }
                    self.protocol.handle_frame(frame, now);
                }
                ParseResult::Discarded(reason) => {
                    debug!(%reason, "Frame discarded");
                    self.stats.discarded(reason);
                }
            }
        }
    }

    fn ready_event(&mut self) -> Option<LinkEvent> {
        if let Some(trace) = self.traces.pop_front() {
            return Some(LinkEvent::Frame(trace));
        }
        self.protocol.poll_event().map(LinkEvent::Packet)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
