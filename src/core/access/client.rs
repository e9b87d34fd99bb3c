//! One client session
//!
//! A session starts with a [`SessionHeader`] naming the device. The handler
//! then attaches to that device's link, reports the current port status and
//! shuttles packets both ways until either side goes away.
//!
//! Writes that the link cannot take right now are held, and the socket is
//! not read again until the link has room or comes back up.

use super::codec::{Inbound, SessionCodec, WireError, MAX_PACKET_PAYLOAD};
use super::header::{SessionHeader, SessionKind};
use super::registry::SessionTicket;
use crate::core::hdlc::packet::{
    ControlPacket, DataPacket, DisconnectReason, FrameTrace, LinkEvent, Packet, PortStatus,
};
use crate::core::hdlc::protocol::SubmitError;
use crate::core::serial::handler::{AttachGuard, Attachment, ClientId, LinkError, LinkHandle};
use crate::core::serial::registry::SerialPortHandlerCollection;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// What to do with a client that cannot keep up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Skip the lost packets and tell the client how many
    #[default]
    DropAndNotify,
    /// Close the session
    Disconnect,
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Time allowed for the session header
    pub header_timeout: Duration,
    /// Reaction to a lagging client
    pub overflow_policy: OverflowPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            header_timeout: Duration::from_secs(5),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

/// Reasons a session ends early
#[derive(Error, Debug)]
pub enum SessionError {
    /// Malformed traffic or socket failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Header did not arrive in time
    #[error("No session header within {0:?}")]
    HeaderTimeout(Duration),

    /// Header names a device nobody serves
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Write or reset on a read-only session
    #[error("Session is read-only")]
    ReadOnly,

    /// Payload on a session kind that carries none
    #[error("{0} sessions cannot send payloads")]
    NoPayload(SessionKind),

    /// Client fell too far behind
    #[error("Client fell behind by {0} packets")]
    Overflow(u64),

    /// Link refused the session
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Remembers the port status last shown to a client
#[derive(Debug, Default)]
pub struct AliveGuard {
    last: Option<PortStatus>,
}

impl AliveGuard {
    /// Nothing shown yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status`; returns it if the client has not seen it yet
    pub fn update(&mut self, status: PortStatus) -> Option<PortStatus> {
        if self.last == Some(status) {
            return None;
        }
        self.last = Some(status);
        Some(status)
    }

    /// Status last shown
    pub fn last(&self) -> Option<PortStatus> {
        self.last
    }
}

/// Why a held write is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blocked {
    Busy,
    NotConnected,
}

/// Handler of one client connection
pub struct ClientHandler<S> {
    id: ClientId,
    ticket: SessionTicket,
    framed: Framed<S, SessionCodec>,
    links: Arc<SerialPortHandlerCollection>,
    settings: ClientSettings,
}

impl<S> ClientHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handler for a freshly accepted stream registered as `ticket`
    pub fn new(
        ticket: SessionTicket,
        stream: S,
        links: Arc<SerialPortHandlerCollection>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            id: ticket.id(),
            ticket,
            framed: Framed::new(stream, SessionCodec::new()),
            links,
            settings,
        }
    }

    /// Session id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Serve the session to its end
    pub async fn run(mut self) -> Result<(), SessionError> {
        let header = match self.read_header().await? {
            Some(header) => header,
            None => return Ok(()),
        };
        let link = self
            .links
            .get(&header.device)
            .ok_or_else(|| SessionError::UnknownDevice(header.device.clone()))?;
        self.ticket.set_device(link.device());

        info!(
            client = %self.id,
            peer = %self.ticket.peer(),
            device = %link.device(),
            kind = %header.kind,
            access = ?header.access,
            "Session started"
        );

        let attachment = Attachment {
            access: header.access,
            wants_frames: header.kind.wants_frames(),
        };
        let id = self.id;
        link.attached(id, attachment, |guard| self.session(guard, &header))
            .await??;
        Ok(())
    }

    async fn read_header(&mut self) -> Result<Option<SessionHeader>, SessionError> {
        let timeout = self.settings.header_timeout;
        let next = tokio::select! {
            () = self.ticket.cancel_token().cancelled() => return Ok(None),
            next = tokio::time::timeout(timeout, self.framed.next()) => next,
        };
        match next {
            Err(_) => Err(SessionError::HeaderTimeout(timeout)),
            Ok(None) => Ok(None),
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(Some(Ok(Inbound::Header(header)))) => Ok(Some(header)),
            Ok(Some(Ok(Inbound::Packet(_)))) => Ok(None),
        }
    }

    async fn session(&mut self, mut guard: AttachGuard, header: &SessionHeader) -> Result<(), SessionError> {
        let link = guard.handle().clone();
        let mut status = link.status_updates();
        let mut alive = AliveGuard::new();
        let mut held: Option<(DataPacket, Blocked)> = None;

        let initial = *status.borrow_and_update();
        self.send_status(&mut alive, initial).await?;

        loop {
            tokio::select! {
                biased;

                () = self.ticket.cancel_token().cancelled() => {
                    return self.drain(&mut guard, header, &mut alive).await;
                }
                event = guard.events().recv() => match event {
                    Ok(event) => {
                        if self.forward(event, header, &mut alive).await? {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Lagged(dropped)) => {
                        link.stats().client_overflow();
                        warn!(client = %self.id, dropped, "Client fell behind");
                        match self.settings.overflow_policy {
                            OverflowPolicy::DropAndNotify => {
                                let dropped = u32::try_from(dropped).unwrap_or(u32::MAX);
                                self.framed.send(ControlPacket::Overflow { dropped }.into()).await?;
                            }
                            OverflowPolicy::Disconnect => return Err(SessionError::Overflow(dropped)),
                        }
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                () = wait_for_room(&link, &mut status, held.as_ref().map(|(_, why)| *why)), if held.is_some() => {
                    if let Some((data, _)) = held.take() {
                        held = self.submit(&link, data).await?;
                    }
                }
                inbound = self.framed.next(), if held.is_none() => match inbound {
                    None => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(Inbound::Header(_))) => {}
                    Some(Ok(Inbound::Packet(Packet::Data(data)))) => {
                        if header.kind != SessionKind::Payload {
                            return Err(SessionError::NoPayload(header.kind));
                        }
                        if !header.access.may_write() {
                            return Err(SessionError::ReadOnly);
                        }
                        held = self.submit(&link, data).await?;
                    }
                    Some(Ok(Inbound::Packet(Packet::Control(control)))) => {
                        self.handle_control(&link, header, control).await?;
                    }
                },
                () = link.stopped() => return Ok(()),
            }
        }
    }

    /// Forward a link event if the session wants it. Returns `true` once
    /// the link has shut down.
    async fn forward(
        &mut self,
        event: LinkEvent,
        header: &SessionHeader,
        alive: &mut AliveGuard,
    ) -> Result<bool, SessionError> {
        if !header.wants(&event) {
            return Ok(false);
        }
        let packet = match event {
            LinkEvent::Packet(Packet::Control(ControlPacket::PortStatus(status))) => {
                self.send_status(alive, status).await?;
                return Ok(false);
            }
            LinkEvent::Packet(packet) => packet,
            LinkEvent::Frame(trace) => Packet::Data(DataPacket {
                payload: trace_payload(header.kind, &trace),
                reliable: trace.frame.is_information(),
                direction: trace.direction,
            }),
        };
        let shutdown = packet == Packet::Control(ControlPacket::Disconnected(DisconnectReason::Shutdown));
        self.framed.send(packet).await?;
        Ok(shutdown)
    }

    /// Forward what the link already queued for this session
    async fn drain(
        &mut self,
        guard: &mut AttachGuard,
        header: &SessionHeader,
        alive: &mut AliveGuard,
    ) -> Result<(), SessionError> {
        loop {
            match guard.events().try_recv() {
                Ok(event) => {
                    if self.forward(event, header, alive).await? {
                        return Ok(());
                    }
                }
                Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn send_status(&mut self, alive: &mut AliveGuard, status: PortStatus) -> Result<(), SessionError> {
        if let Some(status) = alive.update(status) {
            self.framed.send(ControlPacket::PortStatus(status).into()).await?;
        }
        Ok(())
    }

    /// Hand `data` to the link; returns it back if it has to wait
    async fn submit(
        &mut self,
        link: &LinkHandle,
        data: DataPacket,
    ) -> Result<Option<(DataPacket, Blocked)>, SessionError> {
        match link.submit(self.id, data.payload.clone(), data.reliable).await {
            Ok(()) => Ok(None),
            Err(LinkError::Submit(SubmitError::Busy)) => Ok(Some((data, Blocked::Busy))),
            Err(LinkError::Submit(SubmitError::NotConnected)) => {
                debug!(client = %self.id, "Link down, holding write");
                Ok(Some((data, Blocked::NotConnected)))
            }
            Err(LinkError::Submit(SubmitError::TooLarge { len, max })) => {
                warn!(client = %self.id, len, max, "Payload too large, dropped");
                Ok(None)
            }
            Err(LinkError::Submit(SubmitError::ReadOnly)) => Err(SessionError::ReadOnly),
            Err(err) => Err(err.into()),
        }
    }

    async fn handle_control(
        &mut self,
        link: &LinkHandle,
        header: &SessionHeader,
        control: ControlPacket,
    ) -> Result<(), SessionError> {
        match control {
            ControlPacket::Echo => {
                self.framed.send(ControlPacket::Echo.into()).await?;
            }
            ControlPacket::KeepAlive => {
                debug!(client = %self.id, "Keepalive");
            }
            ControlPacket::PortReset => {
                if !header.access.may_write() {
                    return Err(SessionError::ReadOnly);
                }
                match link.reset(self.id).await {
                    Ok(()) => {}
                    Err(LinkError::Submit(SubmitError::ReadOnly)) => return Err(SessionError::ReadOnly),
                    Err(err) => return Err(err.into()),
                }
            }
            other => {
                debug!(client = %self.id, ?other, "Ignoring control packet from client");
            }
        }
        Ok(())
    }
}

/// Resolve once a write held for `blocked` may be retried
async fn wait_for_room(link: &LinkHandle, status: &mut watch::Receiver<PortStatus>, blocked: Option<Blocked>) {
    match blocked {
        Some(Blocked::Busy) => link.flow().capacity_available().await,
        Some(Blocked::NotConnected) => loop {
            if status.borrow_and_update().connected {
                return;
            }
            if status.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

/// Trace text or raw body, cut to what one data packet carries
fn trace_payload(kind: SessionKind, trace: &FrameTrace) -> Bytes {
    let mut payload = match kind {
        SessionKind::Dissected => Bytes::from(trace.frame.to_string()),
        _ => trace.raw.clone(),
    };
    payload.truncate(MAX_PACKET_PAYLOAD);
    payload
}
