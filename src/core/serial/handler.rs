//! Serial port handler
//!
//! One task per serial device. The task is the only owner of the device
//! and of its [`PacketEndpoint`]; everybody else talks to it through a
//! cloneable [`LinkHandle`]:
//!
//! - submissions and port resets go in over an `mpsc` command queue, in
//!   the order they are accepted
//! - link events fan out over a `broadcast` channel, so every attached
//!   client sees the same sequence
//! - the current [`PortStatus`] is kept in a `watch` channel
//!
//! The task reopens the device after I/O errors and reconnects after link
//! failures, both paced by a [`RecoveryPolicy`].

use super::baud::{BaudRate, BaudSelection};
use super::lock::{LockError, SerialPortLock};
use super::recovery::{Backoff, RecoveryPolicy};
use crate::core::access::header::AccessMode;
use crate::core::flow::FlowGuard;
use crate::core::hdlc::endpoint::PacketEndpoint;
use crate::core::hdlc::packet::{ControlPacket, DisconnectReason, LinkEvent, Packet, PortStatus};
use crate::core::hdlc::protocol::{LinkProfile, LinkState, SubmitError};
use crate::core::stats::LinkStatistics;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Time allowed for the final DISC to reach the wire
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(250);

/// Depth of the command queue
const COMMAND_QUEUE: usize = 64;

/// Identifies one client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Link errors seen by callers of [`LinkHandle`] and at startup
#[derive(Error, Debug)]
pub enum LinkError {
    /// Device lock not available
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Device could not be opened
    #[error("Cannot open {device}: {source}")]
    Open {
        /// Device path
        device: String,
        /// Cause
        source: io::Error,
    },

    /// Submission refused by the link
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// Client id not in the attachment set
    #[error("Client is not attached")]
    NotAttached,

    /// Client id already in the attachment set
    #[error("Client {0} is already attached")]
    AlreadyAttached(ClientId),

    /// No link for this device
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A link for this device is already running
    #[error("Device {0} is already served")]
    DuplicateDevice(String),

    /// The link task has stopped
    #[error("Link closed")]
    Closed,
}

/// Opens serial devices
///
/// Implemented for real devices by [`SerialOpener`] and for closures, which
/// is how tests hand in in-memory streams.
pub trait PortOpener: Send + Sync + 'static {
    /// Opened device
    type Port: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open `device` at `baud`
    fn open(&self, device: &str, baud: u32) -> io::Result<Self::Port>;
}

/// Opens real serial devices, 8N1 without flow control
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    type Port = SerialStream;

    fn open(&self, device: &str, baud: u32) -> io::Result<SerialStream> {
        let port = tokio_serial::new(device, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        Ok(port)
    }
}

impl<F, P> PortOpener for F
where
    F: Fn(&str, u32) -> io::Result<P> + Send + Sync + 'static,
    P: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Port = P;

    fn open(&self, device: &str, baud: u32) -> io::Result<P> {
        self(device, baud)
    }
}

/// Everything needed to run one link
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Device path
    pub device: String,
    /// Baud rate selection
    pub baud: BaudSelection,
    /// Link protocol parameters
    pub profile: LinkProfile,
    /// Queue length at which submissions are refused
    pub high_water: usize,
    /// Reopen / reconnect pacing
    pub recovery: RecoveryPolicy,
    /// Events a client may fall behind before it overflows
    pub event_buffer: usize,
    /// Period of the statistics log line, `None` to disable
    pub stats_interval: Option<Duration>,
}

impl LinkSettings {
    /// Defaults for `device`
    pub fn new(device: impl Into<String>) -> Self {
        let profile = LinkProfile::default();
        Self {
            device: device.into(),
            baud: BaudSelection::default(),
            high_water: usize::from(profile.window),
            profile,
            recovery: RecoveryPolicy::default(),
            event_buffer: 256,
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Requests to the link task
#[derive(Debug)]
pub enum LinkCommand {
    /// Hand a payload to the link
    Submit {
        /// Submitting client
        client: ClientId,
        /// Payload
        payload: Bytes,
        /// I-frame or UI-frame
        reliable: bool,
        /// Accepted or refused
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    /// Close and reopen the device
    Reset {
        /// Requesting client
        client: ClientId,
        /// Accepted or refused
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
}

/// What an attached client is allowed and wants to see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    /// Access mode of the session
    pub access: AccessMode,
    /// Session wants frame traces
    pub wants_frames: bool,
}

struct LinkShared {
    device: String,
    commands: mpsc::Sender<LinkCommand>,
    events: broadcast::Sender<LinkEvent>,
    status: watch::Receiver<PortStatus>,
    frame_watchers: watch::Sender<usize>,
    flow: Arc<FlowGuard>,
    stats: Arc<LinkStatistics>,
    attachments: Mutex<HashMap<ClientId, Attachment>>,
    stopped: CancellationToken,
}

/// Cloneable access to a running link
#[derive(Clone)]
pub struct LinkHandle {
    inner: Arc<LinkShared>,
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("device", &self.inner.device)
            .field("attached", &self.attached_count())
            .finish()
    }
}

impl LinkHandle {
    /// Device this link runs on
    pub fn device(&self) -> &str {
        &self.inner.device
    }

    /// Current port status
    pub fn status(&self) -> PortStatus {
        *self.inner.status.borrow()
    }

    /// Port status updates
    pub fn status_updates(&self) -> watch::Receiver<PortStatus> {
        self.inner.status.clone()
    }

    /// Send queue observer
    pub fn flow(&self) -> &Arc<FlowGuard> {
        &self.inner.flow
    }

    /// Link counters
    pub fn stats(&self) -> &Arc<LinkStatistics> {
        &self.inner.stats
    }

    /// Number of attached clients
    pub fn attached_count(&self) -> usize {
        self.inner.attachments.lock().len()
    }

    /// Is `client` attached?
    pub fn is_attached(&self, client: ClientId) -> bool {
        self.inner.attachments.lock().contains_key(&client)
    }

    /// Has the link task stopped?
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    /// Resolves once the link task has stopped
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await
    }

    /// Add `client` to the attachment set and subscribe it to link events
    ///
    /// The client stays attached until the returned guard is dropped.
    pub fn attach(&self, client: ClientId, attachment: Attachment) -> Result<AttachGuard, LinkError> {
        if self.is_stopped() {
            return Err(LinkError::Closed);
        }
        let events = {
            let mut attachments = self.inner.attachments.lock();
            if attachments.contains_key(&client) {
                return Err(LinkError::AlreadyAttached(client));
            }
            attachments.insert(client, attachment);
            self.inner.events.subscribe()
        };
        if attachment.wants_frames {
            self.inner.frame_watchers.send_modify(|count| *count += 1);
        }
        debug!(device = %self.inner.device, %client, ?attachment, "Client attached");
        Ok(AttachGuard {
            handle: self.clone(),
            client,
            events,
        })
    }

    /// Run `body` while `client` is attached, detaching afterwards
    pub async fn attached<F, Fut, R>(
        &self,
        client: ClientId,
        attachment: Attachment,
        body: F,
    ) -> Result<R, LinkError>
    where
        F: FnOnce(AttachGuard) -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = self.attach(client, attachment)?;
        Ok(body(guard).await)
    }

    fn detach(&self, client: ClientId) {
        let removed = self.inner.attachments.lock().remove(&client);
        if let Some(attachment) = removed {
            if attachment.wants_frames {
                self.inner
                    .frame_watchers
                    .send_modify(|count| *count = count.saturating_sub(1));
            }
            debug!(device = %self.inner.device, %client, "Client detached");
        }
    }

    /// Hand a payload to the link
    ///
    /// Resolves as soon as the link accepted or refused it; never waits for
    /// the peer's acknowledgment.
    pub async fn submit(&self, client: ClientId, payload: Bytes, reliable: bool) -> Result<(), LinkError> {
        let (reply, response) = oneshot::channel();
        self.request(LinkCommand::Submit {
            client,
            payload,
            reliable,
            reply,
        })
        .await?;
        response.await.map_err(|_| LinkError::Closed)?
    }

    /// Ask the link to close and reopen the device
    pub async fn reset(&self, client: ClientId) -> Result<(), LinkError> {
        let (reply, response) = oneshot::channel();
        self.request(LinkCommand::Reset { client, reply }).await?;
        response.await.map_err(|_| LinkError::Closed)?
    }

    async fn request(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| LinkError::Closed)
    }
}

/// Membership of one client in a link's attachment set
pub struct AttachGuard {
    handle: LinkHandle,
    client: ClientId,
    events: broadcast::Receiver<LinkEvent>,
}

impl AttachGuard {
    /// Attached client
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Link the client is attached to
    pub fn handle(&self) -> &LinkHandle {
        &self.handle
    }

    /// Link events since attaching
    pub fn events(&mut self) -> &mut broadcast::Receiver<LinkEvent> {
        &mut self.events
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.handle.detach(self.client);
    }
}

/// How a served device ended
enum Served {
    Shutdown,
    Reopen { immediately: bool },
}

/// Why a wait ended
enum Wake {
    Elapsed,
    Reset,
    Cancelled,
}

/// Link task for one device
pub struct SerialPortHandler<O: PortOpener> {
    settings: LinkSettings,
    opener: O,
    lock: Option<SerialPortLock>,
    shared: Arc<LinkShared>,
    commands: mpsc::Receiver<LinkCommand>,
    status: watch::Sender<PortStatus>,
    frame_watchers: watch::Receiver<usize>,
    baud: BaudRate,
    backoff: Backoff,
    cancel: CancellationToken,
    link_up: bool,
    shutdown_announced: bool,
}

impl<O: PortOpener> SerialPortHandler<O> {
    /// Prepare the task for a locked device; nothing is opened yet
    pub fn new(
        settings: LinkSettings,
        opener: O,
        lock: SerialPortLock,
        cancel: CancellationToken,
    ) -> (Self, LinkHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (status, status_rx) = watch::channel(PortStatus::default());
        let (frame_watchers_tx, frame_watchers) = watch::channel(0usize);
        let flow = Arc::new(FlowGuard::new(
            usize::from(settings.profile.window),
            settings.high_water,
        ));

        let shared = Arc::new(LinkShared {
            device: settings.device.clone(),
            commands: commands_tx,
            events,
            status: status_rx,
            frame_watchers: frame_watchers_tx,
            flow,
            stats: Arc::new(LinkStatistics::new()),
            attachments: Mutex::new(HashMap::new()),
            stopped: CancellationToken::new(),
        });
        let handle = LinkHandle {
            inner: shared.clone(),
        };

        let handler = Self {
            baud: BaudRate::new(settings.baud),
            backoff: Backoff::new(settings.recovery.clone()),
            settings,
            opener,
            lock: Some(lock),
            shared,
            commands,
            status,
            frame_watchers,
            cancel,
            link_up: false,
            shutdown_announced: false,
        };
        (handler, handle)
    }

    /// Open the device at the current baud rate
    pub fn open_device(&self) -> Result<O::Port, LinkError> {
        self.opener
            .open(&self.settings.device, self.baud.current())
            .map_err(|source| LinkError::Open {
                device: self.settings.device.clone(),
                source,
            })
    }

    /// Serve the link on `port` until cancelled
    pub async fn run(mut self, port: O::Port) {
        info!(
            device = %self.settings.device,
            baud = self.baud.current(),
            "Link task started"
        );

        let mut next = Some(port);
        let mut immediately = true;
        loop {
            let port = match next.take() {
                Some(port) => port,
                None => match self.reopen(immediately).await {
                    Some(port) => port,
                    None => break,
                },
            };
            match self.serve(port).await {
                Served::Shutdown => break,
                Served::Reopen { immediately: now } => immediately = now,
            }
        }

        self.finish();
    }

    async fn serve(&mut self, port: O::Port) -> Served {
        let mut endpoint = PacketEndpoint::new(
            port,
            self.settings.profile.clone(),
            self.shared.stats.clone(),
            self.shared.flow.clone(),
        );
        endpoint.set_tracing(*self.frame_watchers.borrow_and_update() > 0);
        endpoint.connect();

        let mut reconnect_at: Option<Instant> = None;
        let mut stats_timer = self.settings.stats_interval.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.shutdown(&mut endpoint).await;
                    return Served::Shutdown;
                }
                changed = self.frame_watchers.changed() => {
                    if changed.is_ok() {
                        let watchers = *self.frame_watchers.borrow_and_update();
                        endpoint.set_tracing(watchers > 0);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Submit { client, payload, reliable, reply }) => {
                        let result = self
                            .check_access(client)
                            .and_then(|()| endpoint.submit(payload, reliable).map_err(LinkError::from));
                        let _ = reply.send(result);
                    }
                    Some(LinkCommand::Reset { client, reply }) => {
                        let result = self.check_access(client);
                        let accepted = result.is_ok();
                        let _ = reply.send(result);
                        if accepted {
                            info!(device = %self.settings.device, %client, "Port reset requested");
                            self.close(&mut endpoint, DisconnectReason::PortReset).await;
                            self.backoff.reset();
                            return Served::Reopen { immediately: true };
                        }
                    }
                    None => {
                        self.shutdown(&mut endpoint).await;
                        return Served::Shutdown;
                    }
                },
                () = sleep_until(reconnect_at) => {
                    reconnect_at = None;
                    debug!(device = %self.settings.device, "Reconnecting");
                    endpoint.connect();
                }
                event = endpoint.next_event() => match event {
                    Ok(event) => {
                        if let Some(served) = self.dispatch(event, &mut reconnect_at) {
                            return served;
                        }
                    }
                    Err(err) => {
                        warn!(device = %self.settings.device, %err, "Device failed");
                        self.device_lost(endpoint.state());
                        return Served::Reopen { immediately: false };
                    }
                },
                () = tick(&mut stats_timer) => self.log_stats(),
            }
        }
    }

    /// Forward one event to the clients and react to link transitions
    fn dispatch(&mut self, event: LinkEvent, reconnect_at: &mut Option<Instant>) -> Option<Served> {
        let mut followup = None;
        if let LinkEvent::Packet(Packet::Control(control)) = &event {
            match *control {
                ControlPacket::PortStatus(status) => {
                    self.status.send_replace(status);
                }
                ControlPacket::Connected => {
                    self.link_up = true;
                    self.backoff.reset();
                    info!(
                        device = %self.settings.device,
                        baud = self.baud.current(),
                        "Link connected"
                    );
                }
                ControlPacket::Disconnected(reason) => {
                    self.link_up = false;
                    if reason == DisconnectReason::Shutdown {
                        self.shutdown_announced = true;
                    }
                    info!(device = %self.settings.device, %reason, "Link disconnected");
                    followup = self.after_disconnect(reason, reconnect_at);
                }
                _ => {}
            }
        }
        let _ = self.shared.events.send(event);
        followup
    }

    fn after_disconnect(
        &mut self,
        reason: DisconnectReason,
        reconnect_at: &mut Option<Instant>,
    ) -> Option<Served> {
        match reason {
            DisconnectReason::Requested
            | DisconnectReason::PeerReset
            | DisconnectReason::DeviceError
            | DisconnectReason::PortReset
            | DisconnectReason::Shutdown => None,
            DisconnectReason::ConnectFailed | DisconnectReason::ConnectRefused
                if self.baud.is_auto() =>
            {
                self.baud.toggle();
                info!(
                    device = %self.settings.device,
                    baud = self.baud.current(),
                    "Trying next baud rate"
                );
                Some(Served::Reopen { immediately: true })
            }
            _ => {
                match self.backoff.next_delay() {
                    Some(delay) => {
                        debug!(device = %self.settings.device, ?delay, "Reconnect scheduled");
                        *reconnect_at = Some(Instant::now() + delay);
                    }
                    None => {
                        error!(
                            device = %self.settings.device,
                            "Recovery attempts exhausted, waiting for a port reset"
                        );
                    }
                }
                None
            }
        }
    }

    fn check_access(&self, client: ClientId) -> Result<(), LinkError> {
        match self.shared.attachments.lock().get(&client) {
            None => Err(LinkError::NotAttached),
            Some(attachment) if !attachment.access.may_write() => Err(SubmitError::ReadOnly.into()),
            Some(_) => Ok(()),
        }
    }

    /// Take the link down and push out what is left, keeping the lock
    async fn close(&mut self, endpoint: &mut PacketEndpoint<O::Port>, reason: DisconnectReason) {
        endpoint.disconnect(reason);
        let mut unused = None;
        while let Some(event) = endpoint.poll_ready() {
            self.dispatch(event, &mut unused);
        }
        match tokio::time::timeout(SHUTDOWN_FLUSH, endpoint.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(device = %self.settings.device, %err, "Final flush failed"),
            Err(_) => debug!(device = %self.settings.device, "Final flush timed out"),
        }
        self.device_lost(LinkState::Disconnected);
    }

    async fn shutdown(&mut self, endpoint: &mut PacketEndpoint<O::Port>) {
        info!(device = %self.settings.device, "Shutting down link");
        self.close(endpoint, DisconnectReason::Shutdown).await;
        self.release_lock();
    }

    /// The device went away; clear everything derived from it
    fn device_lost(&mut self, state: LinkState) {
        if self.link_up || state == LinkState::Connected {
            self.link_up = false;
            let _ = self
                .shared
                .events
                .send(ControlPacket::Disconnected(DisconnectReason::DeviceError).into());
        }
        self.shared.flow.set_outstanding(0);
        self.shared.flow.set_peer_busy(false);
        self.shared.flow.wake_all();
        self.publish_status(PortStatus::default());
    }

    fn publish_status(&self, status: PortStatus) {
        if self.status.send_replace(status) != status {
            let _ = self.shared.events.send(ControlPacket::PortStatus(status).into());
        }
    }

    async fn reopen(&mut self, immediately: bool) -> Option<O::Port> {
        let mut wait_first = !immediately;
        loop {
            if wait_first {
                let deadline = self
                    .backoff
                    .next_delay()
                    .map(|delay| Instant::now() + delay);
                if deadline.is_none() {
                    error!(
                        device = %self.settings.device,
                        "Recovery attempts exhausted, waiting for a port reset"
                    );
                }
                match self.wait(deadline).await {
                    Wake::Elapsed => {}
                    Wake::Reset => self.backoff.reset(),
                    Wake::Cancelled => return None,
                }
            }
            wait_first = true;

            let baud = self.baud.current();
            match self.opener.open(&self.settings.device, baud) {
                Ok(port) => {
                    info!(device = %self.settings.device, baud, "Device reopened");
                    return Some(port);
                }
                Err(err) => {
                    warn!(device = %self.settings.device, baud, %err, "Cannot reopen device");
                }
            }
        }
    }

    /// Wait for `deadline` without a device, refusing submissions
    async fn wait(&mut self, deadline: Option<Instant>) -> Wake {
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Wake::Cancelled,
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Submit { reply, .. }) => {
                        self.shared.stats.submission_rejected();
                        let _ = reply.send(Err(SubmitError::NotConnected.into()));
                    }
                    Some(LinkCommand::Reset { client, reply }) => {
                        let result = self.check_access(client);
                        let accepted = result.is_ok();
                        let _ = reply.send(result);
                        if accepted {
                            return Wake::Reset;
                        }
                    }
                    None => return Wake::Cancelled,
                },
                () = sleep_until(deadline) => return Wake::Elapsed,
            }
        }
    }

    fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }

    fn log_stats(&self) {
        let stats = self.shared.stats.snapshot();
        info!(
            device = %self.settings.device,
            frames_sent = stats.frames_sent,
            frames_received = stats.frames_received,
            discarded = stats.discarded_total(),
            retransmissions = stats.retransmissions,
            rejects_sent = stats.rejects_sent,
            rejects_received = stats.rejects_received,
            connects = stats.connects,
            reconnects = stats.reconnects,
            link_failures = stats.link_failures,
            client_overflows = stats.client_overflows,
            attached = self.shared.attachments.lock().len(),
            "Link statistics"
        );
    }

    fn finish(&mut self) {
        if !self.shutdown_announced {
            self.shutdown_announced = true;
            let _ = self
                .shared
                .events
                .send(ControlPacket::Disconnected(DisconnectReason::Shutdown).into());
        }
        self.publish_status(PortStatus::default());
        self.shared.flow.wake_all();
        self.log_stats();
        self.release_lock();
        self.shared.stopped.cancel();
        info!(device = %self.settings.device, "Link task stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
