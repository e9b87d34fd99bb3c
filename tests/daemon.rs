//! End-to-end tests: TCP clients, the daemon and a peer on an in-memory line

mod common;

use bytes::{Bytes, BytesMut};
use common::{spawn_mute_peer, spawn_peer, Peer};
use futures::{SinkExt, StreamExt};
use hdlcd_core::core::access::{
    AccessMode, ClientAcceptor, ClientHandlerCollection, ClientSettings, OverflowPolicy, PacketCodec, SessionHeader,
    SessionKind,
};
use hdlcd_core::core::hdlc::packet::{ControlPacket, DataPacket, Direction, DisconnectReason};
use hdlcd_core::core::hdlc::{LinkProfile, Packet};
use hdlcd_core::core::serial::{LinkSettings, SerialPortHandlerCollection};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const DEVICE: &str = "/dev/ttyTEST";
const WAIT: Duration = Duration::from_secs(5);

type Client = Framed<TcpStream, PacketCodec>;

struct Daemon {
    addr: SocketAddr,
    links: Arc<SerialPortHandlerCollection>,
    sessions: Arc<ClientHandlerCollection>,
    accepting: CancellationToken,
    ports: mpsc::UnboundedReceiver<DuplexStream>,
    _dir: TempDir,
}

impl Daemon {
    async fn start(settings: LinkSettings) -> Self {
        Self::start_with(settings, ClientSettings::default()).await
    }

    async fn start_with(settings: LinkSettings, client: ClientSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (opened, ports) = mpsc::unbounded_channel();
        let opener = move |_device: &str, _baud: u32| -> io::Result<DuplexStream> {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            opened
                .send(theirs)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "test finished"))?;
            Ok(ours)
        };

        let links = Arc::new(SerialPortHandlerCollection::new(dir.path(), CancellationToken::new()));
        links.start(settings, opener).unwrap();

        let sessions = Arc::new(ClientHandlerCollection::new(CancellationToken::new()));
        let acceptor = ClientAcceptor::bind(
            "127.0.0.1:0",
            links.clone(),
            sessions.clone(),
            client,
        )
        .await
        .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let accepting = CancellationToken::new();
        tokio::spawn(acceptor.run(accepting.clone()));

        Self {
            addr,
            links,
            sessions,
            accepting,
            ports,
            _dir: dir,
        }
    }

    async fn connect(&self, header: SessionHeader) -> Client {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        Self::open(stream, header).await
    }

    /// Client with a tiny receive buffer, so an idle reader stalls the session quickly
    async fn connect_narrow(&self, header: SessionHeader) -> Client {
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let stream = socket.connect(self.addr).await.unwrap();
        Self::open(stream, header).await
    }

    async fn open(mut stream: TcpStream, header: SessionHeader) -> Client {
        let mut buf = BytesMut::new();
        header.encode(&mut buf).unwrap();
        stream.write_all(&buf).await.unwrap();
        Framed::new(stream, PacketCodec)
    }

    async fn wait_attached(&self, count: usize) {
        let link = self.links.get(DEVICE).unwrap();
        tokio::time::timeout(WAIT, async {
            while link.attached_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("clients did not attach");
    }

    async fn next_port(&mut self) -> DuplexStream {
        tokio::time::timeout(WAIT, self.ports.recv())
            .await
            .expect("device not opened")
            .unwrap()
    }

    async fn stop(self) {
        self.accepting.cancel();
        self.links.shutdown().await;
        self.sessions.shutdown(Duration::from_secs(2)).await;
    }
}

fn settings() -> LinkSettings {
    let mut settings = LinkSettings::new(DEVICE);
    settings.profile = LinkProfile::default().t1(Duration::from_secs(1));
    settings.recovery.initial_delay = Duration::from_secs(30);
    settings.stats_interval = None;
    settings
}

fn overflow_policy(policy: OverflowPolicy) -> ClientSettings {
    ClientSettings {
        overflow_policy: policy,
        ..ClientSettings::default()
    }
}

/// Feed the peer large payloads until some session falls behind the link
async fn flood_until_overflow(daemon: &Daemon, peer: &Peer) {
    let stats = daemon.links.get(DEVICE).unwrap().stats().clone();
    tokio::time::timeout(Duration::from_secs(20), async {
        while stats.snapshot().client_overflows == 0 {
            for _ in 0..16 {
                peer.outgoing.send(Bytes::from(vec![0x42; 4000])).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client never fell behind");
}

fn peer_profile() -> LinkProfile {
    LinkProfile::default().t1(Duration::from_millis(100))
}

async fn next_packet(client: &mut Client) -> Option<Packet> {
    tokio::time::timeout(WAIT, client.next())
        .await
        .expect("no packet from daemon")
        .map(|packet| packet.unwrap())
}

async fn wait_connected(client: &mut Client) {
    loop {
        match next_packet(client).await.expect("session closed") {
            Packet::Control(ControlPacket::Connected) => return,
            Packet::Control(ControlPacket::PortStatus(status)) if status.connected => return,
            _ => {}
        }
    }
}

async fn next_data(client: &mut Client) -> DataPacket {
    loop {
        if let Packet::Data(data) = next_packet(client).await.expect("session closed") {
            return data;
        }
    }
}

/// Read until the daemon closes the session
async fn wait_closed(client: &mut Client) {
    tokio::time::timeout(WAIT, async {
        while let Some(Ok(_)) = client.next().await {}
    })
    .await
    .expect("session not closed");
}

#[tokio::test]
async fn test_payload_fanned_out_to_every_client() {
    let mut daemon = Daemon::start(settings()).await;
    let peer = spawn_peer(daemon.next_port().await, peer_profile());
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(daemon.connect(SessionHeader::payload(DEVICE, AccessMode::ReadOnly)).await);
    }
    daemon.wait_attached(3).await;
    for client in &mut clients {
        wait_connected(client).await;
    }

    let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(vec![0x7E, i, 0x7D])).collect();
    for payload in &expected {
        peer.outgoing.send(payload.clone()).unwrap();
    }

    for client in &mut clients {
        let mut received = Vec::new();
        for _ in 0..expected.len() {
            let data = next_data(client).await;
            assert_eq!(data.direction, Direction::Received);
            assert!(data.reliable);
            received.push(data.payload);
        }
        assert_eq!(received, expected);
    }
    daemon.stop().await;
}

#[tokio::test]
async fn test_client_payload_reaches_peer() {
    let mut daemon = Daemon::start(settings()).await;
    let mut peer = spawn_peer(daemon.next_port().await, peer_profile());
    let mut client = daemon
        .connect(SessionHeader::payload(DEVICE, AccessMode::ReadWrite))
        .await;
    wait_connected(&mut client).await;

    client
        .send(Packet::Data(DataPacket {
            payload: Bytes::from_static(b"hello peer"),
            reliable: true,
            direction: Direction::Sent,
        }))
        .await
        .unwrap();

    let received = tokio::time::timeout(WAIT, peer.received.recv()).await.unwrap();
    assert_eq!(received, Some(Bytes::from_static(b"hello peer")));
    daemon.stop().await;
}

#[tokio::test]
async fn test_device_matched_by_basename() {
    let daemon = Daemon::start(settings()).await;
    let mut client = daemon
        .connect(SessionHeader::payload("ttyTEST", AccessMode::ReadOnly))
        .await;
    daemon.wait_attached(1).await;
    match next_packet(&mut client).await {
        Some(Packet::Control(ControlPacket::PortStatus(status))) => assert!(!status.connected),
        other => panic!("expected initial port status, got {other:?}"),
    }
    daemon.stop().await;
}

#[tokio::test]
async fn test_write_on_read_only_session_ends_it() {
    let daemon = Daemon::start(settings()).await;
    let mut client = daemon
        .connect(SessionHeader::payload(DEVICE, AccessMode::ReadOnly))
        .await;
    daemon.wait_attached(1).await;

    client
        .send(Packet::Data(DataPacket {
            payload: Bytes::from_static(b"not allowed"),
            reliable: true,
            direction: Direction::Sent,
        }))
        .await
        .unwrap();
    wait_closed(&mut client).await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_unknown_device_ends_session() {
    let daemon = Daemon::start(settings()).await;
    let mut client = daemon
        .connect(SessionHeader::payload("/dev/ttyNOPE", AccessMode::ReadOnly))
        .await;
    wait_closed(&mut client).await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_echo_answered() {
    let daemon = Daemon::start(settings()).await;
    let mut client = daemon.connect(SessionHeader::new(DEVICE, SessionKind::Control)).await;
    daemon.wait_attached(1).await;

    client.send(ControlPacket::Echo.into()).await.unwrap();
    loop {
        match next_packet(&mut client).await.expect("session closed") {
            Packet::Control(ControlPacket::Echo) => break,
            Packet::Control(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
    daemon.stop().await;
}

#[tokio::test]
async fn test_port_reset_reopens_device() {
    let mut daemon = Daemon::start(settings()).await;
    let mut client = daemon.connect(SessionHeader::new(DEVICE, SessionKind::Control)).await;
    daemon.wait_attached(1).await;
    let _first = daemon.next_port().await;

    client.send(ControlPacket::PortReset.into()).await.unwrap();
    let _second = daemon.next_port().await;
    daemon.stop().await;
}

#[tokio::test]
async fn test_link_failure_reported_once_per_client() {
    let mut settings = settings();
    settings.profile = LinkProfile::default().t1(Duration::from_millis(50)).n2(3);
    let mut daemon = Daemon::start(settings).await;
    let _peer = spawn_mute_peer(daemon.next_port().await);

    let mut writer = daemon
        .connect(SessionHeader::payload(DEVICE, AccessMode::ReadWrite))
        .await;
    let mut watcher = daemon.connect(SessionHeader::new(DEVICE, SessionKind::Control)).await;
    daemon.wait_attached(2).await;
    wait_connected(&mut writer).await;
    wait_connected(&mut watcher).await;

    writer
        .send(Packet::Data(DataPacket {
            payload: Bytes::from_static(b"never acknowledged"),
            reliable: true,
            direction: Direction::Sent,
        }))
        .await
        .unwrap();

    for client in [&mut writer, &mut watcher] {
        let mut disconnects = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while let Ok(Some(Ok(packet))) = tokio::time::timeout_at(deadline, client.next()).await {
            if let Packet::Control(ControlPacket::Disconnected(reason)) = packet {
                disconnects.push(reason);
            }
        }
        assert_eq!(disconnects, vec![DisconnectReason::LinkFailed]);
    }
    daemon.stop().await;
}

#[tokio::test]
async fn test_shutdown_reaches_every_client() {
    let mut daemon = Daemon::start(settings()).await;
    let _peer = spawn_peer(daemon.next_port().await, peer_profile());
    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(daemon.connect(SessionHeader::new(DEVICE, SessionKind::Control)).await);
    }
    daemon.wait_attached(2).await;
    for client in &mut clients {
        wait_connected(client).await;
    }

    daemon.stop().await;

    for client in &mut clients {
        let mut last = None;
        while let Some(packet) = next_packet(client).await {
            if let Packet::Control(ControlPacket::Disconnected(reason)) = packet {
                last = Some(reason);
            }
        }
        assert_eq!(last, Some(DisconnectReason::Shutdown));
    }
}

#[tokio::test]
async fn test_lagging_client_told_how_much_it_missed() {
    let mut link = settings();
    link.event_buffer = 4;
    let mut daemon = Daemon::start_with(link, overflow_policy(OverflowPolicy::DropAndNotify)).await;
    let peer = spawn_peer(daemon.next_port().await, peer_profile());
    let mut client = daemon
        .connect_narrow(SessionHeader::payload(DEVICE, AccessMode::ReadOnly))
        .await;
    daemon.wait_attached(1).await;
    wait_connected(&mut client).await;

    flood_until_overflow(&daemon, &peer).await;

    let dropped = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match client.next().await {
                Some(Ok(Packet::Control(ControlPacket::Overflow { dropped }))) => return dropped,
                Some(Ok(_)) => {}
                other => panic!("session ended before the overflow notice: {other:?}"),
            }
        }
    })
    .await
    .expect("no overflow notice");
    assert!(dropped > 0);
    assert_eq!(daemon.sessions.len(), 1);
    daemon.stop().await;
}

#[tokio::test]
async fn test_lagging_client_disconnected() {
    let mut link = settings();
    link.event_buffer = 4;
    let mut daemon = Daemon::start_with(link, overflow_policy(OverflowPolicy::Disconnect)).await;
    let peer = spawn_peer(daemon.next_port().await, peer_profile());
    let mut client = daemon
        .connect_narrow(SessionHeader::payload(DEVICE, AccessMode::ReadOnly))
        .await;
    daemon.wait_attached(1).await;
    wait_connected(&mut client).await;

    flood_until_overflow(&daemon, &peer).await;

    tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(Ok(packet)) = client.next().await {
            assert!(!matches!(packet, Packet::Control(ControlPacket::Overflow { .. })));
        }
    })
    .await
    .expect("session not closed");
    let link = daemon.links.get(DEVICE).unwrap();
    tokio::time::timeout(WAIT, async {
        while link.attached_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session still attached");
    daemon.stop().await;
}

#[tokio::test]
async fn test_reading_client_gets_every_payload_in_order() {
    let mut link = settings();
    link.event_buffer = 32;
    let mut daemon = Daemon::start_with(link, overflow_policy(OverflowPolicy::Disconnect)).await;
    let peer = spawn_peer(daemon.next_port().await, peer_profile());
    let mut client = daemon
        .connect(SessionHeader::payload(DEVICE, AccessMode::ReadOnly))
        .await;
    daemon.wait_attached(1).await;
    wait_connected(&mut client).await;

    let expected: Vec<Bytes> = (0u16..200).map(|i| Bytes::from(i.to_be_bytes().to_vec())).collect();
    for payload in &expected {
        peer.outgoing.send(payload.clone()).unwrap();
    }

    let mut received = Vec::with_capacity(expected.len());
    while received.len() < expected.len() {
        match next_packet(&mut client).await.expect("session closed") {
            Packet::Data(data) => received.push(data.payload),
            Packet::Control(ControlPacket::Overflow { dropped }) => panic!("{dropped} payloads dropped"),
            Packet::Control(_) => {}
        }
    }
    assert_eq!(received, expected);
    assert_eq!(daemon.links.get(DEVICE).unwrap().stats().snapshot().client_overflows, 0);
    daemon.stop().await;
}
