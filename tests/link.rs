//! Link behaviour between two endpoints over in-memory lines

mod common;

use bytes::Bytes;
use common::{endpoint, fast_profile, lossy_line, spawn_mute_peer};
use hdlcd_core::core::hdlc::packet::{ControlPacket, Direction, DisconnectReason};
use hdlcd_core::core::hdlc::{Control, LinkEvent, Packet, PacketEndpoint, SubmitError};
use std::time::Duration;
use tokio::io::DuplexStream;

async fn wait_connected(endpoint: &mut PacketEndpoint<DuplexStream>) {
    loop {
        if let LinkEvent::Packet(Packet::Control(ControlPacket::Connected)) = endpoint.next_event().await.unwrap() {
            return;
        }
    }
}

fn payloads(count: usize) -> Vec<Bytes> {
    (0..count).map(|i| Bytes::from(format!("payload {i}"))).collect()
}

#[tokio::test]
async fn test_lost_frame_recovered_in_order() {
    let mut dropped = false;
    let (a, b) = lossy_line(move |frame| {
        if !dropped && matches!(frame.control, Control::Information { ns: 2, .. }) {
            dropped = true;
            return true;
        }
        false
    });
    let (mut left, left_stats) = endpoint(a, fast_profile());
    let (mut right, right_stats) = endpoint(b, fast_profile());
    let expected = payloads(6);

    let count = expected.len();
    let receiver = tokio::spawn(async move {
        let mut received = Vec::new();
        while received.len() < count {
            if let LinkEvent::Packet(Packet::Data(data)) = right.next_event().await.unwrap() {
                if data.direction == Direction::Received {
                    received.push(data.payload);
                }
            }
        }
        received
    });

    left.connect();
    wait_connected(&mut left).await;
    for payload in &expected {
        left.submit(payload.clone(), true).unwrap();
    }

    let drive = async {
        while left.next_event().await.is_ok() {}
        std::future::pending::<()>().await;
    };
    let received = tokio::select! {
        received = receiver => received.unwrap(),
        () = drive => unreachable!(),
    };

    assert_eq!(received, expected);
    assert!(right_stats.snapshot().rejects_sent >= 1);
    assert!(left_stats.snapshot().retransmissions >= 1);
}

#[tokio::test]
async fn test_window_full_refuses_submission() {
    let (a, b) = tokio::io::duplex(16 * 1024);
    let _peer = spawn_mute_peer(b);
    let (mut left, _stats) = endpoint(a, fast_profile().t1(Duration::from_secs(5)));

    left.connect();
    wait_connected(&mut left).await;
    for payload in payloads(7) {
        left.submit(payload, true).unwrap();
    }
    assert_eq!(
        left.submit(Bytes::from_static(b"eighth"), true),
        Err(SubmitError::Busy)
    );
}

#[tokio::test]
async fn test_retry_exhaustion_reported_once() {
    let (a, b) = tokio::io::duplex(16 * 1024);
    let _peer = spawn_mute_peer(b);
    let (mut left, stats) = endpoint(a, fast_profile());

    left.connect();
    wait_connected(&mut left).await;
    left.submit(Bytes::from_static(b"unanswered"), true).unwrap();

    let mut disconnects = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while let Ok(event) = tokio::time::timeout_at(deadline, left.next_event()).await {
        if let LinkEvent::Packet(Packet::Control(ControlPacket::Disconnected(reason))) = event.unwrap() {
            disconnects.push(reason);
        }
    }

    assert_eq!(disconnects, vec![DisconnectReason::LinkFailed]);
    assert_eq!(stats.snapshot().link_failures, 1);
    assert_eq!(
        left.submit(Bytes::from_static(b"late"), true),
        Err(SubmitError::NotConnected)
    );
}
