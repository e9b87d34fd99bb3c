//! Packets delivered above the link layer

use super::frame::Frame;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way a payload or frame travelled over the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the peer
    Received,
    /// Transmitted to the peer
    Sent,
}

/// Why a link went down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Local disconnect request
    Requested,
    /// Peer sent DISC
    PeerDisconnected,
    /// SABM retries exhausted
    ConnectFailed,
    /// Peer answered SABM with DM
    ConnectRefused,
    /// Retransmission retries exhausted
    LinkFailed,
    /// Peer stayed silent through a keepalive poll
    IdleTimeout,
    /// Peer re-established the link while it was up
    PeerReset,
    /// Peer sent DM or FRMR while connected
    ProtocolError,
    /// The serial device failed or went away
    DeviceError,
    /// A client asked for the port to be reset
    PortReset,
    /// Daemon shutting down
    Shutdown,
}

impl DisconnectReason {
    const ALL: [DisconnectReason; 11] = [
        Self::Requested,
        Self::PeerDisconnected,
        Self::ConnectFailed,
        Self::ConnectRefused,
        Self::LinkFailed,
        Self::IdleTimeout,
        Self::PeerReset,
        Self::ProtocolError,
        Self::DeviceError,
        Self::PortReset,
        Self::Shutdown,
    ];

    /// Wire code (low nibble of the disconnected control code)
    pub fn code(self) -> u8 {
        match self {
            Self::Requested => 0,
            Self::PeerDisconnected => 1,
            Self::ConnectFailed => 2,
            Self::ConnectRefused => 3,
            Self::LinkFailed => 4,
            Self::IdleTimeout => 5,
            Self::PeerReset => 6,
            Self::ProtocolError => 7,
            Self::DeviceError => 8,
            Self::PortReset => 9,
            Self::Shutdown => 10,
        }
    }

    /// Reason for a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|reason| reason.code() == code)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Requested => "disconnect requested",
            Self::PeerDisconnected => "peer disconnected",
            Self::ConnectFailed => "connect failed",
            Self::ConnectRefused => "connect refused",
            Self::LinkFailed => "link failed",
            Self::IdleTimeout => "idle timeout",
            Self::PeerReset => "peer reset",
            Self::ProtocolError => "protocol error",
            Self::DeviceError => "device error",
            Self::PortReset => "port reset",
            Self::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Port status flags shown to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortStatus {
    /// Peer has been heard from recently
    pub alive: bool,
    /// Link is in connected state
    pub connected: bool,
    /// Peer signalled receive-not-ready, or the send window is full
    pub flow_suspended: bool,
}

/// A payload crossing the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Payload octets
    pub payload: Bytes,
    /// Sequenced (I-frame) or not (UI-frame)
    pub reliable: bool,
    /// Received from or sent to the peer
    pub direction: Direction,
}

impl DataPacket {
    /// Reliable payload received from the peer
    pub fn received(payload: Bytes) -> Self {
        Self {
            payload,
            reliable: true,
            direction: Direction::Received,
        }
    }
}

/// Control messages
///
/// Link events originate in the daemon. `Echo`, `KeepAlive` and `PortReset`
/// are requests a client may send; `Echo` is answered in kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
    /// Link came up
    Connected,
    /// Link went down
    Disconnected(DisconnectReason),
    /// Current port status
    PortStatus(PortStatus),
    /// Packets lost because a client fell behind
    Overflow {
        /// Number of dropped packets
        dropped: u32,
    },
    /// Echo request / reply
    Echo,
    /// Session keepalive
    KeepAlive,
    /// Ask the daemon to close and reopen the serial device
    PortReset,
}

/// Unit delivered above the link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Payload
    Data(DataPacket),
    /// Control message
    Control(ControlPacket),
}

/// A valid frame seen on the line, for monitoring sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTrace {
    /// Sent or received
    pub direction: Direction,
    /// Decoded frame
    pub frame: Frame,
    /// Unescaped body including FCS
    pub raw: Bytes,
}

/// Everything a link hands to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Packet for payload and control sessions
    Packet(Packet),
    /// Frame trace, only produced while tracing is enabled
    Frame(FrameTrace),
}

impl From<Packet> for LinkEvent {
    fn from(packet: Packet) -> Self {
        Self::Packet(packet)
    }
}

impl From<ControlPacket> for Packet {
    fn from(control: ControlPacket) -> Self {
        Self::Control(control)
    }
}

impl From<ControlPacket> for LinkEvent {
    fn from(control: ControlPacket) -> Self {
        Self::Packet(Packet::Control(control))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_unique() {
        for reason in DisconnectReason::ALL {
            assert_eq!(DisconnectReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(DisconnectReason::from_code(0x0F), None);
    }
}
